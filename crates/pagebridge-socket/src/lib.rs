//! Persistent multiplexed websocket session to the messaging platform.
//!
//! One [`SocketClient`] owns one logical connection, joins the user channel
//! plus one channel per managed resource, decodes `[ref, ref, channel, event,
//! payload]` frames and fans them out to registered [`FrameHandler`]s. The
//! client reconnects on every failure until [`SocketClient::stop`] is called.

mod frame;
mod socket_client;

pub use frame::{
    decode_frame, encode_frame, parse_ws_message, FrameDecodeError, InboundFrame, PlatformEvent,
};
pub use socket_client::{
    resource_channel, user_channel, FrameHandler, SocketClient, SocketConfig, SocketError,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_JOIN_EVENT, DEFAULT_KEEPALIVE_INTERVAL,
    DEFAULT_KEEPALIVE_TIMEOUT, DEFAULT_RECONNECT_DELAY, DEFAULT_SOCKET_ENDPOINT,
};
