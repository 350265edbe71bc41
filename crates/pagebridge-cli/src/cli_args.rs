use std::path::PathBuf;

use clap::Parser;
use pagebridge_runtime::update_router::{DEFAULT_AI_TAG_NAME, DEFAULT_SUPPORT_TAG_NAME};
use pagebridge_runtime::DEFAULT_PLATFORM_API_BASE;
use pagebridge_socket::DEFAULT_SOCKET_ENDPOINT;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_non_empty(value: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("value must not be empty".to_string());
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Parser)]
#[command(
    name = "pagebridge",
    about = "Bridges messaging-platform conversation updates to a downstream answer service",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long = "access-token",
        env = "PANCAKE_ACCESS_TOKEN",
        value_parser = parse_non_empty,
        hide_env_values = true,
        help = "User access token sent in every channel join"
    )]
    pub(crate) access_token: String,

    #[arg(
        long = "user-id",
        env = "PANCAKE_USER_ID",
        value_parser = parse_non_empty,
        help = "Platform user id; selects the users:{id} channel"
    )]
    pub(crate) user_id: String,

    #[arg(
        long = "socket-url",
        env = "PAGEBRIDGE_SOCKET_URL",
        default_value = DEFAULT_SOCKET_ENDPOINT,
        help = "Websocket endpoint of the platform socket"
    )]
    pub(crate) socket_url: String,

    #[arg(
        long = "resources-file",
        env = "PAGEBRIDGE_RESOURCES_FILE",
        default_value = "pages.json",
        help = "JSON file listing managed pages; re-read on every reload (send SIGHUP to reload)"
    )]
    pub(crate) resources_file: PathBuf,

    #[arg(
        long = "platform-api-base",
        env = "PAGEBRIDGE_PLATFORM_API_BASE",
        default_value = DEFAULT_PLATFORM_API_BASE,
        help = "Base URL of the platform public API used for conversation tagging"
    )]
    pub(crate) platform_api_base: String,

    #[arg(
        long = "notify-url",
        env = "PAGEBRIDGE_NOTIFY_URL",
        help = "Support webhook for escalations; escalations are only logged when unset"
    )]
    pub(crate) notify_url: Option<String>,

    #[arg(
        long = "notify-token",
        env = "PAGEBRIDGE_NOTIFY_TOKEN",
        default_value = "",
        hide_env_values = true,
        help = "Bearer token for the support webhook"
    )]
    pub(crate) notify_token: String,

    #[arg(
        long = "dispatch-url",
        env = "PAGEBRIDGE_DISPATCH_URL",
        help = "Answer-generation endpoint receiving debounced conversations; logged when unset"
    )]
    pub(crate) dispatch_url: Option<String>,

    #[arg(
        long = "ai-tag-name",
        env = "PAGEBRIDGE_AI_TAG_NAME",
        default_value = DEFAULT_AI_TAG_NAME,
        value_parser = parse_non_empty,
        help = "Tag applied to conversations handled automatically"
    )]
    pub(crate) ai_tag_name: String,

    #[arg(
        long = "support-tag-name",
        env = "PAGEBRIDGE_SUPPORT_TAG_NAME",
        default_value = DEFAULT_SUPPORT_TAG_NAME,
        value_parser = parse_non_empty,
        help = "Tag marking conversations owned by human support"
    )]
    pub(crate) support_tag_name: String,

    #[arg(
        long = "request-timeout-ms",
        env = "PAGEBRIDGE_REQUEST_TIMEOUT_MS",
        default_value_t = 15_000,
        value_parser = parse_positive_u64,
        help = "Timeout for outbound HTTP requests"
    )]
    pub(crate) request_timeout_ms: u64,

    #[arg(
        long = "reconnect-delay-ms",
        env = "PAGEBRIDGE_RECONNECT_DELAY_MS",
        default_value_t = 5_000,
        value_parser = parse_positive_u64,
        help = "Delay before reconnecting a dropped socket session"
    )]
    pub(crate) reconnect_delay_ms: u64,
}
