//! Managed resources (platform pages) and the configuration snapshot built
//! from them.
//!
//! A [`ConfigSnapshot`] is immutable once built. Reloads construct a new
//! snapshot and publish it through a [`SnapshotHandle`], so concurrent
//! readers always observe one complete snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::wire_ids::string_or_number;

/// Shared, atomically replaceable handle to the current snapshot.
pub type SnapshotHandle = Arc<ArcSwap<ConfigSnapshot>>;

/// Tag entry as returned by the resource catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTagDescriptor {
    #[serde(alias = "name")]
    pub tag_name: String,
    #[serde(alias = "id", deserialize_with = "string_or_number")]
    pub tag_id: String,
}

/// Resource record as returned by the resource catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    #[serde(alias = "page_id", deserialize_with = "string_or_number")]
    pub resource_id: String,
    #[serde(alias = "page_name")]
    pub display_name: String,
    #[serde(alias = "page_access_token", default)]
    pub access_token: String,
    #[serde(default)]
    pub tags: Vec<ResourceTagDescriptor>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTag {
    pub name: String,
    pub id: String,
}

/// One managed resource inside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedResource {
    pub id: String,
    pub display_name: String,
    pub access_token: String,
    pub tags: Vec<ResourceTag>,
}

impl ManagedResource {
    /// Resolves a tag id by case-insensitive tag name.
    pub fn find_tag_id(&self, tag_name: &str) -> Option<&str> {
        let wanted = tag_name.trim().to_lowercase();
        if wanted.is_empty() {
            return None;
        }
        self.tags
            .iter()
            .find(|tag| tag.name.to_lowercase() == wanted)
            .map(|tag| tag.id.as_str())
    }

    pub fn has_access_token(&self) -> bool {
        !self.access_token.trim().is_empty()
    }
}

impl From<ResourceDescriptor> for ManagedResource {
    fn from(descriptor: ResourceDescriptor) -> Self {
        Self {
            id: descriptor.resource_id.trim().to_string(),
            display_name: descriptor.display_name.trim().to_string(),
            access_token: descriptor.access_token.trim().to_string(),
            tags: descriptor
                .tags
                .into_iter()
                .map(|tag| ResourceTag {
                    name: tag.tag_name.trim().to_string(),
                    id: tag.tag_id.trim().to_string(),
                })
                .collect(),
        }
    }
}

/// Immutable mapping of resource id to managed resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSnapshot {
    resources: BTreeMap<String, ManagedResource>,
}

impl ConfigSnapshot {
    /// Builds a snapshot from catalog descriptors. Inactive entries and
    /// entries with a blank id are ignored; a later duplicate id replaces an
    /// earlier one.
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ResourceDescriptor>) -> Self {
        let resources = descriptors
            .into_iter()
            .filter(|descriptor| descriptor.is_active)
            .map(ManagedResource::from)
            .filter(|resource| !resource.id.is_empty())
            .map(|resource| (resource.id.clone(), resource))
            .collect();
        Self { resources }
    }

    pub fn empty_handle() -> SnapshotHandle {
        Arc::new(ArcSwap::from_pointee(Self::default()))
    }

    pub fn get(&self, resource_id: &str) -> Option<&ManagedResource> {
        self.resources.get(resource_id)
    }

    pub fn resource_ids(&self) -> Vec<String> {
        self.resources.keys().cloned().collect()
    }

    pub fn resources(&self) -> impl Iterator<Item = &ManagedResource> {
        self.resources.values()
    }

    /// True when `sender_name` carries the display name of any managed
    /// resource, i.e. the update is the system's own outbound echo.
    pub fn is_resource_sender(&self, sender_name: &str) -> bool {
        let sender = sender_name.to_lowercase();
        self.resources.values().any(|resource| {
            let name = resource.display_name.to_lowercase();
            !name.is_empty() && sender.contains(name.as_str())
        })
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
