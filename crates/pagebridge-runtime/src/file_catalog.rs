//! JSON-file resource catalog. The file is re-read on every call so edits
//! are picked up by the next reload.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use pagebridge_core::ResourceDescriptor;
use serde::Deserialize;

use crate::collaborators::ResourceCatalog;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CatalogFile {
    List(Vec<ResourceDescriptor>),
    Wrapped { pages: Vec<ResourceDescriptor> },
}

#[derive(Debug, Clone)]
pub struct FileResourceCatalog {
    path: PathBuf,
}

impl FileResourceCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn parse_catalog(raw: &str) -> Result<Vec<ResourceDescriptor>> {
    let parsed = serde_json::from_str::<CatalogFile>(raw).context("invalid resource catalog")?;
    let descriptors = match parsed {
        CatalogFile::List(descriptors) => descriptors,
        CatalogFile::Wrapped { pages } => pages,
    };
    Ok(descriptors
        .into_iter()
        .filter(|descriptor| descriptor.is_active)
        .collect())
}

#[async_trait]
impl ResourceCatalog for FileResourceCatalog {
    async fn list_active_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        parse_catalog(&raw).with_context(|| format!("failed to parse {}", self.path.display()))
    }
}
