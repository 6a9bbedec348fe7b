// Cataloguing boundary: on success the orchestrator reports the finished
// artifact to an external persistence collaborator. Storage format is the
// collaborator's business; recording failures never fail a completed
// download.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

/// What gets reported about one completed download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub file_name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub mime_type: String,
    pub folder: PathBuf,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DownloadCatalog: Send + Sync {
    async fn record(
        &self,
        entry: &CatalogEntry,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Default collaborator: records nothing.
pub struct NullCatalog;

#[async_trait]
impl DownloadCatalog for NullCatalog {
    async fn record(
        &self,
        _entry: &CatalogEntry,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}
