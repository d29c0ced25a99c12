//! Enrolled-identity record stores.
//!
//! Matching reads the whole set on every request, nothing is cached here.

mod file;
mod rest;

pub use file::FileStore;
pub use rest::RestStore;

use crate::config::StoreConfig;
use crate::embedding::EnrolledEmbedding;
use crate::error::StoreError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every enrolled record, in the backend's natural order.
    async fn list(&self) -> Result<Vec<EnrolledEmbedding>, StoreError>;

    /// Persist one record, returning it as stored. A backend that reports
    /// success but no inserted row yields [`StoreError::WriteFailed`].
    async fn insert(&self, record: EnrolledEmbedding) -> Result<EnrolledEmbedding, StoreError>;
}

pub fn from_config(cfg: &StoreConfig) -> anyhow::Result<Arc<dyn RecordStore>> {
    Ok(match cfg {
        StoreConfig::File { path } => Arc::new(FileStore::new(path.clone())),
        StoreConfig::Rest { url, key, table } => {
            Arc::new(RestStore::new(url.clone(), key.clone(), table.clone())?)
        }
        StoreConfig::Memory => Arc::new(MemoryStore::default()),
    })
}

/// Process-local store; contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<Vec<EnrolledEmbedding>>,
}

impl MemoryStore {
    pub fn with_records(records: Vec<EnrolledEmbedding>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn list(&self) -> Result<Vec<EnrolledEmbedding>, StoreError> {
        Ok(self.records.read().await.clone())
    }

    async fn insert(&self, record: EnrolledEmbedding) -> Result<EnrolledEmbedding, StoreError> {
        self.records.write().await.push(record.clone());
        Ok(record)
    }
}
