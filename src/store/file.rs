use super::RecordStore;
use crate::embedding::EnrolledEmbedding;
use crate::error::StoreError;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// All records in one postcard-encoded file.
pub struct FileStore {
    path: PathBuf,
    // serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<EnrolledEmbedding>, StoreError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(StoreError::ReadFailed(format!(
                    "reading {}: {e}",
                    self.path.display()
                )))
            }
        };
        postcard::from_bytes(&data).map_err(|e| {
            StoreError::ReadFailed(format!("decoding {}: {e}", self.path.display()))
        })
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn list(&self) -> Result<Vec<EnrolledEmbedding>, StoreError> {
        self.load().await
    }

    async fn insert(&self, record: EnrolledEmbedding) -> Result<EnrolledEmbedding, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load().await?;
        records.push(record.clone());

        let write_err =
            |e: String| StoreError::WriteFailed(format!("{}: {e}", self.path.display()));
        let data = postcard::to_allocvec(&records).map_err(|e| write_err(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| write_err(e.to_string()))?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| write_err(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| write_err(e.to_string()))?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, v: &[f32]) -> EnrolledEmbedding {
        EnrolledEmbedding {
            user_id: id.to_string(),
            vector: v.to_vec(),
        }
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path().join("faces.bin"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("faces.bin");
        let store = FileStore::new(&path);
        store.insert(record("u1", &[0.6, 0.8])).await.unwrap();
        store.insert(record("u2", &[1.0, 0.0])).await.unwrap();

        let reopened = FileStore::new(&path);
        let records = reopened.list().await.unwrap();
        assert_eq!(records, vec![record("u1", &[0.6, 0.8]), record("u2", &[1.0, 0.0])]);
    }

    #[tokio::test]
    async fn corrupt_file_is_a_read_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("faces.bin");
        std::fs::write(&path, [0xff, 0xff, 0xff, 0xff, 0xff]).unwrap();
        let store = FileStore::new(&path);
        assert!(matches!(store.list().await, Err(StoreError::ReadFailed(_))));
        assert!(matches!(
            store.insert(record("u", &[1.0])).await,
            Err(StoreError::ReadFailed(_))
        ));
    }
}
