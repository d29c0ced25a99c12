use crate::artifacts::ArtifactDir;
use crate::embedding::EnrolledEmbedding;
use crate::error::Result;
use crate::extractor::{extract_normalized, FaceEncoder};
use crate::store::RecordStore;
use log::info;
use std::sync::Arc;

/// Registers new identities. Every call mints a fresh user id; the same face
/// enrolled twice becomes two independent records.
pub struct Enroller {
    encoder: Arc<dyn FaceEncoder>,
    store: Arc<dyn RecordStore>,
    artifacts: ArtifactDir,
}

impl Enroller {
    pub fn new(
        encoder: Arc<dyn FaceEncoder>,
        store: Arc<dyn RecordStore>,
        artifacts: ArtifactDir,
    ) -> Self {
        Self {
            encoder,
            store,
            artifacts,
        }
    }

    pub async fn enroll(&self, image: &[u8]) -> Result<EnrolledEmbedding> {
        let embedding = extract_normalized(self.encoder.as_ref(), image).await?;
        let user_id = uuid::Uuid::new_v4().to_string();
        let record = self
            .store
            .insert(EnrolledEmbedding::new(user_id, &embedding))
            .await?;
        info!("enrolled user {} ({}-d embedding)", record.user_id, embedding.len());
        Ok(record)
    }

    pub async fn enroll_artifact(&self, image_id: &str) -> Result<EnrolledEmbedding> {
        let image = self.artifacts.read(image_id)?;
        self.enroll(&image).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, StoreError};
    use crate::matcher::Matcher;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct ByteEncoder;

    #[async_trait]
    impl FaceEncoder for ByteEncoder {
        async fn extract(&self, image: &[u8]) -> Result<Vec<f32>> {
            if image.is_empty() {
                return Err(Error::NoFaceDetected);
            }
            Ok(image.iter().map(|&b| b as f32).collect())
        }
    }

    /// Accepts the request but reports nothing inserted.
    struct SilentStore;

    #[async_trait]
    impl RecordStore for SilentStore {
        async fn list(&self) -> std::result::Result<Vec<EnrolledEmbedding>, StoreError> {
            Ok(vec![])
        }
        async fn insert(
            &self,
            _: EnrolledEmbedding,
        ) -> std::result::Result<EnrolledEmbedding, StoreError> {
            Err(StoreError::WriteFailed("no rows inserted".into()))
        }
    }

    fn setup(store: Arc<dyn RecordStore>) -> (tempfile::TempDir, Enroller, Matcher) {
        let tmp = tempfile::tempdir().unwrap();
        let artifacts = ArtifactDir::new(tmp.path());
        let encoder: Arc<dyn FaceEncoder> = Arc::new(ByteEncoder);
        let enroller = Enroller::new(encoder.clone(), store.clone(), artifacts.clone());
        let matcher = Matcher::new(encoder, store, artifacts, 0.6);
        (tmp, enroller, matcher)
    }

    #[tokio::test]
    async fn stores_unit_vector_under_fresh_id() {
        let store = Arc::new(MemoryStore::default());
        let (_tmp, enroller, _) = setup(store.clone());
        let a = enroller.enroll(&[3, 4]).await.unwrap();
        let b = enroller.enroll(&[3, 4]).await.unwrap();
        assert_ne!(a.user_id, b.user_id);
        assert!(uuid::Uuid::parse_str(&a.user_id).is_ok());
        let norm: f32 = a.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn enroll_then_match_is_self_similar() {
        let (_tmp, enroller, matcher) = setup(Arc::new(MemoryStore::default()));
        enroller.enroll(&[9, 200, 31, 7]).await.unwrap();
        let other = enroller.enroll(&[200, 1, 1, 90]).await.unwrap();

        let r = matcher.match_image(&[200, 1, 1, 90]).await.unwrap();
        assert!(r.accepted);
        assert_eq!(r.best_user_id, Some(other.user_id));
        assert!((r.score - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn failures_propagate() {
        let (_tmp, enroller, _) = setup(Arc::new(SilentStore));
        assert!(matches!(
            enroller.enroll(&[1, 2]).await,
            Err(Error::Store(StoreError::WriteFailed(_)))
        ));
        assert!(matches!(enroller.enroll(&[]).await, Err(Error::NoFaceDetected)));
        assert!(matches!(
            enroller.enroll_artifact("missing").await,
            Err(Error::ArtifactMissing(_))
        ));
    }

    #[tokio::test]
    async fn enrolls_received_artifact() {
        let store = Arc::new(MemoryStore::default());
        let (tmp, enroller, _) = setup(store.clone());
        ArtifactDir::new(tmp.path()).write("cam-7", &[1, 2, 3]).unwrap();
        let rec = enroller.enroll_artifact("cam-7").await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec![rec]);
    }
}
