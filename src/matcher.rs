use crate::artifacts::ArtifactDir;
use crate::embedding::{Embedding, EnrolledEmbedding};
use crate::error::Result;
use crate::extractor::{extract_normalized, FaceEncoder};
use crate::store::RecordStore;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub best_user_id: Option<String>,
    pub score: f32,
    pub accepted: bool,
}

/// Linear scan for the closest enrolled vector. Ties keep the first record
/// in store order. An empty set scores 0.0.
pub fn best_match(records: &[EnrolledEmbedding], probe: &Embedding, threshold: f32) -> MatchResult {
    let best = records
        .iter()
        .filter_map(|r| match probe.cosine(&r.vector) {
            Some(score) if score.is_finite() => Some((r.user_id.as_str(), score)),
            Some(score) => {
                warn!("skipping {}: non-finite score {score}", r.user_id);
                None
            }
            None => {
                warn!(
                    "skipping {}: dimension {} != probe dimension {}",
                    r.user_id,
                    r.vector.len(),
                    probe.len()
                );
                None
            }
        })
        .fold(None, |acc: Option<(&str, f32)>, (id, s)| match acc {
            Some((_, best)) if best >= s => acc,
            _ => Some((id, s)),
        });

    match best {
        Some((id, score)) if accepts(score, threshold) => MatchResult {
            best_user_id: Some(id.to_string()),
            score,
            accepted: true,
        },
        Some((_, score)) => MatchResult {
            best_user_id: None,
            score,
            accepted: false,
        },
        None => MatchResult {
            best_user_id: None,
            score: 0.0,
            accepted: false,
        },
    }
}

pub fn accepts(score: f32, threshold: f32) -> bool {
    score >= threshold
}

pub struct Matcher {
    encoder: Arc<dyn FaceEncoder>,
    store: Arc<dyn RecordStore>,
    artifacts: ArtifactDir,
    threshold: f32,
}

impl Matcher {
    pub fn new(
        encoder: Arc<dyn FaceEncoder>,
        store: Arc<dyn RecordStore>,
        artifacts: ArtifactDir,
        threshold: f32,
    ) -> Self {
        Self {
            encoder,
            store,
            artifacts,
            threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub async fn match_image(&self, image: &[u8]) -> Result<MatchResult> {
        let probe = extract_normalized(self.encoder.as_ref(), image).await?;
        let records = self.store.list().await?;
        debug!("matching against {} enrolled face(s)", records.len());

        let result = best_match(&records, &probe, self.threshold);
        info!(
            "match score {:.3} (threshold {:.3}) -> {}",
            result.score,
            self.threshold,
            result.best_user_id.as_deref().unwrap_or("no match")
        );
        Ok(result)
    }

    /// Match a reassembled artifact by its image id.
    pub async fn match_artifact(&self, image_id: &str) -> Result<MatchResult> {
        let image = self.artifacts.read(image_id)?;
        self.match_image(&image).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, StoreError};
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    fn rec(id: &str, v: &[f32]) -> EnrolledEmbedding {
        EnrolledEmbedding {
            user_id: id.to_string(),
            vector: v.to_vec(),
        }
    }

    /// Bytes are interpreted as the raw vector, one component per byte.
    struct ByteEncoder;

    #[async_trait]
    impl FaceEncoder for ByteEncoder {
        async fn extract(&self, image: &[u8]) -> Result<Vec<f32>> {
            match image {
                [] => Err(Error::InvalidImage),
                [0] => Err(Error::NoFaceDetected),
                bytes => Ok(bytes.iter().map(|&b| b as f32).collect()),
            }
        }
    }

    struct Unreachable;

    #[async_trait]
    impl RecordStore for Unreachable {
        async fn list(&self) -> std::result::Result<Vec<EnrolledEmbedding>, StoreError> {
            Err(StoreError::ReadFailed("connection refused".into()))
        }
        async fn insert(
            &self,
            _: EnrolledEmbedding,
        ) -> std::result::Result<EnrolledEmbedding, StoreError> {
            Err(StoreError::WriteFailed("connection refused".into()))
        }
    }

    fn matcher(store: Arc<dyn RecordStore>) -> (tempfile::TempDir, Matcher) {
        let tmp = tempfile::tempdir().unwrap();
        let m = Matcher::new(Arc::new(ByteEncoder), store, ArtifactDir::new(tmp.path()), 0.6);
        (tmp, m)
    }

    #[test]
    fn empty_set_scores_zero() {
        let probe = Embedding::from_unit(vec![1.0, 0.0]);
        let r = best_match(&[], &probe, 0.6);
        assert_eq!(
            r,
            MatchResult {
                best_user_id: None,
                score: 0.0,
                accepted: false
            }
        );
    }

    #[test]
    fn corrupt_record_cannot_hide_a_match() {
        let probe = Embedding::from_unit(vec![1.0, 0.0]);
        let records = [
            rec("good", &[1.0, 0.0]),
            rec("nan", &[f32::NAN, 0.0]),
            rec("inf", &[f32::INFINITY, f32::NEG_INFINITY]),
        ];
        let r = best_match(&records, &probe, 0.6);
        assert_eq!(r.best_user_id.as_deref(), Some("good"));
        assert_eq!(r.score, 1.0);

        let only_corrupt = best_match(&records[1..2], &probe, 0.6);
        assert_eq!(only_corrupt.score, 0.0);
        assert!(!only_corrupt.accepted);
    }

    #[test]
    fn threshold_is_inclusive() {
        // cos = 0.6 exactly
        let probe = Embedding::from_unit(vec![0.6, 0.8]);
        let r = best_match(&[rec("u", &[1.0, 0.0])], &probe, 0.6);
        assert_eq!(r.score, 0.6);
        assert!(r.accepted);
        assert_eq!(r.best_user_id.as_deref(), Some("u"));

        assert!(accepts(0.6, 0.6));
        assert!(!accepts(0.599_999, 0.6));

        let probe = Embedding::from_unit(vec![0.599_999, 0.8]);
        let r = best_match(&[rec("u", &[1.0, 0.0])], &probe, 0.6);
        assert!(!r.accepted);
        assert_eq!(r.best_user_id, None);
        assert!((r.score - 0.599_999).abs() < 1e-7);
    }

    #[test]
    fn picks_highest_and_first_on_tie() {
        let probe = Embedding::from_unit(vec![1.0, 0.0]);
        let records = [
            rec("low", &[0.0, 1.0]),
            rec("first", &[0.8, 0.6]),
            rec("second", &[0.8, -0.6]),
            rec("wrong-dim", &[1.0, 0.0, 0.0]),
        ];
        let r = best_match(&records, &probe, 0.6);
        assert_eq!(r.best_user_id.as_deref(), Some("first"));
        assert!((r.score - 0.8).abs() < 1e-6);
    }

    #[test]
    fn negative_best_is_reported() {
        let probe = Embedding::from_unit(vec![1.0, 0.0]);
        let r = best_match(&[rec("opposite", &[-1.0, 0.0])], &probe, 0.6);
        assert_eq!(r.score, -1.0);
        assert!(!r.accepted);
    }

    #[tokio::test]
    async fn match_is_idempotent() {
        let store = Arc::new(MemoryStore::with_records(vec![
            rec("a", &[0.6, 0.8]),
            rec("b", &[0.8, 0.6]),
        ]));
        let (_tmp, m) = matcher(store);
        let first = m.match_image(&[3, 4]).await.unwrap();
        for _ in 0..5 {
            assert_eq!(m.match_image(&[3, 4]).await.unwrap(), first);
        }
        assert_eq!(first.best_user_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn sees_store_changes_immediately() {
        let store = Arc::new(MemoryStore::default());
        let (_tmp, m) = matcher(store.clone());
        assert!(!m.match_image(&[1, 1]).await.unwrap().accepted);
        store.insert(rec("new", &[0.70710677, 0.70710677])).await.unwrap();
        assert!(m.match_image(&[1, 1]).await.unwrap().accepted);
    }

    #[tokio::test]
    async fn propagates_extraction_and_store_errors() {
        let (_tmp, m) = matcher(Arc::new(MemoryStore::default()));
        assert!(matches!(m.match_image(&[]).await, Err(Error::InvalidImage)));
        assert!(matches!(m.match_image(&[0]).await, Err(Error::NoFaceDetected)));

        let (_tmp, m) = matcher(Arc::new(Unreachable));
        assert!(matches!(
            m.match_image(&[1]).await,
            Err(Error::Store(StoreError::ReadFailed(_)))
        ));
    }

    #[tokio::test]
    async fn missing_artifact() {
        let (_tmp, m) = matcher(Arc::new(MemoryStore::default()));
        assert!(matches!(
            m.match_artifact("ghost").await,
            Err(Error::ArtifactMissing(_))
        ));
    }
}
