use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

/// Unit-length face embedding.
///
/// The only public way to build one is [`Embedding::normalized`], so any
/// value of this type can be compared by plain dot product.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    vector: Array1<f32>,
}

/// One enrolled identity as it lives in the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledEmbedding {
    pub user_id: String,
    pub vector: Vec<f32>,
}

impl Embedding {
    /// L2-normalize a raw extractor output. Returns `None` for an empty or
    /// zero-norm vector, which cannot be scored.
    pub fn normalized(raw: Vec<f32>) -> Option<Self> {
        let vector = Array1::from(raw);
        let norm = vector.dot(&vector).sqrt();
        if vector.is_empty() || !norm.is_finite() || norm <= 0.0 {
            return None;
        }
        Some(Self {
            vector: vector / norm,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_unit(raw: Vec<f32>) -> Self {
        Self {
            vector: Array1::from(raw),
        }
    }

    pub fn len(&self) -> usize {
        self.vector.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vector.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        self.vector.as_slice().unwrap_or(&[])
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.vector.to_vec()
    }

    /// Cosine similarity against a stored vector, which is pre-normalized at
    /// write time. `None` when the dimensions differ.
    pub fn cosine(&self, stored: &[f32]) -> Option<f32> {
        if stored.len() != self.vector.len() {
            return None;
        }
        let dot = self.vector.dot(&ArrayView1::from(stored));
        Some(dot.clamp(-1.0, 1.0))
    }
}

impl EnrolledEmbedding {
    pub fn new(user_id: impl Into<String>, embedding: &Embedding) -> Self {
        Self {
            user_id: user_id.into(),
            vector: embedding.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_to_unit_length() {
        let emb = Embedding::normalized(vec![3.0, 4.0]).unwrap();
        let norm: f32 = emb.as_slice().iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((emb.as_slice()[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn rejects_degenerate_vectors() {
        assert!(Embedding::normalized(vec![]).is_none());
        assert!(Embedding::normalized(vec![0.0, 0.0, 0.0]).is_none());
        assert!(Embedding::normalized(vec![f32::NAN, 1.0]).is_none());
    }

    #[test]
    fn cosine_of_self_is_one() {
        let emb = Embedding::normalized(vec![0.2, -0.5, 0.9, 0.1]).unwrap();
        let score = emb.cosine(&emb.to_vec()).unwrap();
        assert!((score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn cosine_skips_dimension_mismatch() {
        let emb = Embedding::normalized(vec![1.0, 0.0]).unwrap();
        assert_eq!(emb.cosine(&[1.0, 0.0, 0.0]), None);
    }

    #[test]
    fn opposite_vectors_score_minus_one() {
        let emb = Embedding::normalized(vec![1.0, 0.0]).unwrap();
        assert_eq!(emb.cosine(&[-1.0, 0.0]), Some(-1.0));
    }
}
