use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid image")]
    InvalidImage,

    #[error("No face detected")]
    NoFaceDetected,

    #[error("Image not found: {0}")]
    ArtifactMissing(String),

    #[error("malformed chunk: {0}")]
    MalformedChunk(String),

    #[error("invalid image id {0:?}")]
    InvalidImageId(String),

    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("face extractor failed: {0}")]
    Extractor(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures reported by a [`RecordStore`](crate::store::RecordStore).
///
/// Every backend maps its own transport and response shapes onto these two
/// variants.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store read failed: {0}")]
    ReadFailed(String),

    #[error("record store write failed: {0}")]
    WriteFailed(String),
}
