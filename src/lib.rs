pub mod api;
pub mod artifacts;
pub mod assembly;
pub mod config;
pub mod embedding;
pub mod enroll;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod matcher;
pub mod state;
pub mod store;
pub mod tracker;

// Re-export the types most callers need
pub use embedding::{Embedding, EnrolledEmbedding};
pub use error::{Error, Result, StoreError};
pub use matcher::MatchResult;
pub use state::AppState;
