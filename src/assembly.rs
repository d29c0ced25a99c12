//! Reassembly of images published as base64 chunks.
//!
//! Chunks may arrive in any order, more than once, and interleaved across
//! images. A single lock guards the whole store and is held for the entire
//! insert, completion check, materialize and remove sequence, which is what
//! makes completion fire exactly once per image id.

use crate::artifacts::{validate_id, ArtifactDir};
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Wire format of the `image/chunk` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMessage {
    pub image_id: String,
    pub index: u32,
    pub total: u32,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// Stored; the image is still incomplete.
    Pending { received: u32, total: u32 },
    /// Index already held, or the image was already materialized.
    Duplicate,
    /// Last chunk arrived and the artifact was written.
    Completed { path: PathBuf, len: usize },
}

#[derive(Debug)]
struct ImageAssembly {
    expected: u32,
    received: BTreeMap<u32, String>,
    started_at: Instant,
}

impl ImageAssembly {
    fn new(expected: u32) -> Self {
        Self {
            expected,
            received: BTreeMap::new(),
            started_at: Instant::now(),
        }
    }

    fn is_complete(&self) -> bool {
        self.received.len() == self.expected as usize
    }

    /// Concatenate payloads in index order and decode. Keys are bounded by
    /// `expected`, so a full map is the dense range `0..expected`.
    fn decode(&self) -> Result<Vec<u8>> {
        let joined: String = self.received.values().map(String::as_str).collect();
        decode_joined(&joined)
    }
}

/// Decode a concatenation of base64 text. Some cameras pad every chunk on
/// its own, so padding may also appear mid-stream; each padded group is
/// decoded separately.
fn decode_joined(joined: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(joined.len() / 4 * 3);
    let mut rest = joined;
    while !rest.is_empty() {
        let end = match rest.find('=') {
            Some(pad) => pad + rest[pad..].find(|c: char| c != '=').unwrap_or(rest.len() - pad),
            None => rest.len(),
        };
        STANDARD
            .decode_vec(&rest[..end], &mut out)
            .map_err(|e| Error::MalformedChunk(format!("base64 decode failed: {e}")))?;
        rest = &rest[end..];
    }
    Ok(out)
}

/// In-flight assemblies keyed by image id.
#[derive(Debug, Default)]
pub struct ChunkStore {
    inner: Mutex<HashMap<String, ImageAssembly>>,
}

impl ChunkStore {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ImageAssembly>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    pub fn contains(&self, image_id: &str) -> bool {
        self.lock().contains_key(image_id)
    }
}

pub struct Reassembler {
    chunks: ChunkStore,
    artifacts: ArtifactDir,
    completions: broadcast::Sender<String>,
}

impl Reassembler {
    pub fn new(artifacts: ArtifactDir, completions: broadcast::Sender<String>) -> Self {
        Self {
            chunks: ChunkStore::default(),
            artifacts,
            completions,
        }
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn on_chunk(&self, msg: ChunkMessage) -> Result<ChunkOutcome> {
        let ChunkMessage {
            image_id,
            index,
            total,
            data,
        } = msg;

        validate_id(&image_id)?;
        if total == 0 {
            return Err(Error::MalformedChunk(format!(
                "{image_id}: total must be positive"
            )));
        }
        if index >= total {
            return Err(Error::MalformedChunk(format!(
                "{image_id}: index {index} out of range for total {total}"
            )));
        }

        let mut store = self.chunks.lock();

        if !store.contains_key(&image_id) && self.artifacts.exists(&image_id) {
            debug!("chunk {index} for already materialized image {image_id}, ignoring");
            return Ok(ChunkOutcome::Duplicate);
        }

        let assembly = store
            .entry(image_id.clone())
            .or_insert_with(|| ImageAssembly::new(total));

        if total != assembly.expected {
            warn!(
                "image {image_id}: chunk declares total {total}, keeping first-seen total {}",
                assembly.expected
            );
            if index >= assembly.expected {
                return Err(Error::MalformedChunk(format!(
                    "{image_id}: index {index} out of range for total {}",
                    assembly.expected
                )));
            }
        }

        if assembly.received.contains_key(&index) {
            return Ok(ChunkOutcome::Duplicate);
        }
        assembly.received.insert(index, data);

        if !assembly.is_complete() {
            return Ok(ChunkOutcome::Pending {
                received: assembly.received.len() as u32,
                total: assembly.expected,
            });
        }

        // Complete: the assembly leaves the store whether or not the write
        // succeeds, a corrupt image is not retried.
        let Some(assembly) = store.remove(&image_id) else {
            return Err(Error::MalformedChunk(format!("{image_id}: assembly vanished")));
        };
        let bytes = assembly.decode()?;
        let path = self.artifacts.write(&image_id, &bytes)?;
        drop(store);

        info!("image {image_id} assembled ({} bytes) -> {}", bytes.len(), path.display());
        // No receivers is fine, trackers subscribe on demand.
        let _ = self.completions.send(image_id);

        Ok(ChunkOutcome::Completed {
            path,
            len: bytes.len(),
        })
    }

    /// Drop assemblies that have been collecting for longer than `max_age`.
    pub fn evict_stale(&self, max_age: Duration) -> usize {
        let mut store = self.chunks.lock();
        let before = store.len();
        store.retain(|id, assembly| {
            let keep = assembly.started_at.elapsed() < max_age;
            if !keep {
                warn!(
                    "dropping stale assembly {id}: {}/{} chunks after {:?}",
                    assembly.received.len(),
                    assembly.expected,
                    assembly.started_at.elapsed()
                );
            }
            keep
        });
        before - store.len()
    }
}
