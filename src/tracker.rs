//! Verification of access events against image arrival.
//!
//! A metadata event names an image id; the tracker waits, bounded by a
//! deadline, for that image's artifact and records whether it showed up.

use crate::artifacts::ArtifactDir;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub verified: bool,
    pub recorded_at: Instant,
}

/// Verification outcomes by image id. Entries are written whole, so readers
/// see either nothing or a complete outcome.
#[derive(Debug, Default)]
pub struct OutcomeBook {
    inner: Mutex<HashMap<String, Outcome>>,
}

impl OutcomeBook {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Outcome>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Last writer wins.
    pub fn record(&self, image_id: &str, verified: bool) {
        self.lock().insert(
            image_id.to_string(),
            Outcome {
                verified,
                recorded_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, image_id: &str) -> Option<Outcome> {
        self.lock().get(image_id).copied()
    }

    pub fn is_verified(&self, image_id: &str) -> bool {
        self.get(image_id).map(|o| o.verified).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evict_older_than(&self, ttl: Duration) -> usize {
        let mut map = self.lock();
        let before = map.len();
        map.retain(|_, o| o.recorded_at.elapsed() < ttl);
        before - map.len()
    }
}

#[derive(Clone)]
pub struct VerificationTracker {
    artifacts: ArtifactDir,
    outcomes: Arc<OutcomeBook>,
    completions: broadcast::Sender<String>,
    poll_interval: Duration,
    timeout: Duration,
}

impl VerificationTracker {
    pub fn new(
        artifacts: ArtifactDir,
        outcomes: Arc<OutcomeBook>,
        completions: broadcast::Sender<String>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            artifacts,
            outcomes,
            completions,
            poll_interval,
            timeout,
        }
    }

    pub fn outcomes(&self) -> &Arc<OutcomeBook> {
        &self.outcomes
    }

    /// Track `image_id` on its own task with the configured timeout.
    /// Aborting the returned handle cancels tracking without recording.
    pub fn spawn(&self, image_id: String) -> JoinHandle<bool> {
        let tracker = self.clone();
        let timeout = self.timeout;
        tokio::spawn(async move { tracker.track_until_verified(&image_id, timeout).await })
    }

    /// Wait until the artifact for `image_id` exists or `timeout` elapses and
    /// record the result.
    ///
    /// The artifact is re-checked on every completion broadcast for this id
    /// and at least once per poll interval, which also catches artifacts
    /// written by another process.
    pub async fn track_until_verified(&self, image_id: &str, timeout: Duration) -> bool {
        // subscribe before the first check so a completion in between is not lost
        let mut completions = self.completions.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        let verified = loop {
            if self.artifacts.exists(image_id) {
                break true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break false;
            }
            let wait = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = completion_of(&mut completions, image_id) => {}
            }
        };

        self.outcomes.record(image_id, verified);
        if verified {
            info!("image {image_id} verified");
        } else {
            warn!("image {image_id} not received within {timeout:?}");
        }
        verified
    }
}

/// Resolves when `image_id` is announced, or when the receiver lagged and
/// may have missed it.
async fn completion_of(rx: &mut broadcast::Receiver<String>, image_id: &str) {
    loop {
        match rx.recv().await {
            Ok(id) if id == image_id => return,
            Ok(_) => continue,
            Err(RecvError::Lagged(_)) => return,
            // all senders gone, rely on polling alone
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}
