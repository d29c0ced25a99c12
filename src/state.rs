use crate::artifacts::ArtifactDir;
use crate::assembly::Reassembler;
use crate::config::Config;
use crate::enroll::Enroller;
use crate::extractor::{FaceEncoder, HttpEncoder};
use crate::matcher::Matcher;
use crate::store::{self, RecordStore};
use crate::tracker::{OutcomeBook, VerificationTracker};
use anyhow::{Context, Result};
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const COMPLETION_CAPACITY: usize = 256;

/// Everything the listeners and the HTTP surface share. Created once at
/// startup; chunk assemblies live until their image completes, verification
/// outcomes until the sweeper expires them.
#[derive(Clone)]
pub struct AppState {
    pub artifacts: ArtifactDir,
    pub reassembler: Arc<Reassembler>,
    pub tracker: VerificationTracker,
    pub matcher: Arc<Matcher>,
    pub enroller: Arc<Enroller>,
}

impl AppState {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let artifacts = ArtifactDir::create(&cfg.images_dir)
            .with_context(|| format!("creating images dir {}", cfg.images_dir.display()))?;
        let encoder: Arc<dyn FaceEncoder> =
            Arc::new(HttpEncoder::new(&cfg.extractor).context("building extractor client")?);
        let store = store::from_config(&cfg.store).context("opening record store")?;
        Ok(Self::new(cfg, artifacts, encoder, store))
    }

    pub fn new(
        cfg: &Config,
        artifacts: ArtifactDir,
        encoder: Arc<dyn FaceEncoder>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let (completions, _) = broadcast::channel(COMPLETION_CAPACITY);
        let tracker = VerificationTracker::new(
            artifacts.clone(),
            Arc::new(OutcomeBook::default()),
            completions.clone(),
            cfg.verification.poll_interval(),
            cfg.verification.timeout(),
        );
        Self {
            reassembler: Arc::new(Reassembler::new(artifacts.clone(), completions)),
            matcher: Arc::new(Matcher::new(
                encoder.clone(),
                store.clone(),
                artifacts.clone(),
                cfg.threshold,
            )),
            enroller: Arc::new(Enroller::new(encoder, store, artifacts.clone())),
            tracker,
            artifacts,
        }
    }

    /// Periodically drop abandoned assemblies and expired outcomes.
    pub fn spawn_sweeper(
        &self,
        every: Duration,
        assembly_ttl: Duration,
        outcome_ttl: Duration,
    ) -> JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let assemblies = state.reassembler.evict_stale(assembly_ttl);
                let outcomes = state.tracker.outcomes().evict_older_than(outcome_ttl);
                if assemblies + outcomes > 0 {
                    debug!("swept {assemblies} stale assemblies, {outcomes} expired outcomes");
                }
            }
        })
    }
}
