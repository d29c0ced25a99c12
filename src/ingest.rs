//! MQTT listeners for the chunk and metadata topics.
//!
//! Each listener owns one broker connection and runs until the process
//! exits. A bad message is logged and dropped; a broken connection is
//! retried after a short pause.

use crate::assembly::{ChunkMessage, ChunkOutcome, Reassembler};
use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::tracker::VerificationTracker;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 64;
// base64 images arrive in many small messages; allow generous packets
const MAX_PACKET_SIZE: usize = 1 << 20;

/// Metadata payload; only the image id matters here.
#[derive(Debug, Deserialize)]
pub struct MetaMessage {
    #[serde(default)]
    pub img_id: Option<String>,
}

pub fn parse_chunk(payload: &[u8]) -> Result<ChunkMessage> {
    serde_json::from_slice(payload).map_err(|e| Error::MalformedChunk(e.to_string()))
}

/// `Ok(None)` for well-formed metadata that carries no image id.
pub fn parse_meta(payload: &[u8]) -> Result<Option<String>> {
    let meta: MetaMessage =
        serde_json::from_slice(payload).map_err(|e| Error::MalformedMetadata(e.to_string()))?;
    Ok(meta.img_id.filter(|id| !id.is_empty()))
}

pub fn handle_chunk(reassembler: &Reassembler, payload: &[u8]) {
    let result = parse_chunk(payload).and_then(|msg| reassembler.on_chunk(msg));
    match result {
        Ok(ChunkOutcome::Pending { received, total }) => {
            debug!("chunk stored ({received}/{total})")
        }
        Ok(ChunkOutcome::Duplicate) => debug!("duplicate chunk ignored"),
        Ok(ChunkOutcome::Completed { .. }) => {}
        Err(e) => warn!("dropping chunk message: {e}"),
    }
}

/// Runs [`handle_chunk`] on the blocking pool. Completing an image writes
/// and fsyncs under the assembly lock, which must not stall the event loop.
pub fn offload_chunk(reassembler: &Arc<Reassembler>, payload: &[u8]) -> JoinHandle<()> {
    let reassembler = Arc::clone(reassembler);
    let payload = payload.to_vec();
    tokio::task::spawn_blocking(move || handle_chunk(&reassembler, &payload))
}

/// Starts a tracking task for the named image; never waits on it.
pub fn handle_meta(tracker: &VerificationTracker, payload: &[u8]) -> Option<JoinHandle<bool>> {
    match parse_meta(payload) {
        Ok(Some(img_id)) => {
            info!("access event for image {img_id}");
            Some(tracker.spawn(img_id))
        }
        Ok(None) => {
            debug!("metadata without img_id ignored");
            None
        }
        Err(e) => {
            warn!("dropping metadata message: {e}");
            None
        }
    }
}

pub fn spawn_chunk_listener(cfg: &BrokerConfig, reassembler: Arc<Reassembler>) -> JoinHandle<()> {
    let cfg = cfg.clone();
    tokio::spawn(async move {
        listen(&cfg, |payload| {
            offload_chunk(&reassembler, payload);
        })
        .await;
    })
}

pub fn spawn_meta_listener(cfg: &BrokerConfig, tracker: VerificationTracker) -> JoinHandle<()> {
    let cfg = cfg.clone();
    tokio::spawn(async move {
        listen(&cfg, |payload| {
            handle_meta(&tracker, payload);
        })
        .await;
    })
}

fn mqtt_options(cfg: &BrokerConfig) -> MqttOptions {
    let mut opts = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(KEEP_ALIVE);
    opts.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(user, pass);
    }
    if cfg.tls {
        opts.set_transport(Transport::tls_with_default_config());
    }
    opts
}

fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

async fn listen(cfg: &BrokerConfig, mut on_payload: impl FnMut(&[u8])) {
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(cfg), REQUEST_CAPACITY);
    info!(
        "connecting to {}:{} for topic {} (tls: {})",
        cfg.host, cfg.port, cfg.topic, cfg.tls
    );

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("connected to {}:{}, subscribing {}", cfg.host, cfg.port, cfg.topic);
                // re-subscribe on every (re)connect, the session is not persisted
                if let Err(e) = client.try_subscribe(cfg.topic.as_str(), qos(cfg.qos)) {
                    error!("subscribe to {} failed: {e}", cfg.topic);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => on_payload(&publish.payload[..]),
            Ok(_) => {}
            Err(e) => {
                warn!("connection to {}:{} failed: {e}", cfg.host, cfg.port);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
