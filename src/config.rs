use anyhow::{Context, Result};
use directories::ProjectDirs;
use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub static CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var_os("FACEGATE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/usr/local/etc/facegate/config.toml"))
});

static DATA_DIR: Lazy<PathBuf> = Lazy::new(|| {
    ProjectDirs::from("", "", "facegate")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("/var/lib/facegate"))
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub threshold: f32,
    pub images_dir: PathBuf,
    pub http: HttpConfig,
    #[serde(deserialize_with = "chunks_broker")]
    pub chunks: BrokerConfig,
    #[serde(deserialize_with = "metadata_broker")]
    pub metadata: BrokerConfig,
    pub verification: VerificationConfig,
    pub store: StoreConfig,
    pub extractor: ExtractorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

/// One MQTT subscription: broker address, topic and optional credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// A broker table as written in the file; unset keys fall back to the
/// defaults of the channel it configures.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BrokerOverrides {
    host: Option<String>,
    port: Option<u16>,
    topic: Option<String>,
    client_id: Option<String>,
    qos: Option<u8>,
    tls: Option<bool>,
    username: Option<String>,
    password: Option<String>,
}

impl BrokerOverrides {
    fn apply(self, mut base: BrokerConfig) -> BrokerConfig {
        if let Some(v) = self.host {
            base.host = v;
        }
        if let Some(v) = self.port {
            base.port = v;
        }
        if let Some(v) = self.topic {
            base.topic = v;
        }
        if let Some(v) = self.client_id {
            base.client_id = v;
        }
        if let Some(v) = self.qos {
            base.qos = v;
        }
        if let Some(v) = self.tls {
            base.tls = v;
        }
        base.username = self.username.or(base.username);
        base.password = self.password.or(base.password);
        base
    }
}

fn chunks_broker<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<BrokerConfig, D::Error> {
    Ok(BrokerOverrides::deserialize(d)?.apply(BrokerConfig::chunks()))
}

fn metadata_broker<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<BrokerConfig, D::Error> {
    Ok(BrokerOverrides::deserialize(d)?.apply(BrokerConfig::metadata()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub outcome_ttl_secs: u64,
    pub assembly_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    File {
        path: PathBuf,
    },
    Rest {
        url: String,
        #[serde(default)]
        key: String,
        #[serde(default = "default_table")]
        table: String,
    },
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub url: String,
    pub timeout_secs: u64,
}

fn default_table() -> String {
    "face_embeddings".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            images_dir: DATA_DIR.join("images"),
            http: HttpConfig::default(),
            chunks: BrokerConfig::chunks(),
            metadata: BrokerConfig::metadata(),
            verification: VerificationConfig::default(),
            store: StoreConfig::default(),
            extractor: ExtractorConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Public broker the cameras publish image chunks to.
    pub fn chunks() -> Self {
        Self {
            host: "broker.hivemq.com".to_string(),
            port: 1883,
            topic: "image/chunk".to_string(),
            client_id: "facegate-chunks".to_string(),
            qos: 0,
            tls: false,
            username: None,
            password: None,
        }
    }

    /// Authenticated TLS broker carrying access events.
    pub fn metadata() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8883,
            topic: "iot/camera/rfid_access".to_string(),
            client_id: "facegate-metadata".to_string(),
            qos: 1,
            tls: true,
            username: None,
            password: None,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            poll_interval_ms: 500,
            outcome_ttl_secs: 3600,
            assembly_ttl_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::File {
            path: DATA_DIR.join("faces.bin"),
        }
    }
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:5001/embed".to_string(),
            timeout_secs: 15,
        }
    }
}

impl VerificationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn outcome_ttl(&self) -> Duration {
        Duration::from_secs(self.outcome_ttl_secs)
    }

    pub fn assembly_ttl(&self) -> Duration {
        Duration::from_secs(self.assembly_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(CONFIG_PATH.as_path());
    let mut cfg = if path.exists() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config at {}", path.display()))?;
        parse_config(&raw).with_context(|| format!("parsing config {}", path.display()))?
    } else {
        Config::default()
    };
    apply_env(&mut cfg, |key| std::env::var(key).ok());
    Ok(cfg)
}

pub fn parse_config(raw: &str) -> Result<Config> {
    Ok(toml::from_str(raw)?)
}

/// Secrets are kept out of the config file and read from the environment.
fn apply_env(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(user) = var("FACEGATE_MQTT_USERNAME") {
        cfg.metadata.username = Some(user);
    }
    if let Some(pass) = var("FACEGATE_MQTT_PASSWORD") {
        cfg.metadata.password = Some(pass);
    }
    if let StoreConfig::Rest { url, key, .. } = &mut cfg.store {
        if let Some(v) = var("FACEGATE_STORE_URL") {
            *url = v;
        }
        if let Some(v) = var("FACEGATE_STORE_KEY") {
            *key = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.threshold, 0.6);
        assert_eq!(cfg.chunks.topic, "image/chunk");
        assert_eq!(cfg.metadata.topic, "iot/camera/rfid_access");
        assert_eq!(cfg.verification.poll_interval(), Duration::from_millis(500));
        assert!(matches!(cfg.store, StoreConfig::File { .. }));
    }

    #[test]
    fn parses_rest_store_and_overrides() {
        let cfg = parse_config(
            r#"
            threshold = 0.7
            images_dir = "/tmp/images"

            [verification]
            timeout_secs = 5

            [store]
            kind = "rest"
            url = "https://example.supabase.co"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.threshold, 0.7);
        assert_eq!(cfg.images_dir, PathBuf::from("/tmp/images"));
        assert_eq!(cfg.verification.timeout(), Duration::from_secs(5));
        assert_eq!(cfg.verification.poll_interval_ms, 500);
        match cfg.store {
            StoreConfig::Rest { url, table, key } => {
                assert_eq!(url, "https://example.supabase.co");
                assert_eq!(table, "face_embeddings");
                assert!(key.is_empty());
            }
            other => panic!("unexpected store {other:?}"),
        }
    }

    #[test]
    fn partial_broker_tables_keep_channel_defaults() {
        let cfg = parse_config(
            r#"
            [chunks]
            topic = "lab/chunk"

            [metadata]
            host = "mqtt.internal"
            tls = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.chunks.topic, "lab/chunk");
        assert_eq!(cfg.chunks.host, "broker.hivemq.com");
        assert_eq!(cfg.chunks.port, 1883);

        assert_eq!(cfg.metadata.host, "mqtt.internal");
        assert!(!cfg.metadata.tls);
        assert_eq!(cfg.metadata.port, 8883);
        assert_eq!(cfg.metadata.topic, "iot/camera/rfid_access");
        assert_eq!(cfg.metadata.client_id, "facegate-metadata");
        assert_eq!(cfg.metadata.qos, 1);
    }

    #[test]
    fn env_supplies_secrets() {
        let mut cfg = parse_config("[store]\nkind = \"rest\"\nurl = \"http://db\"\n").unwrap();
        let env: HashMap<&str, &str> = [
            ("FACEGATE_MQTT_USERNAME", "cam"),
            ("FACEGATE_MQTT_PASSWORD", "secret"),
            ("FACEGATE_STORE_KEY", "anon-key"),
        ]
        .into_iter()
        .collect();
        apply_env(&mut cfg, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.metadata.username.as_deref(), Some("cam"));
        assert_eq!(cfg.metadata.password.as_deref(), Some("secret"));
        match cfg.store {
            StoreConfig::Rest { url, key, .. } => {
                assert_eq!(url, "http://db");
                assert_eq!(key, "anon-key");
            }
            other => panic!("unexpected store {other:?}"),
        }
    }
}
