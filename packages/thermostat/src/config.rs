use anyhow::{Context, Result};
use live_socket::{EngineConfig, OriginPolicy};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [session]
//                    checkpoint = true
//
//   env var:         THERMO_SESSION__CHECKPOINT=true   (double underscore = nesting)
//
//   (single underscore stays within field names: THERMO_SESSION__TTL_SECS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub broadcast: BroadcastFileConfig,
    #[serde(default)]
    pub nats: NatsFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Session tunables (lives under `[session]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Persist assigns after every cycle instead of only at disconnect
    #[serde(default)]
    pub checkpoint: bool,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            cookie_name: default_cookie_name(),
            checkpoint: false,
        }
    }
}

/// Fan-out tunables (lives under `[broadcast]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BroadcastFileConfig {
    #[serde(default)]
    pub exclude_origin: bool,
    #[serde(default = "default_clock_interval")]
    pub clock_interval_ms: u64,
}

impl Default for BroadcastFileConfig {
    fn default() -> Self {
        Self {
            exclude_origin: false,
            clock_interval_ms: default_clock_interval(),
        }
    }
}

/// Message bus settings (lives under `[nats]` in config.toml).
/// Without a url the server runs with an in-process bus.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NatsFileConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_nats_subject")]
    pub subject: String,
}

impl Default for NatsFileConfig {
    fn default() -> Self {
        Self {
            url: None,
            subject: default_nats_subject(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_session_ttl() -> u64 {
    86400 // 1 day
}
fn default_cookie_name() -> String {
    "thermostat_session".to_string()
}
fn default_clock_interval() -> u64 {
    1000
}
fn default_nats_subject() -> String {
    "go-live".to_string()
}

/// Build the layered figment: struct defaults, then `config.toml` in the
/// data dir, then `THERMO_*` env vars.
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("THERMO_").split("__"))
}

// =============================================================================
// Runtime views
// =============================================================================

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub ttl: Duration,
    pub cookie_name: String,
    pub engine: EngineConfig,
}

impl SessionConfig {
    pub fn from_file(fc: &SessionFileConfig) -> Self {
        Self {
            ttl: Duration::from_secs(fc.ttl_secs),
            cookie_name: fc.cookie_name.clone(),
            engine: EngineConfig {
                checkpoint_sessions: fc.checkpoint,
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct BroadcastConfig {
    pub origin_policy: OriginPolicy,
    pub clock_interval: Duration,
}

impl BroadcastConfig {
    pub fn from_file(fc: &BroadcastFileConfig) -> Self {
        Self {
            origin_policy: if fc.exclude_origin {
                OriginPolicy::Exclude
            } else {
                OriginPolicy::Include
            },
            // A zero period would spin the clock task
            clock_interval: Duration::from_millis(fc.clock_interval_ms.max(10)),
        }
    }
}

pub fn listen_addr(fc: &ServerFileConfig) -> Result<SocketAddr> {
    format!("{}:{}", fc.host, fc.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", fc.host, fc.port))
}

/// On-disk layout of the data directory.
#[derive(Clone, Debug)]
pub struct ThermostatConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl ThermostatConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".thermostat"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let db_path = data_dir.join("sessions.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, db_path })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
