use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lib_relay::core::upstream_link::DEFAULT_MAX_PENDING_BYTES;
use lib_relay::core::{LinkOptions, RelayOptions, RouterOptions, SessionOptions};

const DEFAULT_CONFIG_FILE: &str = "server_relay.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "WebSocket relay between browser clients and an upstream processing server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "RELAY_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "RELAY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "RELAY_UPSTREAM_URL", help = "WebSocket URL of the upstream processing server.")]
    pub upstream_url: Option<String>,

    #[clap(long, env = "RELAY_WS_PATH", help = "HTTP path of the client WebSocket endpoint.")]
    pub ws_path: Option<String>,

    #[clap(long, env = "RELAY_RECONNECT_DELAY_MS", help = "Fixed delay in milliseconds between upstream reconnect attempts.")]
    pub reconnect_delay_ms: Option<u64>,

    #[clap(long, env = "RELAY_CLOSE_TIMEOUT_MS", help = "Milliseconds to wait for the upstream close frame before aborting.")]
    pub close_timeout_ms: Option<u64>,

    #[clap(long, env = "RELAY_UPSTREAM_HEARTBEAT_SECS", help = "Seconds between upstream pings (0 disables).")]
    pub upstream_heartbeat_secs: Option<u64>,

    #[clap(long, env = "RELAY_MAX_MESSAGE_BYTES", help = "Largest accepted client message in bytes.")]
    pub max_message_bytes: Option<usize>,

    #[clap(long, env = "RELAY_UPSTREAM_QUEUE_BYTES", help = "Most image bytes allowed to wait for the upstream writer.")]
    pub upstream_queue_bytes: Option<u64>,

    #[clap(long, env = "RELAY_CLOSE_UPSTREAM_WHEN_IDLE", help = "Close the upstream link when the last client leaves.")]
    pub close_upstream_when_idle: Option<bool>,

    #[clap(long, env = "RELAY_REJECT_UNKNOWN", help = "Answer unrecognised client messages with an error.")]
    pub reject_unknown: Option<bool>,

    #[clap(long, env = "RELAY_CONNECT_ON_START", help = "Connect upstream at startup instead of on the first client.")]
    pub connect_on_start: Option<bool>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

/// Fully resolved settings, every value present.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub upstream_url: String,
    pub ws_path: String,
    pub reconnect_delay: Duration,
    pub close_timeout: Duration,
    pub upstream_heartbeat: Option<Duration>,
    pub max_message_bytes: usize,
    pub upstream_queue_bytes: u64,
    pub close_upstream_when_idle: bool,
    pub reject_unknown: bool,
    pub connect_on_start: bool,
    pub tls: Option<(PathBuf, PathBuf)>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            upstream_url: other.upstream_url.or(self.upstream_url),
            ws_path: other.ws_path.or(self.ws_path),
            reconnect_delay_ms: other.reconnect_delay_ms.or(self.reconnect_delay_ms),
            close_timeout_ms: other.close_timeout_ms.or(self.close_timeout_ms),
            upstream_heartbeat_secs: other.upstream_heartbeat_secs.or(self.upstream_heartbeat_secs),
            max_message_bytes: other.max_message_bytes.or(self.max_message_bytes),
            upstream_queue_bytes: other.upstream_queue_bytes.or(self.upstream_queue_bytes),
            close_upstream_when_idle: other.close_upstream_when_idle.or(self.close_upstream_when_idle),
            reject_unknown: other.reject_unknown.or(self.reject_unknown),
            connect_on_start: other.connect_on_start.or(self.connect_on_start),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(8080),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            upstream_url: Some("ws://localhost:8765".to_string()),
            ws_path: Some("/numberws".to_string()),
            reconnect_delay_ms: Some(5_000),
            close_timeout_ms: Some(1_000),
            upstream_heartbeat_secs: Some(30),
            max_message_bytes: Some(lib_relay::core::relay::DEFAULT_MAX_MESSAGE_BYTES),
            upstream_queue_bytes: Some(DEFAULT_MAX_PENDING_BYTES),
            close_upstream_when_idle: Some(true),
            reject_unknown: Some(false),
            connect_on_start: Some(false),
            ..Default::default()
        }
    }

    /// Fills every gap from the built-in defaults.
    pub fn resolve(self) -> Settings {
        let c = Config::defaults().merge(self);
        let tls = match (c.tls_cert_path, c.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        };
        let heartbeat = c.upstream_heartbeat_secs.unwrap_or(0);
        Settings {
            port: c.port.unwrap_or(8080),
            log_dir: c.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: c.log_level.unwrap_or_else(|| "info".to_string()),
            upstream_url: c.upstream_url.unwrap_or_default(),
            ws_path: normalize_path(c.ws_path.unwrap_or_default()),
            reconnect_delay: Duration::from_millis(c.reconnect_delay_ms.unwrap_or(5_000)),
            close_timeout: Duration::from_millis(c.close_timeout_ms.unwrap_or(1_000)),
            upstream_heartbeat: (heartbeat > 0).then(|| Duration::from_secs(heartbeat)),
            max_message_bytes: c
                .max_message_bytes
                .unwrap_or(lib_relay::core::relay::DEFAULT_MAX_MESSAGE_BYTES),
            upstream_queue_bytes: c.upstream_queue_bytes.unwrap_or(DEFAULT_MAX_PENDING_BYTES),
            close_upstream_when_idle: c.close_upstream_when_idle.unwrap_or(true),
            reject_unknown: c.reject_unknown.unwrap_or(false),
            connect_on_start: c.connect_on_start.unwrap_or(false),
            tls,
        }
    }
}

fn normalize_path(path: String) -> String {
    if path.starts_with('/') {
        path
    } else {
        format!("/{}", path)
    }
}

impl Settings {
    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            link: LinkOptions {
                reconnect_delay: self.reconnect_delay,
                close_timeout: self.close_timeout,
                heartbeat_interval: self.upstream_heartbeat,
                max_pending_bytes: self.upstream_queue_bytes,
            },
            router: RouterOptions {
                reject_unknown: self.reject_unknown,
            },
            session: SessionOptions {
                close_upstream_when_idle: self.close_upstream_when_idle,
            },
            max_message_bytes: self.max_message_bytes,
            connect_on_start: self.connect_on_start,
        }
    }
}

fn read_config_file(path: &Path) -> Result<Option<Config>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let parsed = serde_json::from_str::<Config>(&raw)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(Some(parsed))
}

/// Layers the configuration sources: file < environment / CLI.
fn layered(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current = Config::default();
    match read_config_file(&config_file_path) {
        Ok(Some(file_config)) => current = current.merge(file_config),
        Ok(None) => tracing::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        ),
        Err(e) => tracing::warn!("{:#}. Falling back to other sources.", e),
    }

    // clap::Parser already folded environment variables into `cli`.
    current.merge(cli)
}

pub fn load_config() -> Settings {
    layered(Config::parse()).resolve()
}
