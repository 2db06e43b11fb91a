use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineSettings;
use crate::model::Ms;

/// Server configuration, read once from `LENDLOG_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub utc_offset_minutes: i32,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "lendlog".into(),
            max_connections: 256,
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(300),
            utc_offset_minutes: 0,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable values fall back to the default.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            port: parse_var(&get, "LENDLOG_PORT").unwrap_or(d.port),
            bind: get("LENDLOG_BIND").unwrap_or(d.bind),
            data_dir: get("LENDLOG_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: get("LENDLOG_PASSWORD").unwrap_or(d.password),
            max_connections: parse_var(&get, "LENDLOG_MAX_CONNECTIONS").unwrap_or(d.max_connections),
            compact_threshold: parse_var(&get, "LENDLOG_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            sweep_interval: parse_var::<u64>(&get, "LENDLOG_SWEEP_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.sweep_interval),
            utc_offset_minutes: parse_var::<i32>(&get, "LENDLOG_UTC_OFFSET_MINUTES")
                .filter(|m| m.abs() <= 14 * 60)
                .unwrap_or(d.utc_offset_minutes),
            metrics_port: parse_var(&get, "LENDLOG_METRICS_PORT"),
            tls_cert: get("LENDLOG_TLS_CERT"),
            tls_key: get("LENDLOG_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("lendlog.wal")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            utc_offset_ms: Ms::from(self.utc_offset_minutes) * 60_000,
        }
    }
}

fn parse_var<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|v| v.parse().ok())
}
