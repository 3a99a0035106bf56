use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::PeerDescriptor;

/// Device-side engine configuration.
///
/// Loaded from YAML; `OFFLOAD_*` environment variables override the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Try the secure port first when the peer supports it.
    #[serde(default = "default_true")]
    pub connect_secure: bool,

    /// Local resource broker handing out the peer descriptor.
    #[serde(default = "default_broker_addr")]
    pub broker_addr: String,

    #[serde(default = "default_broker_retry_ms")]
    pub broker_retry_ms: u64,

    /// Ceiling on the initial wait for network estimates.
    #[serde(default = "default_network_wait_ms")]
    pub network_wait_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_upload_chunk_bytes")]
    pub upload_chunk_bytes: usize,

    /// Reopen a channel that broke mid-session on the next remote task.
    #[serde(default = "default_true")]
    pub reconnect_on_failure: bool,

    /// Fixed peer; bypasses the broker when set.
    #[serde(default)]
    pub peer: Option<PeerDescriptor>,

    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TlsSettings {
    /// PEM bundle of trusted CA certificates.
    pub ca_file: PathBuf,
    /// Name to verify; defaults to the peer address.
    #[serde(default)]
    pub server_name: Option<String>,
}

fn default_workers() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_broker_addr() -> String {
    "127.0.0.1:4322".to_string()
}

fn default_broker_retry_ms() -> u64 {
    2_000
}

fn default_network_wait_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_upload_chunk_bytes() -> usize {
    4096
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            connect_secure: true,
            broker_addr: default_broker_addr(),
            broker_retry_ms: default_broker_retry_ms(),
            network_wait_ms: default_network_wait_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            upload_chunk_bytes: default_upload_chunk_bytes(),
            reconnect_on_failure: true,
            peer: None,
            tls: None,
        }
    }
}

impl EngineConfig {
    /// Config pinned to a known peer, as used by tests and fixed deployments.
    pub fn with_peer(peer: PeerDescriptor) -> Self {
        Self {
            peer: Some(peer),
            ..Self::default()
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config '{}'", path.display()))?;
        let mut cfg: EngineConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse engine config '{}'", path.display()))?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_var("OFFLOAD_WORKERS") {
            self.workers = v
                .parse()
                .map_err(|_| anyhow!("invalid OFFLOAD_WORKERS: '{v}' (must be a positive integer)"))?;
        }
        if let Some(v) = env_var("OFFLOAD_CONNECT_SECURE") {
            self.connect_secure = parse_bool(&v)
                .ok_or_else(|| anyhow!("invalid OFFLOAD_CONNECT_SECURE: '{v}' (use true/false)"))?;
        }
        if let Some(v) = env_var("OFFLOAD_BROKER_ADDR") {
            self.broker_addr = v;
        }
        if let Some(v) = env_var("OFFLOAD_PEER") {
            self.peer = Some(parse_peer(&v)?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(anyhow!("workers must be >= 1"));
        }
        if self.upload_chunk_bytes == 0 {
            return Err(anyhow!("upload_chunk_bytes must be >= 1"));
        }
        Ok(())
    }

    pub fn broker_retry(&self) -> Duration {
        Duration::from_millis(self.broker_retry_ms)
    }

    pub fn network_wait(&self) -> Duration {
        Duration::from_millis(self.network_wait_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Reference peer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    #[serde(default = "default_peer_bind")]
    pub bind: String,

    /// Optional TLS listener; requires `tls`.
    #[serde(default)]
    pub secure_bind: Option<String>,

    #[serde(default)]
    pub tls: Option<PeerTlsSettings>,

    /// Root under which uploaded applications are stored, one directory per id.
    pub apps_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PeerTlsSettings {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

fn default_peer_bind() -> String {
    "0.0.0.0:4321".to_string()
}

impl PeerConfig {
    pub fn new(bind: impl Into<String>, apps_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind: bind.into(),
            secure_bind: None,
            tls: None,
            apps_dir: apps_dir.into(),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read peer config '{}'", path.display()))?;
        let cfg: PeerConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse peer config '{}'", path.display()))?;
        if cfg.secure_bind.is_some() && cfg.tls.is_none() {
            return Err(anyhow!("secure_bind requires a tls section"));
        }
        Ok(cfg)
    }
}

/// Parse `host:port[:secure_port]`. A secure port marks the peer crypto capable.
pub fn parse_peer(raw: &str) -> Result<PeerDescriptor> {
    let parts: Vec<&str> = raw.trim().rsplitn(3, ':').collect();
    let (address, port, secure_port) = match parts.as_slice() {
        [port, host] => (*host, *port, None),
        [secure, port, host] => (*host, *port, Some(*secure)),
        _ => return Err(anyhow!("invalid peer '{raw}' (expected host:port[:secure_port])")),
    };
    if address.is_empty() {
        return Err(anyhow!("invalid peer '{raw}': empty host"));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow!("invalid peer '{raw}': bad port '{port}'"))?;
    let secure_port: Option<u16> = secure_port
        .map(|p| {
            p.parse()
                .map_err(|_| anyhow!("invalid peer '{raw}': bad secure port '{p}'"))
        })
        .transpose()?;
    Ok(PeerDescriptor {
        address: address.to_string(),
        port,
        secure_port: secure_port.unwrap_or(port),
        crypto_capable: secure_port.is_some(),
    })
}

fn env_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_peer_accepts_plain_and_secure_forms() {
        let p = parse_peer("10.0.0.3:4321").unwrap();
        assert_eq!(p.address, "10.0.0.3");
        assert_eq!(p.port, 4321);
        assert!(!p.crypto_capable);

        let p = parse_peer("clone.local:4321:5443").unwrap();
        assert_eq!(p.secure_port, 5443);
        assert!(p.crypto_capable);
    }

    #[test]
    fn parse_peer_rejects_garbage() {
        assert!(parse_peer("nohost").is_err());
        assert!(parse_peer(":4321").is_err());
        assert!(parse_peer("host:notaport").is_err());
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let cfg = EngineConfig {
            workers: 0,
            ..EngineConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("workers"), "{err:#}");
    }

    #[test]
    fn yaml_defaults_fill_missing_fields() {
        let cfg: EngineConfig = serde_yaml::from_str("workers: 3\n").unwrap();
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.broker_retry_ms, 2_000);
        assert_eq!(cfg.network_wait_ms, 10_000);
        assert_eq!(cfg.upload_chunk_bytes, 4096);
        assert!(cfg.connect_secure);
    }
}
