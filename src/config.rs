use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use url::Url;

use crate::jar::DomainMatch;
use crate::logging::Level;
use crate::omnibox::SearchEngine;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7940";
pub const DEFAULT_PROXY_PREFIX: &str = "/ign-proxy/";
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:115.0) Gecko/20100101 Firefox/115.0";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_proxy_prefix")]
    pub proxy_prefix: String,
    /// Equivalent relay endpoints; one is picked per day.
    pub mirrors: Vec<String>,
    #[serde(default)]
    pub experimental_quic: bool,
    #[serde(default = "default_quic_port")]
    pub quic_port: u16,
    /// DER certificate trusted for the QUIC candidate. Without it the candidate is skipped.
    #[serde(default)]
    pub quic_ca_cert: Option<PathBuf>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub shared_memory: bool,
    #[serde(default)]
    pub xor_key: Option<u8>,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_redirect_capacity")]
    pub redirect_capacity: usize,
    #[serde(default = "default_redirect_ttl_secs")]
    pub redirect_ttl_secs: u64,
    #[serde(default)]
    pub cookie_domain_match: DomainMatch,
    #[serde(default)]
    pub blocked_hosts: Vec<String>,
    #[serde(default)]
    pub search_engine: SearchEngine,
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
    #[serde(default)]
    pub control_token: Option<String>,
    #[serde(default)]
    pub log_level: Level,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

/// Values that take precedence over the file (CLI flags, then environment).
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub listen_addr: Option<String>,
    pub control_token: Option<String>,
    pub data_dir: Option<PathBuf>,
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}
fn default_proxy_prefix() -> String {
    DEFAULT_PROXY_PREFIX.to_string()
}
fn default_quic_port() -> u16 {
    443
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_request_timeout_secs() -> u64 {
    60
}
fn default_heartbeat_secs() -> u64 {
    5
}
fn default_redirect_capacity() -> usize {
    1024
}
fn default_redirect_ttl_secs() -> u64 {
    600
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_overrides(path, ConfigOverrides::default())
    }

    pub fn load_with_overrides(path: &Path, overrides: ConfigOverrides) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&data).context("parse config json")?;
        cfg.config_path = Some(path.to_path_buf());
        cfg.apply_env();
        cfg.apply_overrides(overrides);
        cfg.normalize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("IGNITION_LISTEN_ADDR") {
            if !v.trim().is_empty() {
                self.listen_addr = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("IGNITION_CONTROL_TOKEN") {
            if !v.trim().is_empty() {
                self.control_token = Some(v.trim().to_string());
            }
        }
        if let Ok(v) = std::env::var("IGNITION_DATA_DIR") {
            if !v.trim().is_empty() {
                self.data_dir = PathBuf::from(v.trim());
            }
        }
    }

    fn apply_overrides(&mut self, o: ConfigOverrides) {
        if let Some(v) = o.listen_addr {
            self.listen_addr = v;
        }
        if let Some(v) = o.control_token {
            self.control_token = Some(v);
        }
        if let Some(v) = o.data_dir {
            self.data_dir = v;
        }
    }

    fn normalize(&mut self) -> Result<()> {
        if self.data_dir.is_relative() {
            if let Some(base) = self.config_path.as_ref().and_then(|p| p.parent()) {
                self.data_dir = base.join(&self.data_dir);
            }
        }
        if !self.proxy_prefix.ends_with('/') {
            self.proxy_prefix.push('/');
        }
        self.mirrors = self
            .mirrors
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.mirrors.is_empty() {
            anyhow::bail!("mirrors: at least one relay endpoint is required");
        }
        for (i, m) in self.mirrors.iter().enumerate() {
            validate_mirror(m).with_context(|| format!("mirrors[{i}]"))?;
        }
        validate_prefix(&self.proxy_prefix).context("proxy_prefix")?;
        if self.heartbeat_secs == 0 {
            anyhow::bail!("heartbeat_secs must be positive");
        }
        if self.redirect_capacity == 0 {
            anyhow::bail!("redirect_capacity must be positive");
        }
        if matches!(self.workers, Some(0)) {
            anyhow::bail!("workers must be positive when set");
        }
        Ok(())
    }

    pub fn mirror_urls(&self) -> Result<Vec<Url>> {
        self.mirrors
            .iter()
            .map(|m| Url::parse(m).with_context(|| format!("parse mirror {m}")))
            .collect()
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("ignition.db")
    }

    pub fn vault_dir(&self) -> PathBuf {
        self.data_dir.join("shadow-vault")
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.log_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("logs").join("ignition-hub.log"))
    }
}

fn validate_mirror(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        anyhow::bail!("mirror must be ws or wss: {raw}");
    }
    if url.host_str().is_none() {
        anyhow::bail!("mirror has no host: {raw}");
    }
    Ok(())
}

fn validate_prefix(prefix: &str) -> Result<()> {
    static PATTERN: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
        Regex::new(r"^/[A-Za-z0-9._~-]+(/[A-Za-z0-9._~-]+)*/$").unwrap()
    });
    if PATTERN.is_match(prefix) {
        Ok(())
    } else {
        anyhow::bail!("invalid proxy prefix: {prefix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("ignition-config-{name}-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn load_applies_defaults_and_normalizes() {
        let tmp = scratch("defaults");
        let cfg_path = tmp.join("config.json");
        fs::write(
            &cfg_path,
            r#"{
                "data_dir": "state",
                "mirrors": [" wss://relay-a.example/wisp/ ", "wss://relay-b.example/wisp/"],
                "proxy_prefix": "/ign-proxy"
            }"#,
        )
        .unwrap();

        let cfg = Config::load(&cfg_path).unwrap();
        assert_eq!(cfg.data_dir, tmp.join("state"));
        assert_eq!(cfg.proxy_prefix, "/ign-proxy/");
        assert_eq!(cfg.mirrors[0], "wss://relay-a.example/wisp/");
        assert_eq!(cfg.heartbeat_secs, 5);
        assert_eq!(cfg.cookie_domain_match, DomainMatch::Strict);
        assert_eq!(cfg.search_engine, SearchEngine::Google);
        assert!(!cfg.experimental_quic);
        assert_eq!(cfg.config_path.as_ref().unwrap(), &cfg_path);
    }

    #[test]
    fn overrides_take_precedence() {
        let tmp = scratch("overrides");
        let cfg_path = tmp.join("config.json");
        fs::write(
            &cfg_path,
            r#"{"data_dir": "/tmp/ign", "mirrors": ["wss://relay.example/"], "listen_addr": "127.0.0.1:1"}"#,
        )
        .unwrap();
        let cfg = Config::load_with_overrides(
            &cfg_path,
            ConfigOverrides {
                listen_addr: Some("127.0.0.1:0".into()),
                control_token: Some("tok".into()),
                data_dir: None,
            },
        )
        .unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:0");
        assert_eq!(cfg.control_token.as_deref(), Some("tok"));
    }

    #[test]
    fn reject_non_websocket_mirror() {
        let tmp = scratch("bad-mirror");
        let cfg_path = tmp.join("config.json");
        fs::write(
            &cfg_path,
            r#"{"data_dir": "/tmp/ign", "mirrors": ["https://relay.example/"]}"#,
        )
        .unwrap();
        let err = Config::load(&cfg_path).unwrap_err();
        assert!(format!("{err:#}").contains("mirrors[0]"));
    }

    #[test]
    fn reject_empty_mirror_set() {
        let tmp = scratch("no-mirrors");
        let cfg_path = tmp.join("config.json");
        fs::write(&cfg_path, r#"{"data_dir": "/tmp/ign", "mirrors": []}"#).unwrap();
        let err = Config::load(&cfg_path).unwrap_err();
        assert!(err.to_string().contains("at least one relay"));
    }
}
