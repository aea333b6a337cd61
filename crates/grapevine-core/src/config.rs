//! Node configuration
//!
//! A [`GrapevineConfig`] is read from an optional TOML file and then
//! patched by `GRAPEVINE_*` environment variables. Every field has a
//! default, so an empty file (or no file) yields a working node.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GrapevineError, GrapevineResult};
use crate::types::Address;

/// First port the listener tries when none is configured
pub const DEFAULT_PORT: u16 = 8911;

/// Upper bound on a single wire frame
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrapevineConfig {
    /// IP address the listener binds to
    pub bind_ip: IpAddr,
    /// IP address put in our contact; defaults to `bind_ip`, and must be
    /// set when that is unspecified (`0.0.0.0` or `::`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_ip: Option<IpAddr>,
    /// First port to try; `0` lets the OS pick
    pub port: u16,
    /// How many consecutive ports to probe when `port` is taken
    pub port_search_limit: u16,
    pub gossip_interval_ms: u64,
    pub monger_ttl_secs: u64,
    pub rumor_ttl_secs: u64,
    pub client_ttl_secs: u64,
    pub request_timeout_ms: u64,
    pub max_frame_bytes: usize,
    /// Drop a monger from the known set when a gossip exchange with it fails
    pub remove_monger_on_failure: bool,
    /// Evict expired mongers at the start of each gossip cycle
    pub prune_mongers: bool,
    /// Refuse local mutations of keys owned by another role
    pub enforce_ownership: bool,
    /// Bootstrap peers as `host:port`
    pub seeds: Vec<String>,
}

impl Default for GrapevineConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            advertise_ip: None,
            port: DEFAULT_PORT,
            port_search_limit: 64,
            gossip_interval_ms: 5_000,
            monger_ttl_secs: 60 * 60,
            rumor_ttl_secs: 60,
            client_ttl_secs: 60,
            request_timeout_ms: 10_000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            remove_monger_on_failure: false,
            prune_mongers: true,
            enforce_ownership: false,
            seeds: Vec::new(),
        }
    }
}

impl GrapevineConfig {
    /// Config for in-process tests: OS-assigned port and a fast gossip cycle
    pub fn ephemeral() -> Self {
        Self {
            port: 0,
            gossip_interval_ms: 100,
            request_timeout_ms: 2_000,
            ..Self::default()
        }
    }

    /// Load from `path` (if given and present), then apply env overrides
    pub fn load(path: Option<&Path>) -> GrapevineResult<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> GrapevineResult<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            GrapevineError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        toml::from_str(&contents).map_err(|e| {
            GrapevineError::Config(format!("failed to parse {}: {e}", path.display()))
        })
    }

    /// IP address peers should use to reach this node
    pub fn advertised_ip(&self) -> GrapevineResult<IpAddr> {
        let ip = self.advertise_ip.unwrap_or(self.bind_ip);
        if ip.is_unspecified() {
            return Err(GrapevineError::Config(format!(
                "{ip} is not reachable by peers; set advertise_ip"
            )));
        }
        Ok(ip)
    }

    /// Render as TOML, in the same format [`GrapevineConfig::from_file`] reads
    pub fn to_toml(&self) -> GrapevineResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| GrapevineError::Config(format!("failed to render config: {e}")))
    }

    /// Apply `GRAPEVINE_*` overrides read through `lookup`
    ///
    /// Malformed values are logged and ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        if let Some(raw) = get("GRAPEVINE_BIND_IP") {
            match raw.parse() {
                Ok(ip) => self.bind_ip = ip,
                Err(err) => tracing::warn!("invalid GRAPEVINE_BIND_IP, ignoring: {err}"),
            }
        }

        if let Some(raw) = get("GRAPEVINE_ADVERTISE_IP") {
            match raw.parse() {
                Ok(ip) => self.advertise_ip = Some(ip),
                Err(err) => tracing::warn!("invalid GRAPEVINE_ADVERTISE_IP, ignoring: {err}"),
            }
        }

        if let Some(raw) = get("GRAPEVINE_PORT") {
            match raw.parse() {
                Ok(port) => self.port = port,
                Err(err) => tracing::warn!("invalid GRAPEVINE_PORT, ignoring: {err}"),
            }
        }

        if let Some(raw) = get("GRAPEVINE_GOSSIP_INTERVAL_MS") {
            match raw.parse() {
                Ok(ms) => self.gossip_interval_ms = ms,
                Err(err) => {
                    tracing::warn!("invalid GRAPEVINE_GOSSIP_INTERVAL_MS, ignoring: {err}")
                }
            }
        }

        if let Some(raw) = get("GRAPEVINE_SEEDS") {
            self.seeds = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
    }

    /// Parse `seeds`, skipping entries that are not valid addresses
    pub fn seed_addresses(&self) -> Vec<Address> {
        self.seeds
            .iter()
            .filter_map(|raw| match raw.parse::<Address>() {
                Ok(addr) => Some(addr),
                Err(err) => {
                    tracing::warn!(seed = %raw, "invalid seed address, ignoring: {err}");
                    None
                }
            })
            .collect()
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn monger_ttl(&self) -> Duration {
        Duration::from_secs(self.monger_ttl_secs)
    }

    pub fn rumor_ttl(&self) -> Duration {
        Duration::from_secs(self.rumor_ttl_secs)
    }

    pub fn client_ttl(&self) -> Duration {
        Duration::from_secs(self.client_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
