use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Process configuration, read from `RTBD_CONFIG` (default
/// `configs/rtbd.toml`). A missing file means stock defaults; a present but
/// malformed file is a startup error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RtbdConfig {
    /// Overrides the reversed-FQDN server name when non-empty.
    pub name: String,
    pub servers: ServersSection,
    pub bidders: BiddersSection,
    pub proxy: ProxySection,
    pub risk: RiskSection,
    pub segments: SegmentsSection,
    pub object_store: core_types::ObjectStoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServersSection {
    pub bid_addr: SocketAddr,
    pub proxy_addr: SocketAddr,
    pub close_timeout_secs: u64,
}

impl Default for ServersSection {
    fn default() -> Self {
        Self {
            bid_addr: "0.0.0.0:9176".parse().expect("default bid addr"),
            proxy_addr: "0.0.0.0:9175".parse().expect("default proxy addr"),
            close_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BiddersSection {
    pub pattern: String,
    /// Configuration sink base URL; empty disables the push.
    pub sink_url: String,
    pub namespace: String,
    pub reload_secs: u64,
}

impl Default for BiddersSection {
    fn default() -> Self {
        Self {
            pattern: "configs/bidders/*.json".to_string(),
            sink_url: String::new(),
            namespace: "bidders".to_string(),
            reload_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    pub upstreams: String,
    pub deadline_ms: u64,
    pub max_in_flight: i64,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            upstreams: String::new(),
            deadline_ms: 50,
            max_in_flight: 32,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskSection {
    pub enabled: bool,
    pub base_url: String,
    pub client_key: String,
    pub caching: bool,
    pub fields: HashMap<String, Vec<String>>,
}

impl Default for RiskSection {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://api.forensiq.com".to_string(),
            client_key: String::new(),
            caching: true,
            fields: HashMap::from([
                ("url".to_string(), path(&["site", "page"])),
                ("ip".to_string(), path(&["device", "ip"])),
                ("ua".to_string(), path(&["device", "ua"])),
                ("seller".to_string(), path(&["ext", "exchange"])),
            ]),
        }
    }
}

fn path(segments: &[&str]) -> Vec<String> {
    segments.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SegmentsSection {
    pub days: u32,
    pub cache_dir: PathBuf,
    pub refresh_secs: u64,
}

impl Default for SegmentsSection {
    fn default() -> Self {
        Self {
            days: 60,
            cache_dir: PathBuf::from("./segments"),
            refresh_secs: 900,
        }
    }
}

impl RtbdConfig {
    pub fn load() -> Result<Self> {
        let configured = std::env::var("RTBD_CONFIG").ok();
        let path = configured
            .clone()
            .unwrap_or_else(|| "configs/rtbd.toml".to_string());

        match std::fs::read_to_string(&path) {
            Ok(raw) => toml::from_str(&raw).with_context(|| format!("parse {path}")),
            // An explicitly named file must exist; the default path may not.
            Err(err) if configured.is_some() => {
                Err(err).with_context(|| format!("read {path}"))
            }
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn bidders_config(&self) -> bidder_registry::BiddersConfig {
        bidder_registry::BiddersConfig {
            pattern: self.bidders.pattern.clone(),
            sink_url: (!self.bidders.sink_url.is_empty()).then(|| self.bidders.sink_url.clone()),
            namespace: self.bidders.namespace.clone(),
            reload_period: Duration::from_secs(self.bidders.reload_secs),
        }
    }

    pub fn proxy_config(&self) -> vast_proxy::ProxyConfig {
        vast_proxy::ProxyConfig {
            upstreams: self.proxy.upstreams.clone(),
            deadline: Duration::from_millis(self.proxy.deadline_ms),
            max_in_flight: self.proxy.max_in_flight,
        }
    }

    pub fn risk_config(&self) -> risk_engine::RiskConfig {
        risk_engine::RiskConfig {
            base_url: self.risk.base_url.clone(),
            client_key: self.risk.client_key.clone(),
            fields: self.risk.fields.clone(),
            caching: self.risk.caching,
            ..risk_engine::RiskConfig::default()
        }
    }

    #[cfg(feature = "segment-filter")]
    pub fn segments_config(&self) -> segment_cache::SegmentCacheConfig {
        segment_cache::SegmentCacheConfig {
            days: self.segments.days,
            cache_dir: self.segments.cache_dir.clone(),
            refresh_period: Duration::from_secs(self.segments.refresh_secs),
        }
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.servers.close_timeout_secs)
    }
}
