use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Descriptor URI family.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    Hysteria2,
    Unknown,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::Hysteria2 => "hysteria2",
            Protocol::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed candidate endpoint. Never mutated after parsing.
///
/// `port` is `Some` only for a valid port in `1..=65535`; a descriptor with an
/// empty `host` or no port is unusable and never touches the network.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub protocol: Protocol,
    pub host: String,
    pub port: Option<u16>,
    pub display_name: String,
    pub country_tag: Option<String>,
    pub raw_descriptor: String,
}

impl NodeDescriptor {
    /// The record produced for anything that fails to parse.
    pub fn unusable(raw: impl Into<String>) -> Self {
        Self {
            protocol: Protocol::Unknown,
            host: String::new(),
            port: None,
            display_name: String::new(),
            country_tag: None,
            raw_descriptor: raw.into(),
        }
    }

    /// Returns the probe target when both host and port are usable.
    pub fn target(&self) -> Option<(&str, u16)> {
        match self.port {
            Some(port) if port > 0 && !self.host.is_empty() => Some((self.host.as_str(), port)),
            _ => None,
        }
    }

    /// Display name, or `host:port` when the descriptor carries none.
    pub fn label(&self) -> String {
        if !self.display_name.is_empty() {
            return self.display_name.clone();
        }
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }
}

/// Outcome of probing one descriptor. Created once by the probe engine.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub descriptor: Arc<NodeDescriptor>,
    /// Dispatch position; the deterministic tie-break for equal latencies.
    pub seq: usize,
    pub latency_ms: Option<f64>,
    pub available: bool,
}

impl ProbeResult {
    pub fn unavailable(descriptor: Arc<NodeDescriptor>, seq: usize) -> Self {
        Self {
            descriptor,
            seq,
            latency_ms: None,
            available: false,
        }
    }
}

/// What the sink receives for each accepted node, in rank order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RankedNode {
    pub raw_descriptor: String,
    pub display_name: String,
    pub latency_ms: Option<f64>,
    pub protocol: Protocol,
    pub host: String,
    pub port: Option<u16>,
    pub country_tag: Option<String>,
}

impl From<&ProbeResult> for RankedNode {
    fn from(r: &ProbeResult) -> Self {
        let d = &r.descriptor;
        Self {
            raw_descriptor: d.raw_descriptor.clone(),
            display_name: d.display_name.clone(),
            latency_ms: r.latency_ms,
            protocol: d.protocol,
            host: d.host.clone(),
            port: d.port,
            country_tag: d.country_tag.clone(),
        }
    }
}

impl RankedNode {
    pub fn label(&self) -> String {
        if !self.display_name.is_empty() {
            return self.display_name.clone();
        }
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }
}

/// Running counters and latency statistics.
///
/// `tested == available + unavailable` after every update. The latency fields
/// only cover results that carried a latency (`latency_samples` of them).
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AggregateStats {
    pub total: u64,
    pub tested: u64,
    pub available: u64,
    pub unavailable: u64,
    pub latency_samples: u64,
    pub mean_latency_ms: Option<f64>,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub by_protocol: BTreeMap<String, u64>,
    pub by_country: BTreeMap<String, u64>,
}

impl AggregateStats {
    pub fn availability_percent(&self) -> f64 {
        if self.tested == 0 {
            return 0.0;
        }
        self.available as f64 * 100.0 / self.tested as f64
    }
}

/// Snapshot handed to the sink on checkpoints and at the end of a run.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RunReport {
    pub generated_at: String,
    pub cancelled: bool,
    pub stats: AggregateStats,
    pub nodes: Vec<RankedNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unavailable: Vec<RankedNode>,
}
