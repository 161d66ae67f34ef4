use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use sysinfo::System;

/// Upper bound for any configured timeout, in seconds.
pub const MAX_TIMEOUT_SECS: f64 = 3600.0;
pub const MAX_PING_COUNT: u32 = 100;

/// Ports that get the TLS handshake gate in `standard` and `deep` mode.
pub const DEFAULT_HANDSHAKE_PORTS: &[u16] = &[443, 2053, 2083, 2087, 2096, 8443];

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// How deep each probe goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TestMode {
    /// TCP latency only.
    Fast,
    /// TCP latency plus the TLS gate on handshake ports.
    #[default]
    Standard,
    Deep,
}

impl TestMode {
    pub fn requires_handshake(&self) -> bool {
        matches!(self, TestMode::Standard | TestMode::Deep)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestMode::Fast => "fast",
            TestMode::Standard => "standard",
            TestMode::Deep => "deep",
        }
    }
}

/// Remote subscription retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: f64,
    /// Total attempts per source, including the first.
    pub retries: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub retry_base_delay_ms: u64,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10.0,
            retries: 3,
            retry_base_delay_ms: 1000,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        bounded_secs(self.timeout_secs)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Process-wide, read-only run settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Bound on each connect or handshake attempt, in seconds.
    pub timeout_secs: f64,
    pub max_workers: usize,
    /// Availability ceiling in milliseconds.
    pub max_latency_ms: f64,
    pub ping_count: u32,
    pub test_mode: TestMode,
    /// SNI presented during the TLS gate.
    pub handshake_host: String,
    pub handshake_ports: Vec<u16>,
    /// Checkpoint after this many accepted results.
    pub save_interval: usize,
    pub retain_unavailable: bool,
    pub fetch: FetchConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 5.0,
            max_workers: optimal_workers(&SystemResources),
            max_latency_ms: 1000.0,
            ping_count: 3,
            test_mode: TestMode::Standard,
            handshake_host: "www.google.com".to_string(),
            handshake_ports: DEFAULT_HANDSHAKE_PORTS.to_vec(),
            save_interval: 5000,
            retain_unavailable: false,
            fetch: FetchConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn timeout(&self) -> Duration {
        bounded_secs(self.timeout_secs)
    }

    /// Whether `port` goes through the TLS gate under the current mode.
    pub fn handshake_required(&self, port: u16) -> bool {
        self.test_mode.requires_handshake() && self.handshake_ports.contains(&port)
    }

    /// Upper bound for one probe unit: every sample, the handshake, and
    /// `2 × timeout` of slack.
    pub fn unit_deadline(&self) -> Duration {
        self.timeout()
            .saturating_mul(self.ping_count.saturating_add(1))
            .saturating_add(self.drain_grace())
    }

    /// How long outstanding units may keep running after a stop signal.
    pub fn drain_grace(&self) -> Duration {
        self.timeout().saturating_mul(2)
    }

    /// Load from a TOML file; missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::load_from_str(&s)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> Result<Self> {
        let config: RunConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.timeout_secs.is_finite() && self.timeout_secs > 0.0 && self.timeout_secs <= MAX_TIMEOUT_SECS,
            "timeout_secs must be in (0, {MAX_TIMEOUT_SECS}], got {}",
            self.timeout_secs
        );
        anyhow::ensure!(
            self.max_workers > 0,
            "max_workers must be > 0, got {}",
            self.max_workers
        );
        anyhow::ensure!(
            self.max_latency_ms.is_finite() && self.max_latency_ms > 0.0,
            "max_latency_ms must be > 0, got {}",
            self.max_latency_ms
        );
        anyhow::ensure!(
            self.ping_count > 0 && self.ping_count <= MAX_PING_COUNT,
            "ping_count must be in 1..={MAX_PING_COUNT}, got {}",
            self.ping_count
        );
        anyhow::ensure!(
            !self.handshake_host.trim().is_empty(),
            "handshake_host must be non-empty"
        );
        anyhow::ensure!(
            !self.handshake_ports.contains(&0),
            "handshake_ports must not contain port 0"
        );
        anyhow::ensure!(
            self.save_interval > 0,
            "save_interval must be > 0, got {}",
            self.save_interval
        );
        anyhow::ensure!(
            self.fetch.retries > 0,
            "fetch.retries must be > 0, got {}",
            self.fetch.retries
        );
        anyhow::ensure!(
            self.fetch.timeout_secs.is_finite()
                && self.fetch.timeout_secs > 0.0
                && self.fetch.timeout_secs <= MAX_TIMEOUT_SECS,
            "fetch.timeout_secs must be in (0, {MAX_TIMEOUT_SECS}], got {}",
            self.fetch.timeout_secs
        );
        anyhow::ensure!(
            self.fetch.retries <= MAX_PING_COUNT,
            "fetch.retries must be <= {MAX_PING_COUNT}, got {}",
            self.fetch.retries
        );
        Ok(())
    }
}

/// Seconds to a `Duration`, clamped to `[0, MAX_TIMEOUT_SECS]`.
fn bounded_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.min(MAX_TIMEOUT_SECS)).unwrap_or(Duration::ZERO)
}

/// Host capabilities consulted when sizing the worker pool.
pub trait ResourceProbe {
    fn cpu_count(&self) -> usize;

    /// Bytes of free memory, if the platform can tell.
    fn available_memory_bytes(&self) -> Option<u64> {
        None
    }
}

/// Live host figures: logical CPUs from the OS, free memory from `sysinfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResources;

impl ResourceProbe for SystemResources {
    fn cpu_count(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
    }

    fn available_memory_bytes(&self) -> Option<u64> {
        let mut sys = System::new();
        sys.refresh_memory();
        Some(sys.available_memory()).filter(|&bytes| bytes > 0)
    }
}

/// Pool size heuristic: `min(cpus × 5, free GiB × 1024 / 10, 100)`, at least 4.
pub fn optimal_workers(resources: &dyn ResourceProbe) -> usize {
    let by_cpu = resources.cpu_count().saturating_mul(5);
    let by_memory = resources
        .available_memory_bytes()
        .map(|bytes| (bytes / (1024 * 1024 * 1024)).saturating_mul(1024) / 10)
        .map(|n| n as usize)
        .unwrap_or(usize::MAX);
    by_cpu.min(by_memory).min(100).max(4)
}
