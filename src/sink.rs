use crate::config::TestMode;
use crate::types::RunReport;
use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Receives ranked results: intermediate checkpoints while probing, then
/// exactly one final report (also after cancellation).
pub trait ResultSink: Send + Sync {
    fn checkpoint(&self, report: &RunReport) -> Result<()>;
    fn finish(&self, report: &RunReport) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Raw descriptors grouped by latency band.
    #[default]
    Txt,
    /// Pretty JSON of the full report.
    Json,
    All,
}

const LATENCY_BANDS: &[(f64, f64, &str)] = &[
    (0.0, 50.0, "0-50ms"),
    (50.0, 100.0, "50-100ms"),
    (100.0, 200.0, "100-200ms"),
    (200.0, 300.0, "200-300ms"),
    (300.0, 500.0, "300-500ms"),
    (500.0, f64::INFINITY, "500ms+"),
];

/// Writes `node_temp.*` on checkpoints and `node.*` at the end.
#[derive(Debug, Clone)]
pub struct FileSink {
    dir: PathBuf,
    format: OutputFormat,
    test_mode: TestMode,
    max_latency_ms: f64,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>, format: OutputFormat, test_mode: TestMode, max_latency_ms: f64) -> Self {
        Self {
            dir: dir.into(),
            format,
            test_mode,
            max_latency_ms,
        }
    }

    fn write(&self, stem: &str, report: &RunReport) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create output dir: {}", self.dir.display()))?;
        if matches!(self.format, OutputFormat::Txt | OutputFormat::All) {
            let text = render_txt(report, self.test_mode, self.max_latency_ms);
            write_replace(&self.dir.join(format!("{stem}.txt")), text.as_bytes())?;
        }
        if matches!(self.format, OutputFormat::Json | OutputFormat::All) {
            let json = serde_json::to_vec_pretty(report)?;
            write_replace(&self.dir.join(format!("{stem}.json")), &json)?;
        }
        Ok(())
    }
}

impl ResultSink for FileSink {
    fn checkpoint(&self, report: &RunReport) -> Result<()> {
        self.write("node_temp", report)?;
        info!(nodes = report.nodes.len(), "checkpoint written");
        Ok(())
    }

    /// An empty final list leaves any previous `node.*` in place.
    fn finish(&self, report: &RunReport) -> Result<()> {
        if report.nodes.is_empty() {
            warn!(
                dir = %self.dir.display(),
                cancelled = report.cancelled,
                "no available nodes, keeping previous results"
            );
            return Ok(());
        }
        self.write("node", report)?;
        info!(
            nodes = report.nodes.len(),
            dir = %self.dir.display(),
            "results written"
        );
        Ok(())
    }
}

/// Write through a sibling `.part` file so readers never see a torn file.
fn write_replace(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut part = path.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);
    fs::write(&part, bytes).with_context(|| format!("failed to write {}", part.display()))?;
    fs::rename(&part, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Plain-text result list: a comment header, then nodes grouped by latency
/// band, each raw descriptor preceded by a `# name - NNms` line.
pub fn render_txt(report: &RunReport, mode: TestMode, max_latency_ms: f64) -> String {
    let s = &report.stats;
    let mut out = String::new();
    let _ = writeln!(out, "# available nodes: {}", report.nodes.len());
    let _ = writeln!(out, "# generated at: {}", report.generated_at);
    let _ = writeln!(
        out,
        "# tested {} of {}, available {}{}",
        s.tested,
        s.total,
        s.available,
        if report.cancelled { " (interrupted)" } else { "" }
    );
    let _ = writeln!(out, "# test mode: {}, max latency: {:.0}ms", mode.as_str(), max_latency_ms);
    out.push('#');
    out.push_str(&"=".repeat(50));
    out.push_str("\n\n");

    for (lo, hi, label) in LATENCY_BANDS {
        let band: Vec<_> = report
            .nodes
            .iter()
            .filter(|n| n.latency_ms.is_some_and(|l| l >= *lo && l < *hi))
            .collect();
        if band.is_empty() {
            continue;
        }
        let _ = writeln!(out, "# {label} - {} node(s)", band.len());
        for node in band {
            let _ = writeln!(out, "# {} - {:.0}ms", node.label(), node.latency_ms.unwrap_or(0.0));
            let _ = writeln!(out, "{}", node.raw_descriptor);
        }
        out.push('\n');
    }
    out
}

/// Keeps every report in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    checkpoints: Mutex<Vec<RunReport>>,
    last: Mutex<Option<RunReport>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoints(&self) -> Vec<RunReport> {
        self.checkpoints.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn last(&self) -> Option<RunReport> {
        self.last.lock().ok().and_then(|g| g.clone())
    }
}

impl ResultSink for MemorySink {
    fn checkpoint(&self, report: &RunReport) -> Result<()> {
        self.checkpoints
            .lock()
            .map_err(|_| anyhow::anyhow!("memory sink poisoned"))?
            .push(report.clone());
        Ok(())
    }

    fn finish(&self, report: &RunReport) -> Result<()> {
        *self
            .last
            .lock()
            .map_err(|_| anyhow::anyhow!("memory sink poisoned"))? = Some(report.clone());
        Ok(())
    }
}
