use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use node_probe_rs::config::{RunConfig, TestMode};
use node_probe_rs::error::RunError;
use node_probe_rs::pipeline::{spawn_progress_log, Pipeline};
use node_probe_rs::probe::{cancel_on_interrupt, ProbeEngine, TcpTransport};
use node_probe_rs::server::{self, AppState, RunPhase};
use node_probe_rs::sink::{FileSink, OutputFormat};
use node_probe_rs::subscription::{load_source_list, DecodedSources, HttpFetcher};
use node_probe_rs::types::RunReport;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// node-probe-rs — rank proxy subscription nodes by TCP reachability and latency.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "node-probe-rs",
    version,
    about = "Rank proxy subscription nodes by TCP reachability and latency.",
    long_about = None
)]
struct Cli {
    /// Subscription list: one URL, base64 blob or descriptor per line.
    #[arg(short, long, default_value = "subscribe.txt")]
    file: PathBuf,

    /// Optional TOML config; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Per-attempt connect timeout in seconds.
    #[arg(short, long)]
    timeout: Option<f64>,

    /// Max concurrent probes (default: sized from the host).
    #[arg(short, long)]
    workers: Option<usize>,

    /// Availability ceiling in milliseconds.
    #[arg(short = 'l', long = "max-latency")]
    max_latency: Option<f64>,

    /// Connect samples per node.
    #[arg(long = "ping-count")]
    ping_count: Option<u32>,

    /// fast: TCP only; standard/deep: also TLS-gate handshake ports.
    #[arg(short, long, value_enum)]
    mode: Option<TestMode>,

    /// SNI used for the TLS gate.
    #[arg(long = "handshake-host")]
    handshake_host: Option<String>,

    /// Write a checkpoint every N accepted nodes.
    #[arg(long = "save-interval")]
    save_interval: Option<usize>,

    /// Keep unavailable nodes in the JSON report.
    #[arg(long = "retain-unavailable", default_value_t = false)]
    retain_unavailable: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Txt)]
    format: OutputFormat,

    /// Directory for node.txt / node.json and checkpoints.
    #[arg(short, long = "output-dir", default_value = ".")]
    output_dir: PathBuf,

    /// Serve a live status API on this address (e.g. 127.0.0.1:8080).
    #[arg(long = "serve-status")]
    serve_status: Option<String>,
}

impl Cli {
    fn run_config(&self) -> Result<RunConfig> {
        let mut cfg = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig::default(),
        };
        if let Some(v) = self.timeout {
            cfg.timeout_secs = v;
        }
        if let Some(v) = self.workers {
            cfg.max_workers = v;
        }
        if let Some(v) = self.max_latency {
            cfg.max_latency_ms = v;
        }
        if let Some(v) = self.ping_count {
            cfg.ping_count = v;
        }
        if let Some(v) = self.mode {
            cfg.test_mode = v;
        }
        if let Some(v) = &self.handshake_host {
            cfg.handshake_host = v.clone();
        }
        if let Some(v) = self.save_interval {
            cfg.save_interval = v;
        }
        if self.retain_unavailable {
            cfg.retain_unavailable = true;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = cli.run_config()?;

    println!("node-probe-rs configuration:");
    println!("  file         : {}", cli.file.display());
    println!("  timeout      : {}s", config.timeout_secs);
    println!("  workers      : {}", config.max_workers);
    println!("  max_latency  : {}ms", config.max_latency_ms);
    println!("  ping_count   : {}", config.ping_count);
    println!("  mode         : {}", config.test_mode.as_str());
    println!("  output       : {}", cli.output_dir.display());

    if !cli.file.exists() {
        write_template(&cli.file)?;
        println!(
            "Created {}; add subscription links to it and run again.",
            cli.file.display()
        );
        return Ok(());
    }
    let sources = load_source_list(&cli.file)?;

    let cancel = CancellationToken::new();
    let _interrupt = cancel_on_interrupt(cancel.clone());

    let fetcher = HttpFetcher::new(&config.fetch)?;
    let transport = TcpTransport::new().context("failed to initialise TLS connector")?;
    let sink = Arc::new(FileSink::new(
        &cli.output_dir,
        cli.format,
        config.test_mode,
        config.max_latency_ms,
    ));
    let pipeline = Pipeline::new(fetcher, ProbeEngine::new(transport, config));

    let started = Instant::now();
    let candidates = match pipeline.resolve(&sources, &cancel).await {
        Ok(candidates) => candidates,
        Err(RunError::Cancelled) => {
            println!("Interrupted while fetching subscriptions; nothing was probed.");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let valid = candidates.sources.valid_sources().count();
    println!(
        "Resolved {} unique descriptors ({} usable) from {}/{} sources",
        candidates.nodes.len(),
        candidates.usable(),
        valid,
        sources.len()
    );
    print_failed_sources(&candidates.sources);

    let shared = pipeline.aggregator(&candidates);
    let app_state = AppState::new(shared.clone());
    if let Some(bind) = cli.serve_status.clone() {
        let state = app_state.clone();
        tokio::spawn(async move {
            if let Err(e) = server::spawn_server(&bind, state).await {
                warn!("status server error: {e}");
            }
        });
    }

    let progress_stop = CancellationToken::new();
    let progress = spawn_progress_log(shared.clone(), Duration::from_secs(5), progress_stop.clone());

    let report = pipeline.probe(candidates, shared, sink, cancel.clone()).await;

    progress_stop.cancel();
    let _ = progress.await;
    app_state
        .set_phase(if report.cancelled {
            RunPhase::Cancelled
        } else {
            RunPhase::Done
        })
        .await;

    print_summary(&report, started.elapsed());
    Ok(())
}

fn write_template(path: &Path) -> Result<()> {
    let template = "# Add subscription sources here, one per line.\n\
                    # Lines starting with # are ignored.\n\
                    # Accepted: https:// subscription URLs, base64 blobs, or single\n\
                    # vmess:// vless:// trojan:// ss:// hysteria2:// hy2:// descriptors.\n";
    std::fs::write(path, template)
        .with_context(|| format!("failed to create {}", path.display()))
}

fn print_failed_sources(decoded: &DecodedSources) {
    let failed: Vec<_> = decoded.failed_sources().collect();
    if failed.is_empty() {
        return;
    }
    println!("{} source(s) gave no nodes:", failed.len());
    for report in failed {
        let source: String = report.source.chars().take(80).collect();
        match &report.error {
            Some(e) => println!("  {source}  ({e})"),
            None => println!("  {source}  (empty)"),
        }
    }
}

fn print_summary(report: &RunReport, elapsed: Duration) {
    let s = &report.stats;
    println!();
    if report.cancelled {
        println!("Interrupted; results collected so far were saved.");
    }
    println!("Total nodes  : {}", s.total);
    println!("Tested       : {}", s.tested);
    println!(
        "Available    : {} ({:.1}%)",
        s.available,
        s.availability_percent()
    );
    println!("Unavailable  : {}", s.unavailable);
    println!("Elapsed      : {:.1}s", elapsed.as_secs_f64());
    if let (Some(mean), Some(min), Some(max)) = (s.mean_latency_ms, s.min_latency_ms, s.max_latency_ms) {
        println!("Latency      : mean {mean:.0}ms, min {min:.0}ms, max {max:.0}ms");
    }

    if report.nodes.is_empty() {
        return;
    }
    let top: Vec<_> = report.nodes.iter().take(10).collect();
    let name_w = top
        .iter()
        .map(|n| n.label().chars().count().min(30))
        .max()
        .unwrap_or(4)
        .max("name".len());
    let country_w = "region".len();
    let lat_w = "latency_ms".len();

    println!("\nFastest {} node(s):", top.len());
    println!(
        "{:>2}  {:<name_w$}  {:<country_w$}  {:>lat_w$}",
        "#",
        "name",
        "region",
        "latency_ms",
        name_w = name_w,
        country_w = country_w,
        lat_w = lat_w
    );
    println!(
        "{:-<2}  {:-<name_w$}  {:-<country_w$}  {:-<lat_w$}",
        "",
        "",
        "",
        "",
        name_w = name_w,
        country_w = country_w,
        lat_w = lat_w
    );
    for (i, n) in top.iter().enumerate() {
        let name: String = n.label().chars().take(30).collect();
        println!(
            "{:>2}  {:<name_w$}  {:<country_w$}  {:>lat_w$.0}",
            i + 1,
            name,
            n.country_tag.as_deref().unwrap_or("-"),
            n.latency_ms.unwrap_or(0.0),
            name_w = name_w,
            country_w = country_w,
            lat_w = lat_w
        );
    }
}
