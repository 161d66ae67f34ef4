use std::sync::Arc;
use std::time::Duration;

use node_probe_rs::aggregate::{Aggregator, SharedAggregator};
use node_probe_rs::config::{RunConfig, TestMode};
use node_probe_rs::error::{HandshakeError, NetworkError};
use node_probe_rs::parser::parse;
use node_probe_rs::probe::{ProbeEngine, TcpTransport, Transport};
use node_probe_rs::sink::MemorySink;
use node_probe_rs::types::NodeDescriptor;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn local_config() -> RunConfig {
    RunConfig {
        timeout_secs: 1.0,
        max_workers: 4,
        max_latency_ms: 1000.0,
        ping_count: 2,
        test_mode: TestMode::Standard,
        ..RunConfig::default()
    }
}

/// Accepts and immediately drops every connection.
async fn plain_listener() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });
    port
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn local(port: u16, name: &str) -> NodeDescriptor {
    parse(&format!("trojan://pw@127.0.0.1:{port}#{name}"))
}

async fn run_with<T: Transport>(
    transport: T,
    config: RunConfig,
    descriptors: Vec<NodeDescriptor>,
    cancel: CancellationToken,
) -> (node_probe_rs::types::RunReport, Arc<MemorySink>) {
    let shared = SharedAggregator::new(Aggregator::from_config(descriptors.len() as u64, &config));
    let sink = Arc::new(MemorySink::new());
    let report = ProbeEngine::new(transport, config)
        .run(descriptors, shared, sink.clone(), cancel)
        .await;
    (report, sink)
}

#[tokio::test]
async fn open_port_is_available_and_closed_port_is_not() {
    let open = plain_listener().await;
    let closed = closed_port().await;
    let transport = TcpTransport::new().unwrap();

    let (report, sink) = run_with(
        transport,
        local_config(),
        vec![local(open, "open"), local(closed, "closed")],
        CancellationToken::new(),
    )
    .await;

    assert_eq!(report.stats.tested, 2);
    assert_eq!(report.stats.available, 1);
    assert_eq!(report.nodes.len(), 1);
    assert_eq!(report.nodes[0].display_name, "open");
    let latency = report.nodes[0].latency_ms.unwrap();
    assert!(latency >= 0.0 && latency <= 1000.0);
    assert_eq!(sink.last().map(|r| r.stats.tested), Some(2));
}

#[tokio::test]
async fn tls_gate_rejects_plain_tcp_on_handshake_port() {
    let port = plain_listener().await;
    let transport = TcpTransport::new().unwrap();

    let gated = RunConfig {
        handshake_ports: vec![port],
        ..local_config()
    };
    let (report, _) = run_with(
        transport.clone(),
        gated,
        vec![local(port, "gated")],
        CancellationToken::new(),
    )
    .await;
    assert_eq!(report.stats.available, 0);
    assert_eq!(report.stats.latency_samples, 1);

    let fast = RunConfig {
        handshake_ports: vec![port],
        test_mode: TestMode::Fast,
        ..local_config()
    };
    let (report, _) = run_with(transport, fast, vec![local(port, "fast")], CancellationToken::new()).await;
    assert_eq!(report.stats.available, 1);
}

/// `fast.*` hosts answer in a few ms; anything else hangs.
struct SplitTransport;

impl Transport for SplitTransport {
    async fn connect(&self, host: &str, _port: u16, _timeout: Duration) -> Result<Duration, NetworkError> {
        if host.starts_with("fast") {
            Ok(Duration::from_millis(5))
        } else {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(NetworkError::Timeout(30_000))
        }
    }

    async fn handshake(&self, _host: &str, _port: u16, _sni: &str, _timeout: Duration) -> Result<(), HandshakeError> {
        Ok(())
    }
}

fn named(host: &str) -> NodeDescriptor {
    parse(&format!("vless://id@{host}:8080#{host}"))
}

#[tokio::test]
async fn cancellation_keeps_partial_results_and_flushes() {
    let config = RunConfig {
        timeout_secs: 0.2,
        max_workers: 2,
        ..local_config()
    };
    let descriptors = vec![
        named("fast-a.test"),
        named("fast-b.test"),
        named("fast-c.test"),
        named("slow-a.test"),
        named("slow-b.test"),
        named("slow-c.test"),
    ];
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let (report, sink) = tokio::time::timeout(
        Duration::from_secs(10),
        run_with(SplitTransport, config, descriptors, cancel),
    )
    .await
    .expect("run must stop promptly after cancel");

    assert!(report.cancelled);
    assert_eq!(report.stats.total, 6);
    assert_eq!(report.nodes.len(), 3);
    assert!(report.nodes.iter().all(|n| n.display_name.starts_with("fast")));
    // Two slow units were in flight; the third was never dispatched.
    assert_eq!(report.stats.tested, 5);
    assert_eq!(report.stats.tested, report.stats.available + report.stats.unavailable);
    let flushed = sink.last().expect("final report flushed");
    assert!(flushed.cancelled);
    assert_eq!(flushed.nodes.len(), 3);
}

#[tokio::test]
async fn checkpoints_fire_every_save_interval() {
    let config = RunConfig {
        save_interval: 2,
        ..local_config()
    };
    let descriptors = (0..5).map(|i| named(&format!("fast-{i}.test"))).collect();
    let (report, sink) = run_with(SplitTransport, config, descriptors, CancellationToken::new()).await;

    assert_eq!(report.nodes.len(), 5);
    let sizes: Vec<_> = sink.checkpoints().iter().map(|r| r.nodes.len()).collect();
    // A checkpoint overtaken by a newer one is skipped; the newest always lands.
    assert_eq!(sizes.last(), Some(&4));
    assert!(sizes.iter().all(|n| n % 2 == 0));
    assert!(sizes.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn ranking_is_ascending_and_unique() {
    let (report, _) = run_with(
        SplitTransport,
        local_config(),
        (0..8).map(|i| named(&format!("fast-{i}.test"))).collect(),
        CancellationToken::new(),
    )
    .await;
    let names: Vec<_> = report.nodes.iter().map(|n| n.display_name.clone()).collect();
    // Equal latencies: dispatch order decides.
    let expected: Vec<_> = (0..8).map(|i| format!("fast-{i}.test")).collect();
    assert_eq!(names, expected);
}

#[tokio::test]
async fn interrupted_empty_run_leaves_previous_node_file() {
    use node_probe_rs::sink::{FileSink, OutputFormat};

    let dir = tempfile::tempdir().unwrap();
    let previous = dir.path().join("node.txt");
    std::fs::write(&previous, "vless://id@9.9.9.9:443#kept\n").unwrap();

    let config = local_config();
    let shared = SharedAggregator::new(Aggregator::from_config(1, &config));
    let sink = Arc::new(FileSink::new(dir.path(), OutputFormat::Txt, config.test_mode, config.max_latency_ms));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = ProbeEngine::new(SplitTransport, config)
        .run(vec![named("fast-a.test")], shared, sink, cancel)
        .await;

    assert!(report.cancelled);
    assert!(report.nodes.is_empty());
    let kept = std::fs::read_to_string(&previous).unwrap();
    assert_eq!(kept, "vless://id@9.9.9.9:443#kept\n");
}
