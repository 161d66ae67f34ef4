use std::sync::Arc;
use std::time::Duration;

use node_probe_rs::config::{FetchConfig, RunConfig};
use node_probe_rs::error::{FetchError, HandshakeError, NetworkError, RunError};
use node_probe_rs::pipeline::Pipeline;
use node_probe_rs::probe::{ProbeEngine, Transport};
use node_probe_rs::sink::MemorySink;
use node_probe_rs::subscription::{Fetcher, Source};
use tokio_util::sync::CancellationToken;

struct Offline;

impl Fetcher for Offline {
    async fn fetch(&self, _url: &str) -> Result<String, FetchError> {
        Err(FetchError::Other("offline".into()))
    }
}

/// Every host answers in 10ms.
struct Instant10;

impl Transport for Instant10 {
    async fn connect(&self, _host: &str, _port: u16, _timeout: Duration) -> Result<Duration, NetworkError> {
        Ok(Duration::from_millis(10))
    }

    async fn handshake(&self, _host: &str, _port: u16, _sni: &str, _timeout: Duration) -> Result<(), HandshakeError> {
        Ok(())
    }
}

fn config() -> RunConfig {
    RunConfig {
        max_workers: 4,
        fetch: FetchConfig {
            retries: 2,
            retry_base_delay_ms: 1,
            ..FetchConfig::default()
        },
        ..RunConfig::default()
    }
}

#[tokio::test]
async fn no_descriptors_anywhere_is_fatal() {
    let pipeline = Pipeline::new(Offline, ProbeEngine::new(Instant10, config()));
    let sources = vec![
        Source::Remote("https://a.example/sub".into()),
        Source::Inline("# only a comment".into()),
    ];
    let err = pipeline
        .run(&sources, Arc::new(MemorySink::new()), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::NoCandidates { sources: 2 }));
}

#[tokio::test]
async fn inline_sources_flow_through_to_the_sink() {
    let pipeline = Pipeline::new(Offline, ProbeEngine::new(Instant10, config()));
    let sources = vec![
        Source::Remote("https://dead.example/sub".into()),
        Source::Inline("trojan://pw@1.2.3.4:8443#JP Tokyo".into()),
        Source::Inline("not-a-descriptor".into()),
    ];
    let sink = Arc::new(MemorySink::new());
    let report = pipeline
        .run(&sources, sink.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.stats.total, 2);
    assert_eq!(report.stats.tested, 2);
    assert_eq!(report.nodes.len(), 1);
    assert_eq!(report.nodes[0].latency_ms, Some(10.0));
    assert_eq!(report.nodes[0].country_tag.as_deref(), Some("JP"));
    assert_eq!(report.stats.by_protocol.get("trojan"), Some(&1));
    assert!(sink.last().is_some());
}

#[tokio::test]
async fn stop_during_resolve_is_reported_as_cancelled() {
    let pipeline = Pipeline::new(Offline, ProbeEngine::new(Instant10, config()));
    let sources = vec![Source::Inline("trojan://pw@1.2.3.4:8443#JP Tokyo".into())];
    let cancel = CancellationToken::new();
    cancel.cancel();
    let sink = Arc::new(MemorySink::new());
    let err = pipeline.run(&sources, sink.clone(), cancel).await.unwrap_err();
    assert!(matches!(err, RunError::Cancelled));
    assert!(sink.last().is_none());
}
