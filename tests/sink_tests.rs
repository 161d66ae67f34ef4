use node_probe_rs::config::TestMode;
use node_probe_rs::sink::{FileSink, OutputFormat, ResultSink};
use node_probe_rs::types::{AggregateStats, Protocol, RankedNode, RunReport};

fn report(cancelled: bool) -> RunReport {
    RunReport {
        generated_at: "2026-01-01T00:00:00Z".into(),
        cancelled,
        stats: AggregateStats {
            total: 4,
            tested: 2,
            available: 2,
            ..AggregateStats::default()
        },
        nodes: vec![
            RankedNode {
                raw_descriptor: "vless://id@1.1.1.1:443#JP-1".into(),
                display_name: "JP-1".into(),
                latency_ms: Some(42.0),
                protocol: Protocol::Vless,
                host: "1.1.1.1".into(),
                port: Some(443),
                country_tag: Some("JP".into()),
            },
            RankedNode {
                raw_descriptor: "trojan://pw@2.2.2.2:443#US-2".into(),
                display_name: "US-2".into(),
                latency_ms: Some(180.0),
                protocol: Protocol::Trojan,
                host: "2.2.2.2".into(),
                port: Some(443),
                country_tag: Some("US".into()),
            },
        ],
        unavailable: vec![],
    }
}

#[test]
fn checkpoint_and_final_use_separate_files() {
    let dir = tempfile::tempdir().unwrap();
    let sink = FileSink::new(dir.path(), OutputFormat::Txt, TestMode::Standard, 1000.0);

    sink.checkpoint(&report(false)).unwrap();
    assert!(dir.path().join("node_temp.txt").exists());
    assert!(!dir.path().join("node.txt").exists());

    sink.finish(&report(true)).unwrap();
    let text = std::fs::read_to_string(dir.path().join("node.txt")).unwrap();
    assert!(text.contains("(interrupted)"));
    assert!(text.contains("vless://id@1.1.1.1:443#JP-1"));
    assert!(!dir.path().join("node.json").exists());
    assert!(!dir.path().join("node.txt.part").exists());
}

#[test]
fn json_output_round_trips_the_report() {
    let dir = tempfile::tempdir().unwrap();
    let sink = FileSink::new(dir.path(), OutputFormat::All, TestMode::Fast, 500.0);
    sink.finish(&report(false)).unwrap();

    let raw = std::fs::read_to_string(dir.path().join("node.json")).unwrap();
    let parsed: RunReport = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed.nodes.len(), 2);
    assert_eq!(parsed.nodes[0].country_tag.as_deref(), Some("JP"));
    assert_eq!(parsed.stats.tested, 2);
    assert!(dir.path().join("node.txt").exists());
}

#[test]
fn missing_output_dir_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("out").join("run");
    let sink = FileSink::new(&nested, OutputFormat::Json, TestMode::Standard, 1000.0);
    sink.finish(&report(false)).unwrap();
    assert!(nested.join("node.json").exists());
}

#[test]
fn empty_final_list_keeps_previous_results() {
    let dir = tempfile::tempdir().unwrap();
    let previous = dir.path().join("node.txt");
    std::fs::write(&previous, "vless://id@9.9.9.9:443#kept\n").unwrap();

    let sink = FileSink::new(dir.path(), OutputFormat::All, TestMode::Standard, 1000.0);
    let mut empty = report(true);
    empty.nodes.clear();
    sink.finish(&empty).unwrap();

    assert_eq!(
        std::fs::read_to_string(&previous).unwrap(),
        "vless://id@9.9.9.9:443#kept\n"
    );
    assert!(!dir.path().join("node.json").exists());
}
