use crate::config::RunConfig;
use crate::sink::ResultSink;
use crate::types::{AggregateStats, ProbeResult, RankedNode, RunReport};
use std::sync::{Arc, Mutex as StdMutex};
use time::{format_description::well_known, OffsetDateTime};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What happened to one recorded result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    pub accepted: bool,
    /// The accepted set just reached a multiple of `save_interval`.
    pub checkpoint_due: bool,
}

/// Folds probe results into running statistics and the accepted set.
///
/// The final order depends only on the recorded results, not on the order
/// they arrived in: nodes are ranked by latency, ties by dispatch sequence.
#[derive(Debug)]
pub struct Aggregator {
    stats: AggregateStats,
    accepted: Vec<ProbeResult>,
    rejected: Vec<ProbeResult>,
    retain_unavailable: bool,
    save_interval: usize,
}

impl Aggregator {
    pub fn new(total: u64, retain_unavailable: bool, save_interval: usize) -> Self {
        Self {
            stats: AggregateStats {
                total,
                ..AggregateStats::default()
            },
            accepted: Vec::new(),
            rejected: Vec::new(),
            retain_unavailable,
            save_interval: save_interval.max(1),
        }
    }

    pub fn from_config(total: u64, cfg: &RunConfig) -> Self {
        Self::new(total, cfg.retain_unavailable, cfg.save_interval)
    }

    pub fn record(&mut self, result: ProbeResult) -> RecordOutcome {
        let s = &mut self.stats;
        s.tested += 1;

        let d = &result.descriptor;
        *s.by_protocol.entry(d.protocol.to_string()).or_insert(0) += 1;
        if let Some(tag) = &d.country_tag {
            *s.by_country.entry(tag.clone()).or_insert(0) += 1;
        }

        if let Some(latency) = result.latency_ms {
            s.latency_samples += 1;
            let mean = s.mean_latency_ms.unwrap_or(0.0);
            s.mean_latency_ms = Some(mean + (latency - mean) / s.latency_samples as f64);
            s.min_latency_ms = Some(s.min_latency_ms.map_or(latency, |m| m.min(latency)));
            s.max_latency_ms = Some(s.max_latency_ms.map_or(latency, |m| m.max(latency)));
        }

        if result.available && result.latency_ms.is_some() {
            s.available += 1;
            self.accepted.push(result);
            RecordOutcome {
                accepted: true,
                checkpoint_due: self.accepted.len() % self.save_interval == 0,
            }
        } else {
            s.unavailable += 1;
            if self.retain_unavailable {
                self.rejected.push(result);
            }
            RecordOutcome {
                accepted: false,
                checkpoint_due: false,
            }
        }
    }

    pub fn stats(&self) -> &AggregateStats {
        &self.stats
    }

    pub fn accepted_len(&self) -> usize {
        self.accepted.len()
    }

    /// Accepted nodes, fastest first.
    pub fn ranked(&self) -> Vec<RankedNode> {
        rank(&self.accepted).into_iter().map(RankedNode::from).collect()
    }

    pub fn report(&self, cancelled: bool) -> RunReport {
        RunReport {
            generated_at: now_rfc3339(),
            cancelled,
            stats: self.stats.clone(),
            nodes: self.ranked(),
            unavailable: self.rejected.iter().map(RankedNode::from).collect(),
        }
    }
}

/// Stable ascending sort by latency with dispatch sequence as tie-break.
pub fn rank(results: &[ProbeResult]) -> Vec<&ProbeResult> {
    let mut out: Vec<&ProbeResult> = results.iter().collect();
    out.sort_by(|a, b| {
        let la = a.latency_ms.unwrap_or(f64::INFINITY);
        let lb = b.latency_ms.unwrap_or(f64::INFINITY);
        la.total_cmp(&lb).then_with(|| a.seq.cmp(&b.seq))
    });
    out
}

/// Cloneable handle; every mutation and snapshot goes through its lock.
#[derive(Clone, Debug)]
pub struct SharedAggregator {
    inner: Arc<Mutex<Aggregator>>,
    /// Accepted count of the newest checkpoint written so far.
    checkpointed: Arc<StdMutex<usize>>,
}

impl SharedAggregator {
    pub fn new(aggregator: Aggregator) -> Self {
        Self {
            inner: Arc::new(Mutex::new(aggregator)),
            checkpointed: Arc::new(StdMutex::new(0)),
        }
    }

    /// Record one result. When a checkpoint is due the snapshot is taken
    /// under the lock, then written on the blocking pool after releasing it.
    pub async fn record(&self, result: ProbeResult, sink: &Arc<dyn ResultSink>) -> RecordOutcome {
        let (outcome, snapshot) = {
            let mut guard = self.inner.lock().await;
            let outcome = guard.record(result);
            let snapshot = outcome.checkpoint_due.then(|| guard.report(false));
            (outcome, snapshot)
        };
        if let Some(report) = snapshot {
            self.write_checkpoint(report, sink.clone()).await;
        }
        outcome
    }

    /// Older snapshots that lose the race to a newer one are dropped, so the
    /// checkpoint file only ever grows.
    async fn write_checkpoint(&self, report: RunReport, sink: Arc<dyn ResultSink>) {
        let checkpointed = self.checkpointed.clone();
        let accepted = report.nodes.len();
        let write = tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            let mut last = checkpointed
                .lock()
                .map_err(|_| anyhow::anyhow!("checkpoint state poisoned"))?;
            if accepted <= *last {
                return Ok(false);
            }
            sink.checkpoint(&report)?;
            *last = accepted;
            Ok(true)
        });
        match write.await {
            Ok(Ok(true)) => info!(accepted, "checkpoint"),
            Ok(Ok(false)) => debug!(accepted, "stale checkpoint skipped"),
            Ok(Err(e)) => warn!("checkpoint failed: {e:#}"),
            Err(e) => warn!("checkpoint task failed: {e}"),
        }
    }

    pub async fn stats(&self) -> AggregateStats {
        self.inner.lock().await.stats().clone()
    }

    pub async fn ranked(&self) -> Vec<RankedNode> {
        self.inner.lock().await.ranked()
    }

    pub async fn report(&self, cancelled: bool) -> RunReport {
        self.inner.lock().await.report(cancelled)
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
