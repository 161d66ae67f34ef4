//! Decoder -> parser -> probe engine -> sink.

use crate::aggregate::{Aggregator, SharedAggregator};
use crate::error::RunError;
use crate::parser;
use crate::probe::{ProbeEngine, Transport};
use crate::sink::ResultSink;
use crate::subscription::{collect_descriptors, DecodedSources, Fetcher, Source};
use crate::types::{NodeDescriptor, RunReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Parsed candidates plus the per-source report they came from.
#[derive(Debug, Clone)]
pub struct Candidates {
    pub sources: DecodedSources,
    pub nodes: Vec<NodeDescriptor>,
}

impl Candidates {
    pub fn usable(&self) -> usize {
        self.nodes.iter().filter(|n| n.target().is_some()).count()
    }
}

pub struct Pipeline<F: Fetcher, T: Transport> {
    fetcher: F,
    engine: ProbeEngine<T>,
}

impl<F: Fetcher, T: Transport> Pipeline<F, T> {
    pub fn new(fetcher: F, engine: ProbeEngine<T>) -> Self {
        Self { fetcher, engine }
    }

    pub fn engine(&self) -> &ProbeEngine<T> {
        &self.engine
    }

    /// Resolve and parse every source. Zero descriptors across all sources is
    /// the one fatal condition of a run; a stop signal while fetching ends it
    /// with `RunError::Cancelled`.
    pub async fn resolve(&self, sources: &[Source], cancel: &CancellationToken) -> Result<Candidates, RunError> {
        let decoded = collect_descriptors(sources, &self.fetcher, &self.engine.config().fetch, cancel).await;
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        if decoded.descriptors.is_empty() {
            return Err(RunError::NoCandidates {
                sources: sources.len(),
            });
        }
        let nodes = parser::parse_all(&decoded.descriptors);
        let candidates = Candidates {
            sources: decoded,
            nodes,
        };
        info!(
            descriptors = candidates.nodes.len(),
            usable = candidates.usable(),
            "candidates resolved"
        );
        Ok(candidates)
    }

    /// Fresh aggregator sized for `candidates`.
    pub fn aggregator(&self, candidates: &Candidates) -> SharedAggregator {
        SharedAggregator::new(Aggregator::from_config(
            candidates.nodes.len() as u64,
            self.engine.config(),
        ))
    }

    pub async fn probe(
        &self,
        candidates: Candidates,
        shared: SharedAggregator,
        sink: Arc<dyn ResultSink>,
        cancel: CancellationToken,
    ) -> RunReport {
        self.engine.run(candidates.nodes, shared, sink, cancel).await
    }

    /// `resolve` then `probe` with a fresh aggregator.
    pub async fn run(
        &self,
        sources: &[Source],
        sink: Arc<dyn ResultSink>,
        cancel: CancellationToken,
    ) -> Result<RunReport, RunError> {
        let candidates = self.resolve(sources, &cancel).await?;
        let shared = self.aggregator(&candidates);
        Ok(self.probe(candidates, shared, sink, cancel).await)
    }
}

/// Log progress every `every` until `stop` fires.
pub fn spawn_progress_log(shared: SharedAggregator, every: Duration, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let s = shared.stats().await;
                    info!(
                        "progress {}/{} tested, {} available ({:.1}%)",
                        s.tested,
                        s.total,
                        s.available,
                        s.availability_percent()
                    );
                }
            }
        }
    })
}
