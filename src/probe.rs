use crate::aggregate::SharedAggregator;
use crate::config::RunConfig;
use crate::error::{HandshakeError, NetworkError};
use crate::sink::ResultSink;
use crate::types::{NodeDescriptor, ProbeResult, RunReport};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Network operations a probe needs.
pub trait Transport: Send + Sync + 'static {
    /// Open a TCP connection and report how long it took to establish.
    fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> impl Future<Output = Result<Duration, NetworkError>> + Send;

    /// Connect and complete one TLS handshake presenting `server_name`.
    fn handshake(
        &self,
        host: &str,
        port: u16,
        server_name: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), HandshakeError>> + Send;
}

/// Real sockets. The TLS connector skips certificate and hostname checks:
/// the gate tests protocol reachability, not trust.
#[derive(Clone)]
pub struct TcpTransport {
    tls: tokio_native_tls::TlsConnector,
}

impl TcpTransport {
    pub fn new() -> Result<Self, HandshakeError> {
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()?;
        Ok(Self {
            tls: tokio_native_tls::TlsConnector::from(connector),
        })
    }
}

async fn connect_within(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, NetworkError> {
    match time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(NetworkError::Io(e)),
        Err(_) => Err(NetworkError::Timeout(timeout.as_millis() as u64)),
    }
}

impl Transport for TcpTransport {
    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<Duration, NetworkError> {
        let start = Instant::now();
        let _stream = connect_within(host, port, timeout).await?;
        Ok(start.elapsed())
    }

    async fn handshake(
        &self,
        host: &str,
        port: u16,
        server_name: &str,
        timeout: Duration,
    ) -> Result<(), HandshakeError> {
        let stream = connect_within(host, port, timeout).await?;
        match time::timeout(timeout, self.tls.connect(server_name, stream)).await {
            Ok(Ok(_tls)) => Ok(()),
            Ok(Err(e)) => Err(HandshakeError::Tls(e)),
            Err(_) => Err(HandshakeError::Timeout(timeout.as_millis() as u64)),
        }
    }
}

/// Probe one descriptor.
///
/// Takes `ping_count` sequential connect samples; failed samples are dropped
/// and latency is the mean of the rest. When the port needs the TLS gate, a
/// failed handshake makes the node unavailable whatever its latency. The stop
/// signal is checked between attempts.
pub async fn probe<T: Transport>(
    transport: &T,
    descriptor: Arc<NodeDescriptor>,
    seq: usize,
    config: &RunConfig,
    cancel: &CancellationToken,
) -> ProbeResult {
    let Some((host, port)) = descriptor.target().map(|(h, p)| (h.to_string(), p)) else {
        return ProbeResult::unavailable(descriptor, seq);
    };
    let timeout = config.timeout();

    let mut samples = Vec::with_capacity(config.ping_count as usize);
    for attempt in 0..config.ping_count {
        if attempt > 0 && cancel.is_cancelled() {
            break;
        }
        match transport.connect(&host, port, timeout).await {
            Ok(elapsed) => samples.push(elapsed.as_secs_f64() * 1000.0),
            Err(e) => debug!(%host, port, attempt, error = %e, "sample dropped"),
        }
    }

    let latency_ms = mean(&samples);
    let mut available = latency_ms.is_some_and(|l| l <= config.max_latency_ms);

    if available && config.handshake_required(port) {
        available = if cancel.is_cancelled() {
            false
        } else {
            match transport
                .handshake(&host, port, &config.handshake_host, timeout)
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    debug!(%host, port, error = %e, "handshake gate failed");
                    false
                }
            }
        };
    }

    ProbeResult {
        descriptor,
        seq,
        latency_ms,
        available,
    }
}

fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Bounded-concurrency probe runner.
pub struct ProbeEngine<T: Transport> {
    transport: Arc<T>,
    config: Arc<RunConfig>,
}

impl<T: Transport> ProbeEngine<T> {
    pub fn new(transport: T, config: RunConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Workers actually used: `max_workers`, capped to the candidate count.
    pub fn pool_size(&self, candidates: usize) -> usize {
        self.config.max_workers.min(candidates).max(1)
    }

    /// Probe every descriptor and return the final report.
    ///
    /// - Limits concurrent probes with a `Semaphore`; each unit runs one
    ///   descriptor to completion and is bounded by `unit_deadline`.
    /// - Unusable descriptors are recorded unavailable without a network attempt.
    /// - Once `cancel` fires nothing new is dispatched; outstanding units get
    ///   `drain_grace` to finish, the rest are aborted and recorded unavailable.
    /// - The final report goes to `sink` on completion and on cancellation alike.
    pub async fn run(
        &self,
        descriptors: Vec<NodeDescriptor>,
        shared: SharedAggregator,
        sink: Arc<dyn ResultSink>,
        cancel: CancellationToken,
    ) -> RunReport {
        let pool = self.pool_size(descriptors.len());
        info!(candidates = descriptors.len(), pool, "probing");

        let sem = Arc::new(Semaphore::new(pool));
        let mut set: JoinSet<usize> = JoinSet::new();
        let mut in_flight: HashMap<usize, Arc<NodeDescriptor>> = HashMap::new();

        for (seq, descriptor) in descriptors.into_iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            let descriptor = Arc::new(descriptor);
            if descriptor.target().is_none() {
                shared
                    .record(ProbeResult::unavailable(descriptor, seq), &sink)
                    .await;
                continue;
            }

            while let Some(res) = set.try_join_next() {
                reap(&mut in_flight, res);
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = sem.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            in_flight.insert(seq, descriptor.clone());
            let transport = self.transport.clone();
            let config = self.config.clone();
            let shared = shared.clone();
            let sink = sink.clone();
            let cancel = cancel.clone();

            set.spawn(async move {
                let _permit = permit; // keep permit until the unit completes

                let deadline = config.unit_deadline();
                let unit = probe(transport.as_ref(), descriptor.clone(), seq, &config, &cancel);
                let result = match time::timeout(deadline, unit).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(node = %descriptor.label(), "probe exceeded {:?}, marking unavailable", deadline);
                        ProbeResult::unavailable(descriptor, seq)
                    }
                };
                shared.record(result, &sink).await;
                seq
            });
        }

        self.drain(&mut set, &mut in_flight, &cancel).await;

        // Aborted or panicked units never recorded themselves.
        let mut leftovers: Vec<_> = in_flight.into_iter().collect();
        leftovers.sort_by_key(|(seq, _)| *seq);
        for (seq, descriptor) in leftovers {
            shared
                .record(ProbeResult::unavailable(descriptor, seq), &sink)
                .await;
        }

        let cancelled = cancel.is_cancelled();
        let report = shared.report(cancelled).await;
        if cancelled {
            info!(tested = report.stats.tested, available = report.stats.available, "run interrupted");
        } else {
            info!(tested = report.stats.tested, available = report.stats.available, "run complete");
        }
        let final_report = report.clone();
        let flushed = tokio::task::spawn_blocking(move || sink.finish(&final_report)).await;
        match flushed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("failed to write final results: {e:#}"),
            Err(e) => warn!("final write task failed: {e}"),
        }
        report
    }

    async fn drain(
        &self,
        set: &mut JoinSet<usize>,
        in_flight: &mut HashMap<usize, Arc<NodeDescriptor>>,
        cancel: &CancellationToken,
    ) {
        let mut grace: Option<Instant> = None;
        loop {
            if grace.is_none() && cancel.is_cancelled() {
                grace = Some(Instant::now() + self.config.drain_grace());
            }
            let next = match grace {
                Some(deadline) => match time::timeout_at(deadline, set.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(outstanding = set.len(), "abandoning probes still running after stop");
                        set.abort_all();
                        while let Some(res) = set.join_next().await {
                            reap(in_flight, res);
                        }
                        return;
                    }
                },
                None => tokio::select! {
                    next = set.join_next() => next,
                    _ = cancel.cancelled() => continue,
                },
            };
            match next {
                Some(res) => reap(in_flight, res),
                None => return,
            }
        }
    }
}

fn reap(in_flight: &mut HashMap<usize, Arc<NodeDescriptor>>, res: Result<usize, JoinError>) {
    match res {
        Ok(seq) => {
            in_flight.remove(&seq);
        }
        Err(e) if e.is_panic() => warn!("probe task panicked: {e}"),
        Err(_) => {}
    }
}

/// Cancel `token` on Ctrl-C, or SIGTERM on Unix.
pub fn cancel_on_interrupt(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                        _ = token.cancelled() => return,
                    }
                }
                Err(_) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = token.cancelled() => return,
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = token.cancelled() => return,
            }
        }
        warn!("interrupt received, stopping after in-flight probes");
        token.cancel();
    })
}
