//! Fixed-size pool of resolution workers.
//!
//! Workers share one domain stream and one result stream. The pool owns the
//! result sender and only drops it after every worker has been joined, so a
//! consumer that sees the stream close has received every result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::resolution::{merge_addresses, Resolution};
use crate::upstream::UpstreamSet;

/// Counters reported when the pool finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSummary {
    /// Domains answered by at least one upstream
    pub resolved: u64,
    /// Domains no upstream answered
    pub failed: u64,
    /// Addresses emitted, summed over domains
    pub addresses: u64,
}

#[derive(Default)]
struct PoolStats {
    resolved: AtomicU64,
    failed: AtomicU64,
    addresses: AtomicU64,
}

impl PoolStats {
    fn record(&self, resolution: &Resolution) {
        if resolution.is_ok() {
            self.resolved.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.addresses
            .fetch_add(resolution.addresses.len() as u64, Ordering::Relaxed);
    }

    fn summary(&self) -> PoolSummary {
        PoolSummary {
            resolved: self.resolved.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            addresses: self.addresses.load(Ordering::Relaxed),
        }
    }
}

type SharedDomains = Arc<Mutex<mpsc::Receiver<String>>>;

/// Resolves domains from a shared stream with a fixed number of workers
pub struct ResolverPool {
    upstreams: Arc<UpstreamSet>,
    workers: usize,
}

impl ResolverPool {
    pub fn new(upstreams: Arc<UpstreamSet>, workers: usize) -> Self {
        Self {
            upstreams,
            workers: workers.max(1),
        }
    }

    /// Resolve every domain from `domains`, emitting one [`Resolution`] per
    /// domain into `results`.
    ///
    /// Returns once the domain stream is exhausted (or `cancel` fires) and
    /// every worker has finished its last query. `results` is closed on
    /// return.
    pub async fn run(
        &self,
        domains: mpsc::Receiver<String>,
        results: mpsc::Sender<Resolution>,
        cancel: CancellationToken,
    ) -> PoolSummary {
        let domains: SharedDomains = Arc::new(Mutex::new(domains));
        let stats = Arc::new(PoolStats::default());

        debug!(
            "Starting {} resolver workers over {} upstreams",
            self.workers,
            self.upstreams.upstream_count()
        );

        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            workers.spawn(worker(
                id,
                self.upstreams.clone(),
                domains.clone(),
                results.clone(),
                cancel.clone(),
                stats.clone(),
            ));
        }

        // Barrier: the result stream stays open until the last worker exits
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Resolver worker failed: {}", e);
            }
        }
        drop(results);

        let summary = stats.summary();
        info!(
            "Resolution finished: {} resolved, {} failed, {} addresses",
            summary.resolved, summary.failed, summary.addresses
        );
        summary
    }
}

async fn worker(
    id: usize,
    upstreams: Arc<UpstreamSet>,
    domains: SharedDomains,
    results: mpsc::Sender<Resolution>,
    cancel: CancellationToken,
    stats: Arc<PoolStats>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            domain = async { domains.lock().await.recv().await } => domain,
        };
        let Some(domain) = next else {
            break;
        };

        let resolution = resolve_domain(&upstreams, domain).await;
        stats.record(&resolution);

        if results.send(resolution).await.is_err() {
            debug!("Worker {}: result consumer closed the stream", id);
            break;
        }
    }

    trace!("Worker {} stopped", id);
}

/// Broadcast one domain to every upstream and merge the answers
pub async fn resolve_domain(upstreams: &UpstreamSet, domain: String) -> Resolution {
    match upstreams.exchange_all(&domain).await {
        Ok(responses) => {
            let addresses = merge_addresses(&responses);
            trace!("{} -> {:?}", domain, addresses);
            Resolution::resolved(domain, addresses)
        }
        Err(e) => {
            debug!("Failed to resolve {}: {}", domain, e);
            Resolution::failed(domain, e)
        }
    }
}
