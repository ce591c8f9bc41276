// Per-worker throughput accounting and the eviction policy built on it.

pub mod body;

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::RankingConfig;

/// Transfers smaller than this carry too little signal to rank a mirror,
/// unless the transfer also took unusually long.
const MIN_SAMPLE_BYTES: u64 = 512 << 10;

/// A small transfer that still took this long is kept: it is telling us the
/// mirror is slow, not that the file was tiny.
const MAX_DURATION_FOR_MIN_BYTES: Duration = Duration::from_secs(1);

/// Cap on the per-worker sample count. Once saturated, updates behave like an
/// exponential decay weighting recent samples at roughly 1/(N+1).
const MAX_SAMPLES: u32 = 15;

/// Minimum interval between ranking reports in the log.
const REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// One completed transfer: how many bytes, how long they took.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub bytes: u64,
    pub duration: Duration,
}

impl Sample {
    /// Bytes per second.
    pub fn throughput(&self) -> f64 {
        self.bytes as f64 / self.duration.as_secs_f64()
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} MiB/s", self.throughput() / 1024.0 / 1024.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct WorkerEntry {
    samples: u32,
    average: f64,
}

/// A worker with at least one accepted sample, as seen by the ranking.
#[derive(Debug, Clone)]
pub struct RankedWorker {
    pub id: String,
    pub throughput: f64,
}

struct Inner {
    workers: HashMap<String, WorkerEntry>,
    last_report: Option<Instant>,
}

/// Records throughput samples per worker id and answers whether a worker is
/// still allowed to serve. Ids exist here iff the worker has posted at least
/// one accepted sample and has not been removed.
pub struct ThroughputRegistry {
    config: RankingConfig,
    inner: RwLock<Inner>,
}

impl ThroughputRegistry {
    pub fn new(config: RankingConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                workers: HashMap::new(),
                last_report: None,
            }),
        }
    }

    /// Fold a sample into the worker's running average. Insignificant samples
    /// (few bytes, fast) are dropped.
    pub fn update(&self, id: &str, sample: Sample) {
        if sample.bytes < MIN_SAMPLE_BYTES && sample.duration < MAX_DURATION_FOR_MIN_BYTES {
            debug!(
                "dropping sample for {id}, not significant enough ({} bytes in {:?})",
                sample.bytes, sample.duration
            );
            return;
        }

        debug!("recording sample of {sample} for {id}");

        {
            let mut inner = self.inner.write();
            let entry = inner.workers.entry(id.to_string()).or_default();
            entry.average = (entry.average * entry.samples as f64 + sample.throughput())
                / (entry.samples as f64 + 1.0);
            entry.samples = (entry.samples + 1).min(MAX_SAMPLES);
        }

        self.report();
    }

    /// Forget a worker entirely. Called when its serve loop returns.
    pub fn remove(&self, id: &str) {
        self.inner.write().workers.remove(id);
    }

    /// Classify the named worker: its average throughput and whether it may
    /// keep serving. Workers are innocent until enough of them are ranked,
    /// absolute good performers are never evicted, and otherwise only the
    /// top `top_workers` positions survive.
    pub fn classify(&self, id: &str) -> (f64, bool) {
        let ranked = self.ranking();

        if ranked.len() <= self.config.top_workers {
            debug!("only {} workers ranked, cannot evict any yet", ranked.len());
            return (0.0, true);
        }

        let Some(position) = ranked.iter().position(|worker| worker.id == id) else {
            debug!("worker {id} is not ranked yet");
            return (0.0, true);
        };

        debug!("worker {id} is in position {}/{}", position + 1, ranked.len());

        let throughput = ranked[position].throughput;
        if throughput > self.config.good_throughput_bytes() {
            return (throughput, true);
        }

        (throughput, position < self.config.top_workers)
    }

    /// Snapshot of all workers with a nonzero average, best throughput first.
    pub fn ranking(&self) -> Vec<RankedWorker> {
        let inner = self.inner.read();
        let mut ranked: Vec<RankedWorker> = inner
            .workers
            .iter()
            .filter(|(_, entry)| entry.average > 0.0)
            .map(|(id, entry)| RankedWorker {
                id: id.clone(),
                throughput: entry.average,
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.throughput
                .partial_cmp(&a.throughput)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        ranked
    }

    fn report(&self) {
        if !self.should_report() {
            return;
        }

        let mut table = String::from("worker throughput:");
        for worker in self.ranking() {
            table.push_str(&format!(
                "\n{:>9.2} MiB/s  {}",
                worker.throughput / 1024.0 / 1024.0,
                worker.id
            ));
        }
        info!("{table}");
    }

    fn should_report(&self) -> bool {
        let mut inner = self.inner.write();
        match inner.last_report {
            Some(at) if at.elapsed() < REPORT_INTERVAL => false,
            _ => {
                inner.last_report = Some(Instant::now());
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(workers: usize, top_workers: usize) -> ThroughputRegistry {
        ThroughputRegistry::new(
            RankingConfig {
                workers,
                top_workers,
                good_throughput_mibs: 2.0,
            }
            .with_defaults(),
        )
    }

    fn sample(bytes: u64, millis: u64) -> Sample {
        Sample {
            bytes,
            duration: Duration::from_millis(millis),
        }
    }

    #[test]
    fn small_fast_samples_are_dropped() {
        let registry = registry(4, 3);
        registry.update("w", sample(100 << 10, 200));
        assert!(registry.ranking().is_empty());
    }

    #[test]
    fn small_slow_samples_are_kept() {
        let registry = registry(4, 3);
        registry.update("w", sample(100 << 10, 2_000));
        let ranked = registry.ranking();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id, "w");
    }

    #[test]
    fn average_saturates_at_max_samples() {
        let registry = registry(4, 3);
        // 1 MiB/s forever; the average must stay pinned regardless of count.
        for _ in 0..50 {
            registry.update("w", sample(1 << 20, 1_000));
        }
        let ranked = registry.ranking();
        let mib = 1024.0 * 1024.0;
        assert!((ranked[0].throughput - mib).abs() < 1.0);

        // A much faster sample now shifts the average by ~1/16th of the delta.
        registry.update("w", sample(17 << 20, 1_000));
        let ranked = registry.ranking();
        assert!((ranked[0].throughput - 2.0 * mib).abs() < mib * 0.01);
    }

    #[test]
    fn everyone_is_allowed_until_enough_workers_rank() {
        let registry = registry(4, 3);
        registry.update("a", sample(10 << 20, 1_000));
        registry.update("b", sample(1 << 20, 1_000));
        registry.update("c", sample(2 << 20, 1_000));

        // Three ranked, top_workers = 3: not enough data to evict anyone.
        let (_, allowed) = registry.classify("b");
        assert!(allowed);
    }

    #[test]
    fn unranked_workers_are_allowed() {
        let registry = registry(4, 3);
        for id in ["a", "b", "c", "d"] {
            registry.update(id, sample(10 << 20, 1_000));
        }
        let (throughput, allowed) = registry.classify("fresh");
        assert_eq!(throughput, 0.0);
        assert!(allowed);
    }

    #[test]
    fn bottom_of_the_ranking_is_evicted() {
        let registry = registry(4, 3);
        registry.update("fast", sample(100 << 20, 1_000));
        registry.update("ok-1", sample(1 << 20, 1_000));
        registry.update("ok-2", sample(1 << 20, 1_100));
        registry.update("slow", sample(600 << 10, 60_000)); // 10 KiB/s

        let (_, allowed) = registry.classify("slow");
        assert!(!allowed);
        let (_, allowed) = registry.classify("ok-1");
        assert!(allowed);
    }

    #[test]
    fn absolute_performers_are_never_evicted() {
        // top_workers = 1, so positions >= 1 would normally be evicted.
        let registry = registry(4, 1);
        registry.update("a", sample(100 << 20, 1_000));
        registry.update("b", sample(50 << 20, 1_000));
        registry.update("c", sample(30 << 20, 1_000));

        // "c" ranks last but clears the 2 MiB/s floor.
        let (throughput, allowed) = registry.classify("c");
        assert!(throughput > 0.0);
        assert!(allowed);
    }

    #[test]
    fn removed_workers_leave_the_ranking() {
        let registry = registry(4, 3);
        registry.update("w", sample(10 << 20, 1_000));
        assert_eq!(registry.ranking().len(), 1);
        registry.remove("w");
        assert!(registry.ranking().is_empty());
    }
}
