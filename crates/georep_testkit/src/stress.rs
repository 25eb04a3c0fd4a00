//! Stress tests for georep.
//!
//! These run many workers against one shared table and check that batch
//! claims never hand the same row to two workers.

use crate::fixtures::TestSites;
use georep_core::{
    Clock, MockClock, RecordId, RegistryRecord, ReplicationConfig, Resource, RetryPolicy,
    SyncRegistry, TableVerificationStore, VerificationStore,
};
use georep_engine::BlobStrategy;
use georep_storage::InMemoryTable;
use std::collections::HashSet;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Rows claimed across all workers.
    pub total_claims: usize,
    /// Rows claimed by more than one worker.
    pub duplicate_claims: usize,
    /// Rows never claimed.
    pub unclaimed: usize,
    /// Total duration.
    pub duration: Duration,
    /// Claims per second.
    pub claims_per_second: f64,
}

impl StressTestResult {
    /// Builds a result from every worker's claimed ids.
    pub fn from_claims(rows: usize, claims: &[Vec<RecordId>], duration: Duration) -> Self {
        let mut seen = HashSet::new();
        let mut duplicate_claims = 0;
        let mut total_claims = 0;
        for id in claims.iter().flatten() {
            total_claims += 1;
            if !seen.insert(*id) {
                duplicate_claims += 1;
            }
        }
        let claims_per_second = if duration.as_secs_f64() > 0.0 {
            total_claims as f64 / duration.as_secs_f64()
        } else {
            0.0
        };
        Self {
            total_claims,
            duplicate_claims,
            unclaimed: rows.saturating_sub(seen.len()),
            duration,
            claims_per_second,
        }
    }

    /// Returns true if every row was claimed exactly once.
    pub fn is_disjoint_and_complete(&self) -> bool {
        self.duplicate_claims == 0 && self.unclaimed == 0
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Claims: {}", self.total_claims);
        println!("Duplicate claims: {}", self.duplicate_claims);
        println!("Unclaimed rows: {}", self.unclaimed);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} claims/sec", self.claims_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Rows in the table.
    pub rows: usize,
    /// Concurrent workers.
    pub workers: usize,
    /// Rows per claim.
    pub batch_size: usize,
    /// Time each claim holds its row locks.
    pub lock_hold: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            rows: 500,
            workers: 8,
            batch_size: 10,
            lock_hold: Duration::from_micros(200),
        }
    }
}

/// Runs `workers` threads, started together, each calling `claim` until
/// it returns an empty batch. Returns every worker's claims.
fn run_claimers<F>(workers: usize, claim: F) -> (Vec<Vec<RecordId>>, Duration)
where
    F: Fn() -> Vec<RecordId> + Send + Sync + 'static,
{
    let claim = Arc::new(claim);
    let barrier = Arc::new(Barrier::new(workers));
    let results = Arc::new(Mutex::new(Vec::with_capacity(workers)));
    let start = Instant::now();

    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let claim = Arc::clone(&claim);
            let barrier = Arc::clone(&barrier);
            let results = Arc::clone(&results);
            thread::spawn(move || {
                barrier.wait();
                let mut mine = Vec::new();
                loop {
                    let batch = claim();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch);
                }
                results.lock().expect("results poisoned").push(mine);
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Worker thread panicked");
    }
    let duration = start.elapsed();
    let claims = std::mem::take(&mut *results.lock().expect("results poisoned"));
    (claims, duration)
}

/// Concurrent sync claims over one registry table.
pub fn stress_sync_claims(config: &StressConfig) -> StressTestResult {
    let clock = Arc::new(MockClock::starting_now());
    let now = clock.now();
    let rows = (1..=config.rows as RecordId).map(|id| RegistryRecord::new(id, now));
    let table = Arc::new(InMemoryTable::with_rows("registry", rows).with_lock_hold(config.lock_hold));
    let registry = SyncRegistry::new(table, clock, RetryPolicy::new());

    let batch_size = config.batch_size;
    let (claims, duration) = run_claimers(config.workers, move || {
        registry
            .claim_sync_batch(batch_size)
            .expect("Failed to claim sync batch")
    });
    StressTestResult::from_claims(config.rows, &claims, duration)
}

/// Concurrent verification claims over one resource table.
pub fn stress_verification_claims(config: &StressConfig) -> StressTestResult {
    let clock = Arc::new(MockClock::starting_now());
    let now = clock.now();
    let rows = (1..=config.rows as RecordId).map(|id| Resource::new(id, format!("uploads/{id}"), now));
    let table = Arc::new(InMemoryTable::with_rows("resources", rows).with_lock_hold(config.lock_hold));
    let store = TableVerificationStore::new(table, clock, RetryPolicy::new());

    let batch_size = config.batch_size;
    let (claims, duration) = run_claimers(config.workers, move || {
        store
            .claim_verification_batch(batch_size)
            .expect("Failed to claim verification batch")
    });
    StressTestResult::from_claims(config.rows, &claims, duration)
}

/// Concurrent end-to-end sync workers on one secondary.
///
/// Every worker runs full sync batches (claim, transfer, mark synced).
/// Returns the claims and how many rows ended synced.
pub fn stress_sync_workers(config: &StressConfig) -> (StressTestResult, usize) {
    let sites = TestSites::builder(Arc::new(BlobStrategy::new("upload")))
        .config(ReplicationConfig::new().with_sync_batch_size(config.batch_size))
        .registry_lock_hold(config.lock_hold)
        .build();
    for id in 1..=config.rows as RecordId {
        sites.create_blob(id, format!("content {id}").as_bytes());
    }
    sites.drain();

    let secondary = Arc::clone(&sites.secondary);
    let (claims, duration) = run_claimers(config.workers, move || {
        let registry = secondary.registry().expect("secondary has a registry");
        let ids = registry
            .claim_sync_batch(secondary.context().config().sync_batch_size)
            .expect("Failed to claim sync batch");
        for id in &ids {
            secondary.sync(*id).expect("Sync failed");
        }
        ids
    });
    let synced = sites
        .secondary
        .registry()
        .expect("secondary has a registry")
        .counts()
        .expect("Failed to count registry")
        .synced;
    (StressTestResult::from_claims(config.rows, &claims, duration), synced)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> StressConfig {
        StressConfig {
            rows: 120,
            workers: 6,
            batch_size: 7,
            lock_hold: Duration::from_micros(100),
        }
    }

    #[test]
    fn test_sync_claims_are_disjoint() {
        let result = stress_sync_claims(&small());
        assert!(result.is_disjoint_and_complete(), "{result:?}");
        assert_eq!(result.total_claims, 120);
    }

    #[test]
    fn test_verification_claims_are_disjoint() {
        let result = stress_verification_claims(&small());
        assert!(result.is_disjoint_and_complete(), "{result:?}");
    }

    #[test]
    fn test_sync_workers_sync_everything_once() {
        let config = StressConfig {
            rows: 40,
            ..small()
        };
        let (result, synced) = stress_sync_workers(&config);
        assert!(result.is_disjoint_and_complete(), "{result:?}");
        assert_eq!(synced, 40);
    }

    #[test]
    fn test_result_counts_duplicates() {
        let result = StressTestResult::from_claims(4, &[vec![1, 2], vec![2, 3]], Duration::ZERO);
        assert_eq!(result.total_claims, 4);
        assert_eq!(result.duplicate_claims, 1);
        assert_eq!(result.unclaimed, 1);
        assert!(!result.is_disjoint_and_complete());
    }
}
