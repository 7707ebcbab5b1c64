use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use futures::stream::{self, StreamExt};
use crate::error::{ProbeError, StoreError};

/// Tally of one bulk batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub submitted: usize,
    /// Results that carried new information and were merged
    pub reconciled: usize,
    /// Well-formed results with nothing to merge
    pub empty: usize,
    pub failed: usize,
}

/// Probe every key with at most `concurrency` probes in flight.
///
/// Duplicate keys are probed once. Results come back in completion order,
/// one per distinct key, each carrying its own success or failure.
pub async fn dispatch_batch<K, T, F, Fut>(
    keys: Vec<K>,
    concurrency: usize,
    probe: F,
) -> Vec<(K, Result<T, ProbeError>)>
where
    K: Clone + Eq + Hash,
    F: Fn(K) -> Fut,
    Fut: Future<Output = Result<T, ProbeError>>,
{
    let mut seen = HashSet::new();
    let keys: Vec<K> = keys.into_iter().filter(|k| seen.insert(k.clone())).collect();

    tracing::info!(
        "Dispatching {} probes, at most {} in flight",
        keys.len(),
        concurrency
    );

    stream::iter(keys)
        .map(|key| {
            let pending = probe(key.clone());
            async move { (key, pending.await) }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await
}

/// Merge a completed batch. `reconcile` returns whether the observation
/// carried anything to merge.
///
/// A probe failure is reported and counted; the rest of the batch is still
/// reconciled. A storage failure aborts the batch.
pub async fn reconcile_batch<K, T, F, Fut>(
    results: Vec<(K, Result<T, ProbeError>)>,
    mut reconcile: F,
) -> Result<BatchReport, StoreError>
where
    K: Display,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<bool, StoreError>>,
{
    let mut report = BatchReport {
        submitted: results.len(),
        ..BatchReport::default()
    };

    for (key, result) in results {
        match result {
            Ok(observation) => {
                if reconcile(observation).await? {
                    report.reconciled += 1;
                } else {
                    tracing::debug!("{}: nothing new", key);
                    report.empty += 1;
                }
            }
            Err(e) => {
                tracing::warn!("Probe of {} failed: {}", key, e);
                report.failed += 1;
            }
        }
    }

    tracing::info!(
        "Batch done: {} submitted, {} reconciled, {} empty, {} failed",
        report.submitted,
        report.reconciled,
        report.empty,
        report.failed
    );

    Ok(report)
}
