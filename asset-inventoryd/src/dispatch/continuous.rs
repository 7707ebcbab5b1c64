use std::fmt::Display;
use std::time::Duration;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use crate::error::{ProbeError, StoreError};

/// One kind of continuous refresh: where the next key comes from, how it is
/// probed, and how the observation lands in the store.
#[async_trait]
pub trait RefreshPolicy: Send + Sync {
    type Key: Display + Send + Sync + 'static;
    type Observation: Send + 'static;

    fn name(&self) -> &'static str;

    /// Claim the stalest eligible key, or `None` when nothing is due.
    async fn claim(&self) -> Result<Option<Self::Key>, StoreError>;

    async fn probe(&self, key: &Self::Key) -> Result<Self::Observation, ProbeError>;

    async fn reconcile(&self, key: &Self::Key, observation: Self::Observation)
        -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// No key was due
    Idle,
    Refreshed,
    /// The claimed key keeps its lease and is skipped until it expires
    ProbeFailed,
}

/// A single select-probe-reconcile pass, erased over the policy's key type.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    async fn step(&self) -> Result<StepOutcome, StoreError>;
}

#[async_trait]
impl<P> Step for P
where
    P: RefreshPolicy,
{
    fn name(&self) -> &'static str {
        RefreshPolicy::name(self)
    }

    async fn step(&self) -> Result<StepOutcome, StoreError> {
        let Some(key) = self.claim().await? else {
            return Ok(StepOutcome::Idle);
        };

        match self.probe(&key).await {
            Ok(observation) => {
                self.reconcile(&key, observation).await?;
                tracing::debug!("{}: refreshed {}", RefreshPolicy::name(self), key);
                Ok(StepOutcome::Refreshed)
            }
            Err(e) => {
                tracing::warn!("{}: probe of {} failed: {}", RefreshPolicy::name(self), key, e);
                Ok(StepOutcome::ProbeFailed)
            }
        }
    }
}

/// Waits between loop iterations.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    /// After an iteration that probed something
    pub delay: Duration,
    /// After an iteration where every step was idle
    pub idle: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub iterations: u64,
    pub refreshed: u64,
    pub failed: u64,
    pub idle: u64,
}

/// Run `steps` round-robin until `cancel` fires.
///
/// One probe is in flight at a time. Cancellation is observed between steps
/// and during the pause between iterations; a running probe is never
/// interrupted. A storage error ends the loop.
pub async fn run_continuous(
    steps: &[Box<dyn Step>],
    pacing: Pacing,
    cancel: &CancellationToken,
) -> Result<LoopStats, StoreError> {
    let mut stats = LoopStats::default();

    tracing::info!(
        "Continuous refresh started: {}",
        steps.iter().map(|s| s.name()).collect::<Vec<_>>().join(", ")
    );

    'outer: loop {
        let mut busy = false;

        for step in steps {
            if cancel.is_cancelled() {
                break 'outer;
            }

            match step.step().await? {
                StepOutcome::Idle => stats.idle += 1,
                StepOutcome::Refreshed => {
                    stats.refreshed += 1;
                    busy = true;
                }
                StepOutcome::ProbeFailed => {
                    stats.failed += 1;
                    busy = true;
                }
            }
        }

        stats.iterations += 1;

        let pause = if busy { pacing.delay } else { pacing.idle };
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = cancel.cancelled() => break,
        }
    }

    tracing::info!(
        "Continuous refresh stopped after {} iterations: {} refreshed, {} failed, {} idle",
        stats.iterations,
        stats.refreshed,
        stats.failed,
        stats.idle
    );

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Hands out queued keys; odd keys fail to probe.
    struct QueuePolicy {
        queue: Mutex<VecDeque<u32>>,
        merged: Mutex<Vec<u32>>,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl QueuePolicy {
        fn new(keys: &[u32]) -> Self {
            Self {
                queue: Mutex::new(keys.iter().copied().collect()),
                merged: Mutex::new(Vec::new()),
                cancel_after: None,
            }
        }
    }

    #[async_trait]
    impl RefreshPolicy for QueuePolicy {
        type Key = u32;
        type Observation = u32;

        fn name(&self) -> &'static str {
            "queue"
        }

        async fn claim(&self) -> Result<Option<u32>, StoreError> {
            Ok(self.queue.lock().unwrap().pop_front())
        }

        async fn probe(&self, key: &u32) -> Result<u32, ProbeError> {
            if key % 2 == 1 {
                Err(ProbeError::MalformedOutput("odd".to_string()))
            } else {
                Ok(*key)
            }
        }

        async fn reconcile(&self, _key: &u32, observation: u32) -> Result<(), StoreError> {
            let mut merged = self.merged.lock().unwrap();
            merged.push(observation);
            if let Some((limit, cancel)) = &self.cancel_after {
                if merged.len() >= *limit {
                    cancel.cancel();
                }
            }
            Ok(())
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl RefreshPolicy for BrokenStore {
        type Key = u32;
        type Observation = ();

        fn name(&self) -> &'static str {
            "broken"
        }

        async fn claim(&self) -> Result<Option<u32>, StoreError> {
            Err(StoreError::Closed)
        }

        async fn probe(&self, _key: &u32) -> Result<(), ProbeError> {
            Ok(())
        }

        async fn reconcile(&self, _key: &u32, _observation: ()) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn no_wait() -> Pacing {
        Pacing {
            delay: Duration::ZERO,
            idle: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_step_outcomes() {
        let policy = QueuePolicy::new(&[2, 3]);
        assert_eq!(policy.step().await.unwrap(), StepOutcome::Refreshed);
        assert_eq!(policy.step().await.unwrap(), StepOutcome::ProbeFailed);
        assert_eq!(policy.step().await.unwrap(), StepOutcome::Idle);
        assert_eq!(*policy.merged.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_loop() {
        let cancel = CancellationToken::new();
        let mut policy = QueuePolicy::new(&[2, 4, 6, 8, 10]);
        policy.cancel_after = Some((3, cancel.clone()));
        let steps: Vec<Box<dyn Step>> = vec![Box::new(policy)];

        let stats = run_continuous(&steps, no_wait(), &cancel).await.unwrap();
        assert_eq!(stats.refreshed, 3);
    }

    #[tokio::test]
    async fn test_failures_do_not_stall_other_keys() {
        let cancel = CancellationToken::new();
        let mut policy = QueuePolicy::new(&[1, 3, 4, 5, 6]);
        policy.cancel_after = Some((2, cancel.clone()));
        let steps: Vec<Box<dyn Step>> = vec![Box::new(policy)];

        let stats = run_continuous(&steps, no_wait(), &cancel).await.unwrap();
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.refreshed, 2);
    }

    #[tokio::test]
    async fn test_steps_run_round_robin() {
        let cancel = CancellationToken::new();
        let mut second = QueuePolicy::new(&[20, 40]);
        second.cancel_after = Some((2, cancel.clone()));
        let steps: Vec<Box<dyn Step>> =
            vec![Box::new(QueuePolicy::new(&[2, 4, 6])), Box::new(second)];

        let stats = run_continuous(&steps, no_wait(), &cancel).await.unwrap();
        assert_eq!(stats.iterations, 2);
        assert_eq!(stats.refreshed, 4);
    }

    #[tokio::test]
    async fn test_idle_loop_waits_for_cancellation() {
        let cancel = CancellationToken::new();
        let steps: Vec<Box<dyn Step>> = vec![Box::new(QueuePolicy::new(&[]))];
        let pacing = Pacing {
            delay: Duration::ZERO,
            idle: Duration::from_secs(3600),
        };

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let stats = run_continuous(&steps, pacing, &cancel).await.unwrap();
        assert_eq!(stats.iterations, 1);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_storage_error_ends_the_loop() {
        let cancel = CancellationToken::new();
        let steps: Vec<Box<dyn Step>> = vec![Box::new(BrokenStore)];

        let err = run_continuous(&steps, no_wait(), &cancel).await.unwrap_err();
        assert!(matches!(err, StoreError::Closed));
    }
}
