//! Agent runtime.
//!
//! An agent repeats one round: claim a batch of items under a lock lease,
//! process each on a bounded worker pool, and release every claimed item
//! whatever the outcome. Items whose processing failed stay in place and
//! are picked up again by a later round. A worker that dies without
//! releasing leaves its item locked until the lease expires.

use crate::error::AgentError;
use crate::schedule::PollSchedule;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use workweave_core::Result;

/// The agents driving a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    /// Advances workflows and starts processings for new works.
    Clerk,
    /// Submits new processings.
    Submitter,
    /// Polls running processings.
    Poller,
    /// Releases inputs when producer contents change.
    Trigger,
    /// Closes processings and carries out operator requests.
    Finisher,
}

impl AgentKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clerk => "clerk",
            Self::Submitter => "submitter",
            Self::Poller => "poller",
            Self::Trigger => "trigger",
            Self::Finisher => "finisher",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One kind of claimable work.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    type Item: Send + Sync + fmt::Debug + 'static;

    fn kind(&self) -> AgentKind;

    /// Locks and returns up to `limit` items.
    async fn claim(&self, limit: usize) -> Result<Vec<Self::Item>, AgentError>;

    async fn process(&self, item: &Self::Item) -> Result<(), AgentError>;

    /// Unlocks an item claimed by this agent.
    async fn release(&self, item: &Self::Item) -> Result<(), AgentError>;
}

/// Counts of one round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub claimed: usize,
    pub processed: usize,
    pub failed: usize,
}

/// Runs an [`Agent`] on a fixed-size worker pool.
pub struct AgentRunner<A: Agent> {
    agent: Arc<A>,
    workers: usize,
    batch_size: usize,
    schedule: PollSchedule,
}

impl<A: Agent> AgentRunner<A> {
    #[must_use]
    pub fn new(agent: A, workers: usize, batch_size: usize, schedule: PollSchedule) -> Self {
        Self {
            agent: Arc::new(agent),
            workers: workers.max(1),
            batch_size: batch_size.max(1),
            schedule,
        }
    }

    #[must_use]
    pub fn agent(&self) -> &Arc<A> {
        &self.agent
    }

    /// Claims one batch and processes it.
    ///
    /// # Errors
    ///
    /// Returns an error only if claiming fails. Item failures are logged
    /// and counted.
    #[instrument(skip(self), fields(agent = %self.agent.kind()))]
    pub async fn run_once(&self) -> Result<RoundReport, AgentError> {
        let items = self.agent.claim(self.batch_size).await?;
        let mut report = RoundReport {
            claimed: items.len(),
            ..RoundReport::default()
        };
        if items.is_empty() {
            return Ok(report);
        }

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut join_set = JoinSet::new();
        for item in items {
            let agent = Arc::clone(&self.agent);
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return false;
                };
                let ok = match agent.process(&item).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(agent = %agent.kind(), item = ?item, error = %e, "item deferred to a later round");
                        false
                    }
                };
                if let Err(e) = agent.release(&item).await {
                    warn!(agent = %agent.kind(), item = ?item, error = %e, "failed to release item");
                }
                ok
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(true) => report.processed += 1,
                Ok(false) => report.failed += 1,
                Err(e) => {
                    error!(agent = %self.agent.kind(), error = %e, "worker panicked");
                    report.failed += 1;
                }
            }
        }

        debug!(
            claimed = report.claimed,
            processed = report.processed,
            failed = report.failed,
            "round complete"
        );
        Ok(report)
    }

    /// Runs rounds until `shutdown` turns true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let kind = self.agent.kind();
        info!(
            agent = %kind,
            workers = self.workers,
            batch_size = self.batch_size,
            period_secs = self.schedule.period().as_secs(),
            "agent started"
        );

        while !*shutdown.borrow() {
            let delay = match self.run_once().await {
                Ok(report) => self.schedule.after_round(report.claimed, self.batch_size),
                Err(e) => {
                    warn!(agent = %kind, error = %e, "failed to claim items");
                    self.schedule.next_delay()
                }
            };

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(agent = %kind, "agent stopped");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Claims numbers from a queue; odd numbers fail.
    pub(crate) struct CountingAgent {
        pending: Mutex<Vec<u32>>,
        locked: Mutex<BTreeSet<u32>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        pub(crate) processed: Mutex<Vec<u32>>,
    }

    impl CountingAgent {
        pub(crate) fn new(items: impl IntoIterator<Item = u32>) -> Self {
            Self {
                pending: Mutex::new(items.into_iter().collect()),
                locked: Mutex::new(BTreeSet::new()),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                processed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Agent for CountingAgent {
        type Item = u32;

        fn kind(&self) -> AgentKind {
            AgentKind::Poller
        }

        async fn claim(&self, limit: usize) -> Result<Vec<u32>, AgentError> {
            let mut pending = self.pending.lock().unwrap();
            let take = limit.min(pending.len());
            let items: Vec<u32> = pending.drain(..take).collect();
            self.locked.lock().unwrap().extend(items.iter().copied());
            Ok(items)
        }

        async fn process(&self, item: &u32) -> Result<(), AgentError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if item % 2 == 1 {
                return Err(AgentError::carrier("process", format!("odd item {item}")).into());
            }
            self.processed.lock().unwrap().push(*item);
            Ok(())
        }

        async fn release(&self, item: &u32) -> Result<(), AgentError> {
            self.locked.lock().unwrap().remove(item);
            Ok(())
        }
    }

    #[tokio::test]
    async fn round_processes_and_releases_every_item() {
        let runner = AgentRunner::new(
            CountingAgent::new(0..6),
            2,
            10,
            PollSchedule::new(Duration::from_millis(10)),
        );

        let report = runner.run_once().await.unwrap();
        assert_eq!(
            report,
            RoundReport {
                claimed: 6,
                processed: 3,
                failed: 3,
            }
        );
        assert!(runner.agent().locked.lock().unwrap().is_empty());
        assert!(runner.agent().peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn batch_size_limits_a_round() {
        let runner = AgentRunner::new(
            CountingAgent::new([0, 2, 4, 6, 8]),
            4,
            2,
            PollSchedule::new(Duration::from_millis(10)),
        );

        assert_eq!(runner.run_once().await.unwrap().claimed, 2);
        assert_eq!(runner.run_once().await.unwrap().claimed, 2);
        assert_eq!(runner.run_once().await.unwrap().claimed, 1);
        assert_eq!(runner.run_once().await.unwrap().claimed, 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let runner = AgentRunner::new(
            CountingAgent::new([0, 2]),
            1,
            10,
            PollSchedule::new(Duration::from_millis(20)),
        );
        let agent = Arc::clone(runner.agent());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(runner.run(rx));

        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(*agent.processed.lock().unwrap(), vec![0, 2]);
    }
}
