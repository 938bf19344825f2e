//! Timer-driven expiration on a single node.

use crate::bean::ExpirationMetaData;
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::expiration::queue::{ExpirationQueue, QueueOrdering};
use crate::expiration::{ExpirationOutcome, ExpirationTask, Scheduler};
use crate::types::{BeanId, Clock};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

struct SchedulerState {
    queue: ExpirationQueue,
    /// Entries whose task is running, with whether they were cancelled since.
    in_flight: HashMap<BeanId, bool>,
}

/// Holds this node's expiration timers and runs due tasks.
pub struct LocalScheduler {
    state: Mutex<SchedulerState>,
    task: Arc<dyn ExpirationTask>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    wakeup: Notify,
    shutdown: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl LocalScheduler {
    pub fn new(
        ordering: QueueOrdering,
        task: Arc<dyn ExpirationTask>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SchedulerState {
                queue: ExpirationQueue::new(ordering),
                in_flight: HashMap::new(),
            }),
            task,
            clock,
            config,
            wakeup: Notify::new(),
            shutdown: CancellationToken::new(),
            timer: Mutex::new(None),
        })
    }

    /// Spawn the timer task. Does nothing if it already runs.
    pub fn start(self: &Arc<Self>) {
        let mut timer = self.timer.lock();
        if timer.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        let scheduler = self.clone();
        *timer = Some(tokio::spawn(async move { scheduler.run().await }));
    }

    pub fn is_running(&self) -> bool {
        self.timer.lock().is_some() && !self.shutdown.is_cancelled()
    }

    /// Track the expiration of `id`, replacing an earlier entry.
    pub fn schedule_local(&self, id: BeanId, expiration: ExpirationMetaData) {
        let replaced = self.state.lock().queue.schedule(id, expiration);
        trace!(bean_id = %id, deadline_ms = expiration.deadline_ms(), replaced, "Scheduled expiration");
        self.wakeup.notify_one();
    }

    /// Stop tracking `id`. Returns whether an entry was pending.
    pub fn cancel_local(&self, id: BeanId) -> bool {
        let mut state = self.state.lock();
        if let Some(cancelled) = state.in_flight.get_mut(&id) {
            *cancelled = true;
        }
        let removed = state.queue.forget(&id);
        trace!(bean_id = %id, removed, "Cancelled expiration");
        removed
    }

    pub fn contains(&self, id: &BeanId) -> bool {
        self.state.lock().queue.contains(id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Identifiers with a pending expiration.
    pub fn scheduled_ids(&self) -> Vec<BeanId> {
        self.state.lock().queue.ids()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.state.lock().queue.next_deadline()
    }

    /// Drop entries for which `keep` is false; returns them.
    pub fn retain(&self, keep: impl FnMut(&BeanId) -> bool) -> Vec<BeanId> {
        self.state.lock().queue.retain(keep)
    }

    /// Run every entry that is due now. Returns the number of tasks run.
    pub async fn run_due(&self) -> usize {
        let mut fired = 0;
        while !self.shutdown.is_cancelled() {
            let now = self.clock.now_ms();
            let next = {
                let mut state = self.state.lock();
                let next = state.queue.poll_expired(now);
                if let Some((id, _)) = next {
                    state.in_flight.insert(id, false);
                }
                next
            };
            let Some((id, expiration)) = next else {
                break;
            };

            let outcome = self.task.expire(id, expiration).await;
            fired += 1;
            debug!(bean_id = %id, outcome = outcome.label(), "Expiration task finished");

            let mut state = self.state.lock();
            let cancelled = state.in_flight.remove(&id).unwrap_or(false);
            if let ExpirationOutcome::Retry { at_ms } = outcome {
                if !cancelled && !state.queue.contains(&id) {
                    state.queue.schedule_at(id, expiration, at_ms.max(now + 1));
                }
            }
        }
        fired
    }

    async fn run(self: Arc<Self>) {
        debug!("Expiration timer started");
        loop {
            self.run_due().await;
            let delay = self.next_delay();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("Expiration timer stopped");
    }

    fn next_delay(&self) -> Duration {
        let max = self.config.max_poll_interval;
        match self.next_deadline() {
            Some(deadline) => {
                Duration::from_millis(deadline.saturating_sub(self.clock.now_ms())).min(max)
            }
            None => max,
        }
    }

    /// Stop the timer, letting a running task finish within `grace`.
    ///
    /// Returns `false` if the timer had to be aborted. Pending entries are
    /// dropped either way.
    pub async fn stop(&self, grace: Duration) -> bool {
        self.shutdown.cancel();
        let handle = self.timer.lock().take();

        let drained = match handle {
            Some(mut handle) => match tokio::time::timeout(grace, &mut handle).await {
                Ok(_) => true,
                Err(_) => {
                    warn!(?grace, "Expiration timer did not stop in time, aborting");
                    handle.abort();
                    false
                }
            },
            None => true,
        };

        let dropped = {
            let mut state = self.state.lock();
            let dropped = state.queue.len();
            state.queue.clear();
            dropped
        };
        info!(dropped, drained, "Expiration scheduler stopped");
        drained
    }

    /// Signal the timer to stop without waiting for it.
    pub(crate) fn shutdown_now(&self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Scheduler for LocalScheduler {
    async fn schedule(&self, id: BeanId, expiration: ExpirationMetaData) -> Result<()> {
        self.schedule_local(id, expiration);
        Ok(())
    }

    async fn cancel(&self, id: BeanId) -> Result<()> {
        self.cancel_local(id);
        Ok(())
    }
}

impl fmt::Debug for LocalScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LocalScheduler")
            .field("ordering", &state.queue.ordering())
            .field("pending", &state.queue.len())
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}
