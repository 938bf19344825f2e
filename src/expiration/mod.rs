//! Idle-timeout expiration of beans.
//!
//! ```text
//!   Bean::close ──schedule──► PrimaryOwnerScheduler ──(owner = self)──► LocalScheduler
//!                                    │                                      │ timer
//!                                    └─dispatch─► owner's handler ──────────┤
//!                                                                           ▼
//!                                                                 BeanExpirationTask
//! ```
//!
//! Only the primary owner of a bean's creation key holds its timer. On a
//! topology change every member drops the timers it no longer owns and
//! rescans the cache for beans it now owns.

mod local;
mod primary_owner;
mod queue;
mod task;

pub use local::LocalScheduler;
pub use primary_owner::{PrimaryOwnerScheduler, ScheduleRescan, SchedulerCommandHandler};
pub use queue::{ExpirationQueue, QueueOrdering};
pub use task::BeanExpirationTask;

use crate::bean::ExpirationMetaData;
use crate::error::Result;
use crate::types::BeanId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Command sent to the member that owns a bean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerCommand {
    Schedule {
        id: BeanId,
        expiration: ExpirationMetaData,
    },
    Cancel {
        id: BeanId,
    },
}

impl SchedulerCommand {
    pub fn id(&self) -> BeanId {
        match self {
            SchedulerCommand::Schedule { id, .. } | SchedulerCommand::Cancel { id } => *id,
        }
    }
}

/// Schedules bean expiration.
#[async_trait]
pub trait Scheduler: Send + Sync + 'static {
    /// Arm the expiration of `id`, replacing any earlier one.
    async fn schedule(&self, id: BeanId, expiration: ExpirationMetaData) -> Result<()>;

    /// Disarm the expiration of `id`. A task already running is not interrupted.
    async fn cancel(&self, id: BeanId) -> Result<()>;
}

/// Result of one expiration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationOutcome {
    /// The bean was removed.
    Removed,
    /// Nothing to do: the bean is gone, immortal or owned elsewhere.
    Skipped,
    /// Try again at the given time.
    Retry { at_ms: u64 },
    /// The attempt failed; the entry is dropped.
    Failed,
}

impl ExpirationOutcome {
    /// Metric label of the outcome.
    pub fn label(&self) -> &'static str {
        match self {
            ExpirationOutcome::Removed => "removed",
            ExpirationOutcome::Skipped => "skipped",
            ExpirationOutcome::Retry { .. } => "retry",
            ExpirationOutcome::Failed => "failed",
        }
    }
}

/// Work run by the [`LocalScheduler`] when an entry is due.
#[async_trait]
pub trait ExpirationTask: Send + Sync + 'static {
    async fn expire(&self, id: BeanId, expiration: ExpirationMetaData) -> ExpirationOutcome;
}
