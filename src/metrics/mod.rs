//! Bean lifecycle metrics.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 BeanMetrics                  │
//! │  created / removed / expired                 │
//! │  passivations / activations (+ failures)     │
//! │  expiration outcomes {removed,skipped,...}   │
//! └──────────────────────────────────────────────┘
//! ```

mod counters;

pub use counters::{Counter, LabeledCounter};

/// Counters of one bean manager.
#[derive(Debug)]
pub struct BeanMetrics {
    pub beans_created: Counter,
    pub beans_removed: Counter,
    pub beans_expired: Counter,
    pub passivations: Counter,
    pub activations: Counter,
    pub passivation_failures: Counter,
    pub activation_failures: Counter,
    /// Outcomes of expiration task runs, by `outcome`.
    pub expiration_outcomes: LabeledCounter<1>,
}

impl BeanMetrics {
    pub fn new() -> Self {
        Self {
            beans_created: Counter::new("beans_created_total", "Beans created"),
            beans_removed: Counter::new("beans_removed_total", "Beans removed by the application"),
            beans_expired: Counter::new("beans_expired_total", "Beans removed after their timeout"),
            passivations: Counter::new("bean_passivations_total", "Instances passivated"),
            activations: Counter::new("bean_activations_total", "Instances activated"),
            passivation_failures: Counter::new(
                "bean_passivation_failures_total",
                "Group passivations aborted by a callback",
            ),
            activation_failures: Counter::new(
                "bean_activation_failures_total",
                "Failed activation callbacks",
            ),
            expiration_outcomes: LabeledCounter::new("bean_expiration_runs_total", ["outcome"]),
        }
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> BeanMetricsSnapshot {
        BeanMetricsSnapshot {
            beans_created: self.beans_created.get(),
            beans_removed: self.beans_removed.get(),
            beans_expired: self.beans_expired.get(),
            passivations: self.passivations.get(),
            activations: self.activations.get(),
            passivation_failures: self.passivation_failures.get(),
            activation_failures: self.activation_failures.get(),
            expirations_retried: self.expiration_outcomes.get(["retry"]),
            expirations_failed: self.expiration_outcomes.get(["failed"]),
        }
    }
}

impl Default for BeanMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of [`BeanMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BeanMetricsSnapshot {
    pub beans_created: u64,
    pub beans_removed: u64,
    pub beans_expired: u64,
    pub passivations: u64,
    pub activations: u64,
    pub passivation_failures: u64,
    pub activation_failures: u64,
    pub expirations_retried: u64,
    pub expirations_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let metrics = BeanMetrics::new();
        metrics.beans_created.inc();
        metrics.expiration_outcomes.inc(["retry"]);
        metrics.expiration_outcomes.inc(["removed"]);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.beans_created, 1);
        assert_eq!(snapshot.expirations_retried, 1);
        assert_eq!(snapshot.expirations_failed, 0);
    }
}
