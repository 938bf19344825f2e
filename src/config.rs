//! Configuration types for the bean manager and its embedded store.

use crate::error::{Error, Result};
use crate::types::NodeId;
use std::time::Duration;

/// Eviction strategy of the embedded store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionConfig {
    /// Entries are never passivated.
    #[default]
    Disabled,

    /// Entries are passivated only through explicit `evict` calls.
    Manual,

    /// Least recently used evictable entries are passivated once more than
    /// `max_entries` of them are in memory.
    SizeBound {
        /// Maximum number of evictable entries kept in memory.
        max_entries: usize,
    },
}

impl EvictionConfig {
    /// Memory bound, if any.
    pub fn max_entries(&self) -> Option<usize> {
        match self {
            EvictionConfig::SizeBound { max_entries } => Some(*max_entries),
            _ => None,
        }
    }

    /// Whether entries may be passivated at all.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, EvictionConfig::Disabled)
    }
}

/// Configuration of the embedded store.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Eviction strategy.
    pub eviction: EvictionConfig,

    /// How long a batch waits for a key lock before timing out.
    pub lock_timeout: Duration,

    /// Whether the passivated tier survives restarts.
    ///
    /// A persistent store notifies instances through its own hooks, so the
    /// bean manager does not register its passivation listener.
    pub persistent: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            eviction: EvictionConfig::Disabled,
            lock_timeout: Duration::from_secs(15),
            persistent: false,
        }
    }
}

impl CacheConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the eviction strategy.
    pub fn with_eviction(mut self, eviction: EvictionConfig) -> Self {
        self.eviction = eviction;
        self
    }

    /// Bound the number of evictable entries kept in memory.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.eviction = EvictionConfig::SizeBound { max_entries };
        self
    }

    /// Set the lock acquisition timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Mark the store as persistent.
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}

/// Expiration scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay before retrying an expiration whose group was contended.
    pub retry_interval: Duration,

    /// Longest the timer sleeps before checking the queue again.
    pub max_poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            max_poll_interval: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    /// Set the retry interval.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the longest timer sleep.
    pub fn with_max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval = interval;
        self
    }
}

/// Configuration of a bean manager.
#[derive(Debug, Clone)]
pub struct BeanManagerConfig {
    /// Name of the bean type managed; filters shared cache entries.
    pub bean_name: String,

    /// This node's identifier.
    pub node_id: NodeId,

    /// Cluster name reported as strong affinity.
    pub cluster_name: String,

    /// Idle timeout.
    ///
    /// `None` keeps beans forever, `Some(Duration::ZERO)` removes a bean as
    /// soon as it is released.
    pub timeout: Option<Duration>,

    /// Grace period for draining the scheduler on stop.
    pub stop_timeout: Duration,

    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,
}

impl BeanManagerConfig {
    /// Create a configuration for the given bean type on the given node.
    pub fn new(bean_name: impl Into<String>, node_id: NodeId) -> Self {
        Self {
            bean_name: bean_name.into(),
            node_id,
            cluster_name: "ejb".to_string(),
            timeout: None,
            stop_timeout: Duration::from_secs(10),
            scheduler: SchedulerConfig::default(),
        }
    }

    /// Set the idle timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Keep beans until they are explicitly removed.
    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Set the cluster name.
    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    /// Set the stop grace period.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Set the scheduler configuration.
    pub fn with_scheduler_config(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Whether released beans are handed to the expiration scheduler.
    pub fn is_scheduled(&self) -> bool {
        matches!(self.timeout, Some(t) if !t.is_zero())
    }

    /// Check the configuration for obvious mistakes.
    pub fn validate(&self) -> Result<()> {
        if self.bean_name.trim().is_empty() {
            return Err(Error::Config("bean name must not be empty".to_string()));
        }
        if self.stop_timeout.is_zero() {
            return Err(Error::Config("stop timeout must be positive".to_string()));
        }
        if self.scheduler.max_poll_interval.is_zero() {
            return Err(Error::Config("scheduler poll interval must be positive".to_string()));
        }
        Ok(())
    }
}

/// Configuration of the TCP command dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Timeout for a dispatched command, including the response.
    pub timeout: Duration,

    /// Connection timeout for reaching other nodes.
    pub connect_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl DispatchConfig {
    /// Set the command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.eviction, EvictionConfig::Disabled);
        assert_eq!(config.lock_timeout, Duration::from_secs(15));
        assert!(!config.persistent);
    }

    #[test]
    fn test_eviction_config() {
        let config = CacheConfig::new().with_max_entries(10);
        assert_eq!(config.eviction.max_entries(), Some(10));
        assert!(config.eviction.is_enabled());
        assert!(EvictionConfig::Manual.is_enabled());
        assert!(!EvictionConfig::Disabled.is_enabled());
        assert_eq!(EvictionConfig::Manual.max_entries(), None);
    }

    #[test]
    fn test_manager_config_scheduling() {
        let config = BeanManagerConfig::new("Cart", 1);
        assert!(!config.is_scheduled());

        let config = config.with_timeout(Duration::ZERO);
        assert!(!config.is_scheduled());

        let config = config.with_timeout(Duration::from_secs(30));
        assert!(config.is_scheduled());
    }

    #[test]
    fn test_manager_config_validation() {
        assert!(BeanManagerConfig::new("Cart", 1).validate().is_ok());
        assert!(BeanManagerConfig::new("  ", 1).validate().is_err());
        assert!(BeanManagerConfig::new("Cart", 1)
            .with_stop_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }
}
