//! Delivery of scheduler commands to a specific member.

use crate::error::{DispatchError, Result};
use crate::expiration::SchedulerCommand;
use crate::subscription::Subscription;
use crate::types::NodeId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Executes commands addressed to this node.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, command: SchedulerCommand) -> Result<()>;
}

/// Sends commands to the handler a member registered for a service.
#[async_trait]
pub trait CommandDispatcher: Send + Sync + 'static {
    /// Execute `command` on `node_id` and wait for its completion.
    async fn execute_on(
        &self,
        node_id: NodeId,
        service: &str,
        command: SchedulerCommand,
    ) -> Result<()>;

    /// Register the handler of `service` on `node_id`.
    fn register(
        &self,
        node_id: NodeId,
        service: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Subscription;
}

type HandlerMap = DashMap<(NodeId, String), (u64, Arc<dyn CommandHandler>)>;

/// In-process dispatcher shared by all members living in one process.
#[derive(Clone, Default)]
pub struct LocalCommandDispatcher {
    handlers: Arc<HandlerMap>,
    next_registration: Arc<AtomicU64>,
}

impl LocalCommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `node_id` has a handler for `service`.
    pub fn is_registered(&self, node_id: NodeId, service: &str) -> bool {
        self.handlers.contains_key(&(node_id, service.to_string()))
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub(crate) fn handler(&self, node_id: NodeId, service: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers
            .get(&(node_id, service.to_string()))
            .map(|entry| entry.value().1.clone())
    }
}

#[async_trait]
impl CommandDispatcher for LocalCommandDispatcher {
    async fn execute_on(
        &self,
        node_id: NodeId,
        service: &str,
        command: SchedulerCommand,
    ) -> Result<()> {
        let handler = self
            .handler(node_id, service)
            .ok_or_else(|| DispatchError::NoHandler {
                node_id,
                service: service.to_string(),
            })?;

        trace!(node_id, service, ?command, "Dispatching command");
        handler.handle(command).await
    }

    fn register(
        &self,
        node_id: NodeId,
        service: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Subscription {
        let registration = self.next_registration.fetch_add(1, Ordering::Relaxed);
        let key = (node_id, service.to_string());
        self.handlers.insert(key.clone(), (registration, handler));

        let handlers = Arc::downgrade(&self.handlers);
        Subscription::new(move || {
            if let Some(handlers) = handlers.upgrade() {
                handlers.remove_if(&key, |_, (id, _)| *id == registration);
            }
        })
    }
}

impl fmt::Debug for LocalCommandDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCommandDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::BeanId;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<SchedulerCommand>>);

    #[async_trait]
    impl CommandHandler for Recorder {
        async fn handle(&self, command: SchedulerCommand) -> Result<()> {
            self.0.lock().push(command);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_routes_to_registered_node() {
        let dispatcher = LocalCommandDispatcher::new();
        let one = Arc::new(Recorder::default());
        let two = Arc::new(Recorder::default());
        let _s1 = dispatcher.register(1, "Cart", one.clone());
        let _s2 = dispatcher.register(2, "Cart", two.clone());

        let id = BeanId::new();
        dispatcher
            .execute_on(2, "Cart", SchedulerCommand::Cancel { id })
            .await
            .unwrap();

        assert!(one.0.lock().is_empty());
        assert_eq!(*two.0.lock(), vec![SchedulerCommand::Cancel { id }]);
    }

    #[tokio::test]
    async fn test_missing_handler() {
        let dispatcher = LocalCommandDispatcher::new();
        let err = dispatcher
            .execute_on(1, "Cart", SchedulerCommand::Cancel { id: BeanId::new() })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Dispatch(DispatchError::NoHandler { node_id: 1, .. })
        ));
    }

    #[test]
    fn test_dropping_subscription_unregisters() {
        let dispatcher = LocalCommandDispatcher::new();
        let subscription = dispatcher.register(1, "Cart", Arc::new(Recorder::default()));
        assert!(dispatcher.is_registered(1, "Cart"));

        drop(subscription);
        assert!(!dispatcher.is_registered(1, "Cart"));
    }

    #[test]
    fn test_stale_subscription_keeps_newer_handler() {
        let dispatcher = LocalCommandDispatcher::new();
        let old = dispatcher.register(1, "Cart", Arc::new(Recorder::default()));
        let _new = dispatcher.register(1, "Cart", Arc::new(Recorder::default()));

        drop(old);
        assert!(dispatcher.is_registered(1, "Cart"));
    }
}
