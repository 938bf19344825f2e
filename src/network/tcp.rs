//! Command dispatch between processes over TCP.

use crate::cluster::{CommandDispatcher, CommandHandler, LocalCommandDispatcher};
use crate::config::DispatchConfig;
use crate::error::{DispatchError, NetworkError, Result};
use crate::expiration::SchedulerCommand;
use crate::network::rpc::{read_frame, write_frame, CommandRequest, Message};
use crate::subscription::Subscription;
use crate::types::NodeId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Dispatcher reaching other nodes through their [`DispatchServer`].
///
/// Commands for this node are handled in-process. Each remote command uses
/// its own connection: one request, one response.
///
/// [`DispatchServer`]: crate::network::DispatchServer
pub struct TcpCommandDispatcher {
    node_id: NodeId,
    config: DispatchConfig,
    addresses: DashMap<NodeId, SocketAddr>,
    handlers: LocalCommandDispatcher,
    next_request_id: AtomicU64,
}

impl TcpCommandDispatcher {
    pub fn new(node_id: NodeId, config: DispatchConfig) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            config,
            addresses: DashMap::new(),
            handlers: LocalCommandDispatcher::new(),
            next_request_id: AtomicU64::new(1),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Handlers of this node, to be served by a [`DispatchServer`](crate::network::DispatchServer).
    pub fn handlers(&self) -> LocalCommandDispatcher {
        self.handlers.clone()
    }

    /// Record the dispatch address of a node.
    pub fn add_node(&self, node_id: NodeId, addr: SocketAddr) {
        self.addresses.insert(node_id, addr);
    }

    pub fn remove_node(&self, node_id: NodeId) -> Option<SocketAddr> {
        self.addresses.remove(&node_id).map(|(_, addr)| addr)
    }

    async fn send(&self, addr: SocketAddr, request: CommandRequest) -> Result<()> {
        let request_id = request.request_id;
        let mut stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: "connect timed out".to_string(),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        write_frame(&mut stream, &Message::Command(request)).await?;
        match read_frame(&mut stream).await? {
            Some(Message::Response(response)) if response.request_id == request_id => {
                if response.success {
                    Ok(())
                } else {
                    let reason = response.error.unwrap_or_else(|| "unknown error".to_string());
                    Err(DispatchError::Remote(reason).into())
                }
            }
            Some(other) => Err(NetworkError::ReceiveFailed(format!("unexpected message {other:?}")).into()),
            None => Err(NetworkError::ConnectionClosed.into()),
        }
    }
}

#[async_trait]
impl CommandDispatcher for TcpCommandDispatcher {
    async fn execute_on(
        &self,
        node_id: NodeId,
        service: &str,
        command: SchedulerCommand,
    ) -> Result<()> {
        if node_id == self.node_id {
            return self.handlers.execute_on(node_id, service, command).await;
        }

        let addr = self
            .addresses
            .get(&node_id)
            .map(|entry| *entry.value())
            .ok_or(DispatchError::UnknownNode(node_id))?;
        let request = CommandRequest {
            request_id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
            service: service.to_string(),
            target: node_id,
            command,
        };
        trace!(node_id, service, request_id = request.request_id, "Sending command");

        match tokio::time::timeout(self.config.timeout, self.send(addr, request)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(node_id, service, "Command timed out");
                Err(DispatchError::Failed(format!("command to node {node_id} timed out")).into())
            }
        }
    }

    fn register(
        &self,
        node_id: NodeId,
        service: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Subscription {
        self.handlers.register(node_id, service, handler)
    }
}

impl fmt::Debug for TcpCommandDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpCommandDispatcher")
            .field("node_id", &self.node_id)
            .field("nodes", &self.addresses.len())
            .field("handlers", &self.handlers.handler_count())
            .finish()
    }
}
