//! TCP server accepting commands dispatched by other nodes.

use crate::cluster::{CommandDispatcher, LocalCommandDispatcher};
use crate::error::{NetworkError, Result};
use crate::network::rpc::{read_frame, write_frame, CommandRequest, CommandResponse, Message};
use crate::types::NodeId;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// TCP server for command dispatch.
pub struct DispatchServer {
    /// This node's ID.
    node_id: NodeId,

    listener: TcpListener,

    /// Handlers registered on this node.
    handlers: LocalCommandDispatcher,

    /// Shutdown signal receiver.
    shutdown_rx: mpsc::Receiver<()>,
}

impl DispatchServer {
    /// Bind a server for `node_id` serving the handlers of `handlers`.
    pub async fn bind(
        bind_addr: SocketAddr,
        node_id: NodeId,
        handlers: LocalCommandDispatcher,
    ) -> Result<(Self, mpsc::Sender<()>)> {
        let listener = TcpListener::bind(bind_addr).await.map_err(NetworkError::Io)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = Self {
            node_id,
            listener,
            handlers,
            shutdown_rx,
        };
        Ok((server, shutdown_tx))
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::Io)?)
    }

    /// Run the server.
    pub async fn run(mut self) -> Result<()> {
        info!(node_id = self.node_id, addr = ?self.listener.local_addr().ok(), "Dispatch server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let handlers = self.handlers.clone();
                            let node_id = self.node_id;
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handlers, node_id).await {
                                    debug!(error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!(node_id = self.node_id, "Dispatch server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        mut stream: TcpStream,
        handlers: LocalCommandDispatcher,
        node_id: NodeId,
    ) -> Result<()> {
        while let Some(msg) = read_frame(&mut stream).await? {
            let Message::Command(request) = msg else {
                warn!(node_id, "Ignoring unexpected message");
                continue;
            };
            let response = Self::handle_request(&handlers, node_id, request).await;
            write_frame(&mut stream, &Message::Response(response)).await?;
        }
        Ok(())
    }

    async fn handle_request(
        handlers: &LocalCommandDispatcher,
        node_id: NodeId,
        request: CommandRequest,
    ) -> CommandResponse {
        if request.target != node_id {
            return CommandResponse::error(
                request.request_id,
                format!("command for node {} received by node {}", request.target, node_id),
            );
        }
        match handlers
            .execute_on(node_id, &request.service, request.command)
            .await
        {
            Ok(()) => CommandResponse::success(request.request_id),
            Err(e) => CommandResponse::error(request.request_id, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiration::SchedulerCommand;
    use crate::types::BeanId;

    #[tokio::test]
    async fn test_unknown_service_is_reported() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (server, shutdown_tx) = DispatchServer::bind(addr, 1, LocalCommandDispatcher::new())
            .await
            .unwrap();
        let actual_addr = server.local_addr().unwrap();
        let server_handle = tokio::spawn(server.run());

        let mut stream = TcpStream::connect(actual_addr).await.unwrap();
        let request = CommandRequest {
            request_id: 7,
            service: "Cart".to_string(),
            target: 1,
            command: SchedulerCommand::Cancel { id: BeanId::new() },
        };
        write_frame(&mut stream, &Message::Command(request)).await.unwrap();

        let Some(Message::Response(response)) = read_frame(&mut stream).await.unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(response.request_id, 7);
        assert!(!response.success);

        let _ = shutdown_tx.send(()).await;
        let _ = server_handle.await;
    }
}
