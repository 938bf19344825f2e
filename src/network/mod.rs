//! Network communication layer.

pub mod rpc;
pub mod server;
pub mod tcp;

pub use rpc::{CommandRequest, CommandResponse, Message};
pub use server::DispatchServer;
pub use tcp::TcpCommandDispatcher;
