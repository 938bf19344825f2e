//! Cluster view and command dispatch.

pub mod dispatcher;
pub mod events;
pub mod topology;

pub use dispatcher::{CommandDispatcher, CommandHandler, LocalCommandDispatcher};
pub use events::{LoggingTopologyListener, TopologyChangeEvent, TopologyListener};
pub use topology::{CacheMode, Topology};
