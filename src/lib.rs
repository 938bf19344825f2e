//! Clustered lifecycle management for stateful beans.
//!
//! This crate keeps stateful bean instances in a cache shared by the nodes
//! of a cluster and manages their lifecycle:
//! - **Metadata** records per bean, split into creation and access entries
//! - **Groups** of instances that are written and passivated as a unit
//! - **Expiration** of idle beans by the primary owner of each bean only
//! - **Passivation** with all-or-nothing callbacks per group
//!
//! # Example
//!
//! ```rust,no_run
//! use roaster::{BeanId, BeanInstance, BeanManager, BeanManagerConfig, GroupId};
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Cart {
//!     id: BeanId,
//!     items: Vec<String>,
//! }
//!
//! impl BeanInstance for Cart {
//!     fn id(&self) -> BeanId {
//!         self.id
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BeanManagerConfig::new("Cart", 1).with_timeout(Duration::from_secs(600));
//!     let manager = BeanManager::<Cart>::builder(config).build()?;
//!     manager.start()?;
//!
//!     let cart = Cart { id: BeanId::new(), items: Vec::new() };
//!     let id = cart.id;
//!     manager.create_bean(cart, GroupId::from(id)).await?.close().await?;
//!
//!     // Closing a found bean re-arms its expiration.
//!     if let Some(mut bean) = manager.find_bean(id).await? {
//!         if let Some(cart) = bean.instance_mut() {
//!             cart.items.push("book".to_string());
//!         }
//!         bean.close().await?;
//!     }
//!
//!     manager.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               BeanManager                   │
//! │  • create_bean / find_bean / remove_bean    │
//! │  • affinity hints, counts, metrics          │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌─────────┐   ┌───────────┐   ┌─────────────┐
//! │ Factory │   │ Scheduler │   │ Passivation │
//! │ + Groups│   │ (owner)   │   │ listener    │
//! └─────────┘   └───────────┘   └─────────────┘
//!     │               │               │
//!     ▼               ▼               ▼
//! ┌─────────────────────────────────────────────┐
//! │  Cache (batches, locks, two tiers)          │
//! │  Topology (hash ring) · CommandDispatcher   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Expiration Model
//!
//! - A released bean is scheduled on the primary owner of its records
//! - Any node may schedule or cancel; commands are forwarded to the owner
//! - Topology changes move timers by rescanning, not by hand-off
//! - The expiration task never waits for a lock; busy beans are retried

pub mod affinity;
pub mod bean;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod expiration;
pub mod manager;
pub mod marshal;
pub mod metrics;
pub mod network;
pub mod partitioning;
pub mod passivation;
pub mod subscription;
pub mod testing;
pub mod types;

pub use affinity::Affinity;
pub use bean::{
    Bean, BeanCache, BeanInstance, BeanKey, BeanMetaData, ExpirationMetaData, IdentifierFactory,
    ImmutableBeanMetaData, RemoveListener, UuidIdentifierFactory,
};
pub use cache::{Cache, CacheListener, Flags, Tier};
pub use cluster::{
    CacheMode, CommandDispatcher, CommandHandler, LocalCommandDispatcher, LoggingTopologyListener,
    Topology, TopologyChangeEvent, TopologyListener,
};
pub use config::{BeanManagerConfig, CacheConfig, DispatchConfig, EvictionConfig, SchedulerConfig};
pub use error::{Error, LifecycleError, Result};
pub use expiration::{LocalScheduler, PrimaryOwnerScheduler, Scheduler, SchedulerCommand};
pub use manager::{BeanManager, BeanManagerBuilder};
pub use marshal::{BincodeMarshaller, Marshaller, MarshallingContext};
pub use metrics::{BeanMetrics, BeanMetricsSnapshot};
pub use network::{DispatchServer, TcpCommandDispatcher};
pub use partitioning::{HashRing, KeyOwnership, OwnershipRole};
pub use subscription::Subscription;
pub use types::{BeanId, Clock, GroupId, ManualClock, NodeId, SystemClock};
