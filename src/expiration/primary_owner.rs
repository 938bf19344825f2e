//! Routes scheduling to the primary owner of each bean.

use crate::bean::{BeanCache, BeanEntry, BeanKey, ExpirationMetaData};
use crate::cache::CacheValue;
use crate::cluster::{CommandDispatcher, CommandHandler, Topology, TopologyChangeEvent, TopologyListener};
use crate::error::{DispatchError, Result};
use crate::expiration::local::LocalScheduler;
use crate::expiration::{Scheduler, SchedulerCommand};
use crate::types::{BeanId, NodeId};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Scheduler that forwards each command to the member owning the bean.
pub struct PrimaryOwnerScheduler {
    node_id: NodeId,
    service: String,
    topology: Arc<Topology>,
    dispatcher: Arc<dyn CommandDispatcher>,
    local: Arc<LocalScheduler>,
}

impl PrimaryOwnerScheduler {
    pub fn new(
        node_id: NodeId,
        service: impl Into<String>,
        topology: Arc<Topology>,
        dispatcher: Arc<dyn CommandDispatcher>,
        local: Arc<LocalScheduler>,
    ) -> Self {
        Self {
            node_id,
            service: service.into(),
            topology,
            dispatcher,
            local,
        }
    }

    pub fn local(&self) -> &Arc<LocalScheduler> {
        &self.local
    }

    async fn execute(&self, command: SchedulerCommand) -> Result<()> {
        let id = command.id();
        let owner = self
            .topology
            .primary_owner(&BeanKey::Creation(id))
            .ok_or_else(|| DispatchError::Failed(format!("no primary owner for bean {id}")))?;

        if owner == self.node_id {
            return SchedulerCommandHandler::apply(&self.local, command);
        }
        debug!(bean_id = %id, owner, ?command, "Forwarding command to primary owner");
        self.dispatcher.execute_on(owner, &self.service, command).await
    }
}

#[async_trait]
impl Scheduler for PrimaryOwnerScheduler {
    async fn schedule(&self, id: BeanId, expiration: ExpirationMetaData) -> Result<()> {
        self.execute(SchedulerCommand::Schedule { id, expiration }).await
    }

    async fn cancel(&self, id: BeanId) -> Result<()> {
        self.execute(SchedulerCommand::Cancel { id }).await
    }
}

impl fmt::Debug for PrimaryOwnerScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimaryOwnerScheduler")
            .field("node_id", &self.node_id)
            .field("service", &self.service)
            .field("local", &self.local)
            .finish()
    }
}

/// Receives commands forwarded by other members.
pub struct SchedulerCommandHandler {
    local: Arc<LocalScheduler>,
}

impl SchedulerCommandHandler {
    pub fn new(local: Arc<LocalScheduler>) -> Self {
        Self { local }
    }

    fn apply(local: &LocalScheduler, command: SchedulerCommand) -> Result<()> {
        match command {
            SchedulerCommand::Schedule { id, expiration } => local.schedule_local(id, expiration),
            SchedulerCommand::Cancel { id } => {
                local.cancel_local(id);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CommandHandler for SchedulerCommandHandler {
    async fn handle(&self, command: SchedulerCommand) -> Result<()> {
        Self::apply(&self.local, command)
    }
}

/// Rebuilds this member's expiration timers after a topology change.
pub struct ScheduleRescan<T: CacheValue> {
    node_id: NodeId,
    bean_name: String,
    timeout: Duration,
    cache: Arc<BeanCache<T>>,
    topology: Weak<Topology>,
    local: Arc<LocalScheduler>,
}

impl<T: CacheValue> ScheduleRescan<T> {
    pub fn new(
        node_id: NodeId,
        bean_name: impl Into<String>,
        timeout: Duration,
        cache: Arc<BeanCache<T>>,
        topology: &Arc<Topology>,
        local: Arc<LocalScheduler>,
    ) -> Self {
        Self {
            node_id,
            bean_name: bean_name.into(),
            timeout,
            cache,
            topology: Arc::downgrade(topology),
            local,
        }
    }

    /// Drop timers for beans owned elsewhere and schedule owned beans that
    /// have none. Returns the number of beans newly scheduled.
    pub fn rescan(&self, topology: &Topology) -> usize {
        let owns = |id: &BeanId| topology.is_primary_owner(&BeanKey::Creation(*id), self.node_id);

        let dropped = self.local.retain(owns);
        let tracked: HashSet<BeanId> = self.local.scheduled_ids().into_iter().collect();

        let mut scheduled = 0;
        for (key, _) in self.cache.keys() {
            let BeanKey::Creation(id) = key else {
                continue;
            };
            if tracked.contains(&id) || !owns(&id) {
                continue;
            }
            match self.expiration_of(id) {
                Ok(Some(expiration)) => {
                    self.local.schedule_local(id, expiration);
                    scheduled += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(bean_id = %id, error = %e, "Failed to read bean during rescan"),
            }
        }

        info!(
            node_id = self.node_id,
            bean_name = %self.bean_name,
            version = topology.version(),
            dropped = dropped.len(),
            scheduled,
            "Rescanned expiration schedule"
        );
        scheduled
    }

    fn expiration_of(&self, id: BeanId) -> Result<Option<ExpirationMetaData>> {
        let creation = match self.cache.peek(&BeanKey::Creation(id))? {
            Some(BeanEntry::Creation(creation)) if creation.name == self.bean_name => creation,
            _ => return Ok(None),
        };
        let last_accessed_ms = match self.cache.peek(&BeanKey::Access(id))? {
            Some(BeanEntry::Access(access)) => access.last_accessed_ms,
            _ => creation.created_ms,
        };
        Ok(Some(ExpirationMetaData::new(self.timeout, last_accessed_ms)))
    }
}

impl<T: CacheValue> TopologyListener for ScheduleRescan<T> {
    fn topology_changed(&self, event: &TopologyChangeEvent) {
        if !event.is_member(self.node_id) {
            let dropped = self.local.retain(|_| false);
            debug!(node_id = self.node_id, dropped = dropped.len(), "Left the cluster, dropped all timers");
            return;
        }
        if let Some(topology) = self.topology.upgrade() {
            self.rescan(&topology);
        }
    }
}
