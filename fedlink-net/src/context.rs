//! Transport group registry and connection establishment
//!
//! Every pipe's transport group is registered in a [`FedContext`]. The
//! registry sits behind a mutex: establishing and releasing groups from
//! different tasks never interleave.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use fedlink_core::group::{GroupProperties, Role};
use fedlink_runtime::FedRuntime;
use parking_lot::Mutex;

use crate::mock::MemoryTransport;
use crate::pipe::{Pipe, PipeConfig};
use crate::store::MemoryStore;
use crate::traits::Link;
use crate::{Error, Result};

/// Registry handle of one transport group
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(u64);

/// What the registry knows about a live group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub nick_name: String,
    pub role: Role,
    pub endpoint: String,
    /// Local rank of the follower end
    pub follower_rank: usize,
}

/// Registry of live transport groups.
#[derive(Debug, Default)]
pub struct FedContext {
    groups: Mutex<BTreeMap<GroupId, GroupRecord>>,
    next_id: AtomicU64,
}

static GLOBAL: OnceLock<Arc<FedContext>> = OnceLock::new();

impl FedContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The process-wide context
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(FedContext::new))
    }

    pub fn register(&self, record: GroupRecord) -> GroupId {
        let id = GroupId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.groups.lock().insert(id, record);
        id
    }

    /// Release a group. Returns `false` if it was already gone.
    pub fn release(&self, id: GroupId) -> bool {
        self.groups.lock().remove(&id).is_some()
    }

    pub fn live_groups(&self) -> usize {
        self.groups.lock().len()
    }

    pub fn records(&self) -> Vec<GroupRecord> {
        self.groups.lock().values().cloned().collect()
    }

    /// Connect `props` and open one pipe per link.
    ///
    /// A leader gets one pipe per follower; a follower gets exactly one.
    pub async fn establish<R: FedRuntime>(
        self: &Arc<Self>,
        props: &GroupProperties,
        connector: &dyn Connector,
        runtime: Arc<R>,
        config: PipeConfig,
    ) -> Result<Vec<Pipe<R>>> {
        let links = connector.connect(props).await?;
        let mut pipes = Vec::with_capacity(links.len());
        for (i, link) in links.into_iter().enumerate() {
            let follower_rank = match props.role {
                Role::Leader => i + 1,
                Role::Follower => props.rank(),
            };
            let pipe = Pipe::open(props.clone(), link, Arc::clone(&runtime), config).await?;
            let id = self.register(GroupRecord {
                nick_name: props.nick_name.clone(),
                role: props.role,
                endpoint: props.address.endpoint.clone(),
                follower_rank,
            });
            pipes.push(pipe.with_registration(Arc::clone(self), id));
        }
        tracing::info!(
            nick_name = %props.nick_name,
            role = %props.role,
            pipes = pipes.len(),
            "connection established"
        );
        Ok(pipes)
    }
}

/// Turns group properties into per-peer links.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, props: &GroupProperties) -> Result<Vec<Link>>;
}

#[derive(Debug)]
struct PendingLink {
    store: MemoryStore,
    leader: Option<MemoryTransport>,
    follower: Option<MemoryTransport>,
}

impl PendingLink {
    fn new() -> Self {
        let (leader, follower) = MemoryTransport::pair();
        Self {
            store: MemoryStore::new(),
            leader: Some(leader),
            follower: Some(follower),
        }
    }
}

#[derive(Debug)]
struct Slot {
    world_size: usize,
    links: BTreeMap<usize, PendingLink>,
}

/// In-process connector: leaders and followers meeting at the same endpoint
/// are paired through memory stores and transports.
#[derive(Debug, Clone, Default)]
pub struct LocalHub {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store shared by the leader at `endpoint` and its follower `rank`
    pub fn store(&self, endpoint: &str, rank: usize) -> Option<MemoryStore> {
        self.slots
            .lock()
            .get(endpoint)
            .and_then(|slot| slot.links.get(&rank))
            .map(|link| link.store.clone())
    }

    fn claim(&self, endpoint: &str, world_size: usize, rank: usize, role: Role) -> Result<Link> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(endpoint.to_string()).or_insert_with(|| Slot {
            world_size,
            links: BTreeMap::new(),
        });
        if slot.world_size != world_size {
            return Err(Error::NotConnected(format!(
                "{endpoint}: world size {world_size} does not match {}",
                slot.world_size
            )));
        }
        let link = slot.links.entry(rank).or_insert_with(PendingLink::new);
        let half = match role {
            Role::Leader => link.leader.take(),
            Role::Follower => link.follower.take(),
        };
        let transport = half.ok_or_else(|| {
            Error::NotConnected(format!("{endpoint}: {role} end of rank {rank} already claimed"))
        })?;
        Ok(Link {
            store: Arc::new(link.store.clone()),
            transport: Arc::new(transport),
        })
    }
}

#[async_trait]
impl Connector for LocalHub {
    async fn connect(&self, props: &GroupProperties) -> Result<Vec<Link>> {
        let world_size = props.world_size();
        if props.address.is_null() || world_size < 2 {
            return Err(Error::NotConnected(props.nick_name.clone()));
        }
        let endpoint = &props.address.endpoint;
        match props.role {
            Role::Leader => (1..world_size)
                .map(|rank| self.claim(endpoint, world_size, rank, Role::Leader))
                .collect(),
            Role::Follower => Ok(vec![self.claim(endpoint, world_size, props.rank(), Role::Follower)?]),
        }
    }
}
