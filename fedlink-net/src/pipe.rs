//! Push/pull/zombie/offline handshake over a rendezvous store
//!
//! Each end of a pipe publishes a [`ControlBlob`] under its own key and polls
//! the peer's key. Reads may be stale or fail outright, so every transfer is
//! tied to a request counter: the follower bumps `request` when it wants to
//! send or receive, the leader answers by echoing it in `ack`. A PUSH/PULL
//! whose request was already served is treated as idle.
//!
//! The follower waits (bounded by the transfer deadline) for the leader to
//! acknowledge. The leader never waits: it only serves a request it can see.

use std::sync::Arc;
use std::time::Duration;

use fedlink_core::group::{GroupProperties, Role, FOLLOWER_RANK, LEADER_RANK};
use fedlink_runtime::{Deadline, FedRuntime};
use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::context::{FedContext, GroupId};
use crate::protocol::{identity_key, ControlBlob, PipeStatus};
use crate::store::RendezvousStore;
use crate::traits::{Link, PairTransport};
use crate::{Error, Result};

/// How long a follower waits for its leader, and how long a peer may stay
/// unreadable before it is assumed offline
pub const DEFAULT_TRANSFER_DEADLINE: Duration = Duration::from_secs(30 * 60);
/// Delay between two reads of the peer's control blob while waiting
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Pipe tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeConfig {
    pub transfer_deadline: Duration,
    pub poll_interval: Duration,
    /// Leader transfers run in the background and are resolved later
    pub async_transfers: bool,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            transfer_deadline: DEFAULT_TRANSFER_DEADLINE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            async_transfers: false,
        }
    }
}

/// What the control loop should do with a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Offline,
    UploadHangUp,
    DownloadHangUp,
    Zombie,
    /// The peer wants to send: download from it
    PeerPushing,
    /// The peer wants to receive: upload to it
    PeerPulling,
    Invalid,
}

/// Outcome of starting a transfer
#[derive(Debug, PartialEq)]
pub enum Transfer<T> {
    Complete(T),
    /// Running in the background; see [`Pipe::resolve_hang_up`]
    HungUp,
}

/// Outcome of checking on a hung-up transfer
#[derive(Debug, PartialEq)]
pub enum Resolved {
    Pending,
    Uploaded,
    Downloaded(Vec<u8>),
}

#[derive(Debug)]
enum HangUp {
    Upload {
        rx: oneshot::Receiver<Result<()>>,
        deadline: Deadline,
        request: u64,
    },
    Download {
        rx: oneshot::Receiver<Result<Vec<u8>>>,
        deadline: Deadline,
        request: u64,
    },
}

/// One end of a point-to-point connection.
pub struct Pipe<R: FedRuntime> {
    props: GroupProperties,
    store: Arc<dyn RendezvousStore>,
    /// Dropped on destroy
    transport: Option<Arc<dyn PairTransport>>,
    runtime: Arc<R>,
    config: PipeConfig,
    own: ControlBlob,
    peer: ControlBlob,
    read_succeeded: bool,
    failing_since: Option<u64>,
    served: u64,
    hang_up: Option<HangUp>,
    offline: bool,
    registration: Option<(Arc<FedContext>, GroupId)>,
}

impl<R: FedRuntime> std::fmt::Debug for Pipe<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("role", &self.props.role)
            .field("nick_name", &self.own.nick_name)
            .field("peer", &self.peer.nick_name)
            .field("status", &self.own.status)
            .field("peer_status", &self.peer.status)
            .field("offline", &self.offline)
            .finish()
    }
}

impl<R: FedRuntime> Pipe<R> {
    /// Publish the initial blob and wait for the peer's to appear.
    pub async fn open(
        props: GroupProperties,
        link: Link,
        runtime: Arc<R>,
        config: PipeConfig,
    ) -> Result<Self> {
        let own = ControlBlob::initial(props.nick_name.clone());
        let Link { store, transport } = link;
        let mut pipe = Self {
            props,
            store,
            transport: Some(transport),
            runtime,
            config,
            own,
            peer: ControlBlob::initial(String::new()),
            read_succeeded: true,
            failing_since: None,
            served: 0,
            hang_up: None,
            offline: false,
            registration: None,
        };
        pipe.publish().await?;

        let deadline = Deadline::from_now(&*pipe.runtime, config.transfer_deadline);
        loop {
            match pipe.read_peer().await {
                Ok(blob) => {
                    pipe.peer = blob;
                    break;
                }
                Err(error) => {
                    if deadline.expired(pipe.runtime.now_ms()) {
                        return Err(Error::lost(&pipe.props.address.endpoint, "peer never joined"));
                    }
                    tracing::trace!(nick_name = %pipe.own.nick_name, %error, "waiting for peer to join");
                    pipe.runtime.sleep(config.poll_interval).await;
                }
            }
        }

        tracing::debug!(
            role = %pipe.role(),
            nick_name = %pipe.own.nick_name,
            peer = %pipe.peer.nick_name,
            "pipe opened"
        );
        Ok(pipe)
    }

    pub(crate) fn with_registration(mut self, ctx: Arc<FedContext>, id: GroupId) -> Self {
        self.registration = Some((ctx, id));
        self
    }

    pub fn props(&self) -> &GroupProperties {
        &self.props
    }

    pub fn role(&self) -> Role {
        self.props.role
    }

    pub fn is_leader(&self) -> bool {
        self.props.role == Role::Leader
    }

    pub fn is_follower(&self) -> bool {
        self.props.role == Role::Follower
    }

    pub fn nick_name(&self) -> &str {
        &self.own.nick_name
    }

    /// Peer nick name as last read
    pub fn peer_nick_name(&self) -> &str {
        &self.peer.nick_name
    }

    /// Our own published status
    pub fn status(&self) -> PipeStatus {
        self.own.status
    }

    /// Whether the last read of the peer's blob succeeded
    pub fn read_succeeded(&self) -> bool {
        self.read_succeeded
    }

    /// Version the peer last uploaded (cached)
    pub fn received_version(&self) -> i64 {
        self.peer.upload_version
    }

    /// Version the peer asks to download (cached)
    pub fn request_version(&self) -> i64 {
        self.peer.download_version
    }

    /// Destroyed or marked offline locally
    pub fn is_offline(&self) -> bool {
        self.offline
    }

    /// Whether the payload transport is still held
    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Stop using this pipe; the next [`Pipe::observe`] reports `Offline`.
    pub fn mark_offline(&mut self) {
        self.offline = true;
    }

    fn peer_label(&self) -> &str {
        if self.peer.nick_name.is_empty() {
            &self.props.address.endpoint
        } else {
            &self.peer.nick_name
        }
    }

    async fn read_peer(&self) -> Result<ControlBlob> {
        let bytes = self.store.get(&identity_key(self.role().anti())).await?;
        ControlBlob::decode(&bytes)
    }

    /// Read the peer's control blob.
    ///
    /// On failure the cached blob is kept and its status degraded: a leader
    /// peer is assumed offline, a follower peer idle until reads have failed
    /// for longer than the transfer deadline.
    pub async fn peer_info(&mut self) -> &ControlBlob {
        match self.read_peer().await {
            Ok(blob) => {
                self.peer = blob;
                self.read_succeeded = true;
                self.failing_since = None;
            }
            Err(error) => {
                let now = self.runtime.now_ms();
                let since = *self.failing_since.get_or_insert(now);
                let expired = Deadline::after(since, self.config.transfer_deadline).expired(now);
                self.read_succeeded = false;
                self.peer.status = if self.is_follower() || expired {
                    PipeStatus::Offline
                } else {
                    PipeStatus::Zombie
                };
                tracing::warn!(
                    nick_name = %self.own.nick_name,
                    %error,
                    assumed = ?self.peer.status,
                    "peer control blob unreadable"
                );
            }
        }
        &self.peer
    }

    async fn publish(&mut self) -> Result<()> {
        self.own.timestep_ms = self.runtime.now_ms();
        let bytes = self.own.encode()?;
        self.store.set(&identity_key(self.role()), bytes).await?;
        Ok(())
    }

    /// Publish our blob. Returns `false` if the store rejected it.
    async fn write(&mut self) -> bool {
        match self.publish().await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(nick_name = %self.own.nick_name, %error, "control blob not published");
                false
            }
        }
    }

    pub async fn set_status(&mut self, status: PipeStatus) -> bool {
        self.own.status = status;
        self.write().await
    }

    pub async fn set_upload_version(&mut self, version: i64) -> bool {
        self.own.upload_version = version;
        self.write().await
    }

    pub async fn set_download_version(&mut self, version: i64) -> bool {
        self.own.download_version = version;
        self.write().await
    }

    fn ensure_transferable(&self) -> Result<()> {
        if self.offline {
            return Err(Error::lost(self.peer_label(), "pipe is offline"));
        }
        if self.hang_up.is_some() {
            return Err(Error::Transport("a transfer is already hung up".into()));
        }
        let size = self.transport()?.group_size();
        if size != 2 {
            return Err(Error::NotPointToPoint { size });
        }
        Ok(())
    }

    fn transport(&self) -> Result<&Arc<dyn PairTransport>> {
        self.transport
            .as_ref()
            .ok_or_else(|| Error::lost(self.peer_label(), "transport torn down"))
    }

    fn peer_rank(&self) -> usize {
        if self.is_leader() {
            FOLLOWER_RANK
        } else {
            LEADER_RANK
        }
    }

    /// Follower side: publish `status` with a fresh request and wait until
    /// the leader acknowledges it.
    async fn request(&mut self, status: PipeStatus) -> Result<()> {
        if self.peer_info().await.status == PipeStatus::Offline {
            return Err(Error::lost(self.peer_label(), "peer is offline"));
        }

        self.own.request += 1;
        let request = self.own.request;
        if !self.set_status(status).await {
            return Err(Error::lost(self.peer_label(), "request not published"));
        }

        let deadline = Deadline::from_now(&*self.runtime, self.config.transfer_deadline);
        loop {
            let (peer_status, ack) = {
                let peer = self.peer_info().await;
                (peer.status, peer.ack)
            };
            if peer_status == PipeStatus::Offline {
                return Err(Error::lost(self.peer_label(), "peer went offline"));
            }
            if ack >= request {
                return Ok(());
            }
            if deadline.expired(self.runtime.now_ms()) {
                return Err(Error::lost(self.peer_label(), "timed out waiting for peer"));
            }
            self.runtime.sleep(self.config.poll_interval).await;
        }
    }

    /// Leader side: serve the peer's pending request if it is `expected`.
    async fn claim(&mut self, expected: PipeStatus, reply: PipeStatus) -> Result<u64> {
        let (status, request) = {
            let peer = self.peer_info().await;
            (peer.status, peer.request)
        };
        if status != expected || request <= self.served {
            return Err(Error::lost(self.peer_label(), "peer is not requesting this transfer"));
        }
        self.own.ack = request;
        if !self.set_status(reply).await {
            return Err(Error::lost(self.peer_label(), "acknowledgement not published"));
        }
        Ok(request)
    }

    async fn finish(&mut self, request: u64) {
        self.served = request;
        self.set_status(PipeStatus::Zombie).await;
    }

    async fn pull_payload(&self) -> Result<Vec<u8>> {
        match tokio::time::timeout(self.config.transfer_deadline, self.transport()?.pull()).await {
            Ok(result) => result,
            Err(_) => Err(Error::lost(self.peer_label(), "payload never arrived")),
        }
    }

    /// Send `payload` to the peer.
    pub async fn upload(&mut self, payload: Vec<u8>, version: Option<i64>) -> Result<Transfer<()>> {
        self.ensure_transferable()?;
        if let Some(version) = version {
            self.own.upload_version = version;
        }
        let dest = self.peer_rank();

        if self.is_follower() {
            self.request(PipeStatus::Push).await?;
            self.transport()?.push(payload, dest).await?;
            self.set_status(PipeStatus::Zombie).await;
            return Ok(Transfer::Complete(()));
        }

        let request = self.claim(PipeStatus::Pull, PipeStatus::Push).await?;
        if self.config.async_transfers {
            let transport = Arc::clone(self.transport()?);
            let (tx, rx) = oneshot::channel();
            self.runtime.spawn(async move {
                let _ = tx.send(transport.push(payload, dest).await);
            });
            self.served = request;
            self.hang_up = Some(HangUp::Upload {
                rx,
                deadline: Deadline::from_now(&*self.runtime, self.config.transfer_deadline),
                request,
            });
            return Ok(Transfer::HungUp);
        }

        self.transport()?.push(payload, dest).await?;
        self.finish(request).await;
        Ok(Transfer::Complete(()))
    }

    /// Receive a payload from the peer.
    pub async fn download(&mut self, version: Option<i64>) -> Result<Transfer<Vec<u8>>> {
        self.ensure_transferable()?;
        if let Some(version) = version {
            self.own.download_version = version;
        }

        if self.is_follower() {
            self.request(PipeStatus::Pull).await?;
            let data = self.pull_payload().await?;
            self.set_status(PipeStatus::Zombie).await;
            return Ok(Transfer::Complete(data));
        }

        let request = self.claim(PipeStatus::Push, PipeStatus::Pull).await?;
        if self.config.async_transfers {
            let transport = Arc::clone(self.transport()?);
            let timeout = self.config.transfer_deadline;
            let peer = self.peer_label().to_string();
            let (tx, rx) = oneshot::channel();
            self.runtime.spawn(async move {
                let result = match tokio::time::timeout(timeout, transport.pull()).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::lost(&peer, "payload never arrived")),
                };
                let _ = tx.send(result);
            });
            self.served = request;
            self.hang_up = Some(HangUp::Download {
                rx,
                deadline: Deadline::from_now(&*self.runtime, self.config.transfer_deadline),
                request,
            });
            return Ok(Transfer::HungUp);
        }

        let data = self.pull_payload().await?;
        self.finish(request).await;
        Ok(Transfer::Complete(data))
    }

    /// Check on a background transfer started with `async_transfers`.
    pub async fn resolve_hang_up(&mut self) -> Result<Resolved> {
        let hang_up = self.hang_up.take().ok_or(Error::NoHangUp)?;
        let now = self.runtime.now_ms();

        match hang_up {
            HangUp::Upload {
                mut rx,
                deadline,
                request,
            } => match rx.try_recv() {
                Ok(result) => {
                    result?;
                    self.finish(request).await;
                    Ok(Resolved::Uploaded)
                }
                Err(TryRecvError::Empty) if !deadline.expired(now) => {
                    self.hang_up = Some(HangUp::Upload {
                        rx,
                        deadline,
                        request,
                    });
                    Ok(Resolved::Pending)
                }
                Err(TryRecvError::Empty) => Err(Error::lost(self.peer_label(), "hung-up upload timed out")),
                Err(TryRecvError::Closed) => Err(Error::lost(self.peer_label(), "hung-up upload aborted")),
            },
            HangUp::Download {
                mut rx,
                deadline,
                request,
            } => match rx.try_recv() {
                Ok(result) => {
                    let data = result?;
                    self.finish(request).await;
                    Ok(Resolved::Downloaded(data))
                }
                Err(TryRecvError::Empty) if !deadline.expired(now) => {
                    self.hang_up = Some(HangUp::Download {
                        rx,
                        deadline,
                        request,
                    });
                    Ok(Resolved::Pending)
                }
                Err(TryRecvError::Empty) => Err(Error::lost(self.peer_label(), "hung-up download timed out")),
                Err(TryRecvError::Closed) => Err(Error::lost(self.peer_label(), "hung-up download aborted")),
            },
        }
    }

    /// Classify the pipe for the control loop.
    pub async fn observe(&mut self) -> PipeState {
        if self.offline {
            return PipeState::Offline;
        }
        match self.hang_up {
            Some(HangUp::Upload { .. }) => return PipeState::UploadHangUp,
            Some(HangUp::Download { .. }) => return PipeState::DownloadHangUp,
            None => {}
        }

        let (status, request) = {
            let peer = self.peer_info().await;
            (peer.status, peer.request)
        };
        let stale = self.is_leader() && request <= self.served;
        match status {
            PipeStatus::Offline => PipeState::Offline,
            PipeStatus::Zombie => PipeState::Zombie,
            PipeStatus::Push | PipeStatus::Pull if stale => PipeState::Zombie,
            PipeStatus::Push => PipeState::PeerPushing,
            PipeStatus::Pull => PipeState::PeerPulling,
            PipeStatus::Unknown => PipeState::Invalid,
        }
    }

    /// Publish OFFLINE, drop the transport and release the transport group.
    pub async fn destroy(&mut self) {
        self.offline = true;
        self.hang_up = None;
        self.set_status(PipeStatus::Offline).await;
        self.transport = None;
        if let Some((ctx, id)) = self.registration.take() {
            ctx.release(id);
        }
        tracing::info!(
            nick_name = %self.own.nick_name,
            peer = %self.peer.nick_name,
            "pipe destroyed"
        );
    }
}
