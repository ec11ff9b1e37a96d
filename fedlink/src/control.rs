//! Coordinator control loop
//!
//! One task visits every live pipe in order, once per iteration:
//!
//! | pipe state       | predicate        | on approval                     | on refusal  |
//! |------------------|------------------|---------------------------------|-------------|
//! | offline          | `BEFORE_DESTROY` | destroy, `AFTER_DESTROY`        | `AT_FAILED` |
//! | upload hang-up   |                  | resolve, `AFTER_UPLOAD`         |             |
//! | download hang-up |                  | resolve, `AFTER_DOWNLOAD`       |             |
//! | zombie           |                  | `AT_ZOMBIE`                     |             |
//! | peer pushing     | `BEFORE_DOWNLOAD`| download, `AFTER_DOWNLOAD`      | `AT_FAILED` |
//! | peer pulling     | `BEFORE_UPLOAD`  | upload, `AFTER_UPLOAD`          | `AT_FAILED` |
//! | anything else    |                  | `AT_INVALID_STATE`              |             |
//!
//! Every visit starts with `AT_FIRST`. An abstaining predicate skips the pipe
//! for this iteration. `AT_LAST` fires once per iteration after all visits,
//! idle iterations included, and only reaches global hooks.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use fedlink_core::aggregation::Aggregator;
use fedlink_core::info::{TaskInfo, VERSION};
use fedlink_core::reducer::Reducer;
use fedlink_core::traits::{FederatedModel, OptimizerStep};
use fedlink_models::params::ParamStore;
use fedlink_models::ModelState;
use fedlink_net::pipe::{Pipe, PipeState, Resolved, Transfer};
use fedlink_net::protocol::ModelEnvelope;
use fedlink_runtime::FedRuntime;

use crate::hooks::{dispatch, Actions, Hook, HookContext, HookFactory, Hooks, PipeView, RoundView};
use crate::phase::{Phase, Verdict};
use crate::{Error, FedConfig, LoopConfig, Result};

/// Why [`ControlLoop::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// No live pipes for too many consecutive iterations
    Idle,
    MaxVersion(i64),
    MaxLoopTimes(u64),
    /// A hook stopped the loop for its own reasons
    Stopped,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Idle => f.write_str("idle: no live connections"),
            ExitReason::MaxVersion(v) => write!(f, "finished: reached version {v}"),
            ExitReason::MaxLoopTimes(n) => write!(f, "finished: ran {n} iterations"),
            ExitReason::Stopped => f.write_str("stopped"),
        }
    }
}

struct Slot<R: FedRuntime> {
    pipe: Pipe<R>,
    view: PipeView,
    hooks: Hooks,
}

fn view_of<R: FedRuntime>(pipe: &Pipe<R>) -> PipeView {
    PipeView {
        nick_name: pipe.nick_name().to_string(),
        peer_nick_name: pipe.peer_nick_name().to_string(),
        request_version: pipe.request_version(),
        received_version: pipe.received_version(),
    }
}

/// Drives the leader ends of a coordinator's pipes.
pub struct ControlLoop<R: FedRuntime> {
    runtime: Arc<R>,
    config: LoopConfig,
    name: String,
    checkpoint_dir: Option<PathBuf>,
    slots: Vec<Slot<R>>,
    hooks: Hooks,
    factory: Option<Box<dyn HookFactory>>,
    aggregator: Aggregator,
    model: ParamStore,
    optimizer: Box<dyn OptimizerStep>,
    reducer: Option<Box<dyn Reducer>>,
    reduced: Option<TaskInfo>,
    version: i64,
    loop_times: u64,
    idle: u32,
    last_finalize_ms: u64,
}

impl<R: FedRuntime> fmt::Debug for ControlLoop<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlLoop")
            .field("name", &self.name)
            .field("pipes", &self.slots.len())
            .field("hooks", &self.hooks)
            .field("aggregator", &self.aggregator)
            .field("version", &self.version)
            .field("loop_times", &self.loop_times)
            .finish()
    }
}

impl<R: FedRuntime> ControlLoop<R> {
    pub fn new(
        pipes: Vec<Pipe<R>>,
        model: ParamStore,
        optimizer: Box<dyn OptimizerStep>,
        runtime: Arc<R>,
        config: &FedConfig,
    ) -> Result<Self> {
        config.validate()?;
        let mut control = Self {
            last_finalize_ms: runtime.now_ms(),
            runtime,
            config: config.control,
            name: config.name.clone(),
            checkpoint_dir: config.checkpoint_dir.clone(),
            slots: Vec::with_capacity(pipes.len()),
            hooks: Hooks::new(),
            factory: None,
            aggregator: config.policy.build()?,
            model,
            optimizer,
            reducer: None,
            reduced: None,
            version: 0,
            loop_times: 0,
            idle: 0,
        };
        for pipe in pipes {
            control.add_pipe(pipe)?;
        }
        Ok(control)
    }

    pub fn with_hook(mut self, hook: Box<dyn Hook>) -> Self {
        self.add_hook(hook);
        self
    }

    /// Per-connection hooks, also created for pipes already adopted
    pub fn with_hook_factory(mut self, factory: Box<dyn HookFactory>) -> Self {
        for slot in &mut self.slots {
            for hook in factory.create(&slot.view) {
                slot.hooks.register(hook);
            }
        }
        self.factory = Some(factory);
        self
    }

    /// Reduce the task infos of every finalized round
    pub fn with_reducer(mut self, reducer: Box<dyn Reducer>) -> Self {
        self.reducer = Some(reducer);
        self
    }

    /// Resume from a known round version
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    pub fn add_hook(&mut self, hook: Box<dyn Hook>) {
        self.hooks.register(hook);
    }

    /// Adopt a leader-side pipe.
    pub fn add_pipe(&mut self, pipe: Pipe<R>) -> Result<()> {
        if !pipe.is_leader() {
            return Err(Error::Config(format!(
                "{} joined the control loop as a follower",
                pipe.nick_name()
            )));
        }
        let view = view_of(&pipe);
        let mut hooks = Hooks::new();
        if let Some(factory) = &self.factory {
            for hook in factory.create(&view) {
                hooks.register(hook);
            }
        }
        tracing::debug!(peer = %view.peer_nick_name, hooks = hooks.len(), "pipe adopted");
        self.slots.push(Slot { pipe, view, hooks });
        Ok(())
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Contributions ingested in the current round
    pub fn received(&self) -> usize {
        self.aggregator.received()
    }

    pub fn loop_times(&self) -> u64 {
        self.loop_times
    }

    pub fn live_pipes(&self) -> usize {
        self.slots.len()
    }

    pub fn model(&self) -> &ParamStore {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut ParamStore {
        &mut self.model
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Reduced task info of the last finalized round
    pub fn reduced_info(&self) -> Option<&TaskInfo> {
        self.reduced.as_ref()
    }

    fn round(&self) -> RoundView {
        RoundView {
            version: self.version,
            received: self.aggregator.received(),
            loop_times: self.loop_times,
            now_ms: self.runtime.now_ms(),
            last_finalize_ms: self.last_finalize_ms,
        }
    }

    fn fire(&mut self, slot: Option<usize>, phase: Phase, outcome: Option<bool>, actions: &mut Actions) -> Verdict {
        let round = self.round();
        match slot.and_then(|i| self.slots.get_mut(i)) {
            Some(Slot { hooks, view, .. }) => {
                let ctx = HookContext::new(phase, round, Some(&*view), outcome, actions);
                dispatch(&mut self.hooks, Some(hooks), ctx)
            }
            None => {
                let ctx = HookContext::new(phase, round, None, outcome, actions);
                dispatch(&mut self.hooks, None, ctx)
            }
        }
    }

    /// Run until a hook stops the loop or it goes idle.
    pub async fn run(&mut self) -> Result<ExitReason> {
        tracing::info!(
            name = %self.name,
            pipes = self.slots.len(),
            policy = self.aggregator.policy_name(),
            version = self.version,
            "control loop started"
        );
        loop {
            self.loop_times += 1;

            let mut actions = Actions::default();
            self.fire(None, Phase::AtNewEpisode, None, &mut actions);
            if let Some(reason) = self.apply(actions)? {
                return Ok(self.shutdown(reason).await);
            }

            let idle = self.slots.is_empty();
            let mut i = 0;
            while i < self.slots.len() {
                let (removed, stop) = self.visit(i).await?;
                if let Some(reason) = stop {
                    return Ok(self.shutdown(reason).await);
                }
                if !removed {
                    i += 1;
                }
            }

            let mut actions = Actions::default();
            self.fire(None, Phase::AtLast, None, &mut actions);
            if let Some(reason) = self.apply(actions)? {
                return Ok(self.shutdown(reason).await);
            }

            if idle {
                self.idle += 1;
                if self.idle >= self.config.max_idle_iterations {
                    tracing::warn!(iterations = self.idle, "no live pipes left");
                    return Ok(self.shutdown(ExitReason::Idle).await);
                }
                self.runtime.sleep(self.config.idle_interval).await;
            } else {
                self.idle = 0;
                self.runtime.sleep(self.config.tick_interval).await;
            }
        }
    }

    /// Visit one pipe. Returns whether it was removed and whether a hook
    /// asked to stop.
    async fn visit(&mut self, i: usize) -> Result<(bool, Option<ExitReason>)> {
        let state = self.slots[i].pipe.observe().await;
        self.slots[i].view = view_of(&self.slots[i].pipe);
        tracing::trace!(peer = %self.slots[i].view.peer_nick_name, ?state, "visit");

        let mut actions = Actions::default();
        self.fire(Some(i), Phase::AtFirst, None, &mut actions);

        let mut removed = false;
        match state {
            PipeState::Offline => match self.fire(Some(i), Phase::BeforeDestroy, None, &mut actions) {
                Some(true) => {
                    self.slots[i].pipe.destroy().await;
                    self.fire(Some(i), Phase::AfterDestroy, Some(true), &mut actions);
                    removed = true;
                }
                Some(false) => {
                    self.fire(Some(i), Phase::AtFailed, None, &mut actions);
                }
                None => {}
            },
            PipeState::UploadHangUp => self.resolve(i, Phase::AfterUpload, &mut actions).await,
            PipeState::DownloadHangUp => self.resolve(i, Phase::AfterDownload, &mut actions).await,
            PipeState::Zombie => {
                self.fire(Some(i), Phase::AtZombie, None, &mut actions);
            }
            PipeState::PeerPushing => match self.fire(Some(i), Phase::BeforeDownload, None, &mut actions) {
                Some(true) => self.download(i, &mut actions).await,
                Some(false) => {
                    self.fire(Some(i), Phase::AtFailed, None, &mut actions);
                }
                None => {}
            },
            PipeState::PeerPulling => match self.fire(Some(i), Phase::BeforeUpload, None, &mut actions) {
                Some(true) => self.upload(i, &mut actions).await?,
                Some(false) => {
                    self.fire(Some(i), Phase::AtFailed, None, &mut actions);
                }
                None => {}
            },
            PipeState::Invalid => {
                self.fire(Some(i), Phase::AtInvalidState, None, &mut actions);
            }
        }

        if removed {
            self.slots.remove(i);
        }
        Ok((removed, self.apply(actions)?))
    }

    fn apply(&mut self, actions: Actions) -> Result<Option<ExitReason>> {
        if actions.finalize {
            match self.finalize_round() {
                Err(Error::Core(fedlink_core::Error::EmptyRound)) => {
                    tracing::warn!(version = self.version, "finalize requested with nothing received");
                }
                other => other?,
            }
        }
        Ok(actions.stop)
    }

    fn transfer_failed(&mut self, i: usize, err: fedlink_net::Error) {
        let pipe = &mut self.slots[i].pipe;
        tracing::warn!(peer = %pipe.peer_nick_name(), error = %err, "transfer failed");
        if matches!(
            err,
            fedlink_net::Error::ConnectionLost { .. } | fedlink_net::Error::Transport(_)
        ) {
            pipe.mark_offline();
        }
    }

    /// Decode a downloaded envelope into the aggregator.
    fn ingest(&mut self, i: usize, bytes: &[u8]) -> bool {
        let peer = &self.slots[i].view.peer_nick_name;
        let envelope = match ModelEnvelope::from_bytes(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(%peer, error = %err, "undecodable contribution");
                return false;
            }
        };
        if envelope.version < self.version {
            tracing::warn!(
                %peer,
                version = envelope.version,
                current = self.version,
                "stale contribution dropped"
            );
            return false;
        }
        match self
            .aggregator
            .ingest(&envelope.params, &envelope.info, self.model.parameters())
        {
            Ok(()) => {
                tracing::debug!(%peer, received = self.aggregator.received(), "contribution ingested");
                true
            }
            Err(err) => {
                tracing::warn!(%peer, error = %err, "contribution rejected");
                false
            }
        }
    }

    async fn download(&mut self, i: usize, actions: &mut Actions) {
        match self.slots[i].pipe.download(None).await {
            Ok(Transfer::Complete(bytes)) => {
                let ok = self.ingest(i, &bytes);
                self.fire(Some(i), Phase::AfterDownload, Some(ok), actions);
            }
            Ok(Transfer::HungUp) => {}
            Err(err) => {
                self.transfer_failed(i, err);
                self.fire(Some(i), Phase::AfterDownload, Some(false), actions);
            }
        }
    }

    fn envelope(&self) -> Result<Vec<u8>> {
        let mut info = TaskInfo::new().with(VERSION, self.version);
        if let Some(reduced) = &self.reduced {
            for (key, value) in reduced.iter() {
                if key != VERSION {
                    info.set(key.clone(), value.clone());
                }
            }
        }
        Ok(ModelEnvelope::new(self.version, self.model.pack(&[]), info).to_bytes()?)
    }

    async fn upload(&mut self, i: usize, actions: &mut Actions) -> Result<()> {
        let bytes = self.envelope()?;
        let version = self.version;
        match self.slots[i].pipe.upload(bytes, Some(version)).await {
            Ok(Transfer::Complete(())) => {
                tracing::debug!(peer = %self.slots[i].view.peer_nick_name, version, "model served");
                self.fire(Some(i), Phase::AfterUpload, Some(true), actions);
            }
            Ok(Transfer::HungUp) => {}
            Err(err) => {
                self.transfer_failed(i, err);
                self.fire(Some(i), Phase::AfterUpload, Some(false), actions);
            }
        }
        Ok(())
    }

    async fn resolve(&mut self, i: usize, after: Phase, actions: &mut Actions) {
        match self.slots[i].pipe.resolve_hang_up().await {
            Ok(Resolved::Pending) => {}
            Ok(Resolved::Uploaded) => {
                self.fire(Some(i), Phase::AfterUpload, Some(true), actions);
            }
            Ok(Resolved::Downloaded(bytes)) => {
                let ok = self.ingest(i, &bytes);
                self.fire(Some(i), Phase::AfterDownload, Some(ok), actions);
            }
            Err(err) => {
                self.transfer_failed(i, err);
                self.fire(Some(i), after, Some(false), actions);
            }
        }
    }

    /// Close the current round.
    ///
    /// Aggregates, applies the result through the optimizer, resets the
    /// aggregator, reduces task infos, writes a checkpoint and bumps the
    /// version.
    pub fn finalize_round(&mut self) -> Result<()> {
        let finalized = self.aggregator.finalize(self.model.parameters())?;
        finalized.apply(self.model.parameters_mut(), self.optimizer.as_mut())?;
        for (id, payload) in finalized.aux {
            for (key, value) in payload {
                self.model.set_state(id.clone(), key, value);
            }
        }

        let infos = self.aggregator.infos().to_vec();
        self.aggregator.reset();
        if let Some(reducer) = &self.reducer {
            self.reduced = Some(reducer.reduce(&infos)?);
        }

        self.version += 1;
        self.last_finalize_ms = self.runtime.now_ms();

        if let Some(dir) = &self.checkpoint_dir {
            let state = ModelState::new(&self.name, self.version, self.model.parameters().clone());
            let path = state.save(dir)?;
            tracing::debug!(path = %path.display(), "checkpoint written");
        }
        tracing::info!(
            version = self.version,
            received = infos.len(),
            policy = self.aggregator.policy_name(),
            "round finalized"
        );
        Ok(())
    }

    async fn shutdown(&mut self, reason: ExitReason) -> ExitReason {
        for mut slot in self.slots.drain(..) {
            slot.pipe.destroy().await;
        }
        tracing::info!(%reason, version = self.version, loops = self.loop_times, "control loop stopped");
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedlink_core::aggregation::Parameter;
    use fedlink_models::optim::Sgd;
    use fedlink_runtime::mock_runtime::MockRuntime;
    use std::time::Duration;

    fn model() -> ParamStore {
        let mut store = ParamStore::new();
        store.insert("w", Parameter::trainable(vec![0.0, 0.0]));
        store
    }

    fn control(rt: Arc<MockRuntime>) -> ControlLoop<MockRuntime> {
        let config = FedConfig::builder()
            .idle_interval(Duration::from_secs(1))
            .max_idle_iterations(3)
            .build()
            .unwrap();
        ControlLoop::new(Vec::new(), model(), Box::new(Sgd::default()), rt, &config).unwrap()
    }

    #[tokio::test]
    async fn idle_loop_exits() {
        let rt = Arc::new(MockRuntime::new());
        let mut control = control(Arc::clone(&rt));
        assert_eq!(control.run().await.unwrap(), ExitReason::Idle);
        assert_eq!(control.loop_times(), 3);
        assert_eq!(rt.slept(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn new_episode_hook_can_stop() {
        struct StopNow;
        impl Hook for StopNow {
            fn name(&self) -> &'static str {
                "stop_now"
            }
            fn phase(&self) -> Phase {
                Phase::AtNewEpisode
            }
            fn call(&mut self, ctx: &mut HookContext<'_>) -> Verdict {
                ctx.stop(ExitReason::Stopped);
                None
            }
        }

        let rt = Arc::new(MockRuntime::new());
        let mut control = control(rt).with_hook(Box::new(StopNow));
        assert_eq!(control.run().await.unwrap(), ExitReason::Stopped);
        assert_eq!(control.loop_times(), 1);
    }

    struct CountLast(Arc<std::sync::atomic::AtomicU64>);

    impl Hook for CountLast {
        fn name(&self) -> &'static str {
            "count_last"
        }
        fn phase(&self) -> Phase {
            Phase::AtLast
        }
        fn call(&mut self, _ctx: &mut HookContext<'_>) -> Verdict {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Some(true)
        }
    }

    #[tokio::test]
    async fn at_last_fires_on_idle_iterations() {
        let calls = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut control = control(Arc::new(MockRuntime::new())).with_hook(Box::new(CountLast(Arc::clone(&calls))));
        assert_eq!(control.run().await.unwrap(), ExitReason::Idle);
        assert_eq!(control.loop_times(), 3);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn idle_loop_still_terminates_on_version() {
        let rt = Arc::new(MockRuntime::new());
        let mut control = control(rt)
            .with_version(4)
            .with_hook(Box::new(crate::hooks::Terminate::at_version(4)));
        assert_eq!(control.run().await.unwrap(), ExitReason::MaxVersion(4));
        assert_eq!(control.loop_times(), 1);
    }

    #[test]
    fn empty_round_does_not_advance() {
        let mut control = control(Arc::new(MockRuntime::new()));
        assert!(matches!(
            control.finalize_round(),
            Err(Error::Core(fedlink_core::Error::EmptyRound))
        ));
        assert_eq!(control.version(), 0);
    }

    #[test]
    fn exit_reasons_render() {
        assert_eq!(ExitReason::MaxVersion(4).to_string(), "finished: reached version 4");
        assert!(ExitReason::Idle.to_string().starts_with("idle"));
    }
}
