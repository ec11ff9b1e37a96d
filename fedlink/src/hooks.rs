//! Hooks run by the control loop
//!
//! A hook listens on one [`Phase`] and answers with a [`Verdict`]. Global
//! hooks are registered on the loop; per-connection hooks come from a
//! [`HookFactory`] invoked once for every pipe the loop adopts.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::control::ExitReason;
use crate::phase::{reduce_verdicts, Phase, Verdict};

/// Round-level counters visible to hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundView {
    pub version: i64,
    /// Contributions ingested since the last finalization
    pub received: usize,
    pub loop_times: u64,
    pub now_ms: u64,
    pub last_finalize_ms: u64,
}

/// The pipe being visited
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeView {
    pub nick_name: String,
    pub peer_nick_name: String,
    /// Version the peer asked to download
    pub request_version: i64,
    /// Version the peer says its upload belongs to
    pub received_version: i64,
}

/// Requests a hook can make of the loop
#[derive(Debug, Default)]
pub(crate) struct Actions {
    pub(crate) finalize: bool,
    pub(crate) stop: Option<ExitReason>,
}

pub struct HookContext<'a> {
    pub phase: Phase,
    pub round: RoundView,
    pub pipe: Option<&'a PipeView>,
    /// Whether the transfer that preceded an AFTER phase succeeded
    pub outcome: Option<bool>,
    actions: &'a mut Actions,
}

impl<'a> HookContext<'a> {
    pub(crate) fn new(
        phase: Phase,
        round: RoundView,
        pipe: Option<&'a PipeView>,
        outcome: Option<bool>,
        actions: &'a mut Actions,
    ) -> Self {
        Self {
            phase,
            round,
            pipe,
            outcome,
            actions,
        }
    }

    /// Close the current round once this dispatch returns
    pub fn request_finalize(&mut self) {
        self.actions.finalize = true;
    }

    pub fn finalize_requested(&self) -> bool {
        self.actions.finalize
    }

    /// Stop the loop; the first reason wins
    pub fn stop(&mut self, reason: ExitReason) {
        self.actions.stop.get_or_insert(reason);
    }
}

pub trait Hook: Send {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    fn phase(&self) -> Phase;

    fn call(&mut self, ctx: &mut HookContext<'_>) -> Verdict;
}

/// Builds per-connection hooks when a pipe joins the loop.
pub trait HookFactory: Send + Sync {
    fn create(&self, pipe: &PipeView) -> Vec<Box<dyn Hook>>;
}

/// Hooks grouped by phase, in registration order
#[derive(Default)]
pub struct Hooks {
    by_phase: BTreeMap<Phase, Vec<Box<dyn Hook>>>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (phase, hooks) in &self.by_phase {
            let names: Vec<_> = hooks.iter().map(|h| h.name()).collect();
            map.entry(phase, &names);
        }
        map.finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Box<dyn Hook>) {
        self.by_phase.entry(hook.phase()).or_default().push(hook);
    }

    pub fn len(&self) -> usize {
        self.by_phase.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn call_all(&mut self, ctx: &mut HookContext<'_>) -> Vec<Verdict> {
        let Some(hooks) = self.by_phase.get_mut(&ctx.phase) else {
            return Vec::new();
        };
        hooks
            .iter_mut()
            .map(|hook| {
                let verdict = hook.call(ctx);
                tracing::trace!(hook = hook.name(), phase = %ctx.phase, ?verdict, "hook");
                verdict
            })
            .collect()
    }
}

/// Run the global hooks, then the pipe's own, and reduce their verdicts.
pub(crate) fn dispatch(
    global: &mut Hooks,
    local: Option<&mut Hooks>,
    mut ctx: HookContext<'_>,
) -> Verdict {
    let mut verdicts = global.call_all(&mut ctx);
    if let Some(local) = local {
        verdicts.extend(local.call_all(&mut ctx));
    }
    reduce_verdicts(verdicts)
}

/// Finalize once `count` contributions have arrived.
#[derive(Debug, Clone, Copy)]
pub struct AggregateCount {
    count: usize,
}

impl AggregateCount {
    pub fn new(count: usize) -> Self {
        Self {
            count: count.max(1),
        }
    }
}

impl Hook for AggregateCount {
    fn name(&self) -> &'static str {
        "aggregate_count"
    }

    fn phase(&self) -> Phase {
        Phase::AtLast
    }

    fn call(&mut self, ctx: &mut HookContext<'_>) -> Verdict {
        if ctx.round.received >= self.count {
            ctx.request_finalize();
        }
        Some(true)
    }
}

/// Finalize once `period` elapsed since the last round closed, provided
/// something arrived.
#[derive(Debug, Clone, Copy)]
pub struct AggregatePeriod {
    period: Duration,
}

impl AggregatePeriod {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl Hook for AggregatePeriod {
    fn name(&self) -> &'static str {
        "aggregate_period"
    }

    fn phase(&self) -> Phase {
        Phase::AtLast
    }

    fn call(&mut self, ctx: &mut HookContext<'_>) -> Verdict {
        let elapsed = ctx.round.now_ms.saturating_sub(ctx.round.last_finalize_ms);
        if ctx.round.received > 0 && elapsed >= self.period.as_millis() as u64 {
            ctx.request_finalize();
        }
        Some(true)
    }
}

/// Stop the loop after a version or iteration bound.
#[derive(Debug, Clone, Copy, Default)]
pub struct Terminate {
    pub max_version: Option<i64>,
    pub max_loop_times: Option<u64>,
}

impl Terminate {
    pub fn at_version(max_version: i64) -> Self {
        Self {
            max_version: Some(max_version),
            max_loop_times: None,
        }
    }

    pub fn after_loops(max_loop_times: u64) -> Self {
        Self {
            max_version: None,
            max_loop_times: Some(max_loop_times),
        }
    }
}

impl Hook for Terminate {
    fn name(&self) -> &'static str {
        "terminate"
    }

    fn phase(&self) -> Phase {
        Phase::AtLast
    }

    fn call(&mut self, ctx: &mut HookContext<'_>) -> Verdict {
        let round = ctx.round;
        if let Some(max) = self.max_version.filter(|max| round.version >= *max) {
            ctx.stop(ExitReason::MaxVersion(max));
        } else if let Some(max) = self.max_loop_times.filter(|max| round.loop_times >= *max) {
            ctx.stop(ExitReason::MaxLoopTimes(max));
        }
        Some(true)
    }
}

/// Refuse to serve a version the loop has not produced yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionGate;

impl Hook for VersionGate {
    fn name(&self) -> &'static str {
        "version_gate"
    }

    fn phase(&self) -> Phase {
        Phase::BeforeUpload
    }

    fn call(&mut self, ctx: &mut HookContext<'_>) -> Verdict {
        match ctx.pipe {
            Some(pipe) => Some(pipe.request_version <= ctx.round.version),
            None => Some(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round(version: i64, received: usize) -> RoundView {
        RoundView {
            version,
            received,
            loop_times: 0,
            now_ms: 0,
            last_finalize_ms: 0,
        }
    }

    fn run(hook: &mut dyn Hook, round: RoundView, pipe: Option<&PipeView>) -> (Verdict, Actions) {
        let mut actions = Actions::default();
        let phase = hook.phase();
        let verdict = hook.call(&mut HookContext::new(phase, round, pipe, None, &mut actions));
        (verdict, actions)
    }

    #[test]
    fn count_trigger() {
        let mut hook = AggregateCount::new(2);
        assert!(!run(&mut hook, round(0, 1), None).1.finalize);
        assert!(run(&mut hook, round(0, 2), None).1.finalize);
    }

    #[test]
    fn period_trigger_needs_contributions() {
        let mut hook = AggregatePeriod::new(Duration::from_secs(1));
        let mut r = round(0, 0);
        r.now_ms = 5_000;
        assert!(!run(&mut hook, r, None).1.finalize);
        r.received = 1;
        assert!(run(&mut hook, r, None).1.finalize);
        r.last_finalize_ms = 4_500;
        assert!(!run(&mut hook, r, None).1.finalize);
    }

    #[test]
    fn terminate_on_version_then_loops() {
        let mut hook = Terminate {
            max_version: Some(3),
            max_loop_times: Some(10),
        };
        assert!(run(&mut hook, round(2, 0), None).1.stop.is_none());
        assert_eq!(run(&mut hook, round(3, 0), None).1.stop, Some(ExitReason::MaxVersion(3)));

        let mut r = round(0, 0);
        r.loop_times = 10;
        assert_eq!(run(&mut hook, r, None).1.stop, Some(ExitReason::MaxLoopTimes(10)));
    }

    #[test]
    fn gate_refuses_future_versions() {
        let mut pipe = PipeView {
            nick_name: "agg".into(),
            peer_nick_name: "alpha".into(),
            request_version: 2,
            received_version: -1,
        };
        assert_eq!(run(&mut VersionGate, round(1, 0), Some(&pipe)).0, Some(false));
        pipe.request_version = 1;
        assert_eq!(run(&mut VersionGate, round(1, 0), Some(&pipe)).0, Some(true));
    }

    #[test]
    fn dispatch_reduces_global_and_local() {
        struct Fixed(Verdict);
        impl Hook for Fixed {
            fn name(&self) -> &'static str {
                "fixed"
            }
            fn phase(&self) -> Phase {
                Phase::BeforeDownload
            }
            fn call(&mut self, _: &mut HookContext<'_>) -> Verdict {
                self.0
            }
        }

        let mut global = Hooks::new();
        global.register(Box::new(Fixed(Some(true))));
        let mut local = Hooks::new();
        local.register(Box::new(Fixed(Some(false))));
        assert_eq!(local.len(), 1);

        let mut actions = Actions::default();
        let ctx = HookContext::new(Phase::BeforeDownload, round(0, 0), None, None, &mut actions);
        assert_eq!(dispatch(&mut global, Some(&mut local), ctx), Some(false));

        let ctx = HookContext::new(Phase::AtZombie, round(0, 0), None, None, &mut actions);
        assert_eq!(dispatch(&mut global, Some(&mut local), ctx), Some(true));
    }
}
