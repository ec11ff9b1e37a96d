//! Aggregation of participant contributions
//!
//! An [`Aggregator`] collects per-parameter payloads from many participants
//! and, on [`Aggregator::finalize`], combines them into one update per
//! parameter. Two ingestion modes are supported:
//!
//! - [`Ingestion::Merge`]: O(1) memory running weighted average
//! - [`Ingestion::Stack`]: keep every contribution, combine at finalization
//!
//! Weights come from an [`AggregationPolicy`]. Trainable parameters yield a
//! pseudo-gradient `old - new`; the rest are overwritten.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::info::{TaskInfo, TRAIN_INSTANCES};
use crate::traits::OptimizerStep;
use crate::{Error, Result};

/// Payload key holding the updated parameter value
pub const PARAM: &str = "param";
/// Payload key holding per-coordinate importance (elastic policy)
pub const IMPORTANCE: &str = "importance";
/// Guard against division by zero when normalizing importance
pub const ELASTIC_EPSILON: f32 = 1e-13;

/// Stable parameter identifier
pub type ParamId = String;

/// Keyed numeric blobs for one parameter (e.g. `param`, `importance`)
pub type Payload = BTreeMap<String, Vec<f32>>;

/// One participant's payloads, by parameter
pub type Contribution = BTreeMap<ParamId, Payload>;

/// A model parameter as held by the coordinator.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Parameter {
    pub value: Vec<f32>,
    /// Trainable parameters receive pseudo-gradients instead of overwrites
    pub trainable: bool,
}

impl Parameter {
    pub fn trainable(value: Vec<f32>) -> Self {
        Self {
            value,
            trainable: true,
        }
    }

    pub fn frozen(value: Vec<f32>) -> Self {
        Self {
            value,
            trainable: false,
        }
    }
}

/// Parameters by id (deterministic ordering)
pub type Parameters = BTreeMap<ParamId, Parameter>;

/// How contributions are weighted and how the final delta is shaped.
pub trait AggregationPolicy: Send + Sync {
    /// Policy name for logs
    fn name(&self) -> &'static str;

    /// Task info keys every contribution must carry
    fn required_keys(&self) -> &'static [&'static str];

    /// Payload keys a contribution must carry for a parameter the
    /// coordinator holds
    fn required_payload_keys(&self, trainable: bool) -> &'static [&'static str] {
        let _ = trainable;
        &[PARAM]
    }

    /// Weight of a contribution
    fn weight(&self, info: &TaskInfo) -> Result<f64>;

    /// Shape the pseudo-gradient `old - new` of a trainable parameter.
    ///
    /// `combined` holds every finalized payload key for the parameter.
    fn adjust(&self, delta: Vec<f32>, combined: &Payload) -> Result<Vec<f32>> {
        let _ = combined;
        Ok(delta)
    }
}

/// Every contribution counts once.
#[derive(Debug, Clone, Copy, Default)]
pub struct Average;

impl AggregationPolicy for Average {
    fn name(&self) -> &'static str {
        "average"
    }

    fn required_keys(&self) -> &'static [&'static str] {
        &[]
    }

    fn weight(&self, _info: &TaskInfo) -> Result<f64> {
        Ok(1.0)
    }
}

fn train_instances(info: &TaskInfo) -> Result<f64> {
    info.get_f64(TRAIN_INSTANCES)
        .ok_or(Error::MissingContributionKey(TRAIN_INSTANCES))
}

/// Contributions weighted by `train_instances`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Naive;

impl AggregationPolicy for Naive {
    fn name(&self) -> &'static str {
        "naive"
    }

    fn required_keys(&self) -> &'static [&'static str] {
        &[TRAIN_INSTANCES]
    }

    fn weight(&self, info: &TaskInfo) -> Result<f64> {
        train_instances(info)
    }
}

/// Naive weighting plus importance-based damping of the delta:
/// `delta * (1 + quantile - importance / (max(importance) + eps))`.
#[derive(Debug, Clone, Copy)]
pub struct Elastic {
    quantile: f32,
}

impl Elastic {
    /// `quantile` must lie strictly between 0 and 1.
    pub fn new(quantile: f32) -> Result<Self> {
        if !(quantile > 0.0 && quantile < 1.0) {
            return Err(Error::InvalidQuantile);
        }
        Ok(Self { quantile })
    }

    pub fn quantile(&self) -> f32 {
        self.quantile
    }
}

impl AggregationPolicy for Elastic {
    fn name(&self) -> &'static str {
        "elastic"
    }

    fn required_keys(&self) -> &'static [&'static str] {
        &[TRAIN_INSTANCES]
    }

    fn required_payload_keys(&self, trainable: bool) -> &'static [&'static str] {
        if trainable {
            &[PARAM, IMPORTANCE]
        } else {
            &[PARAM]
        }
    }

    fn weight(&self, info: &TaskInfo) -> Result<f64> {
        train_instances(info)
    }

    fn adjust(&self, delta: Vec<f32>, combined: &Payload) -> Result<Vec<f32>> {
        let importance = combined
            .get(IMPORTANCE)
            .ok_or(Error::MissingPayloadKey(IMPORTANCE))?;
        if importance.len() != delta.len() {
            return Err(Error::ShapeMismatch);
        }
        let max = importance.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let norm = max + ELASTIC_EPSILON;
        Ok(delta
            .iter()
            .zip(importance)
            .map(|(d, imp)| d * (1.0 + self.quantile - imp / norm))
            .collect())
    }
}

/// How contributions are absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Ingestion {
    /// Keep every contribution; combine at finalization
    Stack,
    /// Fold into a running weighted average
    #[default]
    Merge,
}

#[derive(Debug, Clone)]
enum ParamState {
    Merged { step: f64, acc: Payload },
    Stacked(Vec<(Payload, f64)>),
}

impl ParamState {
    fn empty(ingestion: Ingestion) -> Self {
        match ingestion {
            Ingestion::Merge => ParamState::Merged {
                step: 0.0,
                acc: Payload::new(),
            },
            Ingestion::Stack => ParamState::Stacked(Vec::new()),
        }
    }

    /// Reject payloads whose key lengths disagree with what is held.
    fn check_shape(&self, payload: &Payload) -> Result<()> {
        let held = match self {
            ParamState::Merged { acc, .. } => Some(acc),
            ParamState::Stacked(list) => list.first().map(|(p, _)| p),
        };
        let Some(held) = held else {
            return Ok(());
        };
        for (key, value) in payload {
            if held.get(key).is_some_and(|h| h.len() != value.len()) {
                return Err(Error::ShapeMismatch);
            }
        }
        Ok(())
    }

    fn absorb(&mut self, payload: &Payload, weight: f64) {
        match self {
            ParamState::Merged { step, acc } => {
                let total = *step + weight;
                if total <= 0.0 {
                    return;
                }
                for (key, value) in payload {
                    let slot = acc
                        .entry(key.clone())
                        .or_insert_with(|| alloc::vec![0.0; value.len()]);
                    for (a, v) in slot.iter_mut().zip(value) {
                        *a = ((*a as f64 * *step + *v as f64 * weight) / total) as f32;
                    }
                }
                *step = total;
            }
            ParamState::Stacked(list) => list.push((payload.clone(), weight)),
        }
    }

    /// Weighted combination of every payload key.
    fn combine(&self) -> Result<Payload> {
        match self {
            ParamState::Merged { acc, .. } => Ok(acc.clone()),
            ParamState::Stacked(list) => {
                let total: f64 = list.iter().map(|(_, w)| w).sum();
                if total <= 0.0 {
                    return Err(Error::EmptyRound);
                }
                let mut out = Payload::new();
                for (payload, weight) in list {
                    let share = weight / total;
                    for (key, value) in payload {
                        let slot = out
                            .entry(key.clone())
                            .or_insert_with(|| alloc::vec![0.0; value.len()]);
                        for (o, v) in slot.iter_mut().zip(value) {
                            *o = (*o as f64 + *v as f64 * share) as f32;
                        }
                    }
                }
                Ok(out)
            }
        }
    }
}

/// Finalized change for one parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Replace the value outright (non-trainable parameters)
    Overwrite(Vec<f32>),
    /// Hand `old - new` (shaped by the policy) to the optimizer
    PseudoGradient(Vec<f32>),
}

/// Result of one aggregation round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Finalized {
    pub updates: BTreeMap<ParamId, Update>,
    /// Every non-`param` payload key, combined the same way
    pub aux: BTreeMap<ParamId, Payload>,
}

impl Finalized {
    /// Overwrite frozen parameters and step the optimizer with the
    /// pseudo-gradients of trainable ones.
    pub fn apply(&self, params: &mut Parameters, optimizer: &mut dyn OptimizerStep) -> Result<()> {
        let mut grads: BTreeMap<ParamId, Vec<f32>> = BTreeMap::new();
        for (id, update) in &self.updates {
            match update {
                Update::Overwrite(value) => {
                    if let Some(p) = params.get_mut(id) {
                        p.value.clone_from(value);
                    }
                }
                Update::PseudoGradient(delta) => {
                    grads.insert(id.clone(), delta.clone());
                }
            }
        }
        if grads.is_empty() {
            return Ok(());
        }
        optimizer.step(params, &grads)
    }
}

/// Collects contributions for one round.
///
/// State is never cleared implicitly: call [`Aggregator::reset`] after
/// [`Aggregator::finalize`] before ingesting the next round.
pub struct Aggregator {
    policy: Box<dyn AggregationPolicy>,
    ingestion: Ingestion,
    state: BTreeMap<ParamId, ParamState>,
    infos: Vec<TaskInfo>,
}

impl core::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Aggregator")
            .field("policy", &self.policy.name())
            .field("ingestion", &self.ingestion)
            .field("params", &self.state.len())
            .field("received", &self.infos.len())
            .finish()
    }
}

impl Aggregator {
    pub fn new(policy: impl AggregationPolicy + 'static, ingestion: Ingestion) -> Self {
        Self::from_boxed(Box::new(policy), ingestion)
    }

    pub fn from_boxed(policy: Box<dyn AggregationPolicy>, ingestion: Ingestion) -> Self {
        Self {
            policy,
            ingestion,
            state: BTreeMap::new(),
            infos: Vec::new(),
        }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn ingestion(&self) -> Ingestion {
        self.ingestion
    }

    /// Number of contributions ingested since the last reset
    pub fn received(&self) -> usize {
        self.infos.len()
    }

    /// Task infos ingested since the last reset, in arrival order
    pub fn infos(&self) -> &[TaskInfo] {
        &self.infos
    }

    /// Absorb one contribution. On error nothing is ingested.
    ///
    /// Payloads for parameters in `current` must carry the policy's payload
    /// keys at the parameter's length. Other ids are kept but never finalized.
    pub fn ingest(&mut self, contribution: &Contribution, info: &TaskInfo, current: &Parameters) -> Result<()> {
        for key in self.policy.required_keys() {
            if !info.contains_key(key) {
                return Err(Error::MissingContributionKey(*key));
            }
        }
        let weight = self.policy.weight(info)?;

        for (id, payload) in contribution {
            if let Some(param) = current.get(id) {
                for key in self.policy.required_payload_keys(param.trainable) {
                    let value = payload.get(*key).ok_or(Error::MissingPayloadKey(*key))?;
                    if value.len() != param.value.len() {
                        return Err(Error::ShapeMismatch);
                    }
                }
            }
            if let Some(state) = self.state.get(id) {
                state.check_shape(payload)?;
            }
        }

        let ingestion = self.ingestion;
        for (id, payload) in contribution {
            self.state
                .entry(id.clone())
                .or_insert_with(|| ParamState::empty(ingestion))
                .absorb(payload, weight);
        }
        self.infos.push(info.clone());
        tracing::trace!(
            policy = self.policy.name(),
            weight,
            received = self.infos.len(),
            "contribution ingested"
        );
        Ok(())
    }

    /// Combine everything ingested against the coordinator's `current` values.
    ///
    /// Parameters without contributions are left out of the result.
    pub fn finalize(&self, current: &Parameters) -> Result<Finalized> {
        if self.infos.is_empty() {
            return Err(Error::EmptyRound);
        }
        let mut out = Finalized::default();
        for (id, param) in current {
            let Some(state) = self.state.get(id) else {
                continue;
            };
            let mut combined = state.combine()?;
            let new = combined.remove(PARAM).ok_or(Error::MissingPayloadKey(PARAM))?;
            if new.len() != param.value.len() {
                return Err(Error::ShapeMismatch);
            }
            let update = if param.trainable {
                let delta = param.value.iter().zip(&new).map(|(o, n)| o - n).collect();
                Update::PseudoGradient(self.policy.adjust(delta, &combined)?)
            } else {
                Update::Overwrite(new)
            };
            out.updates.insert(id.clone(), update);
            if !combined.is_empty() {
                out.aux.insert(id.clone(), combined);
            }
        }
        Ok(out)
    }

    /// Drop all accumulated state and received infos.
    pub fn reset(&mut self) {
        self.state.clear();
        self.infos.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn payload(param: &[f32]) -> Payload {
        let mut p = Payload::new();
        p.insert(PARAM.into(), param.to_vec());
        p
    }

    fn contribution(id: &str, p: Payload) -> Contribution {
        let mut c = Contribution::new();
        c.insert(id.into(), p);
        c
    }

    fn weighted(n: i64) -> TaskInfo {
        TaskInfo::new().with(TRAIN_INSTANCES, n)
    }

    fn current() -> Parameters {
        let mut params = Parameters::new();
        params.insert("w".into(), Parameter::trainable(vec![1.0, 1.0]));
        params
    }

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-5, "{a:?} != {b:?}");
        }
    }

    fn gradient(f: &Finalized, id: &str) -> Vec<f32> {
        match &f.updates[id] {
            Update::PseudoGradient(g) => g.clone(),
            other => panic!("expected pseudo-gradient, got {other:?}"),
        }
    }

    #[test]
    fn merge_and_stack_agree_under_naive() {
        let inputs = [(vec![0.0, 2.0], 1i64), (vec![3.0, 5.0], 3), (vec![1.0, -1.0], 2)];

        let mut merge = Aggregator::new(Naive, Ingestion::Merge);
        let mut stack = Aggregator::new(Naive, Ingestion::Stack);
        for (value, n) in &inputs {
            let c = contribution("w", payload(value));
            merge.ingest(&c, &weighted(*n), &current()).unwrap();
            stack.ingest(&c, &weighted(*n), &current()).unwrap();
        }

        let a = merge.finalize(&current()).unwrap();
        let b = stack.finalize(&current()).unwrap();
        assert_close(&gradient(&a, "w"), &gradient(&b, "w"));
        // weighted mean is [11/6, 15/6]
        assert_close(&gradient(&a, "w"), &[1.0 - 11.0 / 6.0, 1.0 - 15.0 / 6.0]);
    }

    #[test]
    fn average_ignores_train_instances() {
        let mut agg = Aggregator::new(Average, Ingestion::Merge);
        agg.ingest(&contribution("w", payload(&[0.0, 0.0])), &weighted(100), &current())
            .unwrap();
        agg.ingest(&contribution("w", payload(&[2.0, 4.0])), &TaskInfo::new(), &current())
            .unwrap();
        let f = agg.finalize(&current()).unwrap();
        assert_close(&gradient(&f, "w"), &[0.0, -1.0]);
    }

    #[test]
    fn missing_required_key_ingests_nothing() {
        let mut agg = Aggregator::new(Naive, Ingestion::Stack);
        let err = agg
            .ingest(&contribution("w", payload(&[1.0, 1.0])), &TaskInfo::new(), &current())
            .unwrap_err();
        assert_eq!(err, Error::MissingContributionKey(TRAIN_INSTANCES));
        assert_eq!(agg.received(), 0);
        assert_eq!(agg.finalize(&current()), Err(Error::EmptyRound));
    }

    #[test]
    fn shape_mismatch_is_rejected_before_ingest() {
        let mut agg = Aggregator::new(Average, Ingestion::Merge);
        agg.ingest(&contribution("w", payload(&[1.0, 1.0])), &TaskInfo::new(), &current())
            .unwrap();
        let err = agg
            .ingest(&contribution("w", payload(&[1.0])), &TaskInfo::new(), &current())
            .unwrap_err();
        assert_eq!(err, Error::ShapeMismatch);
        assert_eq!(agg.received(), 1);
    }

    #[test]
    fn frozen_parameters_are_overwritten() {
        let mut params = current();
        params.insert("stats".into(), Parameter::frozen(vec![0.0]));

        let mut agg = Aggregator::new(Average, Ingestion::Stack);
        let mut c = contribution("w", payload(&[1.0, 1.0]));
        c.insert("stats".into(), payload(&[4.0]));
        agg.ingest(&c, &TaskInfo::new(), &params).unwrap();

        let f = agg.finalize(&params).unwrap();
        assert_eq!(f.updates["stats"], Update::Overwrite(vec![4.0]));
        assert_close(&gradient(&f, "w"), &[0.0, 0.0]);
    }

    #[test]
    fn elastic_with_uniform_importance_scales_by_quantile() {
        let quantile = 0.3;
        let mut agg = Aggregator::new(Elastic::new(quantile).unwrap(), Ingestion::Merge);
        let mut p = payload(&[0.5, -1.0]);
        p.insert(IMPORTANCE.into(), vec![1.0, 1.0]);
        agg.ingest(&contribution("w", p), &weighted(4), &current()).unwrap();

        let f = agg.finalize(&current()).unwrap();
        assert_close(&gradient(&f, "w"), &[0.5 * quantile, 2.0 * quantile]);
        assert_close(&f.aux["w"][IMPORTANCE], &[1.0, 1.0]);
    }

    #[test]
    fn elastic_rejects_trainable_payload_without_importance() {
        let mut agg = Aggregator::new(Elastic::new(0.5).unwrap(), Ingestion::Stack);
        let mut good = payload(&[0.0, 0.0]);
        good.insert(IMPORTANCE.into(), vec![1.0, 1.0]);
        agg.ingest(&contribution("w", good), &weighted(1), &current())
            .unwrap();

        let err = agg
            .ingest(&contribution("w", payload(&[2.0, 2.0])), &weighted(1), &current())
            .unwrap_err();
        assert_eq!(err, Error::MissingPayloadKey(IMPORTANCE));
        assert_eq!(agg.received(), 1);
        // The rejected payload left no trace in the round.
        assert_close(&gradient(&agg.finalize(&current()).unwrap(), "w"), &[0.5, 0.5]);
    }

    #[test]
    fn elastic_frozen_parameters_need_no_importance() {
        let mut params = current();
        params.insert("stats".into(), Parameter::frozen(vec![0.0]));
        let mut agg = Aggregator::new(Elastic::new(0.5).unwrap(), Ingestion::Merge);
        agg.ingest(&contribution("stats", payload(&[3.0])), &weighted(1), &params)
            .unwrap();
        let f = agg.finalize(&params).unwrap();
        assert_eq!(f.updates["stats"], Update::Overwrite(vec![3.0]));
    }

    #[test]
    fn payload_length_must_match_current_parameter() {
        let mut agg = Aggregator::new(Average, Ingestion::Merge);
        let err = agg
            .ingest(&contribution("w", payload(&[1.0, 2.0, 3.0])), &TaskInfo::new(), &current())
            .unwrap_err();
        assert_eq!(err, Error::ShapeMismatch);
        assert_eq!(agg.received(), 0);
    }

    #[test]
    fn elastic_quantile_must_be_open_interval() {
        assert_eq!(Elastic::new(0.0).unwrap_err(), Error::InvalidQuantile);
        assert_eq!(Elastic::new(1.0).unwrap_err(), Error::InvalidQuantile);
        assert!(Elastic::new(0.5).is_ok());
    }

    #[test]
    fn reset_clears_state_and_infos() {
        let mut agg = Aggregator::new(Naive, Ingestion::Merge);
        agg.ingest(&contribution("w", payload(&[0.0, 0.0])), &weighted(2), &current())
            .unwrap();
        assert_eq!(agg.received(), 1);
        agg.reset();
        assert_eq!(agg.received(), 0);
        assert!(agg.infos().is_empty());
        assert_eq!(agg.finalize(&current()), Err(Error::EmptyRound));
    }

    #[test]
    fn state_persists_until_reset() {
        let mut agg = Aggregator::new(Average, Ingestion::Merge);
        agg.ingest(&contribution("w", payload(&[0.0, 0.0])), &TaskInfo::new(), &current())
            .unwrap();
        let first = agg.finalize(&current()).unwrap();
        agg.ingest(&contribution("w", payload(&[2.0, 2.0])), &TaskInfo::new(), &current())
            .unwrap();
        let second = agg.finalize(&current()).unwrap();
        assert_ne!(first, second);
        assert_close(&gradient(&second, "w"), &[0.0, 0.0]);
    }
}
