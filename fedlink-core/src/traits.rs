//! Core traits for FedLink
//!
//! These traits define the seams between the consensus machinery and the
//! model/optimizer code it drives.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::aggregation::{ParamId, Parameters};
use crate::Result;

/// A model whose parameters take part in federated rounds
pub trait FederatedModel: Send + Sync {
    /// Current parameters
    fn parameters(&self) -> &Parameters;

    /// Mutable access for overwrites and optimizer steps
    fn parameters_mut(&mut self) -> &mut Parameters;

    /// Total number of scalar values
    fn num_parameters(&self) -> usize {
        self.parameters().values().map(|p| p.value.len()).sum()
    }
}

/// An optimizer consuming pseudo-gradients produced by aggregation
pub trait OptimizerStep: Send + Sync {
    /// Apply one step to the parameters named in `grads`
    fn step(&mut self, params: &mut Parameters, grads: &BTreeMap<ParamId, Vec<f32>>) -> Result<()>;

    /// Get the current learning rate
    fn learning_rate(&self) -> f32;

    /// Set the learning rate
    fn set_learning_rate(&mut self, lr: f32);
}
