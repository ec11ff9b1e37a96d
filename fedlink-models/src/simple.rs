//! Simple reference model implementations
//!
//! These models are useful for testing and the simulation binary.

use alloc::vec;
use alloc::vec::Vec;

use fedlink_core::aggregation::{Parameter, Parameters};
use fedlink_core::traits::FederatedModel;
use fedlink_core::{Error, Result};

use crate::params::ParamStore;

pub const WEIGHT: &str = "weight";
pub const BIAS: &str = "bias";

/// A linear model `y = W x + b` for testing
#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    store: ParamStore,
    input_dim: usize,
    output_dim: usize,
}

impl Default for LinearModel {
    fn default() -> Self {
        Self::new(8, 1)
    }
}

impl LinearModel {
    /// Create a zero-initialized model
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        let mut store = ParamStore::new();
        store.insert(WEIGHT, Parameter::trainable(vec![0.0; input_dim * output_dim]));
        store.insert(BIAS, Parameter::trainable(vec![0.0; output_dim]));
        Self {
            store,
            input_dim,
            output_dim,
        }
    }

    /// Initialize with random weights
    pub fn with_random_init(mut self, seed: u64) -> Self {
        // Simple LCG for reproducible random initialization
        let mut state = seed;
        let mut next = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            (state >> 33) as f32 / (1u64 << 31) as f32
        };
        let params = self.store.parameters_mut();
        if let Some(w) = params.get_mut(WEIGHT) {
            w.value.iter_mut().for_each(|v| *v = next() - 0.5);
        }
        if let Some(b) = params.get_mut(BIAS) {
            b.value.iter_mut().for_each(|v| *v = next() * 0.1);
        }
        self
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn store(&self) -> &ParamStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ParamStore {
        &mut self.store
    }

    fn weights(&self) -> &[f32] {
        self.store.get(WEIGHT).map(|p| p.value.as_slice()).unwrap_or(&[])
    }

    fn bias(&self) -> &[f32] {
        self.store.get(BIAS).map(|p| p.value.as_slice()).unwrap_or(&[])
    }

    pub fn forward(&self, input: &[f32]) -> Result<Vec<f32>> {
        if input.len() != self.input_dim {
            return Err(Error::ShapeMismatch);
        }
        let (w, b) = (self.weights(), self.bias());
        Ok((0..self.output_dim)
            .map(|o| {
                let row = &w[o * self.input_dim..(o + 1) * self.input_dim];
                row.iter().zip(input).map(|(w, x)| w * x).sum::<f32>() + b[o]
            })
            .collect())
    }

    /// One squared-error gradient step on a single sample. Returns the loss
    /// before the step.
    pub fn train_step(&mut self, input: &[f32], target: &[f32], lr: f32) -> Result<f32> {
        if target.len() != self.output_dim {
            return Err(Error::ShapeMismatch);
        }
        let prediction = self.forward(input)?;
        let err: Vec<f32> = prediction.iter().zip(target).map(|(p, t)| p - t).collect();
        let loss = err.iter().map(|e| e * e).sum::<f32>() / self.output_dim as f32;

        let (input_dim, output_dim) = (self.input_dim, self.output_dim);
        let params = self.store.parameters_mut();
        if let Some(w) = params.get_mut(WEIGHT) {
            for o in 0..output_dim {
                for i in 0..input_dim {
                    w.value[o * input_dim + i] -= lr * 2.0 * err[o] * input[i];
                }
            }
        }
        if let Some(b) = params.get_mut(BIAS) {
            for o in 0..output_dim {
                b.value[o] -= lr * 2.0 * err[o];
            }
        }
        Ok(loss)
    }
}

impl FederatedModel for LinearModel {
    fn parameters(&self) -> &Parameters {
        self.store.parameters()
    }

    fn parameters_mut(&mut self) -> &mut Parameters {
        self.store.parameters_mut()
    }
}
