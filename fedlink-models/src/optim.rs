//! Reference optimizer
//!
//! With learning rate 1 and no momentum, a pseudo-gradient step lands the
//! parameters exactly on the aggregated value.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use fedlink_core::aggregation::{ParamId, Parameters};
use fedlink_core::traits::OptimizerStep;
use fedlink_core::{Error, Result};

/// Stochastic gradient descent with optional momentum
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f32,
    momentum: f32,
    velocity: BTreeMap<ParamId, Vec<f32>>,
}

impl Default for Sgd {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            momentum: 0.0,
            velocity: BTreeMap::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    /// Forget accumulated velocity
    pub fn reset(&mut self) {
        self.velocity.clear();
    }
}

impl OptimizerStep for Sgd {
    fn step(&mut self, params: &mut Parameters, grads: &BTreeMap<ParamId, Vec<f32>>) -> Result<()> {
        for (id, grad) in grads {
            if let Some(p) = params.get(id) {
                if p.value.len() != grad.len() {
                    return Err(Error::ShapeMismatch);
                }
            }
        }

        for (id, grad) in grads {
            let Some(p) = params.get_mut(id) else {
                continue;
            };
            if !p.trainable {
                continue;
            }
            if self.momentum == 0.0 {
                for (w, g) in p.value.iter_mut().zip(grad) {
                    *w -= self.lr * g;
                }
                continue;
            }
            let v = self
                .velocity
                .entry(id.clone())
                .or_insert_with(|| vec![0.0; grad.len()]);
            for ((w, v), g) in p.value.iter_mut().zip(v.iter_mut()).zip(grad) {
                *v = self.momentum * *v + g;
                *w -= self.lr * *v;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }
}
