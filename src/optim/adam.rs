use rayon::prelude::*;

use crate::optim::{check_lr, Optimizer};
use crate::{Error, Result, Shape, Tensor};

// Below this many elements the update is not worth splitting across threads
const PAR_MIN_LEN: usize = 1 << 14;

#[derive(Clone, Debug, PartialEq)]
pub struct AdamParams {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            lr: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-5,
        }
    }
}

impl AdamParams {
    /// Override a single hyperparameter by name.
    pub fn set(&mut self, name: &str, value: f32) -> Result<()> {
        match name {
            "learning_rate" | "lr" => self.lr = value,
            "beta1" => self.beta1 = value,
            "beta2" => self.beta2 = value,
            "epsilon" | "eps" => self.eps = value,
            _ => return Err(Error::InvalidConfig(format!("unknown adam parameter `{name}`"))),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        check_lr(self.lr)?;
        for (name, b) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&b) {
                return Err(Error::InvalidConfig(format!("{name} must be in [0, 1), got {b}")));
            }
        }
        if !(self.eps.is_finite() && self.eps > 0.0) {
            return Err(Error::InvalidConfig(format!("epsilon must be positive, got {}", self.eps)));
        }
        Ok(())
    }
}

pub struct AdamState {
    // First moment estimate
    m: Tensor,
    // Second moment estimate
    v: Tensor,
}

impl AdamState {
    pub fn first_moment(&self) -> &Tensor {
        &self.m
    }
    pub fn second_moment(&self) -> &Tensor {
        &self.v
    }
}

/// Adaptive-moment rule:
///
/// ```text
/// m = b1 * m + (1 - b1) * g
/// v = b2 * v + (1 - b2) * g^2
/// delta = lr * (m / (1 - b1^t)) / (sqrt(v / (1 - b2^t)) + eps)
/// ```
/// with `t` the 1-based iteration.
#[derive(Clone, Debug, Default)]
pub struct Adam {
    param: AdamParams,
}

impl Adam {
    pub fn new(param: AdamParams) -> Self {
        Self { param }
    }
}

impl Optimizer for Adam {
    type State = AdamState;

    fn validate(&self) -> Result<()> {
        self.param.validate()
    }

    fn init_state(&self, sh: Shape) -> AdamState {
        AdamState {
            m: Tensor::zeros(sh),
            v: Tensor::zeros(sh),
        }
    }

    fn delta(&self, grad: &Tensor, iter: usize, state: &mut AdamState) -> Result<Tensor> {
        grad.expect_shape(state.m.shape())?;

        let AdamParams { lr, beta1: b1, beta2: b2, eps } = self.param;
        // Bias corrections have converged to 1 long before i32::MAX
        let t = i32::try_from(iter.saturating_add(1)).unwrap_or(i32::MAX);
        let b1_cor = 1.0 - b1.powi(t);
        let b2_cor = 1.0 - b2.powi(t);

        let mut delta = Tensor::zeros_like(grad);

        let step = |((d, g), (m, v)): ((&mut f32, &f32), (&mut f32, &mut f32))| {
            *m = b1 * *m + (1.0 - b1) * *g;
            *v = b2 * *v + (1.0 - b2) * *g * *g;

            let m_hat = *m / b1_cor;
            let v_hat = *v / b2_cor;
            *d = lr * m_hat / (v_hat.sqrt() + eps);
        };

        let AdamState { m, v } = state;
        if grad.len() >= PAR_MIN_LEN {
            delta.data_mut().par_iter_mut()
                .zip(grad.data().par_iter())
                .zip(m.data_mut().par_iter_mut().zip(v.data_mut().par_iter_mut()))
                .for_each(step);
        } else {
            delta.data_mut().iter_mut()
                .zip(grad.data().iter())
                .zip(m.data_mut().iter_mut().zip(v.data_mut().iter_mut()))
                .for_each(step);
        }
        Ok(delta)
    }
}
