mod adam;
mod sgd;

pub use adam::{Adam, AdamParams, AdamState};
pub use sgd::{Sgd, SgdParams};

use crate::{Error, Result, Shape, Tensor};

pub const DEFAULT_ITERATIONS: usize = 10;

/// First-order update rule.
///
/// The rule holds its hyperparameters, the per-run accumulators live in [Optimizer::State]
/// so that a single rule value can drive any number of independent runs.
pub trait Optimizer {
    type State;

    /// Check hyperparameters, called before any iteration executes.
    fn validate(&self) -> Result<()>;
    /// Fresh accumulators for a parameter tensor of shape `sh`.
    fn init_state(&self, sh: Shape) -> Self::State;
    /// Turn `grad` into the step subtracted from the parameters at iteration `iter` (0-based).
    fn delta(&self, grad: &Tensor, iter: usize, state: &mut Self::State) -> Result<Tensor>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    pub iter: usize,
    pub loss: f32,
}

/// Gradient descent on `initial` for `iterations` steps.
///
/// `loss` maps the current tensor to `(loss, d loss / d tensor)`. Any error it returns
/// ends the run.
pub fn run<O, L>(initial: Tensor, loss: L, opt: &O, iterations: usize) -> Result<Tensor>
where
    O: Optimizer,
    L: FnMut(&Tensor) -> Result<(f32, Tensor)>,
{
    run_observed(initial, loss, opt, iterations, |s| {
        log::debug!("iter {:>4}\tloss {:e}", s.iter, s.loss);
    })
}

/// Same as [run], reporting every evaluated loss to `observe`.
pub fn run_observed<O, L>(
    initial: Tensor,
    mut loss: L,
    opt: &O,
    iterations: usize,
    mut observe: impl FnMut(Step),
) -> Result<Tensor>
where
    O: Optimizer,
    L: FnMut(&Tensor) -> Result<(f32, Tensor)>,
{
    opt.validate()?;

    let mut x = initial;
    let mut state = opt.init_state(x.shape());

    for iter in 0..iterations {
        let (l, grad) = loss(&x)?;
        if grad.shape() != x.shape() {
            return Err(Error::ShapeMismatch { expected: x.shape(), found: grad.shape() });
        }

        let delta = opt.delta(&grad, iter, &mut state)?;
        x.sub_assign(&delta)?;

        observe(Step { iter, loss: l });
    }
    Ok(x)
}

pub(crate) fn check_lr(lr: f32) -> Result<()> {
    if !(lr.is_finite() && lr > 0.0) {
        return Err(Error::InvalidConfig(format!("learning rate must be positive, got {lr}")));
    }
    Ok(())
}
