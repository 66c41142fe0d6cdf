use crate::optim::{check_lr, Optimizer};
use crate::{Result, Shape, Tensor};

#[derive(Clone, Debug, PartialEq)]
pub struct SgdParams {
    pub lr: f32,
}

/// Plain gradient descent, `delta = lr * g`.
#[derive(Clone, Debug)]
pub struct Sgd {
    param: SgdParams,
}

impl Sgd {
    pub fn new(param: SgdParams) -> Self {
        Self { param }
    }
}

impl Optimizer for Sgd {
    type State = ();

    fn validate(&self) -> Result<()> {
        check_lr(self.param.lr)
    }

    fn init_state(&self, _sh: Shape) -> Self::State {}

    fn delta(&self, grad: &Tensor, _iter: usize, _state: &mut ()) -> Result<Tensor> {
        let mut delta = grad.clone();
        delta.scale(self.param.lr);
        Ok(delta)
    }
}
