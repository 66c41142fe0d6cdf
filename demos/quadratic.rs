use styleopt::optim::{run_observed, Adam, AdamParams};
use styleopt::{image_shape, noise, Result, Tensor};

/// Squared distance to `target`, with its gradient
fn loss(x: &Tensor, target: &Tensor) -> Result<(f32, Tensor)> {
    let mut grad = x.clone();
    grad.sub_assign(target)?;
    let loss = grad.sum_sq() as f32;
    grad.scale(2.0);
    Ok((loss, grad))
}

fn main() -> Result<()> {
    let sh = image_shape(3, 4, 4);

    // Start from noise, pull every pixel towards 1
    let x = noise::noise_tensor(sh, -1.0, 1.0, 7)?;
    let target = Tensor::ones(sh);

    // Configuration travels with the rule, state is created by the loop
    let adam = Adam::new(AdamParams { lr: 0.1, ..Default::default() });

    let out = run_observed(x.clone(), |x| loss(x, &target), &adam, 200, |s| {
        if s.iter % 20 == 0 {
            println!("Iter\t{}\tLoss\t{:.6}", s.iter, s.loss);
        }
    })?;

    println!("Start\t{:.6}", x.mean_abs_diff(&target)?);
    println!("Final\t{:.6}", out.mean_abs_diff(&target)?);
    Ok(())
}
