use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::{prod, Error, Result, Shape, Tensor};

pub const PIXEL_LOW: f32 = 0.0;
pub const PIXEL_HIGH: f32 = 255.0;

/// Uniform noise in `[low, high)`, reproducible for a given `seed`.
pub fn noise_tensor(sh: Shape, low: f32, high: f32, seed: u64) -> Result<Tensor> {
    if !(low.is_finite() && high.is_finite() && low < high) {
        return Err(Error::InvalidConfig(format!("empty noise range [{low}, {high})")));
    }
    let dist = Uniform::new(low, high);
    let rng = StdRng::seed_from_u64(seed);
    Tensor::new(sh, dist.sample_iter(rng).take(prod(sh)).collect())
}

/// White noise image in pixel range.
pub fn white_noise(sh: Shape, seed: u64) -> Result<Tensor> {
    noise_tensor(sh, PIXEL_LOW, PIXEL_HIGH, seed)
}
