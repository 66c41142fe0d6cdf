
pub mod codec;
pub mod error;
pub mod experiment;
pub mod features;
pub mod loss;
pub mod noise;
pub mod optim;
pub mod sweep;

use std::ops::{Index, IndexMut};

pub use error::{Error, Result};

pub type Shape = [usize; 4];

pub fn prod(s: Shape) -> usize {
    s.iter().product()
}

pub const B: usize = 0;
pub const F: usize = 1;
pub const H: usize = 2;
pub const W: usize = 3;

/// Shape of a single image with `c` channels.
pub fn image_shape(c: usize, h: usize, w: usize) -> Shape {
    [1, c, h, w]
}

/// Dense row-major buffer in `[batch, features, height, width]` layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    sh: Shape,
    buf: Vec<f32>,
}

impl Index<usize> for Tensor {
    type Output = f32;

    fn index(&self, index: usize) -> &Self::Output {
        &self.buf[index]
    }
}

impl IndexMut<usize> for Tensor {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.buf[index]
    }
}

impl Tensor {
    pub fn new(sh: Shape, buf: Vec<f32>) -> Result<Self> {
        if prod(sh) != buf.len() {
            return Err(Error::DataLength { shape: sh, len: buf.len() });
        }
        Ok(Self { sh, buf })
    }

    pub fn full(v: f32, sh: Shape) -> Self {
        Self { sh, buf: vec![v; prod(sh)] }
    }
    pub fn zeros(sh: Shape) -> Self {
        Self::full(0.0, sh)
    }
    pub fn zeros_like(t: &Tensor) -> Self {
        Self::zeros(t.sh)
    }
    pub fn ones(sh: Shape) -> Self {
        Self::full(1.0, sh)
    }

    pub fn shape(&self) -> Shape {
        self.sh
    }
    pub fn len(&self) -> usize {
        self.buf.len()
    }
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
    pub fn data(&self) -> &[f32] {
        &self.buf
    }
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.buf
    }

    /// Flat offset of element `[b, f, h, w]`.
    pub fn offset(&self, b: usize, f: usize, h: usize, w: usize) -> usize {
        ((b * self.sh[F] + f) * self.sh[H] + h) * self.sh[W] + w
    }

    pub fn expect_shape(&self, sh: Shape) -> Result<()> {
        if self.sh != sh {
            return Err(Error::ShapeMismatch { expected: sh, found: self.sh });
        }
        Ok(())
    }

    fn zip_with(&mut self, other: &Tensor, op: impl Fn(&mut f32, f32)) -> Result<()> {
        other.expect_shape(self.sh)?;
        for (d, s) in self.buf.iter_mut().zip(other.buf.iter()) {
            op(d, *s);
        }
        Ok(())
    }

    pub fn sub_assign(&mut self, other: &Tensor) -> Result<()> {
        self.zip_with(other, |d, s| *d -= s)
    }
    /// `self += k * other`
    pub fn add_scaled(&mut self, k: f32, other: &Tensor) -> Result<()> {
        self.zip_with(other, |d, s| *d += k * s)
    }

    pub fn scale(&mut self, k: f32) {
        self.buf.iter_mut().for_each(|v| *v *= k);
    }

    pub fn sum_sq(&self) -> f64 {
        self.buf.iter().map(|v| (*v as f64) * (*v as f64)).sum()
    }

    /// Euclidean distance between two tensors of the same shape.
    pub fn distance(&self, other: &Tensor) -> Result<f32> {
        other.expect_shape(self.sh)?;
        let d: f64 = self.buf.iter()
            .zip(other.buf.iter())
            .map(|(a, b)| (*a as f64 - *b as f64).powi(2))
            .sum();
        Ok(d.sqrt() as f32)
    }

    pub fn mean_abs_diff(&self, other: &Tensor) -> Result<f32> {
        other.expect_shape(self.sh)?;
        if self.buf.is_empty() {
            return Ok(0.0);
        }
        let d: f64 = self.buf.iter()
            .zip(other.buf.iter())
            .map(|(a, b)| (*a as f64 - *b as f64).abs())
            .sum();
        Ok((d / self.buf.len() as f64) as f32)
    }

    pub fn is_finite(&self) -> bool {
        self.buf.iter().all(|v| v.is_finite())
    }
}
