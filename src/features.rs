use crate::{Error, Result, Tensor, B, F, H, W};

/// Source of layer activations for an input image.
///
/// Stands in for a pretrained network: `forward` evaluates one named layer,
/// `backward` pulls a gradient w.r.t. that layer's activation back to the input
/// (vector-Jacobian product). Implementations must be usable from several sweep
/// workers at once.
pub trait FeatureExtractor: Sync {
    /// Layer names, shallowest first.
    fn layers(&self) -> Vec<String>;
    fn forward(&self, x: &Tensor, layer: &str) -> Result<Tensor>;
    fn backward(&self, x: &Tensor, layer: &str, grad: &Tensor) -> Result<Tensor>;
}

/// Average-pooling pyramid, `pool_k` pools `2^k x 2^k` windows and `pool_0` is the input itself.
///
/// Rows and columns that do not fill a whole window are dropped.
#[derive(Clone, Debug)]
pub struct PyramidExtractor {
    levels: usize,
}

impl PyramidExtractor {
    pub fn new(levels: usize) -> Self {
        Self { levels }
    }

    fn level(&self, layer: &str) -> Result<usize> {
        layer.strip_prefix("pool_")
            .and_then(|k| k.parse::<usize>().ok())
            .filter(|k| *k < self.levels)
            .ok_or_else(|| Error::UnknownLayer(layer.to_string()))
    }

    fn window(&self, x: &Tensor, layer: &str) -> Result<usize> {
        let k = self.level(layer)?;
        let win = u32::try_from(k).ok()
            .and_then(|k| 1usize.checked_shl(k))
            .ok_or_else(|| Error::UnknownLayer(layer.to_string()))?;
        let sh = x.shape();
        if sh[H] < win || sh[W] < win {
            return Err(Error::UnknownLayer(format!("{layer} on {}x{} input", sh[H], sh[W])));
        }
        Ok(win)
    }
}

impl FeatureExtractor for PyramidExtractor {
    fn layers(&self) -> Vec<String> {
        (0..self.levels).map(|k| format!("pool_{k}")).collect()
    }

    fn forward(&self, x: &Tensor, layer: &str) -> Result<Tensor> {
        let win = self.window(x, layer)?;
        if win == 1 {
            return Ok(x.clone());
        }

        let sh = x.shape();
        let out_sh = [sh[B], sh[F], sh[H] / win, sh[W] / win];
        let mut out = Tensor::zeros(out_sh);
        let area = (win * win) as f32;

        for b in 0..out_sh[B] {
            for f in 0..out_sh[F] {
                for i in 0..out_sh[H] {
                    for j in 0..out_sh[W] {
                        let mut acc = 0.0;
                        for di in 0..win {
                            for dj in 0..win {
                                acc += x[x.offset(b, f, i * win + di, j * win + dj)];
                            }
                        }
                        let o = out.offset(b, f, i, j);
                        out[o] = acc / area;
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&self, x: &Tensor, layer: &str, grad: &Tensor) -> Result<Tensor> {
        let win = self.window(x, layer)?;
        let sh = x.shape();
        grad.expect_shape([sh[B], sh[F], sh[H] / win, sh[W] / win])?;
        if win == 1 {
            return Ok(grad.clone());
        }

        let gsh = grad.shape();
        let mut out = Tensor::zeros(sh);
        let area = (win * win) as f32;

        for b in 0..gsh[B] {
            for f in 0..gsh[F] {
                for i in 0..gsh[H] {
                    for j in 0..gsh[W] {
                        let g = grad[grad.offset(b, f, i, j)] / area;
                        for di in 0..win {
                            for dj in 0..win {
                                let o = out.offset(b, f, i * win + di, j * win + dj);
                                out[o] = g;
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(sh: crate::Shape) -> Tensor {
        Tensor::new(sh, (0..crate::prod(sh)).map(|i| i as f32).collect()).unwrap()
    }

    #[test]
    fn layer_names() {
        let p = PyramidExtractor::new(3);
        assert_eq!(p.layers(), vec!["pool_0", "pool_1", "pool_2"]);
        let x = Tensor::zeros([1, 3, 8, 8]);
        assert!(matches!(p.forward(&x, "pool_3"), Err(Error::UnknownLayer(_))));
        assert!(matches!(p.forward(&x, "conv_1_1"), Err(Error::UnknownLayer(_))));
    }

    #[test]
    fn pooling_averages_windows() {
        let p = PyramidExtractor::new(2);
        let x = ramp([1, 1, 2, 4]);
        let y = p.forward(&x, "pool_1").unwrap();

        assert_eq!(y.shape(), [1, 1, 1, 2]);
        // (0 + 1 + 4 + 5) / 4, (2 + 3 + 6 + 7) / 4
        assert_eq!(y.data(), &[2.5, 4.5]);
        assert_eq!(p.forward(&x, "pool_0").unwrap(), x);
    }

    #[test]
    fn too_small_input_is_rejected() {
        let p = PyramidExtractor::new(4);
        let x = Tensor::zeros([1, 3, 4, 4]);
        assert!(p.forward(&x, "pool_2").is_ok());
        assert!(matches!(p.forward(&x, "pool_3"), Err(Error::UnknownLayer(_))));
    }

    #[test]
    fn window_wider_than_usize_is_rejected() {
        let p = PyramidExtractor::new(70);
        let x = Tensor::zeros([1, 3, 8, 8]);
        for layer in ["pool_63", "pool_64", "pool_69"] {
            assert!(matches!(p.forward(&x, layer), Err(Error::UnknownLayer(_))), "{layer}");
            assert!(matches!(p.backward(&x, layer, &x), Err(Error::UnknownLayer(_))), "{layer}");
        }
    }

    #[test]
    fn backward_is_adjoint_of_forward() {
        // <forward(x), g> == <x, backward(g)> for a linear layer
        let p = PyramidExtractor::new(3);
        let x = ramp([1, 2, 5, 6]);
        for layer in ["pool_0", "pool_1", "pool_2"] {
            let y = p.forward(&x, layer).unwrap();
            let g = Tensor::new(y.shape(), (0..y.len()).map(|i| 1.0 - 0.3 * i as f32).collect()).unwrap();
            let gx = p.backward(&x, layer, &g).unwrap();

            let lhs: f32 = y.data().iter().zip(g.data()).map(|(a, b)| a * b).sum();
            let rhs: f32 = x.data().iter().zip(gx.data()).map(|(a, b)| a * b).sum();
            assert!((lhs - rhs).abs() < 1e-2 * lhs.abs().max(1.0), "{layer}: {lhs} vs {rhs}");
        }
    }
}
