//! Losses over activations and pixels, each returning `(loss, gradient)`.
//!
//! Gradients here are w.r.t. the activation passed in; [LossSpec::eval] pulls them back
//! to the input image through a [FeatureExtractor].

use rayon::prelude::*;
use smallvec::SmallVec;

use crate::features::FeatureExtractor;
use crate::{Error, Result, Tensor, B, F, H, W};

// Floor for the normalized euclidean denominator
const NORM_EPS: f64 = 1e-8;
// Added to the gradient RMS before dividing by it
pub const GRAD_NORM_EPS: f32 = 1e-5;

/// Channel correlation matrices `A * A' / (H * W)`, one `F x F` matrix per batch item,
/// shaped `[B, 1, F, F]`.
pub fn gram(act: &Tensor) -> Tensor {
    let sh = act.shape();
    let (nf, n) = (sh[F], sh[H] * sh[W]);
    let mut out = Tensor::zeros([sh[B], 1, nf, nf]);
    if nf == 0 {
        return out;
    }
    let a = act.data();

    out.data_mut()
        .par_chunks_mut(nf)
        .enumerate()
        .for_each(|(row, dst)| {
            let (b, r) = (row / nf, row % nf);
            let ar = &a[(b * nf + r) * n..][..n];
            for (s, d) in dst.iter_mut().enumerate() {
                let as_ = &a[(b * nf + s) * n..][..n];
                let dot: f64 = ar.iter().zip(as_).map(|(x, y)| *x as f64 * *y as f64).sum();
                *d = (dot / n.max(1) as f64) as f32;
            }
        });
    out
}

/// `sum((gram(act) - gram_ref)^2)`.
pub fn grams_frobenius_error(gram_ref: &Tensor, act: &Tensor) -> Result<(f32, Tensor)> {
    let sh = act.shape();
    let (nf, n) = (sh[F], sh[H] * sh[W]);

    let mut diff = gram(act);
    gram_ref.expect_shape(diff.shape())?;
    diff.sub_assign(gram_ref)?;
    let loss = diff.sum_sq() as f32;

    // d/dA = 4 (G - G_ref) A / N, G being symmetric
    let k = 4.0 / n.max(1) as f64;
    let a = act.data();
    let d = diff.data();
    let mut grad = Tensor::zeros(sh);
    if n > 0 {
        grad.data_mut()
            .par_chunks_mut(n)
            .enumerate()
            .for_each(|(row, dst)| {
                let (b, r) = (row / nf, row % nf);
                let drow = &d[(b * nf + r) * nf..][..nf];
                for (p, g) in dst.iter_mut().enumerate() {
                    let mut acc = 0.0f64;
                    for (s, ds) in drow.iter().enumerate() {
                        acc += *ds as f64 * a[(b * nf + s) * n + p] as f64;
                    }
                    *g = (k * acc) as f32;
                }
            });
    }
    Ok((loss, grad))
}

/// `sum((act - target)^2)`.
pub fn euclidean_error(target: &Tensor, act: &Tensor) -> Result<(f32, Tensor)> {
    target.expect_shape(act.shape())?;
    let mut grad = act.clone();
    grad.sub_assign(target)?;
    let loss = grad.sum_sq() as f32;
    grad.scale(2.0);
    Ok((loss, grad))
}

/// [euclidean_error] divided by `sum(target^2)`.
pub fn normalized_euclidean_error(target: &Tensor, act: &Tensor) -> Result<(f32, Tensor)> {
    let (loss, mut grad) = euclidean_error(target, act)?;
    // A non-finite target stays non-finite instead of hitting the floor
    let denom = match target.sum_sq() {
        d if d.is_finite() => d.max(NORM_EPS),
        d => d,
    };
    grad.scale((1.0 / denom) as f32);
    Ok(((loss as f64 / denom) as f32, grad))
}

/// Squared differences between vertical and horizontal neighbours, over `i < H-1, j < W-1`.
pub fn total_variation_error(x: &Tensor) -> (f32, Tensor) {
    let sh = x.shape();
    let mut grad = Tensor::zeros(sh);
    let mut loss = 0.0f64;

    for b in 0..sh[B] {
        for f in 0..sh[F] {
            for i in 0..sh[H].saturating_sub(1) {
                for j in 0..sh[W].saturating_sub(1) {
                    let o = x.offset(b, f, i, j);
                    let down = x.offset(b, f, i + 1, j);
                    let right = o + 1;

                    let dh = x[down] - x[o];
                    let dw = x[right] - x[o];
                    loss += (dh * dh + dw * dw) as f64;

                    grad[down] += 2.0 * dh;
                    grad[right] += 2.0 * dw;
                    grad[o] -= 2.0 * (dh + dw);
                }
            }
        }
    }
    (loss as f32, grad)
}

#[derive(Clone, Debug)]
pub enum Term {
    /// Gram distance to `gram` at `layer`
    Style { layer: String, gram: Tensor },
    /// Activation distance to `target` at `layer`
    Feature { layer: String, target: Tensor, normalized: bool },
    /// Smoothness of the input itself
    TotalVariation,
}

impl Term {
    pub fn style<E: FeatureExtractor>(ex: &E, reference: &Tensor, layer: &str) -> Result<Self> {
        Ok(Term::Style {
            layer: layer.to_string(),
            gram: gram(&ex.forward(reference, layer)?),
        })
    }

    pub fn feature<E: FeatureExtractor>(ex: &E, reference: &Tensor, layer: &str, normalized: bool) -> Result<Self> {
        Ok(Term::Feature {
            layer: layer.to_string(),
            target: ex.forward(reference, layer)?,
            normalized,
        })
    }

    fn eval<E: FeatureExtractor>(&self, ex: &E, x: &Tensor) -> Result<(f32, Tensor)> {
        match self {
            Term::Style { layer, gram } => {
                let act = ex.forward(x, layer)?;
                let (loss, g) = grams_frobenius_error(gram, &act)?;
                Ok((loss, ex.backward(x, layer, &g)?))
            }
            Term::Feature { layer, target, normalized } => {
                let act = ex.forward(x, layer)?;
                let (loss, g) = if *normalized {
                    normalized_euclidean_error(target, &act)?
                } else {
                    euclidean_error(target, &act)?
                };
                Ok((loss, ex.backward(x, layer, &g)?))
            }
            Term::TotalVariation => Ok(total_variation_error(x)),
        }
    }
}

/// Weighted sum of loss terms.
#[derive(Clone, Debug, Default)]
pub struct LossSpec {
    terms: SmallVec<(f32, Term), 8>,
    normalize_grad: bool,
}

impl LossSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn term(mut self, weight: f32, term: Term) -> Self {
        self.terms.push((weight, term));
        self
    }

    /// Divide the summed gradient by `sqrt(mean(g^2)) + 1e-5`.
    pub fn normalized(mut self) -> Self {
        self.normalize_grad = true;
        self
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Loss and gradient w.r.t. the input `x`. Zero-weight terms are not evaluated.
    pub fn eval<E: FeatureExtractor>(&self, ex: &E, x: &Tensor) -> Result<(f32, Tensor)> {
        let mut loss = 0.0f32;
        let mut grad = Tensor::zeros_like(x);

        for (w, term) in self.terms.iter() {
            if *w == 0.0 {
                continue;
            }
            let (l, g) = term.eval(ex, x)?;
            if g.shape() != x.shape() {
                return Err(Error::ShapeMismatch { expected: x.shape(), found: g.shape() });
            }
            loss += w * l;
            grad.add_scaled(*w, &g)?;
        }

        if self.normalize_grad && !grad.is_empty() {
            let rms = (grad.sum_sq() / grad.len() as f64).sqrt() as f32;
            grad.scale(1.0 / (rms + GRAD_NORM_EPS));
        }
        Ok((loss, grad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::PyramidExtractor;

    fn t(sh: crate::Shape, v: &[f32]) -> Tensor {
        Tensor::new(sh, v.to_vec()).unwrap()
    }

    #[test]
    fn gram_of_known_matrix() {
        // A = [[1, 2], [3, 4]], N = 2
        let g = gram(&t([1, 2, 1, 2], &[1.0, 2.0, 3.0, 4.0]));
        assert_eq!(g.shape(), [1, 1, 2, 2]);
        assert_eq!(g.data(), &[2.5, 5.5, 5.5, 12.5]);
    }

    #[test]
    fn gram_per_batch_item() {
        let g = gram(&t([2, 1, 1, 2], &[1.0, 1.0, 2.0, 0.0]));
        assert_eq!(g.data(), &[1.0, 2.0]);
    }

    #[test]
    fn style_gradient_matches_finite_differences() {
        let reference = t([1, 2, 2, 2], &[0.9, -0.2, 0.4, 0.1, 0.3, 0.8, -0.5, 0.6]);
        let gram_ref = gram(&reference);
        let act = t([1, 2, 2, 2], &[0.1, 0.5, -0.3, 0.7, 0.2, -0.4, 0.6, 0.05]);

        let (_, grad) = grams_frobenius_error(&gram_ref, &act).unwrap();
        let h = 1e-2;
        for i in 0..act.len() {
            let mut up = act.clone();
            up[i] += h;
            let mut dn = act.clone();
            dn[i] -= h;
            let fd = (grams_frobenius_error(&gram_ref, &up).unwrap().0
                - grams_frobenius_error(&gram_ref, &dn).unwrap().0) / (2.0 * h);
            assert!((fd - grad[i]).abs() < 1e-3, "{i}: fd {fd} vs {}", grad[i]);
        }
    }

    #[test]
    fn style_loss_is_zero_at_reference() {
        let act = t([1, 3, 2, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        let (loss, grad) = grams_frobenius_error(&gram(&act), &act).unwrap();
        assert_eq!(loss, 0.0);
        assert!(grad.data().iter().all(|g| *g == 0.0));
    }

    #[test]
    fn style_rejects_wrong_gram() {
        let act = Tensor::zeros([1, 3, 2, 2]);
        let res = grams_frobenius_error(&Tensor::zeros([1, 1, 2, 2]), &act);
        assert!(matches!(res, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn euclidean_losses() {
        let target = t([1, 1, 1, 2], &[1.0, 2.0]);
        let act = t([1, 1, 1, 2], &[2.0, 0.0]);

        let (loss, grad) = euclidean_error(&target, &act).unwrap();
        assert_eq!(loss, 5.0);
        assert_eq!(grad.data(), &[2.0, -4.0]);

        let (loss, grad) = normalized_euclidean_error(&target, &act).unwrap();
        assert_eq!(loss, 1.0);
        assert_eq!(grad.data(), &[0.4, -0.8]);
    }

    #[test]
    fn normalized_euclidean_keeps_non_finite_target() {
        let act = t([1, 1, 1, 2], &[2.0, 0.0]);

        let (loss, _) = normalized_euclidean_error(&t([1, 1, 1, 2], &[0.0, 0.0]), &act).unwrap();
        assert_eq!(loss, (4.0 / NORM_EPS) as f32);

        let (loss, grad) = normalized_euclidean_error(&t([1, 1, 1, 2], &[f32::NAN, 1.0]), &act).unwrap();
        assert!(loss.is_nan());
        assert!(grad.data().iter().all(|g| g.is_nan()));

        let (loss, _) = normalized_euclidean_error(&t([1, 1, 1, 2], &[f32::INFINITY, 1.0]), &act).unwrap();
        assert!(!loss.is_finite());
    }

    #[test]
    fn total_variation_of_small_image() {
        let (loss, grad) = total_variation_error(&t([1, 1, 2, 2], &[0.0, 1.0, 3.0, 5.0]));
        assert_eq!(loss, 10.0);
        assert_eq!(grad.data(), &[-8.0, 2.0, 6.0, 0.0]);

        let (loss, grad) = total_variation_error(&Tensor::ones([1, 3, 1, 1]));
        assert_eq!(loss, 0.0);
        assert_eq!(grad.shape(), [1, 3, 1, 1]);
    }

    #[test]
    fn spec_sums_weighted_terms() {
        let ex = PyramidExtractor::new(1);
        let content = t([1, 1, 2, 2], &[1.0, 1.0, 1.0, 1.0]);
        let x = t([1, 1, 2, 2], &[0.0, 1.0, 3.0, 5.0]);

        let spec = LossSpec::new()
            .term(0.5, Term::feature(&ex, &content, "pool_0", false).unwrap())
            .term(2.0, Term::TotalVariation)
            .term(0.0, Term::Style { layer: "missing".into(), gram: Tensor::zeros([1, 1, 1, 1]) });

        let (loss, grad) = spec.eval(&ex, &x).unwrap();
        // feature: 1 + 0 + 4 + 16 = 21, tv: 10
        assert_eq!(loss, 0.5 * 21.0 + 2.0 * 10.0);
        // 0.5 * 2 (x - 1) + 2 * tv_grad
        assert_eq!(grad.data(), &[-1.0 - 16.0, 0.0 + 4.0, 2.0 + 12.0, 4.0]);
    }

    #[test]
    fn normalized_gradient_has_unit_rms() {
        let ex = PyramidExtractor::new(2);
        let style = t([1, 2, 2, 2], &[0.9, -0.2, 0.4, 0.1, 0.3, 0.8, -0.5, 0.6]);
        let x = t([1, 2, 2, 2], &[0.1, 0.5, -0.3, 0.7, 0.2, -0.4, 0.6, 0.05]);

        let spec = LossSpec::new()
            .term(1.0, Term::style(&ex, &style, "pool_0").unwrap())
            .term(1.0, Term::style(&ex, &style, "pool_1").unwrap())
            .normalized();
        let (loss, grad) = spec.eval(&ex, &x).unwrap();

        assert!(loss > 0.0);
        let rms = (grad.sum_sq() / grad.len() as f64).sqrt();
        assert!((rms - 1.0).abs() < 1e-3, "{rms}");
    }

    #[test]
    fn unknown_layer_fails_eval() {
        let ex = PyramidExtractor::new(1);
        let x = Tensor::zeros([1, 1, 2, 2]);
        let spec = LossSpec::new().term(1.0, Term::Feature {
            layer: "pool_4".into(),
            target: x.clone(),
            normalized: false,
        });
        assert!(matches!(spec.eval(&ex, &x), Err(Error::UnknownLayer(_))));
    }
}
