//! Hyperparameter enumeration and result file naming.
//!
//! Result files are named `<seq><descriptor>.png`, `seq` being a zero-padded run counter.
//! Downstream tooling parses these names, so [Artifact::file_name] and [Artifact::parse]
//! must stay in sync with files already on disk.

use std::fmt;

/// Loss weights of one sweep run: style, feature and total-variation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Weights {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl Weights {
    pub fn descriptor(&self) -> String {
        format!(
            "_alpha{}_beta{}_gamma{}",
            py_float(self.alpha),
            py_float(self.beta),
            py_float(self.gamma)
        )
    }
}

/// Pruning rule of the sweep: drop equal style and feature weights unless both are 1.
pub fn keep(alpha: f64, beta: f64) -> bool {
    !(alpha == beta && alpha != 1.0)
}

#[derive(Clone, Debug, PartialEq)]
pub struct Grid {
    pub alphas: Vec<f64>,
    pub betas: Vec<f64>,
    pub gammas: Vec<f64>,
}

impl Default for Grid {
    fn default() -> Self {
        Self {
            alphas: vec![1.0, 1e-2, 1e-4],
            betas: vec![1.0, 1e-2, 1e-4],
            gammas: vec![0.0, 1e-2, 1e-4],
        }
    }
}

impl Grid {
    /// Every kept combination, alpha varying slowest.
    pub fn weights(&self) -> Vec<Weights> {
        let mut out = vec![];
        for &alpha in &self.alphas {
            for &beta in &self.betas {
                if !keep(alpha, beta) {
                    continue;
                }
                for &gamma in &self.gammas {
                    out.push(Weights { alpha, beta, gamma });
                }
            }
        }
        out
    }
}

/// One optimization run of a sweep.
#[derive(Clone, Debug, PartialEq)]
pub struct Job {
    pub seq: usize,
    pub layer: String,
    pub weights: Weights,
}

impl Job {
    pub fn artifact(&self) -> Artifact {
        Artifact::Sweep {
            seq: self.seq,
            layer: self.layer.clone(),
            weights: self.weights,
        }
    }
}

/// Enumerate jobs for every feature layer and weight combination, numbering them from
/// `first_seq`. Returns the jobs and the next free sequence number.
pub fn plan(layers: &[String], grid: &Grid, first_seq: usize) -> (Vec<Job>, usize) {
    let weights = grid.weights();
    let mut seq = first_seq;
    let mut jobs = Vec::with_capacity(layers.len() * weights.len());

    for layer in layers {
        for w in &weights {
            jobs.push(Job { seq, layer: layer.clone(), weights: *w });
            seq += 1;
        }
    }
    (jobs, seq)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reconstruct {
    Style,
    Feature,
}

impl Reconstruct {
    fn tag(self) -> &'static str {
        match self {
            Reconstruct::Style => "style",
            Reconstruct::Feature => "feat",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Artifact {
    /// `0001_gatys_paper_feat<layer>_alpha1.0_beta0.01_gamma0.0.png`
    Sweep { seq: usize, layer: String, weights: Weights },
    /// `0001_style_<layer>.png` or `0001_feat_<layer>.png`
    Reconstruction { seq: usize, kind: Reconstruct, layer: String },
}

const SWEEP_TAG: &str = "gatys_paper_feat";

pub fn prefix(seq: usize) -> String {
    format!("{seq:04}")
}

impl Artifact {
    pub fn file_name(&self) -> String {
        match self {
            Artifact::Sweep { seq, layer, weights } => {
                format!("{}_{SWEEP_TAG}{layer}{}.png", prefix(*seq), weights.descriptor())
            }
            Artifact::Reconstruction { seq, kind, layer } => {
                format!("{}_{}_{layer}.png", prefix(*seq), kind.tag())
            }
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".png")?;
        let (seq, rest) = stem.split_once('_')?;
        if seq.len() < 4 || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let seq = seq.parse().ok()?;

        if let Some(rest) = rest.strip_prefix(SWEEP_TAG) {
            let (rest, gamma) = rest.rsplit_once("_gamma")?;
            let (rest, beta) = rest.rsplit_once("_beta")?;
            let (layer, alpha) = rest.rsplit_once("_alpha")?;
            return Some(Artifact::Sweep {
                seq,
                layer: layer.to_string(),
                weights: Weights {
                    alpha: alpha.parse().ok()?,
                    beta: beta.parse().ok()?,
                    gamma: gamma.parse().ok()?,
                },
            });
        }

        for kind in [Reconstruct::Style, Reconstruct::Feature] {
            if let Some(layer) = rest.strip_prefix(kind.tag()).and_then(|r| r.strip_prefix('_')) {
                return Some(Artifact::Reconstruction { seq, kind, layer: layer.to_string() });
            }
        }
        None
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Format a float the way Python's `repr` does: `1.0`, `0.01`, `0.0001`, `1e-05`, `1e+16`.
pub fn py_float(x: f64) -> String {
    if x.is_nan() {
        return "nan".into();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf" } else { "-inf" }.into();
    }
    if x == 0.0 {
        return if x.is_sign_negative() { "-0.0" } else { "0.0" }.into();
    }

    let sci = format!("{x:e}");
    let Some((mantissa, exp)) = sci.split_once('e') else {
        return sci;
    };
    let exp: i32 = exp.parse().unwrap_or_default();
    if (-4..16).contains(&exp) {
        // Debug prints the shortest round-trip digits with a trailing `.0`
        return format!("{x:?}");
    }
    let sign = if exp < 0 { '-' } else { '+' };
    format!("{mantissa}e{sign}{:02}", exp.abs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_float_repr() {
        let cases = [
            (1.0, "1.0"),
            (1e-2, "0.01"),
            (1e-4, "0.0001"),
            (1e-5, "1e-05"),
            (2.5e-7, "2.5e-07"),
            (0.0, "0.0"),
            (-0.5, "-0.5"),
            (100.0, "100.0"),
            (1e16, "1e+16"),
            (1.5e300, "1.5e+300"),
            (123456.789, "123456.789"),
        ];
        for (x, want) in cases {
            assert_eq!(py_float(x), want, "{x}");
        }
    }

    #[test]
    fn pruning_rule() {
        assert!(keep(1.0, 1.0));
        assert!(!keep(1e-2, 1e-2));
        assert!(!keep(1e-4, 1e-4));
        assert!(keep(1e-2, 1e-4));
        assert!(keep(1.0, 1e-2));
    }

    #[test]
    fn default_grid() {
        let w = Grid::default().weights();
        assert_eq!(w.len(), 21);
        assert_eq!(w[0], Weights { alpha: 1.0, beta: 1.0, gamma: 0.0 });
        assert_eq!(w[1], Weights { alpha: 1.0, beta: 1.0, gamma: 1e-2 });
        assert_eq!(w[3], Weights { alpha: 1.0, beta: 1e-2, gamma: 0.0 });
        // alpha = 0.01 skips beta = 0.01
        assert_eq!(w[9], Weights { alpha: 1e-2, beta: 1.0, gamma: 0.0 });
        assert_eq!(w[12], Weights { alpha: 1e-2, beta: 1e-4, gamma: 0.0 });
        assert!(w.iter().all(|w| keep(w.alpha, w.beta)));
    }

    #[test]
    fn plan_threads_sequence_numbers() {
        let layers = vec!["pool_0".to_string(), "pool_1".to_string()];
        let grid = Grid {
            alphas: vec![1.0],
            betas: vec![1.0, 0.5],
            gammas: vec![0.0],
        };
        let (jobs, next) = plan(&layers, &grid, 7);

        assert_eq!(next, 11);
        assert_eq!(jobs.iter().map(|j| j.seq).collect::<Vec<_>>(), vec![7, 8, 9, 10]);
        assert_eq!(jobs[2].layer, "pool_1");
        assert_eq!(jobs[3].weights.beta, 0.5);

        let (jobs, again) = plan(&[], &grid, next);
        assert!(jobs.is_empty());
        assert_eq!(again, next);
    }

    #[test]
    fn sweep_file_names() {
        let a = Artifact::Sweep {
            seq: 1,
            layer: "conv_1_2".into(),
            weights: Weights { alpha: 1.0, beta: 1e-2, gamma: 0.0 },
        };
        let name = a.file_name();
        assert_eq!(name, "0001_gatys_paper_featconv_1_2_alpha1.0_beta0.01_gamma0.0.png");
        assert_eq!(Artifact::parse(&name), Some(a));

        let big = Artifact::Sweep {
            seq: 12345,
            layer: "pool_3".into(),
            weights: Weights { alpha: 1e-4, beta: 1e-5, gamma: 1e-2 },
        };
        assert_eq!(big.to_string(), "12345_gatys_paper_featpool_3_alpha0.0001_beta1e-05_gamma0.01.png");
        assert_eq!(Artifact::parse(&big.file_name()), Some(big));
    }

    #[test]
    fn reconstruction_file_names() {
        let s = Artifact::Reconstruction { seq: 3, kind: Reconstruct::Style, layer: "conv_5_3".into() };
        let f = Artifact::Reconstruction { seq: 3, kind: Reconstruct::Feature, layer: "conv_5_3".into() };
        assert_eq!(s.file_name(), "0003_style_conv_5_3.png");
        assert_eq!(f.file_name(), "0003_feat_conv_5_3.png");
        assert_eq!(Artifact::parse("0003_feat_conv_5_3.png"), Some(f));
        assert_eq!(Artifact::parse("0003_style_conv_5_3.png"), Some(s));
    }

    #[test]
    fn foreign_names_do_not_parse() {
        for name in ["notes.txt", "01_style_a.png", "abcd_style_a.png", "0001_other_a.png", "0001_gatys_paper_featx_alpha1.0.png"] {
            assert_eq!(Artifact::parse(name), None, "{name}");
        }
    }
}
