//! Style and feature reconstruction experiments.
//!
//! Every run owns its own copy of the starting image and its own optimizer state, so
//! runs are spread over the rayon pool. A run that fails is logged and skipped, the
//! rest of the experiment carries on.

use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::codec::{add_mean, save_image, subtract_mean, IMAGENET_MEAN};
use crate::features::FeatureExtractor;
use crate::loss::{LossSpec, Term};
use crate::optim::{self, Adam, AdamParams, Optimizer, DEFAULT_ITERATIONS};
use crate::sweep::{plan, prefix, Artifact, Grid, Job, Reconstruct};
use crate::{Result, Tensor};

/// Input images in pixel range.
#[derive(Clone, Debug)]
pub struct Images {
    pub content: Tensor,
    pub style: Tensor,
    /// Starting point of every run
    pub noise: Tensor,
    /// Starting point of feature reconstructions, `noise` when absent
    pub feature_noise: Option<Tensor>,
}

#[derive(Clone, Debug)]
pub struct SweepConfig {
    /// Layers whose grams are matched in every run, all extractor layers when empty
    pub style_layers: Vec<String>,
    /// One batch of runs per layer, all extractor layers when empty
    pub feature_layers: Vec<String>,
    pub grid: Grid,
    pub adam: AdamParams,
    pub iterations: usize,
    pub first_seq: usize,
    pub mean: Vec<f32>,
    pub results: PathBuf,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            style_layers: vec![],
            feature_layers: vec![],
            grid: Grid::default(),
            adam: AdamParams { lr: 1.0, ..Default::default() },
            iterations: DEFAULT_ITERATIONS,
            first_seq: 1,
            mean: IMAGENET_MEAN.to_vec(),
            results: PathBuf::from("results"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReconstructConfig {
    /// Reconstructed deepest first, all extractor layers when empty
    pub layers: Vec<String>,
    pub adam: AdamParams,
    pub iterations: usize,
    pub first_seq: usize,
    pub mean: Vec<f32>,
    pub results: PathBuf,
}

impl Default for ReconstructConfig {
    fn default() -> Self {
        let SweepConfig { adam, iterations, first_seq, mean, results, .. } = SweepConfig::default();
        Self { layers: vec![], adam, iterations, first_seq, mean, results }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Report {
    pub written: Vec<PathBuf>,
    /// Runs that returned an error
    pub failed: usize,
    /// Runs whose result held NaN or infinity, not written
    pub non_finite: usize,
    /// First sequence number not used by this experiment
    pub next_seq: usize,
}

impl Report {
    fn collect(outcomes: Vec<Result<Option<PathBuf>>>, next_seq: usize) -> Self {
        let mut report = Report { next_seq, ..Default::default() };
        for o in outcomes {
            match o {
                Ok(Some(path)) => report.written.push(path),
                Ok(None) => report.non_finite += 1,
                Err(_) => report.failed += 1,
            }
        }
        report
    }
}

fn centred(t: &Tensor, mean: &[f32]) -> Result<Tensor> {
    let mut t = t.clone();
    subtract_mean(&mut t, mean)?;
    Ok(t)
}

fn layers_or_all<E: FeatureExtractor>(ex: &E, layers: &[String]) -> Vec<String> {
    if layers.is_empty() {
        ex.layers()
    } else {
        layers.to_vec()
    }
}

/// Optimize `init` under `spec`, then write it under `results` as `artifact`.
///
/// `Ok(None)` when the result is not finite and nothing was written.
fn optimize_and_save<E: FeatureExtractor>(
    ex: &E,
    spec: &LossSpec,
    init: &Tensor,
    adam: &Adam,
    iterations: usize,
    mean: &[f32],
    results: &Path,
    artifact: &Artifact,
) -> Result<Option<PathBuf>> {
    let mut out = optim::run(init.clone(), |x| spec.eval(ex, x), adam, iterations)?;
    add_mean(&mut out, mean)?;

    if !out.is_finite() {
        log::warn!("{artifact}: result is not finite, skipping");
        return Ok(None);
    }
    let path = results.join(artifact.file_name());
    save_image(&out, &path)?;
    Ok(Some(path))
}

fn logged(artifact: &Artifact, res: Result<Option<PathBuf>>) -> Result<Option<PathBuf>> {
    if let Err(e) = &res {
        log::warn!("{artifact}: {e}, skipping");
    }
    res
}

/// Style-plus-feature reconstructions over a weight grid.
///
/// Each run minimizes `alpha * mean(style losses) + beta * feature loss + gamma * tv`
/// starting from `images.noise`.
pub fn gatys_sweep<E: FeatureExtractor>(ex: &E, images: &Images, cfg: &SweepConfig) -> Result<Report> {
    let adam = Adam::new(cfg.adam.clone());
    adam.validate()?;

    let style_layers = layers_or_all(ex, &cfg.style_layers);
    let feature_layers = layers_or_all(ex, &cfg.feature_layers);

    let content = centred(&images.content, &cfg.mean)?;
    let style = centred(&images.style, &cfg.mean)?;
    let init = centred(&images.noise, &cfg.mean)?;

    let styles = style_layers.iter()
        .map(|l| Term::style(ex, &style, l))
        .collect::<Result<Vec<_>>>()?;
    let features = feature_layers.iter()
        .map(|l| Term::feature(ex, &content, l, true))
        .collect::<Result<Vec<_>>>()?;

    let (jobs, next_seq) = plan(&feature_layers, &cfg.grid, cfg.first_seq);
    log::info!(
        "sweep: {} runs, {} style layers, {} feature layers, {} iterations each",
        jobs.len(), styles.len(), features.len(), cfg.iterations
    );

    let style_share = if styles.is_empty() { 0.0 } else { 1.0 / styles.len() as f64 };

    let outcomes: Vec<_> = jobs.par_iter()
        .map(|job: &Job| {
            let Job { layer, weights: w, .. } = job;
            let idx = feature_layers.iter().position(|l| l == layer).unwrap_or_default();

            let mut spec = LossSpec::new().normalized();
            for s in &styles {
                spec = spec.term((w.alpha * style_share) as f32, s.clone());
            }
            let spec = spec
                .term(w.beta as f32, features[idx].clone())
                .term(w.gamma as f32, Term::TotalVariation);

            let artifact = job.artifact();
            log::info!("{artifact}: starting");
            let res = optimize_and_save(ex, &spec, &init, &adam, cfg.iterations, &cfg.mean, &cfg.results, &artifact);
            logged(&artifact, res)
        })
        .collect();

    Ok(Report::collect(outcomes, next_seq))
}

/// Style-only and feature-only reconstructions, one pair per layer, deepest layer first.
///
/// Both images of a layer share a sequence number.
pub fn reconstruct_layers<E: FeatureExtractor>(ex: &E, images: &Images, cfg: &ReconstructConfig) -> Result<Report> {
    let adam = Adam::new(cfg.adam.clone());
    adam.validate()?;

    let mut layers = layers_or_all(ex, &cfg.layers);
    layers.reverse();

    let content = centred(&images.content, &cfg.mean)?;
    let style = centred(&images.style, &cfg.mean)?;
    let style_init = centred(&images.noise, &cfg.mean)?;
    let feature_init = match &images.feature_noise {
        Some(n) => centred(n, &cfg.mean)?,
        None => style_init.clone(),
    };

    let mut runs = Vec::with_capacity(layers.len() * 2);
    for (i, layer) in layers.iter().enumerate() {
        let seq = cfg.first_seq + i;
        let style_spec = LossSpec::new().term(1.0, Term::style(ex, &style, layer)?).normalized();
        let feature_spec = LossSpec::new().term(1.0, Term::feature(ex, &content, layer, false)?).normalized();

        runs.push((Artifact::Reconstruction { seq, kind: Reconstruct::Style, layer: layer.clone() }, style_spec, &style_init));
        runs.push((Artifact::Reconstruction { seq, kind: Reconstruct::Feature, layer: layer.clone() }, feature_spec, &feature_init));
    }
    let next_seq = cfg.first_seq + layers.len();
    log::info!(
        "reconstruct: {} layers from {} to {}",
        layers.len(), prefix(cfg.first_seq), prefix(next_seq.saturating_sub(1))
    );

    let outcomes: Vec<_> = runs.par_iter()
        .map(|(artifact, spec, init)| {
            log::info!("{artifact}: starting");
            let res = optimize_and_save(ex, spec, init, &adam, cfg.iterations, &cfg.mean, &cfg.results, artifact);
            logged(artifact, res)
        })
        .collect();

    Ok(Report::collect(outcomes, next_seq))
}
