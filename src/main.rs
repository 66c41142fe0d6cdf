use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

use styleopt::codec::{load_image, IMAGENET_MEAN};
use styleopt::experiment::{gatys_sweep, reconstruct_layers, Images, Report, ReconstructConfig, SweepConfig};
use styleopt::features::PyramidExtractor;
use styleopt::noise::white_noise;
use styleopt::optim::{AdamParams, DEFAULT_ITERATIONS};
use styleopt::{image_shape, Error, Result};

#[derive(Parser, Debug)]
#[command(name = "styleopt", about = "Style and feature reconstruction by pixel optimization")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Style + feature runs over the alpha/beta/gamma grid, one batch per feature layer
    Sweep(Common),
    /// Style-only and feature-only reconstruction for every layer
    Reconstruct(Common),
}

#[derive(Args, Debug)]
struct Common {
    /// Content image
    #[arg(long)]
    content: PathBuf,
    /// Style image
    #[arg(long)]
    style: PathBuf,
    /// Output directory, created if missing
    #[arg(long, default_value = "results")]
    results: PathBuf,
    /// Images are resized to size x size
    #[arg(long, default_value_t = 256)]
    size: u32,
    /// Pooling levels of the feature pyramid
    #[arg(long, default_value_t = 5)]
    levels: usize,
    #[arg(long, default_value_t = DEFAULT_ITERATIONS)]
    iterations: usize,
    /// Seed of the starting noise
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Sequence number of the first written image
    #[arg(long, default_value_t = 1)]
    first_seq: usize,
    /// Adam override, e.g. `--set learning_rate=0.5`
    #[arg(long = "set", value_parser = parse_override)]
    overrides: Vec<(String, f32)>,
    /// Worker threads, rayon default when absent
    #[arg(long)]
    jobs: Option<usize>,
}

fn parse_override(s: &str) -> std::result::Result<(String, f32), String> {
    let (k, v) = s.split_once('=').ok_or_else(|| format!("expected name=value, got `{s}`"))?;
    let v = v.trim().parse::<f32>().map_err(|e| format!("{k}: {e}"))?;
    Ok((k.trim().to_string(), v))
}

impl Common {
    fn adam(&self) -> Result<AdamParams> {
        let mut p = AdamParams { lr: 1.0, ..Default::default() };
        for (k, v) in &self.overrides {
            p.set(k, *v)?;
        }
        p.validate()?;
        Ok(p)
    }

    fn images(&self) -> Result<Images> {
        let size = Some(self.size);
        let sh = image_shape(3, self.size as usize, self.size as usize);
        Ok(Images {
            content: load_image(&self.content, size)?,
            style: load_image(&self.style, size)?,
            noise: white_noise(sh, self.seed)?,
            feature_noise: Some(white_noise(sh, self.seed.wrapping_add(1))?),
        })
    }
}

fn execute(cmd: Cmd) -> Result<Report> {
    let (Cmd::Sweep(c) | Cmd::Reconstruct(c)) = &cmd;

    if let Some(n) = c.jobs {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build_global()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
    }

    let adam = c.adam()?;
    let images = c.images()?;
    let ex = PyramidExtractor::new(c.levels);

    match &cmd {
        Cmd::Sweep(c) => gatys_sweep(&ex, &images, &SweepConfig {
            adam,
            iterations: c.iterations,
            first_seq: c.first_seq,
            mean: IMAGENET_MEAN.to_vec(),
            results: c.results.clone(),
            ..Default::default()
        }),
        Cmd::Reconstruct(c) => reconstruct_layers(&ex, &images, &ReconstructConfig {
            adam,
            iterations: c.iterations,
            first_seq: c.first_seq,
            mean: IMAGENET_MEAN.to_vec(),
            results: c.results.clone(),
            ..Default::default()
        }),
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match execute(cli.cmd) {
        Ok(report) => {
            println!(
                "wrote {} images, {} failed, {} not finite, next sequence {:04}",
                report.written.len(), report.failed, report.non_finite, report.next_seq
            );
            if report.failed > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
