//! Image files to and from `[1, 3, h, w]` tensors in `[0, 255]` pixel range.

use std::path::Path;

use image::imageops::FilterType;
use image::RgbImage;

use crate::{image_shape, Error, Result, Tensor, B, F, H, W};

/// Per-channel RGB mean of the ImageNet training set.
pub const IMAGENET_MEAN: [f32; 3] = [123.68, 116.779, 103.939];

pub fn load_image(path: impl AsRef<Path>, size: Option<u32>) -> Result<Tensor> {
    let path = path.as_ref();
    let mut img = image::open(path)?.to_rgb8();
    if let Some(s) = size {
        img = image::imageops::resize(&img, s, s, FilterType::Triangle);
    }
    log::debug!("loaded {} ({}x{})", path.display(), img.width(), img.height());
    Ok(rgb_to_tensor(&img))
}

pub fn rgb_to_tensor(img: &RgbImage) -> Tensor {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let mut t = Tensor::zeros(image_shape(3, h, w));
    for (x, y, px) in img.enumerate_pixels() {
        for c in 0..3 {
            let o = t.offset(0, c, y as usize, x as usize);
            t[o] = px[c] as f32;
        }
    }
    t
}

/// Clamp to `[0, 255]`, round, and interleave channels.
pub fn tensor_to_rgb(t: &Tensor) -> Result<RgbImage> {
    let sh = t.shape();
    if sh[B] != 1 || sh[F] != 3 {
        return Err(Error::ShapeMismatch { expected: image_shape(3, sh[H], sh[W]), found: sh });
    }

    let mut raw = Vec::with_capacity(t.len());
    for y in 0..sh[H] {
        for x in 0..sh[W] {
            for c in 0..3 {
                raw.push(t[t.offset(0, c, y, x)].clamp(0.0, 255.0).round() as u8);
            }
        }
    }
    RgbImage::from_raw(sh[W] as u32, sh[H] as u32, raw)
        .ok_or(Error::DataLength { shape: sh, len: t.len() })
}

/// Write `t` as an image, creating parent directories. The format follows the extension.
pub fn save_image(t: &Tensor, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let img = tensor_to_rgb(t)?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    img.save(path)?;
    log::info!("wrote {}", path.display());
    Ok(())
}

fn offset_channels(t: &mut Tensor, mean: &[f32], sign: f32) -> Result<()> {
    let sh = t.shape();
    if mean.len() != sh[F] {
        return Err(Error::ShapeMismatch { expected: [sh[B], mean.len(), sh[H], sh[W]], found: sh });
    }
    let plane = sh[H] * sh[W];
    if plane == 0 {
        return Ok(());
    }
    for (i, chunk) in t.data_mut().chunks_mut(plane).enumerate() {
        let m = sign * mean[i % sh[F]];
        chunk.iter_mut().for_each(|v| *v += m);
    }
    Ok(())
}

pub fn subtract_mean(t: &mut Tensor, mean: &[f32]) -> Result<()> {
    offset_channels(t, mean, -1.0)
}

pub fn add_mean(t: &mut Tensor, mean: &[f32]) -> Result<()> {
    offset_channels(t, mean, 1.0)
}
