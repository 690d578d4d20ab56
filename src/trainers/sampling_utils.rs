//! Image output utilities for generated samples

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use image::{ImageBuffer, Rgb};
use std::fs;
use std::path::{Path, PathBuf};

/// Map a `[C, H, W]` tensor with values in [-1, 1] to interleaved RGB bytes
fn to_rgb_bytes(tensor: &Tensor) -> Result<(usize, usize, Vec<u8>)> {
    let (c, h, w) = tensor.dims3()?;
    let tensor = tensor.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;

    // Denormalize from [-1, 1] to [0, 255]
    let tensor = ((tensor.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?;
    let tensor = match c {
        3 => tensor,
        // Grayscale - repeat into RGB
        1 => Tensor::cat(&[&tensor, &tensor, &tensor], 0)?,
        _ => bail!("Unsupported number of channels: {}", c),
    };
    let data: Vec<u8> = tensor
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<f32>()?
        .into_iter()
        .map(|x| x.round() as u8)
        .collect();
    Ok((h, w, data))
}

/// Save a `[C, H, W]` tensor as an image
pub fn save_tensor_as_image(tensor: &Tensor, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let (h, w, data) = to_rgb_bytes(tensor)?;
    let img = ImageBuffer::<Rgb<u8>, _>::from_raw(w as u32, h as u32, data)
        .context("Failed to create image buffer")?;
    img.save(path)
        .with_context(|| format!("Failed to save image: {}", path.display()))?;
    Ok(())
}

/// Tile a `[N, C, H, W]` batch into a ceil(sqrt(N)) x ceil(sqrt(N)) grid and save it
pub fn save_image_grid(images: &Tensor, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let (n, _, h, w) = images.dims4()?;
    let k = (n as f64).sqrt().ceil() as usize;
    let mut grid = ImageBuffer::<Rgb<u8>, Vec<u8>>::new((k * w) as u32, (k * h) as u32);
    for i in 0..n {
        let (_, _, data) = to_rgb_bytes(&images.get(i)?)?;
        let (gx, gy) = ((i % k) * w, (i / k) * h);
        for y in 0..h {
            for x in 0..w {
                let o = (y * w + x) * 3;
                grid.put_pixel(
                    (gx + x) as u32,
                    (gy + y) as u32,
                    Rgb([data[o], data[o + 1], data[o + 2]]),
                );
            }
        }
    }
    grid.save(path)
        .with_context(|| format!("Failed to save image grid: {}", path.display()))?;
    Ok(())
}

/// Create the sample directory of a run
pub fn create_sample_directory(base_dir: &Path) -> Result<PathBuf> {
    let sample_dir = base_dir.join("samples");
    fs::create_dir_all(&sample_dir)?;
    Ok(sample_dir)
}
