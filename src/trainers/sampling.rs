//! Ancestral DDPM sampling
//! Walks from pure noise to an image by repeatedly predicting the noise,
//! estimating x_0 and re-noising the estimate at the next (smaller) timestep

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use log::info;
use rand::Rng;
use std::path::{Path, PathBuf};

use super::ddpm_scheduler::{denoisify, noisify_with_rng, standard_normal};
use super::sampling_utils::{create_sample_directory, save_image_grid};
use crate::error::DiffusionError;
use crate::models::Unet;

/// Anything that predicts the noise contained in `x_t` at timesteps `t`
pub trait NoisePredictor {
    fn predict_noise(&self, x_t: &Tensor, t: &Tensor) -> Result<Tensor>;
}

impl NoisePredictor for Unet {
    fn predict_noise(&self, x_t: &Tensor, t: &Tensor) -> Result<Tensor> {
        Ok(self.forward_t(x_t, t, false)?)
    }
}

/// `n_steps` evenly spaced timesteps from `1 - 1/n_steps` down to 0
pub fn sampling_timesteps(n_steps: usize) -> Vec<f32> {
    let start = 1.0 - 1.0 / n_steps as f64;
    if n_steps <= 1 {
        return vec![start as f32; n_steps];
    }
    (0..n_steps)
        .map(|i| (start - start * i as f64 / (n_steps - 1) as f64) as f32)
        .collect()
}

#[cfg(feature = "progress-bar")]
struct StepProgress(indicatif::ProgressBar);

#[cfg(feature = "progress-bar")]
impl StepProgress {
    fn new(len: usize) -> Self {
        let pb = indicatif::ProgressBar::new(len as u64);
        if let Ok(style) = indicatif::ProgressStyle::with_template(
            "{bar:40.cyan/blue} {pos}/{len} time steps [{elapsed_precise}<{eta_precise}]",
        ) {
            pb.set_style(style);
        }
        Self(pb)
    }

    fn inc(&self) {
        self.0.inc(1);
    }

    fn finish(&self) {
        self.0.finish_and_clear();
    }
}

#[cfg(not(feature = "progress-bar"))]
struct StepProgress;

#[cfg(not(feature = "progress-bar"))]
impl StepProgress {
    fn new(_len: usize) -> Self {
        Self
    }

    fn inc(&self) {}

    fn finish(&self) {}
}

/// Generate a `[bs, c, h, w]` batch from pure noise in `n_steps` model evaluations
pub fn ddpm<M: NoisePredictor + ?Sized>(
    model: &M,
    shape: (usize, usize, usize, usize),
    n_steps: usize,
    device: &Device,
) -> Result<Tensor> {
    ddpm_with_rng(model, shape, n_steps, device, &mut rand::thread_rng())
}

/// [`ddpm`] with an explicit random source
pub fn ddpm_with_rng<M: NoisePredictor + ?Sized, R: Rng + ?Sized>(
    model: &M,
    shape: (usize, usize, usize, usize),
    n_steps: usize,
    device: &Device,
    rng: &mut R,
) -> Result<Tensor> {
    if n_steps == 0 {
        return Err(DiffusionError::NoSamplingSteps.into());
    }
    let bs = shape.0;
    let mut x_t = standard_normal(shape, device, rng)?;
    let ts = sampling_timesteps(n_steps);

    let progress = StepProgress::new(n_steps - 1);
    for pair in ts.windows(2) {
        let t = Tensor::full(pair[0], bs, device)?;
        let t_next = Tensor::full(pair[1], bs, device)?;
        let noise_pred = model.predict_noise(&x_t, &t)?;
        let x_0_pred = denoisify(&x_t, &noise_pred, &t)?;
        // fresh noise at every step: ancestral sampling
        x_t = noisify_with_rng(&x_0_pred, Some(&t_next), rng)?.x_t;
        progress.inc();
    }
    progress.finish();

    let t = Tensor::zeros(bs, DType::F32, device)?;
    let noise_pred = model.predict_noise(&x_t, &t)?;
    denoisify(&x_t, &noise_pred, &t)
}

/// Generates a grid of samples at the end of every training epoch
#[derive(Debug, Clone, Copy)]
pub struct DdpmCallback {
    pub n_imgs: usize,
    pub n_steps: usize,
}

impl Default for DdpmCallback {
    fn default() -> Self {
        Self {
            n_imgs: 4,
            n_steps: 100,
        }
    }
}

impl DdpmCallback {
    /// Sample `n_imgs` images of `(height, width)` and save them as one grid under `run_dir/samples`
    pub fn on_train_epoch_end(
        &self,
        model: &Unet,
        img_size: (usize, usize),
        device: &Device,
        run_dir: &Path,
        epoch: usize,
    ) -> Result<PathBuf> {
        let (height, width) = img_size;
        let shape = (self.n_imgs, model.color_channels(), height, width);
        info!("Sampling {} images with {} steps after epoch {}", self.n_imgs, self.n_steps, epoch);
        let x_0 = ddpm(model, shape, self.n_steps, device)?;
        let path = create_sample_directory(run_dir)?.join(format!("epoch_{:04}.png", epoch));
        save_image_grid(&x_0, &path)?;
        info!("Samples saved to: {}", path.display());
        Ok(path)
    }
}
