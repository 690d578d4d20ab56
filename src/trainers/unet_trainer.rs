//! U-Net noise-prediction trainer
//!
//! Wraps the model with its MSE objective, AdamW and the one-cycle schedule,
//! and drives epochs over a [`DiffusionDataModule`].

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::data_loader::DiffusionDataModule;
use super::ddpm_scheduler::NoisyBatch;
use super::lr_scheduler::{ConstantScheduler, LRScheduler, OneCycleLR};
use super::sampling::ddpm;
use super::{load_config, save_config, setup_device, Config};
use crate::error::DiffusionError;
use crate::models::Unet;

const WEIGHTS_FILE: &str = "unet.safetensors";
const CONFIG_FILE: &str = "config.yaml";
const STATE_FILE: &str = "training_state.json";

/// Losses of a finished `fit`
#[derive(Debug, Clone, Default)]
pub struct FitSummary {
    pub steps: usize,
    pub train_losses: Vec<f32>,
    /// Mean validation loss per epoch, when a test split is configured
    pub val_losses: Vec<f32>,
    pub run_dir: PathBuf,
}

pub struct UnetTrainer {
    config: Config,
    device: Device,
    varmap: VarMap,
    unet: Unet,
    optimizer: AdamW,
    lr_scheduler: Box<dyn LRScheduler>,
    global_step: usize,
    run_dir: PathBuf,
}

impl UnetTrainer {
    pub fn new(config: Config) -> Result<Self> {
        let device = setup_device(&config.train.device)?;
        Self::with_device(config, device)
    }

    pub fn with_device(config: Config, device: Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let unet = Unet::from_varmap(&config.model, &varmap, vb)?;

        let params = ParamsAdamW {
            lr: config.train.lr as f64,
            eps: config.train.adamw_epsilon,
            weight_decay: config.train.weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;
        let n_params: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
        info!("U-Net built: {} stages, {} parameters", unet.n_stages(), n_params);

        let run_dir = config
            .train
            .checkpoint_dir
            .join(&config.train.version)
            .join(chrono::Local::now().format("%d-%m-%Y-%H-%M-%S").to_string());

        Ok(Self {
            lr_scheduler: Box::new(ConstantScheduler::new(config.train.lr)),
            config,
            device,
            varmap,
            unet,
            optimizer,
            global_step: 0,
            run_dir,
        })
    }

    /// Rebuild a trainer from a checkpoint directory written by [`save_checkpoint`](Self::save_checkpoint)
    pub fn from_checkpoint(dir: &Path, device: Device) -> Result<Self> {
        let config = load_config(&dir.join(CONFIG_FILE))?;
        let mut trainer = Self::with_device(config, device)?;
        trainer
            .varmap
            .load(dir.join(WEIGHTS_FILE))
            .with_context(|| format!("Failed to load weights from {}", dir.display()))?;
        if let Ok(state) = fs::read_to_string(dir.join(STATE_FILE)) {
            let state: serde_json::Value = serde_json::from_str(&state)?;
            trainer.global_step = state["step"].as_u64().unwrap_or(0) as usize;
        }
        info!("Loaded checkpoint from {} (step {})", dir.display(), trainer.global_step);
        Ok(trainer)
    }

    pub fn model(&self) -> &Unet {
        &self.unet
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn beta1(&self) -> f64 {
        self.optimizer.params().beta1
    }

    /// Install the one-cycle schedule for a run of `total_steps` optimizer steps
    pub fn configure_optimizers(&mut self, total_steps: usize) -> Result<()> {
        let schedule = OneCycleLR::new(self.config.train.one_cycle(), total_steps)?;
        info!(
            "One-cycle schedule over {} steps: {:.2e} -> {:.2e} -> {:.2e}",
            total_steps,
            schedule.initial_lr(),
            self.config.train.lr,
            schedule.min_lr()
        );
        self.lr_scheduler = Box::new(schedule);
        self.global_step = 0;
        self.apply_schedule();
        Ok(())
    }

    fn apply_schedule(&mut self) {
        let mut params = self.optimizer.params().clone();
        params.lr = self.lr_scheduler.get_lr(self.global_step) as f64;
        if let Some(beta1) = self.lr_scheduler.get_beta1(self.global_step) {
            params.beta1 = beta1;
        }
        self.optimizer.set_params(params);
    }

    /// MSE between the predicted and the true noise
    pub fn step(&self, batch: &NoisyBatch, train: bool) -> Result<Tensor> {
        let noise_pred = self.unet.forward_t(&batch.x_t, &batch.t, train)?;
        Ok(candle_nn::loss::mse(&noise_pred, &batch.epsilon)?)
    }

    /// One optimizer step, returns the loss before the update
    pub fn training_step(&mut self, batch: &NoisyBatch) -> Result<f32> {
        let loss = self.step(batch, true)?;
        self.optimizer.backward_step(&loss)?;
        self.global_step += 1;
        self.apply_schedule();

        let loss = loss.to_scalar::<f32>()?;
        if !loss.is_finite() {
            warn!("non-finite train loss at step {}", self.global_step);
        }
        if self.config.train.log_every > 0 && self.global_step % self.config.train.log_every == 0 {
            info!(
                "step {} | train_loss {:.5} | lr {:.3e}",
                self.global_step,
                loss,
                self.optimizer.learning_rate()
            );
        }
        Ok(loss)
    }

    pub fn validation_step(&self, batch: &NoisyBatch) -> Result<f32> {
        Ok(self.step(batch, false)?.to_scalar::<f32>()?)
    }

    /// Mean loss over every frozen split of the data module
    pub fn validate(&self, dm: &DiffusionDataModule) -> Result<Option<f32>> {
        let (mut total, mut n) = (0f64, 0usize);
        for split in dm.test_splits() {
            for batch in dm.val_dataloader(split)? {
                let batch = batch?;
                let bs = batch.batch_size()?;
                total += self.validation_step(&batch)? as f64 * bs as f64;
                n += bs;
            }
        }
        Ok((n > 0).then(|| (total / n as f64) as f32))
    }

    /// Train for the configured number of epochs
    pub fn fit(&mut self, dm: &mut DiffusionDataModule) -> Result<FitSummary> {
        dm.setup()?;
        if dm.color_channels() != self.unet.color_channels() {
            return Err(DiffusionError::ChannelMismatch {
                expected: self.unet.color_channels(),
                got: dm.color_channels(),
            }
            .into());
        }
        let epochs = self.config.train.epochs;
        let steps_per_epoch = dm.train_batches()?;
        self.configure_optimizers(epochs * steps_per_epoch)?;
        let callback = self.config.sample.callback();

        info!("\n=== Starting Training ===");
        info!("Epochs: {}", epochs);
        info!("Steps per epoch: {}", steps_per_epoch);
        info!("Batch size: {}", dm.batch_size());
        info!("Run directory: {}", self.run_dir.display());

        let mut summary = FitSummary {
            run_dir: self.run_dir.clone(),
            ..Default::default()
        };
        for epoch in 0..epochs {
            let start = Instant::now();
            let (mut epoch_loss, mut n_batches) = (0f32, 0usize);
            for batch in dm.train_dataloader()? {
                let loss = self.training_step(&batch?)?;
                summary.train_losses.push(loss);
                epoch_loss += loss;
                n_batches += 1;
            }
            let train_loss = epoch_loss / n_batches.max(1) as f32;
            let val_loss = self.validate(dm)?;
            if let Some(val_loss) = val_loss {
                summary.val_losses.push(val_loss);
            }
            info!(
                "epoch {} | train_loss {:.5} | val_loss {} | {:.1}s",
                epoch,
                train_loss,
                val_loss.map(|l| format!("{:.5}", l)).unwrap_or_else(|| "-".to_string()),
                start.elapsed().as_secs_f32()
            );

            if let Some(callback) = &callback {
                match dm.img_size() {
                    Some(img_size) => {
                        callback.on_train_epoch_end(&self.unet, img_size, &self.device, &self.run_dir, epoch)?;
                    }
                    None => warn!("image size unknown, skipping epoch samples"),
                }
            }
            if self.config.train.save_every_epoch {
                self.save_checkpoint(&self.run_dir.join(format!("epoch-{}", epoch)), epoch, train_loss, val_loss)?;
            }
        }

        let last_train = summary.train_losses.last().copied().unwrap_or(f32::NAN);
        self.save_checkpoint(&self.run_dir, epochs, last_train, summary.val_losses.last().copied())?;
        summary.steps = self.global_step;
        info!("Training complete after {} steps", self.global_step);
        Ok(summary)
    }

    /// Generate `n_imgs` samples of `(height, width)`
    pub fn sample(&self, n_imgs: usize, img_size: (usize, usize), n_steps: usize) -> Result<Tensor> {
        let (h, w) = img_size;
        ddpm(&self.unet, (n_imgs, self.unet.color_channels(), h, w), n_steps, &self.device)
    }

    /// Write weights, config and training state into `dir`
    pub fn save_checkpoint(&self, dir: &Path, epoch: usize, train_loss: f32, val_loss: Option<f32>) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        info!("Saving checkpoint to: {}", dir.display());

        self.varmap
            .save(dir.join(WEIGHTS_FILE))
            .with_context(|| format!("Failed to save weights to {}", dir.display()))?;
        save_config(&self.config, &dir.join(CONFIG_FILE))?;

        let state = serde_json::json!({
            "step": self.global_step,
            "epoch": epoch,
            "learning_rate": self.optimizer.learning_rate(),
            "train_loss": train_loss,
            "val_loss": val_loss,
            "timestamp": chrono::Local::now().to_rfc3339(),
        });
        fs::write(dir.join(STATE_FILE), serde_json::to_string_pretty(&state)?)?;
        debug!("training state: {}", state);
        Ok(dir.to_path_buf())
    }
}
