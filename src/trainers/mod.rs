pub mod data_loader;
pub mod ddpm_scheduler;
pub mod lr_scheduler;
pub mod sampling;
pub mod sampling_utils;
pub mod unet_trainer;

// Re-export key types
pub use data_loader::{DataPreset, DatasetDict, DiffusionDataModule, ImageDataset, ImageRow};
pub use ddpm_scheduler::{alpha_bar, denoisify, noisify, NoisyBatch};
pub use lr_scheduler::{LRScheduler, OneCycleLR, OneCycleParams};
pub use sampling::{ddpm, DdpmCallback, NoisePredictor};
pub use unet_trainer::UnetTrainer;

use anyhow::{bail, Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::UnetConfig;

/// Top-level run configuration, loaded from YAML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: UnetConfig,
    pub train: TrainConfig,
    pub data: DataConfig,
    pub sample: SampleConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub lr: f32,
    pub one_cycle_pct_start: f32,
    pub one_cycle_div_factor: f32,
    pub one_cycle_final_div_factor: f32,
    pub adamw_epsilon: f64,
    pub weight_decay: f64,
    pub epochs: usize,
    /// "cpu", "cuda", "cuda:N" or "auto"
    pub device: String,
    pub checkpoint_dir: PathBuf,
    /// Sub-directory of `checkpoint_dir` grouping runs of one experiment
    pub version: String,
    pub log_every: usize,
    pub save_every_epoch: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            lr: 4e-3,
            one_cycle_pct_start: 0.3,
            one_cycle_div_factor: 25.0,
            one_cycle_final_div_factor: 1e4,
            adamw_epsilon: 1e-5,
            weight_decay: 0.01,
            epochs: 1,
            device: "auto".to_string(),
            checkpoint_dir: PathBuf::from("checkpoints"),
            version: "unet".to_string(),
            log_every: 50,
            save_every_epoch: true,
        }
    }
}

impl TrainConfig {
    pub fn one_cycle(&self) -> OneCycleParams {
        OneCycleParams {
            max_lr: self.lr,
            pct_start: self.one_cycle_pct_start,
            div_factor: self.one_cycle_div_factor,
            final_div_factor: self.one_cycle_final_div_factor,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Image folder, one sub-directory per split
    pub dataset_path: PathBuf,
    pub preset: DataPreset,
    pub batch_size: usize,
    /// 0 decodes on the calling thread, -1 uses all cores but one
    pub n_workers: i64,
    /// `[width, height]` to resize every image to
    pub img_size: Option<[u32; 2]>,
    /// Where prepared datasets are cached
    pub data_dir: PathBuf,
    /// Splits noised once and used for validation
    pub test_splits: Vec<String>,
    pub shuffle_seed: Option<u64>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dataset_path: PathBuf::from("datasets/fashion_mnist"),
            preset: DataPreset::Custom,
            batch_size: 128,
            n_workers: 0,
            img_size: None,
            data_dir: PathBuf::from("data"),
            test_splits: vec!["test".to_string()],
            shuffle_seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    /// Sample a grid at the end of every epoch
    pub enabled: bool,
    pub n_imgs: usize,
    pub n_steps: usize,
}

impl Default for SampleConfig {
    fn default() -> Self {
        let callback = DdpmCallback::default();
        Self {
            enabled: true,
            n_imgs: callback.n_imgs,
            n_steps: callback.n_steps,
        }
    }
}

impl SampleConfig {
    pub fn callback(&self) -> Option<DdpmCallback> {
        self.enabled.then_some(DdpmCallback {
            n_imgs: self.n_imgs,
            n_steps: self.n_steps,
        })
    }
}

/// Load configuration from YAML file
pub fn load_config(path: &Path) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = serde_yaml::from_str(&config_str).with_context(|| "Failed to parse YAML config")?;

    Ok(config)
}

pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    let yaml = serde_yaml::to_string(config)?;
    fs::write(path, yaml).with_context(|| format!("Failed to write config file: {}", path.display()))?;
    Ok(())
}

/// Parse a device string: `cpu`, `cuda`, `cuda:N` or `auto`
pub fn setup_device(device_str: &str) -> Result<Device> {
    let device = match device_str {
        "cpu" => Device::Cpu,
        "auto" => Device::cuda_if_available(0)?,
        "cuda" => Device::new_cuda(0)?,
        s => match s.strip_prefix("cuda:") {
            Some(id) => {
                let id: usize = id.parse().with_context(|| format!("Invalid CUDA device id: {}", s))?;
                Device::new_cuda(id)?
            }
            None => bail!("Unknown device '{}', expected cpu, cuda, cuda:N or auto", s),
        },
    };
    log::info!("Using device: {:?}", device);
    Ok(device)
}
