use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use pixel_ddpm::models::{Activation, ResBlockKind};
use pixel_ddpm::trainers::sampling_utils::{save_image_grid, save_tensor_as_image};
use pixel_ddpm::trainers::{load_config, setup_device, Config, DataPreset, DiffusionDataModule, UnetTrainer};

#[derive(Parser, Debug)]
#[command(name = "trainer", about = "Train and sample a pixel-space DDPM U-Net")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a U-Net on an image folder
    Fit {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Compute the loss of a checkpoint on the frozen test split
    Validate {
        /// Checkpoint directory holding unet.safetensors and config.yaml
        #[arg(long)]
        checkpoint: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Generate a grid of images from a checkpoint
    Sample {
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(long, default_value_t = 16)]
        n_imgs: usize,
        #[arg(long, default_value_t = 100)]
        n_steps: usize,
        /// Image height
        #[arg(long)]
        height: usize,
        /// Image width
        #[arg(long)]
        width: usize,
        #[arg(long, default_value = "samples.png")]
        output: PathBuf,
        /// Also write every sample as its own image next to the grid
        #[arg(long)]
        separate: bool,
        #[arg(long)]
        device: Option<String>,
    },
}

/// Flags that take precedence over the YAML config
#[derive(Args, Debug, Default)]
struct Overrides {
    /// YAML config file
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    lr: Option<f32>,
    #[arg(long)]
    one_cycle_pct_start: Option<f32>,
    #[arg(long)]
    one_cycle_div_factor: Option<f32>,
    #[arg(long)]
    one_cycle_final_div_factor: Option<f32>,
    #[arg(long)]
    adamw_epsilon: Option<f64>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    n_workers: Option<i64>,
    #[arg(long)]
    device: Option<String>,
    #[arg(long)]
    dataset: Option<PathBuf>,
    #[arg(long, value_enum)]
    preset: Option<DataPreset>,
    #[arg(long, value_enum)]
    act: Option<Activation>,
    #[arg(long, value_enum)]
    res_block: Option<ResBlockKind>,
    #[arg(long)]
    kaiming: bool,
    #[arg(long)]
    version: Option<String>,
}

impl Overrides {
    fn resolve(&self, base: Option<Config>) -> Result<Config> {
        let mut config = match (&self.config, base) {
            (Some(path), _) => load_config(path)?,
            (None, Some(base)) => base,
            (None, None) => Config::default(),
        };
        let train = &mut config.train;
        if let Some(lr) = self.lr {
            train.lr = lr;
        }
        if let Some(pct) = self.one_cycle_pct_start {
            train.one_cycle_pct_start = pct;
        }
        if let Some(div) = self.one_cycle_div_factor {
            train.one_cycle_div_factor = div;
        }
        if let Some(div) = self.one_cycle_final_div_factor {
            train.one_cycle_final_div_factor = div;
        }
        if let Some(eps) = self.adamw_epsilon {
            train.adamw_epsilon = eps;
        }
        if let Some(epochs) = self.epochs {
            train.epochs = epochs;
        }
        if let Some(device) = &self.device {
            train.device = device.clone();
        }
        if let Some(version) = &self.version {
            train.version = version.clone();
        }
        if let Some(bs) = self.batch_size {
            config.data.batch_size = bs;
        }
        if let Some(n) = self.n_workers {
            config.data.n_workers = n;
        }
        if let Some(dataset) = &self.dataset {
            config.data.dataset_path = dataset.clone();
        }
        if let Some(preset) = self.preset {
            config.data.preset = preset;
            if preset != DataPreset::Custom {
                config.model.color_channels = 1;
            }
        }
        if let Some(act) = self.act {
            config.model.act = act;
        }
        if let Some(kind) = self.res_block {
            config.model.res_block = kind;
        }
        if self.kaiming {
            config.model.kaiming = true;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    // Initialize logging
    pixel_ddpm::logging::init_logger();

    let cli = Cli::parse();
    match cli.command {
        Command::Fit { overrides } => {
            let config = overrides.resolve(None)?;
            let device = setup_device(&config.train.device)?;
            let mut dm = DiffusionDataModule::from_config(&config.data, config.model.color_channels, device.clone())?;
            let mut trainer = UnetTrainer::with_device(config, device)?;
            let summary = trainer.fit(&mut dm)?;
            info!(
                "Finished {} steps, checkpoint at {}",
                summary.steps,
                summary.run_dir.display()
            );
        }
        Command::Validate { checkpoint, overrides } => {
            let saved = load_config(&checkpoint.join("config.yaml"))?;
            let config = overrides.resolve(Some(saved))?;
            let device = setup_device(&config.train.device)?;
            let trainer = UnetTrainer::from_checkpoint(&checkpoint, device.clone())?;
            let mut dm = DiffusionDataModule::from_config(&config.data, trainer.model().color_channels(), device)?;
            dm.setup()?;
            match trainer.validate(&dm)? {
                Some(loss) => info!("val_loss {:.5}", loss),
                None => bail!("no frozen test split to validate on"),
            }
        }
        Command::Sample {
            checkpoint,
            n_imgs,
            n_steps,
            height,
            width,
            output,
            separate,
            device,
        } => {
            let device = setup_device(device.as_deref().unwrap_or("auto"))?;
            let trainer = UnetTrainer::from_checkpoint(&checkpoint, device)?;
            info!("Sampling {} images with {} steps", n_imgs, n_steps);
            let images = trainer.sample(n_imgs, (height, width), n_steps)?;
            save_image_grid(&images, &output)?;
            if separate {
                let stem = output.file_stem().and_then(|s| s.to_str()).unwrap_or("sample");
                for i in 0..n_imgs {
                    save_tensor_as_image(&images.get(i)?, &output.with_file_name(format!("{}_{:03}.png", stem, i)))?;
                }
            }
            info!("Samples saved to: {}", output.display());
        }
    }
    Ok(())
}
