//! Data module for diffusion training
//!
//! Turns an image folder into noised training pairs:
//! - Sub-directories are dataset splits, a flat folder is a single `train` split
//! - Training batches are noised on the fly, so every epoch sees fresh noise
//! - Test splits are noised once ("frozen") and cached on disk for stable validation losses
//! - Optional parallel image decoding on a rayon pool

use anyhow::{ensure, Context, Result};
use candle_core::{DType, Device, Tensor};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::ddpm_scheduler::{noisify, NoisyBatch};
use super::DataConfig;
use crate::error::{is_power_of_two, DiffusionError};

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "webp"];
const SPLIT_TRAIN: &str = "train";
const MANIFEST: &str = "dataset.json";

/// Maps a clean batch `x_0` to `((x_t, t), epsilon)` training pairs
pub type NoisifyFn = Arc<dyn Fn(&Tensor) -> Result<NoisyBatch> + Send + Sync>;

/// Reshapes the raw dataset after loading and before freezing
pub type PostProcessFn = Arc<dyn Fn(DatasetDict) -> Result<DatasetDict> + Send + Sync>;

/// A single row: one image file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRow {
    pub image: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDataset {
    pub rows: Vec<ImageRow>,
}

impl ImageDataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The first `n` rows
    pub fn select(&self, n: usize) -> Self {
        Self {
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }

    /// Shuffle with `seed` and split off `ceil(len * test_size)` rows as `test`
    pub fn train_test_split(&self, test_size: f32, seed: u64) -> Result<DatasetDict> {
        ensure!(
            test_size > 0.0 && test_size < 1.0,
            "test_size must be in (0, 1), got {}",
            test_size
        );
        let mut rows = self.rows.clone();
        rows.shuffle(&mut StdRng::seed_from_u64(seed));
        let n_test = (rows.len() as f32 * test_size).ceil() as usize;
        let train = rows.split_off(n_test);
        let mut splits = BTreeMap::new();
        splits.insert(SPLIT_TRAIN.to_string(), Self { rows: train });
        splits.insert("test".to_string(), Self { rows });
        Ok(DatasetDict { splits })
    }
}

/// Named dataset splits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDict {
    pub splits: BTreeMap<String, ImageDataset>,
}

impl DatasetDict {
    pub fn get(&self, split: &str) -> Result<&ImageDataset> {
        self.splits
            .get(split)
            .ok_or_else(|| DiffusionError::MissingSplit(split.to_string()).into())
    }

    fn take(&mut self, split: &str) -> Result<ImageDataset> {
        self.splits
            .remove(split)
            .ok_or_else(|| DiffusionError::MissingSplit(split.to_string()).into())
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_string_lossy().to_lowercase().as_str()))
        .unwrap_or(false)
}

fn list_images(dir: &Path) -> Result<Vec<ImageRow>> {
    let mut images: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read dataset directory: {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_image(p))
        .collect();
    images.sort();
    Ok(images.into_iter().map(|image| ImageRow { image }).collect())
}

/// Load an image folder, one split per sub-directory or a single `train` split
pub fn load_image_folder(root: &Path) -> Result<DatasetDict> {
    let mut subdirs: Vec<PathBuf> = fs::read_dir(root)
        .with_context(|| format!("Failed to read dataset directory: {}", root.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    subdirs.sort();

    let mut splits = BTreeMap::new();
    for dir in &subdirs {
        let rows = list_images(dir)?;
        if rows.is_empty() {
            continue;
        }
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        splits.insert(name, ImageDataset { rows });
    }
    if splits.is_empty() {
        splits.insert(SPLIT_TRAIN.to_string(), ImageDataset { rows: list_images(root)? });
    }

    let total: usize = splits.values().map(|s| s.len()).sum();
    ensure!(total > 0, "No images found in dataset: {}", root.display());
    info!("Dataset loaded from {}:", root.display());
    for (name, split) in &splits {
        info!("  {}: {} images", name, split.len());
    }
    Ok(DatasetDict { splits })
}

/// A test split noised once and kept as tensors
#[derive(Debug, Clone)]
pub struct FrozenSplit {
    pub x_t: Tensor,
    pub t: Tensor,
    pub epsilon: Tensor,
}

impl FrozenSplit {
    pub fn len(&self) -> usize {
        self.t.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn save(&self, path: &Path) -> Result<()> {
        let tensors: HashMap<String, Tensor> = [
            ("x_t".to_string(), self.x_t.clone()),
            ("t".to_string(), self.t.clone()),
            ("epsilon".to_string(), self.epsilon.clone()),
        ]
        .into_iter()
        .collect();
        candle_core::safetensors::save(&tensors, path)
            .with_context(|| format!("Failed to write frozen split: {}", path.display()))?;
        Ok(())
    }

    fn load(path: &Path, device: &Device) -> Result<Self> {
        let mut tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("Failed to read frozen split: {}", path.display()))?;
        let mut take = |name: &str| {
            tensors
                .remove(name)
                .with_context(|| format!("{} missing from {}", name, path.display()))
        };
        Ok(Self {
            x_t: take("x_t")?,
            t: take("t")?,
            epsilon: take("epsilon")?,
        })
    }

    fn batch(&self, start: usize, len: usize) -> Result<NoisyBatch> {
        Ok(NoisyBatch {
            x_t: self.x_t.narrow(0, start, len)?,
            t: self.t.narrow(0, start, len)?,
            epsilon: self.epsilon.narrow(0, start, len)?,
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    splits: BTreeMap<String, ImageDataset>,
    frozen: Vec<String>,
}

#[derive(Debug)]
struct Prepared {
    splits: BTreeMap<String, ImageDataset>,
    frozen: BTreeMap<String, FrozenSplit>,
}

/// Dataset wrapper that pre-processes image data into diffusion training pairs
pub struct DiffusionDataModule {
    name: String,
    dataset_root: PathBuf,
    bs: usize,
    n_workers: i64,
    img_size: Option<(u32, u32)>,
    color_channels: usize,
    data_dir: PathBuf,
    test_splits: Vec<String>,
    /// Advanced by every `train_dataloader` call so each epoch gets a new order
    shuffle_rng: Mutex<StdRng>,
    device: Device,
    noisify_fn: NoisifyFn,
    post_process: Option<PostProcessFn>,
    pool: Option<rayon::ThreadPool>,
    prepared: Option<Prepared>,
}

impl std::fmt::Debug for DiffusionDataModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffusionDataModule")
            .field("name", &self.name)
            .field("dataset_root", &self.dataset_root)
            .field("bs", &self.bs)
            .field("n_workers", &self.n_workers)
            .field("img_size", &self.img_size)
            .field("post_process", &self.post_process.is_some())
            .finish()
    }
}

impl DiffusionDataModule {
    pub fn new(
        name: &str,
        config: &DataConfig,
        color_channels: usize,
        noisify_fn: NoisifyFn,
        device: Device,
    ) -> Result<Self> {
        ensure!(config.batch_size > 0, "batch size must be positive");
        ensure!(
            config.n_workers >= -1,
            "n_workers must be -1 (all cores but one), 0 (synchronous) or a thread count, got {}",
            config.n_workers
        );
        if !matches!(color_channels, 1 | 3) {
            return Err(DiffusionError::UnsupportedChannels(color_channels).into());
        }
        let mut module = Self {
            name: name.to_string(),
            dataset_root: config.dataset_path.clone(),
            bs: config.batch_size,
            n_workers: config.n_workers,
            img_size: config.img_size.map(|[w, h]| (w, h)),
            color_channels,
            data_dir: config.data_dir.clone(),
            test_splits: config.test_splits.clone(),
            shuffle_rng: Mutex::new(match config.shuffle_seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            }),
            device,
            noisify_fn,
            post_process: None,
            pool: None,
            prepared: None,
        };
        let n_workers = module.n_workers();
        if n_workers > 0 {
            module.pool = Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n_workers)
                    .build()
                    .context("Failed to build data loading thread pool")?,
            );
            debug!("decoding images on {} worker threads", n_workers);
        }
        Ok(module)
    }

    /// Build the module selected by `config.preset`
    pub fn from_config(config: &DataConfig, color_channels: usize, device: Device) -> Result<Self> {
        match config.preset {
            DataPreset::Custom => Self::new("DiffusionDataModule", config, color_channels, default_noisify_fn(), device),
            DataPreset::FashionMnist => Self::fashion_mnist(config, device),
            DataPreset::TinyFashionMnist => Self::tiny_fashion_mnist(config, device),
        }
    }

    /// Grayscale images resized to 32x32 and noised with [`noisify`]
    pub fn fashion_mnist(config: &DataConfig, device: Device) -> Result<Self> {
        let config = DataConfig {
            img_size: Some(config.img_size.unwrap_or([32, 32])),
            ..config.clone()
        };
        Self::new("FashionMNISTDataModule", &config, 1, default_noisify_fn(), device)
    }

    /// FashionMNIST cut down to 100 training images, split evenly into train and test
    pub fn tiny_fashion_mnist(config: &DataConfig, device: Device) -> Result<Self> {
        let module = Self::fashion_mnist(config, device)?;
        Ok(Self {
            name: "TinyFashionMNISTDataModule".to_string(),
            ..module
        }
        .with_post_process(Arc::new(|ds: DatasetDict| ds.get(SPLIT_TRAIN)?.select(100).train_test_split(0.5, 42))))
    }

    pub fn with_post_process(mut self, post_process: PostProcessFn) -> Self {
        self.post_process = Some(post_process);
        self
    }

    /// Worker threads used for decoding, 0 means the caller's thread
    pub fn n_workers(&self) -> usize {
        if self.n_workers == -1 {
            num_cpus::get().saturating_sub(1)
        } else {
            self.n_workers as usize
        }
    }

    pub fn batch_size(&self) -> usize {
        self.bs
    }

    pub fn color_channels(&self) -> usize {
        self.color_channels
    }

    /// `(height, width)` of the prepared samples, known once `setup` ran or a resize is configured
    pub fn img_size(&self) -> Option<(usize, usize)> {
        if let Some((w, h)) = self.img_size {
            return Some((h as usize, w as usize));
        }
        let prepared = self.prepared.as_ref()?;
        if let Some((_, frozen)) = prepared.frozen.iter().next() {
            let (_, _, h, w) = frozen.x_t.dims4().ok()?;
            return Some((h, w));
        }
        let row = prepared.splits.get(SPLIT_TRAIN)?.rows.first()?;
        let (w, h) = image::image_dimensions(&row.image).ok()?;
        Some((h as usize, w as usize))
    }

    fn dataset_id(&self) -> String {
        self.dataset_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "dataset".to_string())
    }

    pub fn cached_dir(&self) -> PathBuf {
        self.data_dir.join(format!("{}_{}", self.name, self.dataset_id()))
    }

    /// Remove the cached dataset so the next `setup` rebuilds it
    pub fn clean(&mut self) -> Result<()> {
        let dir = self.cached_dir();
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove cached dataset: {}", dir.display()))?;
            info!("Removed cached dataset: {}", dir.display());
        }
        self.prepared = None;
        Ok(())
    }

    /// Decode one image to a `[C, H, W]` tensor in [-1, 1]
    pub fn to_tensor(&self, path: &Path) -> Result<Tensor> {
        let img = image::open(path).with_context(|| format!("Failed to open image: {}", path.display()))?;
        let img = match self.img_size {
            Some((w, h)) => img.resize_exact(w, h, image::imageops::FilterType::Lanczos3),
            None => img,
        };
        let (w, h) = (img.width() as usize, img.height() as usize);
        if !is_power_of_two(h) {
            return Err(DiffusionError::NotPowerOfTwo { dim: "height", size: h }.into());
        }
        if !is_power_of_two(w) {
            return Err(DiffusionError::NotPowerOfTwo { dim: "width", size: w }.into());
        }
        let data = match self.color_channels {
            1 => img.to_luma8().into_raw(),
            3 => img.to_rgb8().into_raw(),
            c => return Err(DiffusionError::UnsupportedChannels(c).into()),
        };
        let x = Tensor::from_vec(data, (h, w, self.color_channels), &Device::Cpu)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?;
        Ok(((x / 127.5)? - 1.0)?)
    }

    fn decode_rows(&self, rows: &[ImageRow]) -> Result<Vec<Tensor>> {
        match &self.pool {
            Some(pool) => pool.install(|| rows.par_iter().map(|r| self.to_tensor(&r.image)).collect()),
            None => rows.iter().map(|r| self.to_tensor(&r.image)).collect(),
        }
    }

    /// Stack rows into a clean batch on the module's device
    pub fn load_batch(&self, rows: &[ImageRow]) -> Result<Tensor> {
        let images = self.decode_rows(rows)?;
        Ok(Tensor::stack(&images, 0)?.to_device(&self.device)?)
    }

    /// Decode and noise a batch of rows
    pub fn collate(&self, rows: &[ImageRow]) -> Result<NoisyBatch> {
        let x_0 = self.load_batch(rows)?;
        (self.noisify_fn)(&x_0)
    }

    /// Noise a whole split once, batch by batch
    pub fn freeze(&self, split: &ImageDataset) -> Result<FrozenSplit> {
        ensure!(!split.is_empty(), "cannot freeze an empty split");
        let (mut xs, mut ts, mut eps) = (Vec::new(), Vec::new(), Vec::new());
        for chunk in split.rows.chunks(self.bs) {
            let ((x_t, t), epsilon) = self.collate(chunk)?.into_parts();
            xs.push(x_t.to_device(&Device::Cpu)?);
            ts.push(t.to_device(&Device::Cpu)?);
            eps.push(epsilon.to_device(&Device::Cpu)?);
        }
        Ok(FrozenSplit {
            x_t: Tensor::cat(&xs, 0)?,
            t: Tensor::cat(&ts, 0)?,
            epsilon: Tensor::cat(&eps, 0)?,
        })
    }

    fn build_cache(&self, dir: &Path) -> Result<()> {
        let mut ds = load_image_folder(&self.dataset_root)?;
        if let Some(post_process) = &self.post_process {
            ds = post_process(ds)?;
        }

        let staging = dir.with_extension("partial");
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let mut manifest = Manifest::default();
        for split in &self.test_splits {
            let rows = ds.take(split)?;
            info!("Freezing split '{}' ({} images)", split, rows.len());
            self.freeze(&rows)?.save(&staging.join(format!("{}.safetensors", split)))?;
            manifest.frozen.push(split.clone());
        }
        manifest.splits = ds.splits;
        fs::write(staging.join(MANIFEST), serde_json::to_string_pretty(&manifest)?)?;

        fs::rename(&staging, dir)
            .with_context(|| format!("Failed to move dataset cache into place: {}", dir.display()))?;
        Ok(())
    }

    /// Build the cached dataset on first use, then load it from disk
    pub fn setup(&mut self) -> Result<()> {
        let dir = self.cached_dir();
        if !dir.exists() {
            if let Some(parent) = dir.parent() {
                fs::create_dir_all(parent)?;
            }
            info!("Preparing dataset cache: {}", dir.display());
            self.build_cache(&dir)?;
        } else {
            info!("Using cached dataset: {}", dir.display());
        }

        let manifest: Manifest = serde_json::from_str(
            &fs::read_to_string(dir.join(MANIFEST))
                .with_context(|| format!("Failed to read dataset manifest in {}", dir.display()))?,
        )?;
        let mut frozen = BTreeMap::new();
        for split in &manifest.frozen {
            let path = dir.join(format!("{}.safetensors", split));
            frozen.insert(split.clone(), FrozenSplit::load(&path, &self.device)?);
        }
        self.prepared = Some(Prepared {
            splits: manifest.splits,
            frozen,
        });
        Ok(())
    }

    fn prepared(&self) -> Result<&Prepared> {
        self.prepared
            .as_ref()
            .context("data module used before setup()")
    }

    /// Shuffled batches of the `train` split, noised when they are drawn
    pub fn train_dataloader(&self) -> Result<TrainLoader<'_>> {
        let split = self
            .prepared()?
            .splits
            .get(SPLIT_TRAIN)
            .ok_or_else(|| DiffusionError::MissingSplit(SPLIT_TRAIN.to_string()))?;
        let mut order: Vec<usize> = (0..split.len()).collect();
        {
            let mut rng = self
                .shuffle_rng
                .lock()
                .map_err(|e| anyhow::anyhow!("shuffle rng lock poisoned: {e}"))?;
            order.shuffle(&mut *rng);
        }
        Ok(TrainLoader {
            module: self,
            split,
            order,
            pos: 0,
        })
    }

    /// Batches of a frozen split, in order
    pub fn val_dataloader(&self, split: &str) -> Result<ValLoader<'_>> {
        let frozen = self
            .prepared()?
            .frozen
            .get(split)
            .ok_or_else(|| DiffusionError::MissingSplit(split.to_string()))?;
        Ok(ValLoader {
            frozen,
            bs: self.bs,
            pos: 0,
        })
    }

    /// Number of training batches per epoch
    pub fn train_batches(&self) -> Result<usize> {
        let n = self
            .prepared()?
            .splits
            .get(SPLIT_TRAIN)
            .map(|s| s.len())
            .unwrap_or(0);
        if n == 0 {
            warn!("train split is empty");
        }
        Ok(n.div_ceil(self.bs))
    }

    pub fn test_splits(&self) -> &[String] {
        &self.test_splits
    }
}

/// The default noise function: uniform timesteps and gaussian noise
pub fn default_noisify_fn() -> NoisifyFn {
    Arc::new(|x_0: &Tensor| noisify(x_0, None))
}

/// Which data module to build from the config
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DataPreset {
    #[default]
    Custom,
    FashionMnist,
    TinyFashionMnist,
}

pub struct TrainLoader<'a> {
    module: &'a DiffusionDataModule,
    split: &'a ImageDataset,
    order: Vec<usize>,
    pos: usize,
}

impl TrainLoader<'_> {
    pub fn len(&self) -> usize {
        self.order.len().div_ceil(self.module.bs)
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Iterator for TrainLoader<'_> {
    type Item = Result<NoisyBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.order.len() {
            return None;
        }
        let end = (self.pos + self.module.bs).min(self.order.len());
        let rows: Vec<ImageRow> = self.order[self.pos..end]
            .iter()
            .map(|&i| self.split.rows[i].clone())
            .collect();
        self.pos = end;
        Some(self.module.collate(&rows))
    }
}

pub struct ValLoader<'a> {
    frozen: &'a FrozenSplit,
    bs: usize,
    pos: usize,
}

impl Iterator for ValLoader<'_> {
    type Item = Result<NoisyBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let n = self.frozen.len();
        if self.pos >= n {
            return None;
        }
        let len = self.bs.min(n - self.pos);
        let batch = self.frozen.batch(self.pos, len);
        self.pos += len;
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn write_images(dir: &Path, n: usize, size: u32) -> Result<()> {
        fs::create_dir_all(dir)?;
        for i in 0..n {
            let img = GrayImage::from_fn(size, size, |x, y| Luma([((x + y + i as u32) % 256) as u8]));
            img.save(dir.join(format!("img_{:03}.png", i)))?;
        }
        Ok(())
    }

    fn config(root: &Path, data_dir: &Path) -> DataConfig {
        DataConfig {
            dataset_path: root.to_path_buf(),
            batch_size: 4,
            n_workers: 0,
            img_size: None,
            data_dir: data_dir.to_path_buf(),
            test_splits: vec!["test".to_string()],
            shuffle_seed: Some(1),
            preset: DataPreset::Custom,
        }
    }

    #[test]
    fn test_load_image_folder_splits() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_images(&dir.path().join("train"), 3, 8)?;
        write_images(&dir.path().join("test"), 2, 8)?;
        let ds = load_image_folder(dir.path())?;
        assert_eq!(ds.get("train")?.len(), 3);
        assert_eq!(ds.get("test")?.len(), 2);

        let flat = tempfile::tempdir()?;
        write_images(flat.path(), 5, 8)?;
        let ds = load_image_folder(flat.path())?;
        assert_eq!(ds.splits.keys().collect::<Vec<_>>(), vec!["train"]);
        Ok(())
    }

    #[test]
    fn test_train_test_split_sizes() -> Result<()> {
        let ds = ImageDataset {
            rows: (0..101).map(|i| ImageRow { image: PathBuf::from(format!("{i}.png")) }).collect(),
        };
        let dict = ds.select(100).train_test_split(0.5, 42)?;
        assert_eq!(dict.get("train")?.len(), 50);
        assert_eq!(dict.get("test")?.len(), 50);
        assert_eq!(dict, ds.select(100).train_test_split(0.5, 42)?);
        Ok(())
    }

    #[test]
    fn test_to_tensor_range_and_power_of_two() -> Result<()> {
        let data = tempfile::tempdir()?;
        let imgs = tempfile::tempdir()?;
        write_images(imgs.path(), 1, 8)?;
        let module = DiffusionDataModule::new("t", &config(imgs.path(), data.path()), 1, default_noisify_fn(), Device::Cpu)?;
        let x = module.to_tensor(&imgs.path().join("img_000.png"))?;
        assert_eq!(x.dims(), &[1, 8, 8]);
        let min = x.flatten_all()?.min(0)?.to_scalar::<f32>()?;
        let max = x.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(min >= -1.0 && max <= 1.0);

        let odd = tempfile::tempdir()?;
        write_images(odd.path(), 1, 12)?;
        let err = module.to_tensor(&odd.path().join("img_000.png")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DiffusionError>(),
            Some(DiffusionError::NotPowerOfTwo { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_resize_makes_odd_images_usable() -> Result<()> {
        let data = tempfile::tempdir()?;
        let imgs = tempfile::tempdir()?;
        write_images(imgs.path(), 1, 28)?;
        let cfg = DataConfig {
            img_size: Some([32, 16]),
            ..config(imgs.path(), data.path())
        };
        let module = DiffusionDataModule::new("t", &cfg, 3, default_noisify_fn(), Device::Cpu)?;
        let x = module.to_tensor(&imgs.path().join("img_000.png"))?;
        assert_eq!(x.dims(), &[3, 16, 32]);
        assert_eq!(module.img_size(), Some((16, 32)));
        Ok(())
    }

    #[test]
    fn test_setup_freezes_test_split_and_caches() -> Result<()> {
        let data = tempfile::tempdir()?;
        let imgs = tempfile::tempdir()?;
        write_images(&imgs.path().join("train"), 10, 8)?;
        write_images(&imgs.path().join("test"), 6, 8)?;
        let cfg = config(imgs.path(), data.path());

        let mut module = DiffusionDataModule::new("t", &cfg, 1, default_noisify_fn(), Device::Cpu)?;
        module.setup()?;
        assert!(module.cached_dir().join("test.safetensors").exists());
        assert_eq!(module.train_batches()?, 3);

        let train: Vec<NoisyBatch> = module.train_dataloader()?.collect::<Result<_>>()?;
        assert_eq!(train.iter().map(|b| b.x_t.dim(0).unwrap()).collect::<Vec<_>>(), vec![4, 4, 2]);

        let first: Vec<NoisyBatch> = module.val_dataloader("test")?.collect::<Result<_>>()?;
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].x_t.dims(), &[4, 1, 8, 8]);

        // a second module reuses the frozen noise instead of drawing new noise
        let mut again = DiffusionDataModule::new("t", &cfg, 1, default_noisify_fn(), Device::Cpu)?;
        again.setup()?;
        let second: Vec<NoisyBatch> = again.val_dataloader("test")?.collect::<Result<_>>()?;
        let diff = (&first[0].epsilon - &second[0].epsilon)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);

        again.clean()?;
        assert!(!again.cached_dir().exists());
        Ok(())
    }

    #[test]
    fn test_post_process_runs_before_freezing() -> Result<()> {
        let data = tempfile::tempdir()?;
        let imgs = tempfile::tempdir()?;
        write_images(imgs.path(), 8, 8)?;
        let cfg = config(imgs.path(), data.path());
        let mut module = DiffusionDataModule::new("t", &cfg, 1, default_noisify_fn(), Device::Cpu)?
            .with_post_process(Arc::new(|ds: DatasetDict| ds.get("train")?.train_test_split(0.25, 0)));
        module.setup()?;
        assert_eq!(module.train_batches()?, 2);
        assert_eq!(module.val_dataloader("test")?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_missing_test_split_is_an_error() -> Result<()> {
        let data = tempfile::tempdir()?;
        let imgs = tempfile::tempdir()?;
        write_images(imgs.path(), 4, 8)?;
        let mut module =
            DiffusionDataModule::new("t", &config(imgs.path(), data.path()), 1, default_noisify_fn(), Device::Cpu)?;
        let err = module.setup().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DiffusionError>(),
            Some(DiffusionError::MissingSplit(_))
        ));
        assert!(!module.cached_dir().exists());
        Ok(())
    }

    #[test]
    fn test_parallel_decoding_matches_sequential() -> Result<()> {
        let data = tempfile::tempdir()?;
        let imgs = tempfile::tempdir()?;
        write_images(imgs.path(), 6, 8)?;
        let rows = load_image_folder(imgs.path())?.get("train")?.rows.clone();

        let seq = DiffusionDataModule::new("t", &config(imgs.path(), data.path()), 1, default_noisify_fn(), Device::Cpu)?;
        let cfg = DataConfig {
            n_workers: 2,
            ..config(imgs.path(), data.path())
        };
        let par = DiffusionDataModule::new("t", &cfg, 1, default_noisify_fn(), Device::Cpu)?;
        assert_eq!(par.n_workers(), 2);
        let a = seq.load_batch(&rows)?;
        let b = par.load_batch(&rows)?;
        let diff = (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    fn with_train_rows(mut module: DiffusionDataModule, n: usize) -> DiffusionDataModule {
        let rows = (0..n).map(|i| ImageRow { image: PathBuf::from(format!("{i}.png")) }).collect();
        let mut splits = BTreeMap::new();
        splits.insert(SPLIT_TRAIN.to_string(), ImageDataset { rows });
        module.prepared = Some(Prepared {
            splits,
            frozen: BTreeMap::new(),
        });
        module
    }

    #[test]
    fn test_seeded_shuffle_changes_every_epoch() -> Result<()> {
        let data = tempfile::tempdir()?;
        let cfg = DataConfig {
            shuffle_seed: Some(3),
            ..config(data.path(), data.path())
        };
        let orders = |module: &DiffusionDataModule| -> Result<Vec<Vec<usize>>> {
            (0..3).map(|_| Ok(module.train_dataloader()?.order)).collect()
        };

        let first = with_train_rows(DiffusionDataModule::new("t", &cfg, 1, default_noisify_fn(), Device::Cpu)?, 32);
        let run_a = orders(&first)?;
        assert_ne!(run_a[0], run_a[1]);
        assert_ne!(run_a[1], run_a[2]);
        for order in &run_a {
            let mut sorted = order.clone();
            sorted.sort();
            assert_eq!(sorted, (0..32).collect::<Vec<_>>());
        }

        // same seed, same sequence of epochs
        let second = with_train_rows(DiffusionDataModule::new("t", &cfg, 1, default_noisify_fn(), Device::Cpu)?, 32);
        assert_eq!(orders(&second)?, run_a);
        Ok(())
    }

    #[test]
    fn test_worker_sentinel() -> Result<()> {
        let data = tempfile::tempdir()?;
        let cfg = DataConfig {
            n_workers: -1,
            ..config(data.path(), data.path())
        };
        let module = DiffusionDataModule::new("t", &cfg, 1, default_noisify_fn(), Device::Cpu)?;
        assert_eq!(module.n_workers(), num_cpus::get() - 1);

        let bad = DataConfig {
            n_workers: -3,
            ..config(data.path(), data.path())
        };
        assert!(DiffusionDataModule::new("t", &bad, 1, default_noisify_fn(), Device::Cpu).is_err());
        Ok(())
    }
}
