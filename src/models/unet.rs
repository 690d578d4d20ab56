//! Diffusion U-Net with a continuous diffusion time input
//!
//! The encoder hands its per-stage activations back to the caller and the
//! decoder takes them as an explicit argument, so the skip connections carry
//! no hidden state between the two halves.

use candle_core::{Result, Tensor};
use candle_nn::{self as nn, Conv2d, Conv2dConfig, Module, VarBuilder, VarMap};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::blocks::{Activation, ConvBlock, ResBlock, ResBlockKind};
use super::embeddings::TimeEmbeddingMLP;
use crate::error::{is_power_of_two, DiffusionError};

/// Model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnetConfig {
    /// Number of channels of each {Down,Up}block
    pub nfs: Vec<usize>,
    /// Number of residual layers per {Down,Up}block, one more entry than `nfs`
    pub n_blocks: Vec<usize>,
    /// Color channels of the data
    pub color_channels: usize,
    pub act: Activation,
    pub res_block: ResBlockKind,
    /// Re-initialize conv weights with kaiming-normal after construction
    pub kaiming: bool,
}

impl Default for UnetConfig {
    fn default() -> Self {
        tiny_unet_config()
    }
}

/// The small grayscale model used for FashionMNIST-sized data
pub fn tiny_unet_config() -> UnetConfig {
    UnetConfig {
        nfs: vec![32, 64, 128, 256, 384],
        n_blocks: vec![3, 2, 1, 1, 1, 1],
        color_channels: 1,
        act: Activation::Relu,
        res_block: ResBlockKind::Preact,
        kaiming: false,
    }
}

/// Residual layers sharing one resolution, followed by a stride 2 conv
#[derive(Debug)]
pub struct Downblock {
    convs: Vec<ResBlock>,
    downsampler: Conv2d,
    downsample: bool,
    c_in: usize,
    c_out: usize,
}

impl Downblock {
    pub fn new(
        c_time: usize,
        c_in: usize,
        c_out: usize,
        n_layers: usize,
        cfg: &UnetConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let vb_convs = vb.pp("convs");
        let mut convs = Vec::with_capacity(n_layers);
        convs.push(ResBlock::new(c_time, c_in, c_out, cfg.act, cfg.res_block, vb_convs.pp(0))?);
        for i in 1..n_layers {
            convs.push(ResBlock::new(c_time, c_out, c_out, cfg.act, cfg.res_block, vb_convs.pp(i))?);
        }
        let downsampler = nn::conv2d(
            c_out,
            c_out,
            3,
            Conv2dConfig {
                padding: 1,
                stride: 2,
                ..Default::default()
            },
            vb.pp("downsampler"),
        )?;
        Ok(Self {
            convs,
            downsampler,
            downsample: true,
            c_in,
            c_out,
        })
    }

    /// Returns the block output and the activations of every residual layer
    pub fn forward_t(&self, xs: &Tensor, t_emb: &Tensor, train: bool) -> Result<(Tensor, Vec<Tensor>)> {
        let mut xs = xs.clone();
        let mut activations = Vec::with_capacity(self.convs.len());
        for conv in &self.convs {
            xs = conv.forward_t(&xs, t_emb, train)?;
            activations.push(xs.clone());
        }
        if self.downsample {
            xs = self.downsampler.forward(&xs)?;
        }
        Ok((xs, activations))
    }

    pub fn n_layers(&self) -> usize {
        self.convs.len()
    }
}

/// Mirror of a [`Downblock`] that consumes its activations
#[derive(Debug)]
pub struct Upblock {
    upsampler: Conv2d,
    convs: Vec<ResBlock>,
    upsample: bool,
}

impl Upblock {
    pub fn new(
        c_time: usize,
        c_in: usize,
        c_out: usize,
        n_layers: usize,
        upsample: bool,
        cfg: &UnetConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let upsampler = nn::conv2d(
            c_in,
            c_in,
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("upsampler"),
        )?;
        let vb_convs = vb.pp("convs");
        let mut convs = Vec::with_capacity(n_layers);
        for i in 0..n_layers.saturating_sub(1) {
            convs.push(ResBlock::new(c_time, c_in * 2, c_in, cfg.act, cfg.res_block, vb_convs.pp(i))?);
        }
        convs.push(ResBlock::new(
            c_time,
            c_in * 2,
            c_out,
            cfg.act,
            cfg.res_block,
            vb_convs.pp(n_layers.saturating_sub(1)),
        )?);
        Ok(Self {
            upsampler,
            convs,
            upsample,
        })
    }

    pub fn from_downblock(c_time: usize, down: &Downblock, cfg: &UnetConfig, vb: VarBuilder) -> Result<Self> {
        Self::new(c_time, down.c_out, down.c_in, down.n_layers(), down.downsample, cfg, vb)
    }

    /// `skips` are the activations of the paired downblock, in down-path order
    pub fn forward_t(&self, xs: &Tensor, skips: &[Tensor], t_emb: &Tensor, train: bool) -> Result<Tensor> {
        if skips.len() != self.convs.len() {
            candle_core::bail!(
                "upblock expects {} skip activations, got {}",
                self.convs.len(),
                skips.len()
            )
        }
        let mut xs = if self.upsample {
            let (_, _, h, w) = xs.dims4()?;
            self.upsampler.forward(&xs.upsample_nearest2d(h * 2, w * 2)?)?
        } else {
            xs.clone()
        };
        for (up, skip) in self.convs.iter().zip(skips.iter().rev()) {
            xs = up.forward_t(&Tensor::cat(&[&xs, skip], 1)?, t_emb, train)?;
        }
        Ok(xs)
    }

    /// Channel widths expected by each residual layer, in execution order
    pub fn input_widths(&self) -> Vec<usize> {
        self.convs.iter().map(|c| c.c_in()).collect()
    }
}

/// Activations produced by the encoder, one entry per downblock
pub type Skips = Vec<Vec<Tensor>>;

/// Diffusion U-Net with a diffusion time dimension
#[derive(Debug)]
pub struct Unet {
    time_embedding: TimeEmbeddingMLP,
    start: Conv2d,
    downblocks: Vec<Downblock>,
    middle: ResBlock,
    upblocks: Vec<Upblock>,
    end: ConvBlock,
    color_channels: usize,
}

impl Unet {
    pub fn new(cfg: &UnetConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.nfs.is_empty() || cfg.n_blocks.len() != cfg.nfs.len() + 1 {
            return Err(candle_core::Error::wrap(DiffusionError::StageMismatch {
                nfs: cfg.nfs.len(),
                n_blocks: cfg.n_blocks.len(),
            }));
        }
        let nf0 = cfg.nfs[0];
        let time_embedding = TimeEmbeddingMLP::new(nf0, 4 * nf0, cfg.act, vb.pp("time_embedding"))?;
        let c_time = time_embedding.c_out();

        // Pre-activation blocks would discard pixel information, so the stem is a plain conv
        let start = nn::conv2d(
            cfg.color_channels,
            nf0,
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("start"),
        )?;

        let n_stages = cfg.nfs.len() - 1;
        let mut downblocks = Vec::with_capacity(n_stages);
        let mut upblocks = Vec::with_capacity(n_stages);
        for (i, ((&c_in, &c_out), &n_layers)) in cfg
            .nfs
            .iter()
            .zip(cfg.nfs.iter().skip(1))
            .zip(cfg.n_blocks.iter())
            .enumerate()
        {
            let db = Downblock::new(c_time, c_in, c_out, n_layers, cfg, vb.pp("downblocks").pp(i))?;
            upblocks.insert(0, Upblock::from_downblock(c_time, &db, cfg, vb.pp("upblocks").pp(i))?);
            downblocks.push(db);
        }
        let nf_last = cfg.nfs[cfg.nfs.len() - 1];
        let middle = ResBlock::new(c_time, nf_last, nf_last, cfg.act, cfg.res_block, vb.pp("middle"))?;
        let end = ConvBlock::new(nf0, cfg.color_channels, 3, 1, cfg.act, ResBlockKind::Preact, vb.pp("end"))?;

        Ok(Self {
            time_embedding,
            start,
            downblocks,
            middle,
            upblocks,
            end,
            color_channels: cfg.color_channels,
        })
    }

    /// Build the model and, when configured, apply the kaiming init pass
    pub fn from_varmap(cfg: &UnetConfig, varmap: &VarMap, vb: VarBuilder) -> Result<Self> {
        let model = Self::new(cfg, vb)?;
        if cfg.kaiming {
            let n = model.apply_kaiming(varmap)?;
            debug!("kaiming init applied to {} conv weights", n);
        }
        Ok(model)
    }

    pub fn color_channels(&self) -> usize {
        self.color_channels
    }

    pub fn n_stages(&self) -> usize {
        self.downblocks.len()
    }

    pub fn time_embedding(&self, t: &Tensor, train: bool) -> Result<Tensor> {
        self.time_embedding.forward_t(t, train)
    }

    fn check_input(&self, x_t: &Tensor) -> Result<()> {
        let (_, c, h, w) = x_t.dims4()?;
        if c != self.color_channels {
            return Err(candle_core::Error::wrap(DiffusionError::ChannelMismatch {
                expected: self.color_channels,
                got: c,
            }));
        }
        let n_stages = self.n_stages();
        let min = 1 << n_stages;
        for (dim, size) in [("height", h), ("width", w)] {
            if !is_power_of_two(size) {
                return Err(candle_core::Error::wrap(DiffusionError::NotPowerOfTwo { dim, size }));
            }
            if size < min {
                return Err(candle_core::Error::wrap(DiffusionError::InputTooSmall {
                    dim,
                    size,
                    n_stages,
                    min,
                }));
            }
        }
        Ok(())
    }

    /// Stem, down path and middle block
    pub fn encode(&self, x_t: &Tensor, t_emb: &Tensor, train: bool) -> Result<(Tensor, Skips)> {
        self.check_input(x_t)?;
        let mut xs = self.start.forward(x_t)?;
        let mut skips = Vec::with_capacity(self.downblocks.len());
        for db in &self.downblocks {
            let (out, activations) = db.forward_t(&xs, t_emb, train)?;
            skips.push(activations);
            xs = out;
        }
        let xs = self.middle.forward_t(&xs, t_emb, train)?;
        Ok((xs, skips))
    }

    /// Up path and head, consuming the encoder activations stage by stage
    pub fn decode(&self, xs: &Tensor, skips: &Skips, t_emb: &Tensor, train: bool) -> Result<Tensor> {
        if skips.len() != self.upblocks.len() {
            candle_core::bail!("expected {} skip stages, got {}", self.upblocks.len(), skips.len())
        }
        let mut xs = xs.clone();
        for (ub, stage) in self.upblocks.iter().zip(skips.iter().rev()) {
            xs = ub.forward_t(&xs, stage, t_emb, train)?;
        }
        self.end.forward_t(&xs, train)
    }

    /// Predict the noise in `x_t` at diffusion time `t`; the output matches the input shape
    pub fn forward_t(&self, x_t: &Tensor, t: &Tensor, train: bool) -> Result<Tensor> {
        let t_emb = self.time_embedding(t, train)?;
        let (xs, skips) = self.encode(x_t, &t_emb, train)?;
        self.decode(&xs, &skips, &t_emb, train)
    }

    /// Paths of every conv weight preceded by a rectifying activation
    pub fn kaiming_targets(&self) -> Vec<String> {
        let mut targets = Vec::new();
        for db in &self.downblocks {
            for conv in &db.convs {
                targets.extend(conv.kaiming_targets());
            }
        }
        targets.extend(self.middle.kaiming_targets());
        for ub in &self.upblocks {
            for conv in &ub.convs {
                targets.extend(conv.kaiming_targets());
            }
        }
        targets.extend(self.end.kaiming_target());
        targets
    }

    /// Re-draw the targeted conv weights from N(0, 2 / fan_in). Returns how many were set.
    pub fn apply_kaiming(&self, varmap: &VarMap) -> Result<usize> {
        let targets = self.kaiming_targets();
        if targets.is_empty() {
            warn!("kaiming init requested but no conv is preceded by a rectifying activation");
            return Ok(0);
        }
        let data = varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("varmap lock poisoned: {e}")))?;
        let mut applied = 0;
        for name in &targets {
            let Some(var) = data.get(name) else {
                continue;
            };
            let (_, c_in, kh, kw) = var.dims4()?;
            let std = (2.0 / (c_in * kh * kw) as f64).sqrt();
            let init = Tensor::randn(0f32, std as f32, var.shape(), var.device())?.to_dtype(var.dtype())?;
            var.set(&init)?;
            applied += 1;
        }
        Ok(applied)
    }

    #[cfg(test)]
    fn upblock_input_widths(&self) -> Vec<Vec<usize>> {
        self.upblocks.iter().map(|u| u.input_widths()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use candle_core::{DType, Device};

    fn build(cfg: &UnetConfig) -> Result<(VarMap, Unet)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let unet = Unet::from_varmap(cfg, &varmap, vb)?;
        Ok((varmap, unet))
    }

    fn small(nfs: Vec<usize>, n_blocks: Vec<usize>, color_channels: usize) -> UnetConfig {
        UnetConfig {
            nfs,
            n_blocks,
            color_channels,
            ..tiny_unet_config()
        }
    }

    #[test]
    fn test_output_matches_input_shape() -> Result<()> {
        let cfg = small(vec![32, 64], vec![2, 1, 1], 1);
        let (_, unet) = build(&cfg)?;
        let x = Tensor::randn(0f32, 1.0, (1, 1, 32, 32), &Device::Cpu)?;
        let t = Tensor::new(&[0.3f32], &Device::Cpu)?;
        let out = unet.forward_t(&x, &t, false)?;
        assert_eq!(out.dims(), &[1, 1, 32, 32]);
        Ok(())
    }

    #[test]
    fn test_shape_preserved_across_configs() -> Result<()> {
        let configs = [
            small(vec![8], vec![1, 1], 3),
            small(vec![8, 16, 32], vec![1, 2, 1, 1], 3),
            UnetConfig {
                res_block: ResBlockKind::Postact,
                act: Activation::Silu,
                ..small(vec![8, 16], vec![3, 1, 1], 1)
            },
        ];
        for cfg in &configs {
            let (_, unet) = build(cfg)?;
            let x = Tensor::randn(0f32, 1.0, (2, cfg.color_channels, 16, 8), &Device::Cpu)?;
            let t = Tensor::new(&[0.0f32, 1.0], &Device::Cpu)?;
            let out = unet.forward_t(&x, &t, true)?;
            assert_eq!(out.dims(), x.dims());
        }
        Ok(())
    }

    #[test]
    fn test_skip_pairing() -> Result<()> {
        let cfg = small(vec![8, 16, 32], vec![2, 3, 1, 1], 1);
        let (_, unet) = build(&cfg)?;
        let x = Tensor::randn(0f32, 1.0, (2, 1, 16, 16), &Device::Cpu)?;
        let t = Tensor::new(&[0.2f32, 0.7], &Device::Cpu)?;
        let t_emb = unet.time_embedding(&t, false)?;
        let (_, skips) = unet.encode(&x, &t_emb, false)?;

        assert_eq!(skips.len(), unet.n_stages());
        assert_eq!(skips.iter().map(|s| s.len()).collect::<Vec<_>>(), vec![2, 3]);

        // each up layer sees [current, skip] with both halves of equal width
        let widths = unet.upblock_input_widths();
        for (up_widths, stage) in widths.iter().zip(skips.iter().rev()) {
            for (w, skip) in up_widths.iter().zip(stage.iter().rev()) {
                assert_eq!(*w, 2 * skip.dim(1)?);
            }
        }
        Ok(())
    }

    #[test]
    fn test_rejects_bad_inputs() -> Result<()> {
        let cfg = small(vec![8, 16], vec![1, 1, 1], 1);
        let (_, unet) = build(&cfg)?;
        let t = Tensor::new(&[0.5f32], &Device::Cpu)?;

        let rgb = Tensor::zeros((1, 3, 16, 16), DType::F32, &Device::Cpu)?;
        let err = unet.forward_t(&rgb, &t, false).unwrap_err();
        assert!(err.to_string().contains("color channels"));

        let odd = Tensor::zeros((1, 1, 28, 28), DType::F32, &Device::Cpu)?;
        let err = unet.forward_t(&odd, &t, false).unwrap_err();
        assert!(err.to_string().contains("power of two"));
        Ok(())
    }

    #[test]
    fn test_rejects_inputs_smaller_than_the_stage_count() -> Result<()> {
        let cfg = small(vec![8, 16, 32], vec![1, 1, 1, 1], 1);
        let (_, unet) = build(&cfg)?;
        let t = Tensor::new(&[0.5f32], &Device::Cpu)?;

        let tiny = Tensor::zeros((1, 1, 2, 2), DType::F32, &Device::Cpu)?;
        let err = unet.forward_t(&tiny, &t, false).unwrap_err();
        assert!(err.to_string().contains("at least 4"), "{err}");

        let wide = Tensor::zeros((1, 1, 16, 2), DType::F32, &Device::Cpu)?;
        assert!(unet.forward_t(&wide, &t, false).unwrap_err().to_string().contains("width (2)"));

        let smallest = Tensor::zeros((1, 1, 4, 4), DType::F32, &Device::Cpu)?;
        assert_eq!(unet.forward_t(&smallest, &t, false)?.dims(), &[1, 1, 4, 4]);
        Ok(())
    }

    #[test]
    fn test_rejects_stage_mismatch() {
        let cfg = small(vec![8, 16], vec![1, 1], 1);
        assert!(build(&cfg).is_err());
    }

    #[test]
    fn test_kaiming_resets_conv_block_weights() -> Result<()> {
        let cfg = UnetConfig {
            kaiming: true,
            ..small(vec![8, 16], vec![1, 1, 1], 1)
        };
        let (varmap, unet) = build(&cfg)?;
        let targets = unet.kaiming_targets();
        // down, middle, up resblocks carry two conv blocks each, plus the head
        assert_eq!(targets.len(), 2 * 3 + 1);
        let data = varmap.data().lock().unwrap();
        for name in &targets {
            assert!(data.contains_key(name), "missing {name}");
        }
        assert!(!targets.iter().any(|n| n.contains("id_conv") || n.starts_with("start")));
        Ok(())
    }

    fn weight_std(varmap: &VarMap, name: &str) -> Result<(f64, usize)> {
        let data = varmap.data().lock().unwrap();
        let w = data.get(name).unwrap();
        let (_, c_in, kh, kw) = w.dims4()?;
        let values: Vec<f32> = w.flatten_all()?.to_vec1()?;
        let n = values.len() as f64;
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
        Ok((var.sqrt(), c_in * kh * kw))
    }

    #[test]
    fn test_kaiming_weights_follow_fan_in_std() -> Result<()> {
        let name = "middle.conv_a.conv.weight";
        let (varmap, unet) = build(&small(vec![32, 64], vec![1, 1, 1], 1))?;
        let before: Vec<f32> = varmap.data().lock().unwrap()[name].flatten_all()?.to_vec1()?;

        let applied = unet.apply_kaiming(&varmap)?;
        assert_eq!(applied, unet.kaiming_targets().len());

        let after: Vec<f32> = varmap.data().lock().unwrap()[name].flatten_all()?.to_vec1()?;
        assert_ne!(before, after);
        let (std, fan_in) = weight_std(&varmap, name)?;
        let expected = (2.0 / fan_in as f64).sqrt();
        assert!((std - expected).abs() / expected < 0.05, "std {std} expected {expected}");
        Ok(())
    }
}
