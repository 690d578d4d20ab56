//! Convolution and residual building blocks of the diffusion U-Net

use candle_core::{Result, Tensor, D};
use candle_nn::{self as nn, Conv2d, Conv2dConfig, Module, ModuleT, VarBuilder};
use serde::{Deserialize, Serialize};

/// Non-linearity used throughout the model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Relu,
    Silu,
    Gelu,
}

impl Activation {
    /// Rectifying activations get a kaiming-normal init on the following conv
    pub fn is_rectifying(&self) -> bool {
        matches!(self, Activation::Relu)
    }
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Relu => xs.relu(),
            Activation::Silu => nn::ops::silu(xs),
            Activation::Gelu => xs.gelu(),
        }
    }
}

/// Residual block flavour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ResBlockKind {
    /// norm -> act -> conv
    #[default]
    Preact,
    /// conv -> norm -> act
    Postact,
}

/// Conv layer wrapped with batch normalization and an activation
#[derive(Debug)]
pub struct ConvBlock {
    norm: nn::BatchNorm,
    act: Activation,
    conv: Conv2d,
    kind: ResBlockKind,
    conv_path: String,
}

impl ConvBlock {
    pub fn new(
        c_in: usize,
        c_out: usize,
        ks: usize,
        stride: usize,
        act: Activation,
        kind: ResBlockKind,
        vb: VarBuilder,
    ) -> Result<Self> {
        let norm_features = match kind {
            ResBlockKind::Preact => c_in,
            ResBlockKind::Postact => c_out,
        };
        let norm = nn::batch_norm(norm_features, nn::BatchNormConfig::default(), vb.pp("norm"))?;
        let conv_cfg = Conv2dConfig {
            padding: ks / 2,
            stride,
            ..Default::default()
        };
        let conv_vb = vb.pp("conv");
        let conv_path = conv_vb.prefix();
        let conv = nn::conv2d_no_bias(c_in, c_out, ks, conv_cfg, conv_vb)?;
        Ok(Self {
            norm,
            act,
            conv,
            kind,
            conv_path,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self.kind {
            ResBlockKind::Preact => {
                let xs = self.norm.forward_t(xs, train)?;
                let xs = self.act.forward(&xs)?;
                self.conv.forward(&xs)
            }
            ResBlockKind::Postact => {
                let xs = self.conv.forward(xs)?;
                let xs = self.norm.forward_t(&xs, train)?;
                self.act.forward(&xs)
            }
        }
    }

    /// Variable path of the conv weight when it should receive a kaiming init
    pub fn kaiming_target(&self) -> Option<String> {
        self.act
            .is_rectifying()
            .then(|| format!("{}.weight", self.conv_path))
    }
}

/// Injects the time embedding into the block activations as a scale and shift
#[derive(Debug)]
pub struct TimeEmbeddingMixer {
    lin: nn::Linear,
    act: Activation,
}

impl TimeEmbeddingMixer {
    pub fn new(c_time: usize, c_out: usize, act: Activation, vb: VarBuilder) -> Result<Self> {
        let lin = nn::linear(c_time, c_out * 2, vb.pp("lin"))?;
        Ok(Self { lin, act })
    }

    pub fn forward(&self, xs: &Tensor, t_emb: &Tensor) -> Result<Tensor> {
        let t_emb = self
            .lin
            .forward(&self.act.forward(t_emb)?)?
            .unsqueeze(D::Minus1)?
            .unsqueeze(D::Minus1)?;
        let chunks = t_emb.chunk(2, 1)?;
        let (scale, shift) = (&chunks[0], &chunks[1]);
        xs.broadcast_mul(&(scale + 1.0)?)?.broadcast_add(shift)
    }
}

/// Residual conv block with time embedding modulation between its two convs
#[derive(Debug)]
pub struct ResBlock {
    time_mixer: TimeEmbeddingMixer,
    conv_a: ConvBlock,
    conv_b: ConvBlock,
    id_conv: Option<Conv2d>,
    c_in: usize,
    c_out: usize,
}

impl ResBlock {
    pub fn new(
        c_time: usize,
        c_in: usize,
        c_out: usize,
        act: Activation,
        kind: ResBlockKind,
        vb: VarBuilder,
    ) -> Result<Self> {
        let time_mixer = TimeEmbeddingMixer::new(c_time, c_out, act, vb.pp("time_mixer"))?;
        let conv_a = ConvBlock::new(c_in, c_out, 3, 1, act, kind, vb.pp("conv_a"))?;
        let conv_b = ConvBlock::new(c_out, c_out, 3, 1, act, kind, vb.pp("conv_b"))?;
        let id_conv = if c_in != c_out {
            Some(nn::conv2d(c_in, c_out, 1, Conv2dConfig::default(), vb.pp("id_conv"))?)
        } else {
            None
        };
        Ok(Self {
            time_mixer,
            conv_a,
            conv_b,
            id_conv,
            c_in,
            c_out,
        })
    }

    pub fn c_in(&self) -> usize {
        self.c_in
    }

    pub fn c_out(&self) -> usize {
        self.c_out
    }

    fn non_residual(&self, xs: &Tensor, t_emb: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.conv_a.forward_t(xs, train)?;
        let xs = self.time_mixer.forward(&xs, t_emb)?;
        self.conv_b.forward_t(&xs, train)
    }

    fn residual(&self, xs: &Tensor) -> Result<Tensor> {
        match &self.id_conv {
            Some(id_conv) => id_conv.forward(xs),
            None => Ok(xs.clone()),
        }
    }

    pub fn forward_t(&self, xs: &Tensor, t_emb: &Tensor, train: bool) -> Result<Tensor> {
        self.non_residual(xs, t_emb, train)? + self.residual(xs)?
    }

    pub fn kaiming_targets(&self) -> Vec<String> {
        [&self.conv_a, &self.conv_b]
            .iter()
            .filter_map(|c| c.kaiming_target())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_mixer_identity_for_zero_projection() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mixer = TimeEmbeddingMixer::new(8, 4, Activation::Relu, vb)?;
        for var in varmap.all_vars() {
            var.set(&var.zeros_like()?)?;
        }
        let xs = Tensor::randn(0f32, 1.0, (2, 4, 8, 8), &device)?;
        let t_emb = Tensor::randn(0f32, 1.0, (2, 8), &device)?;
        let out = mixer.forward(&xs, &t_emb)?;
        let diff = (out - &xs)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn test_resblock_changes_width_only() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        for kind in [ResBlockKind::Preact, ResBlockKind::Postact] {
            let block = ResBlock::new(16, 4, 8, Activation::Silu, kind, vb.pp(format!("{kind:?}")))?;
            let xs = Tensor::randn(0f32, 1.0, (2, 4, 16, 16), &device)?;
            let t_emb = Tensor::randn(0f32, 1.0, (2, 16), &device)?;
            let out = block.forward_t(&xs, &t_emb, true)?;
            assert_eq!(out.dims(), &[2, 8, 16, 16]);
        }
        Ok(())
    }

    #[test]
    fn test_identity_skip_when_widths_match() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _block = ResBlock::new(16, 8, 8, Activation::Relu, ResBlockKind::Preact, vb.pp("same"))?;
        let _block = ResBlock::new(16, 8, 4, Activation::Relu, ResBlockKind::Preact, vb.pp("wider"))?;
        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(!names.iter().any(|n| n.starts_with("same.id_conv")));
        assert!(names.iter().any(|n| n == "wider.id_conv.weight"));
        Ok(())
    }

    #[test]
    fn test_kaiming_targets_follow_activation() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let relu = ResBlock::new(16, 8, 8, Activation::Relu, ResBlockKind::Preact, vb.pp("r"))?;
        let gelu = ResBlock::new(16, 8, 8, Activation::Gelu, ResBlockKind::Preact, vb.pp("g"))?;
        assert_eq!(
            relu.kaiming_targets(),
            vec!["r.conv_a.conv.weight".to_string(), "r.conv_b.conv.weight".to_string()]
        );
        assert!(gelu.kaiming_targets().is_empty());
        Ok(())
    }
}
