//! Diffusion time embeddings
//!
//! The raw sinusoidal encoding of a continuous timestep and the small MLP
//! that lets the model adjust it before it reaches the residual blocks.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{self as nn, Module, ModuleT, VarBuilder};

use super::blocks::Activation;

pub const MAX_PERIOD: f64 = 10_000.0;

/// Sin/cos embedding of `ts` (shape `[bs]`, values in [0, 1]) into `[bs, emb_dim]`.
///
/// Frequencies are `exp(-ln(max_period) * linspace(0, 1, emb_dim / 2))`, the
/// first half of the output holds the sines and the second half the cosines.
pub fn timestep_embedding(ts: &Tensor, emb_dim: usize, max_period: f64) -> Result<Tensor> {
    let half = emb_dim / 2;
    let freqs: Vec<f32> = (0..half)
        .map(|i| {
            let frac = if half > 1 { i as f64 / (half - 1) as f64 } else { 0.0 };
            (-max_period.ln() * frac).exp() as f32
        })
        .collect();
    let freqs = Tensor::from_vec(freqs, (1, half), ts.device())?;
    let emb = ts.to_dtype(DType::F32)?.unsqueeze(1)?.broadcast_mul(&freqs)?;
    Tensor::cat(&[emb.sin()?, emb.cos()?], D::Minus1)
}

/// Small network that modifies the "raw" time embeddings
#[derive(Debug)]
pub struct TimeEmbeddingMLP {
    norm: nn::BatchNorm,
    linear_1: nn::Linear,
    act: Activation,
    linear_2: nn::Linear,
    c_in: usize,
    c_out: usize,
}

impl TimeEmbeddingMLP {
    pub fn new(c_in: usize, c_out: usize, act: Activation, vb: VarBuilder) -> Result<Self> {
        let norm = nn::batch_norm(c_in, nn::BatchNormConfig::default(), vb.pp("norm"))?;
        let linear_1 = nn::linear(c_in, c_out, vb.pp("linear_1"))?;
        let linear_2 = nn::linear(c_out, c_out, vb.pp("linear_2"))?;
        Ok(Self {
            norm,
            linear_1,
            act,
            linear_2,
            c_in,
            c_out,
        })
    }

    pub fn c_out(&self) -> usize {
        self.c_out
    }

    pub fn forward_t(&self, t: &Tensor, train: bool) -> Result<Tensor> {
        let xs = timestep_embedding(t, self.c_in, MAX_PERIOD)?;
        let xs = self.norm.forward_t(&xs, train)?;
        let xs = self.act.forward(&self.linear_1.forward(&xs)?)?;
        self.linear_2.forward(&xs)
    }
}
