//! Model implementations for pixel-space diffusion
//!
//! This module contains the U-Net noise predictor and its building blocks

pub mod blocks;
pub mod embeddings;
pub mod unet;

// Re-export key types
pub use blocks::{Activation, ConvBlock, ResBlock, ResBlockKind, TimeEmbeddingMixer};
pub use embeddings::{timestep_embedding, TimeEmbeddingMLP};
pub use unet::{tiny_unet_config, Downblock, Skips, Unet, UnetConfig, Upblock};
