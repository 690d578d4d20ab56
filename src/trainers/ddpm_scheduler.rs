//! Continuous-time DDPM noise schedule
//! Implements the cosine signal-retention schedule together with the forward
//! (noisify) and inverse (denoisify) blends used for training and sampling

use anyhow::{ensure, Result};
use candle_core::{DType, Device, Shape, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::DiffusionError;

/// Upper clamp of ᾱ, keeps the t = 0 end away from a zero-variance blend
pub const ALPHA_BAR_MAX: f32 = 0.999;

/// Noised samples bundled with their timesteps and the noise that was added
#[derive(Debug, Clone)]
pub struct NoisyBatch {
    pub x_t: Tensor,
    pub t: Tensor,
    pub epsilon: Tensor,
}

impl NoisyBatch {
    /// `((x_t, t), epsilon)`: model input and training target
    pub fn into_parts(self) -> ((Tensor, Tensor), Tensor) {
        ((self.x_t, self.t), self.epsilon)
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.x_t.dim(0)?)
    }
}

fn check_timesteps(t: &Tensor) -> Result<()> {
    let values: Vec<f32> = t.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
    if values.iter().any(|v| !(0.0..=1.0).contains(v)) {
        let min = values.iter().copied().fold(f32::INFINITY, f32::min);
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        return Err(DiffusionError::TimestepOutOfRange { min, max }.into());
    }
    Ok(())
}

/// ᾱ(t) = clamp(cos²(t·π/2), 0, 0.999), elementwise over `t`.
///
/// Every element of `t` must lie in [0, 1]; the input is validated, never clamped.
pub fn alpha_bar(t: &Tensor) -> Result<Tensor> {
    check_timesteps(t)?;
    let half_pi = std::f64::consts::FRAC_PI_2;
    let ab = (t.to_dtype(DType::F32)? * half_pi)?
        .cos()?
        .sqr()?
        .clamp(0f32, ALPHA_BAR_MAX)?;
    Ok(ab)
}

/// [`alpha_bar`] reshaped to `[bs, 1, 1, 1]` to broadcast against a sample batch
pub fn alpha_bar_4d(t: &Tensor) -> Result<Tensor> {
    let ab = alpha_bar(t)?;
    let n = ab.elem_count();
    Ok(ab.reshape((n, 1, 1, 1))?)
}

/// Draw one uniform timestep in [0, 1) per batch element
pub fn sample_timesteps<R: Rng + ?Sized>(batch_size: usize, device: &Device, rng: &mut R) -> Result<Tensor> {
    let ts: Vec<f32> = (0..batch_size).map(|_| rng.gen::<f32>()).collect();
    Ok(Tensor::from_vec(ts, batch_size, device)?)
}

/// Standard gaussian noise of the given shape
pub fn standard_normal<R: Rng + ?Sized, S: Into<Shape>>(shape: S, device: &Device, rng: &mut R) -> Result<Tensor> {
    let shape = shape.into();
    let data: Vec<f32> = (0..shape.elem_count())
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Variance preserving blend: sqrt(ᾱ)·x_0 + sqrt(1 − ᾱ)·ε
pub fn blend(x_0: &Tensor, epsilon: &Tensor, t: &Tensor) -> Result<Tensor> {
    let ab = alpha_bar_4d(t)?.to_dtype(x_0.dtype())?;
    let signal = x_0.broadcast_mul(&ab.sqrt()?)?;
    let noise = epsilon.broadcast_mul(&(1.0 - &ab)?.sqrt()?)?;
    Ok((signal + noise)?)
}

/// Add noise to `x_0` at timesteps `t`, drawing one uniform timestep per
/// example when `t` is `None`.
pub fn noisify(x_0: &Tensor, t: Option<&Tensor>) -> Result<NoisyBatch> {
    noisify_with_rng(x_0, t, &mut rand::thread_rng())
}

/// [`noisify`] with an explicit random source, for reproducible runs
pub fn noisify_with_rng<R: Rng + ?Sized>(x_0: &Tensor, t: Option<&Tensor>, rng: &mut R) -> Result<NoisyBatch> {
    let n = x_0.dim(0)?;
    let device = x_0.device();

    let t = match t {
        Some(t) => {
            ensure!(
                t.elem_count() == n,
                "expected {} timesteps for the batch, got {}",
                n,
                t.elem_count()
            );
            t.flatten_all()?.to_dtype(DType::F32)?
        }
        None => sample_timesteps(n, device, rng)?,
    };

    // Sample noise for each example in the batch
    let epsilon = standard_normal(x_0.dims(), device, rng)?.to_dtype(x_0.dtype())?;
    let x_t = blend(x_0, &epsilon, &t)?;

    Ok(NoisyBatch { x_t, t, epsilon })
}

/// Algebraic inverse of the forward blend: (x_t − sqrt(1 − ᾱ)·noise) / sqrt(ᾱ)
///
/// There is no floor on ᾱ, so estimates get unstable as t approaches 1.
pub fn denoisify(x_t: &Tensor, noise: &Tensor, t: &Tensor) -> Result<Tensor> {
    let ab = alpha_bar_4d(t)?.to_dtype(x_t.dtype())?;
    let noise = noise.broadcast_mul(&(1.0 - &ab)?.sqrt()?)?;
    Ok((x_t - noise)?.broadcast_div(&ab.sqrt()?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    #[test]
    fn test_alpha_bar_is_non_increasing_and_capped() -> Result<()> {
        let ts: Vec<f32> = (0..=100).map(|i| i as f32 / 100.0).collect();
        let t = Tensor::from_vec(ts, 101, &Device::Cpu)?;
        let ab: Vec<f32> = alpha_bar(&t)?.to_vec1()?;
        assert!(ab.windows(2).all(|w| w[1] <= w[0]));
        assert!(ab.iter().all(|&a| (0.0..=ALPHA_BAR_MAX).contains(&a)));
        assert_eq!(ab[0], ALPHA_BAR_MAX);
        assert!(ab[100] < 1e-6);
        Ok(())
    }

    #[test]
    fn test_alpha_bar_midpoint() -> Result<()> {
        let t = Tensor::new(&[0.5f32], &Device::Cpu)?;
        let ab: Vec<f32> = alpha_bar(&t)?.to_vec1()?;
        assert!((ab[0] - 0.5).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_alpha_bar_rejects_out_of_range() -> Result<()> {
        for bad in [[0.2f32, 1.5], [-0.1, 0.5], [f32::NAN, 0.5]] {
            let t = Tensor::new(&bad, &Device::Cpu)?;
            let err = alpha_bar(&t).unwrap_err();
            assert!(err.downcast_ref::<DiffusionError>().is_some());
        }
        Ok(())
    }

    #[test]
    fn test_alpha_bar_4d_broadcast_shape() -> Result<()> {
        let t = Tensor::new(&[0.1f32, 0.2, 0.3], &Device::Cpu)?;
        assert_eq!(alpha_bar_4d(&t)?.dims(), &[3, 1, 1, 1]);
        Ok(())
    }

    #[test]
    fn test_denoisify_inverts_noisify() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let x_0 = standard_normal((4, 3, 8, 8), &Device::Cpu, &mut rng)?;
        let t = Tensor::new(&[0.0f32, 0.25, 0.5, 0.9], &Device::Cpu)?;
        let batch = noisify_with_rng(&x_0, Some(&t), &mut rng)?;
        let recovered = denoisify(&batch.x_t, &batch.epsilon, &batch.t)?;
        assert!(max_abs_diff(&recovered, &x_0)? < 1e-3);
        Ok(())
    }

    #[test]
    fn test_noisify_draws_fresh_noise() -> Result<()> {
        let x_0 = Tensor::zeros((2, 1, 4, 4), DType::F32, &Device::Cpu)?;
        let a = noisify(&x_0, None)?;
        let b = noisify(&x_0, None)?;
        assert_eq!(a.x_t.dims(), x_0.dims());
        assert_eq!(a.epsilon.dims(), x_0.dims());
        assert_eq!(a.t.dims(), &[2]);
        assert!(max_abs_diff(&a.epsilon, &b.epsilon)? > 0.0);
        assert!(max_abs_diff(&a.x_t, &b.x_t)? > 0.0);
        Ok(())
    }

    #[test]
    fn test_seeded_noisify_is_reproducible() -> Result<()> {
        let x_0 = Tensor::ones((3, 1, 4, 4), DType::F32, &Device::Cpu)?;
        let a = noisify_with_rng(&x_0, None, &mut StdRng::seed_from_u64(42))?;
        let b = noisify_with_rng(&x_0, None, &mut StdRng::seed_from_u64(42))?;
        assert_eq!(max_abs_diff(&a.x_t, &b.x_t)?, 0.0);
        assert_eq!(a.t.to_vec1::<f32>()?, b.t.to_vec1::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_noisify_rejects_wrong_timestep_count() -> Result<()> {
        let x_0 = Tensor::zeros((2, 1, 4, 4), DType::F32, &Device::Cpu)?;
        let t = Tensor::new(&[0.5f32], &Device::Cpu)?;
        assert!(noisify(&x_0, Some(&t)).is_err());
        Ok(())
    }
}
