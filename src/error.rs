//! Domain errors for the diffusion pipeline

/// Precondition violations raised by the schedule, the model and the data module
#[derive(thiserror::Error, Debug)]
pub enum DiffusionError {
    #[error("timestep out of range: every t must lie in [0, 1], got min {min} max {max}")]
    TimestepOutOfRange { min: f32, max: f32 },
    #[error("{dim} ({size}) must be a power of two")]
    NotPowerOfTwo { dim: &'static str, size: usize },
    #[error("{dim} ({size}) is too small for the model, {n_stages} down-sampling stages need at least {min}")]
    InputTooSmall { dim: &'static str, size: usize, n_stages: usize, min: usize },
    #[error("model color channels ({expected}) must match input data channels ({got})")]
    ChannelMismatch { expected: usize, got: usize },
    #[error("n_blocks must have exactly one more entry than nfs (nfs: {nfs}, n_blocks: {n_blocks})")]
    StageMismatch { nfs: usize, n_blocks: usize },
    #[error("sampling needs at least one step")]
    NoSamplingSteps,
    #[error("unsupported number of color channels: {0}")]
    UnsupportedChannels(usize),
    #[error("split not found: {0}")]
    MissingSplit(String),
}

pub type Result<T> = std::result::Result<T, DiffusionError>;

/// True for 1, 2, 4, 8, ...
pub fn is_power_of_two(n: usize) -> bool {
    n != 0 && n & (n - 1) == 0
}
