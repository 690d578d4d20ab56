pub mod error;
pub mod models;
pub mod trainers;

// Re-export common types
pub use error::DiffusionError;
pub use models::{Unet, UnetConfig};
pub use trainers::{load_config, Config, DiffusionDataModule, UnetTrainer};

pub mod logging {
    use env_logger::{Builder, Env};
    use std::io::Write;

    /// Timestamped logger, `RUST_LOG` overrides the default `info` level
    pub fn init_logger() {
        Builder::from_env(Env::default().default_filter_or("info"))
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .init();
    }
}
