pub mod crypto;
pub mod error;
pub mod services;
pub mod state;

pub use error::{QuorumError, Result};
pub use state::{AppState, Workers};

/// Install the `env_logger` backend for the `log` facade.
///
/// `RUST_LOG` overrides the default `info` filter. Safe to call more than
/// once.
pub fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("info");
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .filter_module("reqwest", log::LevelFilter::Warn)
        .try_init();
}
