mod app;
mod config;
mod logging;
mod telemetry;

pub use app::{run, run_from_args, RunError};
pub use config::{ConfigError, RuntimeConfig, TargetSet};
pub use logging::init_tracing;
