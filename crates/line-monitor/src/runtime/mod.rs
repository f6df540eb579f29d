mod app;
mod config;
mod logging;
mod telemetry;

pub use app::{run, run_from_args, start, AppError, MonitorHandle};
pub use config::RuntimeConfig;
pub use logging::init_tracing;
