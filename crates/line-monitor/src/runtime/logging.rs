use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "info,line_monitor=debug,line_io=debug,line_core=debug";

/// Initialize the tracing subscriber with optional JSON output.
///
/// Logs go through a non-blocking stdout writer so a slow terminal never
/// stalls a poll loop. Keep the returned guard alive until exit to flush.
/// `log` records from `line-core` are bridged by the subscriber.
pub fn init_tracing(json_output: bool) -> WorkerGuard {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = if json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(writer))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(writer))
            .try_init()
    };
    guard
}
