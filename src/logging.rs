use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_NAME: &str = "vip-tracker.log";

/// Installs the global subscriber: JSON lines into a daily-rotated file under
/// `log_dir` and human-readable output on stdout. `RUST_LOG` overrides the
/// default `info` filter.
pub fn init_logging(log_dir: &str) {
    let file_appender = rolling::daily(log_dir, LOG_FILE_NAME);
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // A second call (tests, embedding) keeps the first subscriber.
    if tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already installed.");
    }
}
