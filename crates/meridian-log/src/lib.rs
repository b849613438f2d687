//! Structured logging for the Meridian client.
//!
//! Library crates log through `tracing` macros with structured fields. This
//! crate installs the process-wide subscriber: a human-readable console layer
//! plus, in debug builds, a JSON file layer so connection and bounce
//! diagnostics can be inspected after a session ends.

use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use meridian_config::Config;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// File name used for the JSON log inside the log directory.
pub const LOG_FILE_NAME: &str = "meridian.log";

const DEFAULT_DIRECTIVES: &str = "info,bevy_ecs=warn";

/// Filter directives derived from config, falling back to the defaults when
/// no level is configured.
pub fn filter_directives(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.trim().is_empty() => {
            config.debug.log_level.trim().to_string()
        }
        _ => DEFAULT_DIRECTIVES.to_string(),
    }
}

/// `RUST_LOG` wins over the configured level.
fn env_filter(config: Option<&Config>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directives(config)))
}

/// Create an `EnvFilter` with the default directives.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_DIRECTIVES)
}

/// JSON layer writing one event per line to `file`.
pub fn json_file_layer<S>(file: File) -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .with_timer(fmt::time::uptime())
        .json()
}

/// Install the global tracing subscriber.
///
/// The console layer is always present. When `debug_build` is set, the
/// config allows it and `log_dir` can be created, events are also written as
/// JSON to [`LOG_FILE_NAME`] in that directory. Failing to open the file is
/// not an error; logging continues on the console only.
///
/// Returns an error if a global subscriber was already installed.
///
/// ```no_run
/// use meridian_config::Config;
/// use meridian_log::init_logging;
///
/// let config = Config::default();
/// init_logging(Some(std::path::Path::new("./logs")), true, Some(&config)).ok();
/// ```
pub fn init_logging(
    log_dir: Option<&Path>,
    debug_build: bool,
    config: Option<&Config>,
) -> Result<(), TryInitError> {
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter(config))
        .with(console_layer);

    let file_enabled = config.is_none_or(|c| c.debug.log_to_file);
    if debug_build
        && file_enabled
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = File::create(log_dir.join(LOG_FILE_NAME))
    {
        return subscriber.with(json_file_layer(log_file)).try_init();
    }

    subscriber.try_init()
}
