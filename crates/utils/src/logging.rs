//! provides logging helpers

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Environment variable naming a directory for rotated log files.
pub const LOG_PATH_ENV_VAR: &str = "DEVICE_PLUGIN_LOG_PATH";

const LOG_FILE_PREFIX: &str = "device-plugin.log";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
///
/// Logs always go to stderr. When `log_dir` is given, a daily rotated file
/// layer is added as well and its writer guard is returned; the guard must be
/// kept alive for the lifetime of the process or buffered lines are lost.
pub fn init<P: AsRef<Path>>(log_dir: Option<P>) -> Option<WorkerGuard> {
    let stderr_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    let file_appender = log_dir.and_then(|dir| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .max_log_files(3)
            .build(dir.as_ref())
            .map_err(|e| eprintln!("failed to create rolling file appender: {e}"))
            .ok()
    });

    match file_appender {
        Some(appender) => {
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(env_filter());

            registry().with(stderr_layer).with(file_layer).init();
            Some(guard)
        }
        None => {
            registry().with(stderr_layer).init();
            None
        }
    }
}
