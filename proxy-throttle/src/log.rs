pub use tracing::{error, info, warn};

use std::{fs, path::Path, str::FromStr, sync::Mutex};
use throttle_proxy_lib::log_event_names;
use tracing_subscriber::{fmt, prelude::*};

/// System log file name under the log directory
const SYSTEM_LOG_FILE: &str = "throttle-proxy.log";
/// Access log file name under the log directory
const ACCESS_LOG_FILE: &str = "access.log";

/// Initialize the logger. Logs go to stdout unless a log directory is given,
/// in which case system and access logs are written to separate files there.
pub fn init_logger(log_dir_path: Option<&str>) -> Result<(), anyhow::Error> {
  let level_string = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
  let level = tracing::Level::from_str(level_string.as_str()).unwrap_or(tracing::Level::INFO);

  let passed_pkg_names = [env!("CARGO_PKG_NAME").replace('-', "_")];

  // This limits the logger to emits only this crate with any level, for included crates it will emit only INFO or above level.
  let system_filter = move |metadata: &tracing::Metadata<'_>| {
    (passed_pkg_names
      .iter()
      .any(|pkg_name| metadata.target().starts_with(pkg_name))
      && metadata.level() <= &level)
      || metadata.level() <= &tracing::Level::INFO.min(level)
  };

  let Some(log_dir_path) = log_dir_path else {
    let stdio_layer = fmt::layer()
      .with_line_number(true)
      .with_thread_ids(false)
      .with_thread_names(true)
      .with_target(true)
      .with_level(true)
      .compact()
      .with_filter(tracing_subscriber::filter::filter_fn(system_filter));
    tracing_subscriber::registry().with(stdio_layer).init();
    return Ok(());
  };

  let log_dir = Path::new(log_dir_path);
  fs::create_dir_all(log_dir)?;
  let system_log = open_log_file(&log_dir.join(SYSTEM_LOG_FILE))?;
  let access_log = open_log_file(&log_dir.join(ACCESS_LOG_FILE))?;

  let system_layer = fmt::layer()
    .with_line_number(true)
    .with_thread_ids(false)
    .with_thread_names(true)
    .with_target(true)
    .with_level(true)
    .with_ansi(false)
    .compact()
    .with_writer(Mutex::new(system_log))
    .with_filter(tracing_subscriber::filter::filter_fn(move |metadata| {
      metadata.name() != log_event_names::ACCESS_LOG && system_filter(metadata)
    }));

  let access_layer = fmt::layer()
    .with_line_number(false)
    .with_thread_ids(false)
    .with_thread_names(false)
    .with_target(false)
    .with_level(false)
    .with_ansi(false)
    .compact()
    .with_writer(Mutex::new(access_log))
    .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
      metadata.name() == log_event_names::ACCESS_LOG
    }));

  tracing_subscriber::registry().with(system_layer).with(access_layer).init();
  Ok(())
}

fn open_log_file(path: &Path) -> Result<fs::File, anyhow::Error> {
  fs::OpenOptions::new()
    .create(true)
    .append(true)
    .open(path)
    .map_err(|e| anyhow::anyhow!("Failed to open log file {}: {e}", path.display()))
}
