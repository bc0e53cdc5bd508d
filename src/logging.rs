//! Tracing setup.
//!
//! One-shot commands log to stderr so stdout stays clean for results. The
//! long-running worker can append to a file in the platform state directory.

use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "querygate.log";

/// Where log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSink {
    Stderr,
    File,
}

/// Installs the global subscriber. `RUST_LOG` overrides the `info` default.
///
/// A file sink that cannot be opened degrades to stderr with a warning.
pub fn init(sink: LogSink) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if sink == LogSink::File {
        match open_log_file() {
            Ok(file) => {
                builder.with_writer(file).with_ansi(false).init();
                return;
            }
            Err(e) => eprintln!("Warning: logging to stderr, {} is unusable: {e}", log_path().display()),
        }
    }
    builder.with_writer(std::io::stderr).init();
}

fn open_log_file() -> std::io::Result<File> {
    let path = log_path();
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    // Append so a worker restart keeps the previous run's lines.
    OpenOptions::new().create(true).append(true).open(path)
}

/// `$XDG_STATE_HOME/querygate/querygate.log` on Linux; the config directory
/// where there is no state directory; the temp directory as a last resort.
pub fn log_path() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::config_dir)
        .map(|base| base.join("querygate").join(LOG_FILE))
        .unwrap_or_else(|| std::env::temp_dir().join(LOG_FILE))
}
