//! Logging initialization and configuration.
//!
//! Output, format and level come from [`LoggingConfig`]:
//! - **stdout / stderr**: non-blocking writer, compact text or JSON lines
//! - **file**: daily rotated files next to `file_path`, keeping
//!   `max_backups` old files
//!
//! `RUST_LOG` takes precedence over everything, then `VLINK_LOG_LEVEL`, then
//! the configured level.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use vlink_core::{LogFormat, LogOutput, LoggingConfig};

/// Keeps the non-blocking writer alive for the lifetime of the program.
static WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize the logging system from configuration.
///
/// # Errors
///
/// Returns an error if the level filter cannot be parsed or the log file
/// cannot be opened.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let log_level = std::env::var("VLINK_LOG_LEVEL").unwrap_or_else(|_| config.level.clone());

    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    let (writer, guard) = match config.output {
        LogOutput::Stdout => tracing_appender::non_blocking(std::io::stdout()),
        LogOutput::Stderr => tracing_appender::non_blocking(std::io::stderr()),
        LogOutput::File => {
            let path = config
                .file_path
                .as_deref()
                .context("logging.file_path is required when logging.output is file")?;
            tracing_appender::non_blocking(file_appender(path, config.max_backups)?)
        }
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(format_layer(config.format, config.output, writer))
        .init();

    let _ = WRITER_GUARD.set(guard);

    Ok(())
}

fn format_layer<S>(
    format: LogFormat,
    output: LogOutput,
    writer: NonBlocking,
) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_current_span(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(output != LogOutput::File)
            .boxed(),
    }
}

/// Daily rotated appender writing `<file name>.<date>` next to `path`.
fn file_appender(path: &Path, max_backups: u32) -> anyhow::Result<RollingFileAppender> {
    let (dir, prefix) = split_log_path(path);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(usize::try_from(max_backups.max(1)).unwrap_or(usize::MAX))
        .build(&dir)
        .with_context(|| format!("failed to open log file in {}", dir.display()))
}

/// Splits a log file path into its directory and file name prefix.
fn split_log_path(path: &Path) -> (PathBuf, String) {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let prefix = path
        .file_name()
        .map_or_else(|| "vlink.log".to_string(), |name| name.to_string_lossy().into_owned());
    (dir, prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_log_path() {
        let (dir, prefix) = split_log_path(Path::new("/var/log/vlink/vlink.log"));
        assert_eq!(dir, PathBuf::from("/var/log/vlink"));
        assert_eq!(prefix, "vlink.log");
    }

    #[test]
    fn test_split_bare_file_name() {
        let (dir, prefix) = split_log_path(Path::new("drill.log"));
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(prefix, "drill.log");
    }

    #[test]
    fn test_file_appender_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logs").join("vlink.log");

        file_appender(&path, 3).unwrap();

        assert!(tmp.path().join("logs").is_dir());
    }
}
