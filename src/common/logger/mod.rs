use std::{fs, path::Path};

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub mod formatter;
pub mod writer;

pub use formatter::*;
pub use writer::*;

use crate::configs::{Config, LoggingConfig};

/// Builds the filter directive string from the `[logging]` section.
///
/// `RUST_LOG` still wins when it is set.
pub fn filter_directives(logging: Option<&LoggingConfig>) -> String {
    let level = logging.and_then(|l| l.level.as_deref()).unwrap_or("info");
    let filters = logging.and_then(|l| l.filters.as_deref()).unwrap_or("");

    if filters.is_empty() {
        level.to_string()
    } else {
        format!("{},{}", level, filters)
    }
}

pub fn init(config: &Config) {
    let logging = config.logging.as_ref();
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(logging)));

    let stdout_layer = fmt::layer()
        .event_format(EventFormatter::new(true))
        .with_ansi(true);

    let file_layer = logging.and_then(|l| l.file.as_ref()).map(|file_config| {
        if let Some(parent) = Path::new(&file_config.path).parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!("Failed to create log directory: {}", e);
            }
        }

        fmt::layer()
            .with_writer(CircularFileWriter::new(
                file_config.path.clone(),
                file_config.max_lines,
            ))
            .event_format(EventFormatter::new(false))
            .with_ansi(false)
    });

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();
}
