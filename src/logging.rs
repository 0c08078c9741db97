//! Structured logging and tracing for pvctl
//!
//! Console and daily-rotated file layers on top of `tracing-subscriber`, plus
//! small per-component loggers carrying context fields (component, device).

use crate::config::LoggingConfig;
use crate::error::{PvError, Result};
use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::Once;
use tracing::{Level, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod level;
mod structured;

pub use level::{level_rank, min_level, parse_log_level};
pub use structured::{ErrorRateLimiter, LogContext, StructuredLogger, get_logger, get_logger_for};

// Keep the non-blocking worker guard alive for the entire process lifetime
static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static INIT_ONCE: Once = Once::new();
static INIT_ERROR: OnceCell<String> = OnceCell::new();

/// Initialize logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    INIT_ONCE.call_once(|| {
        if let Err(e) = try_init(config) {
            let _ = INIT_ERROR.set(e.to_string());
        }
    });

    if let Some(err) = INIT_ERROR.get() {
        return Err(PvError::config(err.clone()));
    }
    Ok(())
}

fn try_init(config: &LoggingConfig) -> Result<()> {
    let base_level = parse_log_level(&config.level)?;
    let console_level = config
        .console_level
        .as_ref()
        .and_then(|s| parse_log_level(s).ok())
        .unwrap_or(base_level);
    let file_level = config
        .file_level
        .as_ref()
        .and_then(|s| parse_log_level(s).ok())
        .unwrap_or(base_level);

    // Most verbose level so layer-specific filters can down-filter
    let filter = build_env_filter(min_level(console_level, file_level));

    let console_layer = if config.console_output {
        let base = fmt::layer()
            .with_writer(std::io::stdout)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false);
        Some(if config.json_format {
            base.json()
                .with_filter(LevelFilter::from_level(console_level))
                .boxed()
        } else {
            base.with_filter(LevelFilter::from_level(console_level))
                .boxed()
        })
    } else {
        None
    };

    let file_layer = if config.file_output && !cfg!(test) {
        let file_appender = rolling::Builder::new()
            .rotation(rolling::Rotation::DAILY)
            .filename_prefix("pvctl")
            .filename_suffix("log")
            .max_log_files(config.backup_count.max(1) as usize)
            .build({
                // If config.file is a file path, use its parent dir; otherwise treat as dir
                let p = Path::new(&config.file);
                if p.extension().is_some() {
                    p.parent().unwrap_or(p)
                } else {
                    p
                }
            })
            .map_err(|e| PvError::io(format!("Failed to create log file appender: {}", e)))?;

        let (non_blocking_appender, guard) = non_blocking(file_appender);
        let _ = LOG_GUARD.set(guard);

        let base = fmt::layer()
            .with_writer(non_blocking_appender)
            .with_target(false)
            .with_thread_ids(false)
            .with_ansi(false)
            .with_file(false);
        Some(if config.json_format {
            base.json()
                .with_filter(LevelFilter::from_level(file_level))
                .boxed()
        } else {
            base.with_filter(LevelFilter::from_level(file_level))
                .boxed()
        })
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| PvError::config(format!("Logging already initialized: {}", e)))?;

    info!(
        "Logging initialized - console_level: {:?}, file_level: {:?}, file: {}",
        console_level, file_level, config.file
    );
    Ok(())
}

fn build_env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "pvctl={},tokio_modbus=warn,rumqttc=warn",
            level.as_str().to_lowercase()
        )
        .into()
    })
}
