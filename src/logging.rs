use std::{
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use tokio::sync::RwLock;
use tracing::{debug, info, metadata::LevelFilter, trace, Level};
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{prelude::*, EnvFilter};

// Lines written to the log file are only guaranteed to land once this is dropped.
static FILE_GUARD: Mutex<Option<WorkerGuard>> = Mutex::new(None);

fn file_writer(output_dir: &Path) -> NonBlocking {
    let file_appender = RollingFileAppender::new(Rotation::DAILY, output_dir, "portal.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    *FILE_GUARD.lock().unwrap_or_else(PoisonError::into_inner) = Some(guard);

    writer
}

fn do_init(stdout_level: Level, file_level: Option<(Level, PathBuf)>) {
    let mut message = String::from("Logging with:");

    // stdout
    message += " stdout";

    // `RUST_LOG` wins if set.
    let stdout_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(stdout_level).into())
        .from_env_lossy();
    let stdout_layer = tracing_subscriber::fmt::layer().with_filter(stdout_filter);

    let registry = tracing_subscriber::registry().with(stdout_layer);

    #[cfg(feature = "use-tracy")]
    let registry = {
        message += ", tracy";

        let filter = LevelFilter::DEBUG;
        let layer = tracing_tracy::TracyLayer::new();
        registry.with(layer.with_filter(filter))
    };

    let maybe_file_layer = if let Some((level, output_dir)) = file_level {
        message += &format!(", file (in dir {output_dir:?})");

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer(&output_dir))
            .with_ansi(false)
            .with_filter(LevelFilter::from(level));
        Some(file_layer)
    } else {
        None
    };

    registry.with(maybe_file_layer).init();

    debug!(message);
}

/// Initialize tracing.
///
/// Will only initialize once, so tests may call this.
pub async fn init(stdout_level: Level, file_logging: Option<(Level, PathBuf)>) {
    static TRACING_IS_INITIALIZED: RwLock<bool> = RwLock::const_new(false);

    let initialized = { *TRACING_IS_INITIALIZED.read().await };

    if !initialized {
        let mut initialized = TRACING_IS_INITIALIZED.write().await;

        // Someone else may have gotten here in between.
        if *initialized {
            return;
        }

        do_init(stdout_level, file_logging);

        *initialized = true;
    }

    info!("Logging initialized");
}

/// Flush what is left in the log file before exiting.
///
/// Nothing more is written to the file afterwards.
pub fn shutdown() {
    trace!("Shutting down");

    let guard = FILE_GUARD
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();

    if guard.is_some() {
        debug!("Flushing log file");
    }

    drop(guard);
}
