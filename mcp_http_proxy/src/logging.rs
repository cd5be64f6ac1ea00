//! # Logging Initialization
//!
//! Centralized setup for the `tracing` ecosystem. The proxy's stdout
//! carries protocol traffic exclusively, so diagnostics must go anywhere
//! but there.
//!
//! ## Destinations
//!
//! 1. **Stderr (default)**: logs are written to `stderr` with ANSI colors
//!    enabled for readability in a terminal.
//! 2. **File (`log_to_file = true`)**: a daily rolling log file in the
//!    user-specific cache directory (determined by the `directories`
//!    crate), with ANSI colors disabled. `tracing_appender` handles
//!    rotation and non-blocking I/O, so a supervised proxy keeps its
//!    stderr quiet.
//! 3. **Stderr fallback**: if file logging is requested but the cache
//!    directory cannot be determined or written to, logs fall back to
//!    `stderr` with colors enabled.
//!
//! ## Verbosity
//!
//! The `RUST_LOG` environment variable takes precedence when set.
//! Otherwise the level given on the command line applies globally, with
//! this crate raised to `debug`.

use std::{io::stderr, path::Path, sync::Once};

use anyhow::Result;
use directories::ProjectDirs;
use tracing_subscriber::{EnvFilter, fmt::layer, prelude::*};

static INIT: Once = Once::new();

/// Initialize verbose logging for tests.
pub fn init_test_logging() {
    init_logging("trace", false).expect("Failed to initialize test logging");
}

/// Initializes the logging system. Safe to call more than once; only the
/// first call takes effect.
///
/// # Errors
///
/// Currently never returns one: a file destination that cannot be set up
/// falls back to stderr instead of failing.
pub fn init_logging(log_level: &str, log_to_file: bool) -> Result<()> {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{log_level},mcp_http_proxy=debug")));

        if log_to_file
            && let Some(proj_dirs) = ProjectDirs::from("com", "McpHttpProxy", "mcp_http_proxy")
        {
            let log_dir = proj_dirs.cache_dir();

            // tracing-appender 0.2.4+ panics on permission errors, so check
            // the directory first and keep a catch_unwind as the backstop.
            let file_appender_result = if test_write_permission(log_dir) {
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    tracing_appender::rolling::daily(log_dir, "mcp_http_proxy.log")
                }))
            } else {
                Err(Box::new("Cannot write to log directory") as Box<dyn std::any::Any + Send>)
            };

            if let Ok(file_appender) = file_appender_result {
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                // Leaked so buffered lines are flushed at process exit.
                Box::leak(Box::new(guard));
                return;
            }
        }

        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer().with_writer(stderr).with_ansi(true))
            .init();
    });

    Ok(())
}

/// Test if the directory can be written to, creating it if needed.
fn test_write_permission(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }

    let test_file = dir.join(".mcp_proxy_log_test");
    match std::fs::write(&test_file, "test") {
        Ok(()) => {
            let _ = std::fs::remove_file(&test_file);
            true
        }
        Err(_) => false,
    }
}
