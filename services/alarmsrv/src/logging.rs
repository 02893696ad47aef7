//! Logging setup for AlarmSrv
//!
//! Console output through `tracing-subscriber`, with the `EnvFilter` behind a
//! reload layer so the level can be changed at runtime.

use std::sync::{Mutex, OnceLock};
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

use crate::error::{AlarmError, Result};

type EnvFilterReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;
static LOG_FILTER_HANDLE: OnceLock<EnvFilterReloadHandle> = OnceLock::new();
static CURRENT_LOG_LEVEL: OnceLock<Mutex<String>> = OnceLock::new();

/// Install the global subscriber. `RUST_LOG` wins over `level` when set.
///
/// Calling this again after a subscriber is installed is a no-op.
pub fn init(level: &str) -> Result<()> {
    let filter_str = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    let env_filter = EnvFilter::try_new(&filter_str)
        .map_err(|e| AlarmError::Config(format!("Invalid log level '{}': {}", filter_str, e)))?;

    let (reload_filter, reload_handle) = reload::Layer::new(env_filter);
    let installed = tracing_subscriber::registry()
        .with(reload_filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok();

    if installed {
        let _ = LOG_FILTER_HANDLE.set(reload_handle);
        let _ = CURRENT_LOG_LEVEL.set(Mutex::new(filter_str));
    }
    Ok(())
}

/// Swap the active filter, e.g. `debug` or `info,alarmsrv=trace`
pub fn set_log_level(level: &str) -> Result<()> {
    let handle = LOG_FILTER_HANDLE
        .get()
        .ok_or_else(|| AlarmError::Config("Logging not initialized".to_string()))?;

    let new_filter = EnvFilter::try_new(level)
        .map_err(|e| AlarmError::Validation(format!("Invalid log level '{}': {}", level, e)))?;

    handle
        .reload(new_filter)
        .map_err(|e| AlarmError::Config(format!("Failed to reload log filter: {}", e)))?;

    if let Some(current) = CURRENT_LOG_LEVEL.get() {
        if let Ok(mut guard) = current.lock() {
            *guard = level.to_string();
        }
    }

    tracing::info!("Log level changed to: {}", level);
    Ok(())
}

/// Current filter string, or `unknown` before [`init`]
pub fn get_log_level() -> String {
    CURRENT_LOG_LEVEL
        .get()
        .and_then(|m| m.lock().ok())
        .map(|guard| guard.clone())
        .unwrap_or_else(|| "unknown".to_string())
}
