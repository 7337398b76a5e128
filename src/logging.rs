//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over the configured `application.log_level`. Records emitted
//! through the `log` facade by the instrument drivers are bridged into the same
//! subscriber.

use tracing_subscriber::EnvFilter;

use crate::config::{ApplicationSettings, LogFormat};
use crate::error::{CalError, CalResult};

/// Filter directive to install, given the value of `RUST_LOG` if any.
pub fn filter_directive(settings: &ApplicationSettings, rust_log: Option<&str>) -> String {
    match rust_log.map(str::trim) {
        Some(directive) if !directive.is_empty() => directive.to_string(),
        _ => settings.log_level.clone(),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(settings: &ApplicationSettings) -> CalResult<()> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = EnvFilter::try_new(filter_directive(settings, rust_log.as_deref()))
        .map_err(|e| CalError::Configuration(format!("Invalid log filter: {e}")))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match settings.log_format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| CalError::Configuration(format!("Failed to install logger: {e}")))
}
