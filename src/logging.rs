//! Structured logging initialization and masking helpers.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize tracing from the logging configuration. `RUST_LOG` wins over
/// the configured level when set.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_lowercase()));

    match config.format {
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_current_span(false)
                .init();
        }
        LogFormat::Plain => {
            fmt().with_env_filter(filter).init();
        }
    }
}

/// Mask a patron id for log output, keeping just enough to correlate.
/// `lib.1234567` becomes `lib.12***`.
pub fn mask_patron_id(patron_id: &str) -> String {
    let visible: String = patron_id.chars().take(6).collect();
    if patron_id.chars().count() <= 6 {
        patron_id.to_string()
    } else {
        format!("{}***", visible)
    }
}
