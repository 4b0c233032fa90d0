//! Tracing and logging setup shared by relayq binaries and tests.

/// Initialize process-wide logging with the default configuration.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&LogConfig::default());
}

/// Tracing configuration (filters, formats).
pub mod tracing;

pub use self::tracing::{LogConfig, LogFormat, ParseLogFormatError};
