//! Process diagnostics for the kernel.
//!
//! Protocol rules keep diagnostics off the wire: a message that fails to
//! decode is dropped without a reply, an unknown message type is dropped
//! after its busy/idle bracket, and a failed handler produces no error
//! reply. All of those are reported here instead. Output always goes to
//! stderr; stdout and the sockets belong to the transport and to captured
//! user output.

use thiserror::Error;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::KernelConfig;

/// Errors from the diagnostics bootstrap.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid diagnostics filter {0:?}")]
    InvalidFilter(String),
    #[error("diagnostics already initialized for this process")]
    AlreadyInitialized,
}

/// Install the stderr diagnostics subscriber for this kernel process.
///
/// JSON output is the default so launchers can collect dropped-message and
/// handler-failure reports; `KERNEL_LOG_PRETTY` switches to human-readable
/// output for driving a kernel from a terminal. Call once, before the
/// transport listeners are registered, so no report is lost.
pub fn init_diagnostics(config: &KernelConfig) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_new(&config.log_filter)
        .map_err(|_| LoggingError::InvalidFilter(config.log_filter.clone()))?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.pretty_logs {
        registry
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    };
    installed.map_err(|_| LoggingError::AlreadyInitialized)?;

    info!(
        kernel_id = %config.kernel_id,
        signing = !config.session_key.is_empty(),
        control_channel = ?config.control_channel,
        "kernel diagnostics online"
    );
    Ok(())
}
