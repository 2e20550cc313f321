//! Kernel configuration loading from environment variables.
//!
//! All values are loaded from `KERNEL_*` environment variables with sensible
//! defaults. Invalid values fall back to defaults without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `KERNEL_ID` | `ember` | Stable logical kernel name (topic prefix) |
//! | `KERNEL_USER` | `$USER` or `kernel` | Username stamped into headers |
//! | `KERNEL_SESSION_KEY` | empty | Shared signing key; empty disables signing |
//! | `KERNEL_SIGNATURE_SCHEME` | `hmac-sha256` | `hmac-sha256` or `hmac-sha512` |
//! | `KERNEL_CONTROL_CHANNEL` | `shared` | `shared` or `dedicated` serialization for control |
//! | `KERNEL_LOG_FILTER` | `info` | diagnostics filter directive |
//! | `KERNEL_LOG_PRETTY` | `0` | human-readable diagnostics instead of JSON |

use crate::protocol::SignatureScheme;

/// Serialization domain for the control channel.
///
/// `Shared` runs control requests through the same serialization point as
/// shell, so an interrupt queued behind a long execution waits for it.
/// `Dedicated` partitions parent tracking per channel so the transport may
/// drive control from its own serialization point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ControlChannel {
    #[default]
    Shared,
    Dedicated,
}

/// Kernel configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub kernel_id: String,
    pub user_name: String,
    pub session_key: String,
    pub signature_scheme: SignatureScheme,
    pub control_channel: ControlChannel,
    /// Diagnostics filter directive ([`crate::logging::init_diagnostics`]).
    pub log_filter: String,
    /// Human-readable diagnostics instead of JSON.
    pub pretty_logs: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            kernel_id: "ember".to_string(),
            user_name: "kernel".to_string(),
            session_key: String::new(),
            signature_scheme: SignatureScheme::default(),
            control_channel: ControlChannel::default(),
            log_filter: "info".to_string(),
            pretty_logs: false,
        }
    }
}

/// Read a string env var, returning `default` when missing.
fn parse_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read a boolean env var, returning `default` on missing or invalid.
fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> KernelConfig {
    let kernel_id = parse_string("KERNEL_ID", "ember");
    let user_name = std::env::var("KERNEL_USER")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "kernel".to_string());
    let session_key = parse_string("KERNEL_SESSION_KEY", "");
    let signature_scheme = std::env::var("KERNEL_SIGNATURE_SCHEME")
        .ok()
        .and_then(|name| SignatureScheme::parse(&name))
        .unwrap_or_default();
    let control_channel = match parse_string("KERNEL_CONTROL_CHANNEL", "shared").as_str() {
        "dedicated" => ControlChannel::Dedicated,
        _ => ControlChannel::Shared,
    };
    let log_filter = parse_string("KERNEL_LOG_FILTER", "info");
    let pretty_logs = parse_bool("KERNEL_LOG_PRETTY", false);

    KernelConfig {
        kernel_id,
        user_name,
        session_key,
        signature_scheme,
        control_channel,
        log_filter,
        pretty_logs,
    }
}
