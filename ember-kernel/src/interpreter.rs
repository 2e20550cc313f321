//! Interpreter collaborator interface.
//!
//! The interpreter executes user code and answers introspection queries; it
//! never touches the wire. At wiring time it receives a [`KernelHandle`],
//! the capability through which it publishes broadcasts, requests stdin
//! input, and manages comm targets.

use std::sync::{Arc, Weak};

use serde::Deserialize;
use serde_json::Value;

use crate::comm::CommRegistry;
use crate::dispatch::KernelCore;

/// Parsed `execute_request` content.
///
/// `store_history` is forced to `false` for silent executions before the
/// request reaches the interpreter.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub silent: bool,
    #[serde(default = "default_true")]
    pub store_history: bool,
    #[serde(default)]
    pub user_expressions: Option<Value>,
    #[serde(default = "default_true")]
    pub allow_stdin: bool,
    #[serde(default)]
    pub stop_on_error: bool,
}

/// Parsed `history_request` content.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryRequest {
    #[serde(default = "default_tail")]
    pub hist_access_type: String,
    #[serde(default)]
    pub output: bool,
    #[serde(default)]
    pub raw: bool,
    #[serde(default)]
    pub session: i64,
    #[serde(default)]
    pub start: i64,
    #[serde(default)]
    pub stop: i64,
    #[serde(default)]
    pub n: i64,
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub unique: bool,
}

fn default_true() -> bool {
    true
}

fn default_tail() -> String {
    "tail".to_string()
}

/// Semantic operations the kernel core delegates to.
///
/// Every query returns the reply content as a JSON value; the core wraps it
/// in a protocol-conformant reply message.
pub trait Interpreter: Send {
    /// Hand the interpreter its upcall capability. Called once at wiring.
    fn connect(&mut self, handle: KernelHandle);

    fn execute(&mut self, request: &ExecuteRequest) -> Value;
    fn complete(&mut self, code: &str, cursor_pos: i64) -> Value;
    fn inspect(&mut self, code: &str, cursor_pos: i64, detail_level: i64) -> Value;
    fn history(&mut self, request: &HistoryRequest) -> Value;
    fn is_complete(&mut self, code: &str) -> Value;
    fn kernel_info(&mut self) -> Value;

    /// Best-effort interruption of a running execution.
    fn interrupt(&mut self);

    /// Value typed by the user in response to an input request.
    fn input_reply(&mut self, value: &str);
}

/// Upcall capability handed to the interpreter.
///
/// Holds a weak reference to the core so the interpreter cannot extend the
/// kernel's lifetime; upcalls after the core is gone are silently dropped.
#[derive(Clone)]
pub struct KernelHandle {
    core: Weak<KernelCore>,
    comms: Arc<CommRegistry>,
}

impl KernelHandle {
    pub(crate) fn new(core: Weak<KernelCore>, comms: Arc<CommRegistry>) -> Self {
        Self { core, comms }
    }

    /// Broadcast a message on the I/O publisher channel, parented to the
    /// request currently being processed.
    pub fn publish(&self, msg_type: &str, metadata: Value, content: Value) {
        if let Some(core) = self.core.upgrade() {
            core.publish(msg_type, metadata, content);
        }
    }

    /// Prompt the front-end for input on the stdin channel.
    pub fn send_stdin(&self, msg_type: &str, metadata: Value, content: Value) {
        if let Some(core) = self.core.upgrade() {
            core.send_stdin(msg_type, metadata, content);
        }
    }

    /// Comm capability: target registration, listing, interpreter-side sends.
    pub fn comms(&self) -> &Arc<CommRegistry> {
        &self.comms
    }
}
