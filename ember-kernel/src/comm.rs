//! Bidirectional comm session registry.
//!
//! Front-ends and the interpreter exchange structured messages over named
//! comm sessions multiplexed on the shell and I/O publisher channels. The
//! registry maps live comm ids to their sessions and dispatches open,
//! message, and close events to interpreter-side targets registered by
//! name.
//!
//! Lifecycle rules: a duplicate open for a live comm id is ignored; message
//! and close for an unknown id are dropped silently; close is idempotent;
//! an open naming an unregistered target is answered with a `comm_close`
//! broadcast and discarded.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::dispatch::KernelCore;

/// Interpreter-side endpoint for a named comm target.
pub trait CommTarget: Send + Sync {
    fn on_open(&self, comm: &CommSession, data: &Value);
    fn on_message(&self, comm: &CommSession, data: &Value);
    fn on_close(&self, comm: &CommSession, data: &Value);
}

/// A live comm session. Comm ids are assigned by the opener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommSession {
    pub comm_id: String,
    pub target_name: String,
}

#[derive(Debug, Deserialize)]
struct CommOpen {
    comm_id: String,
    target_name: String,
    #[serde(default = "empty_object")]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct CommEvent {
    comm_id: String,
    #[serde(default = "empty_object")]
    data: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// Registry of live comm sessions and their targets.
pub struct CommRegistry {
    core: OnceLock<Weak<KernelCore>>,
    targets: Mutex<HashMap<String, Arc<dyn CommTarget>>>,
    sessions: Mutex<HashMap<String, CommSession>>,
}

impl CommRegistry {
    pub(crate) fn new() -> Self {
        Self {
            core: OnceLock::new(),
            targets: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the core back-reference. Called once at wiring.
    pub(crate) fn attach(&self, core: Weak<KernelCore>) {
        let _ = self.core.set(core);
    }

    /// Register an interpreter-side handler for a target name.
    pub fn register_target(&self, name: &str, target: Arc<dyn CommTarget>) {
        self.targets.lock().insert(name.to_string(), target);
    }

    /// Remove a target handler. Live sessions for it stay open.
    pub fn unregister_target(&self, name: &str) {
        self.targets.lock().remove(name);
    }

    /// Snapshot of all live sessions.
    pub fn comms(&self) -> Vec<CommSession> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Interpreter-side send: broadcast a `comm_msg` for a live session.
    ///
    /// Returns false when the comm id is unknown.
    pub fn send(&self, comm_id: &str, data: Value) -> bool {
        if !self.sessions.lock().contains_key(comm_id) {
            return false;
        }
        self.broadcast("comm_msg", json!({ "comm_id": comm_id, "data": data }));
        true
    }

    pub(crate) fn handle_open(&self, content: &Value) {
        let open: CommOpen = match serde_json::from_value(content.clone()) {
            Ok(open) => open,
            Err(err) => {
                warn!(%err, "dropping malformed comm_open");
                return;
            }
        };

        // A duplicate open is ignored no matter which target it names; the
        // live session must not be disturbed.
        if self.sessions.lock().contains_key(&open.comm_id) {
            debug!(comm_id = %open.comm_id, "ignoring duplicate comm_open");
            return;
        }

        let target = self.targets.lock().get(&open.target_name).cloned();
        let Some(target) = target else {
            // No such target on this side: refuse the comm.
            debug!(target_name = %open.target_name, comm_id = %open.comm_id, "no target for comm_open");
            self.broadcast("comm_close", json!({ "comm_id": open.comm_id, "data": {} }));
            return;
        };

        let session = CommSession {
            comm_id: open.comm_id.clone(),
            target_name: open.target_name,
        };
        self.sessions.lock().insert(open.comm_id, session.clone());
        // Guard released: the target may re-enter the registry.
        target.on_open(&session, &open.data);
    }

    pub(crate) fn handle_msg(&self, content: &Value) {
        let Some((event, session, target)) = self.lookup_event(content, "comm_msg") else {
            return;
        };
        target.on_message(&session, &event.data);
    }

    pub(crate) fn handle_close(&self, content: &Value) {
        let event: CommEvent = match serde_json::from_value(content.clone()) {
            Ok(event) => event,
            Err(err) => {
                warn!(%err, "dropping malformed comm_close");
                return;
            }
        };

        let session = self.sessions.lock().remove(&event.comm_id);
        let Some(session) = session else {
            debug!(comm_id = %event.comm_id, "comm_close for unknown comm");
            return;
        };
        let target = self.targets.lock().get(&session.target_name).cloned();
        if let Some(target) = target {
            target.on_close(&session, &event.data);
        }
    }

    fn lookup_event(
        &self,
        content: &Value,
        kind: &str,
    ) -> Option<(CommEvent, CommSession, Arc<dyn CommTarget>)> {
        let event: CommEvent = match serde_json::from_value(content.clone()) {
            Ok(event) => event,
            Err(err) => {
                warn!(%err, "dropping malformed {kind}");
                return None;
            }
        };
        let session = self.sessions.lock().get(&event.comm_id).cloned();
        let Some(session) = session else {
            debug!(comm_id = %event.comm_id, "{kind} for unknown comm");
            return None;
        };
        let target = self.targets.lock().get(&session.target_name).cloned();
        let Some(target) = target else {
            debug!(target_name = %session.target_name, "{kind} for unregistered target");
            return None;
        };
        Some((event, session, target))
    }

    fn broadcast(&self, msg_type: &str, content: Value) {
        let core = self.core.get().and_then(Weak::upgrade);
        if let Some(core) = core {
            core.publish(msg_type, empty_object(), content);
        }
    }
}
