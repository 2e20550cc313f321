//! Protocol dispatcher: routes inbound requests, synthesizes replies, and
//! brackets every request with busy/idle status broadcasts.
//!
//! The transport delivers all inbound streams to a single serialization
//! point; handlers run to completion before the next message is dispatched.
//! The parent context and the comm registry are the only shared state, each
//! behind its own mutex so a transport that serializes control separately
//! (see `KERNEL_CONTROL_CHANNEL=dedicated`) stays sound.

mod context;

pub use context::{Channel, ParentContext, RequestContext};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::comm::CommRegistry;
use crate::config::ControlChannel;
use crate::interpreter::{ExecuteRequest, HistoryRequest, Interpreter, KernelHandle};
use crate::protocol::{utc_now, Authenticator, Header, Message, ProtocolError, PubMessage, PROTOCOL_VERSION};
use crate::transport::Transport;

/// How long the transport may spend draining queued shell messages after an
/// execution error with `stop_on_error`.
const ABORT_DRAIN: Duration = Duration::from_millis(50);

/// Stable kernel identity. `session_id` is regenerated per process launch.
#[derive(Debug, Clone)]
pub struct KernelIdentity {
    pub kernel_id: String,
    pub user_name: String,
    pub session_id: String,
}

/// Errors surfaced by request handlers.
///
/// A handler error is logged together with the offending content; it never
/// aborts dispatch and never fabricates an error reply.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("malformed request content: {0}")]
    Content(serde_json::Error),
}

type HandlerFn = fn(&KernelCore, &Message, &RequestContext) -> Result<(), DispatchError>;

/// The protocol core: handler table, parent tracking, reply and broadcast
/// emission.
pub struct KernelCore {
    identity: KernelIdentity,
    auth: Authenticator,
    control_channel: ControlChannel,
    handlers: HashMap<&'static str, HandlerFn>,
    transport: Arc<dyn Transport>,
    interpreter: Mutex<Box<dyn Interpreter>>,
    comms: Arc<CommRegistry>,
    // Slot 0 serves shell (and control in shared mode); slot 1 serves
    // control in dedicated mode.
    parents: [Mutex<ParentContext>; 2],
    execution_count: AtomicU64,
}

impl KernelCore {
    pub fn new(
        identity: KernelIdentity,
        auth: Authenticator,
        control_channel: ControlChannel,
        transport: Arc<dyn Transport>,
        interpreter: Box<dyn Interpreter>,
    ) -> Arc<Self> {
        let core = Arc::new(Self {
            identity,
            auth,
            control_channel,
            handlers: handler_table(),
            transport,
            interpreter: Mutex::new(interpreter),
            comms: Arc::new(CommRegistry::new()),
            parents: [Mutex::new(ParentContext::default()), Mutex::new(ParentContext::default())],
            execution_count: AtomicU64::new(0),
        });
        core.comms.attach(Arc::downgrade(&core));
        core
    }

    /// Register the transport listeners and hand the interpreter its upcall
    /// capability. Called once after construction.
    pub fn start(self: &Arc<Self>) {
        let shell = Arc::clone(self);
        self.transport
            .register_shell_listener(Box::new(move |frames| shell.dispatch_shell(frames)));

        let control = Arc::clone(self);
        self.transport
            .register_control_listener(Box::new(move |frames| control.dispatch_control(frames)));

        let stdin = Arc::clone(self);
        self.transport
            .register_stdin_listener(Box::new(move |frames| stdin.dispatch_stdin(frames)));

        let handle = KernelHandle::new(Arc::downgrade(self), self.comms.clone());
        self.interpreter.lock().connect(handle);
    }

    pub fn identity(&self) -> &KernelIdentity {
        &self.identity
    }

    /// The comm registry, for interpreter-side target registration.
    pub fn comms(&self) -> &Arc<CommRegistry> {
        &self.comms
    }

    pub fn dispatch_shell(&self, frames: Vec<Vec<u8>>) {
        self.dispatch(frames, Channel::Shell);
    }

    pub fn dispatch_control(&self, frames: Vec<Vec<u8>>) {
        self.dispatch(frames, Channel::Control);
    }

    /// Stdin traffic carries input replies only: no handler table, no
    /// busy/idle bracketing. The reply value routes straight into the
    /// interpreter.
    pub fn dispatch_stdin(&self, frames: Vec<Vec<u8>>) {
        let message = match Message::deserialize(&frames, &self.auth) {
            Ok(message) => message,
            Err(err) => {
                error!(%err, "could not deserialize stdin message");
                return;
            }
        };

        let ctx = RequestContext::new(&message, Channel::Shell);
        *self.parent_slot(Channel::Shell).lock() = ctx.parent();

        match message.msg_type() {
            "input_reply" => {
                let value = message
                    .content
                    .get("value")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                self.interpreter.lock().input_reply(value);
            }
            other => debug!(msg_type = other, "ignoring stdin message"),
        }
    }

    fn dispatch(&self, frames: Vec<Vec<u8>>, channel: Channel) {
        let message = match Message::deserialize(&frames, &self.auth) {
            Ok(message) => message,
            Err(err) => {
                error!(%err, "could not deserialize inbound message");
                return;
            }
        };

        let ctx = RequestContext::new(&message, channel);
        *self.parent_slot(channel).lock() = ctx.parent();
        self.publish_status("busy", &ctx);

        match self.handlers.get(message.msg_type()) {
            None => warn!(msg_type = message.msg_type(), "received unknown message type"),
            Some(handler) => {
                if let Err(err) = handler(self, &message, &ctx) {
                    error!(%err, content = %message.content, "request handler failed");
                }
            }
        }

        self.publish_status("idle", &ctx);
    }

    fn parent_slot(&self, channel: Channel) -> &Mutex<ParentContext> {
        match (self.control_channel, channel) {
            (ControlChannel::Dedicated, Channel::Control) => &self.parents[1],
            _ => &self.parents[0],
        }
    }

    /// Broadcast on behalf of the request currently being served on shell.
    ///
    /// This is the interpreter upcall path; handlers publish through their
    /// request context instead.
    pub fn publish(&self, msg_type: &str, metadata: Value, content: Value) {
        let parent_header = self.parents[0].lock().header.clone();
        self.publish_with_parent(parent_header, msg_type, metadata, content);
    }

    /// Prompt the front-end on stdin, addressed to the requester currently
    /// being served on shell.
    pub fn send_stdin(&self, msg_type: &str, metadata: Value, content: Value) {
        let parent = self.parents[0].lock().clone();
        let message = Message::new(
            parent.identities,
            self.make_header(msg_type),
            parent.header,
            metadata,
            content,
        );
        match message.serialize(&self.auth) {
            Ok(frames) => self.transport.send_stdin(frames),
            Err(err) => error!(%err, msg_type, "failed to serialize stdin request"),
        }
    }

    fn publish_status(&self, state: &str, ctx: &RequestContext) {
        self.publish_with_parent(
            ctx.header.clone(),
            "status",
            json!({}),
            json!({ "execution_state": state }),
        );
    }

    fn publish_with_parent(
        &self,
        parent_header: Value,
        msg_type: &str,
        metadata: Value,
        content: Value,
    ) {
        let topic = format!("kernel_core.{}.{}", self.identity.kernel_id, msg_type);
        let message = PubMessage::new(topic, self.make_header(msg_type), parent_header, metadata, content);
        match message.serialize(&self.auth) {
            Ok(frames) => self.transport.publish(frames),
            Err(err) => error!(%err, msg_type, "failed to serialize publication"),
        }
    }

    fn send_reply(
        &self,
        ctx: &RequestContext,
        reply_type: &str,
        metadata: Value,
        content: Value,
    ) -> Result<(), DispatchError> {
        self.send_routed(
            ctx.identities.clone(),
            ctx.header.clone(),
            reply_type,
            metadata,
            content,
            ctx.channel,
        )
    }

    fn send_routed(
        &self,
        identities: Vec<Vec<u8>>,
        parent_header: Value,
        reply_type: &str,
        metadata: Value,
        content: Value,
        channel: Channel,
    ) -> Result<(), DispatchError> {
        let message = Message::new(
            identities,
            self.make_header(reply_type),
            parent_header,
            metadata,
            content,
        );
        let frames = message.serialize(&self.auth)?;
        match channel {
            Channel::Shell => self.transport.send_shell(frames),
            Channel::Control => self.transport.send_control(frames),
        }
        Ok(())
    }

    /// Drain callback for the abort protocol: answer a queued request with
    /// an error reply of the matching type, without executing it.
    fn abort_request(&self, frames: Vec<Vec<u8>>) {
        let message = match Message::deserialize(&frames, &self.auth) {
            Ok(message) => message,
            Err(err) => {
                error!(%err, "could not deserialize queued message during abort");
                return;
            }
        };

        let Some(base) = message.msg_type().strip_suffix("_request") else {
            debug!(msg_type = message.msg_type(), "not aborting non-request message");
            return;
        };
        let reply_type = format!("{base}_reply");

        let result = self.send_routed(
            message.identities.clone(),
            message.header.clone(),
            &reply_type,
            json!({}),
            json!({ "status": "error" }),
            Channel::Shell,
        );
        if let Err(err) = result {
            error!(%err, %reply_type, "failed to send abort reply");
        }
    }

    fn make_header(&self, msg_type: &str) -> Header {
        Header::new(msg_type, &self.identity.user_name, &self.identity.session_id)
    }
}

/// The twelve routable message types.
fn handler_table() -> HashMap<&'static str, HandlerFn> {
    let mut table: HashMap<&'static str, HandlerFn> = HashMap::new();
    table.insert("execute_request", execute_request);
    table.insert("complete_request", complete_request);
    table.insert("inspect_request", inspect_request);
    table.insert("history_request", history_request);
    table.insert("is_complete_request", is_complete_request);
    table.insert("comm_info_request", comm_info_request);
    table.insert("comm_open", comm_open);
    table.insert("comm_close", comm_close);
    table.insert("comm_msg", comm_msg);
    table.insert("kernel_info_request", kernel_info_request);
    table.insert("shutdown_request", shutdown_request);
    table.insert("interrupt_request", interrupt_request);
    table
}

fn parse<T: serde::de::DeserializeOwned>(content: &Value) -> Result<T, DispatchError> {
    serde_json::from_value(content.clone()).map_err(DispatchError::Content)
}

fn execute_request(core: &KernelCore, msg: &Message, ctx: &RequestContext) -> Result<(), DispatchError> {
    let mut request: ExecuteRequest = parse(&msg.content)?;
    request.store_history = request.store_history && !request.silent;

    let metadata = json!({ "started": utc_now() });

    if !request.silent {
        let count = core.execution_count.fetch_add(1, Ordering::SeqCst) + 1;
        core.publish_with_parent(
            ctx.header.clone(),
            "execute_input",
            json!({}),
            json!({ "code": request.code, "execution_count": count }),
        );
    }

    let reply = core.interpreter.lock().execute(&request);
    let failed = reply.get("status").and_then(Value::as_str).unwrap_or("error") == "error";
    core.send_reply(ctx, "execute_reply", metadata, reply)?;

    if !request.silent && failed && request.stop_on_error {
        core.transport
            .abort_queue(&mut |frames| core.abort_request(frames), ABORT_DRAIN);
    }
    Ok(())
}

#[derive(Debug, serde::Deserialize)]
struct CursorRequest {
    #[serde(default)]
    code: String,
    #[serde(default = "default_cursor")]
    cursor_pos: i64,
    #[serde(default)]
    detail_level: i64,
}

fn default_cursor() -> i64 {
    -1
}

fn complete_request(core: &KernelCore, msg: &Message, ctx: &RequestContext) -> Result<(), DispatchError> {
    let request: CursorRequest = parse(&msg.content)?;
    let reply = core.interpreter.lock().complete(&request.code, request.cursor_pos);
    core.send_reply(ctx, "complete_reply", json!({}), reply)
}

fn inspect_request(core: &KernelCore, msg: &Message, ctx: &RequestContext) -> Result<(), DispatchError> {
    let request: CursorRequest = parse(&msg.content)?;
    let reply = core
        .interpreter
        .lock()
        .inspect(&request.code, request.cursor_pos, request.detail_level);
    core.send_reply(ctx, "inspect_reply", json!({}), reply)
}

fn history_request(core: &KernelCore, msg: &Message, ctx: &RequestContext) -> Result<(), DispatchError> {
    let request: HistoryRequest = parse(&msg.content)?;
    let reply = core.interpreter.lock().history(&request);
    core.send_reply(ctx, "history_reply", json!({}), reply)
}

fn is_complete_request(core: &KernelCore, msg: &Message, ctx: &RequestContext) -> Result<(), DispatchError> {
    let code = msg.content.get("code").and_then(Value::as_str).unwrap_or("");
    let reply = core.interpreter.lock().is_complete(code);
    core.send_reply(ctx, "is_complete_reply", json!({}), reply)
}

fn comm_info_request(core: &KernelCore, msg: &Message, ctx: &RequestContext) -> Result<(), DispatchError> {
    let filter = msg
        .content
        .get("target_name")
        .and_then(Value::as_str)
        .unwrap_or("");

    let mut comms = serde_json::Map::new();
    for session in core.comms.comms() {
        if filter.is_empty() || session.target_name == filter {
            comms.insert(session.comm_id, json!({ "target_name": session.target_name }));
        }
    }
    core.send_reply(
        ctx,
        "comm_info_reply",
        json!({}),
        json!({ "comms": comms, "status": "ok" }),
    )
}

fn comm_open(core: &KernelCore, msg: &Message, _ctx: &RequestContext) -> Result<(), DispatchError> {
    core.comms.handle_open(&msg.content);
    Ok(())
}

fn comm_msg(core: &KernelCore, msg: &Message, _ctx: &RequestContext) -> Result<(), DispatchError> {
    core.comms.handle_msg(&msg.content);
    Ok(())
}

fn comm_close(core: &KernelCore, msg: &Message, _ctx: &RequestContext) -> Result<(), DispatchError> {
    core.comms.handle_close(&msg.content);
    Ok(())
}

fn kernel_info_request(core: &KernelCore, _msg: &Message, ctx: &RequestContext) -> Result<(), DispatchError> {
    let mut info = core.interpreter.lock().kernel_info();
    if !info.is_object() {
        info = json!({});
    }
    info["protocol_version"] = json!(PROTOCOL_VERSION);
    core.send_reply(ctx, "kernel_info_reply", json!({}), info)
}

fn shutdown_request(core: &KernelCore, msg: &Message, ctx: &RequestContext) -> Result<(), DispatchError> {
    let restart = msg
        .content
        .get("restart")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    core.transport.stop();
    let content = json!({ "restart": restart });
    core.publish_with_parent(ctx.header.clone(), "shutdown", json!({}), content.clone());
    core.send_reply(ctx, "shutdown_reply", json!({}), content)
}

fn interrupt_request(core: &KernelCore, _msg: &Message, ctx: &RequestContext) -> Result<(), DispatchError> {
    core.interpreter.lock().interrupt();
    core.send_reply(ctx, "interrupt_reply", json!({}), json!({}))
}
