//! Shared test doubles: a recording transport and a scripted interpreter.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use ember_kernel::config::ControlChannel;
use ember_kernel::dispatch::{KernelCore, KernelIdentity};
use ember_kernel::interpreter::{ExecuteRequest, HistoryRequest, Interpreter, KernelHandle};
use ember_kernel::protocol::{Authenticator, Header, Message, PubMessage};
use ember_kernel::transport::{FrameListener, Transport};

pub const SESSION_KEY: &str = "integration-key";

pub fn auth() -> Authenticator {
    Authenticator::new(SESSION_KEY, Default::default())
}

/// Transport double: records every outbound sink and replays a scripted
/// queue through the abort drain.
#[derive(Default)]
pub struct RecordingTransport {
    pub shell: Mutex<Vec<Vec<Vec<u8>>>>,
    pub control: Mutex<Vec<Vec<Vec<u8>>>>,
    pub stdin: Mutex<Vec<Vec<Vec<u8>>>>,
    pub published: Mutex<Vec<Vec<Vec<u8>>>>,
    pub abort_backlog: Mutex<Vec<Vec<Vec<u8>>>>,
    pub abort_timeouts: Mutex<Vec<Duration>>,
    pub stopped: AtomicBool,
    shell_listener: Mutex<Option<FrameListener>>,
    control_listener: Mutex<Option<FrameListener>>,
    stdin_listener: Mutex<Option<FrameListener>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a wire message for the next `abort_queue` drain.
    pub fn queue_for_abort(&self, frames: Vec<Vec<u8>>) {
        self.abort_backlog.lock().push(frames);
    }

    /// Deliver frames through the registered shell listener.
    pub fn deliver_shell(&self, frames: Vec<Vec<u8>>) {
        let listener = self.shell_listener.lock();
        listener.as_ref().expect("shell listener registered")(frames);
    }

    pub fn published_types(&self) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .map(|frames| decode_pub(frames).msg_type().to_string())
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn register_shell_listener(&self, listener: FrameListener) {
        *self.shell_listener.lock() = Some(listener);
    }

    fn register_control_listener(&self, listener: FrameListener) {
        *self.control_listener.lock() = Some(listener);
    }

    fn register_stdin_listener(&self, listener: FrameListener) {
        *self.stdin_listener.lock() = Some(listener);
    }

    fn send_shell(&self, frames: Vec<Vec<u8>>) {
        self.shell.lock().push(frames);
    }

    fn send_control(&self, frames: Vec<Vec<u8>>) {
        self.control.lock().push(frames);
    }

    fn send_stdin(&self, frames: Vec<Vec<u8>>) {
        self.stdin.lock().push(frames);
    }

    fn publish(&self, frames: Vec<Vec<u8>>) {
        self.published.lock().push(frames);
    }

    fn abort_queue(&self, drain: &mut dyn FnMut(Vec<Vec<u8>>), timeout: Duration) {
        self.abort_timeouts.lock().push(timeout);
        for frames in self.abort_backlog.lock().drain(..) {
            drain(frames);
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Observable state of the scripted interpreter, shared with the test body.
pub struct InterpreterState {
    pub execute_reply: Mutex<Value>,
    pub executes: Mutex<Vec<ExecuteRequest>>,
    pub histories: Mutex<Vec<HistoryRequest>>,
    pub interrupts: AtomicUsize,
    pub input_values: Mutex<Vec<String>>,
    pub handle: Mutex<Option<KernelHandle>>,
    /// When set, `execute` publishes a `stream` broadcast through the
    /// kernel handle, as a real interpreter would for stdout.
    pub stream_on_execute: AtomicBool,
}

impl Default for InterpreterState {
    fn default() -> Self {
        Self {
            execute_reply: Mutex::new(json!({ "status": "ok", "execution_count": 1 })),
            executes: Mutex::new(Vec::new()),
            histories: Mutex::new(Vec::new()),
            interrupts: AtomicUsize::new(0),
            input_values: Mutex::new(Vec::new()),
            handle: Mutex::new(None),
            stream_on_execute: AtomicBool::new(false),
        }
    }
}

pub struct ScriptedInterpreter {
    pub state: Arc<InterpreterState>,
}

impl Interpreter for ScriptedInterpreter {
    fn connect(&mut self, handle: KernelHandle) {
        *self.state.handle.lock() = Some(handle);
    }

    fn execute(&mut self, request: &ExecuteRequest) -> Value {
        self.state.executes.lock().push(request.clone());
        if self.state.stream_on_execute.load(Ordering::SeqCst) {
            if let Some(handle) = self.state.handle.lock().as_ref() {
                handle.publish(
                    "stream",
                    json!({}),
                    json!({ "name": "stdout", "text": "hi\n" }),
                );
            }
        }
        self.state.execute_reply.lock().clone()
    }

    fn complete(&mut self, _code: &str, cursor_pos: i64) -> Value {
        json!({ "status": "ok", "matches": [], "cursor_start": cursor_pos, "cursor_end": cursor_pos })
    }

    fn inspect(&mut self, _code: &str, _cursor_pos: i64, detail_level: i64) -> Value {
        json!({ "status": "ok", "found": false, "detail_level": detail_level })
    }

    fn history(&mut self, request: &HistoryRequest) -> Value {
        self.state.histories.lock().push(request.clone());
        json!({ "status": "ok", "history": [] })
    }

    fn is_complete(&mut self, _code: &str) -> Value {
        json!({ "status": "complete" })
    }

    fn kernel_info(&mut self) -> Value {
        json!({ "implementation": "scripted", "banner": "scripted interpreter" })
    }

    fn interrupt(&mut self) {
        self.state.interrupts.fetch_add(1, Ordering::SeqCst);
    }

    fn input_reply(&mut self, value: &str) {
        self.state.input_values.lock().push(value.to_string());
    }
}

/// A core wired to a recording transport and a scripted interpreter.
pub struct Fixture {
    pub core: Arc<KernelCore>,
    pub transport: Arc<RecordingTransport>,
    pub interpreter: Arc<InterpreterState>,
}

pub fn fixture() -> Fixture {
    fixture_with(ControlChannel::Shared)
}

pub fn fixture_with(control_channel: ControlChannel) -> Fixture {
    let transport = RecordingTransport::new();
    let state = Arc::new(InterpreterState::default());
    let interpreter = Box::new(ScriptedInterpreter { state: state.clone() });

    let identity = KernelIdentity {
        kernel_id: "ember-test".to_string(),
        user_name: "tester".to_string(),
        session_id: "session-1".to_string(),
    };
    let core = KernelCore::new(identity, auth(), control_channel, transport.clone(), interpreter);
    core.start();

    Fixture { core, transport, interpreter: state }
}

/// Wire frames for a client request with a single routing identity.
pub fn request_frames(msg_type: &str, content: Value) -> Vec<Vec<u8>> {
    message_for(msg_type, content)
        .serialize(&auth())
        .expect("serialize request")
}

pub fn message_for(msg_type: &str, content: Value) -> Message {
    Message::new(
        vec![b"client-identity".to_vec()],
        Header::new(msg_type, "front-end", "client-session"),
        json!({}),
        json!({}),
        content,
    )
}

pub fn decode_msg(frames: &[Vec<u8>]) -> Message {
    Message::deserialize(frames, &auth()).expect("decode routed message")
}

pub fn decode_pub(frames: &[Vec<u8>]) -> PubMessage {
    PubMessage::deserialize(frames, &auth()).expect("decode publication")
}
