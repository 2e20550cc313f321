//! Comm lifecycle as seen through the dispatcher.

mod common;

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use common::{decode_msg, decode_pub, fixture, request_frames, Fixture};
use ember_kernel::comm::{CommSession, CommTarget};

#[derive(Default)]
struct RecordingTarget {
    events: Mutex<Vec<(String, String, Value)>>,
}

impl CommTarget for RecordingTarget {
    fn on_open(&self, comm: &CommSession, data: &Value) {
        self.events
            .lock()
            .push(("open".into(), comm.comm_id.clone(), data.clone()));
    }

    fn on_message(&self, comm: &CommSession, data: &Value) {
        self.events
            .lock()
            .push(("message".into(), comm.comm_id.clone(), data.clone()));
    }

    fn on_close(&self, comm: &CommSession, data: &Value) {
        self.events
            .lock()
            .push(("close".into(), comm.comm_id.clone(), data.clone()));
    }
}

fn with_target(name: &str) -> (Fixture, Arc<RecordingTarget>) {
    let fx = fixture();
    let target = Arc::new(RecordingTarget::default());
    fx.core.comms().register_target(name, target.clone());
    (fx, target)
}

fn comm_info_reply(fx: &Fixture, filter: Value) -> Value {
    fx.core
        .dispatch_shell(request_frames("comm_info_request", filter));
    let shell = fx.transport.shell.lock();
    decode_msg(shell.last().unwrap()).content.clone()
}

#[test]
fn lifecycle_events_arrive_in_order() {
    let (fx, target) = with_target("plot");

    fx.core.dispatch_shell(request_frames(
        "comm_open",
        json!({ "comm_id": "c1", "target_name": "plot", "data": { "w": 640 } }),
    ));
    fx.core.dispatch_shell(request_frames(
        "comm_msg",
        json!({ "comm_id": "c1", "data": { "frame": 1 } }),
    ));
    fx.core
        .dispatch_shell(request_frames("comm_close", json!({ "comm_id": "c1" })));

    let events = target.events.lock();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0], ("open".into(), "c1".into(), json!({ "w": 640 })));
    assert_eq!(events[1], ("message".into(), "c1".into(), json!({ "frame": 1 })));
    assert_eq!(events[2].0, "close");
}

#[test]
fn comm_traffic_is_bracketed_but_never_replied_to() {
    let (fx, _target) = with_target("plot");

    fx.core.dispatch_shell(request_frames(
        "comm_open",
        json!({ "comm_id": "c1", "target_name": "plot" }),
    ));

    assert_eq!(fx.transport.published_types(), vec!["status", "status"]);
    assert!(fx.transport.shell.lock().is_empty());
}

#[test]
fn message_after_close_is_dropped() {
    let (fx, target) = with_target("plot");

    fx.core.dispatch_shell(request_frames(
        "comm_open",
        json!({ "comm_id": "c1", "target_name": "plot" }),
    ));
    fx.core
        .dispatch_shell(request_frames("comm_close", json!({ "comm_id": "c1" })));
    fx.core.dispatch_shell(request_frames(
        "comm_msg",
        json!({ "comm_id": "c1", "data": {} }),
    ));

    let events = target.events.lock();
    assert_eq!(events.len(), 2, "no event for a message after close");
}

#[test]
fn unregistered_target_open_answers_with_comm_close() {
    let fx = fixture();

    fx.core.dispatch_shell(request_frames(
        "comm_open",
        json!({ "comm_id": "c2", "target_name": "missing" }),
    ));

    let published = fx.transport.published.lock();
    let closes: Vec<_> = published
        .iter()
        .map(|frames| decode_pub(frames))
        .filter(|msg| msg.msg_type() == "comm_close")
        .collect();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].content["comm_id"], json!("c2"));
    drop(published);

    let info = comm_info_reply(&fx, json!({}));
    assert_eq!(info["comms"], json!({}));
}

#[test]
fn duplicate_open_naming_a_missing_target_broadcasts_nothing() {
    let (fx, target) = with_target("plot");

    fx.core.dispatch_shell(request_frames(
        "comm_open",
        json!({ "comm_id": "c1", "target_name": "plot" }),
    ));
    fx.core.dispatch_shell(request_frames(
        "comm_open",
        json!({ "comm_id": "c1", "target_name": "missing" }),
    ));

    // Two bracketed requests, and no comm_close for the live comm.
    assert_eq!(
        fx.transport.published_types(),
        vec!["status", "status", "status", "status"]
    );
    assert_eq!(target.events.lock().len(), 1);

    let info = comm_info_reply(&fx, json!({}));
    assert_eq!(info["comms"]["c1"], json!({ "target_name": "plot" }));
}

#[test]
fn comm_info_lists_and_filters_by_target_name() {
    let (fx, _target) = with_target("plot");
    let table = Arc::new(RecordingTarget::default());
    fx.core.comms().register_target("table", table);

    fx.core.dispatch_shell(request_frames(
        "comm_open",
        json!({ "comm_id": "c1", "target_name": "plot" }),
    ));
    fx.core.dispatch_shell(request_frames(
        "comm_open",
        json!({ "comm_id": "c2", "target_name": "table" }),
    ));

    let all = comm_info_reply(&fx, json!({}));
    assert_eq!(all["status"], json!("ok"));
    assert_eq!(all["comms"].as_object().unwrap().len(), 2);
    assert_eq!(all["comms"]["c1"], json!({ "target_name": "plot" }));

    let plots = comm_info_reply(&fx, json!({ "target_name": "plot" }));
    let comms = plots["comms"].as_object().unwrap();
    assert_eq!(comms.len(), 1);
    assert!(comms.contains_key("c1"));

    let closed = comm_info_reply(&fx, json!({ "target_name": "nope" }));
    assert_eq!(closed["comms"], json!({}));
}

#[test]
fn comm_info_forgets_closed_comms() {
    let (fx, _target) = with_target("plot");

    fx.core.dispatch_shell(request_frames(
        "comm_open",
        json!({ "comm_id": "c1", "target_name": "plot" }),
    ));
    fx.core
        .dispatch_shell(request_frames("comm_close", json!({ "comm_id": "c1" })));

    let info = comm_info_reply(&fx, json!({}));
    assert_eq!(info["comms"], json!({}));
}

#[test]
fn interpreter_side_send_broadcasts_comm_msg() {
    let (fx, _target) = with_target("plot");

    fx.core.dispatch_shell(request_frames(
        "comm_open",
        json!({ "comm_id": "c1", "target_name": "plot" }),
    ));

    assert!(fx.core.comms().send("c1", json!({ "frame": 7 })));

    let published = fx.transport.published.lock();
    let msg = decode_pub(published.last().unwrap());
    assert_eq!(msg.msg_type(), "comm_msg");
    assert_eq!(msg.content, json!({ "comm_id": "c1", "data": { "frame": 7 } }));

    drop(published);
    assert!(!fx.core.comms().send("nope", json!({})));
}
