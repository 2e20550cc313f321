//! Request context threaded through handlers.

use serde_json::Value;

use crate::protocol::Message;

/// Request/reply channel a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Shell,
    Control,
}

/// Identities and header of the request currently being served, recorded so
/// that interpreter upcalls (publications, stdin prompts) issued outside a
/// handler's scope can still be parented correctly.
#[derive(Debug, Clone)]
pub struct ParentContext {
    pub identities: Vec<Vec<u8>>,
    pub header: Value,
}

impl Default for ParentContext {
    fn default() -> Self {
        Self {
            identities: Vec::new(),
            header: Value::Object(Default::default()),
        }
    }
}

/// Everything a handler needs to correlate its replies: the request's
/// routing identities, its header, and the channel to answer on.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub identities: Vec<Vec<u8>>,
    pub header: Value,
    pub channel: Channel,
}

impl RequestContext {
    pub fn new(message: &Message, channel: Channel) -> Self {
        Self {
            identities: message.identities.clone(),
            header: message.header.clone(),
            channel,
        }
    }

    pub fn parent(&self) -> ParentContext {
        ParentContext {
            identities: self.identities.clone(),
            header: self.header.clone(),
        }
    }
}
