//! Wire format for the multi-frame messaging protocol.
//!
//! A routed message on the wire is an ordered list of byte frames:
//!
//! ```text
//! [identity, ...] <IDS|MSG> signature header parent_header metadata content [buffer, ...]
//! ```
//!
//! The `<IDS|MSG>` delimiter separates opaque routing identities from the
//! signed section. The signature frame is the hex MAC over the four JSON
//! frames that follow it. Broadcast messages replace the identity prefix
//! with a single topic frame.
//!
//! The signer MACs the exact byte buffers it emits and the verifier checks
//! the MAC over the raw frames before parsing them, so both sides agree on
//! the signed bytes without a canonical-JSON contract.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::auth::Authenticator;

/// Frame separating routing identities from the signed section.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

/// Messaging protocol version advertised in every header.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Errors produced while decoding a wire message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("missing <IDS|MSG> delimiter frame")]
    MalformedFrame,

    #[error("expected signature and four signed frames after delimiter, got {0}")]
    Truncated(usize),

    #[error("signature verification failed")]
    BadSignature,

    #[error("invalid JSON in signed frame: {0}")]
    BadJson(#[from] serde_json::Error),
}

/// Message header. Minted fresh (new `msg_id`, current UTC date) for every
/// outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub msg_type: String,
    pub username: String,
    pub session: String,
    pub date: String,
    pub version: String,
}

impl Header {
    pub fn new(msg_type: &str, username: &str, session: &str) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            msg_type: msg_type.to_string(),
            username: username.to_string(),
            session: session.to_string(),
            date: utc_now(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Default::default()))
    }
}

/// Current time as RFC 3339 UTC with microsecond precision.
pub fn utc_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// `msg_type` field of a header value, or `""` when absent.
pub fn msg_type_of(header: &Value) -> &str {
    header.get("msg_type").and_then(Value::as_str).unwrap_or("")
}

/// A routed (shell / control / stdin) message in structured form.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub identities: Vec<Vec<u8>>,
    pub header: Value,
    pub parent_header: Value,
    pub metadata: Value,
    pub content: Value,
    pub buffers: Vec<Vec<u8>>,
}

impl Message {
    pub fn new(
        identities: Vec<Vec<u8>>,
        header: Header,
        parent_header: Value,
        metadata: Value,
        content: Value,
    ) -> Self {
        Self {
            identities,
            header: header.into_value(),
            parent_header,
            metadata,
            content,
            buffers: Vec::new(),
        }
    }

    pub fn msg_type(&self) -> &str {
        msg_type_of(&self.header)
    }

    /// Parse a message from wire frames, verifying its signature.
    pub fn deserialize(frames: &[Vec<u8>], auth: &Authenticator) -> Result<Self, ProtocolError> {
        let (identities, rest) = split_identities(frames)?;
        let (signed, buffers) = check_signature(rest, auth)?;

        Ok(Self {
            identities: identities.to_vec(),
            header: serde_json::from_slice(&signed[0])?,
            parent_header: serde_json::from_slice(&signed[1])?,
            metadata: serde_json::from_slice(&signed[2])?,
            content: serde_json::from_slice(&signed[3])?,
            buffers: buffers.to_vec(),
        })
    }

    /// Emit wire frames, signing the exact bytes placed on the wire.
    pub fn serialize(&self, auth: &Authenticator) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let signed = encode_signed_section(
            &self.header,
            &self.parent_header,
            &self.metadata,
            &self.content,
            auth,
        )?;

        let mut frames =
            Vec::with_capacity(self.identities.len() + signed.len() + self.buffers.len() + 1);
        frames.extend(self.identities.iter().cloned());
        frames.push(DELIMITER.to_vec());
        frames.extend(signed);
        frames.extend(self.buffers.iter().cloned());
        Ok(frames)
    }
}

/// A broadcast message: a topic frame instead of routing identities.
#[derive(Debug, Clone, PartialEq)]
pub struct PubMessage {
    pub topic: String,
    pub header: Value,
    pub parent_header: Value,
    pub metadata: Value,
    pub content: Value,
    pub buffers: Vec<Vec<u8>>,
}

impl PubMessage {
    pub fn new(topic: String, header: Header, parent_header: Value, metadata: Value, content: Value) -> Self {
        Self {
            topic,
            header: header.into_value(),
            parent_header,
            metadata,
            content,
            buffers: Vec::new(),
        }
    }

    pub fn msg_type(&self) -> &str {
        msg_type_of(&self.header)
    }

    pub fn deserialize(frames: &[Vec<u8>], auth: &Authenticator) -> Result<Self, ProtocolError> {
        let (prefix, rest) = split_identities(frames)?;
        let topic = prefix
            .first()
            .and_then(|f| std::str::from_utf8(f).ok())
            .ok_or(ProtocolError::MalformedFrame)?
            .to_string();
        let (signed, buffers) = check_signature(rest, auth)?;

        Ok(Self {
            topic,
            header: serde_json::from_slice(&signed[0])?,
            parent_header: serde_json::from_slice(&signed[1])?,
            metadata: serde_json::from_slice(&signed[2])?,
            content: serde_json::from_slice(&signed[3])?,
            buffers: buffers.to_vec(),
        })
    }

    pub fn serialize(&self, auth: &Authenticator) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let signed = encode_signed_section(
            &self.header,
            &self.parent_header,
            &self.metadata,
            &self.content,
            auth,
        )?;

        let mut frames = Vec::with_capacity(signed.len() + self.buffers.len() + 2);
        frames.push(self.topic.clone().into_bytes());
        frames.push(DELIMITER.to_vec());
        frames.extend(signed);
        frames.extend(self.buffers.iter().cloned());
        Ok(frames)
    }
}

/// Split frames at the delimiter. Returns the prefix and everything after.
fn split_identities(frames: &[Vec<u8>]) -> Result<(&[Vec<u8>], &[Vec<u8>]), ProtocolError> {
    let at = frames
        .iter()
        .position(|f| f == DELIMITER)
        .ok_or(ProtocolError::MalformedFrame)?;
    Ok((&frames[..at], &frames[at + 1..]))
}

/// Validate the signature over the four signed frames following it.
///
/// `rest` starts at the signature frame. Returns the signed frames and the
/// trailing buffers.
fn check_signature<'a>(
    rest: &'a [Vec<u8>],
    auth: &Authenticator,
) -> Result<(&'a [Vec<u8>], &'a [Vec<u8>]), ProtocolError> {
    if rest.len() < 5 {
        return Err(ProtocolError::Truncated(rest.len().saturating_sub(1)));
    }
    let signature =
        std::str::from_utf8(&rest[0]).map_err(|_| ProtocolError::BadSignature)?;
    let signed = &rest[1..5];
    let signed_refs: Vec<&[u8]> = signed.iter().map(Vec::as_slice).collect();
    if !auth.verify(&signed_refs, signature) {
        return Err(ProtocolError::BadSignature);
    }
    Ok((signed, &rest[5..]))
}

/// Encode the signed section: signature frame plus the four JSON frames.
fn encode_signed_section(
    header: &Value,
    parent_header: &Value,
    metadata: &Value,
    content: &Value,
    auth: &Authenticator,
) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let header = serde_json::to_vec(header)?;
    let parent = serde_json::to_vec(parent_header)?;
    let metadata = serde_json::to_vec(metadata)?;
    let content = serde_json::to_vec(content)?;
    let signature = auth.sign(&[&header, &parent, &metadata, &content]);

    Ok(vec![signature.into_bytes(), header, parent, metadata, content])
}
