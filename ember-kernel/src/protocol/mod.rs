//! Wire protocol: authentication and the multi-frame message codec.

mod auth;
mod message;

pub use auth::{Authenticator, SignatureScheme};
pub use message::{
    msg_type_of, utc_now, Header, Message, ProtocolError, PubMessage, DELIMITER,
    PROTOCOL_VERSION,
};
