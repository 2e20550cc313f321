//! Wire message signing and verification.
//!
//! SECURITY: every signed section of a wire message carries a keyed MAC over
//! the header, parent header, metadata, and content frames, in that order.
//! An empty session key disables signing entirely; in that mode the
//! signature frame must be empty as well.

use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};

/// MAC algorithm used for the signature frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SignatureScheme {
    #[default]
    HmacSha256,
    HmacSha512,
}

impl SignatureScheme {
    /// Parse a scheme name as it appears in session key configuration.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "hmac-sha256" => Some(Self::HmacSha256),
            "hmac-sha512" => Some(Self::HmacSha512),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HmacSha256 => "hmac-sha256",
            Self::HmacSha512 => "hmac-sha512",
        }
    }
}

/// Signs and verifies the signed section of wire messages.
#[derive(Debug, Clone)]
pub struct Authenticator {
    key: Vec<u8>,
    scheme: SignatureScheme,
}

impl Authenticator {
    pub fn new(key: impl Into<Vec<u8>>, scheme: SignatureScheme) -> Self {
        Self { key: key.into(), scheme }
    }

    /// An authenticator with no key: signing disabled.
    pub fn unsigned() -> Self {
        Self { key: Vec::new(), scheme: SignatureScheme::default() }
    }

    pub fn is_enabled(&self) -> bool {
        !self.key.is_empty()
    }

    /// Hex-encoded MAC over the given frames, in order.
    ///
    /// Returns the empty string when signing is disabled.
    pub fn sign(&self, frames: &[&[u8]]) -> String {
        if self.key.is_empty() {
            return String::new();
        }
        match self.scheme {
            SignatureScheme::HmacSha256 => {
                hex::encode(sha256_mac(&self.key, frames).finalize().into_bytes())
            }
            SignatureScheme::HmacSha512 => {
                hex::encode(sha512_mac(&self.key, frames).finalize().into_bytes())
            }
        }
    }

    /// Constant-time verification of a hex signature over the given frames.
    ///
    /// With signing disabled, only the empty signature is accepted.
    pub fn verify(&self, frames: &[&[u8]], signature: &str) -> bool {
        if self.key.is_empty() {
            return signature.is_empty();
        }
        let Ok(decoded) = hex::decode(signature) else {
            return false;
        };
        // verify_slice is constant-time over the digest bytes.
        match self.scheme {
            SignatureScheme::HmacSha256 => {
                sha256_mac(&self.key, frames).verify_slice(&decoded).is_ok()
            }
            SignatureScheme::HmacSha512 => {
                sha512_mac(&self.key, frames).verify_slice(&decoded).is_ok()
            }
        }
    }
}

fn sha256_mac(key: &[u8], frames: &[&[u8]]) -> Hmac<Sha256> {
    // HMAC accepts keys of any length.
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC key length");
    for frame in frames {
        mac.update(frame);
    }
    mac
}

fn sha512_mac(key: &[u8], frames: &[&[u8]]) -> Hmac<Sha512> {
    let mut mac = Hmac::<Sha512>::new_from_slice(key).expect("HMAC key length");
    for frame in frames {
        mac.update(frame);
    }
    mac
}
