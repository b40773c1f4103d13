//! Wire protocol codec
//!
//! Byte-exact encoding and decoding of overlay messages. The layouts
//! here are interoperability contracts with the reference network:
//! discriminator byte first, multi-byte integers big-endian, variable
//! length fields carry a u16 big-endian length prefix. Any deviation
//! breaks cross-implementation compatibility, so nothing in this
//! module goes through serde.

mod messages;

pub use messages::{
    Create, Created, Data, Destroy, Extend, Extended, GossipPeer, IntroductionRequest,
    IntroductionResponse, Message, MessageKind, Ping, Pong, Puncture, PunctureRequest,
    SIGNATURE_LEN,
};

/// Wire codec errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    /// Message shorter than its kind's minimum length, or a length
    /// prefix pointing past the end of the buffer.
    #[error("Malformed {kind} message: {reason}")]
    Format { kind: &'static str, reason: String },

    /// Discriminator we do not understand. Dropped (non-fatal) at
    /// dispatch.
    #[error("Unknown message kind: {0}")]
    UnknownKind(u8),
}

impl WireError {
    pub(crate) fn format(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::Format {
            kind,
            reason: reason.into(),
        }
    }
}
