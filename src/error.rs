use thiserror::Error;

/// Errors raised while decoding a wire block. A decode error is local to the one
///  block that carried it: the reader logs and drops the block and keeps going.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown block tag {0}")]
    UnknownTag(i8),

    #[error("unknown {field} discriminator {value}")]
    UnknownDiscriminator { field: &'static str, value: u8 },

    #[error("truncated block")]
    Truncated,

    #[error("embedded length {length} exceeds remaining buffer of {remaining} bytes")]
    LengthOutOfBounds { length: usize, remaining: usize },

    #[error("sub-block leaves {0} undecoded trailing bytes in its slot")]
    TrailingBytes(usize),
}

/// Terminal failure of an outgoing message, surfaced through its [crate::message::SendHandle].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("session is closed")]
    SessionClosed,

    #[error("no session registered under this key")]
    UnknownSession,

    #[error("payload exceeds the configured maximum message size")]
    TooLarge,

    #[error("message exceeded its retransmission budget")]
    TimedOut,

    #[error("peer reported a receive error for this message")]
    PeerError,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveError {
    #[error("message {0} is unknown")]
    UnknownMessage(u64),

    #[error("message {0} is not completely received yet")]
    NotComplete(u64),
}
