pub mod incoming;
pub mod outgoing;

pub use incoming::{DataDisposition, IncomingMessages};
pub use outgoing::{OutgoingMessages, SendHandle, SendOutcome};

/// Scheduling class of an outgoing message. Lower is more urgent. This orders
///  application messages against each other - the session's own control queue
///  (handshake, pongs, acks) precedes all of them regardless.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum Priority {
    Control = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}
