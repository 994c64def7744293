use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

pub mod liveness;
pub mod node_session;
pub mod scheduler;

pub use liveness::LivenessMonitor;
pub use node_session::{NodeSession, SessionState};
pub use scheduler::Scheduler;

/// Identifies the remote peer of a session, i.e. the address the transport
///  uses to reach it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SessionKey(pub SocketAddr);

impl Display for SessionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
