use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;
use tracing::{trace, warn};

/// A [MessageKind] travels as the first eight bytes of every application
///  payload and selects the listeners on the receiving side.
///
/// Technically a u64, but intended to hold up to eight ASCII characters so it
///  stays human-readable at the wire level.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageKind(pub u64);

impl MessageKind {
    pub const fn new(value: &[u8; 8]) -> MessageKind {
        Self(u64::from_be_bytes(*value))
    }
}

impl Debug for MessageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.to_be_bytes();
        let used = bytes
            .iter()
            .position(|&b| b == 0)
            .map(|len| &bytes[..len])
            .unwrap_or(&bytes);

        let string_repr = std::str::from_utf8(used).unwrap_or("???");

        write!(f, "0x{:016X}({:?})", self.0, string_repr)
    }
}

/// Dispatch order among the listeners of one kind: levels are visited
///  ascending, and a consuming listener stops the descent.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ListenerLevel(pub u8);

impl ListenerLevel {
    pub const FIRST: ListenerLevel = ListenerLevel(0);
    pub const DEFAULT: ListenerLevel = ListenerLevel(100);
    pub const LAST: ListenerLevel = ListenerLevel(u8::MAX);
}

/// Application callback for delivered messages of one registered kind.
///
/// This is a blocking call, holding up the central receive loop. Non-trivial
///  work should be offloaded to asynchronous processing.
#[async_trait::async_trait]
pub trait MessageListener: 'static + Sync + Send {
    /// returns true if the message is consumed - listeners at higher levels
    ///  then don't see it
    async fn on_message(&self, from: SocketAddr, kind: MessageKind, payload: &[u8]) -> bool;
}

/// Explicit registry mapping message kinds to listeners. Registration is
///  explicit and typed; there is no reflective discovery of handlers.
pub struct Dispatcher {
    listeners: RwLock<FxHashMap<MessageKind, Vec<(ListenerLevel, Arc<dyn MessageListener>)>>>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher {
            listeners: RwLock::new(FxHashMap::default()),
        }
    }

    /// Registers a listener. Listeners at the same level are visited in
    ///  registration order.
    pub fn register(&self, kind: MessageKind, level: ListenerLevel, listener: Arc<dyn MessageListener>) {
        let mut listeners = self.listeners.write().expect("dispatcher lock poisoned");
        let entry = listeners.entry(kind).or_default();
        let insert_at = entry.partition_point(|(l, _)| *l <= level);
        entry.insert(insert_at, (level, listener));
    }

    /// Delivers one message to the registered listeners, levels ascending,
    ///  stopping at the first consumer. Returns whether anyone consumed it.
    pub async fn dispatch(&self, from: SocketAddr, kind: MessageKind, payload: &[u8]) -> bool {
        let chain = {
            let listeners = self.listeners.read().expect("dispatcher lock poisoned");
            match listeners.get(&kind) {
                Some(entry) => entry.iter().map(|(_, l)| l.clone()).collect::<Vec<_>>(),
                None => {
                    warn!(?kind, "no listener registered for message kind, dropping");
                    return false;
                }
            }
        };

        for listener in chain {
            if listener.on_message(from, kind, payload).await {
                trace!(?kind, "message consumed");
                return true;
            }
        }
        false
    }
}
