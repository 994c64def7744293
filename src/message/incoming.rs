use std::collections::BTreeMap;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::error::ReceiveError;

/// How the assembler judged one `MessageData` fragment.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DataDisposition {
    /// no `New` announcement was seen for this id - the caller answers `Unknown`
    Unknown,
    /// stored (duplicates and overlaps included, last writer wins)
    Accepted { completed: bool },
    /// the fragment does not fit the announced message - the caller answers
    ///  with a `Repeat` ack for exactly this range
    Conflict { offset: u32, length: u32 },
}

struct IncomingMessage {
    expected_size: u32,
    buf: Vec<u8>,
    /// coalesced received ranges, start -> end (exclusive)
    received: BTreeMap<u32, u32>,
}

impl IncomingMessage {
    fn new(expected_size: u32) -> IncomingMessage {
        IncomingMessage {
            expected_size,
            buf: vec![0; expected_size as usize],
            received: BTreeMap::new(),
        }
    }

    fn is_complete(&self) -> bool {
        self.expected_size == 0 || self.received.get(&0) == Some(&self.expected_size)
    }

    fn insert_range(&mut self, mut start: u32, mut end: u32) {
        if let Some((&s, &e)) = self.received.range(..=start).next_back() {
            if e >= start {
                self.received.remove(&s);
                start = s;
                end = end.max(e);
            }
        }
        while let Some((&s, &e)) = self.received.range(start..).next() {
            if s > end {
                break;
            }
            self.received.remove(&s);
            end = end.max(e);
        }
        self.received.insert(start, end);
    }

    fn on_data(&mut self, offset: u32, payload: &[u8]) -> DataDisposition {
        let length = payload.len() as u32;
        if length == 0 || offset as u64 + length as u64 > self.expected_size as u64 {
            return DataDisposition::Conflict { offset, length };
        }
        self.buf[offset as usize..(offset + length) as usize].copy_from_slice(payload);
        self.insert_range(offset, offset + length);
        DataDisposition::Accepted { completed: self.is_complete() }
    }

    fn missing_ranges(&self) -> Vec<(u32, u32)> {
        let mut gaps = Vec::new();
        let mut cursor = 0u32;
        for (&start, &end) in &self.received {
            if start > cursor {
                gaps.push((cursor, start - cursor));
            }
            cursor = end;
        }
        if cursor < self.expected_size {
            gaps.push((cursor, self.expected_size - cursor));
        }
        gaps
    }
}

/// Per-session reassembly state of all partially received messages.
pub struct IncomingMessages {
    messages: FxHashMap<u64, IncomingMessage>,
}

impl IncomingMessages {
    pub fn new() -> IncomingMessages {
        IncomingMessages {
            messages: FxHashMap::default(),
        }
    }

    pub fn is_known(&self, message_id: u64) -> bool {
        self.messages.contains_key(&message_id)
    }

    pub fn is_complete(&self, message_id: u64) -> bool {
        self.messages
            .get(&message_id)
            .map(|m| m.is_complete())
            .unwrap_or(false)
    }

    /// Registers an announced message. A re-announcement with the same size is
    ///  a no-op; a different size discards whatever was assembled so far.
    pub fn on_new(&mut self, message_id: u64, expected_size: u32) {
        match self.messages.get(&message_id) {
            Some(m) if m.expected_size == expected_size => {
                trace!(message_id, "re-announcement with unchanged size");
            }
            Some(m) => {
                warn!(
                    message_id,
                    old_size = m.expected_size,
                    new_size = expected_size,
                    "re-announcement with a different size, resetting assembly"
                );
                self.messages.insert(message_id, IncomingMessage::new(expected_size));
            }
            None => {
                debug!(message_id, expected_size, "new incoming message");
                self.messages.insert(message_id, IncomingMessage::new(expected_size));
            }
        }
    }

    pub fn on_data(&mut self, message_id: u64, offset: u32, payload: &Bytes) -> DataDisposition {
        match self.messages.get_mut(&message_id) {
            None => DataDisposition::Unknown,
            Some(message) => message.on_data(offset, payload),
        }
    }

    /// The ranges still missing, coalesced and in ascending offset order.
    ///  Empty for a complete (or unknown) message.
    pub fn missing_ranges(&self, message_id: u64) -> Vec<(u32, u32)> {
        self.messages
            .get(&message_id)
            .map(|m| m.missing_ranges())
            .unwrap_or_default()
    }

    /// Hands out the assembled payload exactly once.
    pub fn take(&mut self, message_id: u64) -> Result<Vec<u8>, ReceiveError> {
        match self.messages.get(&message_id) {
            None => Err(ReceiveError::UnknownMessage(message_id)),
            Some(m) if !m.is_complete() => Err(ReceiveError::NotComplete(message_id)),
            Some(_) => {
                let message = self.messages.remove(&message_id).unwrap();
                Ok(message.buf)
            }
        }
    }

    /// discards assembly state, e.g. when the sender aborts
    pub fn drop_message(&mut self, message_id: u64) {
        if self.messages.remove(&message_id).is_some() {
            debug!(message_id, "dropped incoming message");
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
