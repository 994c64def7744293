use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::SendError;
use crate::message::Priority;
use crate::wire::{Block, CtlKind};

/// Terminal result of a submitted message, observable through its [SendHandle].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SendOutcome {
    Delivered,
    Canceled,
    Failed(SendError),
}

/// Single-assignment completion cell shared between a tracked message and the
///  handles pointing at it. The cancel flag is advisory: the tracker checks it
///  before selecting a fragment, never mid-transmission.
struct CompletionCell {
    outcome: watch::Sender<Option<SendOutcome>>,
    cancel_requested: AtomicBool,
}

impl CompletionCell {
    fn new() -> Arc<CompletionCell> {
        Arc::new(CompletionCell {
            outcome: watch::Sender::new(None),
            cancel_requested: AtomicBool::new(false),
        })
    }

    /// first resolution wins, later ones are no-ops
    fn resolve(&self, outcome: SendOutcome) -> bool {
        self.outcome.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(outcome);
                true
            } else {
                false
            }
        })
    }
}

/// Caller-side view of one submitted message. Cheap to clone; all clones
///  observe the same resolution.
#[derive(Clone)]
pub struct SendHandle {
    message_id: u64,
    cell: Arc<CompletionCell>,
    /// wakes the writer that polls the tracker, see [SendHandle::with_waker]
    waker: Option<Arc<Notify>>,
}

impl SendHandle {
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    /// attaches the writer's wakeup so cancellation is acted on right away
    ///  instead of at the writer's next deadline
    pub(crate) fn with_waker(mut self, waker: Arc<Notify>) -> SendHandle {
        self.waker = Some(waker);
        self
    }

    /// Requests cancellation. Fragments already handed to the transport are not
    ///  recalled; the message resolves as `Canceled` the next time the tracker
    ///  looks at it (unless it resolved some other way first).
    pub fn cancel(&self) {
        self.cell.cancel_requested.store(true, Ordering::Relaxed);
        if let Some(waker) = &self.waker {
            waker.notify_one();
        }
    }

    pub fn outcome(&self) -> Option<SendOutcome> {
        *self.cell.outcome.borrow()
    }

    pub async fn wait(&self) -> SendOutcome {
        let mut receiver = self.cell.outcome.subscribe();
        loop {
            if let Some(outcome) = *receiver.borrow_and_update() {
                return outcome;
            }
            if receiver.changed().await.is_err() {
                // the cell is kept alive by this handle, so this is unreachable,
                //  but degrade gracefully rather than panic
                return SendOutcome::Failed(SendError::SessionClosed);
            }
        }
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> Option<SendOutcome> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    length: u32,
    sent_at: Instant,
    retries: u32,
}

struct OutgoingMessage {
    id: u64,
    payload: Bytes,
    priority: Priority,
    created: Instant,

    /// start of the never-yet-sent tail
    next_offset: u32,
    in_flight: BTreeMap<u32, InFlight>,
    /// ranges the receiver asked to have resent, offset -> length
    repeat_queue: BTreeMap<u32, u32>,

    /// `New` was handed to the control stream
    announced: bool,
    /// `Sent` was handed to the control stream
    sent_announced: bool,
    /// last time this message put anything on the wire - gates `WhatsUp` probes
    last_activity: Instant,

    resolved: Option<SendOutcome>,
    cell: Arc<CompletionCell>,
}

impl OutgoingMessage {
    fn payload_size(&self) -> u32 {
        self.payload.len() as u32
    }

    fn is_fully_sent(&self) -> bool {
        self.next_offset == self.payload_size()
    }

    fn is_terminal(&self) -> bool {
        self.resolved.is_some()
    }

    fn resolve(&mut self, outcome: SendOutcome) -> bool {
        if self.resolved.is_some() {
            return false;
        }
        self.resolved = Some(outcome);
        self.in_flight.clear();
        self.repeat_queue.clear();
        self.cell.resolve(outcome)
    }

    fn fragment_block(&self, offset: u32, length: u32) -> Block {
        Block::MessageData {
            message_id: self.id,
            offset,
            payload: self.payload.slice(offset as usize..(offset + length) as usize),
        }
    }

    /// Pending control obligation of this message, if any: `New` before the
    ///  first fragment, `Sent` once the full payload has been transmitted, and
    ///  a `WhatsUp` probe when everything is out but the receiver stays silent.
    fn next_control(&mut self, retry_after: Duration, now: Instant) -> Option<Block> {
        if !self.announced {
            self.announced = true;
            self.last_activity = now;
            return Some(Block::MessageCtl {
                kind: CtlKind::New,
                message_id: self.id,
                aux: self.payload.len() as u64,
            });
        }
        if self.is_fully_sent() && !self.sent_announced {
            self.sent_announced = true;
            self.last_activity = now;
            return Some(Block::MessageCtl { kind: CtlKind::Sent, message_id: self.id, aux: 0 });
        }
        if self.is_fully_sent()
            && self.sent_announced
            && self.in_flight.is_empty()
            && self.repeat_queue.is_empty()
            && now.duration_since(self.last_activity) >= retry_after
        {
            self.last_activity = now;
            trace!(message_id = self.id, "probing delivery status");
            return Some(Block::MessageCtl { kind: CtlKind::WhatsUp, message_id: self.id, aux: 0 });
        }
        None
    }

    /// Next data fragment to put on the wire: receiver-requested repeats first,
    ///  then stale unacknowledged fragments, then the fresh tail. Candidates
    ///  larger than `max_data` are split, the remainder stays queued. `None`
    ///  means nothing is sendable *right now* - fully sent is not acknowledged.
    fn next_fragment(
        &mut self,
        max_data: usize,
        retry_after: Duration,
        max_retries: u32,
        now: Instant,
    ) -> Option<Block> {
        if let Some((&offset, &length)) = self.repeat_queue.iter().next() {
            self.repeat_queue.remove(&offset);
            let send_len = (length as usize).min(max_data) as u32;
            if send_len < length {
                self.repeat_queue.insert(offset + send_len, length - send_len);
            }
            self.in_flight.insert(offset, InFlight { length: send_len, sent_at: now, retries: 0 });
            self.last_activity = now;
            return Some(self.fragment_block(offset, send_len));
        }

        let stale = self
            .in_flight
            .iter()
            .find(|(_, f)| now.duration_since(f.sent_at) >= retry_after)
            .map(|(&offset, f)| (offset, *f));
        if let Some((offset, frag)) = stale {
            if frag.retries >= max_retries {
                warn!(
                    message_id = self.id,
                    offset, "fragment exceeded its retransmission budget"
                );
                self.resolve(SendOutcome::Failed(SendError::TimedOut));
                return None;
            }
            self.in_flight.remove(&offset);
            let send_len = (frag.length as usize).min(max_data) as u32;
            if send_len < frag.length {
                // the remainder was not resent, it keeps its old metadata
                self.in_flight.insert(
                    offset + send_len,
                    InFlight { length: frag.length - send_len, sent_at: frag.sent_at, retries: frag.retries },
                );
            }
            self.in_flight
                .insert(offset, InFlight { length: send_len, sent_at: now, retries: frag.retries + 1 });
            self.last_activity = now;
            trace!(message_id = self.id, offset, retries = frag.retries + 1, "retransmitting fragment");
            return Some(self.fragment_block(offset, send_len));
        }

        let remaining = self.payload_size() - self.next_offset;
        if remaining > 0 {
            let offset = self.next_offset;
            let send_len = (remaining as usize).min(max_data) as u32;
            self.next_offset += send_len;
            self.in_flight.insert(offset, InFlight { length: send_len, sent_at: now, retries: 0 });
            self.last_activity = now;
            return Some(self.fragment_block(offset, send_len));
        }

        None
    }

    /// drops every tracked range fully covered by the acknowledged one; returns
    ///  true if this acknowledgement completed the message
    fn on_ack(&mut self, offset: u32, length: u32) -> bool {
        let start = offset as u64;
        let end = start + length as u64;
        self.in_flight
            .retain(|&o, f| !(o as u64 >= start && o as u64 + f.length as u64 <= end));
        self.repeat_queue
            .retain(|&o, l| !(o as u64 >= start && o as u64 + *l as u64 <= end));

        if self.is_fully_sent()
            && !self.payload.is_empty()
            && self.in_flight.is_empty()
            && self.repeat_queue.is_empty()
        {
            self.resolve(SendOutcome::Delivered)
        } else {
            false
        }
    }

    fn on_repeat_request(&mut self, offset: u32, length: u32) {
        if length == 0 || offset as u64 + length as u64 > self.payload.len() as u64 {
            warn!(
                message_id = self.id,
                offset, length, "ignoring repeat request outside the payload"
            );
            return;
        }
        let start = offset as u64;
        let end = start + length as u64;
        self.in_flight
            .retain(|&o, f| !(o as u64 >= start && o as u64 + f.length as u64 <= end));
        let prev = self.repeat_queue.get(&offset).copied().unwrap_or(0);
        self.repeat_queue.insert(offset, prev.max(length));
    }

    /// The receiver lost track of this message: re-run the announcement
    ///  sequence. Already-transmitted data is not blindly resent - the receiver
    ///  answers the fresh `Sent` with repeat requests for whatever it misses.
    fn on_unknown(&mut self) {
        debug!(message_id = self.id, "peer does not know this message, re-announcing");
        self.announced = false;
        self.sent_announced = false;
    }

    /// earliest instant at which this message will have something to send
    fn next_deadline(&self, retry_after: Duration, now: Instant) -> Option<Instant> {
        if !self.announced
            || (self.is_fully_sent() && !self.sent_announced)
            || !self.repeat_queue.is_empty()
            || !self.is_fully_sent()
        {
            return Some(now);
        }
        let retransmit = self
            .in_flight
            .values()
            .map(|f| f.sent_at + retry_after)
            .min();
        if retransmit.is_some() {
            return retransmit;
        }
        // everything is out and acknowledged or in no queue: probe deadline
        Some(self.last_activity + retry_after)
    }
}

/// Per-session tracker of all outgoing messages. Selection across messages is
///  strictly by (priority, creation time, id).
pub struct OutgoingMessages {
    next_message_id: u64,
    messages: FxHashMap<u64, OutgoingMessage>,
    /// `ErrorSend` notices for messages that were canceled or timed out locally
    notices: Vec<Block>,
}

impl OutgoingMessages {
    pub fn new() -> OutgoingMessages {
        OutgoingMessages {
            next_message_id: 0,
            messages: FxHashMap::default(),
            notices: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn submit(&mut self, payload: Bytes, priority: Priority, now: Instant) -> (u64, SendHandle) {
        debug_assert!(payload.len() <= u32::MAX as usize);
        let id = self.next_message_id;
        self.next_message_id += 1;

        let cell = CompletionCell::new();
        self.messages.insert(
            id,
            OutgoingMessage {
                id,
                payload,
                priority,
                created: now,
                next_offset: 0,
                in_flight: BTreeMap::new(),
                repeat_queue: BTreeMap::new(),
                announced: false,
                sent_announced: false,
                last_activity: now,
                resolved: None,
                cell: cell.clone(),
            },
        );
        (id, SendHandle { message_id: id, cell, waker: None })
    }

    fn ordered_ids(&self) -> Vec<u64> {
        let mut keys = self
            .messages
            .values()
            .map(|m| (m.priority, m.created, m.id))
            .collect::<Vec<_>>();
        keys.sort();
        keys.into_iter().map(|(_, _, id)| id).collect()
    }

    /// resolves a cancellation request; returns false if the message stays live
    fn reap_if_canceled(&mut self, id: u64) -> bool {
        let message = match self.messages.get_mut(&id) {
            Some(m) => m,
            None => return true,
        };
        if message.cell.cancel_requested.load(Ordering::Relaxed) {
            if message.resolve(SendOutcome::Canceled) {
                debug!(message_id = id, "message canceled");
                self.notices.push(Block::MessageCtl { kind: CtlKind::ErrorSend, message_id: id, aux: 0 });
            }
            self.messages.remove(&id);
            return true;
        }
        false
    }

    /// Pending control block, most urgent message first. Error notices for
    ///  canceled / timed-out messages precede regular announcements.
    pub fn next_control(&mut self, retry_after: Duration, now: Instant) -> Option<Block> {
        if !self.notices.is_empty() {
            return Some(self.notices.remove(0));
        }
        for id in self.ordered_ids() {
            if self.reap_if_canceled(id) {
                if !self.notices.is_empty() {
                    return Some(self.notices.remove(0));
                }
                continue;
            }
            if let Some(block) = self.messages.get_mut(&id).and_then(|m| m.next_control(retry_after, now)) {
                return Some(block);
            }
        }
        None
    }

    /// Next data fragment across all messages. A message that exhausts its
    ///  retransmission budget here resolves as failed and queues an `ErrorSend`
    ///  notice; selection then moves on to the next message.
    pub fn next_fragment(
        &mut self,
        max_data: usize,
        retry_after: Duration,
        max_retries: u32,
        now: Instant,
    ) -> Option<Block> {
        for id in self.ordered_ids() {
            if self.reap_if_canceled(id) {
                continue;
            }
            let message = match self.messages.get_mut(&id) {
                Some(m) => m,
                None => continue,
            };
            let block = message.next_fragment(max_data, retry_after, max_retries, now);
            if message.is_terminal() {
                self.notices.push(Block::MessageCtl { kind: CtlKind::ErrorSend, message_id: id, aux: 0 });
                self.messages.remove(&id);
                continue;
            }
            if block.is_some() {
                return block;
            }
        }
        None
    }

    pub fn on_ack(&mut self, message_id: u64, offset: u32, length: u32) {
        if let Some(message) = self.messages.get_mut(&message_id) {
            if message.on_ack(offset, length) {
                debug!(message_id, "message fully acknowledged");
                self.messages.remove(&message_id);
            }
        } else {
            trace!(message_id, "ack for unknown message");
        }
    }

    pub fn on_repeat_request(&mut self, message_id: u64, offset: u32, length: u32) {
        if let Some(message) = self.messages.get_mut(&message_id) {
            message.on_repeat_request(offset, length);
        } else {
            trace!(message_id, "repeat request for unknown message");
        }
    }

    pub fn on_unknown(&mut self, message_id: u64) {
        if let Some(message) = self.messages.get_mut(&message_id) {
            message.on_unknown();
        }
    }

    /// the receiver confirmed full assembly
    pub fn on_peer_complete(&mut self, message_id: u64) {
        if let Some(mut message) = self.messages.remove(&message_id) {
            debug!(message_id, "peer confirmed delivery");
            message.resolve(SendOutcome::Delivered);
        }
    }

    /// the receiver aborted the message
    pub fn on_peer_error(&mut self, message_id: u64) {
        if let Some(mut message) = self.messages.remove(&message_id) {
            warn!(message_id, "peer reported a receive error");
            message.resolve(SendOutcome::Failed(SendError::PeerError));
        }
    }

    /// fails every live message, e.g. on session close - exactly-once per handle
    pub fn fail_all(&mut self, error: SendError) {
        for (_, mut message) in self.messages.drain() {
            message.resolve(SendOutcome::Failed(error));
        }
        self.notices.clear();
    }

    /// earliest instant at which any message will have work; `None` when idle
    pub fn next_deadline(&self, retry_after: Duration, now: Instant) -> Option<Instant> {
        if !self.notices.is_empty() {
            return Some(now);
        }
        self.messages
            .values()
            .filter_map(|m| m.next_deadline(retry_after, now))
            .min()
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    const RETRY_AFTER: Duration = Duration::from_millis(100);
    const MAX_RETRIES: u32 = 3;

    fn fragment(block: Block) -> (u64, u32, Bytes) {
        match block {
            Block::MessageData { message_id, offset, payload } => (message_id, offset, payload),
            other => panic!("expected MessageData, got {:?}", other),
        }
    }

    fn ctl(block: Block) -> (CtlKind, u64, u64) {
        match block {
            Block::MessageCtl { kind, message_id, aux } => (kind, message_id, aux),
            other => panic!("expected MessageCtl, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_announce_send_ack_lifecycle() {
        let t0 = Instant::now();
        let mut outgoing = OutgoingMessages::new();
        let (id, handle) = outgoing.submit(Bytes::from_static(b"hello world"), Priority::Normal, t0);

        assert_eq!(ctl(outgoing.next_control(RETRY_AFTER, t0).unwrap()), (CtlKind::New, id, 11));
        assert!(outgoing.next_control(RETRY_AFTER, t0).is_none());

        let (mid, offset, payload) = fragment(outgoing.next_fragment(6, RETRY_AFTER, MAX_RETRIES, t0).unwrap());
        assert_eq!((mid, offset, payload.as_ref()), (id, 0, b"hello ".as_ref()));
        let (_, offset, payload) = fragment(outgoing.next_fragment(6, RETRY_AFTER, MAX_RETRIES, t0).unwrap());
        assert_eq!((offset, payload.as_ref()), (6, b"world".as_ref()));
        assert!(outgoing.next_fragment(6, RETRY_AFTER, MAX_RETRIES, t0).is_none());

        assert_eq!(ctl(outgoing.next_control(RETRY_AFTER, t0).unwrap()), (CtlKind::Sent, id, 0));

        outgoing.on_ack(id, 0, 6);
        assert_eq!(handle.outcome(), None);
        outgoing.on_ack(id, 6, 5);
        assert_eq!(handle.outcome(), Some(SendOutcome::Delivered));
        assert!(outgoing.is_empty());
    }

    #[rstest]
    #[case::exact_multiple(8, 4, vec![(0, 4), (4, 4)])]
    #[case::remainder(10, 4, vec![(0, 4), (4, 4), (8, 2)])]
    #[case::single(3, 4, vec![(0, 3)])]
    fn test_fragmentation(#[case] payload_len: usize, #[case] max_data: usize, #[case] expected: Vec<(u32, usize)>) {
        let t0 = Instant::now();
        let mut outgoing = OutgoingMessages::new();
        let payload = Bytes::from(vec![7u8; payload_len]);
        outgoing.submit(payload, Priority::Normal, t0);
        outgoing.next_control(RETRY_AFTER, t0);

        let mut actual = Vec::new();
        while let Some(block) = outgoing.next_fragment(max_data, RETRY_AFTER, MAX_RETRIES, t0) {
            let (_, offset, payload) = fragment(block);
            actual.push((offset, payload.len()));
        }
        assert_eq!(actual, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fragment_is_retransmitted() {
        let t0 = Instant::now();
        let mut outgoing = OutgoingMessages::new();
        let (id, _handle) = outgoing.submit(Bytes::from_static(b"abcd"), Priority::Normal, t0);
        outgoing.next_control(RETRY_AFTER, t0);
        fragment(outgoing.next_fragment(16, RETRY_AFTER, MAX_RETRIES, t0).unwrap());

        // not stale yet
        assert!(outgoing.next_fragment(16, RETRY_AFTER, MAX_RETRIES, t0 + Duration::from_millis(99)).is_none());

        let (mid, offset, payload) = fragment(
            outgoing.next_fragment(16, RETRY_AFTER, MAX_RETRIES, t0 + RETRY_AFTER).unwrap(),
        );
        assert_eq!((mid, offset, payload.as_ref()), (id, 0, b"abcd".as_ref()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_fails_the_message() {
        let t0 = Instant::now();
        let mut outgoing = OutgoingMessages::new();
        let (id, handle) = outgoing.submit(Bytes::from_static(b"abcd"), Priority::Normal, t0);
        outgoing.next_control(RETRY_AFTER, t0);

        let mut now = t0;
        fragment(outgoing.next_fragment(16, RETRY_AFTER, MAX_RETRIES, now).unwrap());
        for _ in 0..MAX_RETRIES {
            now += RETRY_AFTER;
            fragment(outgoing.next_fragment(16, RETRY_AFTER, MAX_RETRIES, now).unwrap());
        }
        now += RETRY_AFTER;
        assert!(outgoing.next_fragment(16, RETRY_AFTER, MAX_RETRIES, now).is_none());

        assert_eq!(handle.outcome(), Some(SendOutcome::Failed(SendError::TimedOut)));
        assert_eq!(ctl(outgoing.next_control(RETRY_AFTER, now).unwrap()), (CtlKind::ErrorSend, id, 0));
        assert!(outgoing.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_request_precedes_fresh_data() {
        let t0 = Instant::now();
        let mut outgoing = OutgoingMessages::new();
        let (id, _handle) = outgoing.submit(Bytes::from(vec![1u8; 20]), Priority::Normal, t0);
        outgoing.next_control(RETRY_AFTER, t0);
        fragment(outgoing.next_fragment(8, RETRY_AFTER, MAX_RETRIES, t0).unwrap());

        outgoing.on_repeat_request(id, 2, 4);
        let (_, offset, payload) = fragment(outgoing.next_fragment(8, RETRY_AFTER, MAX_RETRIES, t0).unwrap());
        assert_eq!((offset, payload.len()), (2, 4));

        // then back to the fresh tail
        let (_, offset, _) = fragment(outgoing.next_fragment(8, RETRY_AFTER, MAX_RETRIES, t0).unwrap());
        assert_eq!(offset, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_repeat_request_is_split() {
        let t0 = Instant::now();
        let mut outgoing = OutgoingMessages::new();
        let (id, _handle) = outgoing.submit(Bytes::from(vec![1u8; 20]), Priority::Normal, t0);
        outgoing.next_control(RETRY_AFTER, t0);
        while outgoing.next_fragment(8, RETRY_AFTER, MAX_RETRIES, t0).is_some() {}

        outgoing.on_repeat_request(id, 0, 20);
        let (_, offset, payload) = fragment(outgoing.next_fragment(8, RETRY_AFTER, MAX_RETRIES, t0).unwrap());
        assert_eq!((offset, payload.len()), (0, 8));
        let (_, offset, payload) = fragment(outgoing.next_fragment(8, RETRY_AFTER, MAX_RETRIES, t0).unwrap());
        assert_eq!((offset, payload.len()), (8, 8));
        let (_, offset, payload) = fragment(outgoing.next_fragment(8, RETRY_AFTER, MAX_RETRIES, t0).unwrap());
        assert_eq!((offset, payload.len()), (16, 4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_ack_keeps_uncovered_ranges() {
        let t0 = Instant::now();
        let mut outgoing = OutgoingMessages::new();
        let (id, handle) = outgoing.submit(Bytes::from(vec![1u8; 16]), Priority::Normal, t0);
        outgoing.next_control(RETRY_AFTER, t0);
        while outgoing.next_fragment(8, RETRY_AFTER, MAX_RETRIES, t0).is_some() {}

        // covers only the first fragment; the second stays in flight
        outgoing.on_ack(id, 0, 8);
        assert_eq!(handle.outcome(), None);

        // an ack that only partially covers the remaining fragment drops nothing
        outgoing.on_ack(id, 8, 4);
        assert_eq!(handle.outcome(), None);

        outgoing.on_ack(id, 8, 8);
        assert_eq!(handle.outcome(), Some(SendOutcome::Delivered));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_resolves_once_and_notifies_peer() {
        let t0 = Instant::now();
        let mut outgoing = OutgoingMessages::new();
        let (id, handle) = outgoing.submit(Bytes::from_static(b"abcd"), Priority::Normal, t0);
        outgoing.next_control(RETRY_AFTER, t0);

        handle.cancel();
        assert!(outgoing.next_fragment(16, RETRY_AFTER, MAX_RETRIES, t0).is_none());
        assert_eq!(handle.outcome(), Some(SendOutcome::Canceled));
        assert_eq!(ctl(outgoing.next_control(RETRY_AFTER, t0).unwrap()), (CtlKind::ErrorSend, id, 0));

        // late peer traffic must not re-resolve
        outgoing.on_peer_complete(id);
        assert_eq!(handle.outcome(), Some(SendOutcome::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wakes_the_attached_waker() {
        let t0 = Instant::now();
        let mut outgoing = OutgoingMessages::new();
        let waker = Arc::new(Notify::new());
        let (_, handle) = outgoing.submit(Bytes::from_static(b"x"), Priority::Normal, t0);
        let handle = handle.with_waker(waker.clone());

        handle.cancel();
        // the stored permit means a parked writer wakes immediately
        tokio::time::timeout(Duration::from_millis(10), waker.notified())
            .await
            .unwrap();
        assert!(outgoing.next_fragment(16, RETRY_AFTER, MAX_RETRIES, t0).is_none());
        assert_eq!(handle.outcome(), Some(SendOutcome::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_triggers_reannouncement() {
        let t0 = Instant::now();
        let mut outgoing = OutgoingMessages::new();
        let (id, _handle) = outgoing.submit(Bytes::from_static(b"ab"), Priority::Normal, t0);
        assert_eq!(ctl(outgoing.next_control(RETRY_AFTER, t0).unwrap()).0, CtlKind::New);
        fragment(outgoing.next_fragment(16, RETRY_AFTER, MAX_RETRIES, t0).unwrap());
        assert_eq!(ctl(outgoing.next_control(RETRY_AFTER, t0).unwrap()).0, CtlKind::Sent);
        assert!(outgoing.next_control(RETRY_AFTER, t0).is_none());

        outgoing.on_unknown(id);
        assert_eq!(ctl(outgoing.next_control(RETRY_AFTER, t0).unwrap()), (CtlKind::New, id, 2));
        assert_eq!(ctl(outgoing.next_control(RETRY_AFTER, t0).unwrap()), (CtlKind::Sent, id, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_message_completes_via_peer_complete_only() {
        let t0 = Instant::now();
        let mut outgoing = OutgoingMessages::new();
        let (id, handle) = outgoing.submit(Bytes::new(), Priority::Normal, t0);

        assert_eq!(ctl(outgoing.next_control(RETRY_AFTER, t0).unwrap()), (CtlKind::New, id, 0));
        assert_eq!(ctl(outgoing.next_control(RETRY_AFTER, t0).unwrap()), (CtlKind::Sent, id, 0));
        assert!(outgoing.next_fragment(16, RETRY_AFTER, MAX_RETRIES, t0).is_none());
        assert_eq!(handle.outcome(), None);

        outgoing.on_peer_complete(id);
        assert_eq!(handle.outcome(), Some(SendOutcome::Delivered));
    }

    #[tokio::test(start_paused = true)]
    async fn test_whats_up_probe_after_silence() {
        let t0 = Instant::now();
        let mut outgoing = OutgoingMessages::new();
        // an empty message is fully sent right away but can only complete via
        //  the peer's Complete - if that never arrives, the sender probes
        let (id, _handle) = outgoing.submit(Bytes::new(), Priority::Normal, t0);
        assert_eq!(ctl(outgoing.next_control(RETRY_AFTER, t0).unwrap()), (CtlKind::New, id, 0));
        assert_eq!(ctl(outgoing.next_control(RETRY_AFTER, t0).unwrap()), (CtlKind::Sent, id, 0));
        assert!(outgoing.next_control(RETRY_AFTER, t0).is_none());

        let later = t0 + RETRY_AFTER;
        assert_eq!(ctl(outgoing.next_control(RETRY_AFTER, later).unwrap()), (CtlKind::WhatsUp, id, 0));
        // throttled: the next probe is due one interval later
        assert!(outgoing.next_control(RETRY_AFTER, later).is_none());
        assert_eq!(ctl(outgoing.next_control(RETRY_AFTER, later + RETRY_AFTER).unwrap()).0, CtlKind::WhatsUp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_then_age_ordering() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(1);
        let mut outgoing = OutgoingMessages::new();
        let (id_low, _h1) = outgoing.submit(Bytes::from_static(b"low"), Priority::Low, t0);
        let (id_high, _h2) = outgoing.submit(Bytes::from_static(b"hi1"), Priority::High, t0);
        let (id_high_later, _h3) = outgoing.submit(Bytes::from_static(b"hi2"), Priority::High, t1);

        // announcements follow the same ordering
        assert_eq!(ctl(outgoing.next_control(RETRY_AFTER, t1).unwrap()).1, id_high);
        assert_eq!(ctl(outgoing.next_control(RETRY_AFTER, t1).unwrap()).1, id_high_later);
        assert_eq!(ctl(outgoing.next_control(RETRY_AFTER, t1).unwrap()).1, id_low);

        assert_eq!(fragment(outgoing.next_fragment(16, RETRY_AFTER, MAX_RETRIES, t1).unwrap()).0, id_high);
        assert_eq!(fragment(outgoing.next_fragment(16, RETRY_AFTER, MAX_RETRIES, t1).unwrap()).0, id_high_later);
        assert_eq!(fragment(outgoing.next_fragment(16, RETRY_AFTER, MAX_RETRIES, t1).unwrap()).0, id_low);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_all_resolves_every_handle_once() {
        let t0 = Instant::now();
        let mut outgoing = OutgoingMessages::new();
        let (_, h1) = outgoing.submit(Bytes::from_static(b"a"), Priority::Normal, t0);
        let (id2, h2) = outgoing.submit(Bytes::from_static(b"b"), Priority::Normal, t0);
        outgoing.on_peer_complete(id2);

        outgoing.fail_all(SendError::SessionClosed);
        assert_eq!(h1.outcome(), Some(SendOutcome::Failed(SendError::SessionClosed)));
        assert_eq!(h2.outcome(), Some(SendOutcome::Delivered));
        assert!(outgoing.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_deadline() {
        let t0 = Instant::now();
        let mut outgoing = OutgoingMessages::new();
        assert_eq!(outgoing.next_deadline(RETRY_AFTER, t0), None);

        let (_, _handle) = outgoing.submit(Bytes::from_static(b"abcd"), Priority::Normal, t0);
        // unannounced: ready immediately
        assert_eq!(outgoing.next_deadline(RETRY_AFTER, t0), Some(t0));

        outgoing.next_control(RETRY_AFTER, t0);
        fragment(outgoing.next_fragment(16, RETRY_AFTER, MAX_RETRIES, t0).unwrap());
        // `Sent` announcement pending: still immediate
        assert_eq!(outgoing.next_deadline(RETRY_AFTER, t0), Some(t0));
        outgoing.next_control(RETRY_AFTER, t0);

        // now the only work is the retransmission of the in-flight fragment
        assert_eq!(outgoing.next_deadline(RETRY_AFTER, t0), Some(t0 + RETRY_AFTER));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_resolves_and_wait_timeout_expires() {
        let t0 = Instant::now();
        let mut outgoing = OutgoingMessages::new();
        let (id, handle) = outgoing.submit(Bytes::from_static(b"a"), Priority::Normal, t0);

        assert_eq!(handle.wait_timeout(Duration::from_millis(10)).await, None);

        outgoing.on_peer_complete(id);
        assert_eq!(handle.wait().await, SendOutcome::Delivered);
        assert_eq!(handle.wait_timeout(Duration::from_millis(1)).await, Some(SendOutcome::Delivered));
    }
}
