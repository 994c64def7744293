use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashSet;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::ProtocolConfig;
use crate::error::SendError;
use crate::message::{DataDisposition, IncomingMessages, OutgoingMessages, Priority, SendHandle};
use crate::session::{LivenessMonitor, SessionKey};
use crate::wire::{AckKind, Block, CtlKind, HelloKind, PingKind};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionState {
    /// nothing happened yet - no handshake traffic in either direction
    PreConnection,
    /// handshake in progress, filters may negotiate their state
    FilterInitiation,
    Open,
    /// terminal and sticky
    Closed,
}

/// Protocol state for one remote peer: handshake, message tracking in both
///  directions, liveness, and the queue of pending control blocks.
///
/// Sessions are driven from outside: the reader feeds [NodeSession::on_block],
///  the writer polls [NodeSession::poll_control] / [NodeSession::poll_app_data].
///  All methods take `now` explicitly; the session never reads the clock.
pub struct NodeSession {
    config: Arc<ProtocolConfig>,
    key: SessionKey,
    created: Instant,

    state: SessionState,
    hello_sent: bool,
    hello_received: bool,

    /// handshake responses, pongs, acks and ctl answers, in arrival order
    control_queue: VecDeque<Block>,
    outgoing: OutgoingMessages,
    incoming: IncomingMessages,
    /// ids already delivered to the application - a retransmitted probe for one
    ///  of these is answered `Complete` instead of `Unknown`
    completed: FxHashSet<u64>,
    liveness: LivenessMonitor,
}

impl NodeSession {
    pub fn new(key: SessionKey, config: Arc<ProtocolConfig>, now: Instant) -> NodeSession {
        NodeSession {
            config: config.clone(),
            key,
            created: now,
            state: SessionState::PreConnection,
            hello_sent: false,
            hello_received: false,
            control_queue: VecDeque::new(),
            outgoing: OutgoingMessages::new(),
            incoming: IncomingMessages::new(),
            completed: FxHashSet::default(),
            liveness: LivenessMonitor::new(config),
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// closed with nothing left to flush - safe to drop
    pub fn is_defunct(&self) -> bool {
        self.state == SessionState::Closed && self.control_queue.is_empty()
    }

    /// Starts the handshake towards the peer (client role). A session that
    ///  never calls this waits for the peer's `Knock` instead.
    pub fn initiate(&mut self) {
        if self.state != SessionState::PreConnection {
            return;
        }
        debug!(peer = %self.key, "initiating handshake");
        self.state = SessionState::FilterInitiation;
        self.hello_sent = true;
        self.control_queue.push_back(Block::Hello {
            kind: HelloKind::Knock,
            version: self.config.protocol_version,
        });
    }

    /// Submits a message. Accepted in any non-closed state; actual transmission
    ///  starts once the session is open.
    pub fn send(&mut self, payload: Bytes, priority: Priority, now: Instant) -> Result<SendHandle, SendError> {
        if self.state == SessionState::Closed {
            return Err(SendError::SessionClosed);
        }
        if payload.len() > self.config.max_message_size {
            return Err(SendError::TooLarge);
        }
        let (message_id, handle) = self.outgoing.submit(payload, priority, now);
        trace!(peer = %self.key, message_id, "message submitted");
        Ok(handle)
    }

    /// Local teardown: fails all pending sends, discards incoming state and
    ///  queues a farewell `Bye` for the peer.
    pub fn close(&mut self) {
        self.close_internal(Some(Block::Hello {
            kind: HelloKind::Bye,
            version: self.config.protocol_version,
        }));
    }

    fn close_internal(&mut self, farewell: Option<Block>) {
        if self.state == SessionState::Closed {
            return;
        }
        info!(peer = %self.key, "closing session");
        self.state = SessionState::Closed;
        self.outgoing.fail_all(SendError::SessionClosed);
        self.incoming.clear();
        self.control_queue.clear();
        if let Some(block) = farewell {
            self.control_queue.push_back(block);
        }
    }

    /// Processes one received block, returning any application payloads that
    ///  became complete. Blocks arriving on a closed session are dropped.
    pub fn on_block(&mut self, block: Block, now: Instant) -> Vec<Vec<u8>> {
        let mut delivered = Vec::new();
        self.handle_block(block, now, &mut delivered);
        delivered
    }

    fn handle_block(&mut self, block: Block, now: Instant, delivered: &mut Vec<Vec<u8>>) {
        if self.state == SessionState::Closed {
            trace!(peer = %self.key, "dropping block on closed session");
            return;
        }
        match block {
            Block::Multi(blocks) => {
                for sub in blocks {
                    self.handle_block(sub, now, delivered);
                }
            }
            Block::Ignore(_) => {}
            Block::Hello { kind, version } => self.on_hello(kind, version),
            Block::Ping { kind: PingKind::Ping, id } => {
                self.control_queue.push_back(Block::Ping { kind: PingKind::Pong, id });
            }
            Block::Ping { kind: PingKind::Pong, id } => {
                self.liveness.on_pong(id, now);
            }
            Block::MessageCtl { kind, message_id, aux } => self.on_ctl(kind, message_id, aux, delivered),
            Block::MessageData { message_id, offset, payload } => {
                self.on_data(message_id, offset, payload, delivered)
            }
            Block::MessageAck { kind: AckKind::Acknowledge, message_id, offset, length } => {
                self.outgoing.on_ack(message_id, offset, length);
            }
            Block::MessageAck { kind: AckKind::Repeat, message_id, offset, length } => {
                self.outgoing.on_repeat_request(message_id, offset, length);
            }
        }
    }

    fn on_hello(&mut self, kind: HelloKind, version: u64) {
        match kind {
            HelloKind::Knock => {
                if version != self.config.protocol_version {
                    warn!(
                        peer = %self.key,
                        ours = self.config.protocol_version,
                        theirs = version,
                        "protocol version mismatch, rejecting"
                    );
                    self.close_internal(Some(Block::Hello {
                        kind: HelloKind::Busy,
                        version: self.config.protocol_version,
                    }));
                    return;
                }
                self.hello_received = true;
                if !self.hello_sent {
                    self.hello_sent = true;
                    self.control_queue.push_back(Block::Hello {
                        kind: HelloKind::Hello,
                        version: self.config.protocol_version,
                    });
                }
                self.update_handshake_state();
            }
            HelloKind::Hello => {
                if version != self.config.protocol_version {
                    warn!(
                        peer = %self.key,
                        ours = self.config.protocol_version,
                        theirs = version,
                        "protocol version mismatch, rejecting"
                    );
                    self.close_internal(Some(Block::Hello {
                        kind: HelloKind::Busy,
                        version: self.config.protocol_version,
                    }));
                    return;
                }
                self.hello_received = true;
                self.update_handshake_state();
            }
            HelloKind::Busy => {
                warn!(peer = %self.key, theirs = version, "peer rejected the session");
                self.close_internal(None);
            }
            HelloKind::Bye => {
                debug!(peer = %self.key, "peer said goodbye");
                self.close_internal(None);
            }
        }
    }

    fn update_handshake_state(&mut self) {
        if self.hello_sent && self.hello_received && self.state != SessionState::Open {
            info!(peer = %self.key, "session open");
            self.state = SessionState::Open;
        }
    }

    fn on_ctl(&mut self, kind: CtlKind, message_id: u64, aux: u64, delivered: &mut Vec<Vec<u8>>) {
        match kind {
            CtlKind::New => {
                if self.completed.contains(&message_id) {
                    // retransmitted announcement of a message we already
                    //  delivered - confirm instead of assembling it again
                    self.control_queue.push_back(Block::MessageCtl { kind: CtlKind::Complete, message_id, aux: 0 });
                    return;
                }
                if aux > self.config.max_message_size as u64 {
                    warn!(
                        peer = %self.key,
                        message_id,
                        announced_size = aux,
                        "announced message exceeds the size limit, refusing"
                    );
                    self.control_queue.push_back(Block::MessageCtl {
                        kind: CtlKind::ErrorRecv,
                        message_id,
                        aux: 0,
                    });
                    return;
                }
                self.incoming.on_new(message_id, aux as u32);
                if self.incoming.is_complete(message_id) {
                    // zero-size message, complete by announcement alone
                    self.deliver(message_id, delivered);
                }
            }
            CtlKind::Unknown => self.outgoing.on_unknown(message_id),
            CtlKind::Sent | CtlKind::WhatsUp => self.on_delivery_probe(message_id, delivered),
            CtlKind::Complete => self.outgoing.on_peer_complete(message_id),
            CtlKind::ErrorSend => self.incoming.drop_message(message_id),
            CtlKind::ErrorRecv => self.outgoing.on_peer_error(message_id),
            CtlKind::Pending => trace!(peer = %self.key, message_id, "peer is still assembling"),
        }
    }

    /// answers `Sent` / `WhatsUp` with the current delivery status
    fn on_delivery_probe(&mut self, message_id: u64, delivered: &mut Vec<Vec<u8>>) {
        if self.incoming.is_complete(message_id) {
            self.deliver(message_id, delivered);
        } else if self.incoming.is_known(message_id) {
            self.control_queue.push_back(Block::MessageCtl { kind: CtlKind::Pending, message_id, aux: 0 });
            for (offset, length) in self.incoming.missing_ranges(message_id) {
                self.control_queue.push_back(Block::MessageAck {
                    kind: AckKind::Repeat,
                    message_id,
                    offset,
                    length,
                });
            }
        } else if self.completed.contains(&message_id) {
            self.control_queue.push_back(Block::MessageCtl { kind: CtlKind::Complete, message_id, aux: 0 });
        } else {
            self.control_queue.push_back(Block::MessageCtl { kind: CtlKind::Unknown, message_id, aux: 0 });
        }
    }

    fn on_data(&mut self, message_id: u64, offset: u32, payload: Bytes, delivered: &mut Vec<Vec<u8>>) {
        match self.incoming.on_data(message_id, offset, &payload) {
            DataDisposition::Unknown => {
                if self.completed.contains(&message_id) {
                    // stale retransmission of an already delivered message
                    self.control_queue.push_back(Block::MessageCtl { kind: CtlKind::Complete, message_id, aux: 0 });
                } else {
                    trace!(peer = %self.key, message_id, "data for unannounced message");
                    self.control_queue.push_back(Block::MessageCtl { kind: CtlKind::Unknown, message_id, aux: 0 });
                }
            }
            DataDisposition::Accepted { completed } => {
                self.control_queue.push_back(Block::MessageAck {
                    kind: AckKind::Acknowledge,
                    message_id,
                    offset,
                    length: payload.len() as u32,
                });
                if completed {
                    self.deliver(message_id, delivered);
                }
            }
            DataDisposition::Conflict { offset, length } => {
                warn!(peer = %self.key, message_id, offset, length, "conflicting fragment");
                self.control_queue.push_back(Block::MessageAck {
                    kind: AckKind::Repeat,
                    message_id,
                    offset,
                    length,
                });
            }
        }
    }

    fn deliver(&mut self, message_id: u64, delivered: &mut Vec<Vec<u8>>) {
        if let Ok(payload) = self.incoming.take(message_id) {
            debug!(peer = %self.key, message_id, size = payload.len(), "message delivered");
            delivered.push(payload);
        }
        self.completed.insert(message_id);
        self.control_queue.push_back(Block::MessageCtl { kind: CtlKind::Complete, message_id, aux: 0 });
    }

    fn retry_after(&mut self, now: Instant) -> Duration {
        let scaled = self.liveness.average_round_trip(now) * self.config.send_retry_factor;
        scaled.max(self.config.min_retry_after)
    }

    /// Next control block to transmit: queued responses first, then message
    ///  announcements, then a liveness ping when due. Control traffic flows in
    ///  every state; announcements and pings require an open session.
    pub fn poll_control(&mut self, now: Instant) -> Option<Block> {
        if let Some(block) = self.control_queue.pop_front() {
            return Some(block);
        }
        if self.state != SessionState::Open {
            return None;
        }
        let retry_after = self.retry_after(now);
        if let Some(block) = self.outgoing.next_control(retry_after, now) {
            return Some(block);
        }
        if self.liveness.is_ping_due(now) {
            let id = rand::random();
            self.liveness.on_ping_sent(id, now);
            return Some(Block::Ping { kind: PingKind::Ping, id });
        }
        None
    }

    /// Next application data fragment. `None` while the session is not open or
    ///  no fragment is sendable right now.
    pub fn poll_app_data(&mut self, max_block_size: usize, now: Instant) -> Option<Block> {
        if self.state != SessionState::Open {
            return None;
        }
        let max_data = max_block_size.saturating_sub(Block::MESSAGE_DATA_HEADER_SIZE);
        if max_data == 0 {
            return None;
        }
        let retry_after = self.retry_after(now);
        self.outgoing
            .next_fragment(max_data, retry_after, self.config.max_fragment_retries, now)
    }

    /// earliest instant this session will have something to transmit
    pub fn next_deadline(&mut self, now: Instant) -> Option<Instant> {
        if !self.control_queue.is_empty() {
            return Some(now);
        }
        if self.state != SessionState::Open {
            return None;
        }
        let retry_after = self.retry_after(now);
        let send = self.outgoing.next_deadline(retry_after, now);
        let ping = self.liveness.next_ping_due(now);
        Some(send.map_or(ping, |s| s.min(ping)))
    }

    /// Liveness verdict. Open sessions time out on missed pings; a handshake
    ///  that makes no progress for `connection_timeout` times out as well.
    pub fn is_timed_out(&mut self, now: Instant) -> bool {
        match self.state {
            SessionState::Closed => false,
            SessionState::Open => self.liveness.is_timed_out(now),
            _ => now.duration_since(self.created) > self.config.connection_timeout,
        }
    }
}
