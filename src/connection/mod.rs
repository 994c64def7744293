use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::ProtocolConfig;
use crate::connection::dispatch::{Dispatcher, MessageKind};
use crate::connection::filter::FilterChain;
use crate::error::SendError;
use crate::message::{Priority, SendHandle};
use crate::session::{NodeSession, Scheduler, SessionKey};
use crate::wire::Block;

pub mod dispatch;
pub mod filter;
pub mod tcp;

/// Carries framed block buffers between peers. Implementations deal in opaque
///  byte buffers - framing below this trait, protocol above it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BlockTransport: Sync + Send {
    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()>;

    /// Feeds every received buffer to the handler until the transport ends or
    ///  [BlockTransport::cancel_recv_loop] is called.
    async fn recv_loop(&self, handler: Arc<dyn BlockHandler>) -> anyhow::Result<()>;

    fn cancel_recv_loop(&self);

    /// the largest buffer this transport carries in one piece
    fn max_block_size(&self) -> usize;
}

/// Receiving side of [BlockTransport], implemented by the connection. Passed
///  as `Arc<dyn ...>` to keep transport implementations decoupled.
#[async_trait]
pub trait BlockHandler: Sync + Send {
    async fn handle_block(&self, from: SocketAddr, buf: &[u8]);
}

struct ConnectionInner {
    sessions: BTreeMap<SessionKey, NodeSession>,
    scheduler: Scheduler,
}

/// The protocol engine: owns the sessions, schedules outgoing blocks onto the
///  transport and routes received blocks into the sessions.
///
/// One reader task ([Connection::recv_loop]) and one writer task
///  ([Connection::send_loop]) per connection. All shared state lives behind a
///  single mutex with short, non-awaiting critical sections; no lock is held
///  across transport I/O.
pub struct Connection {
    config: Arc<ProtocolConfig>,
    transport: Arc<dyn BlockTransport>,
    filters: FilterChain,
    dispatcher: Arc<Dispatcher>,
    inner: Mutex<ConnectionInner>,
    /// wakes the writer when new work appears; shared with the send handles so
    ///  cancellation wakes it too
    wakeup: Arc<Notify>,
    shut_down: AtomicBool,
}

impl Connection {
    pub fn new(
        config: ProtocolConfig,
        transport: Arc<dyn BlockTransport>,
        filters: FilterChain,
        dispatcher: Arc<Dispatcher>,
    ) -> anyhow::Result<Arc<Connection>> {
        config.validate()?;
        Ok(Arc::new(Connection {
            config: Arc::new(config),
            transport,
            filters,
            dispatcher,
            inner: Mutex::new(ConnectionInner {
                sessions: BTreeMap::new(),
                scheduler: Scheduler::new(),
            }),
            wakeup: Arc::new(Notify::new()),
            shut_down: AtomicBool::new(false),
        }))
    }

    fn effective_max_block(&self) -> usize {
        self.config.max_block_size.min(self.transport.max_block_size())
    }

    /// Creates a session for the peer (if none exists) and starts the
    ///  handshake towards it.
    pub fn connect(&self, peer: SocketAddr) {
        let now = Instant::now();
        {
            let mut inner = self.inner.lock().unwrap();
            let key = SessionKey(peer);
            let config = self.config.clone();
            inner
                .sessions
                .entry(key)
                .or_insert_with(|| NodeSession::new(key, config, now))
                .initiate();
        }
        self.wakeup.notify_one();
    }

    /// Submits a message to the session for `to`. The eight-byte kind prefix
    ///  travels as part of the payload and selects the listeners on the far
    ///  side.
    pub fn send(
        &self,
        to: SocketAddr,
        kind: MessageKind,
        payload: &[u8],
        priority: Priority,
    ) -> Result<SendHandle, SendError> {
        let now = Instant::now();
        let mut buf = Vec::with_capacity(8 + payload.len());
        buf.extend_from_slice(&kind.0.to_be_bytes());
        buf.extend_from_slice(payload);

        let handle = {
            let mut inner = self.inner.lock().unwrap();
            let session = inner
                .sessions
                .get_mut(&SessionKey(to))
                .ok_or(SendError::UnknownSession)?;
            session.send(Bytes::from(buf), priority, now)?
        };
        self.wakeup.notify_one();
        Ok(handle.with_waker(self.wakeup.clone()))
    }

    /// Closes the session for `peer`: pending sends fail, a farewell is queued.
    pub fn close_session(&self, peer: SocketAddr) {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(session) = inner.sessions.get_mut(&SessionKey(peer)) {
                session.close();
            }
        }
        self.wakeup.notify_one();
    }

    /// Closes all sessions and stops both loops once the farewells are flushed.
    pub fn shut_down(&self) {
        info!("shutting down connection");
        self.shut_down.store(true, Ordering::Relaxed);
        {
            let mut inner = self.inner.lock().unwrap();
            for session in inner.sessions.values_mut() {
                session.close();
            }
        }
        self.transport.cancel_recv_loop();
        self.wakeup.notify_one();
    }

    pub async fn recv_loop(self: &Arc<Self>) -> anyhow::Result<()> {
        let handler = self.clone() as Arc<dyn BlockHandler>;
        self.transport.recv_loop(handler).await
    }

    /// The writer: repeatedly asks the scheduler for the next block (batching
    ///  follow-up blocks of the same session into a `Multi`), pushes it through
    ///  the filter chain and hands it to the transport. Parks on the wakeup
    ///  notify, bounded by the earliest retransmission/ping deadline.
    pub async fn send_loop(&self) {
        loop {
            self.sweep_sessions();

            match self.next_batch() {
                Some((peer, buf)) => {
                    trace!(%peer, len = buf.len(), "sending block buffer");
                    if let Err(e) = self.transport.send(peer, &buf).await {
                        warn!(%peer, error = %e, "failed to send block buffer");
                    }
                }
                None => {
                    if self.shut_down.load(Ordering::Relaxed) {
                        break;
                    }
                    let now = Instant::now();
                    let deadline = {
                        let mut inner = self.inner.lock().unwrap();
                        Scheduler::next_deadline(&mut inner.sessions, now)
                    };
                    // cap the sleep so timed-out sessions get swept even when
                    //  there is nothing to send
                    let deadline = deadline
                        .unwrap_or(now + self.config.connection_timeout)
                        .min(now + self.config.connection_timeout);
                    tokio::select! {
                        _ = self.wakeup.notified() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
            }
        }
        debug!("send loop terminated");
    }

    /// closes timed-out sessions and drops closed ones with nothing left to say
    fn sweep_sessions(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let timed_out = inner
            .sessions
            .iter_mut()
            .filter_map(|(key, session)| session.is_timed_out(now).then_some(*key))
            .collect::<Vec<_>>();
        for key in timed_out {
            warn!(peer = %key, "session timed out");
            if let Some(session) = inner.sessions.get_mut(&key) {
                session.close();
            }
        }
        inner.sessions.retain(|_, session| !session.is_defunct());
    }

    /// Next buffer to put on the wire: the scheduler's pick, plus as many
    ///  follow-up blocks of the same session as fit into one `Multi`.
    fn next_batch(&self) -> Option<(SocketAddr, Vec<u8>)> {
        // control blocks have bounded size, data blocks are sized to the budget
        const MAX_CONTROL_SIZE: usize = Block::MESSAGE_ACK_SIZE;

        let now = Instant::now();
        let effective_max = self.effective_max_block();

        let mut guard = self.inner.lock().unwrap();
        let ConnectionInner { sessions, scheduler } = &mut *guard;
        let (key, first) = scheduler.select_next(sessions, effective_max, now)?;

        let mut used = 5 + 4 + first.wire_size();
        let mut batch = vec![first];
        if used <= effective_max {
            if let Some(session) = sessions.get_mut(&key) {
                loop {
                    if used + 4 + MAX_CONTROL_SIZE <= effective_max {
                        if let Some(block) = session.poll_control(now) {
                            used += 4 + block.wire_size();
                            batch.push(block);
                            continue;
                        }
                    }
                    let budget = effective_max.saturating_sub(used + 4);
                    if budget > Block::MESSAGE_DATA_HEADER_SIZE {
                        if let Some(block) = session.poll_app_data(budget, now) {
                            used += 4 + block.wire_size();
                            batch.push(block);
                            continue;
                        }
                    }
                    break;
                }
            }
        }
        drop(guard);

        let block = if batch.len() == 1 {
            batch.remove(0)
        } else {
            Block::Multi(batch)
        };
        Some((key.0, self.filters.apply(block.encode().to_vec())))
    }

    async fn dispatch_payload(&self, from: SocketAddr, payload: Vec<u8>) {
        if payload.len() < 8 {
            warn!(%from, len = payload.len(), "delivered message shorter than its kind prefix");
            return;
        }
        let mut kind_bytes = [0u8; 8];
        kind_bytes.copy_from_slice(&payload[..8]);
        let kind = MessageKind(u64::from_be_bytes(kind_bytes));
        self.dispatcher.dispatch(from, kind, &payload[8..]).await;
    }
}

#[async_trait]
impl BlockHandler for Connection {
    async fn handle_block(&self, from: SocketAddr, buf: &[u8]) {
        let restored = match self.filters.restore(buf.to_vec()) {
            Ok(buf) => buf,
            Err(e) => {
                warn!(%from, error = %e, "dropping buffer that failed filter restore");
                return;
            }
        };
        let mut read_buf: &[u8] = &restored;
        let block = match Block::try_read(&mut read_buf) {
            Ok(block) => block,
            Err(e) => {
                warn!(%from, error = %e, "dropping undecodable block");
                return;
            }
        };
        if !read_buf.is_empty() {
            warn!(%from, trailing = read_buf.len(), "dropping block buffer with trailing bytes");
            return;
        }

        let delivered = {
            let now = Instant::now();
            let mut inner = self.inner.lock().unwrap();
            let key = SessionKey(from);
            let config = self.config.clone();
            let session = inner.sessions.entry(key).or_insert_with(|| {
                debug!(peer = %from, "session created for inbound traffic");
                NodeSession::new(key, config, now)
            });
            session.on_block(block, now)
        };
        // answers are usually queued now
        self.wakeup.notify_one();

        for payload in delivered {
            self.dispatch_payload(from, payload).await;
        }
    }
}
