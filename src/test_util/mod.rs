//! In-memory infrastructure for tests and examples: a pair of linked
//!  transports that move block buffers through channels instead of a network.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::debug;

use crate::connection::{BlockHandler, BlockTransport};

/// One end of an in-memory link. Lossless and ordered; loss and reordering
///  are simulated by the tests themselves where needed.
pub struct ChannelTransport {
    local: SocketAddr,
    outbox: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>>>,
    cancel: Notify,
    canceled: AtomicBool,
    max_block_size: usize,
}

/// Two transports wired back to back: whatever one sends, the other receives.
pub fn transport_pair(
    a: SocketAddr,
    b: SocketAddr,
    max_block_size: usize,
) -> (Arc<ChannelTransport>, Arc<ChannelTransport>) {
    let (to_b, inbox_b) = mpsc::unbounded_channel();
    let (to_a, inbox_a) = mpsc::unbounded_channel();
    (
        Arc::new(ChannelTransport {
            local: a,
            outbox: to_b,
            inbox: Mutex::new(Some(inbox_a)),
            cancel: Notify::new(),
            canceled: AtomicBool::new(false),
            max_block_size,
        }),
        Arc::new(ChannelTransport {
            local: b,
            outbox: to_a,
            inbox: Mutex::new(Some(inbox_b)),
            cancel: Notify::new(),
            canceled: AtomicBool::new(false),
            max_block_size,
        }),
    )
}

#[async_trait]
impl BlockTransport for ChannelTransport {
    async fn send(&self, _to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        self.outbox
            .send((self.local, buf.to_vec()))
            .map_err(|_| anyhow!("peer inbox is closed"))
    }

    async fn recv_loop(&self, handler: Arc<dyn BlockHandler>) -> anyhow::Result<()> {
        let mut inbox = match self.inbox.lock().await.take() {
            Some(inbox) => inbox,
            None => return Err(anyhow!("recv loop is already running")),
        };
        loop {
            if self.canceled.load(Ordering::Relaxed) {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.notified() => {
                    debug!(local = %self.local, "recv loop canceled");
                    return Ok(());
                }
                received = inbox.recv() => match received {
                    Some((from, buf)) => handler.handle_block(from, &buf).await,
                    None => return Ok(()),
                }
            }
        }
    }

    fn cancel_recv_loop(&self) {
        self.canceled.store(true, Ordering::Relaxed);
        self.cancel.notify_one();
    }

    fn max_block_size(&self) -> usize {
        self.max_block_size
    }
}
