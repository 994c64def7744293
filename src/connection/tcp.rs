use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::connection::{BlockHandler, BlockTransport};

/// headroom on top of `max_block_size` for filters that expand the buffer
const FRAME_SLACK: usize = 1024;

/// Reference transport: one TCP stream to one peer, each block buffer framed
///  with a big-endian u32 length prefix.
pub struct TcpBlockTransport {
    peer: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    reader: Mutex<Option<OwnedReadHalf>>,
    cancel: Notify,
    canceled: AtomicBool,
    max_block_size: usize,
}

impl TcpBlockTransport {
    pub async fn connect(peer: SocketAddr, max_block_size: usize) -> anyhow::Result<TcpBlockTransport> {
        let stream = TcpStream::connect(peer).await?;
        Self::new(stream, max_block_size)
    }

    /// wraps an already established stream, e.g. from a listener's accept
    pub fn new(stream: TcpStream, max_block_size: usize) -> anyhow::Result<TcpBlockTransport> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(TcpBlockTransport {
            peer,
            writer: Mutex::new(writer),
            reader: Mutex::new(Some(reader)),
            cancel: Notify::new(),
            canceled: AtomicBool::new(false),
            max_block_size,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// `Ok(None)` on a clean end of stream between frames
    async fn read_frame(reader: &mut OwnedReadHalf, max_frame: usize) -> anyhow::Result<Option<Vec<u8>>> {
        let len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len > max_frame {
            bail!("frame of {} bytes exceeds the limit of {}", len, max_frame);
        }
        let mut buf = vec![0; len];
        reader.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }
}

#[async_trait]
impl BlockTransport for TcpBlockTransport {
    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        if to != self.peer {
            bail!("transport is connected to {}, cannot send to {}", self.peer, to);
        }
        let mut writer = self.writer.lock().await;
        writer.write_u32(buf.len() as u32).await?;
        writer.write_all(buf).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn BlockHandler>) -> anyhow::Result<()> {
        let mut reader = match self.reader.lock().await.take() {
            Some(reader) => reader,
            None => bail!("recv loop is already running"),
        };
        let max_frame = self.max_block_size + FRAME_SLACK;
        loop {
            if self.canceled.load(Ordering::Relaxed) {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.notified() => {
                    debug!(peer = %self.peer, "recv loop canceled");
                    return Ok(());
                }
                frame = Self::read_frame(&mut reader, max_frame) => match frame? {
                    Some(buf) => handler.handle_block(self.peer, &buf).await,
                    None => {
                        debug!(peer = %self.peer, "stream closed by peer");
                        return Ok(());
                    }
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

#[cfg(test)]
mod test {
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use super::*;

    struct Capture {
        sender: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl BlockHandler for Capture {
        async fn handle_block(&self, _from: SocketAddr, buf: &[u8]) {
            self.sender.send(buf.to_vec()).ok();
        }
    }

    async fn connected_pair(max_block_size: usize) -> (TcpBlockTransport, TcpBlockTransport) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let client = TcpBlockTransport::connect(server_addr, max_block_size).await.unwrap();
        let server = TcpBlockTransport::new(accept.await.unwrap(), max_block_size).unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_frames_round_trip() {
        let (client, server) = connected_pair(1024).await;
        let server_addr = client.peer();

        let (sender, mut received) = mpsc::unbounded_channel();
        let server = Arc::new(server);
        let reader = server.clone();
        let loop_task = tokio::spawn(async move { reader.recv_loop(Arc::new(Capture { sender })).await });

        client.send(server_addr, b"first frame").await.unwrap();
        client.send(server_addr, &[]).await.unwrap();
        client.send(server_addr, &[7u8; 512]).await.unwrap();

        assert_eq!(received.recv().await.unwrap(), b"first frame");
        assert_eq!(received.recv().await.unwrap(), Vec::<u8>::new());
        assert_eq!(received.recv().await.unwrap(), vec![7u8; 512]);

        // dropping the client ends the loop cleanly
        drop(client);
        assert!(loop_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_send_checks_the_peer_address() {
        let (client, _server) = connected_pair(1024).await;
        let wrong: SocketAddr = ([127, 0, 0, 1], 1).into();
        assert!(client.send(wrong, b"misdirected").await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_ends_the_loop() {
        let (client, server) = connected_pair(16).await;
        let server_addr = client.peer();

        let (sender, _received) = mpsc::unbounded_channel();
        let server = Arc::new(server);
        let reader = server.clone();
        let loop_task = tokio::spawn(async move { reader.recv_loop(Arc::new(Capture { sender })).await });

        // well past max_block_size + slack on the receiving side
        client.send(server_addr, &vec![0u8; 4096]).await.unwrap();
        assert!(loop_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_cancel_stops_the_loop() {
        let (_client, server) = connected_pair(1024).await;

        let (sender, _received) = mpsc::unbounded_channel();
        let server = Arc::new(server);
        let reader = server.clone();
        let loop_task = tokio::spawn(async move { reader.recv_loop(Arc::new(Capture { sender })).await });

        server.cancel_recv_loop();
        assert!(loop_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_recv_loop_is_single_use() {
        let (_client, server) = connected_pair(1024).await;
        let server = Arc::new(server);

        let (sender, _received) = mpsc::unbounded_channel();
        let handler = Arc::new(Capture { sender });
        let reader = server.clone();
        let first = handler.clone();
        tokio::spawn(async move { reader.recv_loop(first).await });
        tokio::task::yield_now().await;

        assert!(server.recv_loop(handler).await.is_err());
    }
}
