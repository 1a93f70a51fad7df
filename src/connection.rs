//! One socket, split into a shared writer and a single reader
//!
//! `Connection` is cloned (behind an `Arc`) into every task that sends;
//! each `send` holds the writer lock for the whole frame so concurrent
//! senders never interleave bytes. `FrameReader` is owned by exactly one
//! reader task and needs no locking.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::protocol::{timeouts, WRITE_CHUNK};
use crate::protocol_core::{self, Message};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Connection {
    peer: String,
    writer: Mutex<BoxedWriter>,
    closed: watch::Sender<bool>,
    stall_timeout: Duration,
}

enum WriteFailure {
    Closed,
    Io(io::Error),
}

/// Receiving half of a [`Connection`].
pub struct FrameReader {
    inner: BoxedReader,
    closed: watch::Receiver<bool>,
}

impl Connection {
    pub fn new<R, W>(reader: R, writer: W, peer: impl Into<String>) -> (Arc<Self>, FrameReader)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let stall = Duration::from_millis(timeouts::WRITE_STALL_MS);
        Connection::with_stall_timeout(reader, writer, peer, stall)
    }

    /// Like [`new`](Self::new), failing a send once the peer has accepted no
    /// bytes for `stall`.
    pub fn with_stall_timeout<R, W>(
        reader: R,
        writer: W,
        peer: impl Into<String>,
        stall: Duration,
    ) -> (Arc<Self>, FrameReader)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, closed_rx) = watch::channel(false);
        let conn = Arc::new(Connection {
            peer: peer.into(),
            writer: Mutex::new(Box::new(writer)),
            closed,
            stall_timeout: stall,
        });
        let reader = FrameReader {
            inner: Box::new(reader),
            closed: closed_rx,
        };
        (conn, reader)
    }

    pub fn from_tcp(stream: TcpStream) -> (Arc<Self>, FrameReader) {
        let _ = stream.set_nodelay(true);
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (rd, wr) = stream.into_split();
        Connection::new(rd, wr, peer)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write one message as a single critical section.
    ///
    /// Waiting for the writer lock has no limit; once writing, the peer must
    /// accept each chunk within the stall timeout. A failed or stalled write
    /// closes the connection and the reader then fails too. A close from
    /// another task aborts the write at the next chunk boundary.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        let frame = protocol_core::encode(msg)?;
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        match self.write_frame(&mut writer, &frame).await {
            Ok(()) => Ok(()),
            Err(WriteFailure::Closed) => Err(SyncError::Closed),
            Err(WriteFailure::Io(e)) => {
                drop(writer);
                debug!(peer = %self.peer, error = %e, "write failed, closing connection");
                self.close();
                Err(e.into())
            }
        }
    }

    async fn write_frame(&self, writer: &mut BoxedWriter, frame: &[u8]) -> std::result::Result<(), WriteFailure> {
        for chunk in frame.chunks(WRITE_CHUNK) {
            if self.is_closed() {
                return Err(WriteFailure::Closed);
            }
            self.within_stall(writer.write_all(chunk)).await?;
        }
        self.within_stall(writer.flush()).await
    }

    async fn within_stall<F>(&self, fut: F) -> std::result::Result<(), WriteFailure>
    where
        F: std::future::Future<Output = io::Result<()>>,
    {
        match tokio::time::timeout(self.stall_timeout, fut).await {
            Ok(res) => res.map_err(WriteFailure::Io),
            Err(_) => Err(WriteFailure::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "peer stopped reading",
            ))),
        }
    }

    /// Mark the connection closed. Idempotent, callable from any task.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!(peer = %self.peer, "connection closed");
        }
    }

    /// Close and send a FIN to the peer.
    ///
    /// An in-flight send notices the close at its next chunk, so the wait
    /// for the writer is bounded by one stall timeout, as is the FIN itself.
    pub async fn shutdown(&self) {
        self.close();
        let wait = async {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        };
        if tokio::time::timeout(self.stall_timeout * 2, wait).await.is_err() {
            debug!(peer = %self.peer, "gave up flushing FIN");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }
}

impl FrameReader {
    /// Block until the next complete message arrives.
    ///
    /// Fails with `Closed` as soon as the owning connection is closed, even
    /// while a read is in flight.
    pub async fn receive_next(&mut self) -> Result<Message> {
        if *self.closed.borrow() {
            return Err(SyncError::Closed);
        }
        let closed = &mut self.closed;
        tokio::select! {
            res = protocol_core::read_message(&mut self.inner) => res,
            _ = closed.wait_for(|c| *c) => Err(SyncError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pair(buf: usize) -> ((Arc<Connection>, FrameReader), (Arc<Connection>, FrameReader)) {
        let (a, b) = tokio::io::duplex(buf);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (Connection::new(ar, aw, "a"), Connection::new(br, bw, "b"))
    }

    fn file(name: &str, fill: u8, len: usize) -> Message {
        Message::FileTransfer {
            filename: name.into(),
            contents: vec![fill; len],
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_never_interleave() {
        let ((conn, _keep), (_peer, mut reader)) = pair(64);

        let first = file("first.bin", 0xAA, 300_000);
        let second = file("second.bin", 0x55, 300_000);
        let a = {
            let conn = conn.clone();
            let msg = first.clone();
            tokio::spawn(async move { conn.send(&msg).await })
        };
        let b = {
            let conn = conn.clone();
            let msg = second.clone();
            tokio::spawn(async move { conn.send(&msg).await })
        };

        let m1 = reader.receive_next().await.unwrap();
        let m2 = reader.receive_next().await.unwrap();
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let got = [m1, m2];
        assert!(got.contains(&first));
        assert!(got.contains(&second));
    }

    #[tokio::test]
    async fn close_interrupts_a_blocked_read() {
        let ((_conn, _r), (peer, mut reader)) = pair(64);
        let waiter = tokio::spawn(async move { reader.receive_next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        peer.close();
        peer.close();
        let res = waiter.await.unwrap();
        assert!(matches!(res, Err(SyncError::Closed)));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let ((conn, _r), (_peer, _reader)) = pair(64);
        conn.close();
        assert!(conn.is_closed());
        let err = conn.send(&Message::Goodbye).await.unwrap_err();
        assert!(matches!(err, SyncError::Closed));
        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn peer_shutdown_reads_as_closed() {
        let ((conn, _r), (_peer, mut reader)) = pair(64);
        conn.send(&Message::Goodbye).await.unwrap();
        conn.shutdown().await;
        assert_eq!(reader.receive_next().await.unwrap(), Message::Goodbye);
        assert!(matches!(reader.receive_next().await, Err(SyncError::Closed)));
    }

    /// A reader that takes 16 KiB every 20ms, far slower than the payload
    /// could be written in one stall window.
    async fn drain_slowly(mut rd: impl AsyncRead + Unpin, total: usize) {
        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; 16 * 1024];
        let mut seen = 0;
        while seen < total {
            tokio::time::sleep(Duration::from_millis(20)).await;
            match rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => seen += n,
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_reader_is_not_a_stall() {
        let (a, b) = tokio::io::duplex(8 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (conn, _r) = Connection::with_stall_timeout(ar, aw, "slow", Duration::from_millis(300));

        // ~1 MiB through an 8 KiB pipe at 20ms per read takes several stall windows
        let msg = file("big.bin", 7, 1024 * 1024);
        let total = protocol_core::encode(&msg).unwrap().len();
        let drain = tokio::spawn(drain_slowly(b, total));

        let started = std::time::Instant::now();
        conn.send(&msg).await.unwrap();
        assert!(started.elapsed() > Duration::from_millis(600));
        assert!(!conn.is_closed());
        drain.await.unwrap();
    }

    #[tokio::test]
    async fn stalled_reader_fails_the_send_and_closes() {
        let (a, _b) = tokio::io::duplex(8 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (conn, _r) = Connection::with_stall_timeout(ar, aw, "stuck", Duration::from_millis(100));

        let err = conn.send(&file("big.bin", 1, 256 * 1024)).await.unwrap_err();
        assert!(matches!(err, SyncError::Stream(ref e) if e.kind() == io::ErrorKind::TimedOut));
        assert!(conn.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_does_not_wait_out_a_long_send() {
        let (a, b) = tokio::io::duplex(8 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (conn, _r) = Connection::with_stall_timeout(ar, aw, "slow", Duration::from_secs(5));
        let _drain = tokio::spawn(drain_slowly(b, usize::MAX));

        let sender = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send(&file("huge.bin", 3, 8 * 1024 * 1024)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(2), conn.shutdown())
            .await
            .unwrap();
        assert!(matches!(sender.await.unwrap(), Err(SyncError::Closed)));
    }
}
