//! Per-session outbound queue and the task that drains it onto the socket.
//!
//! Other sessions never touch a peer's socket. They push [`Outbound`] items
//! into the peer's bounded queue through a [`SessionHandle`], and the peer's
//! writer task is the only code that writes to that connection.

use std::{io, sync::Arc};

use sha2::{Digest, Sha256};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
};
use tracing::{debug, warn};

use crate::protocol::{file_aborted_line, file_header_lines, file_trailer_line, write_line};

pub type SessionId = u64;

const PAD_BLOCK: usize = 4096;

/// Something queued for delivery to one client.
#[derive(Debug)]
pub enum Outbound {
    /// A text line; may contain embedded newlines to keep a block contiguous.
    Line(String),
    /// A file transfer; written atomically with respect to other items.
    File(FileEnvelope),
}

/// A file payload announced as `size` bytes and fed through `chunks`.
///
/// The writer emits the header, then exactly `size` bytes, then a trailer.
/// If the sender stops early the remainder is zero-filled and the trailer
/// marks the transfer aborted, so the recipient's stream stays in frame.
///
/// `started` fires when the writer reaches this envelope. If the sender has
/// already given up by then, nothing is written at all.
#[derive(Debug)]
pub struct FileEnvelope {
    pub sender: String,
    pub file_name: String,
    pub size: u64,
    pub chunks: mpsc::Receiver<Vec<u8>>,
    pub started: oneshot::Sender<()>,
    pub done: oneshot::Sender<io::Result<()>>,
}

/// Why a non-blocking delivery did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Undelivered {
    /// The recipient's queue is full; the item was dropped.
    QueueFull,
    /// The recipient's writer has stopped.
    Closed,
}

/// Cloneable address of a registered session's outbound queue.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    username: Arc<str>,
    tx: mpsc::Sender<Outbound>,
}

impl SessionHandle {
    pub fn new(id: SessionId, username: &str, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            username: Arc::from(username),
            tx,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Enqueues a line without waiting. Used for traffic from other sessions.
    pub fn try_deliver(&self, line: String) -> Result<(), Undelivered> {
        self.tx.try_send(Outbound::Line(line)).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => Undelivered::QueueFull,
            mpsc::error::TrySendError::Closed(_) => Undelivered::Closed,
        })
    }

    /// Enqueues an item, waiting for queue space.
    pub async fn send(&self, item: Outbound) -> Result<(), Undelivered> {
        self.tx.send(item).await.map_err(|_| Undelivered::Closed)
    }

    /// Resolves once the writer task has gone away.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Drains `queue` onto `writer` until every sender is dropped or a write fails.
pub async fn run_writer<W>(mut writer: W, mut queue: mpsc::Receiver<Outbound>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = queue.recv().await {
        match item {
            Outbound::Line(line) => write_line(&mut writer, &line).await?,
            Outbound::File(envelope) => write_file(&mut writer, envelope).await?,
        }
    }
    writer.shutdown().await
}

async fn write_file<W>(writer: &mut W, envelope: FileEnvelope) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let FileEnvelope {
        sender,
        file_name,
        size,
        mut chunks,
        started,
        done,
    } = envelope;

    if started.send(()).is_err() {
        debug!(%sender, %file_name, "sender gave up while transfer was queued; skipping");
        return Ok(());
    }

    let result = stream_payload(writer, &sender, &file_name, size, &mut chunks).await;
    let report = match &result {
        Ok(PayloadEnd::Complete) => Ok(()),
        Ok(PayloadEnd::Aborted { written }) => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("transfer stopped after {written} of {size} bytes"),
        )),
        Err(err) => Err(io::Error::new(
            err.kind(),
            format!("recipient connection failed: {err}"),
        )),
    };
    if done.send(report).is_err() {
        debug!(%sender, %file_name, "sender stopped waiting for transfer result");
    }
    // Only a failure on the recipient's own socket ends the writer.
    result.map(|_| ())
}

enum PayloadEnd {
    Complete,
    Aborted { written: u64 },
}

async fn stream_payload<W>(
    writer: &mut W,
    sender: &str,
    file_name: &str,
    size: u64,
    chunks: &mut mpsc::Receiver<Vec<u8>>,
) -> io::Result<PayloadEnd>
where
    W: AsyncWrite + Unpin,
{
    for line in file_header_lines(sender, file_name, size) {
        write_line(writer, &line).await?;
    }

    let mut hasher = Sha256::new();
    let mut written: u64 = 0;
    while written < size {
        let Some(chunk) = chunks.recv().await else {
            break;
        };
        // Never write past the announced length.
        let take = chunk.len().min((size - written) as usize);
        writer.write_all(&chunk[..take]).await?;
        hasher.update(&chunk[..take]);
        written += take as u64;
    }

    if written < size {
        warn!(%sender, %file_name, written, size, "file transfer aborted by sender");
        pad_zeros(writer, size - written).await?;
        write_line(writer, &file_aborted_line(file_name)).await?;
        return Ok(PayloadEnd::Aborted { written });
    }

    let digest = format!("{:x}", hasher.finalize());
    write_line(writer, &file_trailer_line(file_name, &digest)).await?;
    Ok(PayloadEnd::Complete)
}

async fn pad_zeros<W>(writer: &mut W, mut remaining: u64) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let block = [0u8; PAD_BLOCK];
    while remaining > 0 {
        let len = remaining.min(PAD_BLOCK as u64) as usize;
        writer.write_all(&block[..len]).await?;
        remaining -= len as u64;
    }
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, BufReader};

    use super::*;
    use crate::protocol::read_line;

    #[tokio::test]
    async fn try_deliver_reports_full_and_closed_queues() {
        let (tx, rx) = mpsc::channel(1);
        let handle = SessionHandle::new(1, "alice", tx);

        assert_eq!(handle.try_deliver("one".into()), Ok(()));
        assert_eq!(handle.try_deliver("two".into()), Err(Undelivered::QueueFull));

        drop(rx);
        assert_eq!(handle.try_deliver("three".into()), Err(Undelivered::Closed));
    }

    #[tokio::test]
    async fn writer_frames_file_between_lines() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::channel(8);
        let writer = tokio::spawn(run_writer(server, rx));

        let (chunk_tx, chunk_rx) = mpsc::channel(4);
        let (started_tx, _started_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        tx.send(Outbound::Line("before".into())).await.expect("queue");
        tx.send(Outbound::File(FileEnvelope {
            sender: "alice".into(),
            file_name: "hello.txt".into(),
            size: 11,
            chunks: chunk_rx,
            started: started_tx,
            done: done_tx,
        }))
        .await
        .expect("queue");
        // Queued while the transfer is still open; must not land inside the payload.
        tx.send(Outbound::Line("after".into())).await.expect("queue");

        chunk_tx.send(b"hello ".to_vec()).await.expect("chunk");
        chunk_tx.send(b"world".to_vec()).await.expect("chunk");
        drop(chunk_tx);
        done_rx.await.expect("done").expect("transfer ok");
        drop(tx);

        let mut reader = BufReader::new(client);
        assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("before"));
        assert_eq!(
            read_line(&mut reader).await.unwrap().as_deref(),
            Some("Receiving file from alice: hello.txt")
        );
        assert_eq!(
            read_line(&mut reader).await.unwrap().as_deref(),
            Some("File size: 11 bytes")
        );
        let mut payload = vec![0u8; 11];
        reader.read_exact(&mut payload).await.expect("payload");
        assert_eq!(payload, b"hello world");

        let trailer = read_line(&mut reader).await.unwrap().expect("trailer");
        let expected = format!("{:x}", Sha256::digest(b"hello world"));
        assert_eq!(
            trailer,
            format!("File transfer complete: hello.txt sha256={expected}")
        );
        assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("after"));

        writer.await.expect("join").expect("writer ok");
    }

    #[tokio::test]
    async fn short_transfer_is_padded_and_marked_aborted() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::channel(8);
        let writer = tokio::spawn(run_writer(server, rx));

        let (chunk_tx, chunk_rx) = mpsc::channel(4);
        let (started_tx, _started_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        tx.send(Outbound::File(FileEnvelope {
            sender: "alice".into(),
            file_name: "big.bin".into(),
            size: 8,
            chunks: chunk_rx,
            started: started_tx,
            done: done_tx,
        }))
        .await
        .expect("queue");
        chunk_tx.send(b"abc".to_vec()).await.expect("chunk");
        drop(chunk_tx);

        let outcome = done_rx.await.expect("done");
        assert_eq!(
            outcome.expect_err("short transfer").kind(),
            io::ErrorKind::UnexpectedEof
        );

        let mut reader = BufReader::new(client);
        read_line(&mut reader).await.unwrap();
        read_line(&mut reader).await.unwrap();
        let mut payload = vec![0xffu8; 8];
        reader.read_exact(&mut payload).await.expect("payload");
        assert_eq!(payload, b"abc\0\0\0\0\0");
        assert_eq!(
            read_line(&mut reader).await.unwrap().as_deref(),
            Some("File transfer aborted: big.bin")
        );

        // The recipient's connection survives a sender-side abort.
        drop(tx);
        writer.await.expect("join").expect("writer ok");
    }

    #[tokio::test]
    async fn abandoned_envelope_writes_nothing() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::channel(8);

        let (_chunk_tx, chunk_rx) = mpsc::channel(4);
        let (started_tx, started_rx) = oneshot::channel();
        let (done_tx, _done_rx) = oneshot::channel();
        drop(started_rx);
        tx.send(Outbound::Line("before".into())).await.expect("queue");
        tx.send(Outbound::File(FileEnvelope {
            sender: "alice".into(),
            file_name: "late.bin".into(),
            size: 1024,
            chunks: chunk_rx,
            started: started_tx,
            done: done_tx,
        }))
        .await
        .expect("queue");
        tx.send(Outbound::Line("after".into())).await.expect("queue");
        drop(tx);

        run_writer(server, rx).await.expect("writer ok");

        let mut reader = BufReader::new(client);
        assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("before"));
        assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("after"));
        assert_eq!(read_line(&mut reader).await.unwrap(), None);
    }
}
