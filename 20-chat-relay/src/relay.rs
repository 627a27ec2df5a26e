//! Streaming a local file from the server's disk to another session.
//!
//! The sender's task reads the file and feeds chunks into a per-transfer
//! channel. The recipient's writer task owns the socket and writes the
//! header, payload and trailer as one unit (see [`crate::outbound`]).

use std::{io, path::Path};

use tokio::{
    fs::File,
    io::AsyncReadExt,
    sync::{mpsc, oneshot},
    time::timeout,
};
use tracing::{debug, info};

use crate::{
    config::TransferLimits,
    error::CommandError,
    outbound::{FileEnvelope, Outbound},
    registry::Registry,
};

const CHUNK_SIZE: usize = 4096;
const CHUNKS_IN_FLIGHT: usize = 8;

/// Sends the file at `path` to `recipient`, returning the byte count.
///
/// Checks happen in order: the file must exist, then the recipient must be
/// online. Failures are reported to the sender only; the recipient hears
/// nothing unless the header has already gone out.
pub async fn send_file(
    registry: &Registry,
    sender: &str,
    recipient: &str,
    path: &str,
    limits: TransferLimits,
) -> Result<u64, CommandError> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(CommandError::FileNotFound(path.to_string()));
        }
        Err(err) => return Err(CommandError::TransferIo(err)),
    };
    let metadata = file.metadata().await.map_err(CommandError::TransferIo)?;
    if !metadata.is_file() {
        return Err(CommandError::transfer(
            io::ErrorKind::InvalidInput,
            &format!("{path} is not a regular file"),
        ));
    }
    let size = metadata.len();

    let Some(target) = registry.lookup(recipient).await else {
        return Err(CommandError::RecipientOffline(recipient.to_string()));
    };

    let file_name = announced_name(path);
    let (chunk_tx, chunk_rx) = mpsc::channel(CHUNKS_IN_FLIGHT);
    let (started_tx, started_rx) = oneshot::channel();
    let (done_tx, done_rx) = oneshot::channel();
    let envelope = FileEnvelope {
        sender: sender.to_string(),
        file_name: file_name.clone(),
        size,
        chunks: chunk_rx,
        started: started_tx,
        done: done_tx,
    };

    // Dropping `started_rx` on timeout tells the writer to skip the envelope.
    let queued = async move {
        target
            .send(Outbound::File(envelope))
            .await
            .map_err(|_| recipient_gone())?;
        started_rx.await.map_err(|_| recipient_gone())
    };
    match timeout(limits.queue_wait, queued).await {
        Ok(result) => result?,
        Err(_) => return Err(busy()),
    }
    debug!(%sender, %recipient, %file_name, size, "file transfer started");

    let mut source = (&mut file).take(size);
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut sent: u64 = 0;
    loop {
        let read = source.read(&mut buffer).await.map_err(CommandError::TransferIo)?;
        if read == 0 {
            break;
        }
        match timeout(limits.stall, chunk_tx.send(buffer[..read].to_vec())).await {
            Ok(Ok(())) => sent += read as u64,
            Ok(Err(_)) => return Err(recipient_gone()),
            Err(_) => return Err(stalled()),
        }
    }
    drop(chunk_tx);

    if sent != size {
        return Err(CommandError::transfer(
            io::ErrorKind::UnexpectedEof,
            &format!("file shrank during transfer ({sent} of {size} bytes)"),
        ));
    }

    match timeout(limits.stall, done_rx).await {
        Ok(Ok(Ok(()))) => {
            info!(%sender, %recipient, %file_name, size, "file relayed");
            Ok(size)
        }
        Ok(Ok(Err(err))) => Err(CommandError::TransferIo(err)),
        Ok(Err(_)) => Err(recipient_gone()),
        Err(_) => Err(stalled()),
    }
}

/// The base name the recipient sees; never a path.
fn announced_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn recipient_gone() -> CommandError {
    CommandError::transfer(io::ErrorKind::BrokenPipe, "recipient disconnected")
}

fn stalled() -> CommandError {
    CommandError::transfer(io::ErrorKind::TimedOut, "recipient stopped reading")
}

fn busy() -> CommandError {
    CommandError::transfer(
        io::ErrorKind::TimedOut,
        "recipient is still busy receiving earlier output",
    )
}
