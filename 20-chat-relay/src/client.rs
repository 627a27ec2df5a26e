//! Terminal client: stdin lines go to the relay, relay lines go to stdout.
//!
//! The only thing the client interprets is the file-transfer framing, so it
//! can pull the raw payload off the stream and save it to disk.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::{
    fs,
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    task::JoinHandle,
    time::{Duration, timeout},
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    protocol::{
        FileTrailer, parse_file_announcement, parse_file_size, parse_file_trailer_or_abort,
        read_line, write_line,
    },
};

const LOGOUT_GRACE: Duration = Duration::from_secs(2);
const DOWNLOAD_BUFFER: usize = 8192;

pub async fn run(args: ClientArgs) -> Result<()> {
    let (reader, mut writer) = establish_connection(&args).await?;
    let mut receiver: JoinHandle<Result<()>> = tokio::spawn(receive_loop(
        reader,
        tokio::io::stdout(),
        args.download_dir.clone(),
    ));

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    let server_closed =
        run_client_loop(&mut receiver, &mut writer, &mut stdin, &mut input).await?;
    if !server_closed {
        // Let the relay's last lines (and its close) reach the terminal.
        if timeout(LOGOUT_GRACE, &mut receiver).await.is_err() {
            receiver.abort();
        }
    }
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

/// Returns `true` when the relay closed the connection first.
async fn run_client_loop(
    receiver: &mut JoinHandle<Result<()>>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<bool> {
    loop {
        input.clear();
        select! {
            finished = &mut *receiver => {
                handle_receiver_exit(finished);
                return Ok(true);
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, writer).await? {
                    return Ok(false);
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                write_line(writer, "/logout").await?;
                return Ok(false);
            }
        }
    }
}

fn handle_receiver_exit(result: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!(?error, "lost connection to relay"),
        Err(error) => warn!(?error, "receiver task failed"),
    }
}

/// Forwards one stdin line verbatim. Returns `false` after `/logout` or stdin EOF.
async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        write_line(writer, "/logout").await?;
        return Ok(false);
    }

    let text = input.trim_end_matches(['\r', '\n']);
    write_line(writer, text).await?;
    Ok(text != "/logout")
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

/// Copies relay lines to `out` until the relay hangs up, saving any files
/// that arrive along the way.
pub async fn receive_loop<R, W>(mut reader: R, mut out: W, download_dir: PathBuf) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut announced: Option<String> = None;
    loop {
        let Some(line) = read_line(&mut reader).await? else {
            write_line(&mut out, "*** server closed the connection").await?;
            return Ok(());
        };
        write_line(&mut out, &line).await?;

        if let Some((_, file_name)) = parse_file_announcement(&line) {
            announced = Some(file_name);
            continue;
        }
        if let Some(file_name) = announced.take() {
            if let Some(size) = parse_file_size(&line) {
                let report = receive_file(&mut reader, &download_dir, &file_name, size).await?;
                write_line(&mut out, &report).await?;
            }
        }
    }
}

/// Reads exactly `size` payload bytes plus the trailer and returns a status line.
///
/// The payload is always consumed, even when it cannot be stored, so the
/// stream stays aligned on the next line.
async fn receive_file<R>(
    reader: &mut R,
    download_dir: &Path,
    file_name: &str,
    size: u64,
) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let target = download_dir.join(local_name(file_name));
    let partial = target.with_extension("part");
    let mut sink = open_partial(download_dir, &partial).await;

    let mut hasher = Sha256::new();
    let mut remaining = size;
    let mut buffer = vec![0u8; DOWNLOAD_BUFFER];
    while remaining > 0 {
        let want = remaining.min(DOWNLOAD_BUFFER as u64) as usize;
        let read = reader
            .read(&mut buffer[..want])
            .await
            .context("failed to read file payload")?;
        if read == 0 {
            anyhow::bail!("relay closed the connection mid-transfer");
        }
        hasher.update(&buffer[..read]);
        let failed = match sink.as_mut() {
            Some(file) => file.write_all(&buffer[..read]).await.err(),
            None => None,
        };
        if let Some(error) = failed {
            warn!(?error, path = %partial.display(), "failed to write download; discarding");
            sink = None;
        }
        remaining -= read as u64;
    }
    let stored = match sink {
        Some(mut file) => file.flush().await.is_ok(),
        None => false,
    };

    let trailer = read_line(reader)
        .await?
        .context("relay closed the connection before the transfer trailer")?;
    let digest = format!("{:x}", hasher.finalize());

    let report = match parse_file_trailer_or_abort(&trailer) {
        Some(FileTrailer::Complete { digest_hex, .. }) if digest_hex == digest && stored => {
            fs::rename(&partial, &target)
                .await
                .with_context(|| format!("failed to move download to {}", target.display()))?;
            return Ok(format!("*** saved {} ({size} bytes)", target.display()));
        }
        Some(FileTrailer::Complete { .. }) if stored => {
            format!("!!! checksum mismatch for {file_name}; discarded")
        }
        Some(FileTrailer::Complete { .. }) => format!("!!! could not store {file_name}"),
        Some(FileTrailer::Aborted { .. }) => {
            format!("*** transfer of {file_name} was aborted by the sender")
        }
        None => format!("!!! unexpected line after {file_name}: {trailer}"),
    };
    let _ = fs::remove_file(&partial).await;
    Ok(report)
}

async fn open_partial(download_dir: &Path, partial: &Path) -> Option<fs::File> {
    if let Err(error) = fs::create_dir_all(download_dir).await {
        warn!(?error, dir = %download_dir.display(), "cannot create download directory");
        return None;
    }
    match fs::File::create(partial).await {
        Ok(file) => Some(file),
        Err(error) => {
            warn!(?error, path = %partial.display(), "cannot create download file");
            None
        }
    }
}

// Only the final path component of whatever the relay announced.
fn local_name(file_name: &str) -> PathBuf {
    Path::new(file_name)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("download.bin"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{file_aborted_line, file_header_lines, file_trailer_line};

    async fn frame(sender: &str, name: &str, payload: &[u8], trailer: &str) -> Vec<u8> {
        let mut wire = Vec::new();
        for line in file_header_lines(sender, name, payload.len() as u64) {
            write_line(&mut wire, &line).await.expect("header");
        }
        wire.extend_from_slice(payload);
        write_line(&mut wire, trailer).await.expect("trailer");
        wire
    }

    async fn run_receiver(wire: Vec<u8>, dir: &Path) -> Vec<String> {
        let mut out = Vec::new();
        receive_loop(BufReader::new(wire.as_slice()), &mut out, dir.to_path_buf())
            .await
            .expect("receive loop");
        String::from_utf8(out)
            .expect("utf8 output")
            .lines()
            .map(String::from)
            .collect()
    }

    #[tokio::test]
    async fn saves_verified_payload_and_keeps_reading_lines() {
        let dir = tempfile::tempdir().expect("temp dir");
        let payload = b"line one\nline two\n\x00\x01binary";
        let digest = format!("{:x}", Sha256::digest(payload));

        let mut wire = Vec::new();
        write_line(&mut wire, "bob: incoming").await.unwrap();
        let trailer = file_trailer_line("notes.txt", &digest);
        wire.extend(frame("bob", "notes.txt", payload, &trailer).await);
        write_line(&mut wire, "bob: done").await.unwrap();

        let lines = run_receiver(wire, dir.path()).await;
        let saved = dir.path().join("notes.txt");
        assert_eq!(
            lines,
            vec![
                "bob: incoming".to_string(),
                "Receiving file from bob: notes.txt".to_string(),
                format!("File size: {} bytes", payload.len()),
                format!("*** saved {} ({} bytes)", saved.display(), payload.len()),
                "bob: done".to_string(),
                "*** server closed the connection".to_string(),
            ]
        );
        assert_eq!(std::fs::read(saved).expect("saved file"), payload);
    }

    #[tokio::test]
    async fn discards_payload_with_wrong_digest() {
        let dir = tempfile::tempdir().expect("temp dir");
        let wire = frame("bob", "a.bin", b"abc", &file_trailer_line("a.bin", "00ff")).await;

        let lines = run_receiver(wire, dir.path()).await;
        assert!(lines.contains(&"!!! checksum mismatch for a.bin; discarded".to_string()));
        assert!(!dir.path().join("a.bin").exists());
        assert!(!dir.path().join("a.part").exists());
    }

    #[tokio::test]
    async fn aborted_transfer_is_reported_and_dropped() {
        let dir = tempfile::tempdir().expect("temp dir");
        let wire = frame("bob", "big.iso", &[0u8; 16], &file_aborted_line("big.iso")).await;

        let lines = run_receiver(wire, dir.path()).await;
        assert!(lines.contains(&"*** transfer of big.iso was aborted by the sender".to_string()));
        assert!(!dir.path().join("big.iso").exists());
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut wire = Vec::new();
        for line in file_header_lines("bob", "x.bin", 100) {
            write_line(&mut wire, &line).await.unwrap();
        }
        wire.extend_from_slice(b"short");

        let mut out = Vec::new();
        let result = receive_loop(
            BufReader::new(wire.as_slice()),
            &mut out,
            dir.path().to_path_buf(),
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn local_name_drops_directories() {
        assert_eq!(local_name("../../etc/passwd"), PathBuf::from("passwd"));
        assert_eq!(local_name("report.pdf"), PathBuf::from("report.pdf"));
        assert_eq!(local_name(".."), PathBuf::from("download.bin"));
    }
}
