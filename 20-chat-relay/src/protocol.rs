//! The newline-delimited text protocol spoken between clients and the relay.
//!
//! Every message is one UTF-8 line. The only exception is a file transfer,
//! which the relay frames as two header lines, exactly `size` raw bytes and a
//! trailer line carrying the payload's sha256 digest.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CommandError;

pub const USERNAME_PROMPT: &str = "Enter username:";
pub const PASSWORD_PROMPT: &str = "Enter password:";
pub const AUTH_SUCCESS: &str = "Authentication successful!";
pub const AUTH_FAILURE: &str = "Authentication failed! Disconnecting...";
pub const STATUS_HEADER: &str = "=== Client Status ===";
pub const SHUTDOWN_NOTICE: &str = "Server shutting down";

pub const MSG_USAGE: &str = "/msg <recipient> <message>";
pub const FILE_USAGE: &str = "/file <recipient> <filepath>";

const FILE_FROM_PREFIX: &str = "Receiving file from ";
const FILE_SIZE_PREFIX: &str = "File size: ";
const FILE_SIZE_SUFFIX: &str = " bytes";
const FILE_DONE_PREFIX: &str = "File transfer complete: ";
const FILE_ABORTED_PREFIX: &str = "File transfer aborted: ";
const DIGEST_MARKER: &str = " sha256=";

/// One line of client input after login, already classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Direct { recipient: String, text: String },
    SendFile { recipient: String, path: String },
    Status,
    Logout,
    Broadcast(String),
}

impl Command {
    /// Classifies a line. Prefix matching is case-sensitive and the first
    /// rule that matches wins; anything unrecognised is chat.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        if line.starts_with("/msg") {
            let (recipient, text) = split_arguments(line, MSG_USAGE)?;
            return Ok(Command::Direct { recipient, text });
        }
        if line.starts_with("/file") {
            let (recipient, path) = split_arguments(line, FILE_USAGE)?;
            return Ok(Command::SendFile { recipient, path });
        }
        match line {
            "/status" => Ok(Command::Status),
            "/logout" => Ok(Command::Logout),
            text => Ok(Command::Broadcast(text.to_string())),
        }
    }
}

// `<command> <target> <rest...>`, split on single spaces so the rest keeps its own spacing.
fn split_arguments(line: &str, usage: &'static str) -> Result<(String, String), CommandError> {
    let mut parts = line.splitn(3, ' ');
    let _command = parts.next();
    match (parts.next(), parts.next()) {
        (Some(target), Some(rest)) => Ok((target.to_string(), rest.to_string())),
        _ => Err(CommandError::Malformed { usage }),
    }
}

pub fn chat_line(username: &str, text: &str) -> String {
    format!("{username}: {text}")
}

pub fn joined_line(username: &str) -> String {
    format!("{username} has joined the chat!")
}

pub fn left_line(username: &str) -> String {
    format!("{username} has left the chat!")
}

pub fn already_online_line(username: &str) -> String {
    format!("User {username} is already online. Disconnecting...")
}

pub fn file_sent_line(recipient: &str) -> String {
    format!("File sent successfully to {recipient}")
}

/// The two lines announcing a payload of `size` bytes.
pub fn file_header_lines(sender: &str, file_name: &str, size: u64) -> [String; 2] {
    [
        format!("{FILE_FROM_PREFIX}{sender}: {file_name}"),
        format!("{FILE_SIZE_PREFIX}{size}{FILE_SIZE_SUFFIX}"),
    ]
}

pub fn file_trailer_line(file_name: &str, digest_hex: &str) -> String {
    format!("{FILE_DONE_PREFIX}{file_name}{DIGEST_MARKER}{digest_hex}")
}

/// Sent instead of the digest trailer when the payload was zero-filled.
pub fn file_aborted_line(file_name: &str) -> String {
    format!("{FILE_ABORTED_PREFIX}{file_name}")
}

/// Returns `(sender, file_name)` for a `Receiving file from` line.
pub fn parse_file_announcement(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix(FILE_FROM_PREFIX)?;
    let (sender, file_name) = rest.split_once(": ")?;
    Some((sender.to_string(), file_name.to_string()))
}

pub fn parse_file_size(line: &str) -> Option<u64> {
    line.strip_prefix(FILE_SIZE_PREFIX)?
        .strip_suffix(FILE_SIZE_SUFFIX)?
        .parse()
        .ok()
}

/// Returns `(file_name, digest_hex)` for a trailer line.
pub fn parse_file_trailer(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix(FILE_DONE_PREFIX)?;
    let (file_name, digest) = rest.rsplit_once(DIGEST_MARKER)?;
    Some((file_name.to_string(), digest.to_string()))
}

/// What followed a file payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTrailer {
    Complete { file_name: String, digest_hex: String },
    Aborted { file_name: String },
}

pub fn parse_file_trailer_or_abort(line: &str) -> Option<FileTrailer> {
    if let Some(file_name) = line.strip_prefix(FILE_ABORTED_PREFIX) {
        return Some(FileTrailer::Aborted {
            file_name: file_name.to_string(),
        });
    }
    let (file_name, digest_hex) = parse_file_trailer(line)?;
    Some(FileTrailer::Complete {
        file_name,
        digest_hex,
    })
}

/// Reads one line without its terminator. `None` means the peer closed the stream.
///
/// Blank lines are returned as empty strings; the handshake treats them as
/// input, not noise.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }
    // Exactly one `\n` or `\r\n`; any other trailing `\r` is content.
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    Ok(Some(line))
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}
