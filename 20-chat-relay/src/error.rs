//! Error types for the relay.
//!
//! Command errors are non-fatal: their `Display` text is exactly the line
//! written back to the client that issued the command. Handshake errors end
//! the connection before it ever reaches the registry.

use std::io;

use thiserror::Error;

/// A command failed in a way that only the issuing client needs to hear about.
#[derive(Debug, Error)]
pub enum CommandError {
    /// `/msg` or `/file` was missing arguments.
    #[error("Invalid command. Use {usage}")]
    Malformed { usage: &'static str },

    /// Direct message target is not registered.
    #[error("User {0} is not online.")]
    UserOffline(String),

    /// Direct message target is online but too far behind to take more.
    #[error("Message to {0} was not delivered: recipient is not keeping up.")]
    RecipientBusy(String),

    /// File relay target is not registered.
    #[error("Recipient {0} is not online.")]
    RecipientOffline(String),

    #[error("File does not exist: {0}")]
    FileNotFound(String),

    /// Reading the source file or handing bytes to the recipient failed.
    #[error("Error sending file: {0}")]
    TransferIo(#[source] io::Error),
}

impl CommandError {
    pub fn transfer(kind: io::ErrorKind, reason: &str) -> Self {
        Self::TransferIo(io::Error::new(kind, reason.to_string()))
    }
}

/// Reasons a connection never becomes a registered session.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("authentication failed for {username:?}")]
    AuthenticationFailure { username: String },

    #[error("{0} is already online")]
    AlreadyOnline(String),

    #[error("connection closed during handshake")]
    ConnectionClosed,

    #[error("handshake timed out")]
    TimedOut,

    #[error("i/o error during handshake: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_errors_render_as_client_lines() {
        let usage = CommandError::Malformed {
            usage: "/msg <recipient> <message>",
        };
        assert_eq!(
            usage.to_string(),
            "Invalid command. Use /msg <recipient> <message>"
        );
        assert_eq!(
            CommandError::UserOffline("bob".into()).to_string(),
            "User bob is not online."
        );
        assert_eq!(
            CommandError::RecipientBusy("bob".into()).to_string(),
            "Message to bob was not delivered: recipient is not keeping up."
        );
        assert_eq!(
            CommandError::RecipientOffline("bob".into()).to_string(),
            "Recipient bob is not online."
        );
        assert_eq!(
            CommandError::FileNotFound("nonexistent.txt".into()).to_string(),
            "File does not exist: nonexistent.txt"
        );
        assert_eq!(
            CommandError::transfer(io::ErrorKind::BrokenPipe, "recipient disconnected").to_string(),
            "Error sending file: recipient disconnected"
        );
    }
}
