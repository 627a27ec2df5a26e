//! Multi-user chat relay over a line-oriented TCP protocol.
//!
//! Clients log in with a username and password, then chat with everyone,
//! message one user directly, ask who is online, or push a file from the
//! server's disk to another user. Each module owns one concern:
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`config`] holds the server's tuning knobs.
//! - [`credentials`] answers login checks for the handshake.
//! - [`registry`] is the single shared map of live sessions and presence.
//! - [`outbound`] is the per-session output queue and the task that owns
//!   each client's socket for writing.
//! - [`router`] fans broadcast and direct lines out to session queues.
//! - [`relay`] streams a file into a recipient's queue.
//! - [`session`] runs the handshake, command loop and teardown per client.
//! - [`server`] accepts TCP connections and spawns sessions.
//! - [`client`] is the terminal client, including file downloads.
//! - [`protocol`] defines the wire lines and line I/O helpers.
//! - [`error`] lists the failures reported back to clients.

pub mod cli;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod outbound;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;
pub mod session;
