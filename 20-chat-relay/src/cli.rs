use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::ServerConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat relay, accepting TCP connections.
    Server(ServerArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:12345")]
    pub listen: SocketAddr,

    /// JSON file mapping usernames to passwords. Defaults to the built-in demo accounts.
    #[arg(long)]
    pub users: Option<PathBuf>,

    /// Lines buffered per client before further broadcasts to it are dropped.
    #[arg(long, default_value_t = 256)]
    pub outbound_capacity: usize,

    /// Seconds a new connection has to log in.
    #[arg(long, default_value_t = 60)]
    pub handshake_timeout_secs: u64,

    /// Seconds a file transfer may wait on a recipient that stopped reading.
    #[arg(long, default_value_t = 30)]
    pub transfer_stall_secs: u64,

    /// Seconds a file transfer may wait behind earlier output to the same recipient.
    #[arg(long, default_value_t = 300)]
    pub transfer_queue_secs: u64,
}

impl ServerArgs {
    pub fn config(&self) -> ServerConfig {
        ServerConfig {
            outbound_capacity: self.outbound_capacity.max(1),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            transfer_stall_timeout: Duration::from_secs(self.transfer_stall_secs),
            transfer_queue_timeout: Duration::from_secs(self.transfer_queue_secs),
            ..ServerConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:12345")]
    pub server: SocketAddr,

    /// Directory where received files are saved.
    #[arg(long, default_value = "downloads")]
    pub download_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let cli = Cli::parse_from(["chat_relay", "server"]);
        let Command::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };
        assert_eq!(args.listen, "127.0.0.1:12345".parse::<SocketAddr>().unwrap());
        assert!(args.users.is_none());

        let config = args.config();
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.handshake_timeout, Duration::from_secs(60));
        assert_eq!(config.transfer_stall_timeout, Duration::from_secs(30));
        assert_eq!(config.transfer_queue_timeout, Duration::from_secs(300));
    }

    #[test]
    fn server_overrides() {
        let cli = Cli::parse_from([
            "chat_relay",
            "server",
            "--listen",
            "0.0.0.0:0",
            "--users",
            "users.json",
            "--outbound-capacity",
            "0",
            "--handshake-timeout-secs",
            "5",
            "--transfer-queue-secs",
            "10",
        ]);
        let Command::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };
        assert_eq!(args.users, Some(PathBuf::from("users.json")));
        let config = args.config();
        assert_eq!(config.outbound_capacity, 1);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.transfer_queue_timeout, Duration::from_secs(10));
    }

    #[test]
    fn client_defaults() {
        let cli = Cli::parse_from(["chat_relay", "client"]);
        let Command::Client(args) = cli.command else {
            panic!("expected client subcommand");
        };
        assert_eq!(args.server, "127.0.0.1:12345".parse::<SocketAddr>().unwrap());
        assert_eq!(args.download_dir, PathBuf::from("downloads"));
    }
}
