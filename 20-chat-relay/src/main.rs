use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::warn;

use chat_relay::{
    cli::{Cli, Command, ServerArgs},
    client,
    credentials::{CredentialProvider, StaticCredentials},
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(args).await?,
        Command::Client(args) => {
            client::run(args).await?;
            // A pending stdin read cannot be cancelled and would stall runtime shutdown.
            std::process::exit(0);
        }
    }

    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let credentials: Arc<dyn CredentialProvider> = match &args.users {
        Some(path) => Arc::new(StaticCredentials::from_json_file(path)?),
        None => Arc::new(StaticCredentials::reference()),
    };

    let listener = TcpListener::bind(args.listen).await?;
    let server = Server::new(listener, credentials, args.config());
    let addr = server.local_addr()?;
    // Tooling reads this line to find an ephemeral port.
    println!("chat relay listening on {addr}");

    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("relay exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}
