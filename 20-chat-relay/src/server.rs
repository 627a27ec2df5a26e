use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{info, warn};

use crate::{
    config::ServerConfig,
    credentials::CredentialProvider,
    protocol::SHUTDOWN_NOTICE,
    registry::Registry,
    session::{SessionContext, handle_connection},
};

/// Accepts TCP connections and runs one session task per client.
pub struct Server {
    listener: TcpListener,
    context: Arc<SessionContext>,
}

impl Server {
    pub fn new(
        listener: TcpListener,
        credentials: Arc<dyn CredentialProvider>,
        config: ServerConfig,
    ) -> Self {
        Self {
            listener,
            context: Arc::new(SessionContext::new(credentials, config)),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(self.context.registry())
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, context } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&context).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &context);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(context: &SessionContext) {
    info!("relay shutting down");
    context.router.broadcast(SHUTDOWN_NOTICE).await;
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    context: &Arc<SessionContext>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, context),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, context: &Arc<SessionContext>) {
    let context = Arc::clone(context);
    info!(%peer, "new client connected");
    tokio::spawn(async move {
        let (reader, writer) = stream.into_split();
        if let Err(err) = handle_connection(reader, writer, Some(peer), context).await {
            warn!(peer = %peer, error = %err, "client connection closed with error");
        }
    });
}
