//! One client connection from login prompt to teardown.
//!
//! A session authenticates, registers, then loops over input lines. Once
//! registered, leaving always deregisters and announces the departure,
//! whether the client sent `/logout`, hung up, or the task failed.

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    select,
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    credentials::CredentialProvider,
    error::{CommandError, HandshakeError},
    outbound::{Outbound, SessionHandle, run_writer},
    protocol::{
        self, AUTH_FAILURE, AUTH_SUCCESS, Command, PASSWORD_PROMPT, STATUS_HEADER,
        USERNAME_PROMPT, already_online_line, chat_line, joined_line, left_line, read_line,
        write_line,
    },
    registry::{Registry, RegisterError},
    relay,
    router::{DirectOutcome, Router},
};

/// Everything a session needs from the rest of the server.
pub struct SessionContext {
    pub router: Router,
    pub credentials: Arc<dyn CredentialProvider>,
    pub config: ServerConfig,
}

impl SessionContext {
    pub fn new(credentials: Arc<dyn CredentialProvider>, config: ServerConfig) -> Self {
        let registry = Arc::new(Registry::new(credentials.known_users()));
        Self {
            router: Router::new(registry),
            credentials,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.router.registry()
    }
}

/// Runs a connection to completion.
///
/// Returns an error when the client never got past the handshake or its
/// connection failed; teardown has already happened either way.
pub async fn handle_connection<R, W>(
    reader: R,
    mut writer: W,
    peer: Option<SocketAddr>,
    ctx: Arc<SessionContext>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);

    let username = match authenticate_within_deadline(&mut reader, &mut writer, &ctx).await {
        Ok(username) => username,
        Err(err) => {
            refuse(&mut writer, AUTH_FAILURE).await;
            return Err(err.into());
        }
    };

    let (tx, rx) = mpsc::channel(ctx.config.outbound_capacity);
    let handle = SessionHandle::new(ctx.registry().next_id(), &username, tx);
    if let Err(RegisterError::AlreadyOnline(_)) = ctx.registry().register(handle.clone()).await {
        refuse(&mut writer, &already_online_line(&username)).await;
        return Err(HandshakeError::AlreadyOnline(username).into());
    }
    let mut registration = Registration::new(Arc::clone(&ctx), username.clone());
    info!(?peer, user = %username, "client joined");

    // Written before the writer task exists, so it precedes anything queued meanwhile.
    let welcomed = write_line(&mut writer, AUTH_SUCCESS)
        .await
        .context("failed to confirm login");
    let writer_task = tokio::spawn(run_writer(writer, rx));

    let result = match welcomed {
        Ok(()) => {
            ctx.router.broadcast(&joined_line(&username)).await;
            registration.announced();
            run_session(&ctx, &mut reader, &handle).await
        }
        Err(err) => Err(err),
    };

    registration.release().await;
    info!(?peer, user = %username, "client disconnected");
    drop(handle);
    drain_writer(writer_task, &ctx.config, &username).await;

    result
}

async fn authenticate_within_deadline<R, W>(
    reader: &mut R,
    writer: &mut W,
    ctx: &SessionContext,
) -> Result<String, HandshakeError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match timeout(
        ctx.config.handshake_timeout,
        authenticate(reader, writer, ctx.credentials.as_ref()),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::TimedOut),
    }
}

/// Prompts for a username then a password and checks them verbatim.
async fn authenticate<R, W>(
    reader: &mut R,
    writer: &mut W,
    credentials: &dyn CredentialProvider,
) -> Result<String, HandshakeError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_line(writer, USERNAME_PROMPT).await?;
    let username = read_line(reader)
        .await?
        .ok_or(HandshakeError::ConnectionClosed)?;
    write_line(writer, PASSWORD_PROMPT).await?;
    let password = read_line(reader)
        .await?
        .ok_or(HandshakeError::ConnectionClosed)?;

    if credentials.authenticate(&username, &password) {
        Ok(username)
    } else {
        Err(HandshakeError::AuthenticationFailure { username })
    }
}

// Best effort: the peer may already be gone.
async fn refuse<W>(writer: &mut W, line: &str)
where
    W: AsyncWrite + Unpin,
{
    if let Err(err) = write_line(writer, line).await {
        debug!(?err, "could not deliver refusal");
    }
    let _ = writer.shutdown().await;
}

async fn run_session<R>(ctx: &SessionContext, reader: &mut R, handle: &SessionHandle) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        select! {
            line = read_line(reader) => {
                let Some(line) = line.context("failed to read from client")? else {
                    debug!(user = handle.username(), "client closed the connection");
                    return Ok(());
                };
                if !dispatch(ctx, handle, line).await? {
                    return Ok(());
                }
            }
            _ = handle.closed() => {
                anyhow::bail!("outbound connection to client failed");
            }
        }
    }
}

/// Handles one line. Returns `false` once the client has logged out.
async fn dispatch(ctx: &SessionContext, handle: &SessionHandle, line: String) -> Result<bool> {
    let username = handle.username();
    let command = match Command::parse(&line) {
        Ok(command) => command,
        Err(err) => {
            reply(handle, err.to_string()).await?;
            return Ok(true);
        }
    };

    match command {
        Command::Broadcast(text) => {
            debug!(user = %username, "broadcast");
            ctx.router.broadcast(&chat_line(username, &text)).await;
        }
        Command::Direct { recipient, text } => {
            debug!(user = %username, %recipient, "direct message");
            let failure = match ctx.router.direct(username, &recipient, &text).await {
                DirectOutcome::Delivered => None,
                DirectOutcome::Dropped => Some(CommandError::RecipientBusy(recipient)),
                DirectOutcome::RecipientOffline => Some(CommandError::UserOffline(recipient)),
            };
            if let Some(err) = failure {
                reply(handle, err.to_string()).await?;
            }
        }
        Command::SendFile { recipient, path } => {
            let outcome = relay::send_file(
                ctx.registry(),
                username,
                &recipient,
                &path,
                ctx.config.transfer_limits(),
            )
            .await;
            let line = match outcome {
                Ok(_) => protocol::file_sent_line(&recipient),
                Err(err) => {
                    warn!(user = %username, %recipient, %path, error = %err, "file relay failed");
                    err.to_string()
                }
            };
            reply(handle, line).await?;
        }
        Command::Status => {
            reply(handle, status_report(ctx.registry()).await).await?;
        }
        Command::Logout => return Ok(false),
    }
    Ok(true)
}

/// The `/status` block, one user per line in username order.
async fn status_report(registry: &Registry) -> String {
    let mut lines = vec![STATUS_HEADER.to_string()];
    lines.extend(
        registry
            .snapshot_status()
            .await
            .into_iter()
            .map(|(user, presence)| format!("{user}: {presence}")),
    );
    lines.join("\n")
}

// Replies to the session's own client wait for queue space instead of dropping.
async fn reply(handle: &SessionHandle, line: String) -> Result<()> {
    handle
        .send(Outbound::Line(line))
        .await
        .map_err(|_| anyhow::anyhow!("outbound connection to client failed"))
}

async fn drain_writer(
    mut writer_task: JoinHandle<std::io::Result<()>>,
    config: &ServerConfig,
    username: &str,
) {
    match timeout(config.drain_timeout, &mut writer_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => debug!(user = %username, ?err, "writer ended with error"),
        Ok(Err(err)) => warn!(user = %username, ?err, "writer task failed"),
        Err(_) => {
            warn!(user = %username, "client not draining output; closing");
            writer_task.abort();
        }
    }
}

/// Marks a username as owned by this session until released.
///
/// Dropping it without `release` (a panic in the session task) still
/// deregisters the user from a spawned task. The departure is only
/// broadcast if the arrival was.
struct Registration {
    ctx: Arc<SessionContext>,
    username: String,
    joined: bool,
    released: bool,
}

impl Registration {
    fn new(ctx: Arc<SessionContext>, username: String) -> Self {
        Self {
            ctx,
            username,
            joined: false,
            released: false,
        }
    }

    fn announced(&mut self) {
        self.joined = true;
    }

    async fn release(mut self) {
        self.released = true;
        leave(&self.ctx, &self.username, self.joined).await;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let ctx = Arc::clone(&self.ctx);
        let username = std::mem::take(&mut self.username);
        let joined = self.joined;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { leave(&ctx, &username, joined).await });
        }
    }
}

async fn leave(ctx: &SessionContext, username: &str, announce: bool) {
    if ctx.registry().deregister(username).await.is_some() && announce {
        ctx.router.broadcast(&left_line(username)).await;
    }
}
