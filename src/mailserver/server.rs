// TCP front end of the relay

use crate::mailserver::cli::ServerConfig;
use crate::mailserver::registry::ConnectionRegistry;
use crate::mailserver::session::{ServerSession, SessionContext};
use crate::mailserver::storage::MailboxStore;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A relay server: one listener, one task per connection
pub struct MailServer {
    config: ServerConfig,
    ctx: SessionContext,
    shutdown: CancellationToken,
}

impl MailServer {
    /// Open the mailbox store under the configured root
    pub fn new(config: ServerConfig) -> Result<Self> {
        let store = MailboxStore::open(&config.root)
            .with_context(|| format!("Failed to open mailbox store at {:?}", config.root))?;

        let ctx = SessionContext {
            store: Arc::new(store),
            registry: Arc::new(ConnectionRegistry::new()),
            idle_timeout: config.idle_timeout(),
            max_frame_bytes: config.max_frame_bytes,
        };

        Ok(Self {
            config,
            ctx,
            shutdown: CancellationToken::new(),
        })
    }

    /// Get server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MailboxStore> {
        &self.ctx.store
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.ctx.registry
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting connections and end every live session
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.listen_addr();
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))
    }

    /// Bind and serve until shut down
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shut down, then wait for the
    /// live sessions to log off.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener
            .local_addr()
            .context("Failed to read listener address")?;
        tracing::info!("Listening on {}", local);

        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Listener shutting down");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            tracing::info!("New user connected: {}", peer);
                            sessions.spawn(handle_connection(
                                stream,
                                peer,
                                self.ctx.clone(),
                                self.shutdown.child_token(),
                            ));
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Session task failed: {}", e);
                    }
                }
            }
        }

        // Sessions hold child tokens, so they are already cancelled
        self.ctx.registry.cancel_all().await;
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Session task failed: {}", e);
            }
        }

        tracing::info!("Server on {} stopped", local);
        Ok(())
    }
}

/// Run one session over an accepted connection
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: SessionContext,
    cancel: CancellationToken,
) {
    let (reader, writer) = stream.into_split();
    let session = ServerSession::new(reader, writer, ctx, Some(peer), cancel);

    if let Err(e) = session.run().await {
        tracing::warn!("Session with {} ended with error: {}", peer, e);
    }

    tracing::debug!("Connection from {} closed", peer);
}
