//! Server side of the session protocol.
//!
//! One [`ServerSession`] drives one connection through
//! `AwaitingIdentity → CommandLoop → LoggedOff`:
//!
//! - the first frame must be a `login` carrying the identity
//! - `sendMessage` is followed by exactly one `message` frame, which is
//!   delivered and answered with `sendMessage` + a status text
//! - `receiveMessages` streams every received record as a
//!   `receiveMessages` + `message` pair and ends with `stopMessageReceiving`
//! - anything else (unknown token, stray frame, EOF, idle timeout,
//!   cancellation) is an implicit logoff
//!
//! Decode and persistence failures inside a command are reported to the
//! client as status text and never end the session. Only transport
//! failures do.

use crate::mailserver::codec::{read_frame, FrameCodec, FrameReader, FrameWriter};
use crate::mailserver::error::{
    DecodeError, PersistenceError, Result, SessionError, TransportError,
};
use crate::mailserver::message::{Command, Frame};
use crate::mailserver::registry::ConnectionRegistry;
use crate::mailserver::storage::MailboxStore;
use futures::SinkExt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Longest wait for the peer to take the final `logoff` and close
const FAREWELL_TIMEOUT: Duration = Duration::from_secs(2);

/// Status text for a successful upload
pub const SEND_OK: &str = "E-mail sent to server successfully!";

/// Shared resources every session needs
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub store: Arc<MailboxStore>,
    pub registry: Arc<ConnectionRegistry>,
    /// Longest wait for the next frame before the session is dropped
    pub idle_timeout: Option<Duration>,
    pub max_frame_bytes: usize,
}

/// Protocol state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingIdentity,
    CommandLoop,
    LoggedOff,
}

/// What to do after a command
enum Flow {
    Continue,
    LogOff,
}

/// One server-side connection
pub struct ServerSession<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    ctx: SessionContext,
    peer: Option<SocketAddr>,
    cancel: CancellationToken,
    state: SessionState,
    session_id: Option<Uuid>,
}

impl<R, W> ServerSession<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Create a session over the two halves of a connection
    pub fn new(
        reader: R,
        writer: W,
        ctx: SessionContext,
        peer: Option<SocketAddr>,
        cancel: CancellationToken,
    ) -> Self {
        let codec = FrameCodec::with_max_length(ctx.max_frame_bytes);

        Self {
            reader: FramedRead::new(reader, codec.clone()),
            writer: FramedWrite::new(writer, codec),
            ctx,
            peer,
            cancel,
            state: SessionState::AwaitingIdentity,
            session_id: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to completion, releasing its registry entry and
    /// connection however it ends.
    pub async fn run(mut self) -> Result<()> {
        let outcome = match self.drive().await {
            Err(SessionError::Transport(TransportError::Cancelled)) => {
                tracing::info!("Session {:?} cancelled during a transfer", self.session_id);
                Ok(())
            }
            outcome => outcome,
        };

        if let Some(session_id) = self.session_id.take() {
            self.ctx.registry.unregister(session_id).await;
        }
        self.state = SessionState::LoggedOff;

        match tokio::time::timeout(FAREWELL_TIMEOUT, self.writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Error closing connection: {}", e),
            Err(_) => tracing::debug!("Peer did not take the final bytes, dropping connection"),
        }

        outcome
    }

    async fn drive(&mut self) -> Result<()> {
        let identity = match self.next_frame().await? {
            Some(Ok(Frame::Login { identity })) if !identity.trim().is_empty() => {
                identity.trim().to_string()
            }
            Some(Ok(other)) => {
                tracing::warn!("Expected login, got {} frame; closing", other.kind());
                self.send_logoff().await;
                return Ok(());
            }
            Some(Err(e)) => {
                tracing::warn!("Undecodable login frame: {}", e);
                self.send_logoff().await;
                return Ok(());
            }
            None => return Ok(()),
        };

        if let Err(e) = self.ctx.store.ensure_mailbox(&identity) {
            tracing::warn!("Rejecting login for {:?}: {}", identity, e);
            self.write_frame(Frame::status(e.to_string()), false).await?;
            self.send_logoff().await;
            return Ok(());
        }

        let registration = self
            .ctx
            .registry
            .register(&identity, self.peer, self.cancel.clone())
            .await;
        self.session_id = Some(registration.session_id);
        self.state = SessionState::CommandLoop;

        loop {
            let frame = match self.next_frame().await? {
                Some(frame) => frame,
                None => {
                    self.send_logoff().await;
                    break;
                }
            };

            let flow = match frame.as_ref().ok().and_then(Frame::as_command) {
                Some(Command::SendMessage) => self.handle_send(&identity).await?,
                Some(Command::ReceiveMessages) => self.handle_receive(&identity).await?,
                _ => {
                    tracing::debug!("Implicit logoff for {} on {:?}", identity, frame);
                    Flow::LogOff
                }
            };

            if let Flow::LogOff = flow {
                self.send_logoff().await;
                break;
            }
        }

        Ok(())
    }

    /// Next frame, or `None` when the peer went away, went idle, or the
    /// session was cancelled.
    async fn next_frame(&mut self) -> Result<Option<std::result::Result<Frame, DecodeError>>> {
        let idle_timeout = self.ctx.idle_timeout;

        tokio::select! {
            _ = self.cancel.cancelled() => {
                tracing::info!("Session {:?} cancelled", self.session_id);
                Ok(None)
            }
            next = read_frame(&mut self.reader, idle_timeout) => match next {
                Ok(frame) => Ok(frame),
                Err(TransportError::IdleTimeout(secs)) => {
                    tracing::info!("Session {:?} idle for {}s, logging off", self.session_id, secs);
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Queue a frame, flushing when `flush` is set. Gives up when the session
    /// is cancelled or the peer stops reading for longer than the idle timeout.
    async fn write_frame(
        &mut self,
        frame: Frame,
        flush: bool,
    ) -> std::result::Result<(), TransportError> {
        let writer = &mut self.writer;
        let cancel = &self.cancel;

        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            written = bounded_write(writer, frame, flush, self.ctx.idle_timeout) => written,
        }
    }

    async fn handle_send(&mut self, identity: &str) -> Result<Flow> {
        let status = match self.next_frame().await? {
            Some(Ok(Frame::Message { message })) => {
                let sender = identity.to_string();
                let delivered =
                    with_store(&self.ctx.store, move |store| store.deliver(&sender, &message)).await;
                match delivered {
                    Ok(report) if report.is_complete() => SEND_OK.to_string(),
                    Ok(report) => format!(
                        "Error while saving the e-mail: {}",
                        report.failure_summary()
                    ),
                    Err(e) => format!("Error while saving the e-mail: {}", e),
                }
            }
            Some(Ok(other)) => {
                let err = DecodeError::UnexpectedFrame {
                    expected: "message",
                    found: other.kind(),
                };
                format!("Object could not be decoded: {}", err)
            }
            Some(Err(e)) => format!("Object could not be decoded: {}", e),
            None => return Ok(Flow::LogOff),
        };

        tracing::debug!("sendMessage from {}: {}", identity, status);

        self.write_frame(Frame::command(Command::SendMessage), false).await?;
        self.write_frame(Frame::status(status), true).await?;
        Ok(Flow::Continue)
    }

    async fn handle_receive(&mut self, identity: &str) -> Result<Flow> {
        let owner = identity.to_string();
        let ids = match with_store(&self.ctx.store, move |store| store.list(&owner)).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!("Listing mailbox of {} failed: {}", identity, e);
                let text = format!("Error while downloading your e-mails: {}", e);
                self.write_frame(Frame::status(text), false).await?;
                Vec::new()
            }
        };

        let mut delivered = 0usize;
        for id in &ids {
            let (owner, record_id) = (identity.to_string(), id.clone());
            let read = with_store(&self.ctx.store, move |store| store.read(&owner, &record_id)).await;
            let message = match read {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!("Reading {} for {} failed: {}", id, identity, e);
                    let text = format!("Error while downloading your e-mails: {}", e);
                    self.write_frame(Frame::status(text), false).await?;
                    continue;
                }
            };

            self.write_frame(Frame::command(Command::ReceiveMessages), false)
                .await?;
            match self.write_frame(Frame::message(message), false).await {
                Ok(()) => delivered += 1,
                // Refused by the encoder before anything was written
                Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::InvalidInput => {
                    let text = format!("Error while downloading your e-mails: {}: {}", id, e);
                    self.write_frame(Frame::status(text), false).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.write_frame(Frame::command(Command::StopMessageReceiving), true)
            .await?;

        tracing::info!("Sent {} of {} message(s) to {}", delivered, ids.len(), identity);
        Ok(Flow::Continue)
    }

    /// Best effort: the peer may already be gone or no longer reading
    async fn send_logoff(&mut self) {
        let frame = Frame::command(Command::Logoff);
        if let Err(e) = bounded_write(&mut self.writer, frame, true, Some(FAREWELL_TIMEOUT)).await {
            tracing::debug!("Could not send logoff: {}", e);
        }
    }
}

/// Run a store operation on the blocking pool
async fn with_store<T, F>(
    store: &Arc<MailboxStore>,
    op: F,
) -> std::result::Result<T, PersistenceError>
where
    F: FnOnce(&MailboxStore) -> std::result::Result<T, PersistenceError> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || op(&store)).await?
}

/// Write one frame, bounded by `limit` when set
async fn bounded_write<W>(
    writer: &mut FrameWriter<W>,
    frame: Frame,
    flush: bool,
    limit: Option<Duration>,
) -> std::result::Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        if flush {
            writer.send(frame).await
        } else {
            writer.feed(frame).await
        }
    };

    match limit {
        Some(limit) => tokio::time::timeout(limit, write)
            .await
            .map_err(|_| TransportError::WriteTimeout(limit.as_secs()))?
            .map_err(TransportError::from),
        None => write.await.map_err(TransportError::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailserver::codec::DEFAULT_MAX_FRAME_BYTES;
    use crate::mailserver::message::{Attachment, Message};
    use futures::StreamExt;
    use tempfile::{tempdir, TempDir};
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;

    struct Peer {
        reader: FrameReader<ReadHalf<DuplexStream>>,
        writer: FrameWriter<WriteHalf<DuplexStream>>,
        task: JoinHandle<Result<()>>,
        cancel: CancellationToken,
    }

    impl Peer {
        async fn send(&mut self, frame: Frame) {
            self.writer.send(frame).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Frame> {
            self.reader.next().await.map(|item| item.unwrap().unwrap())
        }
    }

    fn context(dir: &TempDir, idle_timeout: Option<Duration>) -> SessionContext {
        SessionContext {
            store: Arc::new(MailboxStore::open(dir.path()).unwrap()),
            registry: Arc::new(ConnectionRegistry::new()),
            idle_timeout,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    fn connect(ctx: &SessionContext) -> Peer {
        connect_with_capacity(ctx, 1 << 20)
    }

    fn connect_with_capacity(ctx: &SessionContext, capacity: usize) -> Peer {
        let (client_io, server_io) = tokio::io::duplex(capacity);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (client_read, client_write) = tokio::io::split(client_io);

        let cancel = CancellationToken::new();
        let session = ServerSession::new(server_read, server_write, ctx.clone(), None, cancel.clone());
        assert_eq!(session.state(), SessionState::AwaitingIdentity);

        Peer {
            reader: FramedRead::new(client_read, FrameCodec::new()),
            writer: FramedWrite::new(client_write, FrameCodec::new()),
            task: tokio::spawn(session.run()),
            cancel,
        }
    }

    async fn login(ctx: &SessionContext, identity: &str) -> Peer {
        let mut peer = connect(ctx);
        peer.send(Frame::login(identity)).await;
        peer
    }

    #[tokio::test]
    async fn test_fetch_empty_mailbox() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, None);
        let mut peer = login(&ctx, "a@x").await;

        peer.send(Frame::command(Command::ReceiveMessages)).await;
        assert_eq!(
            peer.recv().await,
            Some(Frame::command(Command::StopMessageReceiving))
        );
        assert!(ctx.registry.is_online("a@x").await);

        peer.send(Frame::command(Command::Logoff)).await;
        assert_eq!(peer.recv().await, Some(Frame::command(Command::Logoff)));
        assert_eq!(peer.recv().await, None);
        peer.task.await.unwrap().unwrap();
        assert!(!ctx.registry.is_online("a@x").await);
    }

    #[tokio::test]
    async fn test_send_then_fetch() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, None);

        let mut sender = login(&ctx, "a@x").await;
        let msg = Message::new("b@x;c@x", "Hi", "Hello")
            .with_attachment(Attachment::new("/tmp/notes.txt", b"attached".to_vec()));

        sender.send(Frame::command(Command::SendMessage)).await;
        sender.send(Frame::message(msg)).await;
        assert_eq!(sender.recv().await, Some(Frame::command(Command::SendMessage)));
        assert_eq!(sender.recv().await, Some(Frame::status(SEND_OK)));

        let mut receiver = login(&ctx, "b@x").await;
        receiver.send(Frame::command(Command::ReceiveMessages)).await;
        assert_eq!(
            receiver.recv().await,
            Some(Frame::command(Command::ReceiveMessages))
        );
        match receiver.recv().await {
            Some(Frame::Message { message }) => {
                assert_eq!(message.address, "a@x");
                assert_eq!(message.subject, "Hi");
                assert_eq!(message.body, "Hello");
                assert_eq!(message.attachment.unwrap().content, b"attached".to_vec());
            }
            other => panic!("expected message, got {:?}", other),
        }
        assert_eq!(
            receiver.recv().await,
            Some(Frame::command(Command::StopMessageReceiving))
        );

        assert_eq!(ctx.registry.online_identities().await, vec!["a@x", "b@x"]);
    }

    #[tokio::test]
    async fn test_malformed_payload_keeps_session() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, None);
        let mut peer = login(&ctx, "a@x").await;

        peer.send(Frame::command(Command::SendMessage)).await;
        peer.writer
            .get_mut()
            .write_all(b"{\"kind\":\"message\"}\n")
            .await
            .unwrap();

        assert_eq!(peer.recv().await, Some(Frame::command(Command::SendMessage)));
        match peer.recv().await {
            Some(Frame::Status { text }) => assert!(text.starts_with("Object could not be decoded")),
            other => panic!("expected status, got {:?}", other),
        }

        peer.send(Frame::command(Command::SendMessage)).await;
        peer.send(Frame::status("not a message")).await;
        assert_eq!(peer.recv().await, Some(Frame::command(Command::SendMessage)));
        match peer.recv().await {
            Some(Frame::Status { text }) => assert!(text.contains("expected a message frame")),
            other => panic!("expected status, got {:?}", other),
        }

        peer.send(Frame::command(Command::ReceiveMessages)).await;
        assert_eq!(
            peer.recv().await,
            Some(Frame::command(Command::StopMessageReceiving))
        );
    }

    #[tokio::test]
    async fn test_persistence_failure_is_reported() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, None);
        let mut peer = login(&ctx, "a@x").await;

        peer.send(Frame::command(Command::SendMessage)).await;
        peer.send(Frame::message(Message::new(" ; ", "s", "b"))).await;

        assert_eq!(peer.recv().await, Some(Frame::command(Command::SendMessage)));
        match peer.recv().await {
            Some(Frame::Status { text }) => {
                assert!(text.starts_with("Error while saving the e-mail"))
            }
            other => panic!("expected status, got {:?}", other),
        }
        assert!(ctx.registry.is_online("a@x").await);
    }

    #[tokio::test]
    async fn test_unknown_token_is_implicit_logoff() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, None);
        let mut peer = login(&ctx, "a@x").await;

        peer.send(Frame::Command {
            token: "delete".to_string(),
        })
        .await;
        assert_eq!(peer.recv().await, Some(Frame::command(Command::Logoff)));
        assert_eq!(peer.recv().await, None);

        peer.task.await.unwrap().unwrap();
        assert_eq!(ctx.registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_first_frame_must_be_login() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, None);
        let mut peer = connect(&ctx);

        peer.send(Frame::command(Command::ReceiveMessages)).await;
        assert_eq!(peer.recv().await, Some(Frame::command(Command::Logoff)));
        assert_eq!(peer.recv().await, None);
        assert_eq!(ctx.registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_identity_is_refused() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, None);
        let mut peer = login(&ctx, "../etc").await;

        assert!(matches!(peer.recv().await, Some(Frame::Status { .. })));
        assert_eq!(peer.recv().await, Some(Frame::command(Command::Logoff)));
        assert_eq!(peer.recv().await, None);
        assert_eq!(ctx.registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_second_login_evicts_first_session() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, None);

        let mut first = login(&ctx, "a@x").await;
        first.send(Frame::command(Command::ReceiveMessages)).await;
        assert_eq!(
            first.recv().await,
            Some(Frame::command(Command::StopMessageReceiving))
        );

        let mut second = login(&ctx, "a@x").await;
        assert_eq!(first.recv().await, Some(Frame::command(Command::Logoff)));
        assert_eq!(first.recv().await, None);

        second.send(Frame::command(Command::ReceiveMessages)).await;
        assert_eq!(
            second.recv().await,
            Some(Frame::command(Command::StopMessageReceiving))
        );
        assert!(ctx.registry.is_online("a@x").await);
        assert_eq!(ctx.registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_idle_timeout_logs_off() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, Some(Duration::from_millis(100)));
        let mut peer = login(&ctx, "a@x").await;

        assert_eq!(peer.recv().await, Some(Frame::command(Command::Logoff)));
        assert_eq!(peer.recv().await, None);
        peer.task.await.unwrap().unwrap();
        assert!(!ctx.registry.is_online("a@x").await);
    }

    #[tokio::test]
    async fn test_cancel_ends_session() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, None);
        let mut peer = login(&ctx, "a@x").await;

        peer.send(Frame::command(Command::ReceiveMessages)).await;
        assert!(peer.recv().await.is_some());

        peer.cancel.cancel();
        assert_eq!(peer.recv().await, Some(Frame::command(Command::Logoff)));
        assert_eq!(peer.recv().await, None);
    }

    /// A peer that asks for a large mailbox over a tiny pipe and never reads
    async fn stalled_fetch(ctx: &SessionContext) -> Peer {
        let body = "x".repeat(4096);
        for i in 0..50 {
            let msg = Message::new("a@x", format!("Subject {}", i), body.clone());
            let report = ctx.store.deliver("b@x", &msg).unwrap();
            assert!(report.is_complete());
        }

        let mut peer = connect_with_capacity(ctx, 1024);
        peer.send(Frame::login("a@x")).await;
        peer.send(Frame::command(Command::ReceiveMessages)).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        peer
    }

    #[tokio::test]
    async fn test_cancel_ends_stalled_fetch() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, None);
        let peer = stalled_fetch(&ctx).await;
        assert!(ctx.registry.is_online("a@x").await);

        peer.cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(10), peer.task)
            .await
            .expect("session did not end after cancel");
        outcome.unwrap().unwrap();
        assert!(!ctx.registry.is_online("a@x").await);
        assert_eq!(ctx.registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_write_deadline_ends_stalled_fetch() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, Some(Duration::from_millis(200)));
        let peer = stalled_fetch(&ctx).await;

        let outcome = tokio::time::timeout(Duration::from_secs(10), peer.task)
            .await
            .expect("session did not give up on a stalled peer");
        assert!(matches!(
            outcome.unwrap(),
            Err(SessionError::Transport(TransportError::WriteTimeout(_)))
        ));
        assert!(!ctx.registry.is_online("a@x").await);
    }

    #[tokio::test]
    async fn test_login_identity_is_trimmed() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, None);

        let mut sender = login(&ctx, "a@x").await;
        sender.send(Frame::command(Command::SendMessage)).await;
        sender
            .send(Frame::message(Message::new("b@x", "Hi", "Hello")))
            .await;
        assert_eq!(sender.recv().await, Some(Frame::command(Command::SendMessage)));
        assert_eq!(sender.recv().await, Some(Frame::status(SEND_OK)));

        let mut receiver = login(&ctx, "  b@x \t").await;
        receiver.send(Frame::command(Command::ReceiveMessages)).await;
        assert_eq!(
            receiver.recv().await,
            Some(Frame::command(Command::ReceiveMessages))
        );
        match receiver.recv().await {
            Some(Frame::Message { message }) => assert_eq!(message.body, "Hello"),
            other => panic!("expected message, got {:?}", other),
        }
        assert!(ctx.registry.is_online("b@x").await);
        assert!(!ctx.registry.is_online("  b@x \t").await);
        assert!(!ctx.store.users_dir().join("  b@x \t").exists());
    }
}
