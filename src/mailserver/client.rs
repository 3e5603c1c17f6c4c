//! Interactive client: one connection, two tasks.
//!
//! The outbound task owns the write half. It reads user input, validates
//! commands locally and composes messages. The inbound task owns the read
//! half and dispatches on frame kind, saving fetched messages to the local
//! mailbox. Whichever side sees the session end cancels the shared token so
//! the other one stops too.

use crate::mailserver::codec::{read_frame, FrameCodec, FrameReader, FrameWriter};
use crate::mailserver::message::{Attachment, Command, Frame, Message};
use crate::mailserver::storage::MailboxStore;
use anyhow::{Context, Result};
use futures::SinkExt;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, Lines};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// Printed for input that is not a known command
pub const INVALID_COMMAND: &str = "Invalid command, please enter a new one";

/// Parse a user command line. A leading `/` is optional.
///
/// Only `sendMessage`, `receiveMessages` and `logoff` may be typed.
pub fn parse_user_command(line: &str) -> Option<Command> {
    let line = line.trim();
    let token = line.strip_prefix('/').unwrap_or(line);

    match Command::from_token(token)? {
        Command::StopMessageReceiving => None,
        command => Some(command),
    }
}

/// `y`, `yes` in any case
fn is_yes(answer: &str) -> bool {
    let answer = answer.trim();
    answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes")
}

/// Client side of a relay session
pub struct MailClient {
    store: Arc<MailboxStore>,
    max_frame_bytes: usize,
}

impl MailClient {
    /// Client saving downloads into `store`
    pub fn new(store: MailboxStore, max_frame_bytes: usize) -> Self {
        Self {
            store: Arc::new(store),
            max_frame_bytes,
        }
    }

    pub fn store(&self) -> &MailboxStore {
        &self.store
    }

    /// Log in and run both tasks until the session ends.
    ///
    /// `input` supplies user lines (stdin in the binary).
    pub async fn run<I, R, W>(&self, input: I, reader: R, writer: W) -> Result<()>
    where
        I: AsyncBufRead + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let codec = FrameCodec::with_max_length(self.max_frame_bytes);
        let mut input = input.lines();
        let never = CancellationToken::new();

        let identity = loop {
            let line = next_line(&mut input, "\nEnter your e-mail login address: ", &never)
                .await?
                .context("No login address given")?;
            let line = line.trim();
            if !line.is_empty() {
                break line.to_string();
            }
        };

        self.store
            .ensure_mailbox(&identity)
            .with_context(|| format!("Cannot use {:?} as a login address", identity))?;

        let mut frames = FramedWrite::new(writer, codec.clone());
        frames
            .send(Frame::login(identity.as_str()))
            .await
            .context("Error writing to server")?;
        tracing::info!("Logged in as {}", identity);

        let cancel = CancellationToken::new();

        let inbound = tokio::spawn(inbound_loop(
            FramedRead::new(reader, codec),
            self.store.clone(),
            identity.clone(),
            cancel.clone(),
        ));
        let outbound = tokio::spawn(outbound_loop(
            input,
            frames,
            identity,
            self.max_frame_bytes,
            cancel.clone(),
        ));

        let (inbound, outbound) = tokio::join!(inbound, outbound);
        outbound.context("Outbound task panicked")??;
        inbound.context("Inbound task panicked")??;

        Ok(())
    }
}

/// Prompt and wait for one input line. `None` when input ends or the
/// session is over.
async fn next_line<I>(
    input: &mut Lines<I>,
    prompt: &str,
    cancel: &CancellationToken,
) -> Result<Option<String>>
where
    I: AsyncBufRead + Unpin,
{
    print!("{}", prompt);
    if let Err(e) = std::io::stdout().flush() {
        tracing::debug!("Could not flush prompt: {}", e);
    }

    tokio::select! {
        _ = cancel.cancelled() => Ok(None),
        line = input.next_line() => line.context("Failed to read input"),
    }
}

async fn outbound_loop<I, W>(
    mut input: Lines<I>,
    mut writer: FrameWriter<W>,
    identity: String,
    max_frame_bytes: usize,
    cancel: CancellationToken,
) -> Result<()>
where
    I: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let prompt = format!("[{}]: ", identity);

    loop {
        let Some(line) = next_line(&mut input, &prompt, &cancel).await? else {
            if !cancel.is_cancelled() {
                // Input closed: leave like an explicit logoff
                writer
                    .send(Frame::command(Command::Logoff))
                    .await
                    .context("Error writing to server")?;
            }
            break;
        };

        let Some(command) = parse_user_command(&line) else {
            println!("{}", INVALID_COMMAND);
            continue;
        };

        match command {
            Command::SendMessage => {
                let Some(message) = compose(&mut input, max_frame_bytes, &cancel).await? else {
                    continue;
                };
                println!("\nYour message is being uploaded to the server");
                writer.feed(Frame::command(Command::SendMessage)).await?;
                writer
                    .send(Frame::message(message))
                    .await
                    .context("Error writing to server")?;
            }
            Command::Logoff => {
                writer
                    .send(Frame::command(Command::Logoff))
                    .await
                    .context("Error writing to server")?;
                println!("Logging out...");
                break;
            }
            command => {
                writer
                    .send(Frame::command(command))
                    .await
                    .context("Error writing to server")?;
            }
        }
    }

    tracing::debug!("Outbound task for {} finished", identity);
    Ok(())
}

/// Collect one message from the user
async fn compose<I>(
    input: &mut Lines<I>,
    max_frame_bytes: usize,
    cancel: &CancellationToken,
) -> Result<Option<Message>>
where
    I: AsyncBufRead + Unpin,
{
    println!("\n*** To send a message to multiple addressees, use ';' as separator");

    let prompts = [
        "\nChoose the addressee(s) which you wish to send an e-mail to: ",
        "\nPlease type the subject of your e-mail: ",
        "\nPlease type the body of your e-mail: ",
        "\nWould you like do attach a file to your message? (y/n): ",
    ];
    let mut answers = Vec::with_capacity(prompts.len());
    for prompt in prompts {
        match next_line(input, prompt, cancel).await? {
            Some(answer) => answers.push(answer),
            None => return Ok(None),
        }
    }

    let mut message = Message::new(&answers[0], &answers[1], &answers[2]);

    if is_yes(&answers[3]) {
        let Some(path) = next_line(input, "\nPlease enter the file path: ", cancel).await? else {
            return Ok(None);
        };
        let path = path.trim();

        match tokio::fs::read(path).await {
            Ok(content) => message = message.with_attachment(Attachment::new(path, content)),
            Err(e) => println!("Could not read {}: {}. Sending without attachment", path, e),
        }
    }

    if message.has_attachment() && encoded_len(&message)? > max_frame_bytes {
        println!("Attachment is too large to send. Sending without attachment");
        message.attachment = None;
    }

    Ok(Some(message))
}

fn encoded_len(message: &Message) -> Result<usize> {
    let bytes = Frame::message(message.clone())
        .to_bytes()
        .context("Failed to encode message")?;
    Ok(bytes.len() - 1)
}

async fn inbound_loop<R>(
    mut reader: FrameReader<R>,
    store: Arc<MailboxStore>,
    identity: String,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut downloaded = 0usize;

    let outcome = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            next = read_frame(&mut reader, None) => next,
        };

        let frame = match next {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                println!("Object could not be decoded: {}", e);
                continue;
            }
            Ok(None) => {
                tracing::info!("Server closed the connection");
                break Ok(());
            }
            Err(e) => break Err(anyhow::Error::new(e).context("Error reading from server")),
        };

        match frame {
            Frame::Status { text } => println!("{}", text),
            Frame::Message { message } => match store.store_download(&identity, &message) {
                Ok(path) => {
                    downloaded += 1;
                    tracing::debug!("Saved message from {} to {:?}", message.address, path);
                }
                Err(e) => println!("Error recording the e-mail: {}", e),
            },
            Frame::Command { token } => match Command::from_token(&token) {
                Some(Command::StopMessageReceiving) => {
                    if downloaded > 0 {
                        println!("E-mail(s) downloaded successfully!");
                    } else {
                        println!("There are no e-mails to download");
                    }
                    downloaded = 0;
                }
                Some(Command::Logoff) => {
                    tracing::info!("Session of {} ended by server", identity);
                    break Ok(());
                }
                // Markers in front of a status or message frame
                Some(Command::SendMessage | Command::ReceiveMessages) => {}
                None => tracing::debug!("Ignoring unknown command {:?}", token),
            },
            Frame::Login { .. } => tracing::debug!("Ignoring login frame from server"),
        }
    };

    cancel.cancel();
    outcome
}
