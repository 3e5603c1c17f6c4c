// Command handlers for the mail relay CLI

use crate::mailserver::cli::{ClientConfig, MailRelayCommand, ServerConfig};
use crate::mailserver::client::MailClient;
use crate::mailserver::server::MailServer;
use crate::mailserver::storage::MailboxStore;
use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::net::TcpStream;

/// Execute a mail relay command
pub async fn execute_command(command: MailRelayCommand) -> Result<()> {
    if let Some(config) = command.server_config() {
        return handle_serve(config).await;
    }
    if let Some(config) = command.client_config() {
        return handle_connect(config).await;
    }
    anyhow::bail!("Unsupported command: {:?}", command)
}

async fn handle_serve(config: ServerConfig) -> Result<()> {
    tracing::debug!("Server configuration: {:?}", config);

    let server = MailServer::new(config)?;
    let listener = server.bind().await?;
    let local = listener
        .local_addr()
        .context("Failed to read listener address")?;

    println!("**** Welcome to our E-Mail Server! ****");
    println!("\nListening on port: {}", local.port());
    println!("  Mailboxes: {:?}", server.store().users_dir());
    println!("  Attachments: {:?}", server.store().files_dir());
    println!("\nPress Ctrl+C to stop the server");

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nStopping server...");
            shutdown.cancel();
        }
    });

    server.serve(listener).await
}

async fn handle_connect(config: ClientConfig) -> Result<()> {
    tracing::debug!("Client configuration: {:?}", config);

    let store = MailboxStore::open(&config.root)
        .with_context(|| format!("Failed to open local mailbox at {:?}", config.root))?;

    let stream = TcpStream::connect(config.server_addr())
        .await
        .with_context(|| format!("Server not found: {}", config.server_addr()))?;
    let (reader, writer) = stream.into_split();

    println!("Connected to the e-mail server\n");
    print_usage();

    let client = MailClient::new(store, config.max_frame_bytes);
    client
        .run(BufReader::new(tokio::io::stdin()), reader, writer)
        .await
}

fn print_usage() {
    println!("*** ------------------- Welcome to our E-Mail Server! --------------------- ***");
    println!("*** First you need to login using your e-mail address                       ***");
    println!("*** Then you can use the commands listed below:                             ***");
    println!("*** \t/sendMessage     - you'll be able to type a text message.           ***");
    println!("*** \t/receiveMessages - you'll be able to download all your e-mails.     ***");
    println!("*** \t/logoff          - you'll log out and terminate the client program. ***");
    println!("*** ----------------------------------------------------------------------- ***");
}
