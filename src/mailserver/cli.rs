// CLI commands and runtime configuration for the mail relay

use crate::mailserver::codec::DEFAULT_MAX_FRAME_BYTES;
use clap::{Parser, Subcommand};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Seconds a session may stay silent before the server logs it off
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 1800;

/// Mail relay CLI
#[derive(Debug, Parser)]
#[command(name = "mailrelay")]
#[command(about = "Store-and-forward e-mail relay with per-user mailboxes")]
pub struct MailRelayCli {
    #[command(subcommand)]
    pub command: MailRelayCommand,
}

/// Mail relay subcommands
#[derive(Debug, Subcommand)]
pub enum MailRelayCommand {
    /// Run the relay server
    Serve {
        /// TCP port to listen on
        #[arg(short, long)]
        port: u16,

        /// Directory holding users/ and files/ (default: ~/.mailrelay/server)
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Address to bind
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Seconds of silence before a session is logged off (0 disables)
        #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
        idle_timeout: u64,

        /// Largest accepted frame in bytes
        #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
        max_frame_bytes: usize,
    },

    /// Connect to a relay server and start an interactive session
    Connect {
        /// Server host name or address
        #[arg(short = 'H', long)]
        host: String,

        /// Server port
        #[arg(short, long)]
        port: u16,

        /// Local mailbox directory (default: ~/.mailrelay/client)
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Largest accepted frame in bytes
        #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
        max_frame_bytes: usize,
    },
}

impl MailRelayCli {
    /// Get the state directory
    pub fn state_dir() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(".mailrelay")
    }
}

/// Server settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub root: PathBuf,
    pub bind: IpAddr,
    pub port: u16,
    /// 0 disables the idle timeout
    pub idle_timeout_secs: u64,
    pub max_frame_bytes: usize,
}

impl ServerConfig {
    /// Defaults for everything but the port
    pub fn new(port: u16) -> Self {
        Self {
            root: MailRelayCli::state_dir().join("server"),
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// Client settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub root: PathBuf,
    pub host: String,
    pub port: u16,
    pub max_frame_bytes: usize,
}

impl ClientConfig {
    /// Defaults for everything but the server address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            root: MailRelayCli::state_dir().join("client"),
            host: host.into(),
            port,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// `host:port`, as accepted by `TcpStream::connect`
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl MailRelayCommand {
    /// Server settings for `serve`
    pub fn server_config(&self) -> Option<ServerConfig> {
        match self {
            MailRelayCommand::Serve {
                port,
                root,
                bind,
                idle_timeout,
                max_frame_bytes,
            } => {
                let mut config = ServerConfig::new(*port);
                if let Some(root) = root {
                    config.root = root.clone();
                }
                config.bind = *bind;
                config.idle_timeout_secs = *idle_timeout;
                config.max_frame_bytes = *max_frame_bytes;
                Some(config)
            }
            MailRelayCommand::Connect { .. } => None,
        }
    }

    /// Client settings for `connect`
    pub fn client_config(&self) -> Option<ClientConfig> {
        match self {
            MailRelayCommand::Connect {
                host,
                port,
                root,
                max_frame_bytes,
            } => {
                let mut config = ClientConfig::new(host.clone(), *port);
                if let Some(root) = root {
                    config.root = root.clone();
                }
                config.max_frame_bytes = *max_frame_bytes;
                Some(config)
            }
            MailRelayCommand::Serve { .. } => None,
        }
    }
}
