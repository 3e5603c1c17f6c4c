// Mail relay module
//
// A store-and-forward relay: clients log in with an identity, upload
// messages for one or more recipients and download their mailbox. The
// server keeps every mailbox on disk, so recipients need not be online
// when a message is sent.

pub mod error;
pub mod message;
pub mod codec;
pub mod record;
pub mod storage;
pub mod registry;
pub mod session;
pub mod server;
pub mod client;
pub mod cli;
pub mod commands;

pub use error::{DecodeError, PersistenceError, SessionError, TransportError};
pub use message::{Attachment, Command, Frame, Message};
pub use codec::{FrameCodec, DEFAULT_MAX_FRAME_BYTES};
pub use record::{Record, Role};
pub use storage::{DeliveryReport, MailboxStore};
pub use registry::{ConnectionRegistry, Registration, SessionEntry};
pub use session::{ServerSession, SessionContext, SessionState};
pub use server::MailServer;
pub use client::{parse_user_command, MailClient};
pub use cli::{ClientConfig, MailRelayCli, MailRelayCommand, ServerConfig};
pub use commands::execute_command;
