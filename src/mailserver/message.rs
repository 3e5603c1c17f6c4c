// Message types and wire frames for the mail relay

use serde::{Deserialize, Serialize};
use std::fmt;

/// A file carried along with a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Name or path as supplied by the sender
    pub name: String,
    /// Raw file content
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

impl Attachment {
    pub fn new(name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content,
        }
    }

    /// Final path component of the supplied name. Both `/` and `\` count as separators.
    pub fn file_name(&self) -> &str {
        self.name.rsplit(['/', '\\']).next().unwrap_or(&self.name)
    }
}

/// One logical e-mail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Address field. Holds the `;`-separated recipients when sending and the
    /// sender's identity on a delivered copy.
    pub address: String,
    pub subject: String,
    pub body: String,
    /// Present iff the message has an attachment
    #[serde(default)]
    pub attachment: Option<Attachment>,
}

impl Message {
    /// Create a message without attachment
    pub fn new(
        address: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            subject: subject.into(),
            body: body.into(),
            attachment: None,
        }
    }

    /// Attach a file to the message
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn has_attachment(&self) -> bool {
        self.attachment.is_some()
    }

    /// Distinct recipients in order of first appearance.
    ///
    /// Entries are split on `;`, trimmed, and empty entries are dropped.
    pub fn recipients(&self) -> Vec<&str> {
        let mut recipients: Vec<&str> = Vec::new();
        for entry in self.address.split(';').map(str::trim) {
            if !entry.is_empty() && !recipients.contains(&entry) {
                recipients.push(entry);
            }
        }
        recipients
    }
}

/// Command tokens of the session protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SendMessage,
    ReceiveMessages,
    StopMessageReceiving,
    Logoff,
}

impl Command {
    pub const fn token(self) -> &'static str {
        match self {
            Command::SendMessage => "sendMessage",
            Command::ReceiveMessages => "receiveMessages",
            Command::StopMessageReceiving => "stopMessageReceiving",
            Command::Logoff => "logoff",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "sendMessage" => Some(Command::SendMessage),
            "receiveMessages" => Some(Command::ReceiveMessages),
            "stopMessageReceiving" => Some(Command::StopMessageReceiving),
            "logoff" => Some(Command::Logoff),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// One unit on the wire. Every frame carries its kind, so a reader never has
/// to know which command is in flight to decode the next one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// First frame of a session, carrying the claimed identity
    Login { identity: String },
    /// A command token. Kept as a raw string so unknown tokens still decode.
    Command { token: String },
    /// Human-readable result text
    Status { text: String },
    /// A message payload
    Message { message: Message },
}

impl Frame {
    pub fn login(identity: impl Into<String>) -> Self {
        Frame::Login {
            identity: identity.into(),
        }
    }

    pub fn command(command: Command) -> Self {
        Frame::Command {
            token: command.token().to_string(),
        }
    }

    pub fn status(text: impl Into<String>) -> Self {
        Frame::Status { text: text.into() }
    }

    pub fn message(message: Message) -> Self {
        Frame::Message { message }
    }

    /// Name of the frame kind, as used by the `kind` tag
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Login { .. } => "login",
            Frame::Command { .. } => "command",
            Frame::Status { .. } => "status",
            Frame::Message { .. } => "message",
        }
    }

    /// The known command carried by this frame, if any
    pub fn as_command(&self) -> Option<Command> {
        match self {
            Frame::Command { token } => Command::from_token(token),
            _ => None,
        }
    }

    /// Serialize to a newline-terminated JSON line
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Deserialize from JSON bytes (without the trailing newline)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
