// Persistent per-user mailboxes on the filesystem
//
// Layout under the root directory:
//
//   users/<identity>/received-<stamp>[-n].txt
//   users/<identity>/sent-<stamp>[-n].txt
//   files/<name>-<stamp>[-n].<ext>
//
// Files are written to a temporary sibling first and published with a
// no-clobber hard link, so a published name never holds a partial write and
// two deliveries in the same second never overwrite each other.

use crate::mailserver::error::PersistenceError;
use crate::mailserver::message::{Attachment, Message};
use crate::mailserver::record::{
    attachment_file_name, format_stamp, is_record_of, local_file_name, record_file_name,
    record_order_key, Record, Role,
};
use chrono::Local;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

type Result<T> = std::result::Result<T, PersistenceError>;

/// Upper bound on `-n` disambiguators tried for one name
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Outcome of delivering one message
#[derive(Debug)]
pub struct DeliveryReport {
    /// Stamp shared by every file of this delivery
    pub stamp: String,
    /// Stored attachment file name, if the message had one
    pub attachment: Option<String>,
    /// Recipients that got a `received` record, with the record path
    pub delivered: Vec<(String, PathBuf)>,
    /// The sender's `sent` record
    pub sent: Option<PathBuf>,
    /// Records or the attachment that could not be written, keyed by owner or file name
    pub failures: Vec<(String, PersistenceError)>,
}

impl DeliveryReport {
    fn new(stamp: &str) -> Self {
        Self {
            stamp: stamp.to_string(),
            attachment: None,
            delivered: Vec::new(),
            sent: None,
            failures: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// One line describing every failed record
    pub fn failure_summary(&self) -> String {
        self.failures
            .iter()
            .map(|(owner, err)| format!("{}: {}", owner, err))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Mailbox storage rooted at one directory
#[derive(Debug, Clone)]
pub struct MailboxStore {
    users_dir: PathBuf,
    files_dir: PathBuf,
}

impl MailboxStore {
    /// Open a store, creating the root, user and attachment directories if needed
    pub fn open(root: &Path) -> Result<Self> {
        let users_dir = root.join("users");
        let files_dir = root.join("files");

        for dir in [&users_dir, &files_dir] {
            fs::create_dir_all(dir).map_err(|source| PersistenceError::Write {
                path: dir.clone(),
                source,
            })?;
        }

        Ok(Self {
            users_dir,
            files_dir,
        })
    }

    pub fn users_dir(&self) -> &Path {
        &self.users_dir
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    /// Directory of an identity's mailbox. Does not create it.
    pub fn mailbox_dir(&self, identity: &str) -> Result<PathBuf> {
        let invalid = identity.is_empty()
            || identity == "."
            || identity == ".."
            || identity.contains(['/', '\\', '\0']);

        if invalid {
            return Err(PersistenceError::InvalidIdentity(identity.to_string()));
        }

        Ok(self.users_dir.join(identity))
    }

    /// Create an identity's mailbox directory. A no-op if it already exists.
    pub fn ensure_mailbox(&self, identity: &str) -> Result<PathBuf> {
        let dir = self.mailbox_dir(identity)?;
        fs::create_dir_all(&dir).map_err(|source| PersistenceError::Write {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }

    /// Persist one record into `owner`'s mailbox
    pub fn write(&self, owner: &str, role: Role, record: &Record, stamp: &str) -> Result<PathBuf> {
        let dir = self.ensure_mailbox(owner)?;
        let (path, _) = publish(&dir, record.encode().as_bytes(), |attempt| {
            record_file_name(role, stamp, attempt)
        })?;

        tracing::debug!("Wrote {} record {:?}", role.as_str(), path);
        Ok(path)
    }

    /// Store an attachment once in the shared directory. Returns its file name.
    pub fn write_attachment(&self, attachment: &Attachment, stamp: &str) -> Result<String> {
        let original = attachment.file_name();
        let (path, name) = publish(&self.files_dir, &attachment.content, |attempt| {
            attachment_file_name(original, stamp, attempt)
        })?;

        tracing::debug!(
            "Stored attachment {:?} ({} bytes)",
            path,
            attachment.content.len()
        );
        Ok(name)
    }

    /// Deliver a message from `sender` to all of its recipients
    pub fn deliver(&self, sender: &str, message: &Message) -> Result<DeliveryReport> {
        self.deliver_at(sender, message, &format_stamp(Local::now()))
    }

    /// Deliver with an explicit stamp.
    ///
    /// Every recipient gets a `received` record whose address field is the
    /// sender; the sender gets one `sent` record with the original address
    /// field. The attachment is stored once and shared by all records.
    pub fn deliver_at(&self, sender: &str, message: &Message, stamp: &str) -> Result<DeliveryReport> {
        let recipients = message.recipients();
        if recipients.is_empty() {
            return Err(PersistenceError::NoRecipients);
        }

        let mut report = DeliveryReport::new(stamp);

        // Without a stored attachment the records still go out, flagged as plain text
        let attachment = match &message.attachment {
            Some(attachment) => match self.write_attachment(attachment, stamp) {
                Ok(name) => Some(name),
                Err(e) => {
                    tracing::warn!("Storing attachment from {} failed: {}", sender, e);
                    report
                        .failures
                        .push((attachment.file_name().to_string(), e));
                    None
                }
            },
            None => None,
        };
        report.attachment = attachment.clone();

        let received = Record::from_message(message, sender, attachment.as_deref());
        for recipient in recipients {
            match self.write(recipient, Role::Received, &received, stamp) {
                Ok(path) => report.delivered.push((recipient.to_string(), path)),
                Err(e) => {
                    tracing::warn!("Delivery from {} to {} failed: {}", sender, recipient, e);
                    report.failures.push((recipient.to_string(), e));
                }
            }
        }

        let sent = Record::from_message(message, &message.address, attachment.as_deref());
        match self.write(sender, Role::Sent, &sent, stamp) {
            Ok(path) => report.sent = Some(path),
            Err(e) => {
                tracing::warn!("Saving sent copy for {} failed: {}", sender, e);
                report.failures.push((sender.to_string(), e));
            }
        }

        tracing::info!(
            "Delivered message from {} to {} recipient(s), {} failure(s)",
            sender,
            report.delivered.len(),
            report.failures.len()
        );

        Ok(report)
    }

    /// Identifiers of all `received` records of `owner`, oldest first.
    ///
    /// A mailbox that does not exist yet is empty.
    pub fn list(&self, owner: &str) -> Result<Vec<String>> {
        let dir = self.mailbox_dir(owner)?;

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(PersistenceError::List { path: dir, source }),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| PersistenceError::List {
                path: dir.clone(),
                source,
            })?;

            if let Some(name) = entry.file_name().to_str() {
                if is_record_of(name, Role::Received) {
                    ids.push(name.to_string());
                }
            }
        }

        ids.sort_by_key(|id| record_order_key(id));
        Ok(ids)
    }

    /// Load one record, re-reading its attachment from the shared directory
    pub fn read(&self, owner: &str, record_id: &str) -> Result<Message> {
        let dir = self.mailbox_dir(owner)?;
        let path = dir.join(plain_name(record_id));

        let text = fs::read_to_string(&path).map_err(|source| PersistenceError::Read {
            path: path.clone(),
            source,
        })?;
        let record = Record::decode(&text);

        let attachment = match record.attachment_ref {
            Some(reference) => {
                let path = self.files_dir.join(plain_name(&reference));
                let content = fs::read(&path)
                    .map_err(|source| PersistenceError::Read { path, source })?;
                Some(Attachment::new(reference, content))
            }
            None => None,
        };

        Ok(Message {
            address: record.address,
            subject: record.subject,
            body: record.body,
            attachment,
        })
    }

    /// Store a message fetched from a server as a local `received` record
    pub fn store_download(&self, owner: &str, message: &Message) -> Result<PathBuf> {
        let stamp = format_stamp(Local::now());

        let attachment = match &message.attachment {
            Some(attachment) => {
                let original = attachment.file_name();
                let (_, name) = publish(&self.files_dir, &attachment.content, |attempt| {
                    local_file_name(original, attempt)
                })?;
                Some(name)
            }
            None => None,
        };

        let record = Record::from_message(message, &message.address, attachment.as_deref());
        self.write(owner, Role::Received, &record, &stamp)
    }
}

/// Final path component only, so stored references cannot escape their directory
fn plain_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// Write `contents` under the first free name produced by `name_for`.
fn publish<F>(dir: &Path, contents: &[u8], name_for: F) -> Result<(PathBuf, String)>
where
    F: Fn(u32) -> String,
{
    let tmp = dir.join(format!(".tmp-{}", Uuid::new_v4()));

    let written = File::create(&tmp)
        .and_then(|mut file| {
            file.write_all(contents)?;
            file.sync_all()
        })
        .map_err(|source| PersistenceError::Write {
            path: tmp.clone(),
            source,
        });

    let result = written.and_then(|()| link_first_free(&tmp, dir, &name_for));

    if let Err(e) = fs::remove_file(&tmp) {
        tracing::debug!("Could not remove temporary file {:?}: {}", tmp, e);
    }

    result
}

fn link_first_free<F>(tmp: &Path, dir: &Path, name_for: &F) -> Result<(PathBuf, String)>
where
    F: Fn(u32) -> String,
{
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = name_for(attempt);
        let target = dir.join(&name);

        match fs::hard_link(tmp, &target) {
            Ok(()) => return Ok((target, name)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(source) => {
                return Err(PersistenceError::Write {
                    path: target,
                    source,
                })
            }
        }
    }

    Err(PersistenceError::NameExhausted(name_for(0), MAX_NAME_ATTEMPTS))
}
