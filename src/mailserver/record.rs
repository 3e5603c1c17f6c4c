// At-rest record format and file naming for mailboxes

use crate::mailserver::message::Message;
use chrono::{DateTime, Local};

/// Which copy of a message a record is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Sent,
    Received,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Sent => "sent",
            Role::Received => "received",
        }
    }
}

/// Stamp shared by every file written for one delivery. Second resolution.
pub fn format_stamp(at: DateTime<Local>) -> String {
    at.format("%Y%m%d-%H%M%S").to_string()
}

fn disambiguator(attempt: u32) -> String {
    if attempt == 0 {
        String::new()
    } else {
        format!("-{}", attempt)
    }
}

/// `{role}-{stamp}[-n].txt`
pub fn record_file_name(role: Role, stamp: &str, attempt: u32) -> String {
    format!("{}-{}{}.txt", role.as_str(), stamp, disambiguator(attempt))
}

/// Whether a directory entry is a published record of the given role
pub fn is_record_of(file_name: &str, role: Role) -> bool {
    file_name.ends_with(".txt")
        && file_name
            .strip_prefix(role.as_str())
            .is_some_and(|rest| rest.starts_with('-'))
}

/// Split a file name at its last `.` into base name and extension.
///
/// A name without a dot (or ending in one) has no extension.
pub fn split_file_name(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(idx) => {
            let ext = &name[idx + 1..];
            (&name[..idx], (!ext.is_empty()).then_some(ext))
        }
        None => (name, None),
    }
}

fn with_suffix(original: &str, suffix: &str) -> String {
    let (base, ext) = split_file_name(original);
    let base = if base.is_empty() { "attachment" } else { base };

    match ext {
        Some(ext) => format!("{}{}.{}", base, suffix, ext),
        None => format!("{}{}", base, suffix),
    }
}

/// `{base}-{stamp}[-n][.ext]`
pub fn attachment_file_name(original: &str, stamp: &str, attempt: u32) -> String {
    with_suffix(original, &format!("-{}{}", stamp, disambiguator(attempt)))
}

/// `{base}[-n][.ext]`, for attachments that already carry a stamp
pub fn local_file_name(original: &str, attempt: u32) -> String {
    with_suffix(original, &disambiguator(attempt))
}

/// Sort key putting records in delivery order, disambiguated copies after
/// the first file of the same second.
pub fn record_order_key(file_name: &str) -> (String, u32) {
    let stem = file_name.strip_suffix(".txt").unwrap_or(file_name);
    let parts: Vec<&str> = stem.splitn(4, '-').collect();
    match parts.as_slice() {
        [role, date, time, attempt] => (
            format!("{}-{}-{}", role, date, time),
            attempt.parse().unwrap_or(0),
        ),
        _ => (stem.to_string(), 0),
    }
}

/// Escape a text field so it fits on one line
pub fn escape_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape_field`]. Unknown escapes are kept as written.
pub fn unescape_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// One persisted message: five newline-separated fields.
///
/// ```text
/// address
/// subject
/// body
/// true|false
/// attachment file name (relative to the shared attachment directory)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub address: String,
    pub subject: String,
    pub body: String,
    pub attachment_ref: Option<String>,
}

impl Record {
    /// Build the record for `message`, overriding the address field
    pub fn from_message(message: &Message, address: &str, attachment_ref: Option<&str>) -> Self {
        Self {
            address: address.to_string(),
            subject: message.subject.clone(),
            body: message.body.clone(),
            attachment_ref: attachment_ref.map(str::to_string),
        }
    }

    pub fn has_attachment(&self) -> bool {
        self.attachment_ref.is_some()
    }

    pub fn encode(&self) -> String {
        let fields = [
            escape_field(&self.address),
            escape_field(&self.subject),
            escape_field(&self.body),
            self.has_attachment().to_string(),
            escape_field(self.attachment_ref.as_deref().unwrap_or("")),
        ];
        fields.join("\n")
    }

    /// Decode a record. Missing trailing lines read as empty; never fails.
    pub fn decode(text: &str) -> Self {
        let mut lines = text.lines();
        let mut next = || lines.next().map(unescape_field).unwrap_or_default();

        let address = next();
        let subject = next();
        let body = next();
        let flag = next();
        let path = next();

        let has_attachment = flag.trim().eq_ignore_ascii_case("true");
        let attachment_ref = (has_attachment && !path.is_empty()).then_some(path);

        Self {
            address,
            subject,
            body,
            attachment_ref,
        }
    }
}
