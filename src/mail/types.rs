use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct MessageFlags: u32 {
        const SEEN = 0b00000001;
        const ANSWERED = 0b00000010;
        const FLAGGED = 0b00000100;
        const DELETED = 0b00001000;
        const DRAFT = 0b00010000;
    }
}

impl MessageFlags {
    /// All flags paired with their persisted names.
    pub const NAMED: [(MessageFlags, &'static str); 5] = [
        (MessageFlags::SEEN, "seen"),
        (MessageFlags::ANSWERED, "answered"),
        (MessageFlags::FLAGGED, "flagged"),
        (MessageFlags::DELETED, "deleted"),
        (MessageFlags::DRAFT, "draft"),
    ];

    /// Persisted names of the flags contained in this set.
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Parse a single persisted flag name.
    pub fn from_persisted_name(name: &str) -> Option<MessageFlags> {
        Self::NAMED
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(flag, _)| *flag)
    }

    /// IMAP wire names (`\Seen` etc.) of the flags in this set.
    pub fn imap_names(self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.contains(MessageFlags::SEEN) {
            names.push("\\Seen");
        }
        if self.contains(MessageFlags::ANSWERED) {
            names.push("\\Answered");
        }
        if self.contains(MessageFlags::FLAGGED) {
            names.push("\\Flagged");
        }
        if self.contains(MessageFlags::DELETED) {
            names.push("\\Deleted");
        }
        if self.contains(MessageFlags::DRAFT) {
            names.push("\\Draft");
        }
        names
    }
}

/// Remote folder state as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteFolderState {
    pub uidvalidity: u32,
    pub uidnext: u32,
    pub message_count: u32,
}

/// Locally persisted folder sync state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FolderSyncState {
    pub uidvalidity: Option<u32>,
    pub uidnext: Option<u32>,
    pub last_sync: Option<i64>,
}

impl FolderSyncState {
    /// A UIDVALIDITY change invalidates every locally held UID.
    pub fn needs_full_resync(&self, server_uidvalidity: u32) -> bool {
        matches!(self.uidvalidity, Some(local) if local != server_uidvalidity)
    }
}

/// A fully parsed message as produced by the gateway.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub uid: u32,
    pub message_id: Option<String>,
    pub subject: String,
    /// Formatted as `Name <addr>` entries joined by `", "`.
    pub from_addr: String,
    pub to_addr: Option<String>,
    pub cc_addr: Option<String>,
    pub date: i64,
    pub flags: MessageFlags,
    pub size: u32,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    /// Relative path of the raw RFC822 file under data_path, once written.
    pub eml_path: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
}

impl ParsedMessage {
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Text used for fulltext indexing: plain body, falling back to html source.
    pub fn index_body(&self) -> &str {
        self.body_text
            .as_deref()
            .or(self.body_html.as_deref())
            .unwrap_or("")
    }
}

/// Attachment metadata. `size` is -1 when the part length is unknown.
#[derive(Debug, Clone)]
pub struct AttachmentMeta {
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    /// Relative path of the extracted file under data_path, once written.
    pub path: Option<String>,
}

/// Per-message outcome of a batched fetch. A message that fails to parse
/// never aborts its batch.
#[derive(Debug, Clone)]
pub enum FetchedMessage {
    Parsed(Box<ParsedMessage>),
    Failed { uid: u32, error: String },
}

impl FetchedMessage {
    pub fn uid(&self) -> u32 {
        match self {
            FetchedMessage::Parsed(msg) => msg.uid,
            FetchedMessage::Failed { uid, .. } => *uid,
        }
    }
}

/// A flag mutation to apply on the server.
#[derive(Debug, Clone, Copy)]
pub struct FlagChange {
    pub uid: u32,
    pub add: MessageFlags,
    pub remove: MessageFlags,
}
