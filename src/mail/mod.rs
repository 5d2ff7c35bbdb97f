//! Remote mail access: canonical types, MIME parsing, and the IMAP gateway.
//!
//! This module is split into:
//! - `types.rs` - Message, attachment, folder-state, and flag types
//! - `parser.rs` - MIME parsing and address formatting
//! - `imap/` - The IMAPS gateway implementing [`MailSource`]

pub mod imap;
pub mod parser;
pub mod types;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::Result;

pub use imap::ImapGateway;
pub use types::{
    AttachmentMeta, FetchedMessage, FlagChange, FolderSyncState, MessageFlags, ParsedMessage,
    RemoteFolderState,
};

/// The read side of a remote mailbox, as consumed by the sync engine.
///
/// Implemented by [`ImapGateway`] against a live server and by in-memory
/// fakes in tests. Mutation operations (flag stores, expunge) stay on the
/// gateway itself; the engine never issues them.
#[allow(async_fn_in_trait)]
pub trait MailSource {
    /// Folder names available on the remote.
    async fn list_folders(&mut self) -> Result<Vec<String>>;

    /// UIDVALIDITY, UIDNEXT, and message count of a folder, read without
    /// marking anything seen.
    async fn folder_state(&mut self, folder: &str) -> Result<RemoteFolderState>;

    /// The complete UID set of a folder in one round trip.
    async fn folder_uids(&mut self, folder: &str) -> Result<BTreeSet<u32>>;

    /// Fetch and parse one window of messages. When `data_path` is given,
    /// raw RFC822 bytes and extracted attachments are written beneath it
    /// before the call returns, so a dropped batch holds no payloads.
    async fn fetch_batch(
        &mut self,
        folder: &str,
        uids: &[u32],
        data_path: Option<&Path>,
    ) -> Result<Vec<FetchedMessage>>;

    /// Flags for the given UIDs, no body fetch.
    async fn fetch_flags(
        &mut self,
        folder: &str,
        uids: &[u32],
    ) -> Result<HashMap<u32, MessageFlags>>;
}
