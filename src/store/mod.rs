//! Metadata store adapter: typed CRUD over a transaction-stamped SQLite
//! database.
//!
//! This module is split into:
//! - `mod.rs` - `MetaStore`, connection pool, branches, as-of views
//! - `schema.rs` - Schema initialization
//! - `folders.rs` - Account/folder entities and sync state
//! - `messages.rs` - Message, flag, and attachment operations
//!
//! Every mutation is a single SQLite transaction that also appends to the
//! `transactions` log; the log rowid is the store's snapshot id. Reads run
//! against the live window by default, or pinned to a transaction through
//! [`StoreView`].

mod folders;
mod messages;
mod schema;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::mail::types::{AttachmentMeta, FolderSyncState, MessageFlags, ParsedMessage};

/// Pool size; mutations are serialized by SQLite, reads may run alongside.
const POOL_SIZE: u32 = 4;

pub const DB_FILE: &str = "briefkasten.db";

/// Lookup key for a single message within a folder.
#[derive(Debug, Clone)]
pub enum MessageKey {
    Uid(u32),
    MessageId(String),
}

/// A message as persisted in the metadata store.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub uid: u32,
    pub message_id: Option<String>,
    pub subject: String,
    pub from_addr: String,
    pub to_addr: Option<String>,
    pub cc_addr: Option<String>,
    pub date: i64,
    pub flags: MessageFlags,
    pub size: i64,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub eml_path: Option<String>,
    pub has_attachments: bool,
}

pub struct MetaStore {
    pool: SqlitePool,
    branch: String,
}

impl MetaStore {
    pub async fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let db_url = format!("sqlite:{}?mode=rwc", dir.join(DB_FILE).display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(options)
            .await
            .context("Failed to open metadata store")?;

        schema::init_schema(&pool).await?;
        let store = Self {
            pool,
            branch: "main".to_string(),
        };
        store.ensure_branch("main").await?;
        Ok(store)
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory metadata store")?;

        schema::init_schema(&pool).await?;
        let store = Self {
            pool,
            branch: "main".to_string(),
        };
        store.ensure_branch("main").await?;
        Ok(store)
    }

    async fn ensure_branch(&self, name: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO branches (name, head_tx) VALUES (?, ?)")
            .bind(name)
            .bind(self.head_tx().await?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    //
    // Snapshot and Branch Operations
    //

    /// The store's current sub-snapshot id: the last transaction, 0 when
    /// the log is empty.
    pub async fn head_tx(&self) -> Result<i64> {
        let head: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(tx), 0) FROM transactions")
            .fetch_one(&self.pool)
            .await?;
        Ok(head)
    }

    pub fn current_branch(&self) -> &str {
        &self.branch
    }

    /// Record a named branch ref at the current head.
    pub async fn branch(&self, name: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO branches (name, head_tx) VALUES (?, ?)")
            .bind(name)
            .bind(self.head_tx().await?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn checkout(&mut self, name: &str) -> Result<()> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT head_tx FROM branches WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            anyhow::bail!("unknown store branch '{}'", name);
        }
        self.branch = name.to_string();
        Ok(())
    }

    /// An immutable read view of the store as of transaction `tx`.
    pub fn as_of(&self, tx: i64) -> StoreView {
        StoreView {
            pool: self.pool.clone(),
            tx,
        }
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    //
    // Account and Folder Operations
    //

    pub async fn create_account(&self, name: &str, email: &str) -> Result<i64> {
        folders::create_account(&self.pool, name, email).await
    }

    pub async fn get_or_create_folder(&self, account_id: i64, name: &str) -> Result<i64> {
        folders::get_or_create_folder(&self.pool, account_id, name).await
    }

    pub async fn get_folder(&self, account_id: i64, name: &str) -> Result<Option<i64>> {
        folders::get_folder(&self.pool, account_id, name).await
    }

    pub async fn get_folder_sync_state(
        &self,
        account_id: i64,
        name: &str,
    ) -> Result<Option<FolderSyncState>> {
        folders::get_folder_sync_state(&self.pool, account_id, name).await
    }

    pub async fn update_folder_sync_state(
        &self,
        folder_id: i64,
        uidvalidity: u32,
        uidnext: u32,
    ) -> Result<()> {
        folders::update_folder_sync_state(&self.pool, folder_id, uidvalidity, uidnext).await
    }

    pub async fn list_folders(&self, account_id: i64) -> Result<Vec<String>> {
        folders::list_folders(&self.pool, account_id).await
    }

    //
    // Message Operations
    //

    pub async fn store_messages_with_attachments(
        &self,
        folder_id: i64,
        messages: &[ParsedMessage],
    ) -> Result<i64> {
        messages::store_messages_with_attachments(&self.pool, folder_id, messages).await
    }

    pub async fn retract_messages(&self, folder_id: i64, uids: &[u32]) -> Result<(u64, i64)> {
        messages::retract_messages(&self.pool, folder_id, uids).await
    }

    pub async fn retract_folder_messages(&self, folder_id: i64) -> Result<(u64, i64)> {
        messages::retract_folder_messages(&self.pool, folder_id).await
    }

    pub async fn get_local_uids(&self, folder_id: i64) -> Result<BTreeSet<u32>> {
        messages::get_local_uids(&self.pool, folder_id, messages::LIVE).await
    }

    pub async fn get_local_flags(&self, folder_id: i64) -> Result<HashMap<u32, MessageFlags>> {
        messages::get_local_flags(&self.pool, folder_id).await
    }

    pub async fn update_flags(
        &self,
        folder_id: i64,
        flags: &HashMap<u32, MessageFlags>,
    ) -> Result<i64> {
        messages::update_flags(&self.pool, folder_id, flags).await
    }

    pub async fn list_messages(&self, folder_id: i64, limit: usize) -> Result<Vec<MessageRecord>> {
        messages::list_messages(&self.pool, folder_id, limit, messages::LIVE).await
    }

    pub async fn read_message(
        &self,
        folder_id: i64,
        key: &MessageKey,
    ) -> Result<Option<MessageRecord>> {
        messages::read_message(&self.pool, folder_id, key).await
    }

    pub async fn get_attachments(&self, folder_id: i64, uid: u32) -> Result<Vec<AttachmentMeta>> {
        messages::get_attachments(&self.pool, folder_id, uid).await
    }

    pub async fn message_count(&self, folder_id: i64) -> Result<u64> {
        messages::message_count(&self.pool, folder_id, messages::LIVE).await
    }

    #[cfg(test)]
    pub async fn attachment_count_for_uids(&self, folder_id: i64, uids: &[u32]) -> Result<u64> {
        messages::attachment_count_for_uids(&self.pool, folder_id, uids).await
    }
}

/// A read-only view of the store pinned at a transaction.
pub struct StoreView {
    pool: SqlitePool,
    tx: i64,
}

impl StoreView {
    pub fn tx(&self) -> i64 {
        self.tx
    }

    pub async fn get_local_uids(&self, folder_id: i64) -> Result<BTreeSet<u32>> {
        messages::get_local_uids(&self.pool, folder_id, self.tx).await
    }

    pub async fn list_messages(&self, folder_id: i64, limit: usize) -> Result<Vec<MessageRecord>> {
        messages::list_messages(&self.pool, folder_id, limit, self.tx).await
    }

    pub async fn message_count(&self, folder_id: i64) -> Result<u64> {
        messages::message_count(&self.pool, folder_id, self.tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::types::AttachmentMeta;

    fn message(uid: u32, subject: &str, flags: MessageFlags) -> ParsedMessage {
        ParsedMessage {
            uid,
            message_id: Some(format!("<{}@example.com>", uid)),
            subject: subject.to_string(),
            from_addr: "Sender <sender@example.com>".to_string(),
            to_addr: Some("recipient@example.com".to_string()),
            cc_addr: None,
            date: 1_700_000_000 + uid as i64,
            flags,
            size: 512,
            body_text: Some(format!("body of {}", subject)),
            body_html: None,
            in_reply_to: None,
            references: Vec::new(),
            eml_path: Some(format!("eml/INBOX/{}.eml", uid)),
            attachments: Vec::new(),
        }
    }

    fn message_with_attachment(uid: u32, subject: &str) -> ParsedMessage {
        let mut msg = message(uid, subject, MessageFlags::empty());
        msg.attachments.push(AttachmentMeta {
            filename: "report.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            size: 1024,
            path: Some(format!("attachments/INBOX/{}/report.pdf", uid)),
        });
        msg
    }

    async fn folder(store: &MetaStore) -> i64 {
        let account = store.create_account("test", "test@example.com").await.unwrap();
        store.get_or_create_folder(account, "INBOX").await.unwrap()
    }

    #[tokio::test]
    async fn test_store_and_read_messages() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let folder_id = folder(&store).await;

        let tx = store
            .store_messages_with_attachments(
                folder_id,
                &[
                    message(1, "First", MessageFlags::SEEN),
                    message(2, "Second", MessageFlags::empty()),
                ],
            )
            .await
            .unwrap();
        assert!(tx > 0);

        let uids = store.get_local_uids(folder_id).await.unwrap();
        assert_eq!(uids.into_iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(store.message_count(folder_id).await.unwrap(), 2);

        let record = store
            .read_message(folder_id, &MessageKey::Uid(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.subject, "First");
        assert!(record.flags.contains(MessageFlags::SEEN));
        assert_eq!(record.eml_path.as_deref(), Some("eml/INBOX/1.eml"));

        let by_message_id = store
            .read_message(
                folder_id,
                &MessageKey::MessageId("<2@example.com>".to_string()),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_message_id.uid, 2);
    }

    #[tokio::test]
    async fn test_restore_is_idempotent() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let folder_id = folder(&store).await;

        let batch = [message(1, "First", MessageFlags::SEEN)];
        store
            .store_messages_with_attachments(folder_id, &batch)
            .await
            .unwrap();
        store
            .store_messages_with_attachments(folder_id, &batch)
            .await
            .unwrap();

        assert_eq!(store.message_count(folder_id).await.unwrap(), 1);
        let flags = store.get_local_flags(folder_id).await.unwrap();
        assert_eq!(flags[&1], MessageFlags::SEEN);
    }

    #[tokio::test]
    async fn test_retraction_cascades_to_attachments() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let folder_id = folder(&store).await;

        store
            .store_messages_with_attachments(
                folder_id,
                &[
                    message_with_attachment(1, "First"),
                    message_with_attachment(2, "Second"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(
            store
                .attachment_count_for_uids(folder_id, &[1, 2])
                .await
                .unwrap(),
            2
        );

        let (count, tx) = store.retract_messages(folder_id, &[1]).await.unwrap();
        assert_eq!(count, 1);
        assert!(tx > 0);

        // No live attachment may keep a retracted parent
        assert_eq!(
            store
                .attachment_count_for_uids(folder_id, &[1])
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            store
                .attachment_count_for_uids(folder_id, &[2])
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .get_local_uids(folder_id)
                .await
                .unwrap()
                .into_iter()
                .collect::<Vec<_>>(),
            vec![2]
        );
    }

    #[tokio::test]
    async fn test_retract_folder_messages() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let folder_id = folder(&store).await;

        store
            .store_messages_with_attachments(
                folder_id,
                &[
                    message(1, "a", MessageFlags::empty()),
                    message(2, "b", MessageFlags::empty()),
                    message(3, "c", MessageFlags::empty()),
                ],
            )
            .await
            .unwrap();

        let (count, _) = store.retract_folder_messages(folder_id).await.unwrap();
        assert_eq!(count, 3);
        assert!(store.get_local_uids(folder_id).await.unwrap().is_empty());

        let (count, tx) = store.retract_folder_messages(folder_id).await.unwrap();
        assert_eq!((count, tx), (0, 0));
    }

    #[tokio::test]
    async fn test_flag_update_is_minimal_diff() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let folder_id = folder(&store).await;

        store
            .store_messages_with_attachments(folder_id, &[message(1, "First", MessageFlags::SEEN)])
            .await
            .unwrap();

        let mut target = HashMap::new();
        target.insert(1, MessageFlags::SEEN | MessageFlags::FLAGGED);
        let tx = store.update_flags(folder_id, &target).await.unwrap();
        assert!(tx > 0);

        let flags = store.get_local_flags(folder_id).await.unwrap();
        assert_eq!(flags[&1], MessageFlags::SEEN | MessageFlags::FLAGGED);

        // Re-applying the same set changes nothing
        let tx = store.update_flags(folder_id, &target).await.unwrap();
        assert_eq!(tx, 0);

        // Dropping a flag retracts only that assertion
        let mut target = HashMap::new();
        target.insert(1, MessageFlags::FLAGGED);
        store.update_flags(folder_id, &target).await.unwrap();
        let flags = store.get_local_flags(folder_id).await.unwrap();
        assert_eq!(flags[&1], MessageFlags::FLAGGED);
    }

    #[tokio::test]
    async fn test_as_of_view_is_stable() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let folder_id = folder(&store).await;

        let tx1 = store
            .store_messages_with_attachments(folder_id, &[message(1, "old", MessageFlags::empty())])
            .await
            .unwrap();
        store.retract_messages(folder_id, &[1]).await.unwrap();
        store
            .store_messages_with_attachments(folder_id, &[message(2, "new", MessageFlags::empty())])
            .await
            .unwrap();

        let view = store.as_of(tx1);
        assert_eq!(
            view.get_local_uids(folder_id)
                .await
                .unwrap()
                .into_iter()
                .collect::<Vec<_>>(),
            vec![1]
        );
        assert_eq!(view.message_count(folder_id).await.unwrap(), 1);
        assert_eq!(view.list_messages(folder_id, 10).await.unwrap()[0].subject, "old");

        assert_eq!(
            store
                .get_local_uids(folder_id)
                .await
                .unwrap()
                .into_iter()
                .collect::<Vec<_>>(),
            vec![2]
        );
    }

    #[tokio::test]
    async fn test_folder_sync_state() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let account = store.create_account("test", "test@example.com").await.unwrap();

        assert!(store
            .get_folder_sync_state(account, "INBOX")
            .await
            .unwrap()
            .is_none());

        let folder_id = store.get_or_create_folder(account, "INBOX").await.unwrap();
        let state = store
            .get_folder_sync_state(account, "INBOX")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.uidvalidity, None);

        store
            .update_folder_sync_state(folder_id, 100, 3)
            .await
            .unwrap();
        let state = store
            .get_folder_sync_state(account, "INBOX")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.uidvalidity, Some(100));
        assert_eq!(state.uidnext, Some(3));
        assert!(state.last_sync.is_some());

        assert_eq!(store.list_folders(account).await.unwrap(), vec!["INBOX"]);
    }

    #[tokio::test]
    async fn test_stable_account_id() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let first = store.create_account("myaccount", "me@example.com").await.unwrap();
        let second = store.create_account("myaccount", "me@example.com").await.unwrap();
        assert_eq!(first, second);
    }
}
