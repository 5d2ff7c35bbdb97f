//! The public engine surface: one handle per account.
//!
//! An [`Account`] exclusively owns the metadata store connection and the
//! index writer, both wrapped in the composite versioning layer. Multiple
//! accounts may sync concurrently on separate tasks; they share no mutable
//! state.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};

use crate::composite::Composite;
use crate::config::{AccountConfig, Config};
use crate::constants::{LIST_DEFAULT_LIMIT, MAX_CONNECT_RETRIES, MAX_RETRY_DELAY_SECS};
use crate::index::{SearchFilter, SearchHit, SearchIndex};
use crate::mail::types::{AttachmentMeta, FlagChange, MessageFlags};
use crate::mail::{ImapGateway, MailSource};
use crate::store::{MessageKey, MessageRecord, MetaStore};
use crate::sync::{sync_folder, SyncOutcome};

pub struct Account {
    id: String,
    config: AccountConfig,
    account_row: i64,
    composite: Composite,
}

impl Account {
    /// Open (or initialize) the account's mirror: metadata store, fulltext
    /// index, account entity, and composite history.
    pub async fn open(config: &Config, id: &str) -> Result<Self> {
        let account_config = config.account(id)?.clone();
        let data_path = &account_config.data_path;
        std::fs::create_dir_all(data_path)
            .with_context(|| format!("Failed to create {}", data_path.display()))?;

        let store = MetaStore::open(&data_path.join("store")).await?;
        let account_row = store.create_account(id, &account_config.email).await?;
        let index = SearchIndex::open(&data_path.join("index")).await?;
        let composite = Composite::new(store, index, data_path).await?;

        tracing::info!("Opened account '{}' at {}", id, data_path.display());
        Ok(Self {
            id: id.to_string(),
            config: account_config,
            account_row,
            composite,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data_path(&self) -> &Path {
        &self.config.data_path
    }

    /// The versioning surface: commits, history, as-of views.
    pub fn composite(&self) -> &Composite {
        &self.composite
    }

    pub fn composite_mut(&mut self) -> &mut Composite {
        &mut self.composite
    }

    //
    // Sync
    //

    /// Synchronize the given folders (or every folder the server lists)
    /// against this account's mirror.
    pub async fn sync(
        &mut self,
        folders: Option<&[String]>,
    ) -> Result<BTreeMap<String, SyncOutcome>> {
        let mut gateway = ImapGateway::new(self.config.imap.clone());

        if let Err(e) = connect_with_backoff(&mut gateway).await {
            // With an explicit folder list the connection failure becomes
            // each folder's result; without one there is nothing to report
            // against.
            let Some(folders) = folders else {
                return Err(e);
            };
            tracing::warn!("Connection failed for '{}': {}", self.id, e);
            return Ok(folders
                .iter()
                .map(|folder| {
                    (
                        folder.clone(),
                        SyncOutcome::Error {
                            error: e.to_string(),
                        },
                    )
                })
                .collect());
        }

        let results = self.sync_with(&mut gateway, folders).await;
        gateway.disconnect().await.ok();
        results
    }

    /// Sync against any [`MailSource`]; the connection is the caller's.
    pub async fn sync_with<S: MailSource>(
        &mut self,
        source: &mut S,
        folders: Option<&[String]>,
    ) -> Result<BTreeMap<String, SyncOutcome>> {
        let folder_list = match folders {
            Some(folders) => folders.to_vec(),
            None => source.list_folders().await?,
        };

        let data_path = self.config.data_path.clone();
        let mut results = BTreeMap::new();
        for folder in folder_list {
            let outcome = match sync_folder(
                &mut self.composite,
                source,
                &self.id,
                self.account_row,
                &data_path,
                &folder,
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    // One folder failing never stops the others
                    tracing::warn!("Sync of '{}' failed: {}", folder, e);
                    SyncOutcome::Error {
                        error: e.to_string(),
                    }
                }
            };
            results.insert(folder, outcome);
        }
        Ok(results)
    }

    //
    // Queries
    //

    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        self.composite
            .index()
            .search(
                query,
                &SearchFilter {
                    account: Some(self.id.clone()),
                    folder: None,
                    limit,
                },
            )
            .await
    }

    pub async fn search_folder(
        &self,
        folder: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        self.composite
            .index()
            .search(
                query,
                &SearchFilter {
                    account: Some(self.id.clone()),
                    folder: Some(folder.to_string()),
                    limit,
                },
            )
            .await
    }

    pub async fn list_folders(&self) -> Result<Vec<String>> {
        self.composite.store().list_folders(self.account_row).await
    }

    pub async fn list_messages(
        &self,
        folder: &str,
        limit: Option<usize>,
    ) -> Result<Vec<MessageRecord>> {
        let folder_id = self.folder_id(folder).await?;
        self.composite
            .store()
            .list_messages(folder_id, limit.unwrap_or(LIST_DEFAULT_LIMIT))
            .await
    }

    /// Read one message with its attachment metadata.
    pub async fn read_message(
        &self,
        folder: &str,
        key: &MessageKey,
    ) -> Result<Option<(MessageRecord, Vec<AttachmentMeta>)>> {
        let folder_id = self.folder_id(folder).await?;
        let Some(record) = self.composite.store().read_message(folder_id, key).await? else {
            return Ok(None);
        };
        let attachments = self
            .composite
            .store()
            .get_attachments(folder_id, record.uid)
            .await?;
        Ok(Some((record, attachments)))
    }

    /// Raw RFC822 bytes of a stored message. Decoding is the caller's
    /// concern.
    pub async fn read_eml(&self, folder: &str, uid: u32) -> Result<Vec<u8>> {
        let folder_id = self.folder_id(folder).await?;
        let record = self
            .composite
            .store()
            .read_message(folder_id, &MessageKey::Uid(uid))
            .await?
            .with_context(|| format!("no message {} in '{}'", uid, folder))?;
        let rel = record
            .eml_path
            .with_context(|| format!("message {} in '{}' has no eml file", uid, folder))?;
        let path = self.config.data_path.join(rel);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    pub async fn message_count(&self, folder: &str) -> Result<u64> {
        let folder_id = self.folder_id(folder).await?;
        self.composite.store().message_count(folder_id).await
    }

    async fn folder_id(&self, folder: &str) -> Result<i64> {
        self.composite
            .store()
            .get_folder(self.account_row, folder)
            .await?
            .with_context(|| format!("unknown folder '{}'", folder))
    }

    //
    // Write-back
    //

    /// Apply a flag mutation on the server, then mirror it locally.
    pub async fn set_flags(
        &self,
        folder: &str,
        uid: u32,
        add: MessageFlags,
        remove: MessageFlags,
    ) -> Result<()> {
        let folder_id = self.folder_id(folder).await?;

        let mut gateway = ImapGateway::new(self.config.imap.clone());
        gateway.connect().await?;
        let result = gateway
            .set_flags(folder, &[FlagChange { uid, add, remove }])
            .await;
        gateway.disconnect().await.ok();
        result?;

        let local = self.composite.store().get_local_flags(folder_id).await?;
        if let Some(current) = local.get(&uid) {
            let mut flags = std::collections::HashMap::new();
            flags.insert(uid, (*current | add) - remove);
            self.composite.store().update_flags(folder_id, &flags).await?;
        }
        Ok(())
    }

    /// Expunge the folder on the server. The local mirror catches up on the
    /// next sync.
    pub async fn expunge(&self, folder: &str) -> Result<()> {
        let mut gateway = ImapGateway::new(self.config.imap.clone());
        gateway.connect().await?;
        let result = gateway.expunge(folder).await;
        gateway.disconnect().await.ok();
        result
    }

    /// Commit the index one last time, then release index, composite, and
    /// store in reverse acquisition order.
    pub async fn close(self) -> Result<()> {
        tracing::info!("Closing account '{}'", self.id);
        self.composite.close().await
    }
}

/// Bounded exponential backoff around the initial connect. IMAP mutations
/// themselves are never retried.
async fn connect_with_backoff(gateway: &mut ImapGateway) -> Result<()> {
    let mut retry_delay = 1u64;

    for attempt in 1..=MAX_CONNECT_RETRIES {
        match gateway.connect().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt == MAX_CONNECT_RETRIES => return Err(e),
            Err(e) => {
                tracing::warn!(
                    "Connection attempt {}/{} failed: {}",
                    attempt,
                    MAX_CONNECT_RETRIES,
                    e
                );
                tokio::time::sleep(std::time::Duration::from_secs(retry_delay)).await;
                retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY_SECS);
            }
        }
    }
    unreachable!("connect loop always returns")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> Config {
        Config::parse(&format!(
            r#"
            [accounts.test]
            email = "test@example.com"
            data_path = "{}"

            [accounts.test.imap]
            host = "imap.example.com"
            user = "test@example.com"
            pass = "secret"
            "#,
            dir.display()
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_open_missing_account_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        assert!(Account::open(&config, "absent").await.is_err());
    }

    #[tokio::test]
    async fn test_composite_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let history = {
            let mut account = Account::open(&config, "test").await.unwrap();
            account.composite_mut().commit("first").await.unwrap();
            account.composite_mut().commit("second").await.unwrap();
            let history = account.composite().history();
            assert_eq!(history.len(), 3);
            account.close().await.unwrap();
            history
        };

        let account = Account::open(&config, "test").await.unwrap();
        assert_eq!(account.composite().history(), history);
        account.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_message_and_eml() {
        use crate::mail::types::{FetchedMessage, ParsedMessage, RemoteFolderState};
        use std::collections::{BTreeSet, HashMap};

        struct OneMessage;

        impl MailSource for OneMessage {
            async fn list_folders(&mut self) -> Result<Vec<String>> {
                Ok(vec!["INBOX".to_string()])
            }

            async fn folder_state(&mut self, _folder: &str) -> Result<RemoteFolderState> {
                Ok(RemoteFolderState {
                    uidvalidity: 1,
                    uidnext: 2,
                    message_count: 1,
                })
            }

            async fn folder_uids(&mut self, _folder: &str) -> Result<BTreeSet<u32>> {
                Ok([1].into_iter().collect())
            }

            async fn fetch_batch(
                &mut self,
                folder: &str,
                _uids: &[u32],
                data_path: Option<&Path>,
            ) -> Result<Vec<FetchedMessage>> {
                let raw = b"From: a@example.com\r\nSubject: Hi\r\n\r\nhello there";
                let mut eml_path = None;
                if let Some(root) = data_path {
                    let dir = root.join("eml").join(folder);
                    std::fs::create_dir_all(&dir)?;
                    std::fs::write(dir.join("1.eml"), raw)?;
                    eml_path = Some(format!("eml/{}/1.eml", folder));
                }
                let (mut parsed, _) = crate::mail::parser::parse_message(
                    1,
                    raw,
                    MessageFlags::empty(),
                    raw.len() as u32,
                )?;
                parsed.eml_path = eml_path;
                Ok(vec![FetchedMessage::Parsed(Box::new(parsed))])
            }

            async fn fetch_flags(
                &mut self,
                _folder: &str,
                _uids: &[u32],
            ) -> Result<HashMap<u32, MessageFlags>> {
                Ok(HashMap::new())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut account = Account::open(&config, "test").await.unwrap();

        let results = account.sync_with(&mut OneMessage, None).await.unwrap();
        assert!(matches!(
            results["INBOX"],
            SyncOutcome::Initial { stored: 1, .. }
        ));

        assert_eq!(account.list_folders().await.unwrap(), vec!["INBOX"]);
        assert_eq!(account.message_count("INBOX").await.unwrap(), 1);

        let listed = account.list_messages("INBOX", None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].uid, 1);

        let (record, attachments) = account
            .read_message("INBOX", &MessageKey::Uid(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.subject, "Hi");
        assert!(attachments.is_empty());

        let raw = account.read_eml("INBOX", 1).await.unwrap();
        assert!(raw.starts_with(b"From: a@example.com"));

        let hits = account.search("hello", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        let hits = account.search_folder("INBOX", "hello", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        let hits = account.search_folder("Archive", "hello", 10).await.unwrap();
        assert!(hits.is_empty());

        account.close().await.unwrap();
    }
}
