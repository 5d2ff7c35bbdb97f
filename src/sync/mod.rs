//! Sync engine: change detection, mode selection, and batched application.
//!
//! The engine is stateless: every folder sync reads remote and local state,
//! dispatches to one of three modes, and produces a [`SyncOutcome`]. All
//! writes follow the order metadata-store transaction, index add/delete,
//! index commit, so re-running a sync is idempotent under (folder, uid).

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use crate::composite::Composite;
use crate::constants::FETCH_BATCH_SIZE;
use crate::mail::types::{FetchedMessage, MessageFlags};
use crate::mail::MailSource;

/// Partition of `remote ∪ local` produced by [`detect_changes`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub new: BTreeSet<u32>,
    pub deleted: BTreeSet<u32>,
    pub existing: BTreeSet<u32>,
}

/// Pure set algebra: `new = remote − local`, `deleted = local − remote`,
/// `existing = remote ∩ local`.
pub fn detect_changes(remote: &BTreeSet<u32>, local: &BTreeSet<u32>) -> ChangeSet {
    ChangeSet {
        new: remote.difference(local).copied().collect(),
        deleted: local.difference(remote).copied().collect(),
        existing: remote.intersection(local).copied().collect(),
    }
}

/// Result record of one folder sync.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncOutcome {
    Initial {
        stored: u64,
        errors: u64,
        fetched: u64,
    },
    FullResync {
        retracted: u64,
        stored: u64,
        errors: u64,
        fetched: u64,
    },
    Incremental {
        new: u64,
        deleted: u64,
        flags_updated: u64,
        fetch_errors: u64,
    },
    Error {
        error: String,
    },
}

/// Synchronize one folder, publish a composite snapshot, and record the
/// new folder state.
pub async fn sync_folder<S: MailSource>(
    composite: &mut Composite,
    source: &mut S,
    account: &str,
    account_row: i64,
    data_path: &Path,
    folder: &str,
) -> Result<SyncOutcome> {
    let remote = source.folder_state(folder).await?;
    let folder_id = composite
        .store()
        .get_or_create_folder(account_row, folder)
        .await?;
    let local = composite
        .store()
        .get_folder_sync_state(account_row, folder)
        .await?
        .unwrap_or_default();

    let outcome = if local.needs_full_resync(remote.uidvalidity) {
        tracing::info!(
            "UIDVALIDITY changed in '{}' ({:?} -> {}), full resync",
            folder,
            local.uidvalidity,
            remote.uidvalidity
        );
        full_resync(composite, source, account, data_path, folder, folder_id).await?
    } else if composite.store().get_local_uids(folder_id).await?.is_empty() {
        initial_sync(composite, source, account, data_path, folder, folder_id).await?
    } else {
        incremental_sync(composite, source, account, data_path, folder, folder_id).await?
    };

    composite
        .store()
        .update_folder_sync_state(folder_id, remote.uidvalidity, remote.uidnext)
        .await?;
    composite.commit(&format!("sync {}", folder)).await?;

    tracing::info!("Synced '{}': {:?}", folder, outcome);
    Ok(outcome)
}

/// Single-pass streaming ingest: every window of messages is written before
/// the next one is fetched, so peak memory is one batch.
async fn initial_sync<S: MailSource>(
    composite: &Composite,
    source: &mut S,
    account: &str,
    data_path: &Path,
    folder: &str,
    folder_id: i64,
) -> Result<SyncOutcome> {
    let uids: Vec<u32> = source.folder_uids(folder).await?.into_iter().collect();
    let fetched = uids.len() as u64;

    let mut stored = 0;
    let mut errors = 0;
    for chunk in uids.chunks(FETCH_BATCH_SIZE) {
        let batch = source.fetch_batch(folder, chunk, Some(data_path)).await?;
        let (batch_stored, batch_errors) =
            write_batch(composite, account, folder, folder_id, batch).await?;
        stored += batch_stored;
        errors += batch_errors;
    }

    Ok(SyncOutcome::Initial {
        stored,
        errors,
        fetched,
    })
}

/// Drop the folder from both stores, then run an initial sync.
async fn full_resync<S: MailSource>(
    composite: &Composite,
    source: &mut S,
    account: &str,
    data_path: &Path,
    folder: &str,
    folder_id: i64,
) -> Result<SyncOutcome> {
    let (retracted, tx) = composite.store().retract_folder_messages(folder_id).await?;
    composite.index().delete_folder(account, folder).await?;
    let meta = if tx > 0 {
        vec![("store_tx", tx.to_string())]
    } else {
        Vec::new()
    };
    composite
        .index()
        .commit(&format!("sync {} resync", folder), &meta)
        .await?;

    match initial_sync(composite, source, account, data_path, folder, folder_id).await? {
        SyncOutcome::Initial {
            stored,
            errors,
            fetched,
        } => Ok(SyncOutcome::FullResync {
            retracted,
            stored,
            errors,
            fetched,
        }),
        other => Ok(other),
    }
}

/// Diff remote against local, then apply new messages, deletions, and flag
/// updates, in that order.
async fn incremental_sync<S: MailSource>(
    composite: &Composite,
    source: &mut S,
    account: &str,
    data_path: &Path,
    folder: &str,
    folder_id: i64,
) -> Result<SyncOutcome> {
    let local_uids = composite.store().get_local_uids(folder_id).await?;
    if local_uids.is_empty() {
        return initial_sync(composite, source, account, data_path, folder, folder_id).await;
    }

    let remote_uids = source.folder_uids(folder).await?;
    let changes = detect_changes(&remote_uids, &local_uids);

    // New messages, one batch written before the next is fetched
    let mut new_stored = 0;
    let mut fetch_errors = 0;
    let new_uids: Vec<u32> = changes.new.iter().copied().collect();
    for chunk in new_uids.chunks(FETCH_BATCH_SIZE) {
        let batch = source.fetch_batch(folder, chunk, Some(data_path)).await?;
        let (batch_stored, batch_errors) =
            write_batch(composite, account, folder, folder_id, batch).await?;
        new_stored += batch_stored;
        fetch_errors += batch_errors;
    }

    // Deletions need no IMAP calls
    let mut deleted = 0;
    let deleted_uids: Vec<u32> = changes.deleted.iter().copied().collect();
    if !deleted_uids.is_empty() {
        let (count, tx) = composite
            .store()
            .retract_messages(folder_id, &deleted_uids)
            .await?;
        composite
            .index()
            .delete_messages(account, folder, &deleted_uids)
            .await?;
        let meta = if tx > 0 {
            vec![("store_tx", tx.to_string())]
        } else {
            Vec::new()
        };
        composite
            .index()
            .commit(&format!("sync {} retract", folder), &meta)
            .await?;
        deleted = count;
    }

    // Flag updates: only UIDs whose flag set actually changed
    let mut flags_updated = 0;
    if !changes.existing.is_empty() {
        let existing: Vec<u32> = changes.existing.iter().copied().collect();
        let remote_flags = source.fetch_flags(folder, &existing).await?;
        let local_flags = composite.store().get_local_flags(folder_id).await?;

        let changed: HashMap<u32, MessageFlags> = remote_flags
            .into_iter()
            .filter(|(uid, flags)| local_flags.get(uid) != Some(flags))
            .collect();

        if !changed.is_empty() {
            flags_updated = changed.len() as u64;
            composite.store().update_flags(folder_id, &changed).await?;
        }
    }

    Ok(SyncOutcome::Incremental {
        new: new_stored,
        deleted,
        flags_updated,
        fetch_errors,
    })
}

/// Write one batch: valid messages are transacted into the metadata store
/// and indexed in the same logical step, then the index is committed with
/// the store transaction id as metadata.
async fn write_batch(
    composite: &Composite,
    account: &str,
    folder: &str,
    folder_id: i64,
    batch: Vec<FetchedMessage>,
) -> Result<(u64, u64)> {
    let mut messages = Vec::with_capacity(batch.len());
    let mut errors = 0;
    for item in batch {
        match item {
            FetchedMessage::Parsed(msg) => messages.push(*msg),
            FetchedMessage::Failed { uid, error } => {
                tracing::warn!("Skipping uid {} in '{}': {}", uid, folder, error);
                errors += 1;
            }
        }
    }

    if messages.is_empty() {
        return Ok((0, errors));
    }

    let tx = composite
        .store()
        .store_messages_with_attachments(folder_id, &messages)
        .await?;
    composite
        .index()
        .index_messages(account, folder, &messages)
        .await?;
    composite
        .index()
        .commit(
            &format!("sync {} batch", folder),
            &[("store_tx", tx.to_string())],
        )
        .await?;

    Ok((messages.len() as u64, errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::Path;

    use crate::index::{SearchFilter, SearchIndex};
    use crate::mail::parser::parse_message;
    use crate::mail::types::RemoteFolderState;
    use crate::store::MetaStore;

    //
    // detect_changes
    //

    fn set(uids: &[u32]) -> BTreeSet<u32> {
        uids.iter().copied().collect()
    }

    #[test]
    fn test_detect_changes_basic() {
        let changes = detect_changes(&set(&[1, 2, 4]), &set(&[1, 2, 3]));
        assert_eq!(changes.new, set(&[4]));
        assert_eq!(changes.deleted, set(&[3]));
        assert_eq!(changes.existing, set(&[1, 2]));
    }

    #[test]
    fn test_detect_changes_empty_sides() {
        let changes = detect_changes(&set(&[1, 2]), &set(&[]));
        assert_eq!(changes.new, set(&[1, 2]));
        assert!(changes.deleted.is_empty());
        assert!(changes.existing.is_empty());

        let changes = detect_changes(&set(&[]), &set(&[1, 2]));
        assert_eq!(changes.deleted, set(&[1, 2]));
        assert!(changes.new.is_empty());
    }

    #[test]
    fn test_detect_changes_partitions_union() {
        // For any disjoint triple partitioning remote ∪ local, detect_changes
        // recovers exactly that partition.
        let cases: &[(&[u32], &[u32], &[u32])] = &[
            (&[], &[], &[]),
            (&[1], &[], &[]),
            (&[], &[2], &[]),
            (&[], &[], &[3]),
            (&[1, 5], &[2, 6], &[3, 4]),
            (&[10, 20, 30], &[11], &[12, 13]),
        ];
        for (new, deleted, existing) in cases {
            let remote: BTreeSet<u32> = new.iter().chain(existing.iter()).copied().collect();
            let local: BTreeSet<u32> = deleted.iter().chain(existing.iter()).copied().collect();
            let changes = detect_changes(&remote, &local);
            assert_eq!(changes.new, set(new));
            assert_eq!(changes.deleted, set(deleted));
            assert_eq!(changes.existing, set(existing));
        }
    }

    //
    // Folder sync scenarios against an in-memory remote
    //

    #[derive(Clone)]
    struct FakeFolder {
        uidvalidity: u32,
        uidnext: u32,
        messages: BTreeMap<u32, (Vec<u8>, MessageFlags)>,
    }

    struct FakeRemote {
        folders: BTreeMap<String, FakeFolder>,
    }

    impl FakeRemote {
        fn new() -> Self {
            Self {
                folders: BTreeMap::new(),
            }
        }

        fn folder_mut(&mut self, name: &str) -> &mut FakeFolder {
            self.folders
                .entry(name.to_string())
                .or_insert_with(|| FakeFolder {
                    uidvalidity: 1,
                    uidnext: 1,
                    messages: BTreeMap::new(),
                })
        }

        fn put(&mut self, folder: &str, uid: u32, subject: &str, body: &str, flags: MessageFlags) {
            let raw = raw_email(uid, subject, body);
            let entry = self.folder_mut(folder);
            entry.messages.insert(uid, (raw, flags));
            entry.uidnext = entry.uidnext.max(uid + 1);
        }
    }

    fn raw_email(uid: u32, subject: &str, body: &str) -> Vec<u8> {
        format!(
            "From: Sender <sender@example.com>\r\n\
             To: recipient@example.com\r\n\
             Subject: {}\r\n\
             Date: Mon, 1 Jan 2024 12:00:00 +0000\r\n\
             Message-ID: <{}@example.com>\r\n\
             \r\n\
             {}",
            subject, uid, body
        )
        .into_bytes()
    }

    impl MailSource for FakeRemote {
        async fn list_folders(&mut self) -> Result<Vec<String>> {
            Ok(self.folders.keys().cloned().collect())
        }

        async fn folder_state(&mut self, folder: &str) -> Result<RemoteFolderState> {
            let f = self.folder_mut(folder);
            Ok(RemoteFolderState {
                uidvalidity: f.uidvalidity,
                uidnext: f.uidnext,
                message_count: f.messages.len() as u32,
            })
        }

        async fn folder_uids(&mut self, folder: &str) -> Result<BTreeSet<u32>> {
            Ok(self.folder_mut(folder).messages.keys().copied().collect())
        }

        async fn fetch_batch(
            &mut self,
            folder: &str,
            uids: &[u32],
            _data_path: Option<&Path>,
        ) -> Result<Vec<FetchedMessage>> {
            let f = self.folder_mut(folder);
            let mut out = Vec::new();
            for uid in uids {
                if let Some((raw, flags)) = f.messages.get(uid) {
                    out.push(match parse_message(*uid, raw, *flags, raw.len() as u32) {
                        Ok((parsed, _)) => FetchedMessage::Parsed(Box::new(parsed)),
                        Err(e) => FetchedMessage::Failed {
                            uid: *uid,
                            error: e.to_string(),
                        },
                    });
                }
            }
            Ok(out)
        }

        async fn fetch_flags(
            &mut self,
            folder: &str,
            uids: &[u32],
        ) -> Result<HashMap<u32, MessageFlags>> {
            let f = self.folder_mut(folder);
            Ok(uids
                .iter()
                .filter_map(|uid| f.messages.get(uid).map(|(_, flags)| (*uid, *flags)))
                .collect())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        composite: Composite,
        account_row: i64,
        data_path: std::path::PathBuf,
    }

    const ACCOUNT: &str = "test";

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().to_path_buf();
        let store = MetaStore::open(&data_path.join("store")).await.unwrap();
        let account_row = store.create_account(ACCOUNT, "test@example.com").await.unwrap();
        let index = SearchIndex::open(&data_path.join("index")).await.unwrap();
        let composite = Composite::new(store, index, &data_path).await.unwrap();
        Harness {
            _dir: dir,
            composite,
            account_row,
            data_path,
        }
    }

    impl Harness {
        async fn sync(&mut self, remote: &mut FakeRemote, folder: &str) -> SyncOutcome {
            sync_folder(
                &mut self.composite,
                remote,
                ACCOUNT,
                self.account_row,
                &self.data_path,
                folder,
            )
            .await
            .unwrap()
        }

        async fn folder_id(&self, folder: &str) -> i64 {
            self.composite
                .store()
                .get_or_create_folder(self.account_row, folder)
                .await
                .unwrap()
        }

        async fn search(&self, query: &str) -> Vec<crate::index::SearchHit> {
            self.composite
                .index()
                .search(query, &SearchFilter::default())
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn scenario_initial_sync_two_messages() {
        let mut h = harness().await;
        let mut remote = FakeRemote::new();
        remote.put("INBOX", 1, "First", "First message", MessageFlags::empty());
        remote.put("INBOX", 2, "Second", "Second message", MessageFlags::empty());
        remote.folder_mut("INBOX").uidvalidity = 100;
        remote.folder_mut("INBOX").uidnext = 3;

        let outcome = h.sync(&mut remote, "INBOX").await;
        assert_eq!(
            outcome,
            SyncOutcome::Initial {
                stored: 2,
                errors: 0,
                fetched: 2
            }
        );

        let folder_id = h.folder_id("INBOX").await;
        assert_eq!(
            h.composite
                .store()
                .get_local_uids(folder_id)
                .await
                .unwrap(),
            set(&[1, 2])
        );

        let hits = h.search("first").await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].uid, 1);

        let state = h
            .composite
            .store()
            .get_folder_sync_state(h.account_row, "INBOX")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.uidvalidity, Some(100));
        assert_eq!(state.uidnext, Some(3));
    }

    #[tokio::test]
    async fn scenario_incremental_adds_new_messages() {
        let mut h = harness().await;
        let mut remote = FakeRemote::new();
        remote.put("INBOX", 1, "First", "First message", MessageFlags::empty());
        remote.folder_mut("INBOX").uidvalidity = 100;
        h.sync(&mut remote, "INBOX").await;

        remote.put("INBOX", 2, "Second", "Second message", MessageFlags::empty());
        remote.put("INBOX", 3, "Third", "Third message", MessageFlags::empty());

        let outcome = h.sync(&mut remote, "INBOX").await;
        assert_eq!(
            outcome,
            SyncOutcome::Incremental {
                new: 2,
                deleted: 0,
                flags_updated: 0,
                fetch_errors: 0
            }
        );

        let folder_id = h.folder_id("INBOX").await;
        assert_eq!(
            h.composite.store().message_count(folder_id).await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn scenario_incremental_deletion() {
        let mut h = harness().await;
        let mut remote = FakeRemote::new();
        remote.put("INBOX", 1, "One", "first body", MessageFlags::empty());
        remote.put("INBOX", 2, "Two", "second body", MessageFlags::empty());
        remote.put("INBOX", 3, "Three", "third body", MessageFlags::empty());
        remote.folder_mut("INBOX").uidvalidity = 100;
        h.sync(&mut remote, "INBOX").await;

        remote.folder_mut("INBOX").messages.remove(&2);

        let outcome = h.sync(&mut remote, "INBOX").await;
        assert_eq!(
            outcome,
            SyncOutcome::Incremental {
                new: 0,
                deleted: 1,
                flags_updated: 0,
                fetch_errors: 0
            }
        );

        let folder_id = h.folder_id("INBOX").await;
        assert_eq!(
            h.composite
                .store()
                .get_local_uids(folder_id)
                .await
                .unwrap(),
            set(&[1, 3])
        );
        assert!(h.search("two").await.is_empty());
    }

    #[tokio::test]
    async fn scenario_flag_update() {
        let mut h = harness().await;
        let mut remote = FakeRemote::new();
        remote.put("INBOX", 1, "First", "body", MessageFlags::SEEN);
        remote.folder_mut("INBOX").uidvalidity = 100;
        h.sync(&mut remote, "INBOX").await;

        remote.put(
            "INBOX",
            1,
            "First",
            "body",
            MessageFlags::SEEN | MessageFlags::FLAGGED,
        );

        let outcome = h.sync(&mut remote, "INBOX").await;
        assert_eq!(
            outcome,
            SyncOutcome::Incremental {
                new: 0,
                deleted: 0,
                flags_updated: 1,
                fetch_errors: 0
            }
        );

        let folder_id = h.folder_id("INBOX").await;
        let flags = h.composite.store().get_local_flags(folder_id).await.unwrap();
        assert_eq!(flags[&1], MessageFlags::SEEN | MessageFlags::FLAGGED);
    }

    #[tokio::test]
    async fn scenario_uidvalidity_change_forces_full_resync() {
        let mut h = harness().await;
        let mut remote = FakeRemote::new();
        remote.put("INBOX", 1, "Old", "old body", MessageFlags::empty());
        remote.folder_mut("INBOX").uidvalidity = 100;
        h.sync(&mut remote, "INBOX").await;

        let mut replaced = FakeRemote::new();
        replaced.put("INBOX", 1, "New UID 1", "fresh body one", MessageFlags::empty());
        replaced.put("INBOX", 2, "New UID 2", "fresh body two", MessageFlags::empty());
        replaced.folder_mut("INBOX").uidvalidity = 200;

        let outcome = h.sync(&mut replaced, "INBOX").await;
        assert_eq!(
            outcome,
            SyncOutcome::FullResync {
                retracted: 1,
                stored: 2,
                errors: 0,
                fetched: 2
            }
        );

        let state = h
            .composite
            .store()
            .get_folder_sync_state(h.account_row, "INBOX")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.uidvalidity, Some(200));

        assert!(h.search("old").await.is_empty());
        assert!(!h.search("new").await.is_empty());

        // The UIDVALIDITY guard: local uids equal remote uids regardless of
        // prior contents
        let folder_id = h.folder_id("INBOX").await;
        assert_eq!(
            h.composite
                .store()
                .get_local_uids(folder_id)
                .await
                .unwrap(),
            set(&[1, 2])
        );
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let mut h = harness().await;
        let mut remote = FakeRemote::new();
        remote.put("INBOX", 1, "First", "alpha", MessageFlags::SEEN);
        remote.put("INBOX", 2, "Second", "beta", MessageFlags::empty());
        remote.folder_mut("INBOX").uidvalidity = 7;

        h.sync(&mut remote, "INBOX").await;
        let folder_id = h.folder_id("INBOX").await;
        let uids_once = h.composite.store().get_local_uids(folder_id).await.unwrap();
        let flags_once = h.composite.store().get_local_flags(folder_id).await.unwrap();

        let outcome = h.sync(&mut remote, "INBOX").await;
        assert_eq!(
            outcome,
            SyncOutcome::Incremental {
                new: 0,
                deleted: 0,
                flags_updated: 0,
                fetch_errors: 0
            }
        );
        assert_eq!(
            h.composite.store().get_local_uids(folder_id).await.unwrap(),
            uids_once
        );
        assert_eq!(
            h.composite.store().get_local_flags(folder_id).await.unwrap(),
            flags_once
        );
    }

    #[tokio::test]
    async fn index_agrees_with_store_after_sync() {
        let mut h = harness().await;
        let mut remote = FakeRemote::new();
        for uid in 1..=7 {
            remote.put(
                "INBOX",
                uid,
                &format!("Subject {uid}"),
                &format!("payload number {uid}"),
                MessageFlags::empty(),
            );
        }
        remote.folder_mut("INBOX").uidvalidity = 5;
        h.sync(&mut remote, "INBOX").await;

        remote.folder_mut("INBOX").messages.remove(&3);
        remote.folder_mut("INBOX").messages.remove(&5);
        h.sync(&mut remote, "INBOX").await;

        let folder_id = h.folder_id("INBOX").await;
        let store_uids = h.composite.store().get_local_uids(folder_id).await.unwrap();

        let mut index_uids = BTreeSet::new();
        for hit in h.search("payload").await {
            index_uids.insert(hit.uid);
        }
        assert_eq!(index_uids, store_uids);
    }
}
