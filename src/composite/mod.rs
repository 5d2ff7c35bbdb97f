//! Composite versioning: the (metadata store, fulltext index) pair as one
//! copy-on-write system.
//!
//! A composite snapshot is a labeled pair of sub-snapshot ids (the store's
//! transaction and the index's generation) plus parents, message, and
//! timestamp; its id is a SHA-256 over all of them. Snapshots are appended
//! to `<data_path>/composite/history.jsonl` so history survives restarts.
//!
//! The composite owns both sub-systems. The index is strictly
//! single-writer, so the account handle transfers its writer in here and
//! `close` releases everything in reverse order.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::index::{IndexReader, SearchIndex};
use crate::store::{MetaStore, StoreView};

pub const STORE_SUBSYSTEM: &str = "store";
pub const INDEX_SUBSYSTEM: &str = "index";

const HISTORY_FILE: &str = "history.jsonl";

/// One committed composite snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeSnapshot {
    pub id: String,
    pub parents: Vec<String>,
    pub message: String,
    pub created_at: i64,
    /// Sub-system id -> sub-snapshot id (store tx / index generation).
    pub subs: BTreeMap<String, String>,
}

/// Read views of both sub-systems at one composite snapshot. Closing the
/// index reader is the caller's responsibility.
pub struct CompositeView {
    pub store: StoreView,
    pub index: IndexReader,
}

impl CompositeView {
    pub async fn close(self) {
        self.index.close().await;
    }
}

pub struct Composite {
    store: MetaStore,
    index: SearchIndex,
    dir: PathBuf,
    /// Oldest first; the last entry is the current head.
    snapshots: Vec<CompositeSnapshot>,
    branch: String,
}

impl Composite {
    /// Wrap the store/index pair, loading persisted history. A composite
    /// with no history yet records an initial `"init"` snapshot.
    pub async fn new(store: MetaStore, index: SearchIndex, data_path: &Path) -> Result<Self> {
        let dir = data_path.join("composite");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let snapshots = load_history(&dir.join(HISTORY_FILE))?;
        let mut composite = Self {
            store,
            index,
            dir,
            snapshots,
            branch: "main".to_string(),
        };

        if composite.snapshots.is_empty() {
            composite.commit("init").await?;
        }
        Ok(composite)
    }

    pub fn store(&self) -> &MetaStore {
        &self.store
    }

    pub fn index(&self) -> &SearchIndex {
        &self.index
    }

    pub fn current_branch(&self) -> &str {
        &self.branch
    }

    /// Create a named branch in both sub-systems.
    pub async fn branch(&self, name: &str) -> Result<()> {
        self.store.branch(name).await?;
        self.index.branch(name).await?;
        Ok(())
    }

    /// Switch both sub-systems to a named branch.
    pub async fn checkout(&mut self, name: &str) -> Result<()> {
        self.store.checkout(name).await?;
        self.index.checkout(name).await?;
        self.branch = name.to_string();
        Ok(())
    }

    /// Commit both sub-systems and record a new composite snapshot.
    pub async fn commit(&mut self, message: &str) -> Result<String> {
        let store_tx = self.store.head_tx().await?;
        let gen = self
            .index
            .commit(message, &[("store_tx", store_tx.to_string())])
            .await?;

        let parents: Vec<String> = self
            .snapshots
            .last()
            .map(|head| vec![head.id.clone()])
            .unwrap_or_default();
        let created_at = Utc::now().timestamp();

        let mut subs = BTreeMap::new();
        subs.insert(STORE_SUBSYSTEM.to_string(), store_tx.to_string());
        subs.insert(INDEX_SUBSYSTEM.to_string(), gen.to_string());

        let id = snapshot_id(&subs, &parents, message, created_at);
        let snapshot = CompositeSnapshot {
            id: id.clone(),
            parents,
            message: message.to_string(),
            created_at,
            subs,
        };

        append_history(&self.dir.join(HISTORY_FILE), &snapshot)?;
        self.snapshots.push(snapshot);

        tracing::debug!("Committed composite snapshot {} ({})", id, message);
        Ok(id)
    }

    /// Current head snapshot id.
    pub fn snapshot_id(&self) -> Option<&str> {
        self.snapshots.last().map(|s| s.id.as_str())
    }

    pub fn parent_ids(&self) -> Vec<String> {
        self.snapshots
            .last()
            .map(|s| s.parents.clone())
            .unwrap_or_default()
    }

    /// Snapshot ids, newest first.
    pub fn history(&self) -> Vec<String> {
        self.snapshots.iter().rev().map(|s| s.id.clone()).collect()
    }

    pub fn snapshot_meta(&self, id: &str) -> Option<&CompositeSnapshot> {
        self.snapshots.iter().find(|s| s.id == id)
    }

    /// Open read views of both sub-systems at the given snapshot. Errors
    /// unless both referenced sub-snapshots exist and are reachable.
    pub async fn as_of(&self, id: &str) -> Result<CompositeView> {
        let snapshot = self
            .snapshot_meta(id)
            .with_context(|| format!("unknown composite snapshot {}", id))?;

        let store_tx: i64 = snapshot
            .subs
            .get(STORE_SUBSYSTEM)
            .context("snapshot is missing its store sub-snapshot")?
            .parse()?;
        let gen: i64 = snapshot
            .subs
            .get(INDEX_SUBSYSTEM)
            .context("snapshot is missing its index sub-snapshot")?
            .parse()?;

        if self.store.head_tx().await? < store_tx {
            anyhow::bail!("store transaction {} is not reachable", store_tx);
        }
        let index = self.index.reader_as_of(gen).await?;

        Ok(CompositeView {
            store: self.store.as_of(store_tx),
            index,
        })
    }

    /// Commit the index with a final `"close"` generation, then release the
    /// index and the store connection, in that order.
    pub async fn close(self) -> Result<()> {
        self.index.commit("close", &[]).await?;
        self.index.close().await;
        self.store.close().await;
        Ok(())
    }
}

fn snapshot_id(
    subs: &BTreeMap<String, String>,
    parents: &[String],
    message: &str,
    created_at: i64,
) -> String {
    let mut hasher = Sha256::new();
    for (system, snap) in subs {
        hasher.update(system.as_bytes());
        hasher.update(b"=");
        hasher.update(snap.as_bytes());
        hasher.update(b";");
    }
    for parent in parents {
        hasher.update(parent.as_bytes());
        hasher.update(b";");
    }
    hasher.update(message.as_bytes());
    hasher.update(created_at.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

fn load_history(path: &Path) -> Result<Vec<CompositeSnapshot>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut snapshots = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let snapshot: CompositeSnapshot =
            serde_json::from_str(line).context("corrupt composite history entry")?;
        snapshots.push(snapshot);
    }
    Ok(snapshots)
}

fn append_history(path: &Path, snapshot: &CompositeSnapshot) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    serde_json::to_writer(&mut file, snapshot)?;
    file.write_all(b"\n")?;
    Ok(())
}
