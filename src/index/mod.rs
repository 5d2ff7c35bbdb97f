//! Fulltext index adapter over SQLite FTS5.
//!
//! One analyzed document per message, keyed `account/folder/uid`. Stored
//! fields live in `docs`; the tokenized fields (subject, from, to, body) in
//! the rowid-paired `docs_fts` virtual table. Documents are
//! generation-stamped (`gen_added` / `gen_deleted`); `commit` appends a
//! `generations` row with a message and key/value metadata, and readers can
//! be pinned to any committed generation. Each branch is a directory
//! (`<root>/<branch>/`) holding its own database; branching checkpoints and
//! copies the file.
//!
//! The index is strictly single-writer: one `SearchIndex` per database.
//! Point-in-time reads go through separately opened read-only
//! [`IndexReader`]s, closed by their callers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::mail::types::ParsedMessage;

const DB_FILE: &str = "index.db";

/// Live-document bound: with `i64::MAX` only rows with NULL `gen_deleted`
/// pass the generation window.
const LIVE: i64 = i64::MAX;

/// Pending generation: the one the next `commit` call will create.
const PENDING_GEN: &str = "(SELECT COALESCE(MAX(gen), 0) + 1 FROM generations)";

/// A single search result. `body` is analyzed but never returned.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub score: f64,
    pub uid: u32,
    pub folder: String,
    pub account: String,
    pub subject: String,
    pub from_addr: String,
    pub date: i64,
    pub msg_id: Option<String>,
}

/// Exact filters and limit for a search.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub account: Option<String>,
    pub folder: Option<String>,
    pub limit: usize,
}

pub struct SearchIndex {
    pool: SqlitePool,
    root: PathBuf,
    branch: String,
}

impl SearchIndex {
    /// Open the index at `<root>/main/`.
    pub async fn open(root: &Path) -> Result<Self> {
        Self::open_branch(root, "main").await
    }

    pub async fn open_branch(root: &Path, branch: &str) -> Result<Self> {
        let dir = root.join(branch);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let pool = open_pool(&dir.join(DB_FILE), false).await?;
        init_schema(&pool).await?;
        Ok(Self {
            pool,
            root: root.to_path_buf(),
            branch: branch.to_string(),
        })
    }

    pub fn current_branch(&self) -> &str {
        &self.branch
    }

    fn doc_id(account: &str, folder: &str, uid: u32) -> String {
        format!("{}/{}/{}", account, folder, uid)
    }

    //
    // Document Operations
    //

    /// Upsert documents for the given messages: any live document with the
    /// same id is deleted, then a fresh one is added, both stamped with the
    /// pending generation.
    pub async fn index_messages(
        &self,
        account: &str,
        folder: &str,
        messages: &[ParsedMessage],
    ) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut txn = self.pool.begin().await?;

        for msg in messages {
            let id = Self::doc_id(account, folder, msg.uid);

            sqlx::query(&format!(
                "UPDATE docs SET gen_deleted = {PENDING_GEN} WHERE id = ? AND gen_deleted IS NULL"
            ))
            .bind(&id)
            .execute(&mut *txn)
            .await?;

            let result = sqlx::query(&format!(
                r#"
                INSERT INTO docs (id, account, folder, uid, subject, from_addr, to_addr, date, msg_id, gen_added)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, {PENDING_GEN})
                "#
            ))
            .bind(&id)
            .bind(account)
            .bind(folder)
            .bind(msg.uid as i64)
            .bind(&msg.subject)
            .bind(&msg.from_addr)
            .bind(&msg.to_addr)
            .bind(msg.date)
            .bind(&msg.message_id)
            .execute(&mut *txn)
            .await?;

            sqlx::query(
                "INSERT INTO docs_fts (rowid, subject, from_addr, to_addr, body) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(result.last_insert_rowid())
            .bind(&msg.subject)
            .bind(&msg.from_addr)
            .bind(&msg.to_addr)
            .bind(msg.index_body())
            .execute(&mut *txn)
            .await?;
        }

        txn.commit().await?;
        Ok(())
    }

    /// Delete the documents of the given UIDs. Returns the delete count.
    pub async fn delete_messages(&self, account: &str, folder: &str, uids: &[u32]) -> Result<u64> {
        let mut deleted = 0;
        let mut txn = self.pool.begin().await?;
        for uid in uids {
            let result = sqlx::query(&format!(
                "UPDATE docs SET gen_deleted = {PENDING_GEN} WHERE id = ? AND gen_deleted IS NULL"
            ))
            .bind(Self::doc_id(account, folder, *uid))
            .execute(&mut *txn)
            .await?;
            deleted += result.rows_affected();
        }
        txn.commit().await?;
        Ok(deleted)
    }

    /// Delete every live document of a folder. Returns the delete count.
    pub async fn delete_folder(&self, account: &str, folder: &str) -> Result<u64> {
        let result = sqlx::query(&format!(
            "UPDATE docs SET gen_deleted = {PENDING_GEN} \
             WHERE account = ? AND folder = ? AND gen_deleted IS NULL"
        ))
        .bind(account)
        .bind(folder)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    //
    // Generations
    //

    /// Create a new generation carrying `message` and the given metadata,
    /// sealing all pending document changes. Returns the generation id.
    pub async fn commit(&self, message: &str, meta: &[(&str, String)]) -> Result<i64> {
        let mut txn = self.pool.begin().await?;

        let result = sqlx::query("INSERT INTO generations (message, created_at) VALUES (?, ?)")
            .bind(message)
            .bind(Utc::now().timestamp())
            .execute(&mut *txn)
            .await?;
        let gen = result.last_insert_rowid();

        for (key, value) in meta {
            sqlx::query("INSERT INTO generation_meta (gen, key, value) VALUES (?, ?, ?)")
                .bind(gen)
                .bind(*key)
                .bind(value)
                .execute(&mut *txn)
                .await?;
        }

        txn.commit().await?;
        Ok(gen)
    }

    /// The last committed generation, 0 for an empty index.
    pub async fn generation(&self) -> Result<i64> {
        let gen: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(gen), 0) FROM generations")
            .fetch_one(&self.pool)
            .await?;
        Ok(gen)
    }

    pub async fn exists_generation(&self, gen: i64) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT gen FROM generations WHERE gen = ?")
            .bind(gen)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Find the newest generation whose metadata contains `key = value`.
    pub async fn find_generation(&self, key: &str, value: &str) -> Result<Option<i64>> {
        let gen: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(gen) FROM generation_meta WHERE key = ? AND value = ?",
        )
        .bind(key)
        .bind(value)
        .fetch_optional(&self.pool)
        .await?
        .flatten();
        Ok(gen)
    }

    pub async fn commit_meta(&self, gen: i64) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM generation_meta WHERE gen = ?")
                .bind(gen)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    //
    // Search
    //

    pub async fn search(&self, query: &str, filter: &SearchFilter) -> Result<Vec<SearchHit>> {
        run_search(&self.pool, query, filter, LIVE).await
    }

    //
    // Branches and Readers
    //

    /// Fork the current branch into `<root>/<name>/` (checkpoint + copy).
    pub async fn branch(&self, name: &str) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;

        let target_dir = self.root.join(name);
        std::fs::create_dir_all(&target_dir)
            .with_context(|| format!("Failed to create {}", target_dir.display()))?;
        std::fs::copy(
            self.root.join(&self.branch).join(DB_FILE),
            target_dir.join(DB_FILE),
        )
        .with_context(|| format!("Failed to fork index branch '{}'", name))?;
        Ok(())
    }

    pub async fn checkout(&mut self, name: &str) -> Result<()> {
        let db = self.root.join(name).join(DB_FILE);
        if !db.exists() {
            anyhow::bail!("unknown index branch '{}'", name);
        }
        self.pool.close().await;
        self.pool = open_pool(&db, false).await?;
        self.branch = name.to_string();
        Ok(())
    }

    /// Open a read-only reader pinned at `gen`. Closing it is the caller's
    /// responsibility.
    pub async fn reader_as_of(&self, gen: i64) -> Result<IndexReader> {
        if gen != 0 && !self.exists_generation(gen).await? {
            anyhow::bail!("index generation {} does not exist", gen);
        }
        sqlx::query("PRAGMA wal_checkpoint(PASSIVE)")
            .execute(&self.pool)
            .await
            .ok();
        let pool = open_pool(&self.root.join(&self.branch).join(DB_FILE), true).await?;
        Ok(IndexReader { pool, gen })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// A read-only index view pinned at a generation.
pub struct IndexReader {
    pool: SqlitePool,
    gen: i64,
}

impl IndexReader {
    pub fn generation(&self) -> i64 {
        self.gen
    }

    pub async fn search(&self, query: &str, filter: &SearchFilter) -> Result<Vec<SearchHit>> {
        run_search(&self.pool, query, filter, self.gen).await
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

async fn open_pool(db: &Path, read_only: bool) -> Result<SqlitePool> {
    let db_url = if read_only {
        format!("sqlite:{}?mode=ro", db.display())
    } else {
        format!("sqlite:{}?mode=rwc", db.display())
    };

    let options = SqliteConnectOptions::from_str(&db_url)?
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5))
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

    SqlitePoolOptions::new()
        .max_connections(if read_only { 2 } else { 1 })
        .connect_with(options)
        .await
        .context("Failed to open fulltext index")
}

async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS generations (
            gen INTEGER PRIMARY KEY AUTOINCREMENT,
            message TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS generation_meta (
            gen INTEGER NOT NULL REFERENCES generations(gen),
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (gen, key)
        );

        -- Stored fields; tokenized content lives in docs_fts under the
        -- same rowid.
        CREATE TABLE IF NOT EXISTS docs (
            id TEXT NOT NULL,
            account TEXT NOT NULL,
            folder TEXT NOT NULL,
            uid INTEGER NOT NULL,
            subject TEXT NOT NULL DEFAULT '',
            from_addr TEXT NOT NULL DEFAULT '',
            to_addr TEXT,
            date INTEGER NOT NULL DEFAULT 0,
            msg_id TEXT,
            gen_added INTEGER NOT NULL,
            gen_deleted INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_docs_id ON docs(id);
        CREATE INDEX IF NOT EXISTS idx_docs_scope ON docs(account, folder);
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 tables must be created separately
    sqlx::query(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS docs_fts USING fts5(
            subject,
            from_addr,
            to_addr,
            body,
            tokenize='unicode61 remove_diacritics 1'
        );
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Build an FTS5 MATCH expression: every whitespace token must match in at
/// least one column (token-level AND of field-level OR, FTS5's default
/// semantics for quoted terms joined by spaces).
fn build_match_query(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

async fn run_search(
    pool: &SqlitePool,
    query: &str,
    filter: &SearchFilter,
    as_of_gen: i64,
) -> Result<Vec<SearchHit>> {
    let Some(match_query) = build_match_query(query) else {
        return Ok(Vec::new());
    };

    let mut sql = String::from(
        r#"
        SELECT d.uid, d.folder, d.account, d.subject, d.from_addr, d.date, d.msg_id,
               bm25(docs_fts) AS rank
        FROM docs_fts
        JOIN docs d ON d.rowid = docs_fts.rowid
        WHERE docs_fts MATCH ?
          AND d.gen_added <= ? AND (d.gen_deleted IS NULL OR d.gen_deleted > ?)
        "#,
    );
    if filter.account.is_some() {
        sql.push_str(" AND d.account = ?");
    }
    if filter.folder.is_some() {
        sql.push_str(" AND d.folder = ?");
    }
    sql.push_str(" ORDER BY rank LIMIT ?");

    let limit = if filter.limit == 0 {
        crate::constants::SEARCH_DEFAULT_LIMIT
    } else {
        filter.limit
    };

    let mut db_query = sqlx::query(&sql)
        .bind(&match_query)
        .bind(as_of_gen)
        .bind(as_of_gen);
    if let Some(account) = &filter.account {
        db_query = db_query.bind(account);
    }
    if let Some(folder) = &filter.folder {
        db_query = db_query.bind(folder);
    }
    db_query = db_query.bind(limit as i64);

    let rows = db_query.fetch_all(pool).await?;

    Ok(rows
        .into_iter()
        .map(|row| SearchHit {
            // bm25() is smaller-is-better; flip the sign so higher is better
            score: -row.get::<f64, _>("rank"),
            uid: row.get::<i64, _>("uid") as u32,
            folder: row.get("folder"),
            account: row.get("account"),
            subject: row.get("subject"),
            from_addr: row.get("from_addr"),
            date: row.get("date"),
            msg_id: row.get("msg_id"),
        })
        .collect())
}
