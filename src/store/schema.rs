//! Metadata store schema initialization.

use anyhow::Result;
use sqlx::SqlitePool;

/// Initialize the metadata store schema.
///
/// Message, flag, and attachment rows are transaction-stamped: `tx_added`
/// is the transaction that asserted the row, `tx_retracted` the one that
/// retracted it (NULL while live). Reads as of transaction T see rows with
/// `tx_added <= T AND (tx_retracted IS NULL OR tx_retracted > T)`.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        -- Transaction log; the rowid is the transaction id handed to
        -- index commits and snapshot records.
        CREATE TABLE IF NOT EXISTS transactions (
            tx INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at INTEGER NOT NULL
        );

        -- Accounts are created on demand and never deleted.
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            stable_id TEXT NOT NULL,
            email TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS folders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL REFERENCES accounts(id),
            name TEXT NOT NULL,
            uidvalidity INTEGER,
            uidnext INTEGER,
            last_sync INTEGER,
            UNIQUE (account_id, name)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            folder_id INTEGER NOT NULL REFERENCES folders(id),
            uid INTEGER NOT NULL,
            message_id TEXT,
            subject TEXT NOT NULL DEFAULT '',
            from_addr TEXT NOT NULL DEFAULT '',
            to_addr TEXT,
            cc_addr TEXT,
            date INTEGER NOT NULL DEFAULT 0,
            size INTEGER NOT NULL DEFAULT 0,
            in_reply_to TEXT,
            references_list TEXT,
            eml_path TEXT,
            has_attachments INTEGER NOT NULL DEFAULT 0,
            tx_added INTEGER NOT NULL,
            tx_retracted INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_messages_folder_uid ON messages(folder_id, uid);
        CREATE INDEX IF NOT EXISTS idx_messages_message_id ON messages(message_id);
        CREATE INDEX IF NOT EXISTS idx_messages_live ON messages(folder_id) WHERE tx_retracted IS NULL;

        -- Multi-valued flag set; one row per (message, flag) assertion so
        -- flag updates are minimal retract/add diffs.
        CREATE TABLE IF NOT EXISTS message_flags (
            message_row INTEGER NOT NULL REFERENCES messages(id),
            flag TEXT NOT NULL,
            tx_added INTEGER NOT NULL,
            tx_retracted INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_flags_message ON message_flags(message_row);

        CREATE TABLE IF NOT EXISTS attachments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_row INTEGER NOT NULL REFERENCES messages(id),
            filename TEXT NOT NULL DEFAULT '',
            content_type TEXT NOT NULL DEFAULT 'application/octet-stream',
            size INTEGER NOT NULL DEFAULT -1,
            path TEXT,
            tx_added INTEGER NOT NULL,
            tx_retracted INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_row);

        -- Named branch refs over the transaction log.
        CREATE TABLE IF NOT EXISTS branches (
            name TEXT PRIMARY KEY,
            head_tx INTEGER NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
