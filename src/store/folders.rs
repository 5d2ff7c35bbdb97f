//! Account and folder operations, including persisted sync state.

use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::mail::types::FolderSyncState;

/// Create the account entity if absent and return its row id.
///
/// The stable id is a UUIDv3 of `briefkasten/<name>` in the URL namespace,
/// so the same account always maps to the same identifier.
pub async fn create_account(pool: &SqlitePool, name: &str, email: &str) -> Result<i64> {
    let stable_id = Uuid::new_v3(
        &Uuid::NAMESPACE_URL,
        format!("briefkasten/{}", name).as_bytes(),
    );

    sqlx::query("INSERT OR IGNORE INTO accounts (name, stable_id, email) VALUES (?, ?, ?)")
        .bind(name)
        .bind(stable_id.to_string())
        .bind(email)
        .execute(pool)
        .await?;

    let id: i64 = sqlx::query_scalar("SELECT id FROM accounts WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await?;
    Ok(id)
}

pub async fn get_or_create_folder(pool: &SqlitePool, account_id: i64, name: &str) -> Result<i64> {
    sqlx::query("INSERT OR IGNORE INTO folders (account_id, name) VALUES (?, ?)")
        .bind(account_id)
        .bind(name)
        .execute(pool)
        .await?;

    let id: i64 = sqlx::query_scalar("SELECT id FROM folders WHERE account_id = ? AND name = ?")
        .bind(account_id)
        .bind(name)
        .fetch_one(pool)
        .await?;
    Ok(id)
}

pub async fn get_folder(pool: &SqlitePool, account_id: i64, name: &str) -> Result<Option<i64>> {
    let id = sqlx::query_scalar("SELECT id FROM folders WHERE account_id = ? AND name = ?")
        .bind(account_id)
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(id)
}

pub async fn get_folder_sync_state(
    pool: &SqlitePool,
    account_id: i64,
    name: &str,
) -> Result<Option<FolderSyncState>> {
    let row = sqlx::query(
        "SELECT uidvalidity, uidnext, last_sync FROM folders WHERE account_id = ? AND name = ?",
    )
    .bind(account_id)
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| FolderSyncState {
        uidvalidity: row.get::<Option<i64>, _>("uidvalidity").map(|v| v as u32),
        uidnext: row.get::<Option<i64>, _>("uidnext").map(|v| v as u32),
        last_sync: row.get("last_sync"),
    }))
}

/// Record the folder's server state and stamp `last_sync = now`.
pub async fn update_folder_sync_state(
    pool: &SqlitePool,
    folder_id: i64,
    uidvalidity: u32,
    uidnext: u32,
) -> Result<()> {
    sqlx::query("UPDATE folders SET uidvalidity = ?, uidnext = ?, last_sync = ? WHERE id = ?")
        .bind(uidvalidity as i64)
        .bind(uidnext as i64)
        .bind(Utc::now().timestamp())
        .bind(folder_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_folders(pool: &SqlitePool, account_id: i64) -> Result<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT name FROM folders WHERE account_id = ? ORDER BY name")
            .bind(account_id)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}
