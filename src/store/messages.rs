//! Message, flag, and attachment operations over the tx-stamped schema.

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::mail::types::{AttachmentMeta, MessageFlags, ParsedMessage};

use super::{MessageKey, MessageRecord};

/// Reads against the live database use this bound: with `as_of = i64::MAX`
/// only rows whose `tx_retracted` is NULL survive the window predicate.
pub(super) const LIVE: i64 = i64::MAX;

fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(",")
}

/// Append a row to the transaction log and return its id.
async fn new_tx(conn: &mut SqliteConnection) -> Result<i64> {
    let result = sqlx::query("INSERT INTO transactions (created_at) VALUES (?)")
        .bind(Utc::now().timestamp())
        .execute(&mut *conn)
        .await?;
    Ok(result.last_insert_rowid())
}

/// Retract a message row together with its flag and attachment children.
async fn retract_message_row(conn: &mut SqliteConnection, message_row: i64, tx: i64) -> Result<()> {
    sqlx::query(
        "UPDATE message_flags SET tx_retracted = ? WHERE message_row = ? AND tx_retracted IS NULL",
    )
    .bind(tx)
    .bind(message_row)
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "UPDATE attachments SET tx_retracted = ? WHERE message_row = ? AND tx_retracted IS NULL",
    )
    .bind(tx)
    .bind(message_row)
    .execute(&mut *conn)
    .await?;
    sqlx::query("UPDATE messages SET tx_retracted = ? WHERE id = ?")
        .bind(tx)
        .bind(message_row)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Store a batch of messages with their attachments in one transaction,
/// returning the transaction id.
///
/// Re-storing an existing (folder, uid) retracts the prior assertion in the
/// same transaction, so re-running a sync is idempotent.
pub async fn store_messages_with_attachments(
    pool: &SqlitePool,
    folder_id: i64,
    messages: &[ParsedMessage],
) -> Result<i64> {
    let mut txn = pool.begin().await?;
    let tx = new_tx(&mut txn).await?;

    for msg in messages {
        let prior: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM messages WHERE folder_id = ? AND uid = ? AND tx_retracted IS NULL",
        )
        .bind(folder_id)
        .bind(msg.uid as i64)
        .fetch_all(&mut *txn)
        .await?;
        for (row_id,) in prior {
            retract_message_row(&mut txn, row_id, tx).await?;
        }

        let references_str = if msg.references.is_empty() {
            None
        } else {
            Some(msg.references.join(" "))
        };

        let result = sqlx::query(
            r#"
            INSERT INTO messages
            (folder_id, uid, message_id, subject, from_addr, to_addr, cc_addr, date, size,
             in_reply_to, references_list, eml_path, has_attachments, tx_added)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(folder_id)
        .bind(msg.uid as i64)
        .bind(&msg.message_id)
        .bind(&msg.subject)
        .bind(&msg.from_addr)
        .bind(&msg.to_addr)
        .bind(&msg.cc_addr)
        .bind(msg.date)
        .bind(msg.size as i64)
        .bind(&msg.in_reply_to)
        .bind(references_str)
        .bind(&msg.eml_path)
        .bind(msg.has_attachments())
        .bind(tx)
        .execute(&mut *txn)
        .await?;
        let message_row = result.last_insert_rowid();

        for name in msg.flags.names() {
            sqlx::query("INSERT INTO message_flags (message_row, flag, tx_added) VALUES (?, ?, ?)")
                .bind(message_row)
                .bind(name)
                .bind(tx)
                .execute(&mut *txn)
                .await?;
        }

        for att in &msg.attachments {
            sqlx::query(
                r#"
                INSERT INTO attachments (message_row, filename, content_type, size, path, tx_added)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(message_row)
            .bind(&att.filename)
            .bind(&att.content_type)
            .bind(att.size)
            .bind(&att.path)
            .bind(tx)
            .execute(&mut *txn)
            .await?;
        }
    }

    txn.commit().await?;
    Ok(tx)
}

/// Retract the given UIDs and their children. Returns the retraction count
/// and the transaction id (0 when nothing matched).
pub async fn retract_messages(
    pool: &SqlitePool,
    folder_id: i64,
    uids: &[u32],
) -> Result<(u64, i64)> {
    if uids.is_empty() {
        return Ok((0, 0));
    }

    let mut txn = pool.begin().await?;

    let sql = format!(
        "SELECT id FROM messages WHERE folder_id = ? AND tx_retracted IS NULL AND uid IN ({})",
        placeholders(uids.len())
    );
    let mut query = sqlx::query_as::<_, (i64,)>(&sql).bind(folder_id);
    for uid in uids {
        query = query.bind(*uid as i64);
    }
    let rows: Vec<(i64,)> = query.fetch_all(&mut *txn).await?;

    if rows.is_empty() {
        txn.rollback().await?;
        return Ok((0, 0));
    }

    let tx = new_tx(&mut txn).await?;
    for (row_id,) in &rows {
        retract_message_row(&mut txn, *row_id, tx).await?;
    }

    txn.commit().await?;
    Ok((rows.len() as u64, tx))
}

/// Retract every live message of the folder. Returns count and tx id.
pub async fn retract_folder_messages(pool: &SqlitePool, folder_id: i64) -> Result<(u64, i64)> {
    let mut txn = pool.begin().await?;

    let rows: Vec<(i64,)> =
        sqlx::query_as("SELECT id FROM messages WHERE folder_id = ? AND tx_retracted IS NULL")
            .bind(folder_id)
            .fetch_all(&mut *txn)
            .await?;

    if rows.is_empty() {
        txn.rollback().await?;
        return Ok((0, 0));
    }

    let tx = new_tx(&mut txn).await?;
    for (row_id,) in &rows {
        retract_message_row(&mut txn, *row_id, tx).await?;
    }

    txn.commit().await?;
    Ok((rows.len() as u64, tx))
}

pub async fn get_local_uids(
    pool: &SqlitePool,
    folder_id: i64,
    as_of: i64,
) -> Result<BTreeSet<u32>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        r#"
        SELECT uid FROM messages
        WHERE folder_id = ? AND tx_added <= ? AND (tx_retracted IS NULL OR tx_retracted > ?)
        "#,
    )
    .bind(folder_id)
    .bind(as_of)
    .bind(as_of)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(uid,)| uid as u32).collect())
}

/// Current flag set per live UID. Messages without flag rows map to the
/// empty set.
pub async fn get_local_flags(
    pool: &SqlitePool,
    folder_id: i64,
) -> Result<HashMap<u32, MessageFlags>> {
    let rows = sqlx::query(
        r#"
        SELECT m.uid, f.flag
        FROM messages m
        LEFT JOIN message_flags f ON f.message_row = m.id AND f.tx_retracted IS NULL
        WHERE m.folder_id = ? AND m.tx_retracted IS NULL
        "#,
    )
    .bind(folder_id)
    .fetch_all(pool)
    .await?;

    let mut map: HashMap<u32, MessageFlags> = HashMap::new();
    for row in rows {
        let uid = row.get::<i64, _>("uid") as u32;
        let entry = map.entry(uid).or_default();
        if let Some(name) = row.get::<Option<String>, _>("flag") {
            if let Some(flag) = MessageFlags::from_persisted_name(&name) {
                *entry |= flag;
            }
        }
    }
    Ok(map)
}

/// Apply a minimal retract/add diff per message for the given flag sets,
/// all in one transaction. Returns the transaction id (0 when no row
/// actually changed).
pub async fn update_flags(
    pool: &SqlitePool,
    folder_id: i64,
    flags: &HashMap<u32, MessageFlags>,
) -> Result<i64> {
    if flags.is_empty() {
        return Ok(0);
    }

    let mut txn = pool.begin().await?;
    let tx = new_tx(&mut txn).await?;
    let mut changed = false;

    for (uid, target) in flags {
        let Some((message_row,)) = sqlx::query_as::<_, (i64,)>(
            "SELECT id FROM messages WHERE folder_id = ? AND uid = ? AND tx_retracted IS NULL",
        )
        .bind(folder_id)
        .bind(*uid as i64)
        .fetch_optional(&mut *txn)
        .await?
        else {
            continue;
        };

        let current_rows: Vec<(String,)> = sqlx::query_as(
            "SELECT flag FROM message_flags WHERE message_row = ? AND tx_retracted IS NULL",
        )
        .bind(message_row)
        .fetch_all(&mut *txn)
        .await?;
        let mut current = MessageFlags::empty();
        for (name,) in &current_rows {
            if let Some(flag) = MessageFlags::from_persisted_name(name) {
                current |= flag;
            }
        }

        let to_remove = current - *target;
        let to_add = *target - current;

        for name in to_remove.names() {
            sqlx::query(
                "UPDATE message_flags SET tx_retracted = ? \
                 WHERE message_row = ? AND flag = ? AND tx_retracted IS NULL",
            )
            .bind(tx)
            .bind(message_row)
            .bind(name)
            .execute(&mut *txn)
            .await?;
            changed = true;
        }
        for name in to_add.names() {
            sqlx::query("INSERT INTO message_flags (message_row, flag, tx_added) VALUES (?, ?, ?)")
                .bind(message_row)
                .bind(name)
                .bind(tx)
                .execute(&mut *txn)
                .await?;
            changed = true;
        }
    }

    if !changed {
        txn.rollback().await?;
        return Ok(0);
    }

    txn.commit().await?;
    Ok(tx)
}

const MESSAGE_COLUMNS: &str = r#"
    m.uid, m.message_id, m.subject, m.from_addr, m.to_addr, m.cc_addr, m.date, m.size,
    m.in_reply_to, m.references_list, m.eml_path, m.has_attachments,
    GROUP_CONCAT(f.flag) AS flags
"#;

fn row_to_message_record(row: SqliteRow) -> MessageRecord {
    let references_str: Option<String> = row.get("references_list");
    let references = references_str
        .map(|s| s.split_whitespace().map(|s| s.to_string()).collect())
        .unwrap_or_default();

    let mut flags = MessageFlags::empty();
    if let Some(joined) = row.get::<Option<String>, _>("flags") {
        for name in joined.split(',') {
            if let Some(flag) = MessageFlags::from_persisted_name(name) {
                flags |= flag;
            }
        }
    }

    MessageRecord {
        uid: row.get::<i64, _>("uid") as u32,
        message_id: row.get("message_id"),
        subject: row.get("subject"),
        from_addr: row.get("from_addr"),
        to_addr: row.get("to_addr"),
        cc_addr: row.get("cc_addr"),
        date: row.get("date"),
        flags,
        size: row.get("size"),
        in_reply_to: row.get("in_reply_to"),
        references,
        eml_path: row.get("eml_path"),
        has_attachments: row.get("has_attachments"),
    }
}

pub async fn list_messages(
    pool: &SqlitePool,
    folder_id: i64,
    limit: usize,
    as_of: i64,
) -> Result<Vec<MessageRecord>> {
    let sql = format!(
        r#"
        SELECT {MESSAGE_COLUMNS}
        FROM messages m
        LEFT JOIN message_flags f ON f.message_row = m.id
            AND f.tx_added <= ? AND (f.tx_retracted IS NULL OR f.tx_retracted > ?)
        WHERE m.folder_id = ? AND m.tx_added <= ?
            AND (m.tx_retracted IS NULL OR m.tx_retracted > ?)
        GROUP BY m.id
        ORDER BY m.date DESC, m.uid DESC
        LIMIT ?
        "#
    );

    let rows = sqlx::query(&sql)
        .bind(as_of)
        .bind(as_of)
        .bind(folder_id)
        .bind(as_of)
        .bind(as_of)
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().map(row_to_message_record).collect())
}

pub async fn read_message(
    pool: &SqlitePool,
    folder_id: i64,
    key: &MessageKey,
) -> Result<Option<MessageRecord>> {
    let key_clause = match key {
        MessageKey::Uid(_) => "m.uid = ?",
        MessageKey::MessageId(_) => "m.message_id = ?",
    };
    let sql = format!(
        r#"
        SELECT {MESSAGE_COLUMNS}
        FROM messages m
        LEFT JOIN message_flags f ON f.message_row = m.id AND f.tx_retracted IS NULL
        WHERE m.folder_id = ? AND m.tx_retracted IS NULL AND {key_clause}
        GROUP BY m.id
        LIMIT 1
        "#
    );

    let query = sqlx::query(&sql).bind(folder_id);
    let query = match key {
        MessageKey::Uid(uid) => query.bind(*uid as i64),
        MessageKey::MessageId(id) => query.bind(id.clone()),
    };

    let row = query.fetch_optional(pool).await?;
    Ok(row.map(row_to_message_record))
}

pub async fn get_attachments(
    pool: &SqlitePool,
    folder_id: i64,
    uid: u32,
) -> Result<Vec<AttachmentMeta>> {
    let rows = sqlx::query(
        r#"
        SELECT a.filename, a.content_type, a.size, a.path
        FROM attachments a
        JOIN messages m ON m.id = a.message_row
        WHERE m.folder_id = ? AND m.uid = ? AND m.tx_retracted IS NULL
            AND a.tx_retracted IS NULL
        ORDER BY a.id
        "#,
    )
    .bind(folder_id)
    .bind(uid as i64)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| AttachmentMeta {
            filename: row.get("filename"),
            content_type: row.get("content_type"),
            size: row.get("size"),
            path: row.get("path"),
        })
        .collect())
}

pub async fn message_count(pool: &SqlitePool, folder_id: i64, as_of: i64) -> Result<u64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM messages
        WHERE folder_id = ? AND tx_added <= ? AND (tx_retracted IS NULL OR tx_retracted > ?)
        "#,
    )
    .bind(folder_id)
    .bind(as_of)
    .bind(as_of)
    .fetch_one(pool)
    .await?;
    Ok(count as u64)
}

/// Count of live attachment rows whose parent message is among `uids`.
/// Used to verify the retraction cascade.
#[cfg(test)]
pub async fn attachment_count_for_uids(
    pool: &SqlitePool,
    folder_id: i64,
    uids: &[u32],
) -> Result<u64> {
    let sql = format!(
        r#"
        SELECT COUNT(*) FROM attachments a
        JOIN messages m ON m.id = a.message_row
        WHERE m.folder_id = ? AND a.tx_retracted IS NULL AND m.uid IN ({})
        "#,
        placeholders(uids.len())
    );
    let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(folder_id);
    for uid in uids {
        query = query.bind(*uid as i64);
    }
    Ok(query.fetch_one(pool).await? as u64)
}
