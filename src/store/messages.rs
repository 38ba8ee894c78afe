//! Messages, UID mappings, flag and push bookkeeping.

use std::collections::HashSet;

use base64::Engine;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use super::{
    delete_from_db, delete_to_db, direction_from_db, direction_to_db, kind_from_db, kind_to_db,
    push_from_db, push_to_db, read_from_db, read_to_db,
};
use crate::clock::from_epoch_secs;
use crate::codec::{CmsMessage, Envelope, MessageKind, MimePart, MultimediaMessage, TextMessage};
use crate::imap::ServerFlags;
use crate::sync::model::{
    DeleteStatus, Flag, FlagChangeSet, FlagOp, MessageMapping, PushStatus, ReadStatus,
};

/// A local message waiting to be APPENDed.
#[derive(Debug, Clone)]
pub struct PendingPush {
    pub base_id: String,
    pub folder: String,
    /// Push with `\Seen` set.
    pub seen: bool,
    pub message: CmsMessage,
}

/// Random opaque message identifier.
fn new_base_id() -> Result<String, sqlx::Error> {
    let mut bytes = [0u8; 12];
    getrandom::fill(&mut bytes).map_err(|e| sqlx::Error::Io(std::io::Error::other(e.to_string())))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

async fn insert_message(
    tx: &mut Transaction<'_, Sqlite>,
    base_id: &str,
    message: &CmsMessage,
) -> Result<(), sqlx::Error> {
    let envelope = message.envelope();
    let (subject, text) = match message {
        CmsMessage::Sms(m) | CmsMessage::Chat(m) => (None, m.text.clone()),
        CmsMessage::Mms(m) => (m.subject.clone(), m.summary_text()),
    };

    sqlx::query(
        r#"
        INSERT INTO messages
        (base_id, kind, from_addr, to_addr, contact, direction, date, conversation_id, contribution_id, imdn_message_id, subject, text, correlator)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(base_id)
    .bind(kind_to_db(message.kind()))
    .bind(&envelope.from)
    .bind(&envelope.to)
    .bind(envelope.contact())
    .bind(direction_to_db(envelope.direction))
    .bind(envelope.date.timestamp())
    .bind(&envelope.conversation_id)
    .bind(&envelope.contribution_id)
    .bind(&envelope.imdn_message_id)
    .bind(subject)
    .bind(text)
    .bind(message.correlator())
    .execute(&mut **tx)
    .await?;

    if let CmsMessage::Mms(mms) = message {
        for (position, part) in mms.parts.iter().enumerate() {
            sqlx::query(
                "INSERT INTO mms_parts (base_id, position, content_type, content_id, transfer_encoding, content) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(base_id)
            .bind(position as i64)
            .bind(&part.content_type)
            .bind(&part.content_id)
            .bind(&part.transfer_encoding)
            .bind(&part.content)
            .execute(&mut **tx)
            .await?;
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn insert_mapping(
    tx: &mut Transaction<'_, Sqlite>,
    base_id: &str,
    folder: &str,
    uid: Option<u32>,
    kind: MessageKind,
    push: PushStatus,
    read: ReadStatus,
    delete: DeleteStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO mappings (base_id, folder, uid, kind, push_status, read_status, delete_status) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(base_id)
    .bind(folder)
    .bind(uid.map(i64::from))
    .bind(kind_to_db(kind))
    .bind(push_to_db(push))
    .bind(read_to_db(read))
    .bind(delete_to_db(delete))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub(super) async fn insert_remote(
    pool: &SqlitePool,
    folder: &str,
    uid: u32,
    message: &CmsMessage,
    flags: ServerFlags,
) -> Result<String, sqlx::Error> {
    let base_id = new_base_id()?;
    let read = if flags.contains(ServerFlags::SEEN) {
        ReadStatus::Read
    } else {
        ReadStatus::Unread
    };
    let delete = if flags.contains(ServerFlags::DELETED) {
        DeleteStatus::Deleted
    } else {
        DeleteStatus::NotDeleted
    };

    let mut tx = pool.begin().await?;
    insert_message(&mut tx, &base_id, message).await?;
    insert_mapping(
        &mut tx,
        &base_id,
        folder,
        Some(uid),
        message.kind(),
        PushStatus::Pushed,
        read,
        delete,
    )
    .await?;
    tx.commit().await?;

    Ok(base_id)
}

pub(super) async fn insert_local(
    pool: &SqlitePool,
    folder: &str,
    message: &CmsMessage,
) -> Result<String, sqlx::Error> {
    let base_id = new_base_id()?;

    let mut tx = pool.begin().await?;
    insert_message(&mut tx, &base_id, message).await?;
    insert_mapping(
        &mut tx,
        &base_id,
        folder,
        None,
        message.kind(),
        PushStatus::Requested,
        ReadStatus::Read,
        DeleteStatus::NotDeleted,
    )
    .await?;
    tx.commit().await?;

    Ok(base_id)
}

pub(super) async fn load_message(
    pool: &SqlitePool,
    base_id: &str,
) -> Result<Option<CmsMessage>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM messages WHERE base_id = ?")
        .bind(base_id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => Ok(Some(row_to_message(pool, base_id, &row).await?)),
        None => Ok(None),
    }
}

async fn row_to_message(
    pool: &SqlitePool,
    base_id: &str,
    row: &SqliteRow,
) -> Result<CmsMessage, sqlx::Error> {
    let envelope = Envelope {
        from: row.get("from_addr"),
        to: row.get("to_addr"),
        date: from_epoch_secs(row.get("date")),
        direction: direction_from_db(row.get("direction"))?,
        conversation_id: row.get("conversation_id"),
        contribution_id: row.get("contribution_id"),
        imdn_message_id: row.get("imdn_message_id"),
    };

    Ok(match kind_from_db(row.get("kind"))? {
        MessageKind::Sms => CmsMessage::Sms(TextMessage {
            envelope,
            text: row.get::<Option<String>, _>("text").unwrap_or_default(),
        }),
        MessageKind::Chat => CmsMessage::Chat(TextMessage {
            envelope,
            text: row.get::<Option<String>, _>("text").unwrap_or_default(),
        }),
        MessageKind::Mms => {
            let parts = sqlx::query(
                "SELECT content_type, content_id, transfer_encoding, content FROM mms_parts WHERE base_id = ? ORDER BY position",
            )
            .bind(base_id)
            .fetch_all(pool)
            .await?
            .into_iter()
            .map(|part| MimePart {
                content_type: part.get("content_type"),
                content_id: part.get("content_id"),
                transfer_encoding: part.get("transfer_encoding"),
                content: part.get("content"),
            })
            .collect();

            CmsMessage::Mms(MultimediaMessage {
                envelope,
                subject: row.get("subject"),
                parts,
            })
        }
    })
}

fn row_to_mapping(row: &SqliteRow) -> Result<MessageMapping, sqlx::Error> {
    Ok(MessageMapping {
        base_id: row.get("base_id"),
        folder: row.get("folder"),
        uid: row.get::<Option<i64>, _>("uid").map(|v| v as u32),
        kind: kind_from_db(row.get("kind"))?,
        push_status: push_from_db(row.get("push_status"))?,
        read_status: read_from_db(row.get("read_status"))?,
        delete_status: delete_from_db(row.get("delete_status"))?,
    })
}

pub(super) async fn mapping(
    pool: &SqlitePool,
    base_id: &str,
) -> Result<Option<MessageMapping>, sqlx::Error> {
    sqlx::query("SELECT * FROM mappings WHERE base_id = ?")
        .bind(base_id)
        .fetch_optional(pool)
        .await?
        .as_ref()
        .map(row_to_mapping)
        .transpose()
}

pub(super) async fn known_uids(pool: &SqlitePool, folder: &str) -> Result<HashSet<u32>, sqlx::Error> {
    let uids: Vec<i64> =
        sqlx::query_scalar("SELECT uid FROM mappings WHERE folder = ? AND uid IS NOT NULL")
            .bind(folder)
            .fetch_all(pool)
            .await?;
    Ok(uids.into_iter().map(|uid| uid as u32).collect())
}

pub(super) async fn unlink_folder(
    tx: &mut Transaction<'_, Sqlite>,
    folder: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE mappings SET uid = NULL WHERE folder = ? AND uid IS NOT NULL")
        .bind(folder)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

pub(super) async fn find_unlinked(
    pool: &SqlitePool,
    folder: &str,
    envelope: &Envelope,
    correlator: Option<&str>,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT m.base_id FROM mappings m
        JOIN messages msg ON msg.base_id = m.base_id
        WHERE m.folder = ? AND m.uid IS NULL AND m.push_status IN (?, ?)
          AND msg.direction = ? AND msg.from_addr = ? AND msg.to_addr = ?
          AND (msg.correlator = ? OR msg.imdn_message_id = ?)
        ORDER BY msg.date
        LIMIT 1
        "#,
    )
    .bind(folder)
    .bind(push_to_db(PushStatus::Pushed))
    .bind(push_to_db(PushStatus::Appending))
    .bind(direction_to_db(envelope.direction))
    .bind(&envelope.from)
    .bind(&envelope.to)
    .bind(correlator)
    .bind(envelope.imdn_message_id.as_deref())
    .fetch_optional(pool)
    .await
}

pub(super) async fn link_uid(pool: &SqlitePool, base_id: &str, uid: u32) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE mappings SET uid = ?, push_status = ? WHERE base_id = ?")
        .bind(i64::from(uid))
        .bind(push_to_db(PushStatus::Pushed))
        .bind(base_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Remote to local: `\Seen` marks read, unless a local read is pending on
/// removal; `\Deleted` marks deleted. Undelete is not propagated.
pub(super) async fn apply_remote_flags(
    pool: &SqlitePool,
    change: &FlagChangeSet,
) -> Result<u64, sqlx::Error> {
    let statement = match (change.flag, change.op) {
        (Flag::Seen, FlagOp::Add) => format!(
            "UPDATE mappings SET read_status = {} WHERE folder = ? AND uid = ? AND read_status != {}",
            read_to_db(ReadStatus::Read),
            read_to_db(ReadStatus::Read)
        ),
        (Flag::Seen, FlagOp::Remove) => format!(
            "UPDATE mappings SET read_status = {} WHERE folder = ? AND uid = ? AND read_status = {}",
            read_to_db(ReadStatus::Unread),
            read_to_db(ReadStatus::Read)
        ),
        (Flag::Deleted, FlagOp::Add) => format!(
            "UPDATE mappings SET delete_status = {} WHERE folder = ? AND uid = ? AND delete_status != {}",
            delete_to_db(DeleteStatus::Deleted),
            delete_to_db(DeleteStatus::Deleted)
        ),
        (Flag::Deleted, FlagOp::Remove) => return Ok(0),
    };

    let mut tx = pool.begin().await?;
    let mut changed = 0;
    for uid in &change.uids {
        changed += sqlx::query(&statement)
            .bind(&change.folder)
            .bind(i64::from(*uid))
            .execute(&mut *tx)
            .await?
            .rows_affected();
    }
    tx.commit().await?;
    Ok(changed)
}

pub(super) async fn pending_flag_changes(
    pool: &SqlitePool,
    folder: &str,
) -> Result<Vec<FlagChangeSet>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT uid, read_status, delete_status FROM mappings WHERE folder = ? AND uid IS NOT NULL AND (read_status = ? OR delete_status = ?)",
    )
    .bind(folder)
    .bind(read_to_db(ReadStatus::ReadRequested))
    .bind(delete_to_db(DeleteStatus::DeleteRequested))
    .fetch_all(pool)
    .await?;

    let mut seen = FlagChangeSet::new(folder, Flag::Seen, FlagOp::Add);
    let mut deleted = FlagChangeSet::new(folder, Flag::Deleted, FlagOp::Add);
    for row in rows {
        let uid = row.get::<i64, _>("uid") as u32;
        if read_from_db(row.get("read_status"))? == ReadStatus::ReadRequested {
            seen.uids.insert(uid);
        }
        if delete_from_db(row.get("delete_status"))? == DeleteStatus::DeleteRequested {
            deleted.uids.insert(uid);
        }
    }

    Ok([seen, deleted].into_iter().filter(|c| !c.is_empty()).collect())
}

pub(super) async fn ack_flag_change(pool: &SqlitePool, change: &FlagChangeSet) -> Result<(), sqlx::Error> {
    let statement = match (change.flag, change.op) {
        (Flag::Seen, FlagOp::Add) => format!(
            "UPDATE mappings SET read_status = {} WHERE folder = ? AND uid = ? AND read_status = {}",
            read_to_db(ReadStatus::Read),
            read_to_db(ReadStatus::ReadRequested)
        ),
        (Flag::Deleted, FlagOp::Add) => format!(
            "UPDATE mappings SET delete_status = {} WHERE folder = ? AND uid = ? AND delete_status = {}",
            delete_to_db(DeleteStatus::Deleted),
            delete_to_db(DeleteStatus::DeleteRequested)
        ),
        _ => return Ok(()),
    };

    let mut tx = pool.begin().await?;
    for uid in &change.uids {
        sqlx::query(&statement)
            .bind(&change.folder)
            .bind(i64::from(*uid))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub(super) async fn push_requested(
    pool: &SqlitePool,
    kinds: &[MessageKind],
    with_unacknowledged: bool,
) -> Result<Vec<PendingPush>, sqlx::Error> {
    if kinds.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; kinds.len()].join(", ");
    let sql = format!(
        "SELECT m.base_id, m.folder, m.read_status FROM mappings m JOIN messages msg ON msg.base_id = m.base_id \
         WHERE m.push_status IN (?, ?) AND m.kind IN ({}) ORDER BY msg.date",
        placeholders
    );

    let unacknowledged = if with_unacknowledged {
        PushStatus::Appending
    } else {
        PushStatus::Requested
    };
    let mut query = sqlx::query(&sql)
        .bind(push_to_db(PushStatus::Requested))
        .bind(push_to_db(unacknowledged));
    for kind in kinds {
        query = query.bind(kind_to_db(*kind));
    }
    let rows = query.fetch_all(pool).await?;

    let mut pending = Vec::with_capacity(rows.len());
    for row in rows {
        let base_id: String = row.get("base_id");
        let Some(message) = load_message(pool, &base_id).await? else {
            continue;
        };
        pending.push(PendingPush {
            folder: row.get("folder"),
            seen: read_from_db(row.get("read_status"))? != ReadStatus::Unread,
            base_id,
            message,
        });
    }
    Ok(pending)
}

pub(super) async fn set_push_status(
    pool: &SqlitePool,
    base_id: &str,
    status: PushStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE mappings SET push_status = ? WHERE base_id = ? AND uid IS NULL")
        .bind(push_to_db(status))
        .bind(base_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub(super) async fn record_push(
    pool: &SqlitePool,
    base_id: &str,
    uid: Option<u32>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE mappings SET push_status = ?, uid = ? WHERE base_id = ?")
        .bind(push_to_db(PushStatus::Pushed))
        .bind(uid.map(i64::from))
        .bind(base_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub(super) async fn request_read(pool: &SqlitePool, base_id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE mappings SET read_status = ? WHERE base_id = ? AND read_status = ?")
        .bind(read_to_db(ReadStatus::ReadRequested))
        .bind(base_id)
        .bind(read_to_db(ReadStatus::Unread))
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub(super) async fn request_delete(pool: &SqlitePool, base_id: &str) -> Result<bool, sqlx::Error> {
    let result =
        sqlx::query("UPDATE mappings SET delete_status = ? WHERE base_id = ? AND delete_status = ?")
            .bind(delete_to_db(DeleteStatus::DeleteRequested))
            .bind(base_id)
            .bind(delete_to_db(DeleteStatus::NotDeleted))
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}
