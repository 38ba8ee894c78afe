//! SQLite store for local messages, UID mappings and folder snapshots.
//!
//! This module is split into:
//! - `mod.rs` - LocalStore struct, connection pool, folder snapshot operations
//! - `schema.rs` - Database schema initialization
//! - `messages.rs` - Messages, UID mappings, flag and push bookkeeping
//!
//! Enumerations are mapped to integers here and nowhere else.

mod messages;
mod schema;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::codec::{CmsMessage, Direction, Envelope, MessageKind};
use crate::error::Result;
use crate::imap::ServerFlags;
use crate::sync::model::{
    DeleteStatus, FlagChangeSet, FolderState, MessageMapping, PushStatus, ReadStatus,
};

pub use messages::PendingPush;

/// One writer (the sync task) plus readers from CLI commands.
const POOL_SIZE: u32 = 4;

pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn open(path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(options)
            .await?;

        schema::init_schema(&pool).await?;
        debug!("Opened store at {}", path.display());

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        schema::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    //
    // Folder snapshots
    //

    /// All committed folder snapshots keyed by folder name.
    pub async fn folder_states(&self) -> Result<HashMap<String, FolderState>> {
        let rows = sqlx::query(
            "SELECT name, uid_validity, highest_modseq, uid_next, message_count FROM folder_state",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(row_to_folder_state)
            .map(|state| (state.name.clone(), state))
            .collect())
    }

    pub async fn folder_state(&self, name: &str) -> Result<Option<FolderState>> {
        let row = sqlx::query(
            "SELECT name, uid_validity, highest_modseq, uid_next, message_count FROM folder_state WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_folder_state))
    }

    /// Commit a folder snapshot, replacing the previous one.
    pub async fn put_folder_state(&self, state: &FolderState) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO folder_state (name, uid_validity, highest_modseq, uid_next, message_count) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&state.name)
        .bind(state.uid_validity.map(i64::from))
        .bind(state.highest_modseq.map(|v| v as i64))
        .bind(state.uid_next.map(i64::from))
        .bind(state.message_count.map(i64::from))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Invalidate every UID of `folder` after a UIDVALIDITY change.
    ///
    /// Mappings survive without their UID so the local messages can be
    /// relinked by correlator instead of duplicated.
    pub async fn purge_folder_mappings(&self, folder: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let unlinked = messages::unlink_folder(&mut tx, folder).await?;
        sqlx::query("DELETE FROM folder_state WHERE name = ?")
            .bind(folder)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("Purged {} UID mappings of {}", unlinked, folder);
        Ok(unlinked)
    }

    /// Drop everything: messages, mappings and folder snapshots.
    pub async fn wipe(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["mappings", "mms_parts", "messages", "folder_state"] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        info!("Local store wiped");
        Ok(())
    }

    //
    // Messages and mappings (delegated to messages module)
    //

    /// UIDs of `folder` already linked to a local message.
    pub async fn known_uids(&self, folder: &str) -> Result<HashSet<u32>> {
        Ok(messages::known_uids(&self.pool, folder).await?)
    }

    /// Create a local message for a newly fetched remote one.
    pub async fn insert_remote_message(
        &self,
        folder: &str,
        uid: u32,
        message: &CmsMessage,
        flags: ServerFlags,
    ) -> Result<String> {
        Ok(messages::insert_remote(&self.pool, folder, uid, message, flags).await?)
    }

    /// Store a locally composed message and request its push.
    pub async fn request_send(&self, folder: &str, message: &CmsMessage) -> Result<String> {
        Ok(messages::insert_local(&self.pool, folder, message).await?)
    }

    pub async fn message(&self, base_id: &str) -> Result<Option<CmsMessage>> {
        Ok(messages::load_message(&self.pool, base_id).await?)
    }

    pub async fn mapping(&self, base_id: &str) -> Result<Option<MessageMapping>> {
        Ok(messages::mapping(&self.pool, base_id).await?)
    }

    pub async fn message_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?)
    }

    /// A message of `folder` that reached the server but has no UID, sent
    /// in the same direction between the same numbers, whose correlator or
    /// IMDN id matches. Queued messages never match.
    pub async fn find_unlinked(
        &self,
        folder: &str,
        envelope: &Envelope,
        correlator: Option<&str>,
    ) -> Result<Option<String>> {
        Ok(messages::find_unlinked(&self.pool, folder, envelope, correlator).await?)
    }

    /// Attach a server UID to an existing local message.
    pub async fn link_uid(&self, base_id: &str, uid: u32) -> Result<()> {
        Ok(messages::link_uid(&self.pool, base_id, uid).await?)
    }

    /// Apply a remote flag change to local read/delete state.
    pub async fn apply_remote_flags(&self, change: &FlagChangeSet) -> Result<u64> {
        Ok(messages::apply_remote_flags(&self.pool, change).await?)
    }

    /// Local read/delete actions of `folder` not yet acknowledged remotely.
    pub async fn pending_flag_changes(&self, folder: &str) -> Result<Vec<FlagChangeSet>> {
        Ok(messages::pending_flag_changes(&self.pool, folder).await?)
    }

    pub async fn ack_flag_change(&self, change: &FlagChangeSet) -> Result<()> {
        Ok(messages::ack_flag_change(&self.pool, change).await?)
    }

    /// Push-requested messages of the given kinds, oldest first. With
    /// `with_unacknowledged`, messages whose APPEND got no answer are
    /// included; only do that after their folder was scanned for them.
    pub async fn push_requested(
        &self,
        kinds: &[MessageKind],
        with_unacknowledged: bool,
    ) -> Result<Vec<PendingPush>> {
        Ok(messages::push_requested(&self.pool, kinds, with_unacknowledged).await?)
    }

    /// Mark a message as sent to the server, before its APPEND is answered.
    pub async fn begin_push(&self, base_id: &str) -> Result<()> {
        Ok(messages::set_push_status(&self.pool, base_id, PushStatus::Appending).await?)
    }

    /// Put a message back in the queue after the server refused its APPEND.
    pub async fn abort_push(&self, base_id: &str) -> Result<()> {
        Ok(messages::set_push_status(&self.pool, base_id, PushStatus::Requested).await?)
    }

    /// Mark a message pushed; `uid` is only known when the server reported it.
    pub async fn record_push(&self, base_id: &str, uid: Option<u32>) -> Result<()> {
        Ok(messages::record_push(&self.pool, base_id, uid).await?)
    }

    /// Local "mark read". Returns false when there was nothing to change.
    pub async fn mark_read(&self, base_id: &str) -> Result<bool> {
        Ok(messages::request_read(&self.pool, base_id).await?)
    }

    /// Local "delete". Returns false when there was nothing to change.
    pub async fn mark_deleted(&self, base_id: &str) -> Result<bool> {
        Ok(messages::request_delete(&self.pool, base_id).await?)
    }
}

fn row_to_folder_state(row: SqliteRow) -> FolderState {
    FolderState {
        name: row.get("name"),
        uid_validity: row.get::<Option<i64>, _>("uid_validity").map(|v| v as u32),
        highest_modseq: row.get::<Option<i64>, _>("highest_modseq").map(|v| v as u64),
        uid_next: row.get::<Option<i64>, _>("uid_next").map(|v| v as u32),
        message_count: row.get::<Option<i64>, _>("message_count").map(|v| v as u32),
    }
}

//
// Integer mapping of enumerations
//

fn invalid(column: &str, value: i64) -> sqlx::Error {
    sqlx::Error::Decode(format!("invalid {} value {}", column, value).into())
}

fn kind_to_db(kind: MessageKind) -> i64 {
    match kind {
        MessageKind::Sms => 0,
        MessageKind::Mms => 1,
        MessageKind::Chat => 2,
    }
}

fn kind_from_db(value: i64) -> Result<MessageKind, sqlx::Error> {
    match value {
        0 => Ok(MessageKind::Sms),
        1 => Ok(MessageKind::Mms),
        2 => Ok(MessageKind::Chat),
        other => Err(invalid("kind", other)),
    }
}

fn direction_to_db(direction: Direction) -> i64 {
    match direction {
        Direction::Sent => 0,
        Direction::Received => 1,
    }
}

fn direction_from_db(value: i64) -> Result<Direction, sqlx::Error> {
    match value {
        0 => Ok(Direction::Sent),
        1 => Ok(Direction::Received),
        other => Err(invalid("direction", other)),
    }
}

fn push_to_db(status: PushStatus) -> i64 {
    match status {
        PushStatus::Requested => 0,
        PushStatus::Pushed => 1,
        PushStatus::Appending => 2,
    }
}

fn push_from_db(value: i64) -> Result<PushStatus, sqlx::Error> {
    match value {
        0 => Ok(PushStatus::Requested),
        1 => Ok(PushStatus::Pushed),
        2 => Ok(PushStatus::Appending),
        other => Err(invalid("push_status", other)),
    }
}

fn read_to_db(status: ReadStatus) -> i64 {
    match status {
        ReadStatus::Unread => 0,
        ReadStatus::ReadRequested => 1,
        ReadStatus::Read => 2,
    }
}

fn read_from_db(value: i64) -> Result<ReadStatus, sqlx::Error> {
    match value {
        0 => Ok(ReadStatus::Unread),
        1 => Ok(ReadStatus::ReadRequested),
        2 => Ok(ReadStatus::Read),
        other => Err(invalid("read_status", other)),
    }
}

fn delete_to_db(status: DeleteStatus) -> i64 {
    match status {
        DeleteStatus::NotDeleted => 0,
        DeleteStatus::DeleteRequested => 1,
        DeleteStatus::Deleted => 2,
    }
}

fn delete_from_db(value: i64) -> Result<DeleteStatus, sqlx::Error> {
    match value {
        0 => Ok(DeleteStatus::NotDeleted),
        1 => Ok(DeleteStatus::DeleteRequested),
        2 => Ok(DeleteStatus::Deleted),
        other => Err(invalid("delete_status", other)),
    }
}
