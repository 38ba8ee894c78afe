//! Database schema initialization.

use sqlx::SqlitePool;

pub(super) const SCHEMA_VERSION: i64 = 1;

/// Create all tables and indexes. Safe to run on every open.
pub(super) async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        -- Last committed counters per remote folder
        CREATE TABLE IF NOT EXISTS folder_state (
            name TEXT PRIMARY KEY,
            uid_validity INTEGER,
            highest_modseq INTEGER,
            uid_next INTEGER,
            message_count INTEGER
        );

        -- Local messages, one row per baseId
        CREATE TABLE IF NOT EXISTS messages (
            base_id TEXT PRIMARY KEY,
            kind INTEGER NOT NULL,
            from_addr TEXT NOT NULL,
            to_addr TEXT NOT NULL,
            contact TEXT NOT NULL,
            direction INTEGER NOT NULL,
            date INTEGER NOT NULL,
            conversation_id TEXT,
            contribution_id TEXT,
            imdn_message_id TEXT,
            subject TEXT,
            text TEXT,
            correlator TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_contact ON messages(contact, date);
        CREATE INDEX IF NOT EXISTS idx_messages_correlator ON messages(correlator);
        CREATE INDEX IF NOT EXISTS idx_messages_imdn ON messages(imdn_message_id);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        -- MMS parts in wire form
        CREATE TABLE IF NOT EXISTS mms_parts (
            base_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            content_type TEXT NOT NULL,
            content_id TEXT,
            transfer_encoding TEXT,
            content TEXT NOT NULL,
            PRIMARY KEY (base_id, position)
        );

        -- (folder, UID) <-> baseId
        CREATE TABLE IF NOT EXISTS mappings (
            base_id TEXT PRIMARY KEY,
            folder TEXT NOT NULL,
            uid INTEGER,
            kind INTEGER NOT NULL,
            push_status INTEGER NOT NULL,
            read_status INTEGER NOT NULL,
            delete_status INTEGER NOT NULL,
            UNIQUE (folder, uid)
        );

        CREATE INDEX IF NOT EXISTS idx_mappings_folder ON mappings(folder);
        CREATE INDEX IF NOT EXISTS idx_mappings_push ON mappings(push_status);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::LocalStore;

    #[tokio::test]
    async fn test_schema_creation() {
        let store = LocalStore::open_in_memory().await.unwrap();

        for table in ["folder_state", "messages", "mms_parts", "mappings"] {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(store.pool())
                .await
                .unwrap();
            assert_eq!(count, 0, "{} should start empty", table);
        }
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let store = LocalStore::open_in_memory().await.unwrap();
        super::init_schema(store.pool()).await.unwrap();

        let version: i64 = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(version, super::SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_uid_unique_within_folder() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let insert = "INSERT INTO mappings (base_id, folder, uid, kind, push_status, read_status, delete_status) VALUES (?, 'f', 1, 0, 1, 0, 0)";

        sqlx::query(insert).bind("a").execute(store.pool()).await.unwrap();
        assert!(sqlx::query(insert).bind("b").execute(store.pool()).await.is_err());
    }
}
