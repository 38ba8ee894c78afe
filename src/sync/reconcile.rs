use std::collections::BTreeSet;
use std::fmt;

use crate::clock::Clock;
use crate::codec::{self, HEADER_MESSAGE_CORRELATOR, MessageKind};
use crate::config::SyncConfig;
use crate::constants::FLAG_SYNC_BATCH_SIZE;
use crate::error::{Result, SyncError};
use crate::imap::{self, AppendOutcome, FetchedHeader, FolderStatus, ImapConnection, ServerFlags};
use crate::store::{LocalStore, PendingPush};

use super::model::{
    Flag, FlagChangeSet, FlagOp, FolderState, Resync, SyncMode, SyncScope, needs_resync,
};

/// Counters of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub folders_checked: usize,
    pub folders_synced: usize,
    /// Folders whose UID mappings were dropped after a UIDVALIDITY change.
    pub folders_purged: usize,
    pub fetched: usize,
    pub relinked: usize,
    pub flags_applied: u64,
    pub flags_pushed: usize,
    pub pushed: usize,
    /// Messages left alone because of a codec error.
    pub skipped: usize,
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} folders synced ({} purged), {} fetched, {} relinked, {} flags in, {} flags out, {} pushed, {} skipped",
            self.folders_synced,
            self.folders_checked,
            self.folders_purged,
            self.fetched,
            self.relinked,
            self.flags_applied,
            self.flags_pushed,
            self.pushed,
            self.skipped
        )
    }
}

/// Runs one pass over a logged-in connection.
///
/// Folders are committed one by one: an error aborts the rest of the pass
/// but leaves already committed folders in place.
pub struct Reconciler<'a> {
    store: &'a LocalStore,
    settings: &'a SyncConfig,
    separator: &'a str,
    clock: &'a dyn Clock,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        store: &'a LocalStore,
        settings: &'a SyncConfig,
        separator: &'a str,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            store,
            settings,
            separator,
            clock,
        }
    }

    fn in_scope(&self, scope: &SyncScope, folder: &str) -> bool {
        scope.includes(folder, &self.settings.root_folder, self.separator)
    }

    pub async fn run(&self, conn: &mut ImapConnection, scope: &SyncScope) -> Result<PassReport> {
        let mut report = PassReport::default();
        let pattern = format!("{}{}*", self.settings.root_folder, self.separator);

        let remote = conn.list_status(&pattern).await?;
        let mut local = self.store.folder_states().await?;
        tracing::debug!(
            "Pass ({}): {} remote folders, {} local snapshots",
            scope,
            remote.len(),
            local.len()
        );

        for status in remote.iter().filter(|s| self.in_scope(scope, &s.name)) {
            report.folders_checked += 1;
            let snapshot = local.remove(&status.name);
            self.sync_folder(conn, status, snapshot, &mut report).await?;
            self.push_flags(conn, &status.name, &mut report).await?;
        }

        self.push_messages(conn, scope, true, &mut report).await?;

        tracing::info!("Pass ({}) finished: {}", scope, report);
        Ok(report)
    }

    /// Push local flag changes and queued messages without resyncing folders.
    pub async fn push_pending(&self, conn: &mut ImapConnection) -> Result<PassReport> {
        let mut report = PassReport::default();
        let mut folders: Vec<String> = self.store.folder_states().await?.into_keys().collect();
        folders.sort();

        for folder in &folders {
            self.push_flags(conn, folder, &mut report).await?;
        }
        self.push_messages(conn, &SyncScope::All, false, &mut report).await?;

        tracing::info!("Push finished: {}", report);
        Ok(report)
    }

    async fn sync_folder(
        &self,
        conn: &mut ImapConnection,
        status: &FolderStatus,
        local: Option<FolderState>,
        report: &mut PassReport,
    ) -> Result<()> {
        let folder = status.name.as_str();
        let decision = needs_resync(local.as_ref(), status);
        if !decision.is_needed() {
            tracing::debug!("Folder '{}' unchanged", folder);
            return Ok(());
        }

        let local = if decision == Resync::YesPurge {
            let unlinked = self.store.purge_folder_mappings(folder).await?;
            report.folders_purged += 1;
            tracing::info!(
                "UIDVALIDITY of '{}' changed, unlinked {} messages",
                folder,
                unlinked
            );
            None
        } else {
            local
        };

        tracing::info!("Syncing folder '{}'", folder);
        let selected = conn.select_condstore(folder).await?;
        let uid_next = selected.uid_next.or(status.uid_next);
        let last_uid = uid_next.map(|n| n.saturating_sub(1));

        // Flags first, so a deletion is seen before the message could look new.
        if let Some(local) = &local
            && local.has_messages()
            && let Some(modseq) = local.highest_modseq
        {
            let updates = conn.fetch_flags_changed_since(last_uid, modseq).await?;
            tracing::debug!(
                "{} flag updates in '{}' since MODSEQ {}",
                updates.len(),
                folder,
                modseq
            );
            report.flags_applied += self
                .apply_remote_flags(folder, updates.iter().map(|u| (u.uid, u.flags)), true)
                .await?;
        }

        if last_uid != Some(0) {
            let headers = conn.fetch_headers(1, last_uid).await?;
            let known = self.store.known_uids(folder).await?;
            for header in headers.into_iter().filter(|h| !known.contains(&h.uid)) {
                self.take_new(conn, folder, header, report).await?;
            }
        }

        let state = FolderState {
            name: folder.to_string(),
            uid_validity: selected.uid_validity.or(status.uid_validity),
            highest_modseq: selected.highest_modseq.or(status.highest_modseq),
            uid_next,
            message_count: selected.exists.or(status.messages),
        };
        if let Some(previous) = &local
            && state.modseq_went_back(previous)
        {
            // Committed as reported, so CHANGEDSINCE does not skip later changes.
            tracing::warn!(
                "HIGHESTMODSEQ of '{}' went back from {:?} to {:?}",
                folder,
                previous.highest_modseq,
                state.highest_modseq
            );
        }
        self.store.put_folder_state(&state).await?;
        report.folders_synced += 1;

        tracing::info!(
            "Committed '{}' at UIDVALIDITY {:?} MODSEQ {:?}",
            folder,
            state.uid_validity,
            state.highest_modseq
        );
        Ok(())
    }

    /// Convert server flags into local read/delete transitions. Removals are
    /// only applied for messages that were already linked before this pass.
    async fn apply_remote_flags(
        &self,
        folder: &str,
        updates: impl IntoIterator<Item = (u32, ServerFlags)>,
        with_removals: bool,
    ) -> Result<u64> {
        let mut seen = FlagChangeSet::new(folder, Flag::Seen, FlagOp::Add);
        let mut unseen = FlagChangeSet::new(folder, Flag::Seen, FlagOp::Remove);
        let mut deleted = FlagChangeSet::new(folder, Flag::Deleted, FlagOp::Add);

        for (uid, flags) in updates {
            if flags.contains(ServerFlags::SEEN) {
                seen.uids.insert(uid);
            } else if with_removals {
                unseen.uids.insert(uid);
            }
            if flags.contains(ServerFlags::DELETED) {
                deleted.uids.insert(uid);
            }
        }

        let mut applied = 0;
        for change in [seen, unseen, deleted] {
            if !change.is_empty() {
                applied += self.store.apply_remote_flags(&change).await?;
            }
        }
        Ok(applied)
    }

    /// Handle a UID with no local mapping: relink a local message waiting
    /// for its UID, or download and store the message.
    async fn take_new(
        &self,
        conn: &mut ImapConnection,
        folder: &str,
        header: FetchedHeader,
        report: &mut PassReport,
    ) -> Result<()> {
        let uid = header.uid;
        let headers = match codec::parse_header_block(&header.header) {
            Ok(headers) => headers,
            Err(e) => {
                tracing::warn!("Skipping UID {} in '{}': bad header: {}", uid, folder, e);
                report.skipped += 1;
                return Ok(());
            }
        };
        let kind = match MessageKind::detect(&headers) {
            Ok(kind) => kind,
            Err(e) => {
                tracing::warn!("Skipping UID {} in '{}': {}", uid, folder, e);
                report.skipped += 1;
                return Ok(());
            }
        };
        if self.settings.mode_for(kind) != SyncMode::Imap {
            tracing::debug!("UID {} in '{}' is {:?}, not synced over IMAP", uid, folder, kind);
            return Ok(());
        }

        let correlator = headers.get(HEADER_MESSAGE_CORRELATOR);
        let unlinked = match codec::decode_envelope(&headers) {
            Ok(envelope) => self.store.find_unlinked(folder, &envelope, correlator).await?,
            Err(e) => {
                tracing::debug!("UID {} in '{}' cannot be relinked: {}", uid, folder, e);
                None
            }
        };
        if let Some(base_id) = unlinked {
            self.store.link_uid(&base_id, uid).await?;
            report.flags_applied += self
                .apply_remote_flags(folder, [(uid, header.flags)], false)
                .await?;
            report.relinked += 1;
            tracing::debug!("Linked UID {} in '{}' to {}", uid, folder, base_id);
            return Ok(());
        }

        let Some(fetched) = conn.fetch_message(uid).await? else {
            tracing::warn!("UID {} vanished from '{}' before its body was fetched", uid, folder);
            return Ok(());
        };

        match codec::decode(&fetched.body) {
            Ok(message) => {
                let base_id = self
                    .store
                    .insert_remote_message(folder, uid, &message, fetched.flags)
                    .await?;
                report.fetched += 1;
                tracing::debug!("Stored UID {} of '{}' as {}", uid, folder, base_id);
            }
            Err(e) => {
                tracing::warn!("Skipping UID {} in '{}': {}", uid, folder, e);
                report.skipped += 1;
            }
        }
        Ok(())
    }

    async fn push_flags(
        &self,
        conn: &mut ImapConnection,
        folder: &str,
        report: &mut PassReport,
    ) -> Result<()> {
        let changes = self.store.pending_flag_changes(folder).await?;
        if changes.is_empty() {
            return Ok(());
        }

        if conn.selected() != Some(folder) {
            conn.select_condstore(folder).await?;
        }

        for change in changes {
            let uids: Vec<u32> = change.uids.iter().copied().collect();
            for chunk in uids.chunks(FLAG_SYNC_BATCH_SIZE) {
                conn.store_flags(chunk, change.op.into(), change.flag.server_flags())
                    .await?;
            }
            self.store.ack_flag_change(&change).await?;
            report.flags_pushed += uids.len();
            tracing::debug!(
                "Pushed {:?} {:?} for {} messages of '{}'",
                change.op,
                change.flag,
                uids.len(),
                folder
            );
        }
        Ok(())
    }

    /// APPEND queued messages. Messages whose earlier APPEND got no answer
    /// are only retried with `retry_unacknowledged`, after a folder scan had
    /// the chance to relink them.
    async fn push_messages(
        &self,
        conn: &mut ImapConnection,
        scope: &SyncScope,
        retry_unacknowledged: bool,
        report: &mut PassReport,
    ) -> Result<()> {
        let kinds = self.settings.imap_kinds();
        if kinds.is_empty() {
            return Ok(());
        }

        for pending in self
            .store
            .push_requested(&kinds, retry_unacknowledged)
            .await?
        {
            if !self.in_scope(scope, &pending.folder) {
                continue;
            }
            if let Err(e) = codec::ensure_encodable(&pending.message) {
                tracing::warn!("Keeping {} queued, cannot encode: {}", pending.base_id, e);
                report.skipped += 1;
                continue;
            }

            let payload = codec::encode(&pending.message, &codec::new_boundary(self.clock));
            let flags = if pending.seen {
                ServerFlags::SEEN
            } else {
                ServerFlags::empty()
            };

            self.store.begin_push(&pending.base_id).await?;
            let outcome = match self
                .append(conn, &pending.folder, flags, payload.as_bytes())
                .await
            {
                Ok(outcome) => outcome,
                Err(SyncError::Protocol(text)) if imap::refusal(&text).is_some() => {
                    tracing::warn!(
                        "Keeping {} queued, '{}' refused it: {}",
                        pending.base_id,
                        pending.folder,
                        text
                    );
                    self.store.abort_push(&pending.base_id).await?;
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let uid = match outcome.uid {
                Some(uid) => Some(uid),
                None => self.find_appended(conn, &pending).await?,
            };
            self.store.record_push(&pending.base_id, uid).await?;
            report.pushed += 1;
            tracing::debug!(
                "Pushed {} to '{}' as UID {:?}",
                pending.base_id,
                pending.folder,
                uid
            );
        }
        Ok(())
    }

    /// APPEND, creating the folder once when the server asks for it.
    async fn append(
        &self,
        conn: &mut ImapConnection,
        folder: &str,
        flags: ServerFlags,
        payload: &[u8],
    ) -> Result<AppendOutcome> {
        match conn.append(folder, flags, payload).await {
            Err(SyncError::Protocol(text))
                if imap::refusal_code(&text).is_some_and(|c| c.eq_ignore_ascii_case("TRYCREATE")) =>
            {
                tracing::info!("Creating folder '{}'", folder);
                conn.create(folder).await?;
                conn.append(folder, flags, payload).await
            }
            other => other,
        }
    }

    /// Without UIDPLUS the new UID is found by searching for the correlator.
    /// The highest match not linked to another message wins.
    async fn find_appended(
        &self,
        conn: &mut ImapConnection,
        pending: &PendingPush,
    ) -> Result<Option<u32>> {
        conn.select_condstore(&pending.folder).await?;
        let correlator = pending.message.correlator();
        let found: BTreeSet<u32> = conn
            .search_header(HEADER_MESSAGE_CORRELATOR, &correlator)
            .await?
            .into_iter()
            .collect();
        let known = self.store.known_uids(&pending.folder).await?;
        Ok(found.into_iter().rev().find(|uid| !known.contains(uid)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::FixedClock;
    use crate::codec::fixtures::{envelope, sms};
    use crate::codec::{CmsMessage, Direction, TextMessage};
    use crate::imap::fake_server::FakeServer;
    use crate::imap::{CAP_CONDSTORE, CAP_UIDPLUS};
    use crate::sync::model::{PushStatus, ReadStatus};

    const FOLDER: &str = "default/+15550001111";
    const OUTGOING: &str = "default/+15550002222";

    fn received(text: &str, imdn: &str) -> Vec<u8> {
        let mut envelope = envelope(Direction::Received);
        envelope.imdn_message_id = Some(imdn.to_string());
        let message = CmsMessage::Sms(TextMessage {
            envelope,
            text: text.to_string(),
        });
        codec::encode(&message, "unused").into_bytes()
    }

    /// Folder with UIDVALIDITY 100, two messages and HIGHESTMODSEQ 5.
    fn seeded_server() -> FakeServer {
        let server = FakeServer::new();
        server.add_folder(FOLDER, 100);
        server.add_message(FOLDER, &received("hello", "imdn-a"), ServerFlags::empty());
        server.add_message(FOLDER, &received("again", "imdn-b"), ServerFlags::SEEN);
        server.set_flags(FOLDER, 1, ServerFlags::empty());
        server.set_flags(FOLDER, 2, ServerFlags::SEEN);
        server
    }

    async fn connect(server: &FakeServer) -> ImapConnection {
        let mut conn = ImapConnection::open(server.stream(), Duration::from_secs(5))
            .await
            .unwrap();
        conn.capability().await.unwrap();
        conn.login("alice", FakeServer::PASSWORD).await.unwrap();
        server.clear_commands();
        conn
    }

    async fn pass(
        store: &LocalStore,
        settings: &SyncConfig,
        conn: &mut ImapConnection,
    ) -> Result<PassReport> {
        let clock = FixedClock::at(1_700_000_000);
        Reconciler::new(store, settings, "/", &clock)
            .run(conn, &SyncScope::All)
            .await
    }

    async fn base_id_of(store: &LocalStore, folder: &str, uid: u32) -> String {
        sqlx::query_scalar("SELECT base_id FROM mappings WHERE folder = ? AND uid = ?")
            .bind(folder)
            .bind(uid as i64)
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_pass_downloads_new_folder() {
        let server = seeded_server();
        let store = LocalStore::open_in_memory().await.unwrap();
        let settings = SyncConfig::default();
        let mut conn = connect(&server).await;

        let report = pass(&store, &settings, &mut conn).await.unwrap();

        let commands = server.commands();
        assert!(commands[0].starts_with("LIST \"\" \"default/*\" RETURN (STATUS"));
        assert_eq!(commands[1], format!("SELECT \"{}\" (CONDSTORE)", FOLDER));
        assert_eq!(commands[2], "UID FETCH 1:2 (FLAGS MODSEQ BODY.PEEK[HEADER])");
        assert!(commands[3].starts_with("UID FETCH 1 (RFC822.SIZE"));
        assert!(commands[4].starts_with("UID FETCH 2 (RFC822.SIZE"));
        assert!(!commands.iter().any(|c| c.contains("CHANGEDSINCE")));

        assert_eq!(report.fetched, 2);
        assert_eq!(report.folders_synced, 1);
        assert_eq!(store.message_count().await.unwrap(), 2);

        let snapshot = store.folder_state(FOLDER).await.unwrap().unwrap();
        assert_eq!(snapshot.uid_validity, Some(100));
        assert_eq!(snapshot.highest_modseq, Some(5));
        assert_eq!(snapshot.uid_next, Some(3));

        let second = base_id_of(&store, FOLDER, 2).await;
        let mapping = store.mapping(&second).await.unwrap().unwrap();
        assert_eq!(mapping.read_status, ReadStatus::Read);
        assert_eq!(mapping.push_status, PushStatus::Pushed);
    }

    #[tokio::test]
    async fn test_unchanged_server_only_lists() {
        let server = seeded_server();
        let store = LocalStore::open_in_memory().await.unwrap();
        let settings = SyncConfig::default();
        let mut conn = connect(&server).await;

        pass(&store, &settings, &mut conn).await.unwrap();
        server.clear_commands();
        let report = pass(&store, &settings, &mut conn).await.unwrap();

        assert_eq!(server.commands().len(), 1);
        assert_eq!(report.folders_checked, 1);
        assert_eq!(report.folders_synced, 0);
        assert_eq!(store.message_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_remote_flags_applied_without_refetch() {
        let server = seeded_server();
        let store = LocalStore::open_in_memory().await.unwrap();
        let settings = SyncConfig::default();
        let mut conn = connect(&server).await;

        pass(&store, &settings, &mut conn).await.unwrap();
        server.set_flags(FOLDER, 1, ServerFlags::SEEN);
        server.set_flags(FOLDER, 2, ServerFlags::SEEN | ServerFlags::DELETED);
        server.clear_commands();

        let report = pass(&store, &settings, &mut conn).await.unwrap();

        let commands = server.commands();
        assert!(commands.contains(&"UID FETCH 1:2 (UID FLAGS) (CHANGEDSINCE 5)".to_string()));
        assert!(!commands.iter().any(|c| c.contains("BODY.PEEK[]")));
        assert_eq!(report.fetched, 0);

        let first = store.mapping(&base_id_of(&store, FOLDER, 1).await).await.unwrap().unwrap();
        assert_eq!(first.read_status, ReadStatus::Read);
        let second = store.mapping(&base_id_of(&store, FOLDER, 2).await).await.unwrap().unwrap();
        assert_eq!(second.delete_status, crate::sync::model::DeleteStatus::Deleted);

        let snapshot = store.folder_state(FOLDER).await.unwrap().unwrap();
        assert_eq!(snapshot.highest_modseq, Some(7));
    }

    #[tokio::test]
    async fn test_local_read_pushed_once() {
        let server = seeded_server();
        let store = LocalStore::open_in_memory().await.unwrap();
        let settings = SyncConfig::default();
        let mut conn = connect(&server).await;

        pass(&store, &settings, &mut conn).await.unwrap();
        let base_id = base_id_of(&store, FOLDER, 1).await;
        assert!(store.mark_read(&base_id).await.unwrap());
        server.clear_commands();

        let report = pass(&store, &settings, &mut conn).await.unwrap();
        assert_eq!(report.flags_pushed, 1);
        assert!(server.commands().contains(&"UID STORE 1 +FLAGS (\\Seen)".to_string()));
        let remote = server.folder(FOLDER).unwrap();
        assert!(remote.messages[&1].flags.contains(ServerFlags::SEEN));

        server.clear_commands();
        let report = pass(&store, &settings, &mut conn).await.unwrap();
        assert_eq!(report.flags_pushed, 0);
        assert!(!server.commands().iter().any(|c| c.starts_with("UID STORE")));
        let mapping = store.mapping(&base_id).await.unwrap().unwrap();
        assert_eq!(mapping.read_status, ReadStatus::Read);
    }

    #[tokio::test]
    async fn test_push_pending_skips_folder_scan() {
        let server = seeded_server();
        let store = LocalStore::open_in_memory().await.unwrap();
        let settings = SyncConfig::default();
        let mut conn = connect(&server).await;

        pass(&store, &settings, &mut conn).await.unwrap();
        store.mark_deleted(&base_id_of(&store, FOLDER, 2).await).await.unwrap();
        store.request_send(OUTGOING, &sms("outgoing")).await.unwrap();
        server.clear_commands();

        let clock = FixedClock::at(0);
        let report = Reconciler::new(&store, &settings, "/", &clock)
            .push_pending(&mut conn)
            .await
            .unwrap();

        assert_eq!(report.flags_pushed, 1);
        assert_eq!(report.pushed, 1);
        let commands = server.commands();
        assert!(!commands.iter().any(|c| c.starts_with("LIST")));
        assert!(commands.contains(&"UID STORE 2 +FLAGS (\\Deleted)".to_string()));
    }

    #[tokio::test]
    async fn test_uidvalidity_change_relinks_instead_of_duplicating() {
        let server = seeded_server();
        let store = LocalStore::open_in_memory().await.unwrap();
        let settings = SyncConfig::default();
        let mut conn = connect(&server).await;

        pass(&store, &settings, &mut conn).await.unwrap();
        let before = base_id_of(&store, FOLDER, 1).await;

        server.reset_folder(FOLDER, 200);
        server.add_message(FOLDER, &received("again", "imdn-b"), ServerFlags::SEEN);
        server.add_message(FOLDER, &received("hello", "imdn-a"), ServerFlags::empty());
        server.clear_commands();

        let report = pass(&store, &settings, &mut conn).await.unwrap();

        let commands = server.commands();
        assert!(!commands.iter().any(|c| c.contains("CHANGEDSINCE")));
        assert!(!commands.iter().any(|c| c.contains("BODY.PEEK[]")));
        assert_eq!(report.relinked, 2);
        assert_eq!(store.message_count().await.unwrap(), 2);

        // "hello" now lives under UID 2.
        assert_eq!(base_id_of(&store, FOLDER, 2).await, before);
        let snapshot = store.folder_state(FOLDER).await.unwrap().unwrap();
        assert_eq!(snapshot.uid_validity, Some(200));
    }

    #[tokio::test]
    async fn test_each_uidvalidity_change_purges_once() {
        let server = seeded_server();
        let store = LocalStore::open_in_memory().await.unwrap();
        let settings = SyncConfig::default();
        let mut conn = connect(&server).await;

        let report = pass(&store, &settings, &mut conn).await.unwrap();
        assert_eq!(report.folders_purged, 0);
        let hello = base_id_of(&store, FOLDER, 1).await;
        let again = base_id_of(&store, FOLDER, 2).await;

        server.reset_folder(FOLDER, 200);
        server.add_message(FOLDER, &received("again", "imdn-b"), ServerFlags::SEEN);
        server.add_message(FOLDER, &received("hello", "imdn-a"), ServerFlags::empty());
        let report = pass(&store, &settings, &mut conn).await.unwrap();
        assert_eq!(report.folders_purged, 1);
        assert_eq!(report.relinked, 2);
        assert_eq!(store.mapping(&hello).await.unwrap().unwrap().uid, Some(2));
        assert_eq!(store.mapping(&again).await.unwrap().unwrap().uid, Some(1));

        // Only "hello" survives the second reset.
        server.reset_folder(FOLDER, 300);
        server.add_message(FOLDER, &received("hello", "imdn-a"), ServerFlags::empty());
        let report = pass(&store, &settings, &mut conn).await.unwrap();
        assert_eq!(report.folders_purged, 1);
        assert_eq!(report.relinked, 1);
        assert_eq!(store.mapping(&hello).await.unwrap().unwrap().uid, Some(1));
        assert_eq!(store.mapping(&again).await.unwrap().unwrap().uid, None);
        let known = store.known_uids(FOLDER).await.unwrap();
        assert_eq!(known.len(), 1);
        assert!(known.contains(&1));

        server.clear_commands();
        let report = pass(&store, &settings, &mut conn).await.unwrap();
        assert_eq!(report.folders_purged, 0);
        assert_eq!(report.folders_synced, 0);
        assert!(!server.commands().iter().any(|c| c.starts_with("SELECT")));
        assert_eq!(store.mapping(&hello).await.unwrap().unwrap().uid, Some(1));
        let snapshot = store.folder_state(FOLDER).await.unwrap().unwrap();
        assert_eq!(snapshot.uid_validity, Some(300));
        assert_eq!(store.message_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_queued_message_is_not_taken_for_incoming_twin() {
        let server = FakeServer::new();
        server.add_folder(OUTGOING, 100);
        let mut incoming = envelope(Direction::Received);
        std::mem::swap(&mut incoming.from, &mut incoming.to);
        incoming.imdn_message_id = Some("imdn-in".to_string());
        let twin = CmsMessage::Sms(TextMessage {
            envelope: incoming,
            text: "ok".to_string(),
        });
        server.add_message(OUTGOING, codec::encode(&twin, "unused").as_bytes(), ServerFlags::empty());
        let store = LocalStore::open_in_memory().await.unwrap();
        let settings = SyncConfig::default();
        let mut conn = connect(&server).await;

        let queued = store.request_send(OUTGOING, &sms("ok")).await.unwrap();
        let report = pass(&store, &settings, &mut conn).await.unwrap();

        assert_eq!(report.relinked, 0);
        assert_eq!(report.fetched, 1);
        assert_eq!(report.pushed, 1);
        assert!(server.commands().iter().any(|c| c.starts_with("APPEND")));
        assert_eq!(store.message_count().await.unwrap(), 2);
        let mapping = store.mapping(&queued).await.unwrap().unwrap();
        assert_eq!(mapping.uid, Some(2));
        assert_eq!(mapping.push_status, PushStatus::Pushed);
        assert_eq!(store.message(&base_id_of(&store, OUTGOING, 1).await).await.unwrap(), Some(twin));
    }

    #[tokio::test]
    async fn test_unanswered_append_is_relinked_not_resent() {
        let server = FakeServer::new();
        let store = LocalStore::open_in_memory().await.unwrap();
        let settings = SyncConfig::default();
        let mut conn = connect(&server).await;

        let message = sms("outgoing");
        let base_id = store.request_send(OUTGOING, &message).await.unwrap();
        store.begin_push(&base_id).await.unwrap();
        // The APPEND landed, its completion was lost.
        server.add_folder(OUTGOING, 100);
        server.add_message(OUTGOING, codec::encode(&message, "b1").as_bytes(), ServerFlags::SEEN);

        let clock = FixedClock::at(0);
        let report = Reconciler::new(&store, &settings, "/", &clock)
            .push_pending(&mut conn)
            .await
            .unwrap();
        assert_eq!(report.pushed, 0);

        let report = pass(&store, &settings, &mut conn).await.unwrap();
        assert_eq!(report.relinked, 1);
        assert_eq!(report.pushed, 0);
        assert!(!server.commands().iter().any(|c| c.starts_with("APPEND")));
        let mapping = store.mapping(&base_id).await.unwrap().unwrap();
        assert_eq!(mapping.uid, Some(1));
        assert_eq!(mapping.push_status, PushStatus::Pushed);
    }

    #[tokio::test]
    async fn test_trycreate_creates_folder_and_appends_again() {
        let server = FakeServer::new();
        server.require_create();
        let store = LocalStore::open_in_memory().await.unwrap();
        let settings = SyncConfig::default();
        let mut conn = connect(&server).await;

        let base_id = store.request_send(OUTGOING, &sms("outgoing")).await.unwrap();
        let report = pass(&store, &settings, &mut conn).await.unwrap();

        assert_eq!(report.pushed, 1);
        let commands = server.commands();
        assert!(commands.contains(&format!("CREATE \"{}\"", OUTGOING)));
        assert_eq!(commands.iter().filter(|c| c.starts_with("APPEND")).count(), 2);
        assert_eq!(store.mapping(&base_id).await.unwrap().unwrap().uid, Some(1));
        assert_eq!(server.folder(OUTGOING).unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn test_refused_append_stays_queued_without_failing_pass() {
        let server = seeded_server();
        server.add_folder(OUTGOING, 7);
        server.reject_append(OUTGOING);
        let store = LocalStore::open_in_memory().await.unwrap();
        let settings = SyncConfig::default();
        let mut conn = connect(&server).await;

        let refused = store.request_send(OUTGOING, &sms("outgoing")).await.unwrap();
        let accepted = store
            .request_send("default/+15550003333", &sms("elsewhere"))
            .await
            .unwrap();
        let report = pass(&store, &settings, &mut conn).await.unwrap();

        assert_eq!(report.fetched, 2);
        assert_eq!(report.pushed, 1);
        assert_eq!(report.skipped, 1);
        let mapping = store.mapping(&refused).await.unwrap().unwrap();
        assert_eq!(mapping.push_status, PushStatus::Requested);
        assert_eq!(mapping.uid, None);
        assert_eq!(
            store.mapping(&accepted).await.unwrap().unwrap().push_status,
            PushStatus::Pushed
        );

        // Tried again on the next pass.
        server.clear_commands();
        let report = pass(&store, &settings, &mut conn).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(server.commands().iter().any(|c| c.starts_with(&format!("APPEND \"{}\"", OUTGOING))));
    }

    #[tokio::test]
    async fn test_lower_modseq_is_committed_so_later_changes_are_seen() {
        let server = seeded_server();
        let store = LocalStore::open_in_memory().await.unwrap();
        let settings = SyncConfig::default();
        let mut conn = connect(&server).await;

        pass(&store, &settings, &mut conn).await.unwrap();
        server.rewind_modseq(FOLDER, 2);
        let report = pass(&store, &settings, &mut conn).await.unwrap();
        assert_eq!(report.folders_synced, 1);
        assert_eq!(report.folders_purged, 0);
        let snapshot = store.folder_state(FOLDER).await.unwrap().unwrap();
        assert_eq!(snapshot.highest_modseq, Some(2));

        server.set_flags(FOLDER, 1, ServerFlags::SEEN);
        server.clear_commands();
        pass(&store, &settings, &mut conn).await.unwrap();

        assert!(server.commands().iter().any(|c| c.contains("(CHANGEDSINCE 2)")));
        let hello = store.mapping(&base_id_of(&store, FOLDER, 1).await).await.unwrap().unwrap();
        assert_eq!(hello.read_status, ReadStatus::Read);
    }

    #[tokio::test]
    async fn test_push_records_appenduid() {
        let server = FakeServer::new();
        let store = LocalStore::open_in_memory().await.unwrap();
        let settings = SyncConfig::default();
        let mut conn = connect(&server).await;

        let base_id = store.request_send(OUTGOING, &sms("outgoing")).await.unwrap();
        let report = pass(&store, &settings, &mut conn).await.unwrap();

        assert_eq!(report.pushed, 1);
        assert!(server.commands().iter().any(|c| c.starts_with(&format!("APPEND \"{}\" (\\Seen)", OUTGOING))));
        assert!(!server.commands().iter().any(|c| c.starts_with("UID SEARCH")));
        let mapping = store.mapping(&base_id).await.unwrap().unwrap();
        assert_eq!(mapping.uid, Some(1));
        assert_eq!(mapping.push_status, PushStatus::Pushed);

        let remote = server.folder(OUTGOING).unwrap();
        let pushed = codec::decode(&remote.messages[&1].raw).unwrap();
        assert_eq!(pushed, sms("outgoing"));

        // The new folder is picked up next time without downloading our own message.
        server.clear_commands();
        let report = pass(&store, &settings, &mut conn).await.unwrap();
        assert_eq!(report.pushed, 0);
        assert_eq!(report.fetched, 0);
        assert_eq!(report.folders_synced, 1);
        assert_eq!(store.message_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_push_without_uidplus_searches_correlator() {
        let server = FakeServer::new();
        server.remove_capability(CAP_UIDPLUS);
        let store = LocalStore::open_in_memory().await.unwrap();
        let settings = SyncConfig::default();
        let mut conn = connect(&server).await;

        let base_id = store.request_send(OUTGOING, &sms("outgoing")).await.unwrap();
        pass(&store, &settings, &mut conn).await.unwrap();

        assert!(
            server
                .commands()
                .contains(&"UID SEARCH HEADER Message-Correlator \"outgoing\"".to_string())
        );
        let mapping = store.mapping(&base_id).await.unwrap().unwrap();
        assert_eq!(mapping.uid, Some(1));
    }

    #[tokio::test]
    async fn test_undecodable_messages_are_skipped() {
        let server = FakeServer::new();
        server.add_folder(FOLDER, 100);
        server.add_message(FOLDER, b"Subject: not for us\r\n\r\nhi", ServerFlags::empty());
        server.add_message(
            FOLDER,
            b"Message-Context: pager-message\r\nContent-Type: Message/CPIM\r\n\r\ngarbage",
            ServerFlags::empty(),
        );
        server.add_message(FOLDER, &received("fine", "imdn-c"), ServerFlags::empty());
        let store = LocalStore::open_in_memory().await.unwrap();
        let settings = SyncConfig::default();
        let mut conn = connect(&server).await;

        let report = pass(&store, &settings, &mut conn).await.unwrap();

        assert_eq!(report.skipped, 2);
        assert_eq!(report.fetched, 1);
        assert!(store.folder_state(FOLDER).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_disabled_kind_is_not_downloaded() {
        let server = seeded_server();
        let store = LocalStore::open_in_memory().await.unwrap();
        let settings = SyncConfig {
            xms_mode: SyncMode::Sip,
            ..SyncConfig::default()
        };
        let mut conn = connect(&server).await;

        store.request_send(OUTGOING, &sms("outgoing")).await.unwrap();
        let report = pass(&store, &settings, &mut conn).await.unwrap();

        assert_eq!(report.fetched, 0);
        assert_eq!(report.pushed, 0);
        assert!(!server.commands().iter().any(|c| c.starts_with("APPEND")));
        assert_eq!(store.message_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_contact_scope_limits_folders() {
        let server = seeded_server();
        server.add_folder("default/+15550003333", 7);
        server.add_message("default/+15550003333", &received("other", "imdn-z"), ServerFlags::empty());
        let store = LocalStore::open_in_memory().await.unwrap();
        let settings = SyncConfig::default();
        let mut conn = connect(&server).await;

        let clock = FixedClock::at(0);
        let scope = SyncScope::Contact("+15550003333".to_string());
        let report = Reconciler::new(&store, &settings, "/", &clock)
            .run(&mut conn, &scope)
            .await
            .unwrap();

        assert_eq!(report.folders_checked, 1);
        assert!(store.folder_state(FOLDER).await.unwrap().is_none());
        assert!(store.folder_state("default/+15550003333").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_capability_fails_pass() {
        let server = seeded_server();
        server.remove_capability(CAP_CONDSTORE);
        let store = LocalStore::open_in_memory().await.unwrap();
        let settings = SyncConfig::default();
        let mut conn = connect(&server).await;

        let err = pass(&store, &settings, &mut conn).await.unwrap_err();
        assert!(matches!(err, SyncError::Capability(_)));
        assert!(store.folder_states().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_folder_keeps_earlier_commits() {
        let server = seeded_server();
        let broken = "default/+15550009999";
        server.add_folder(broken, 7);
        server.add_message(broken, &received("lost", "imdn-c"), ServerFlags::empty());
        server.reject_select(broken);
        let store = LocalStore::open_in_memory().await.unwrap();
        let settings = SyncConfig::default();
        let mut conn = connect(&server).await;

        let err = pass(&store, &settings, &mut conn).await.unwrap_err();

        assert!(matches!(err, SyncError::Protocol(_)));
        assert!(store.folder_state(FOLDER).await.unwrap().is_some());
        assert!(store.folder_state(broken).await.unwrap().is_none());
        assert_eq!(store.message_count().await.unwrap(), 2);
    }
}
