//! Sync state types shared by the store, the reconciler and the scheduler.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::codec::MessageKind;
use crate::imap::{FolderStatus, ServerFlags, StoreOp};

/// Last committed snapshot of one remote folder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderState {
    pub name: String,
    pub uid_validity: Option<u32>,
    pub highest_modseq: Option<u64>,
    pub uid_next: Option<u32>,
    pub message_count: Option<u32>,
}

impl FolderState {
    pub fn from_status(status: &FolderStatus) -> Self {
        Self {
            name: status.name.clone(),
            uid_validity: status.uid_validity,
            highest_modseq: status.highest_modseq,
            uid_next: status.uid_next,
            message_count: status.messages,
        }
    }

    pub fn has_messages(&self) -> bool {
        self.message_count.is_some_and(|n| n > 0)
    }

    /// HIGHESTMODSEQ is lower than in `previous` within the same UIDVALIDITY.
    pub fn modseq_went_back(&self, previous: &FolderState) -> bool {
        self.uid_validity == previous.uid_validity
            && matches!(
                (self.highest_modseq, previous.highest_modseq),
                (Some(now), Some(before)) if now < before
            )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resync {
    No,
    Yes,
    /// UIDVALIDITY changed: every UID mapping of the folder is stale.
    YesPurge,
}

impl Resync {
    pub fn is_needed(self) -> bool {
        self != Resync::No
    }
}

/// Decide whether a folder needs a pass, comparing the local snapshot with
/// the counters reported by LIST-STATUS.
pub fn needs_resync(local: Option<&FolderState>, remote: &FolderStatus) -> Resync {
    let Some(local) = local else {
        return if remote.messages.is_some_and(|n| n > 0) {
            Resync::Yes
        } else {
            Resync::No
        };
    };

    if local.uid_validity != remote.uid_validity {
        Resync::YesPurge
    } else if local.highest_modseq != remote.highest_modseq {
        Resync::Yes
    } else {
        Resync::No
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    Requested,
    /// APPEND was sent but not acknowledged; the server may hold the message.
    Appending,
    Pushed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Unread,
    ReadRequested,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStatus {
    NotDeleted,
    DeleteRequested,
    Deleted,
}

/// Link between a remote (folder, UID) and a local message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMapping {
    pub base_id: String,
    pub folder: String,
    /// `None` until the server has acknowledged the message under a UID of
    /// the folder's current UIDVALIDITY.
    pub uid: Option<u32>,
    pub kind: MessageKind,
    pub push_status: PushStatus,
    pub read_status: ReadStatus,
    pub delete_status: DeleteStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Flag {
    Seen,
    Deleted,
}

impl Flag {
    pub fn server_flags(self) -> ServerFlags {
        match self {
            Flag::Seen => ServerFlags::SEEN,
            Flag::Deleted => ServerFlags::DELETED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlagOp {
    Add,
    Remove,
}

impl From<FlagOp> for StoreOp {
    fn from(op: FlagOp) -> Self {
        match op {
            FlagOp::Add => StoreOp::Add,
            FlagOp::Remove => StoreOp::Remove,
        }
    }
}

/// One flag transition over a set of UIDs of a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagChangeSet {
    pub folder: String,
    pub uids: BTreeSet<u32>,
    pub flag: Flag,
    pub op: FlagOp,
}

impl FlagChangeSet {
    pub fn new(folder: impl Into<String>, flag: Flag, op: FlagOp) -> Self {
        Self {
            folder: folder.into(),
            uids: BTreeSet::new(),
            flag,
            op,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }
}

/// Which folders a sync covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncScope {
    All,
    Folder(String),
    /// The conversation folder of one contact.
    Contact(String),
}

impl SyncScope {
    pub fn includes(&self, folder: &str, root: &str, separator: &str) -> bool {
        match self {
            SyncScope::All => true,
            SyncScope::Folder(name) => name == folder,
            SyncScope::Contact(contact) => contact_folder(root, separator, contact) == folder,
        }
    }

    /// Merge two pending scopes; differing scopes widen to everything.
    pub fn merge(self, other: SyncScope) -> SyncScope {
        if self == other { self } else { SyncScope::All }
    }
}

impl std::fmt::Display for SyncScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncScope::All => write!(f, "all"),
            SyncScope::Folder(name) => write!(f, "folder {}", name),
            SyncScope::Contact(contact) => write!(f, "contact {}", contact),
        }
    }
}

/// Conversation folder holding the messages exchanged with `contact`.
pub fn contact_folder(root: &str, separator: &str, contact: &str) -> String {
    format!("{}{}{}", root, separator, contact)
}

/// How a message kind is synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Disabled,
    #[default]
    Imap,
    Sip,
}
