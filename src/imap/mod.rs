//! IMAP command subset spoken with the CMS server.
//!
//! This module is split into:
//! - `mod.rs` - Typed results, server flags, capability names
//! - `grammar.rs` - Pattern table, tokenizer, and line parsers
//! - `handlers.rs` - One handler per command: build, parse, collect result
//! - `connection.rs` - Tagged round trips over one exclusively held stream
//! - `session.rs` - Single-holder session manager and TLS connector

mod connection;
mod grammar;
mod handlers;
mod session;

#[cfg(test)]
pub(crate) mod fake_server;

use bitflags::bitflags;

pub use connection::{AsyncStream, BoxedStream, ImapConnection};
pub use session::{Connector, Credentials, SessionGuard, SessionManager, TcpTlsConnector};

pub const CAP_CONDSTORE: &str = "CONDSTORE";
pub const CAP_LIST_STATUS: &str = "LIST-STATUS";
pub const CAP_UIDPLUS: &str = "UIDPLUS";

bitflags! {
    /// System flags as reported by the server.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ServerFlags: u32 {
        const SEEN = 0b00000001;
        const ANSWERED = 0b00000010;
        const FLAGGED = 0b00000100;
        const DELETED = 0b00001000;
        const DRAFT = 0b00010000;
    }
}

impl ServerFlags {
    /// Parse one IMAP flag atom; keywords and unknown flags are ignored.
    pub fn from_atom(atom: &str) -> Self {
        match atom.to_ascii_lowercase().as_str() {
            "\\seen" => ServerFlags::SEEN,
            "\\answered" => ServerFlags::ANSWERED,
            "\\flagged" => ServerFlags::FLAGGED,
            "\\deleted" => ServerFlags::DELETED,
            "\\draft" => ServerFlags::DRAFT,
            _ => ServerFlags::empty(),
        }
    }

    /// Space separated flag list as used in APPEND and STORE.
    pub fn to_imap_list(self) -> String {
        let mut atoms = Vec::new();
        if self.contains(ServerFlags::SEEN) {
            atoms.push("\\Seen");
        }
        if self.contains(ServerFlags::ANSWERED) {
            atoms.push("\\Answered");
        }
        if self.contains(ServerFlags::FLAGGED) {
            atoms.push("\\Flagged");
        }
        if self.contains(ServerFlags::DELETED) {
            atoms.push("\\Deleted");
        }
        if self.contains(ServerFlags::DRAFT) {
            atoms.push("\\Draft");
        }
        atoms.join(" ")
    }
}

/// Counters are `None` when the server did not report them; zero is a value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderStatus {
    pub name: String,
    pub messages: Option<u32>,
    pub uid_next: Option<u32>,
    pub uid_validity: Option<u32>,
    pub highest_modseq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub delimiter: Option<String>,
    pub attributes: Vec<String>,
}

impl ListEntry {
    pub fn is_selectable(&self) -> bool {
        !self
            .attributes
            .iter()
            .any(|a| a.eq_ignore_ascii_case("\\Noselect") || a.eq_ignore_ascii_case("\\NonExistent"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectedFolder {
    pub name: String,
    pub exists: Option<u32>,
    pub uid_validity: Option<u32>,
    pub uid_next: Option<u32>,
    pub highest_modseq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagUpdate {
    pub uid: u32,
    pub flags: ServerFlags,
    pub modseq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedHeader {
    pub uid: u32,
    pub flags: ServerFlags,
    pub modseq: Option<u64>,
    pub header: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    pub uid: u32,
    pub size: Option<u32>,
    pub flags: ServerFlags,
    pub modseq: Option<u64>,
    pub body: Vec<u8>,
}

/// UIDPLUS `[APPENDUID <validity> <uid>]`, when the server reports it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    pub uid_validity: Option<u32>,
    pub uid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Add,
    Remove,
}

impl StoreOp {
    fn as_imap(self) -> &'static str {
        match self {
            StoreOp::Add => "+FLAGS",
            StoreOp::Remove => "-FLAGS",
        }
    }
}

/// Quote a string for use as an IMAP quoted string.
pub(crate) fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        if ch == '"' || ch == '\\' {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Text of a tagged NO completion carried by a protocol error. A refused
/// command left the server unchanged.
pub fn refusal(error: &str) -> Option<&str> {
    let (tag, _) = error.split_once(' ')?;
    grammar::match_tagged(error, tag)
        .filter(|done| done.status == grammar::CompletionStatus::No)
        .map(|done| done.text)
}

/// Response code of a refusal, e.g. `TRYCREATE`.
pub fn refusal_code(error: &str) -> Option<&str> {
    refusal(error)
        .and_then(grammar::response_code)
        .map(|(code, _)| code)
}

/// Compact UID set: `1:3,7,9:10`.
pub(crate) fn uid_set<'a>(uids: impl IntoIterator<Item = &'a u32>) -> String {
    let mut sorted: Vec<u32> = uids.into_iter().copied().collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<String> = Vec::new();
    let mut iter = sorted.into_iter().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            ranges.push(start.to_string());
        } else {
            ranges.push(format!("{}:{}", start, end));
        }
    }
    ranges.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refusal_needs_tagged_no() {
        assert_eq!(refusal("C4 NO [TRYCREATE] No such mailbox"), Some("[TRYCREATE] No such mailbox"));
        assert_eq!(refusal_code("C4 NO [TRYCREATE] No such mailbox"), Some("TRYCREATE"));
        assert_eq!(refusal_code("C4 NO Quota exceeded"), None);
        assert!(refusal("C4 NO Quota exceeded").is_some());
        assert!(refusal("C4 BAD Syntax").is_none());
        assert!(refusal("malformed APPENDUID: [APPENDUID x]").is_none());
    }

    #[test]
    fn test_flags_from_atoms() {
        assert_eq!(ServerFlags::from_atom("\\Seen"), ServerFlags::SEEN);
        assert_eq!(ServerFlags::from_atom("\\DELETED"), ServerFlags::DELETED);
        assert_eq!(ServerFlags::from_atom("$Junk"), ServerFlags::empty());
    }

    #[test]
    fn test_flags_to_list() {
        assert_eq!((ServerFlags::SEEN | ServerFlags::DELETED).to_imap_list(), "\\Seen \\Deleted");
        assert_eq!(ServerFlags::empty().to_imap_list(), "");
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("default/+1555"), "\"default/+1555\"");
        assert_eq!(quote("a\"b\\c"), "\"a\\\"b\\\\c\"");
    }

    #[test]
    fn test_uid_set_compacts_ranges() {
        assert_eq!(uid_set(&[7, 1, 2, 3, 9, 10, 2]), "1:3,7,9:10");
        assert_eq!(uid_set(&[5]), "5");
        assert_eq!(uid_set(&Vec::<u32>::new()), "");
    }

    #[test]
    fn test_noselect_entries() {
        let entry = ListEntry {
            name: "default".into(),
            delimiter: Some("/".into()),
            attributes: vec!["\\Noselect".into()],
        };
        assert!(!entry.is_selectable());
    }
}
