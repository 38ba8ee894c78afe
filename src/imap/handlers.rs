//! One handler per command. A handler builds its command line, consumes the
//! untagged lines (and literal parts) of the reply, and yields a typed result.
//!
//! Lines that do not belong to the command are skipped; only a broken line of
//! the expected shape is an error.

use super::grammar::{self, FetchItem, LineKind};
use super::{
    AppendOutcome, CAP_CONDSTORE, CAP_LIST_STATUS, FetchedHeader, FetchedMessage, FlagUpdate,
    FolderStatus, ListEntry, SelectedFolder, ServerFlags, StoreOp, quote, uid_set,
};
use crate::error::{Result, SyncError};

pub(crate) trait Handler {
    type Output;

    /// Command text without tag and line terminator.
    fn command(&self) -> String;

    /// Capabilities the server must advertise before the command is sent.
    fn required_capabilities(&self) -> &'static [&'static str] {
        &[]
    }

    /// Payload sent as a synchronizing literal after the `+` continuation.
    fn literal(&self) -> Option<&[u8]> {
        None
    }

    /// Returns true when the line announces a literal part for this handler.
    fn handle_line(&mut self, line: &str) -> Result<bool>;

    /// Replay lines collected outside of streaming, e.g. before an APPEND
    /// continuation. Literal parts are not expected here.
    fn handle_lines(&mut self, lines: &[String]) -> Result<()> {
        for line in lines {
            self.handle_line(line)?;
        }
        Ok(())
    }

    fn handle_part(&mut self, _part: Vec<u8>) -> Result<()> {
        Ok(())
    }

    /// Text of the tagged OK completion.
    fn handle_completion(&mut self, _text: &str) -> Result<()> {
        Ok(())
    }

    fn into_result(self) -> Result<Self::Output>;

    /// Command text safe for the log.
    fn describe(&self) -> String {
        self.command()
    }
}

pub(crate) struct CapabilityHandler {
    capabilities: Vec<String>,
}

impl CapabilityHandler {
    pub(crate) fn new() -> Self {
        Self {
            capabilities: Vec::new(),
        }
    }
}

impl Handler for CapabilityHandler {
    type Output = Vec<String>;

    fn command(&self) -> String {
        "CAPABILITY".to_string()
    }

    fn handle_line(&mut self, line: &str) -> Result<bool> {
        if let Some(untagged) = grammar::match_untagged(line)
            && untagged.kind == LineKind::Capability
        {
            self.capabilities = grammar::parse_capabilities(untagged.rest);
        }
        Ok(false)
    }

    fn into_result(self) -> Result<Vec<String>> {
        Ok(self.capabilities)
    }
}

pub(crate) struct LoginHandler<'a> {
    username: &'a str,
    password: &'a str,
}

impl<'a> LoginHandler<'a> {
    pub(crate) fn new(username: &'a str, password: &'a str) -> Self {
        Self { username, password }
    }
}

impl Handler for LoginHandler<'_> {
    type Output = ();

    fn command(&self) -> String {
        format!("LOGIN {} {}", quote(self.username), quote(self.password))
    }

    fn handle_line(&mut self, _line: &str) -> Result<bool> {
        Ok(false)
    }

    fn into_result(self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        format!("LOGIN {} ****", quote(self.username))
    }
}

pub(crate) struct LogoutHandler;

impl Handler for LogoutHandler {
    type Output = ();

    fn command(&self) -> String {
        "LOGOUT".to_string()
    }

    fn handle_line(&mut self, _line: &str) -> Result<bool> {
        Ok(false)
    }

    fn into_result(self) -> Result<()> {
        Ok(())
    }
}

pub(crate) struct CreateHandler<'a> {
    folder: &'a str,
}

impl<'a> CreateHandler<'a> {
    pub(crate) fn new(folder: &'a str) -> Self {
        Self { folder }
    }
}

impl Handler for CreateHandler<'_> {
    type Output = ();

    fn command(&self) -> String {
        format!("CREATE {}", quote(self.folder))
    }

    fn handle_line(&mut self, _line: &str) -> Result<bool> {
        Ok(false)
    }

    fn into_result(self) -> Result<()> {
        Ok(())
    }
}

/// Folder listing, optionally combined with per-folder STATUS counters.
#[derive(Debug, Default)]
pub(crate) struct Listing {
    pub entries: Vec<ListEntry>,
    pub statuses: Vec<FolderStatus>,
}

pub(crate) struct ListHandler {
    pattern: String,
    with_status: bool,
    listing: Listing,
}

impl ListHandler {
    pub(crate) fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            with_status: false,
            listing: Listing::default(),
        }
    }

    pub(crate) fn with_status(pattern: impl Into<String>) -> Self {
        Self {
            with_status: true,
            ..Self::new(pattern)
        }
    }
}

impl Handler for ListHandler {
    type Output = Listing;

    fn command(&self) -> String {
        if self.with_status {
            format!(
                "LIST \"\" {} RETURN (STATUS (MESSAGES UIDNEXT UIDVALIDITY HIGHESTMODSEQ))",
                quote(&self.pattern)
            )
        } else {
            format!("LIST \"\" {}", quote(&self.pattern))
        }
    }

    fn required_capabilities(&self) -> &'static [&'static str] {
        if self.with_status {
            &[CAP_LIST_STATUS, CAP_CONDSTORE]
        } else {
            &[]
        }
    }

    fn handle_line(&mut self, line: &str) -> Result<bool> {
        let Some(untagged) = grammar::match_untagged(line) else {
            return Ok(false);
        };
        match untagged.kind {
            LineKind::List => self.listing.entries.push(grammar::parse_list(untagged.rest)?),
            LineKind::Status if self.with_status => {
                self.listing.statuses.push(grammar::parse_status(untagged.rest)?)
            }
            _ => {}
        }
        Ok(false)
    }

    fn into_result(self) -> Result<Listing> {
        Ok(self.listing)
    }
}

pub(crate) struct SelectHandler {
    folder: SelectedFolder,
    condstore: bool,
}

impl SelectHandler {
    pub(crate) fn condstore(folder: &str) -> Self {
        Self {
            folder: SelectedFolder {
                name: folder.to_string(),
                ..SelectedFolder::default()
            },
            condstore: true,
        }
    }
}

impl Handler for SelectHandler {
    type Output = SelectedFolder;

    fn command(&self) -> String {
        if self.condstore {
            format!("SELECT {} (CONDSTORE)", quote(&self.folder.name))
        } else {
            format!("SELECT {}", quote(&self.folder.name))
        }
    }

    fn required_capabilities(&self) -> &'static [&'static str] {
        if self.condstore { &[CAP_CONDSTORE] } else { &[] }
    }

    fn handle_line(&mut self, line: &str) -> Result<bool> {
        let Some(untagged) = grammar::match_untagged(line) else {
            return Ok(false);
        };
        match untagged.kind {
            LineKind::Exists => self.folder.exists = untagged.number,
            LineKind::Ok => {
                if let Some((code, value)) = grammar::response_code(untagged.rest) {
                    let broken =
                        || SyncError::protocol(format!("malformed SELECT response: {}", line));
                    match code.to_ascii_uppercase().as_str() {
                        "UIDVALIDITY" => {
                            self.folder.uid_validity = Some(value.parse().map_err(|_| broken())?)
                        }
                        "UIDNEXT" => {
                            self.folder.uid_next = Some(value.parse().map_err(|_| broken())?)
                        }
                        "HIGHESTMODSEQ" => {
                            self.folder.highest_modseq = Some(value.parse().map_err(|_| broken())?)
                        }
                        "NOMODSEQ" => self.folder.highest_modseq = None,
                        _ => {}
                    }
                }
            }
            _ => {}
        }
        Ok(false)
    }

    fn into_result(self) -> Result<SelectedFolder> {
        Ok(self.folder)
    }
}

/// Accumulates `* n FETCH` responses, including attributes that continue
/// after a literal.
#[derive(Default)]
struct FetchCollector {
    items: Vec<FetchItem>,
    current: Option<FetchItem>,
}

impl FetchCollector {
    fn handle_line(&mut self, line: &str) -> Result<bool> {
        if line.starts_with('*') {
            let Some(untagged) = grammar::match_untagged(line) else {
                return Ok(false);
            };
            if untagged.kind != LineKind::Fetch {
                return Ok(false);
            }
            let seq = untagged
                .number
                .ok_or_else(|| SyncError::protocol(format!("FETCH without number: {}", line)))?;
            self.flush();
            let mut item = FetchItem::new(seq);
            let pending = item.apply(&grammar::tokenize(untagged.rest))?;
            self.current = Some(item);
            return Ok(pending);
        }

        // Rest of a FETCH response after its literal.
        match self.current.as_mut() {
            Some(item) => item.apply(&grammar::tokenize(line)),
            None => Ok(false),
        }
    }

    fn handle_part(&mut self, part: Vec<u8>) {
        if let Some(item) = self.current.as_mut() {
            item.body = Some(part);
        }
    }

    fn flush(&mut self) {
        if let Some(item) = self.current.take() {
            self.items.push(item);
        }
    }

    fn finish(mut self) -> Result<Vec<(u32, FetchItem)>> {
        self.flush();
        self.items
            .into_iter()
            .map(|item| match item.uid {
                Some(uid) => Ok((uid, item)),
                None => Err(SyncError::protocol(format!(
                    "FETCH response {} without UID",
                    item.seq
                ))),
            })
            .collect()
    }
}

/// `UID FETCH 1:<n> (UID FLAGS) (CHANGEDSINCE <modseq>)`
pub(crate) struct FetchFlagsHandler {
    end: Option<u32>,
    changed_since: u64,
    collector: FetchCollector,
}

impl FetchFlagsHandler {
    pub(crate) fn new(end: Option<u32>, changed_since: u64) -> Self {
        Self {
            end,
            changed_since,
            collector: FetchCollector::default(),
        }
    }
}

impl Handler for FetchFlagsHandler {
    type Output = Vec<FlagUpdate>;

    fn command(&self) -> String {
        let end = self.end.map_or_else(|| "*".to_string(), |n| n.to_string());
        format!(
            "UID FETCH 1:{} (UID FLAGS) (CHANGEDSINCE {})",
            end, self.changed_since
        )
    }

    fn required_capabilities(&self) -> &'static [&'static str] {
        &[CAP_CONDSTORE]
    }

    fn handle_line(&mut self, line: &str) -> Result<bool> {
        self.collector.handle_line(line)
    }

    fn handle_part(&mut self, part: Vec<u8>) -> Result<()> {
        self.collector.handle_part(part);
        Ok(())
    }

    fn into_result(self) -> Result<Vec<FlagUpdate>> {
        self.collector
            .finish()?
            .into_iter()
            .map(|(uid, item)| {
                let flags = item
                    .flags
                    .ok_or_else(|| SyncError::protocol(format!("FETCH {} without FLAGS", uid)))?;
                Ok(FlagUpdate {
                    uid,
                    flags,
                    modseq: item.modseq,
                })
            })
            .collect()
    }
}

/// `UID FETCH <from>:<to> (FLAGS MODSEQ BODY.PEEK[HEADER])`
pub(crate) struct FetchHeadersHandler {
    from: u32,
    to: Option<u32>,
    collector: FetchCollector,
}

impl FetchHeadersHandler {
    pub(crate) fn new(from: u32, to: Option<u32>) -> Self {
        Self {
            from,
            to,
            collector: FetchCollector::default(),
        }
    }
}

impl Handler for FetchHeadersHandler {
    type Output = Vec<FetchedHeader>;

    fn command(&self) -> String {
        let to = self.to.map_or_else(|| "*".to_string(), |n| n.to_string());
        format!(
            "UID FETCH {}:{} (FLAGS MODSEQ BODY.PEEK[HEADER])",
            self.from, to
        )
    }

    fn required_capabilities(&self) -> &'static [&'static str] {
        &[CAP_CONDSTORE]
    }

    fn handle_line(&mut self, line: &str) -> Result<bool> {
        self.collector.handle_line(line)
    }

    fn handle_part(&mut self, part: Vec<u8>) -> Result<()> {
        self.collector.handle_part(part);
        Ok(())
    }

    fn into_result(self) -> Result<Vec<FetchedHeader>> {
        Ok(self
            .collector
            .finish()?
            .into_iter()
            .map(|(uid, item)| FetchedHeader {
                uid,
                flags: item.flags.unwrap_or_default(),
                modseq: item.modseq,
                header: item.body.unwrap_or_default(),
            })
            .collect())
    }
}

/// `UID FETCH <uid> (RFC822.SIZE FLAGS MODSEQ BODY.PEEK[])`
pub(crate) struct FetchMessageHandler {
    uid: u32,
    collector: FetchCollector,
}

impl FetchMessageHandler {
    pub(crate) fn new(uid: u32) -> Self {
        Self {
            uid,
            collector: FetchCollector::default(),
        }
    }
}

impl Handler for FetchMessageHandler {
    /// `None` when the message was expunged in the meantime.
    type Output = Option<FetchedMessage>;

    fn command(&self) -> String {
        format!("UID FETCH {} (RFC822.SIZE FLAGS MODSEQ BODY.PEEK[])", self.uid)
    }

    fn required_capabilities(&self) -> &'static [&'static str] {
        &[CAP_CONDSTORE]
    }

    fn handle_line(&mut self, line: &str) -> Result<bool> {
        self.collector.handle_line(line)
    }

    fn handle_part(&mut self, part: Vec<u8>) -> Result<()> {
        self.collector.handle_part(part);
        Ok(())
    }

    fn into_result(self) -> Result<Option<FetchedMessage>> {
        let wanted = self.uid;
        let found = self
            .collector
            .finish()?
            .into_iter()
            .find(|(uid, item)| *uid == wanted && item.body.is_some());

        Ok(found.map(|(uid, item)| FetchedMessage {
            uid,
            size: item.size,
            flags: item.flags.unwrap_or_default(),
            modseq: item.modseq,
            body: item.body.unwrap_or_default(),
        }))
    }
}

/// `UID SEARCH HEADER <name> <value>`
pub(crate) struct SearchHandler<'a> {
    header: &'a str,
    value: &'a str,
    uids: Vec<u32>,
}

impl<'a> SearchHandler<'a> {
    pub(crate) fn header(header: &'a str, value: &'a str) -> Self {
        Self {
            header,
            value,
            uids: Vec::new(),
        }
    }
}

impl Handler for SearchHandler<'_> {
    type Output = Vec<u32>;

    fn command(&self) -> String {
        format!("UID SEARCH HEADER {} {}", self.header, quote(self.value))
    }

    fn handle_line(&mut self, line: &str) -> Result<bool> {
        if let Some(untagged) = grammar::match_untagged(line)
            && untagged.kind == LineKind::Search
        {
            self.uids.extend(grammar::parse_search(untagged.rest)?);
        }
        Ok(false)
    }

    fn into_result(mut self) -> Result<Vec<u32>> {
        self.uids.sort_unstable();
        self.uids.dedup();
        Ok(self.uids)
    }
}

/// `APPEND <folder> (<flags>) {<n>}` followed by the payload literal.
pub(crate) struct AppendHandler<'a> {
    folder: &'a str,
    flags: ServerFlags,
    payload: &'a [u8],
    outcome: AppendOutcome,
}

impl<'a> AppendHandler<'a> {
    pub(crate) fn new(folder: &'a str, flags: ServerFlags, payload: &'a [u8]) -> Self {
        Self {
            folder,
            flags,
            payload,
            outcome: AppendOutcome::default(),
        }
    }
}

impl Handler for AppendHandler<'_> {
    type Output = AppendOutcome;

    fn command(&self) -> String {
        format!(
            "APPEND {} ({}) {{{}}}",
            quote(self.folder),
            self.flags.to_imap_list(),
            self.payload.len()
        )
    }

    fn literal(&self) -> Option<&[u8]> {
        Some(self.payload)
    }

    fn handle_line(&mut self, _line: &str) -> Result<bool> {
        Ok(false)
    }

    fn handle_completion(&mut self, text: &str) -> Result<()> {
        if let Some((code, value)) = grammar::response_code(text)
            && code.eq_ignore_ascii_case("APPENDUID")
        {
            let mut numbers = value.split_whitespace().map(str::parse::<u32>);
            match (numbers.next(), numbers.next()) {
                (Some(Ok(validity)), Some(Ok(uid))) => {
                    self.outcome = AppendOutcome {
                        uid_validity: Some(validity),
                        uid: Some(uid),
                    }
                }
                _ => return Err(SyncError::protocol(format!("malformed APPENDUID: {}", text))),
            }
        }
        Ok(())
    }

    fn into_result(self) -> Result<AppendOutcome> {
        Ok(self.outcome)
    }
}

/// `UID STORE <set> +FLAGS|-FLAGS (<flags>)`
pub(crate) struct StoreHandler {
    uids: String,
    op: StoreOp,
    flags: ServerFlags,
}

impl StoreHandler {
    pub(crate) fn new<'a>(
        uids: impl IntoIterator<Item = &'a u32>,
        op: StoreOp,
        flags: ServerFlags,
    ) -> Self {
        Self {
            uids: uid_set(uids),
            op,
            flags,
        }
    }
}

impl Handler for StoreHandler {
    type Output = ();

    fn command(&self) -> String {
        format!(
            "UID STORE {} {} ({})",
            self.uids,
            self.op.as_imap(),
            self.flags.to_imap_list()
        )
    }

    fn handle_line(&mut self, _line: &str) -> Result<bool> {
        Ok(false)
    }

    fn into_result(self) -> Result<()> {
        Ok(())
    }
}
