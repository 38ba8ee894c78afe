//! Tagged round trips over one exclusively held stream.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tracing::{debug, trace};

use super::grammar::{self, CompletionStatus, LineKind};
use super::handlers::{
    AppendHandler, CapabilityHandler, CreateHandler, FetchFlagsHandler, FetchHeadersHandler,
    FetchMessageHandler, Handler, ListHandler, LoginHandler, LogoutHandler, SearchHandler,
    SelectHandler, StoreHandler,
};
use super::{
    AppendOutcome, FetchedHeader, FetchedMessage, FlagUpdate, FolderStatus, ListEntry,
    SelectedFolder, ServerFlags, StoreOp,
};
use crate::error::{Result, SyncError};

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// An open IMAP connection. Commands take `&mut self`, so one round trip is
/// in flight at a time and untagged replies always belong to it.
pub struct ImapConnection {
    stream: BufStream<BoxedStream>,
    next_tag: u32,
    capabilities: HashSet<String>,
    selected: Option<String>,
    timeout: Duration,
}

impl fmt::Debug for ImapConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapConnection")
            .field("next_tag", &self.next_tag)
            .field("capabilities", &self.capabilities)
            .field("selected", &self.selected)
            .finish_non_exhaustive()
    }
}

impl ImapConnection {
    /// Wrap a connected stream and consume the server greeting.
    pub async fn open(stream: BoxedStream, timeout: Duration) -> Result<Self> {
        let mut connection = Self {
            stream: BufStream::new(stream),
            next_tag: 0,
            capabilities: HashSet::new(),
            selected: None,
            timeout,
        };

        let greeting = tokio::time::timeout(timeout, connection.read_line())
            .await
            .map_err(|_| timed_out("greeting"))??;

        match grammar::match_untagged(&greeting) {
            Some(line) if line.kind == LineKind::Ok => {
                if let Some((code, caps)) = grammar::response_code(line.rest)
                    && code.eq_ignore_ascii_case("CAPABILITY")
                {
                    connection.capabilities = grammar::parse_capabilities(caps).into_iter().collect();
                }
            }
            _ if greeting.starts_with("* PREAUTH") => {}
            _ => {
                return Err(SyncError::protocol(format!(
                    "unexpected greeting: {}",
                    greeting
                )));
            }
        }

        debug!("IMAP greeting: {}", greeting);
        Ok(connection)
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(&capability.to_ascii_uppercase())
    }

    /// Folder currently selected, if any.
    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Run one command to its tagged completion.
    async fn execute<H: Handler>(&mut self, mut handler: H) -> Result<H::Output> {
        if let Some(missing) = handler
            .required_capabilities()
            .iter()
            .find(|cap| !self.has_capability(cap))
        {
            return Err(SyncError::Capability((*missing).to_string()));
        }

        let timeout = self.timeout;
        let outcome = tokio::time::timeout(timeout, self.round_trip(&mut handler)).await;
        match outcome {
            Ok(result) => result?,
            Err(_) => return Err(timed_out(&handler.describe())),
        }

        handler.into_result()
    }

    async fn round_trip<H: Handler>(&mut self, handler: &mut H) -> Result<()> {
        self.next_tag += 1;
        let tag = format!("C{}", self.next_tag);
        debug!("> {} {}", tag, handler.describe());

        self.stream
            .write_all(format!("{} {}\r\n", tag, handler.command()).as_bytes())
            .await?;
        self.stream.flush().await?;

        if let Some(literal) = handler.literal() {
            let literal = literal.to_vec();
            let mut early = Vec::new();
            loop {
                let line = self.read_line().await?;
                if grammar::is_continuation(&line) {
                    break;
                }
                if let Some(done) = grammar::match_tagged(&line, &tag) {
                    // Rejected before the payload was sent.
                    if done.status != CompletionStatus::Ok {
                        return Err(SyncError::Protocol(line));
                    }
                    return Err(SyncError::protocol(format!(
                        "completion before literal was sent: {}",
                        line
                    )));
                }
                early.push(line);
            }
            handler.handle_lines(&early)?;

            self.stream.write_all(&literal).await?;
            self.stream.write_all(b"\r\n").await?;
            self.stream.flush().await?;
        }

        loop {
            let line = self.read_line().await?;

            if let Some(done) = grammar::match_tagged(&line, &tag) {
                debug!("< {}", line);
                return match done.status {
                    CompletionStatus::Ok => handler.handle_completion(done.text),
                    CompletionStatus::No | CompletionStatus::Bad => Err(SyncError::Protocol(line)),
                };
            }

            trace!("< {}", line);
            let wants_part = handler.handle_line(&line)?;

            if let Some(len) = grammar::literal_len(&line) {
                let mut part = vec![0u8; len];
                self.stream.read_exact(&mut part).await?;
                if wants_part {
                    handler.handle_part(part)?;
                }
            }
        }
    }

    /// Read one line without its terminator. EOF is a network error.
    async fn read_line(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        let read = self.stream.read_until(b'\n', &mut buf).await?;
        if read == 0 {
            return Err(SyncError::Network(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            )));
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Refresh the advertised capability set.
    pub async fn capability(&mut self) -> Result<()> {
        let capabilities = self.execute(CapabilityHandler::new()).await?;
        self.capabilities = capabilities.into_iter().collect();
        Ok(())
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        self.execute(LoginHandler::new(username, password)).await
    }

    pub async fn logout(&mut self) -> Result<()> {
        self.selected = None;
        self.execute(LogoutHandler).await
    }

    pub async fn list(&mut self, pattern: &str) -> Result<Vec<ListEntry>> {
        Ok(self.execute(ListHandler::new(pattern)).await?.entries)
    }

    /// LIST with RETURN (STATUS ...): counters for every selectable folder
    /// matching `pattern`.
    pub async fn list_status(&mut self, pattern: &str) -> Result<Vec<FolderStatus>> {
        let listing = self.execute(ListHandler::with_status(pattern)).await?;
        let selectable: HashSet<&str> = listing
            .entries
            .iter()
            .filter(|e| e.is_selectable())
            .map(|e| e.name.as_str())
            .collect();

        Ok(listing
            .statuses
            .iter()
            .filter(|s| selectable.contains(s.name.as_str()))
            .cloned()
            .collect())
    }

    pub async fn select_condstore(&mut self, folder: &str) -> Result<SelectedFolder> {
        self.selected = None;
        let selected = self.execute(SelectHandler::condstore(folder)).await?;
        self.selected = Some(folder.to_string());
        Ok(selected)
    }

    /// Flags of messages in `1:end` changed after `modseq`.
    pub async fn fetch_flags_changed_since(
        &mut self,
        end: Option<u32>,
        modseq: u64,
    ) -> Result<Vec<FlagUpdate>> {
        self.execute(FetchFlagsHandler::new(end, modseq)).await
    }

    pub async fn fetch_headers(&mut self, from: u32, to: Option<u32>) -> Result<Vec<FetchedHeader>> {
        self.execute(FetchHeadersHandler::new(from, to)).await
    }

    pub async fn fetch_message(&mut self, uid: u32) -> Result<Option<FetchedMessage>> {
        self.execute(FetchMessageHandler::new(uid)).await
    }

    pub async fn search_header(&mut self, header: &str, value: &str) -> Result<Vec<u32>> {
        self.execute(SearchHandler::header(header, value)).await
    }

    pub async fn append(
        &mut self,
        folder: &str,
        flags: ServerFlags,
        payload: &[u8],
    ) -> Result<AppendOutcome> {
        self.execute(AppendHandler::new(folder, flags, payload)).await
    }

    pub async fn create(&mut self, folder: &str) -> Result<()> {
        self.execute(CreateHandler::new(folder)).await
    }

    pub async fn store_flags(&mut self, uids: &[u32], op: StoreOp, flags: ServerFlags) -> Result<()> {
        self.execute(StoreHandler::new(uids, op, flags)).await
    }
}

fn timed_out(what: &str) -> SyncError {
    SyncError::Network(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("timed out waiting for {}", what),
    ))
}
