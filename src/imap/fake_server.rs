//! In-process CMS server speaking the command subset over a duplex pipe.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

use super::grammar::{self, Token};
use super::{BoxedStream, Connector, ServerFlags};
use crate::codec;

#[derive(Debug, Clone)]
pub(crate) struct FakeMessage {
    pub flags: ServerFlags,
    pub modseq: u64,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeFolder {
    pub uid_validity: u32,
    pub next_uid: u32,
    pub highest_modseq: u64,
    pub messages: BTreeMap<u32, FakeMessage>,
}

impl FakeFolder {
    fn new(uid_validity: u32) -> Self {
        Self {
            uid_validity,
            next_uid: 1,
            highest_modseq: 1,
            messages: BTreeMap::new(),
        }
    }

    fn insert(&mut self, raw: &[u8], flags: ServerFlags) -> u32 {
        let uid = self.next_uid;
        self.next_uid += 1;
        self.highest_modseq += 1;
        self.messages.insert(
            uid,
            FakeMessage {
                flags,
                modseq: self.highest_modseq,
                raw: raw.to_vec(),
            },
        );
        uid
    }
}

struct FakeCms {
    capabilities: Vec<String>,
    folders: BTreeMap<String, FakeFolder>,
    commands: Vec<String>,
    connections: usize,
    unselectable: Vec<String>,
    unappendable: Vec<String>,
    create_on_append: bool,
}

#[derive(Clone)]
pub(crate) struct FakeServer {
    state: Arc<Mutex<FakeCms>>,
}

impl FakeServer {
    pub const PASSWORD: &'static str = "secret";
    pub const DELIMITER: &'static str = "/";

    pub fn new() -> Self {
        let capabilities = ["IMAP4rev1", "CONDSTORE", "LIST-STATUS", "UIDPLUS"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        Self {
            state: Arc::new(Mutex::new(FakeCms {
                capabilities,
                folders: BTreeMap::new(),
                commands: Vec::new(),
                connections: 0,
                unselectable: Vec::new(),
                unappendable: Vec::new(),
                create_on_append: true,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeCms> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn remove_capability(&self, capability: &str) {
        self.state()
            .capabilities
            .retain(|c| !c.eq_ignore_ascii_case(capability));
    }

    /// Answer SELECT of `name` with a tagged NO.
    pub fn reject_select(&self, name: &str) {
        self.state().unselectable.push(name.to_string());
    }

    /// Answer APPEND to `name` with a tagged NO.
    pub fn reject_append(&self, name: &str) {
        self.state().unappendable.push(name.to_string());
    }

    /// APPEND to a missing folder fails with TRYCREATE instead of creating it.
    pub fn require_create(&self) {
        self.state().create_on_append = false;
    }

    pub fn add_folder(&self, name: &str, uid_validity: u32) {
        self.state()
            .folders
            .insert(name.to_string(), FakeFolder::new(uid_validity));
    }

    /// Replace a folder with an empty one under a new UIDVALIDITY.
    pub fn reset_folder(&self, name: &str, uid_validity: u32) {
        self.add_folder(name, uid_validity);
    }

    pub fn add_message(&self, folder: &str, raw: &[u8], flags: ServerFlags) -> u32 {
        let mut state = self.state();
        let folder = state
            .folders
            .entry(folder.to_string())
            .or_insert_with(|| FakeFolder::new(1));
        folder.insert(raw, flags)
    }

    /// Change flags as another device would, bumping MODSEQ.
    pub fn set_flags(&self, folder: &str, uid: u32, flags: ServerFlags) {
        let mut state = self.state();
        if let Some(folder) = state.folders.get_mut(folder) {
            folder.highest_modseq += 1;
            let modseq = folder.highest_modseq;
            if let Some(message) = folder.messages.get_mut(&uid) {
                message.flags = flags;
                message.modseq = modseq;
            }
        }
    }

    /// Lower HIGHESTMODSEQ under the same UIDVALIDITY, as after a server
    /// restore from backup.
    pub fn rewind_modseq(&self, folder: &str, modseq: u64) {
        let mut state = self.state();
        if let Some(folder) = state.folders.get_mut(folder) {
            folder.highest_modseq = modseq;
            for message in folder.messages.values_mut() {
                message.modseq = message.modseq.min(modseq);
            }
        }
    }

    pub fn folder(&self, name: &str) -> Option<FakeFolder> {
        self.state().folders.get(name).cloned()
    }

    /// Commands received so far, without tags.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state().commands.clear();
    }

    pub fn connections(&self) -> usize {
        self.state().connections
    }

    /// Client end of a fresh connection served by a background task.
    pub fn stream(&self) -> BoxedStream {
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.state().connections += 1;
        let this = self.clone();
        tokio::spawn(async move {
            let _ = this.serve(server).await;
        });
        Box::new(client)
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            server: self.clone(),
        }
    }

    async fn serve(&self, stream: DuplexStream) -> io::Result<()> {
        let (read, mut write) = tokio::io::split(stream);
        let mut reader = BufReader::new(read);
        let mut selected: Option<String> = None;

        write.write_all(b"* OK CMS ready\r\n").await?;

        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            let Some((tag, command)) = line.split_once(' ') else {
                continue;
            };
            self.state().commands.push(command.to_string());

            let upper = command.to_ascii_uppercase();
            let response = if upper.starts_with("APPEND ") {
                if let Some(refusal) = self.refuse_append(tag, command) {
                    write.write_all(&refusal).await?;
                    write.flush().await?;
                    continue;
                }
                let len = grammar::literal_len(command).unwrap_or(0);
                write.write_all(b"+ Ready for literal data\r\n").await?;
                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload).await?;
                let mut rest = String::new();
                reader.read_line(&mut rest).await?;
                self.append(tag, command, payload)
            } else if upper == "LOGOUT" {
                let bye = format!("* BYE logging out\r\n{} OK LOGOUT completed\r\n", tag);
                write.write_all(bye.as_bytes()).await?;
                return Ok(());
            } else {
                self.respond(tag, command, &mut selected)
            };

            write.write_all(&response).await?;
            write.flush().await?;
        }
    }

    fn respond(&self, tag: &str, command: &str, selected: &mut Option<String>) -> Vec<u8> {
        let tokens = grammar::tokenize(command);
        let words: Vec<String> = tokens
            .iter()
            .filter_map(Token::as_text)
            .map(str::to_string)
            .collect();
        let verb = words.first().map(|w| w.to_ascii_uppercase()).unwrap_or_default();
        let mut out = String::new();
        let mut state = self.state();

        match verb.as_str() {
            "CAPABILITY" => {
                out.push_str(&format!("* CAPABILITY {}\r\n", state.capabilities.join(" ")));
                out.push_str(&format!("{} OK CAPABILITY completed\r\n", tag));
            }
            "LOGIN" => {
                if words.get(2).map(String::as_str) == Some(Self::PASSWORD) {
                    out.push_str(&format!("{} OK LOGIN completed\r\n", tag));
                } else {
                    out.push_str(&format!("{} NO [AUTHENTICATIONFAILED] Invalid credentials\r\n", tag));
                }
            }
            "LIST" => {
                let pattern = words.get(2).cloned().unwrap_or_default();
                let with_status = command.to_ascii_uppercase().contains("RETURN (STATUS");
                if pattern.is_empty() {
                    out.push_str(&format!("* LIST (\\Noselect) \"{}\" \"\"\r\n", Self::DELIMITER));
                } else {
                    let prefix = pattern.trim_end_matches(['*', '%']);
                    for (name, folder) in state.folders.iter().filter(|(n, _)| n.starts_with(prefix)) {
                        out.push_str(&format!(
                            "* LIST (\\HasNoChildren) \"{}\" \"{}\"\r\n",
                            Self::DELIMITER,
                            name
                        ));
                        if with_status {
                            out.push_str(&format!(
                                "* STATUS \"{}\" (MESSAGES {} UIDNEXT {} UIDVALIDITY {} HIGHESTMODSEQ {})\r\n",
                                name,
                                folder.messages.len(),
                                folder.next_uid,
                                folder.uid_validity,
                                folder.highest_modseq
                            ));
                        }
                    }
                }
                out.push_str(&format!("{} OK LIST completed\r\n", tag));
            }
            "SELECT" => {
                let name = words.get(1).cloned().unwrap_or_default();
                let folder = match state.unselectable.contains(&name) {
                    true => None,
                    false => state.folders.get(&name),
                };
                match folder {
                    Some(folder) => {
                        out.push_str(&format!("* {} EXISTS\r\n", folder.messages.len()));
                        out.push_str("* FLAGS (\\Seen \\Deleted)\r\n");
                        out.push_str(&format!("* OK [UIDVALIDITY {}] UIDs valid\r\n", folder.uid_validity));
                        out.push_str(&format!("* OK [UIDNEXT {}] Predicted next UID\r\n", folder.next_uid));
                        out.push_str(&format!("* OK [HIGHESTMODSEQ {}] Highest\r\n", folder.highest_modseq));
                        out.push_str(&format!("{} OK [READ-WRITE] SELECT completed\r\n", tag));
                        *selected = Some(name);
                    }
                    None => {
                        *selected = None;
                        out.push_str(&format!("{} NO [NONEXISTENT] No such mailbox\r\n", tag));
                    }
                }
            }
            "CREATE" => {
                let name = words.get(1).cloned().unwrap_or_default();
                if state.folders.contains_key(&name) {
                    out.push_str(&format!("{} NO [ALREADYEXISTS] Mailbox exists\r\n", tag));
                } else {
                    state.folders.insert(name, FakeFolder::new(1));
                    out.push_str(&format!("{} OK CREATE completed\r\n", tag));
                }
            }
            "UID" => {
                let folder = selected.as_ref().and_then(|name| state.folders.get_mut(name));
                let Some(folder) = folder else {
                    out.push_str(&format!("{} BAD No mailbox selected\r\n", tag));
                    return out.into_bytes();
                };
                let sub = words.get(1).map(|w| w.to_ascii_uppercase()).unwrap_or_default();
                match sub.as_str() {
                    "FETCH" => {
                        let set = words.get(2).cloned().unwrap_or_default();
                        let uids = expand_set(&set, folder);
                        let upper = command.to_ascii_uppercase();
                        let changed_since = changed_since(&tokens);
                        return fetch(tag, &upper, folder, &uids, changed_since);
                    }
                    "SEARCH" => {
                        let header = words.get(3).cloned().unwrap_or_default();
                        let value = words.get(4).cloned().unwrap_or_default();
                        let found: Vec<String> = folder
                            .messages
                            .iter()
                            .filter(|(_, m)| {
                                codec::parse_header_block(&m.raw)
                                    .ok()
                                    .and_then(|h| h.get(&header).map(|v| v.contains(&value)))
                                    .unwrap_or(false)
                            })
                            .map(|(uid, _)| uid.to_string())
                            .collect();
                        if found.is_empty() {
                            out.push_str("* SEARCH\r\n");
                        } else {
                            out.push_str(&format!("* SEARCH {}\r\n", found.join(" ")));
                        }
                        out.push_str(&format!("{} OK SEARCH completed\r\n", tag));
                    }
                    "STORE" => {
                        let set = words.get(2).cloned().unwrap_or_default();
                        let op = words.get(3).map(|w| w.to_ascii_uppercase()).unwrap_or_default();
                        let flags = words
                            .iter()
                            .skip(4)
                            .fold(ServerFlags::empty(), |acc, f| acc | ServerFlags::from_atom(f));
                        for uid in expand_set(&set, folder) {
                            folder.highest_modseq += 1;
                            let modseq = folder.highest_modseq;
                            let seq = folder.messages.keys().position(|u| *u == uid).unwrap_or(0) + 1;
                            if let Some(message) = folder.messages.get_mut(&uid) {
                                if op.starts_with('+') {
                                    message.flags |= flags;
                                } else {
                                    message.flags &= !flags;
                                }
                                message.modseq = modseq;
                                out.push_str(&format!(
                                    "* {} FETCH (UID {} FLAGS ({}) MODSEQ ({}))\r\n",
                                    seq,
                                    uid,
                                    message.flags.to_imap_list(),
                                    modseq
                                ));
                            }
                        }
                        out.push_str(&format!("{} OK STORE completed\r\n", tag));
                    }
                    _ => out.push_str(&format!("{} BAD Unknown UID command\r\n", tag)),
                }
            }
            _ => out.push_str(&format!("{} BAD Unknown command\r\n", tag)),
        }

        out.into_bytes()
    }

    /// Tagged NO sent instead of the continuation, as servers do for a bad
    /// target folder.
    fn refuse_append(&self, tag: &str, command: &str) -> Option<Vec<u8>> {
        let tokens = grammar::tokenize(command);
        let name = tokens.get(1).and_then(Token::as_text).unwrap_or_default();
        let state = self.state();
        if state.unappendable.iter().any(|n| n == name) {
            Some(format!("{} NO [CANNOT] Append not allowed\r\n", tag).into_bytes())
        } else if !state.create_on_append && !state.folders.contains_key(name) {
            Some(format!("{} NO [TRYCREATE] No such mailbox\r\n", tag).into_bytes())
        } else {
            None
        }
    }

    fn append(&self, tag: &str, command: &str, payload: Vec<u8>) -> Vec<u8> {
        let tokens = grammar::tokenize(command);
        let folder_name = tokens.get(1).and_then(Token::as_text).unwrap_or_default().to_string();
        let flags = tokens
            .iter()
            .skip(2)
            .take_while(|t| **t != Token::Close)
            .filter_map(Token::as_text)
            .fold(ServerFlags::empty(), |acc, f| acc | ServerFlags::from_atom(f));

        let mut state = self.state();
        let uidplus = state.capabilities.iter().any(|c| c == "UIDPLUS");
        // Conversation folders are created on first APPEND.
        let folder = state
            .folders
            .entry(folder_name)
            .or_insert_with(|| FakeFolder::new(1));
        let uid = folder.insert(&payload, flags);

        if uidplus {
            format!(
                "{} OK [APPENDUID {} {}] APPEND completed\r\n",
                tag, folder.uid_validity, uid
            )
            .into_bytes()
        } else {
            format!("{} OK APPEND completed\r\n", tag).into_bytes()
        }
    }
}

fn changed_since(tokens: &[Token<'_>]) -> Option<u64> {
    tokens
        .iter()
        .position(|t| matches!(t, Token::Atom(a) if a.eq_ignore_ascii_case("CHANGEDSINCE")))
        .and_then(|i| tokens.get(i + 1))
        .and_then(Token::as_text)
        .and_then(|n| n.parse().ok())
}

fn expand_set(set: &str, folder: &FakeFolder) -> Vec<u32> {
    let max = folder.messages.keys().next_back().copied().unwrap_or(0);
    let bound = |s: &str| if s == "*" { max } else { s.parse().unwrap_or(0) };

    let mut uids = Vec::new();
    for range in set.split(',') {
        let (low, high) = match range.split_once(':') {
            Some((a, b)) => (bound(a), bound(b)),
            None => (bound(range), bound(range)),
        };
        let (low, high) = (low.min(high), low.max(high));
        uids.extend(folder.messages.keys().filter(|u| **u >= low && **u <= high));
    }
    uids.sort_unstable();
    uids.dedup();
    uids
}

fn fetch(tag: &str, upper: &str, folder: &FakeFolder, uids: &[u32], changed_since: Option<u64>) -> Vec<u8> {
    let mut out = Vec::new();
    for uid in uids {
        let Some(message) = folder.messages.get(uid) else {
            continue;
        };
        if changed_since.is_some_and(|m| message.modseq <= m) {
            continue;
        }
        let seq = folder.messages.keys().position(|u| u == uid).unwrap_or(0) + 1;
        let flags = message.flags.to_imap_list();

        if upper.contains("BODY.PEEK[HEADER]") {
            let header = header_of(&message.raw);
            out.extend(
                format!(
                    "* {} FETCH (UID {} FLAGS ({}) MODSEQ ({}) BODY[HEADER] {{{}}}\r\n",
                    seq,
                    uid,
                    flags,
                    message.modseq,
                    header.len()
                )
                .into_bytes(),
            );
            out.extend_from_slice(header);
            out.extend_from_slice(b")\r\n");
        } else if upper.contains("BODY.PEEK[]") {
            out.extend(
                format!(
                    "* {} FETCH (UID {} RFC822.SIZE {} BODY[] {{{}}}\r\n",
                    seq,
                    uid,
                    message.raw.len(),
                    message.raw.len()
                )
                .into_bytes(),
            );
            out.extend_from_slice(&message.raw);
            out.extend(format!(" FLAGS ({}) MODSEQ ({}))\r\n", flags, message.modseq).into_bytes());
        } else {
            out.extend(
                format!(
                    "* {} FETCH (UID {} FLAGS ({}) MODSEQ ({}))\r\n",
                    seq, uid, flags, message.modseq
                )
                .into_bytes(),
            );
        }
    }
    out.extend(format!("{} OK FETCH completed\r\n", tag).into_bytes());
    out
}

/// Header block including its terminating blank line.
fn header_of(raw: &[u8]) -> &[u8] {
    raw.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| &raw[..i + 4])
        .unwrap_or(raw)
}

pub(crate) struct FakeConnector {
    server: FakeServer,
}

impl Connector for FakeConnector {
    fn connect(&self) -> BoxFuture<'_, io::Result<BoxedStream>> {
        let stream = self.server.stream();
        Box::pin(async move { Ok(stream) })
    }
}
