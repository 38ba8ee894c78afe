//! Response grammar: a keyword pattern table, a lenient tokenizer, and the
//! parsers for the few untagged lines the handlers care about.
//!
//! Lines are passed without their trailing CRLF.

use aho_corasick::{AhoCorasick, Anchored, Input, MatchKind, StartKind};
use std::sync::LazyLock;

use super::{FolderStatus, ListEntry, ServerFlags};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineKind {
    Capability,
    List,
    Status,
    Search,
    Fetch,
    Exists,
    Ok,
    No,
    Bad,
    Bye,
}

/// Untagged response keywords, matched case-insensitively at the start of the
/// line (after an optional message number).
const PATTERNS: &[(&str, LineKind)] = &[
    ("CAPABILITY", LineKind::Capability),
    ("LIST", LineKind::List),
    ("STATUS", LineKind::Status),
    ("SEARCH", LineKind::Search),
    ("FETCH", LineKind::Fetch),
    ("EXISTS", LineKind::Exists),
    ("OK", LineKind::Ok),
    ("NO", LineKind::No),
    ("BAD", LineKind::Bad),
    ("BYE", LineKind::Bye),
];

static MATCHER: LazyLock<Option<AhoCorasick>> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .match_kind(MatchKind::LeftmostLongest)
        .start_kind(StartKind::Anchored)
        .build(PATTERNS.iter().map(|(keyword, _)| keyword))
        .ok()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Untagged<'a> {
    pub kind: LineKind,
    /// Message number for `* <n> FETCH` / `* <n> EXISTS`.
    pub number: Option<u32>,
    /// Remainder after the keyword, leading spaces removed.
    pub rest: &'a str,
}

/// Classify an untagged `* ...` line; `None` for anything not in the table.
pub(crate) fn match_untagged(line: &str) -> Option<Untagged<'_>> {
    let body = line.strip_prefix("* ")?;

    let (number, after) = match body.split_once(' ') {
        Some((n, rest)) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => {
            (n.parse().ok(), rest)
        }
        _ => (None, body),
    };

    let matcher = MATCHER.as_ref()?;
    let found = matcher.find(Input::new(after).anchored(Anchored::Yes))?;
    let end = found.end();
    if after.len() > end && !after[end..].starts_with(' ') {
        return None;
    }

    Some(Untagged {
        kind: PATTERNS[found.pattern().as_usize()].1,
        number,
        rest: after[end..].trim_start(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompletionStatus {
    Ok,
    No,
    Bad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Completion<'a> {
    pub status: CompletionStatus,
    pub text: &'a str,
}

/// Match the tagged completion `<tag> OK|NO|BAD ...` for `tag`.
pub(crate) fn match_tagged<'a>(line: &'a str, tag: &str) -> Option<Completion<'a>> {
    let rest = line.strip_prefix(tag)?.strip_prefix(' ')?;
    let (status, text) = rest.split_once(' ').unwrap_or((rest, ""));
    let status = match status.to_ascii_uppercase().as_str() {
        "OK" => CompletionStatus::Ok,
        "NO" => CompletionStatus::No,
        "BAD" => CompletionStatus::Bad,
        _ => return None,
    };
    Some(Completion { status, text })
}

pub(crate) fn is_continuation(line: &str) -> bool {
    line.starts_with('+')
}

/// Byte count announced by a trailing `{n}` (or `{n+}`) literal marker.
pub(crate) fn literal_len(line: &str) -> Option<usize> {
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

/// `[CODE value]` response code at the start of a status text.
pub(crate) fn response_code(text: &str) -> Option<(&str, &str)> {
    let inner = text.strip_prefix('[')?;
    let close = inner.find(']')?;
    let code = &inner[..close];
    Some(code.split_once(' ').unwrap_or((code, "")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token<'a> {
    Atom(&'a str),
    Quoted(String),
    Open,
    Close,
    Literal(usize),
}

impl Token<'_> {
    /// Atom or quoted string content.
    pub(crate) fn as_text(&self) -> Option<&str> {
        match self {
            Token::Atom(a) => Some(a),
            Token::Quoted(q) => Some(q),
            _ => None,
        }
    }
}

/// Split a response fragment into tokens. Unterminated quotes and lists are
/// tolerated; bracketed sections such as `BODY[HEADER.FIELDS (X)]` stay in
/// one atom.
pub(crate) fn tokenize(input: &str) -> Vec<Token<'_>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b' ' => i += 1,
            b'(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            b')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            b'"' => {
                let mut value = String::new();
                let mut chars = input[i + 1..].char_indices();
                let mut consumed = input.len() - i - 1;
                while let Some((offset, ch)) = chars.next() {
                    match ch {
                        '\\' => {
                            if let Some((_, escaped)) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '"' => {
                            consumed = offset + 1;
                            break;
                        }
                        _ => value.push(ch),
                    }
                }
                tokens.push(Token::Quoted(value));
                i += 1 + consumed;
            }
            b'{' => {
                let end = input[i..].find('}').map(|e| i + e);
                match end.and_then(|e| input[i + 1..e].trim_end_matches('+').parse().ok()) {
                    Some(n) => {
                        tokens.push(Token::Literal(n));
                        i = end.map_or(bytes.len(), |e| e + 1);
                    }
                    None => {
                        let start = i;
                        i = scan_atom(bytes, i);
                        tokens.push(Token::Atom(&input[start..i]));
                    }
                }
            }
            _ => {
                let start = i;
                i = scan_atom(bytes, i);
                tokens.push(Token::Atom(&input[start..i]));
            }
        }
    }

    tokens
}

fn scan_atom(bytes: &[u8], mut i: usize) -> usize {
    let mut depth = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'[' => depth += 1,
            b']' => depth = depth.saturating_sub(1),
            b' ' | b'(' | b')' if depth == 0 => break,
            _ => {}
        }
        i += 1;
    }
    i
}

pub(crate) fn parse_number<T: std::str::FromStr>(token: Option<&Token<'_>>, what: &str) -> Result<T> {
    token
        .and_then(Token::as_text)
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| SyncError::protocol(format!("expected number for {}", what)))
}

/// `* CAPABILITY IMAP4rev1 CONDSTORE ...`
pub(crate) fn parse_capabilities(rest: &str) -> Vec<String> {
    rest.split_whitespace()
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// `* LIST (\HasNoChildren) "/" "default/+1555"`
pub(crate) fn parse_list(rest: &str) -> Result<ListEntry> {
    let tokens = tokenize(rest);
    let broken = || SyncError::protocol(format!("malformed LIST response: {}", rest));

    let mut iter = tokens.iter();
    if iter.next() != Some(&Token::Open) {
        return Err(broken());
    }
    let mut attributes = Vec::new();
    loop {
        match iter.next() {
            Some(Token::Close) => break,
            Some(Token::Atom(a)) => attributes.push(a.to_string()),
            _ => return Err(broken()),
        }
    }

    let delimiter = match iter.next() {
        Some(Token::Quoted(d)) => Some(d.clone()),
        Some(Token::Atom(a)) if a.eq_ignore_ascii_case("NIL") => None,
        _ => return Err(broken()),
    };

    let name = iter
        .next()
        .and_then(Token::as_text)
        .ok_or_else(broken)?
        .to_string();

    Ok(ListEntry {
        name,
        delimiter,
        attributes,
    })
}

/// `* STATUS "default/+1555" (MESSAGES 2 UIDNEXT 3 UIDVALIDITY 100 HIGHESTMODSEQ 5)`
pub(crate) fn parse_status(rest: &str) -> Result<FolderStatus> {
    let tokens = tokenize(rest);
    let broken = || SyncError::protocol(format!("malformed STATUS response: {}", rest));

    let mut iter = tokens.iter();
    let name = iter.next().and_then(Token::as_text).ok_or_else(broken)?;
    if iter.next() != Some(&Token::Open) {
        return Err(broken());
    }

    let mut status = FolderStatus {
        name: name.to_string(),
        ..FolderStatus::default()
    };

    loop {
        let key = match iter.next() {
            Some(Token::Close) | None => break,
            Some(Token::Atom(key)) => key.to_ascii_uppercase(),
            Some(_) => return Err(broken()),
        };
        let value = iter.next();
        match key.as_str() {
            "MESSAGES" => status.messages = Some(parse_number(value, "MESSAGES")?),
            "UIDNEXT" => status.uid_next = Some(parse_number(value, "UIDNEXT")?),
            "UIDVALIDITY" => status.uid_validity = Some(parse_number(value, "UIDVALIDITY")?),
            "HIGHESTMODSEQ" => {
                status.highest_modseq = Some(parse_number(value, "HIGHESTMODSEQ")?)
            }
            _ => {}
        }
    }

    Ok(status)
}

/// `* SEARCH 4 7 9` (a trailing CONDSTORE `(MODSEQ n)` is ignored).
pub(crate) fn parse_search(rest: &str) -> Result<Vec<u32>> {
    rest.split_whitespace()
        .take_while(|t| !t.starts_with('('))
        .map(|t| {
            t.parse()
                .map_err(|_| SyncError::protocol(format!("malformed SEARCH response: {}", rest)))
        })
        .collect()
}

/// Attributes of one FETCH response, accumulated across literal boundaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct FetchItem {
    pub seq: u32,
    pub uid: Option<u32>,
    pub flags: Option<ServerFlags>,
    pub modseq: Option<u64>,
    pub size: Option<u32>,
    pub body: Option<Vec<u8>>,
}

impl FetchItem {
    pub(crate) fn new(seq: u32) -> Self {
        Self {
            seq,
            ..Self::default()
        }
    }

    /// Apply attribute tokens. Returns true when the last attribute is a
    /// section whose content arrives as a literal.
    pub(crate) fn apply(&mut self, tokens: &[Token<'_>]) -> Result<bool> {
        let mut i = 0;
        let mut awaiting_literal = false;

        while i < tokens.len() {
            let Token::Atom(name) = &tokens[i] else {
                i += 1;
                continue;
            };
            let name = name.to_ascii_uppercase();
            i += 1;

            match name.as_str() {
                "UID" => {
                    self.uid = Some(parse_number(tokens.get(i), "UID")?);
                    i += 1;
                }
                "RFC822.SIZE" => {
                    self.size = Some(parse_number(tokens.get(i), "RFC822.SIZE")?);
                    i += 1;
                }
                "FLAGS" => {
                    if tokens.get(i) != Some(&Token::Open) {
                        return Err(SyncError::protocol("FLAGS without list"));
                    }
                    i += 1;
                    let mut flags = ServerFlags::empty();
                    while let Some(Token::Atom(flag)) = tokens.get(i) {
                        flags |= ServerFlags::from_atom(flag);
                        i += 1;
                    }
                    if tokens.get(i) == Some(&Token::Close) {
                        i += 1;
                    }
                    self.flags = Some(flags);
                }
                "MODSEQ" => {
                    if tokens.get(i) != Some(&Token::Open) {
                        return Err(SyncError::protocol("MODSEQ without list"));
                    }
                    self.modseq = Some(parse_number(tokens.get(i + 1), "MODSEQ")?);
                    i += 2;
                    if tokens.get(i) == Some(&Token::Close) {
                        i += 1;
                    }
                }
                section if section.starts_with("BODY[") || section.starts_with("RFC822") => {
                    match tokens.get(i) {
                        Some(Token::Literal(_)) => {
                            awaiting_literal = i + 1 == tokens.len();
                            i += 1;
                        }
                        Some(Token::Quoted(content)) => {
                            self.body = Some(content.as_bytes().to_vec());
                            i += 1;
                        }
                        Some(Token::Atom(nil)) if nil.eq_ignore_ascii_case("NIL") => i += 1,
                        _ => return Err(SyncError::protocol(format!("{} without content", section))),
                    }
                }
                _ => {}
            }
        }

        Ok(awaiting_literal)
    }
}
