use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, SecondsFormat, Utc};
use mail_parser::Header;

use super::CodecError;

pub(crate) const CRLF: &str = "\r\n";

/// Line length used when wrapping base64 bodies.
const BASE64_LINE_LEN: usize = 76;

/// Ordered header block with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    fields: Vec<(String, String)>,
}

impl HeaderBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &str, value: impl Into<String>) {
        self.fields.push((name.to_string(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn require(&self, name: &'static str) -> Result<&str, CodecError> {
        self.get(name).ok_or(CodecError::MissingHeader(name))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields of a part parsed by `mail-parser`. Values are taken verbatim
    /// from `raw` (unfolded), not in their decoded form, so Content-Type
    /// parameters and Content-ID brackets survive a round trip.
    pub(crate) fn from_part(raw: &[u8], fields: &[Header<'_>]) -> Result<Self, CodecError> {
        let mut block = HeaderBlock::new();
        for field in fields {
            let name = field.name.as_str();
            let value = raw
                .get(field.offset_start as usize..field.offset_end as usize)
                .ok_or_else(|| CodecError::MalformedHeader(name.to_string()))?;
            let value = std::str::from_utf8(value).map_err(|_| CodecError::Charset)?;
            block.push(name, unfold(value));
        }
        Ok(block)
    }

    /// Parse `Name: value` lines; folded continuation lines are unfolded.
    /// Used for the CPIM and inner MIME blocks, which are not RFC 5322 mail.
    pub fn parse(text: &str) -> Result<Self, CodecError> {
        let mut block = HeaderBlock::new();

        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                continue;
            }

            if line.starts_with([' ', '\t']) {
                let Some((_, value)) = block.fields.last_mut() else {
                    return Err(CodecError::MalformedHeader(line.to_string()));
                };
                value.push(' ');
                value.push_str(line.trim());
                continue;
            }

            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| CodecError::MalformedHeader(line.to_string()))?;
            let name = name.trim();
            if name.is_empty() || name.contains(' ') {
                return Err(CodecError::MalformedHeader(line.to_string()));
            }
            block.push(name, value.trim());
        }

        Ok(block)
    }
}

impl std::fmt::Display for HeaderBlock {
    /// Every field is terminated by CRLF; no trailing blank line.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (name, value) in &self.fields {
            write!(f, "{}: {}{}", name, value, CRLF)?;
        }
        Ok(())
    }
}

fn unfold(value: &str) -> String {
    value
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether a header block is followed by a blank line.
pub(crate) fn has_blank_line(raw: &[u8]) -> bool {
    raw.windows(4).any(|w| w == b"\r\n\r\n") || raw.windows(2).any(|w| w == b"\n\n")
}

/// Split at the first blank line. The header part excludes its final line
/// terminator; the body starts right after the blank line.
pub(crate) fn split_blank_line(text: &str) -> Option<(&str, &str)> {
    let crlf = text.find("\r\n\r\n").map(|i| (i, 4));
    let lf = text.find("\n\n").map(|i| (i, 2));

    let (index, sep_len) = match (crlf, lf) {
        (Some(a), Some(b)) => {
            if a.0 < b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };

    Some((&text[..index], &text[index + sep_len..]))
}

/// Remove exactly one trailing line terminator, nothing else.
pub(crate) fn strip_one_terminator(text: &str) -> &str {
    text.strip_suffix(CRLF)
        .or_else(|| text.strip_suffix('\n'))
        .unwrap_or(text)
}

/// `type/subtype` part of a Content-Type value.
pub(crate) fn media_type(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or("").trim()
}

/// Look up a Content-Type parameter, unquoting its value.
pub(crate) fn content_type_param<'a>(content_type: &'a str, name: &str) -> Option<&'a str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().trim_matches('"'))
        } else {
            None
        }
    })
}

pub(crate) fn tel_uri(number: &str) -> String {
    format!("tel:{}", number)
}

/// Accepts `tel:+1555`, `<tel:+1555>` or a bare number.
pub(crate) fn parse_tel(value: &str) -> String {
    let value = value.trim().trim_start_matches('<').trim_end_matches('>');
    value
        .strip_prefix("tel:")
        .or_else(|| value.strip_prefix("TEL:"))
        .unwrap_or(value)
        .to_string()
}

pub(crate) fn format_mail_date(date: &DateTime<Utc>) -> String {
    date.to_rfc2822()
}

pub(crate) fn parse_mail_date(value: &str) -> Result<DateTime<Utc>, CodecError> {
    DateTime::parse_from_rfc2822(value.trim())
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| CodecError::MalformedHeader(format!("Date: {}", value)))
}

pub(crate) fn format_cpim_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Base64 with CRLF line wrapping.
pub(crate) fn wrap_base64(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    let lines: Vec<&str> = encoded
        .as_bytes()
        .chunks(BASE64_LINE_LEN)
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .collect();
    lines.join(CRLF)
}
