//! Wire codec for the payloads stored on the CMS server.
//!
//! This module is split into:
//! - `mod.rs` - Message types, error type, and the encode/decode entry points
//! - `headers.rs` - Header blocks, blank-line splitting, tel URIs, dates
//! - `text.rs` - SMS and chat payloads (CPIM wrapped, base64 transfer encoded)
//! - `mms.rs` - MMS payloads (multipart/related with optional SMIL start part)
//! - `correlator.rs` - Content fingerprint used to locate pushed messages

mod correlator;
mod headers;
mod mms;
mod text;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MessagePart};
use thiserror::Error;

use crate::clock::Clock;

pub use correlator::{MAX_CORRELATOR_UNITS, correlator};
pub use headers::HeaderBlock;

pub const HEADER_MESSAGE_CORRELATOR: &str = "Message-Correlator";
pub const HEADER_IMDN_MESSAGE_ID: &str = "IMDN-Message-ID";
pub const HEADER_MESSAGE_CONTEXT: &str = "Message-Context";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";

pub const CONTEXT_PAGER: &str = "pager-message";
pub const CONTEXT_MULTIMEDIA: &str = "multimedia-message";

pub const CONTENT_TYPE_CPIM: &str = "Message/CPIM";
pub const CONTENT_TYPE_SMIL: &str = "application/smil";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("missing header {0}")]
    MissingHeader(&'static str),

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("unsupported content: {0}")]
    UnsupportedContent(String),

    #[error("multipart body without boundary")]
    MissingBoundary,

    #[error("no blank line separating headers from body")]
    MissingSeparator,

    #[error("invalid base64 payload: {0}")]
    Base64(String),

    #[error("payload is not valid UTF-8")]
    Charset,

    #[error("payload is not a mail message")]
    Unparsable,
}

/// The message families the store and the server exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Sms,
    Mms,
    Chat,
}

impl MessageKind {
    pub const ALL: [MessageKind; 3] = [MessageKind::Sms, MessageKind::Mms, MessageKind::Chat];

    /// Whether the kind belongs to the "xms" (SMS/MMS) sync mode group.
    pub fn is_xms(self) -> bool {
        matches!(self, MessageKind::Sms | MessageKind::Mms)
    }

    /// Classify a payload from its mail-level headers.
    pub fn detect(headers: &HeaderBlock) -> Result<Self, CodecError> {
        match headers.get(HEADER_MESSAGE_CONTEXT) {
            Some(ctx) if ctx.eq_ignore_ascii_case(CONTEXT_PAGER) => Ok(MessageKind::Sms),
            Some(ctx) if ctx.eq_ignore_ascii_case(CONTEXT_MULTIMEDIA) => Ok(MessageKind::Mms),
            Some(ctx) => Err(CodecError::UnsupportedContent(format!(
                "message context {}",
                ctx
            ))),
            None => {
                let content_type = headers
                    .get(HEADER_CONTENT_TYPE)
                    .ok_or(CodecError::MissingHeader(HEADER_CONTENT_TYPE))?;
                if headers::media_type(content_type).eq_ignore_ascii_case(CONTENT_TYPE_CPIM) {
                    Ok(MessageKind::Chat)
                } else {
                    Err(CodecError::UnsupportedContent(content_type.to_string()))
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }

    fn parse(value: &str) -> Result<Self, CodecError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sent" => Ok(Direction::Sent),
            "received" => Ok(Direction::Received),
            other => Err(CodecError::MalformedHeader(format!(
                "Message-Direction: {}",
                other
            ))),
        }
    }
}

/// Addressing and identity shared by every message kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Sender number, without the `tel:` scheme.
    pub from: String,
    /// Recipient number, without the `tel:` scheme.
    pub to: String,
    pub date: DateTime<Utc>,
    pub direction: Direction,
    pub conversation_id: Option<String>,
    pub contribution_id: Option<String>,
    pub imdn_message_id: Option<String>,
}

impl Envelope {
    /// The remote party: the recipient of sent messages, the sender otherwise.
    pub fn contact(&self) -> &str {
        match self.direction {
            Direction::Sent => &self.to,
            Direction::Received => &self.from,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    pub envelope: Envelope,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimePart {
    pub content_type: String,
    pub content_id: Option<String>,
    pub transfer_encoding: Option<String>,
    /// Content exactly as it travels on the wire.
    pub content: String,
}

impl MimePart {
    pub fn text(content_type: &str, content_id: Option<&str>, text: &str) -> Self {
        Self {
            content_type: content_type.to_string(),
            content_id: content_id.map(str::to_string),
            transfer_encoding: None,
            content: text.to_string(),
        }
    }

    /// Binary part, carried base64 encoded.
    pub fn binary(content_type: &str, content_id: Option<&str>, data: &[u8]) -> Self {
        Self {
            content_type: content_type.to_string(),
            content_id: content_id.map(str::to_string),
            transfer_encoding: Some("base64".to_string()),
            content: headers::wrap_base64(data),
        }
    }

    pub fn is_smil(&self) -> bool {
        headers::media_type(&self.content_type).eq_ignore_ascii_case(CONTENT_TYPE_SMIL)
    }

    pub fn is_text(&self) -> bool {
        headers::media_type(&self.content_type).eq_ignore_ascii_case("text/plain")
    }

    /// Content with the transfer encoding removed.
    pub fn decoded(&self) -> Result<Vec<u8>, CodecError> {
        match self.transfer_encoding.as_deref() {
            Some(enc) if enc.eq_ignore_ascii_case("base64") => decode_base64(&self.content),
            _ => Ok(self.content.as_bytes().to_vec()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultimediaMessage {
    pub envelope: Envelope,
    pub subject: Option<String>,
    pub parts: Vec<MimePart>,
}

impl MultimediaMessage {
    /// Text used for the correlator: first text part, else the subject.
    pub fn summary_text(&self) -> String {
        self.parts
            .iter()
            .find(|p| p.is_text())
            .and_then(|p| p.decoded().ok())
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .or_else(|| self.subject.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmsMessage {
    Sms(TextMessage),
    Chat(TextMessage),
    Mms(MultimediaMessage),
}

impl CmsMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            CmsMessage::Sms(_) => MessageKind::Sms,
            CmsMessage::Chat(_) => MessageKind::Chat,
            CmsMessage::Mms(_) => MessageKind::Mms,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        match self {
            CmsMessage::Sms(m) | CmsMessage::Chat(m) => &m.envelope,
            CmsMessage::Mms(m) => &m.envelope,
        }
    }

    /// The fingerprint written as `Message-Correlator` and used by UID SEARCH.
    pub fn correlator(&self) -> String {
        match self {
            CmsMessage::Sms(m) | CmsMessage::Chat(m) => correlator(&m.text),
            CmsMessage::Mms(m) => correlator(&m.summary_text()),
        }
    }
}

/// Encode a message into the payload APPENDed to the server.
///
/// `boundary` is only used by MMS; pass [`new_boundary`] output in production.
pub fn encode(message: &CmsMessage, boundary: &str) -> String {
    match message {
        CmsMessage::Sms(m) => text::encode(m, Some(CONTEXT_PAGER)),
        CmsMessage::Chat(m) => text::encode(m, None),
        CmsMessage::Mms(m) => mms::encode(m, boundary),
    }
}

/// Reject messages [`encode`] cannot represent faithfully.
pub fn ensure_encodable(message: &CmsMessage) -> Result<(), CodecError> {
    let CmsMessage::Mms(mms) = message else {
        return Ok(());
    };
    if mms.parts.is_empty() {
        return Err(CodecError::UnsupportedContent(
            "multimedia message without parts".to_string(),
        ));
    }
    match mms.parts.iter().find(|p| p.content_type.trim().is_empty()) {
        Some(_) => Err(CodecError::MissingHeader(HEADER_CONTENT_TYPE)),
        None => Ok(()),
    }
}

/// Decode a full payload fetched with `BODY.PEEK[]`.
pub fn decode(raw: &[u8]) -> Result<CmsMessage, CodecError> {
    if !headers::has_blank_line(raw) {
        return Err(CodecError::MissingSeparator);
    }
    let message = MessageParser::default()
        .parse(raw)
        .ok_or(CodecError::Unparsable)?;
    let root = message.parts.first().ok_or(CodecError::Unparsable)?;
    let mail = HeaderBlock::from_part(raw, &root.headers)?;

    match MessageKind::detect(&mail)? {
        MessageKind::Sms => Ok(CmsMessage::Sms(text::decode(&mail, part_body(raw, root))?)),
        MessageKind::Chat => Ok(CmsMessage::Chat(text::decode(&mail, part_body(raw, root))?)),
        MessageKind::Mms => Ok(CmsMessage::Mms(mms::decode(&mail, raw, &message.parts)?)),
    }
}

/// Parse a header block fetched with `BODY.PEEK[HEADER]`.
pub fn parse_header_block(raw: &[u8]) -> Result<HeaderBlock, CodecError> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or(CodecError::Unparsable)?;
    let root = message.parts.first().ok_or(CodecError::Unparsable)?;
    HeaderBlock::from_part(raw, &root.headers)
}

/// Body bytes of a parsed part, still transfer encoded.
fn part_body<'x>(raw: &'x [u8], part: &MessagePart<'_>) -> &'x [u8] {
    raw.get(part.offset_body as usize..part.offset_end as usize)
        .unwrap_or_default()
}

/// Time-derived multipart boundary.
///
/// Not unique when two payloads are built within the same millisecond; no
/// collision check is performed.
pub fn new_boundary(clock: &dyn Clock) -> String {
    format!("=_cms_{}", clock.now().timestamp_millis())
}

pub(crate) fn decode_base64(content: &str) -> Result<Vec<u8>, CodecError> {
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| CodecError::Base64(e.to_string()))
}

/// Shared header handling for the envelope of every kind.
fn encode_envelope(mail: &mut HeaderBlock, envelope: &Envelope) {
    mail.push("From", headers::tel_uri(&envelope.from));
    mail.push("To", headers::tel_uri(&envelope.to));
    mail.push("Date", headers::format_mail_date(&envelope.date));
    if let Some(ref id) = envelope.conversation_id {
        mail.push("Conversation-ID", id);
    }
    if let Some(ref id) = envelope.contribution_id {
        mail.push("Contribution-ID", id);
    }
    if let Some(ref id) = envelope.imdn_message_id {
        mail.push(HEADER_IMDN_MESSAGE_ID, id);
    }
    mail.push("Message-Direction", envelope.direction.as_str());
}

/// Addressing of a message from its outer mail headers.
pub fn decode_envelope(mail: &HeaderBlock) -> Result<Envelope, CodecError> {
    let from = mail.require("From")?;
    let to = mail.require("To")?;
    let date = headers::parse_mail_date(mail.require("Date")?)?;
    let direction = Direction::parse(mail.require("Message-Direction")?)?;

    Ok(Envelope {
        from: headers::parse_tel(from),
        to: headers::parse_tel(to),
        date,
        direction,
        conversation_id: mail.get("Conversation-ID").map(str::to_string),
        contribution_id: mail.get("Contribution-ID").map(str::to_string),
        imdn_message_id: mail.get(HEADER_IMDN_MESSAGE_ID).map(str::to_string),
    })
}
