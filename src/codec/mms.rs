//! MMS payloads: multipart/related, SMIL presentation part first when present.

use mail_parser::{MessagePart, PartType};

use super::headers::{self, CRLF, HeaderBlock};
use super::{
    CONTENT_TYPE_SMIL, CONTEXT_MULTIMEDIA, CodecError, HEADER_CONTENT_TYPE,
    HEADER_MESSAGE_CONTEXT, HEADER_MESSAGE_CORRELATOR, MimePart, MultimediaMessage, correlator,
};

const MULTIPART_RELATED: &str = "multipart/related";

pub(super) fn encode(message: &MultimediaMessage, boundary: &str) -> String {
    let mut mail = HeaderBlock::new();
    super::encode_envelope(&mut mail, &message.envelope);
    mail.push(HEADER_MESSAGE_CORRELATOR, correlator(&message.summary_text()));
    mail.push(HEADER_MESSAGE_CONTEXT, CONTEXT_MULTIMEDIA);
    if let Some(ref subject) = message.subject {
        mail.push("Subject", subject);
    }

    let smil = message.parts.iter().position(MimePart::is_smil);

    let mut content_type = format!("{};boundary=\"{}\"", MULTIPART_RELATED, boundary);
    if let Some(cid) = smil.and_then(|i| message.parts[i].content_id.as_deref()) {
        content_type.push_str(&format!(
            ";start={};type={}",
            angle_bracketed(cid),
            CONTENT_TYPE_SMIL
        ));
    }
    mail.push(HEADER_CONTENT_TYPE, content_type);

    let ordered = smil
        .map(|i| &message.parts[i])
        .into_iter()
        .chain(
            message
                .parts
                .iter()
                .enumerate()
                .filter(|(i, _)| Some(*i) != smil)
                .map(|(_, part)| part),
        );

    let mut body = String::new();
    for part in ordered {
        body.push_str(&format!("--{}{}", boundary, CRLF));
        let mut part_headers = HeaderBlock::new();
        part_headers.push(HEADER_CONTENT_TYPE, &part.content_type);
        if let Some(ref cid) = part.content_id {
            part_headers.push("Content-ID", cid);
        }
        if let Some(ref encoding) = part.transfer_encoding {
            part_headers.push("Content-Transfer-Encoding", encoding);
        }
        body.push_str(&format!("{part_headers}{CRLF}{}{CRLF}", part.content));
    }
    body.push_str(&format!("--{}--{}", boundary, CRLF));

    format!("{mail}{CRLF}{body}")
}

/// `parts` is the part tree `mail-parser` built from `raw`; part bodies are
/// sliced from `raw` so their transfer encoding is kept.
pub(super) fn decode(
    mail: &HeaderBlock,
    raw: &[u8],
    parts: &[MessagePart<'_>],
) -> Result<MultimediaMessage, CodecError> {
    let envelope = super::decode_envelope(mail)?;

    let content_type = mail.require(HEADER_CONTENT_TYPE)?;
    if !headers::media_type(content_type).eq_ignore_ascii_case(MULTIPART_RELATED) {
        return Err(CodecError::UnsupportedContent(content_type.to_string()));
    }
    headers::content_type_param(content_type, "boundary")
        .filter(|b| !b.is_empty())
        .ok_or(CodecError::MissingBoundary)?;

    let children = match parts.first().map(|root| &root.body) {
        Some(PartType::Multipart(children)) => children,
        _ => {
            return Err(CodecError::UnsupportedContent(
                "multipart body without parts".to_string(),
            ));
        }
    };

    let decoded = children
        .iter()
        .filter_map(|id| parts.get(*id as usize))
        .map(|part| parse_part(raw, part))
        .collect::<Result<Vec<_>, _>>()?;

    if decoded.is_empty() {
        return Err(CodecError::UnsupportedContent(
            "multipart body without parts".to_string(),
        ));
    }

    Ok(MultimediaMessage {
        envelope,
        subject: mail.get("Subject").map(str::to_string),
        parts: decoded,
    })
}

fn parse_part(raw: &[u8], part: &MessagePart<'_>) -> Result<MimePart, CodecError> {
    let part_headers = HeaderBlock::from_part(raw, &part.headers)?;
    let content =
        std::str::from_utf8(super::part_body(raw, part)).map_err(|_| CodecError::Charset)?;

    // The line break before a delimiter belongs to the delimiter.
    let tail = raw.get(part.offset_end as usize..).unwrap_or_default();
    let content = if tail.starts_with(b"--") {
        headers::strip_one_terminator(content)
    } else {
        content
    };

    Ok(MimePart {
        content_type: part_headers.require(HEADER_CONTENT_TYPE)?.to_string(),
        content_id: part_headers.get("Content-ID").map(str::to_string),
        transfer_encoding: part_headers
            .get("Content-Transfer-Encoding")
            .map(str::to_string),
        content: content.to_string(),
    })
}

fn angle_bracketed(cid: &str) -> String {
    if cid.starts_with('<') {
        cid.to_string()
    } else {
        format!("<{}>", cid)
    }
}
