//! SMS and chat payloads.
//!
//! Layout: mail headers, blank line, then base64 of
//! `CPIM headers / blank / inner MIME headers / blank / text / CRLF`.

use super::headers::{self, CRLF, HeaderBlock};
use super::{
    CONTENT_TYPE_CPIM, CodecError, HEADER_CONTENT_TYPE, HEADER_MESSAGE_CONTEXT,
    HEADER_MESSAGE_CORRELATOR, TextMessage, correlator,
};

const INNER_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

pub(super) fn encode(message: &TextMessage, context: Option<&str>) -> String {
    let envelope = &message.envelope;

    let mut mail = HeaderBlock::new();
    super::encode_envelope(&mut mail, envelope);
    mail.push(HEADER_MESSAGE_CORRELATOR, correlator(&message.text));
    if let Some(context) = context {
        mail.push(HEADER_MESSAGE_CONTEXT, context);
    }
    mail.push(HEADER_CONTENT_TYPE, CONTENT_TYPE_CPIM);
    mail.push("Content-Transfer-Encoding", "base64");

    let mut cpim = HeaderBlock::new();
    cpim.push("From", format!("<{}>", headers::tel_uri(&envelope.from)));
    cpim.push("To", format!("<{}>", headers::tel_uri(&envelope.to)));
    if let Some(ref id) = envelope.imdn_message_id {
        cpim.push("imdn.Message-ID", id);
    }
    cpim.push("DateTime", headers::format_cpim_date(&envelope.date));

    let mut inner = HeaderBlock::new();
    inner.push(HEADER_CONTENT_TYPE, INNER_CONTENT_TYPE);

    let wrapped = format!("{cpim}{CRLF}{inner}{CRLF}{}{CRLF}", message.text);

    format!(
        "{mail}{CRLF}{}{CRLF}",
        headers::wrap_base64(wrapped.as_bytes())
    )
}

/// `body` is the payload after the mail headers, still transfer encoded.
pub(super) fn decode(mail: &HeaderBlock, body: &[u8]) -> Result<TextMessage, CodecError> {
    let mut envelope = super::decode_envelope(mail)?;

    let is_base64 = mail
        .get("Content-Transfer-Encoding")
        .is_some_and(|enc| enc.eq_ignore_ascii_case("base64"));

    let bytes = if is_base64 {
        let body = std::str::from_utf8(body).map_err(|_| CodecError::Charset)?;
        super::decode_base64(body)?
    } else {
        body.to_vec()
    };
    let decoded = String::from_utf8(bytes).map_err(|_| CodecError::Charset)?;

    let (cpim_text, rest) =
        headers::split_blank_line(&decoded).ok_or(CodecError::MissingSeparator)?;
    let (mime_text, content) =
        headers::split_blank_line(rest).ok_or(CodecError::MissingSeparator)?;

    let cpim = HeaderBlock::parse(cpim_text)?;
    let mime = HeaderBlock::parse(mime_text)?;

    if let Some(content_type) = mime.get(HEADER_CONTENT_TYPE)
        && !headers::media_type(content_type).eq_ignore_ascii_case("text/plain")
    {
        return Err(CodecError::UnsupportedContent(content_type.to_string()));
    }

    // The mail header carries the IMDN id for most servers; fall back to CPIM.
    if envelope.imdn_message_id.is_none() {
        envelope.imdn_message_id = cpim.get("imdn.Message-ID").map(str::to_string);
    }

    Ok(TextMessage {
        envelope,
        text: headers::strip_one_terminator(content).to_string(),
    })
}
