//! Message correlator: a content-only fingerprint written on push and used by
//! `UID SEARCH HEADER Message-Correlator` and header matching to locate a
//! pushed message whose UID is not yet known. Both sides must call
//! [`correlator`] so the values compare equal.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Maximum length, in UTF-16 code units, of the text the correlator covers.
pub const MAX_CORRELATOR_UNITS: usize = 160;

pub fn correlator(text: &str) -> String {
    let collapsed = collapse_line_breaks(truncate_utf16(text, MAX_CORRELATOR_UNITS));

    if collapsed.chars().all(|c| matches!(c, ' '..='~')) {
        collapsed
    } else {
        format!("=?utf-8?b?{}?=", STANDARD.encode(collapsed.as_bytes()))
    }
}

/// Longest prefix that fits in `max_units` UTF-16 units without splitting a
/// surrogate pair.
fn truncate_utf16(text: &str, max_units: usize) -> &str {
    let mut units = 0;
    for (index, ch) in text.char_indices() {
        units += ch.len_utf16();
        if units > max_units {
            return &text[..index];
        }
    }
    text
}

/// CRLF, CR and LF each become a single space.
fn collapse_line_breaks(text: &str) -> String {
    text.replace("\r\n", " ").replace(['\r', '\n'], " ")
}
