//! RFC 5322 assembly of the outgoing HTML message.

use base64::engine::general_purpose::STANDARD;
use base64::engine::Engine;

use crate::error::SendError;

const CRLF: &str = "\r\n";
const BODY_LINE_LENGTH: usize = 76;
// Keeps each `=?utf-8?b?...?=` word within 75 characters.
const ENCODED_WORD_BYTES: usize = 45;

/// Builds a single-part `text/html` message with a base64 body.
///
/// `subject` and `to` come first, then `headers` in the given order.
pub fn compose_html_message(
    to: &str,
    subject: &str,
    html: &str,
    headers: &[(String, String)],
) -> Result<Vec<u8>, SendError> {
    let mut message = String::with_capacity(html.len() * 4 / 3 + 256);

    push_header(&mut message, "Content-Type", "text/html; charset=\"utf-8\"")?;
    push_header(&mut message, "MIME-Version", "1.0")?;
    push_header(&mut message, "Content-Transfer-Encoding", "base64")?;
    push_header(&mut message, "Subject", subject)?;
    push_header(&mut message, "To", to)?;
    for (name, value) in headers {
        push_header(&mut message, name, value)?;
    }

    message.push_str(CRLF);
    let encoded = STANDARD.encode(html.as_bytes());
    // Base64 output is ASCII, so byte chunks are valid UTF-8.
    for line in encoded.as_bytes().chunks(BODY_LINE_LENGTH) {
        message.push_str(&String::from_utf8_lossy(line));
        message.push_str(CRLF);
    }

    Ok(message.into_bytes())
}

fn push_header(message: &mut String, name: &str, value: &str) -> Result<(), SendError> {
    validate_header(name, value)?;
    message.push_str(name);
    message.push_str(": ");
    message.push_str(&encode_header_value(value));
    message.push_str(CRLF);
    Ok(())
}

pub fn validate_header(name: &str, value: &str) -> Result<(), SendError> {
    if name.is_empty() {
        return Err(SendError::InvalidHeader("empty header name".to_string()));
    }
    if !name.bytes().all(|b| (33..=126).contains(&b) && b != b':') {
        return Err(SendError::InvalidHeader(format!(
            "{:?} is not a valid header name",
            name
        )));
    }
    if value.contains(['\r', '\n']) {
        return Err(SendError::InvalidHeader(format!(
            "the value of {} contains a line break",
            name
        )));
    }
    Ok(())
}

/// RFC 2047 `B` encoding for values that are not plain ASCII.
pub fn encode_header_value(value: &str) -> String {
    if value.is_ascii() {
        return value.to_string();
    }

    let mut words = Vec::new();
    let mut start = 0;
    let mut end = 0;
    for (index, ch) in value.char_indices() {
        let next = index + ch.len_utf8();
        if next - start > ENCODED_WORD_BYTES {
            words.push(encoded_word(&value[start..end]));
            start = end;
        }
        end = next;
    }
    words.push(encoded_word(&value[start..end]));
    words.join("\r\n ")
}

fn encoded_word(chunk: &str) -> String {
    format!("=?utf-8?b?{}?=", STANDARD.encode(chunk.as_bytes()))
}
