//! The wire protocol of the chat: UTF-8 text, `|`-delimited fields.
//!
//! First field is the type tag. Each following field is either `key=value`
//! (a header, value percent-escaped) or a bare percent-escaped string with
//! no `=` (the payload). The format is an interoperability contract and must
//! stay bit-compatible across implementations.

use crate::utils::misc::{get_unix_millis_now, Typename};
use std::collections::HashMap;

pub const TYPE_CHAT: &str = "CHAT";
pub const TYPE_HELLO: &str = "HELLO";
pub const TYPE_MBLOCK: &str = "MBLOCK";
pub const TYPE_MUNBLOCK: &str = "MUNBLOCK";

pub const H_ID: &str = "id";
pub const H_TS: &str = "ts";
pub const H_NICK: &str = "nick";
pub const H_GROUP: &str = "grp";
pub const H_HOST: &str = "host";
pub const H_TARGET: &str = "target";

#[derive(Debug, thiserror::Error, strum_macros::IntoStaticStr)]
pub enum Error {
    #[error("empty packet")]
    Empty,
    #[error("missing type tag")]
    MissingType,
}

impl Typename for Error {
    fn typename(&self) -> &'static str {
        self.into()
    }
}

/// A decoded (or to-be-encoded) message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: String,
    pub headers: HashMap<String, String>,
    pub payload: String,
}

impl Message {
    pub fn new(msg_type: &str, headers: HashMap<String, String>, payload: &str) -> Self {
        Self { msg_type: msg_type.to_string(), headers, payload: payload.to_string() }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn id(&self) -> Option<&str> {
        self.header(H_ID)
    }
}

/// Fresh dedup id, unique per send: epoch millis and a random u32, both hex.
pub fn next_message_id() -> String {
    format!("{:x}-{:x}", get_unix_millis_now(), rand::random::<u32>())
}

/// Encode a message for transmission. An empty payload is omitted entirely.
pub fn encode(msg_type: &str, headers: &HashMap<String, String>, payload: &str) -> Vec<u8> {
    let mut out = String::with_capacity(msg_type.len() + payload.len() + headers.len() * 16);
    out.push_str(msg_type);
    for (key, value) in headers {
        out.push('|');
        out.push_str(key);
        out.push('=');
        out.push_str(&escape(value));
    }
    if !payload.is_empty() {
        out.push('|');
        out.push_str(&escape(payload));
    }
    out.into_bytes()
}

/// Decode a datagram. Never panics past this boundary: malformed input is a
/// decode failure the caller silently drops, since garbage from strangers is
/// expected on a shared segment.
pub fn decode(data: &[u8]) -> Result<Message, Error> {
    if data.is_empty() {
        return Err(Error::Empty);
    }
    let text = String::from_utf8_lossy(data);
    let mut parts = text.split('|');
    let msg_type = parts.next().unwrap_or("");
    if msg_type.is_empty() {
        return Err(Error::MissingType);
    }

    let mut headers = HashMap::new();
    let mut payload = String::new();
    for part in parts {
        match part.find('=') {
            Some(sep) if sep > 0 => {
                headers.insert(part[..sep].to_string(), unescape(&part[sep + 1..]));
            }
            _ => payload = unescape(part),
        }
    }
    Ok(Message { msg_type: msg_type.to_string(), headers, payload })
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~')
}

/// Percent-escape every byte outside the unreserved set, uppercase hex.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for &b in value.as_bytes() {
        if is_unreserved(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Reverse of [`escape`]. Any `%XX` triplet becomes one byte; everything
/// else passes through unchanged, including stray `%` without two hex
/// digits behind it.
pub fn unescape(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(byte) = hex_pair(bytes.get(i + 1).copied(), bytes.get(i + 2).copied()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_pair(hi: Option<u8>, lo: Option<u8>) -> Option<u8> {
    let hi = (hi? as char).to_digit(16)?;
    let lo = (lo? as char).to_digit(16)?;
    Some((hi as u8) << 4 | lo as u8)
}
