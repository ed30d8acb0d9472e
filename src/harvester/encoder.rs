// SPDX-License-Identifier: Apache-2.0

//! Field extraction and JSON encoding of events.
//!
//! Events are written straight into a byte buffer instead of going through a
//! generic serializer, since this runs once per shipped record.
//!
//! Field extraction:
//!
//! - no field names configured: the whole text becomes `message`
//! - the trimmed text is split by the delimiter; when the token count equals
//!   the number of field names, each token is assigned to its name
//! - otherwise the whole text is kept as `message`. If `exact_match` is off and
//!   there are more tokens than names, the first tokens are *also* assigned to
//!   the names and the surplus tokens are dropped. This partial enrichment is
//!   kept for compatibility with existing consumers; it is not a full parse.
//!
//! Static fields follow (replacing the value of an earlier field with the same
//! key, in place), then `path` unless the source suppresses it.

use crate::harvester::event::Event;

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Encode an event as a single-line JSON object
pub fn encode(event: &Event) -> String {
    let buf = encode_to_vec(event);
    // Only valid UTF-8 is ever written to the buffer
    match String::from_utf8(buf) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

/// Encode an event as a single-line JSON object into a new buffer
pub fn encode_to_vec(event: &Event) -> Vec<u8> {
    let mut buf = Vec::with_capacity(event.text.len() + 64);
    encode_into(event, &mut buf);
    buf
}

/// Append the JSON encoding of an event to `out`
pub fn encode_into(event: &Event, out: &mut Vec<u8>) {
    let fields = extract_fields(event);

    out.push(b'{');
    for (idx, (key, value)) in fields.entries.iter().enumerate() {
        if idx > 0 {
            out.push(b',');
        }
        write_json_string(out, key);
        out.push(b':');
        write_json_string(out, value);
    }
    out.push(b'}');
}

/// Ordered field list where setting an existing key replaces its value in place
struct Fields<'a> {
    entries: Vec<(&'a [u8], &'a [u8])>,
}

impl<'a> Fields<'a> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    fn set(&mut self, key: &'a [u8], value: &'a [u8]) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }
}

fn extract_fields(event: &Event) -> Fields<'_> {
    let config = &*event.config;
    let mut fields = Fields::with_capacity(config.field_names.len() + config.fields.len() + 2);

    match config.delimiter.as_ref() {
        Some(delimiter) if !config.field_names.is_empty() => {
            let tokens: Vec<&[u8]> = delimiter.split(event.text.trim_ascii()).collect();
            let names = &config.field_names;

            if tokens.len() == names.len() {
                for (name, token) in names.iter().zip(tokens.iter().copied()) {
                    fields.set(name.as_bytes(), trim_quote(token, config.quote_char));
                }
            } else {
                fields.set(b"message", &event.text);
                if !config.exact_match && tokens.len() > names.len() {
                    for (name, token) in names.iter().zip(tokens.iter().copied()) {
                        fields.set(name.as_bytes(), trim_quote(token, config.quote_char));
                    }
                }
            }
        }
        _ => fields.set(b"message", &event.text),
    }

    for (key, value) in &config.fields {
        fields.set(key.as_bytes(), value.as_bytes());
    }

    if !config.no_path {
        fields.set(b"path", event.source.as_bytes());
    }

    fields
}

/// Strip every leading and trailing occurrence of the quote character
fn trim_quote(token: &[u8], quote: Option<u8>) -> &[u8] {
    let Some(q) = quote else {
        return token;
    };

    let start = token.iter().position(|b| *b != q).unwrap_or(token.len());
    let end = token.iter().rposition(|b| *b != q).map_or(start, |i| i + 1);
    &token[start..end]
}

/// Write `s` as a quoted JSON string.
///
/// Control characters, quotes, backslashes and `<`, `>`, `&` are escaped,
/// U+2028 and U+2029 are escaped, and each invalid UTF-8 byte becomes
/// U+FFFD. Everything else is copied verbatim.
pub fn write_json_string(out: &mut Vec<u8>, s: &[u8]) {
    out.push(b'"');

    for chunk in s.utf8_chunks() {
        write_valid(out, chunk.valid().as_bytes());
        for _ in chunk.invalid() {
            out.extend_from_slice(b"\\ufffd");
        }
    }

    out.push(b'"');
}

fn write_valid(out: &mut Vec<u8>, s: &[u8]) {
    let mut start = 0;
    let mut i = 0;

    while i < s.len() {
        let b = s[i];

        if b < 0x80 {
            if b >= 0x20 && b != b'"' && b != b'\\' && b != b'<' && b != b'>' && b != b'&' {
                i += 1;
                continue;
            }

            out.extend_from_slice(&s[start..i]);
            match b {
                b'"' | b'\\' => {
                    out.push(b'\\');
                    out.push(b);
                }
                b'\n' => out.extend_from_slice(b"\\n"),
                b'\r' => out.extend_from_slice(b"\\r"),
                b'\t' => out.extend_from_slice(b"\\t"),
                _ => {
                    out.extend_from_slice(b"\\u00");
                    out.push(HEX[(b >> 4) as usize]);
                    out.push(HEX[(b & 0xF) as usize]);
                }
            }
            i += 1;
            start = i;
            continue;
        }

        // U+2028 / U+2029 encode as E2 80 A8 / E2 80 A9
        if b == 0xE2 && i + 2 < s.len() && s[i + 1] == 0x80 && (s[i + 2] & 0xFE) == 0xA8 {
            out.extend_from_slice(&s[start..i]);
            out.extend_from_slice(b"\\u202");
            out.push(HEX[(s[i + 2] & 0x0F) as usize]);
            i += 3;
            start = i;
            continue;
        }

        i += 1;
    }

    out.extend_from_slice(&s[start..]);
}
