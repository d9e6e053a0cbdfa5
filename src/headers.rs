//! Header metadata parsing and filename derivation (spec §4.10, §6).
//!
//! Extracts just enough of RFC 5322 / RFC 2047 to name a file:
//! unfold continuation lines, decode encoded-words in `Subject`/`From`,
//! tolerantly parse `Date`, and derive a bounded filesystem-safe slug.

use chrono::{DateTime, Utc};

use crate::constants::MAX_SLUG_LEN;

#[derive(Debug, Clone, Default)]
pub struct MessageMetadata {
    pub from: Option<String>,
    pub subject: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

/// Unfold RFC 5322 header folding: a CRLF followed by a space or tab is
/// part of the same header value, not a line break.
fn unfold(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\r' {
            continue;
        }
        if c == '\n' {
            match chars.peek() {
                Some(' ') | Some('\t') => {
                    out.push(' ');
                }
                _ => out.push('\n'),
            }
            continue;
        }
        out.push(c);
    }
    out
}

/// Decode RFC 2047 encoded-words (`=?charset?Q|B?text?=`). Unknown charsets
/// and malformed words are left verbatim rather than erroring -- filenames
/// must always be derivable, even from malformed mail.
fn decode_encoded_words(input: &str) -> String {
    let mut out = String::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if input[i..].starts_with("=?") {
            if let Some(decoded) = try_decode_one_word(&input[i..]) {
                out.push_str(&decoded.0);
                i += decoded.1;
                continue;
            }
        }
        let ch = input[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// Returns `(decoded text, byte length of the encoded-word consumed)`.
fn try_decode_one_word(s: &str) -> Option<(String, usize)> {
    let rest = &s[2..];
    let mut parts = rest.splitn(3, '?');
    let _charset = parts.next()?;
    let encoding = parts.next()?;
    let remainder = parts.next()?;
    let end = remainder.find("?=")?;
    let payload = &remainder[..end];

    let decoded_bytes = match encoding.to_ascii_uppercase().as_str() {
        "Q" => decode_q(payload),
        "B" => base64::Engine::decode(&base64::engine::general_purpose::STANDARD, payload).ok()?,
        _ => return None,
    };
    let text = String::from_utf8_lossy(&decoded_bytes).into_owned();

    let consumed = 2 + _charset.len() + 1 + encoding.len() + 1 + end + 2;
    Some((text, consumed))
}

fn decode_q(payload: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    let bytes = payload.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                out.push(b' ');
                i += 1;
            }
            b'=' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(&payload[i + 1..i + 3], 16) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

/// Known `Date:` header formats, tried in order. Falls back to the fetch
/// time for anything else (spec §4.10 edge case).
const DATE_FORMATS: &[&str] = &[
    "%a, %d %b %Y %H:%M:%S %z",
    "%d %b %Y %H:%M:%S %z",
    "%a, %d %b %Y %H:%M:%S %Z",
    "%Y-%m-%dT%H:%M:%S%z",
];

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    for fmt in DATE_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(trimmed, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    chrono::DateTime::parse_from_rfc2822(trimmed)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Extract a single header's value (unfolded, decoded-word resolved) from a
/// raw header block by name, case-insensitively.
fn extract_header<'a>(unfolded: &'a str, name: &str) -> Option<&'a str> {
    let prefix = format!("{name}:");
    unfolded.lines().find_map(|line| {
        if line.len() > prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(&prefix) {
            Some(line[prefix.len()..].trim())
        } else {
            None
        }
    })
}

pub fn parse_metadata(raw_headers: &[u8]) -> MessageMetadata {
    let text = String::from_utf8_lossy(raw_headers);
    let unfolded = unfold(&text);

    let from = extract_header(&unfolded, "From").map(|s| decode_encoded_words(s));
    let subject = extract_header(&unfolded, "Subject").map(|s| decode_encoded_words(s));
    let date = extract_header(&unfolded, "Date").and_then(parse_date);

    MessageMetadata {
        from,
        subject,
        date,
    }
}

/// Derive the sender-slug component of a filename: lowercase, collapse any
/// run of non-`[a-z0-9]` bytes to a single underscore, trim leading/trailing
/// underscores, truncate to `MAX_SLUG_LEN`. Empty or entirely-unsafe input
/// becomes `"unknown"`.
pub fn slugify(input: &str) -> String {
    let lower = input.to_lowercase();
    let mut out = String::with_capacity(lower.len());
    let mut last_was_sep = false;
    for c in lower.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = out.trim_matches('_');
    let truncated: String = trimmed.chars().take(MAX_SLUG_LEN).collect();
    let truncated = truncated.trim_end_matches('_');
    if truncated.is_empty() {
        "unknown".to_string()
    } else {
        truncated.to_string()
    }
}

/// Build the `<uid>_<yyyyMMddHHmmss>_<slug>.eml` filename (spec §6).
/// `fallback_time` is used when `Date:` is absent or unparsable.
pub fn derive_filename(uid: u32, metadata: &MessageMetadata, fallback_time: DateTime<Utc>) -> String {
    let timestamp = metadata.date.unwrap_or(fallback_time);
    let slug_source = metadata
        .from
        .as_deref()
        .or(metadata.subject.as_deref())
        .unwrap_or("unknown");
    let slug = slugify(slug_source);
    format!("{}_{}_{}.eml", uid, timestamp.format("%Y%m%d%H%M%S"), slug)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unfold_joins_continuation_lines() {
        let raw = "Subject: hello\r\n world\r\nFrom: a@b.com\r\n";
        let unfolded = unfold(raw);
        assert!(unfolded.contains("Subject: hello world"));
    }

    #[test]
    fn decodes_q_encoded_word() {
        let decoded = decode_encoded_words("=?UTF-8?Q?Caf=C3=A9?=");
        assert_eq!(decoded, "Café");
    }

    #[test]
    fn decodes_b_encoded_word() {
        let decoded = decode_encoded_words("=?UTF-8?B?SGVsbG8=?=");
        assert_eq!(decoded, "Hello");
    }

    #[test]
    fn parses_rfc5322_date() {
        let dt = parse_date("Mon, 1 Jan 2024 10:00:00 +0000").unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2024-01-01");
    }

    #[test]
    fn slugify_collapses_and_truncates() {
        assert_eq!(slugify("John Doe <john@example.com>"), "john_doe_john_example_com");
        assert_eq!(slugify("***"), "unknown");
        let long = "a".repeat(100);
        assert_eq!(slugify(&long).len(), MAX_SLUG_LEN);
    }

    #[test]
    fn derive_filename_falls_back_to_fetch_time_when_no_date() {
        let metadata = MessageMetadata {
            from: Some("Jane <jane@example.com>".into()),
            subject: None,
            date: None,
        };
        let fallback = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let name = derive_filename(42, &metadata, fallback);
        assert!(name.starts_with("42_"));
        assert!(name.ends_with(".eml"));
    }
}
