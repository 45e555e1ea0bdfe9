//! Tokenized message properties.
//!
//! A message body starts with `uvarint(len)` followed by `len` bytes of
//! `name\0value\0` pairs. Certain well-known strings are abbreviated on the
//! wire as a single byte in `1..=14` indexing a fixed table. The table is
//! part of the protocol: reordering or editing it breaks compatibility with
//! every deployed peer.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;

// CHANGING THIS ARRAY BREAKS WIRE COMPATIBILITY.
pub(crate) const TOKEN_TABLE: [&str; 14] = [
    "Profile",
    "Error-Code",
    "Error-Domain",
    "Content-Type",
    "application/json",
    "application/octet-stream",
    "text/plain; charset=UTF-8",
    "text/xml",
    "Accept",
    "Cache-Control",
    "must-revalidate",
    "If-Match",
    "If-None-Match",
    "Location",
];

fn token_for(s: &str) -> Option<u8> {
    TOKEN_TABLE
        .iter()
        .position(|candidate| *candidate == s)
        .map(|i| (i + 1) as u8)
}

/// Append a property string to `out`, substituting a table token when the
/// whole string matches, always NUL-terminated.
///
/// Property strings may not contain NUL and may not begin with a control
/// byte; those byte values are reserved for tokens.
pub(crate) fn write_tokenized(out: &mut Vec<u8>, s: &str) {
    assert!(
        !s.as_bytes().contains(&0),
        "property strings may not contain NUL"
    );
    assert!(
        s.is_empty() || s.as_bytes()[0] >= 32,
        "property strings may not start with a control byte"
    );
    if let Some(token) = token_for(s) {
        out.push(token);
    } else {
        out.extend_from_slice(s.as_bytes());
    }
    out.push(0);
}

fn untokenize(field: &[u8]) -> String {
    if field.len() == 1 && (1..=TOKEN_TABLE.len() as u8).contains(&field[0]) {
        TOKEN_TABLE[(field[0] - 1) as usize].to_string()
    } else {
        String::from_utf8_lossy(field).into_owned()
    }
}

fn parse(raw: &[u8]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = raw;
    while !rest.is_empty() {
        let Some(name_end) = rest.iter().position(|b| *b == 0) else {
            break;
        };
        let name = &rest[..name_end];
        rest = &rest[name_end + 1..];
        let Some(value_end) = rest.iter().position(|b| *b == 0) else {
            // A name with no value is illegal; ignore the trailing fragment.
            break;
        };
        let value = &rest[..value_end];
        rest = &rest[value_end + 1..];
        pairs.push((untokenize(name), untokenize(value)));
    }
    pairs
}

/// The property block of a received message.
///
/// Holds the raw wire bytes and expands them into `(name, value)` pairs on
/// first access. The expansion happens at most once and is cached; clones
/// share both the raw bytes and the cache.
#[derive(Clone)]
pub struct Properties {
    raw: Bytes,
    parsed: Arc<OnceLock<Vec<(String, String)>>>,
}

impl Properties {
    pub(crate) fn from_raw(raw: Bytes) -> Properties {
        Properties {
            raw,
            parsed: Arc::new(OnceLock::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn empty() -> Properties {
        Properties::from_raw(Bytes::new())
    }

    /// All properties in wire order.
    pub fn pairs(&self) -> &[(String, String)] {
        self.parsed.get_or_init(|| parse(&self.raw))
    }

    /// The value of the first property named `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Raw serialized length in bytes.
    pub fn raw_len(&self) -> usize {
        self.raw.len()
    }
}

impl std::fmt::Debug for Properties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.pairs().iter().map(|(n, v)| (n, v)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(pairs: &[(&str, &str)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in pairs {
            write_tokenized(&mut out, name);
            write_tokenized(&mut out, value);
        }
        out
    }

    #[test]
    fn roundtrip_plain_pairs() {
        let raw = encode(&[("Sender", "tester"), ("Channel", "alpha,beta")]);
        let props = Properties::from_raw(Bytes::from(raw));
        assert_eq!(props.get("Sender"), Some("tester"));
        assert_eq!(props.get("Channel"), Some("alpha,beta"));
        assert_eq!(props.get("Missing"), None);
        assert_eq!(props.pairs().len(), 2);
    }

    #[test]
    fn tokenized_string_is_two_bytes() {
        // Every table entry abbreviates to a token byte plus its NUL.
        for entry in TOKEN_TABLE {
            let mut out = Vec::new();
            write_tokenized(&mut out, entry);
            assert_eq!(out.len(), 2, "{entry:?} should tokenize");
            assert_eq!(out[1], 0);
        }
    }

    #[test]
    fn token_substitution_roundtrips() {
        let raw = encode(&[("Profile", "application/json"), ("Error-Domain", "HTTP")]);
        // Two fully tokenized strings plus one literal.
        assert_eq!(raw.len(), 2 + 2 + 2 + 5);
        let props = Properties::from_raw(Bytes::from(raw));
        assert_eq!(props.get("Profile"), Some("application/json"));
        assert_eq!(props.get("Error-Domain"), Some("HTTP"));
    }

    #[test]
    fn token_table_is_protocol_frozen() {
        // Spot-check positions that peers depend on.
        assert_eq!(TOKEN_TABLE[0], "Profile");
        assert_eq!(TOKEN_TABLE[1], "Error-Code");
        assert_eq!(TOKEN_TABLE[2], "Error-Domain");
        assert_eq!(TOKEN_TABLE[13], "Location");
        assert_eq!(TOKEN_TABLE.len(), 14);
    }

    #[test]
    fn parse_caches_once() {
        let raw = encode(&[("Profile", "echo")]);
        let props = Properties::from_raw(Bytes::from(raw));
        let first = props.pairs().as_ptr();
        let second = props.pairs().as_ptr();
        assert_eq!(first, second);
        let clone = props.clone();
        assert_eq!(clone.pairs().as_ptr(), first);
    }

    #[test]
    fn name_without_value_stops_cleanly() {
        let mut raw = encode(&[("Profile", "echo")]);
        raw.extend_from_slice(b"Orphan\0");
        let props = Properties::from_raw(Bytes::from(raw));
        assert_eq!(props.pairs().len(), 1);
        assert_eq!(props.get("Orphan"), None);
    }

    #[test]
    fn empty_block() {
        let props = Properties::empty();
        assert!(props.pairs().is_empty());
        assert_eq!(props.raw_len(), 0);
    }

    #[test]
    #[should_panic(expected = "NUL")]
    fn nul_in_property_panics() {
        let mut out = Vec::new();
        write_tokenized(&mut out, "bad\0value");
    }

    #[test]
    #[should_panic(expected = "control byte")]
    fn control_prefix_panics() {
        let mut out = Vec::new();
        write_tokenized(&mut out, "\u{1}leading");
    }
}
