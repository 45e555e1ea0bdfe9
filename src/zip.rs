//! Gzip body compression.
//!
//! Only the body region of a message is ever compressed; the properties
//! block and its length prefix always travel in the clear. The compressed
//! form is adopted only when it is strictly smaller than the plain body,
//! otherwise the sender ships the plain bytes and clears the Compressed
//! flag.

use std::io::{self, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Upper bound on a message body, matching the 32-bit length arithmetic of
/// the wire accounting (ACK counters are cumulative byte counts).
pub(crate) const MAX_BODY_SIZE: u64 = u32::MAX as u64;

/// Gzip `body`, returning the compressed bytes only when they win.
pub(crate) fn compress_body(body: &[u8]) -> Option<Vec<u8>> {
    if body.is_empty() {
        return None;
    }
    let mut encoder = GzEncoder::new(
        Vec::with_capacity(body.len() / 2 + 64),
        Compression::default(),
    );
    encoder.write_all(body).ok()?;
    let compressed = encoder.finish().ok()?;
    if compressed.len() < body.len() {
        Some(compressed)
    } else {
        None
    }
}

/// Decompress a gzipped body region.
///
/// Fails on malformed input and on bodies that inflate past
/// [`MAX_BODY_SIZE`]; the caller turns either case into an error-typed
/// message rather than a dead connection.
pub(crate) fn decompress_body(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut limited = GzDecoder::new(data).take(MAX_BODY_SIZE + 1);
    limited.read_to_end(&mut out)?;
    if out.len() as u64 > MAX_BODY_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "decompressed body exceeds the protocol size limit",
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressible_body_roundtrips() {
        let body = vec![b'A'; 500_000];
        let compressed = compress_body(&body).expect("500k of 'A' should compress");
        assert!(compressed.len() < body.len());
        assert!(compressed.len() < 10 * 1024);
        let restored = decompress_body(&compressed).unwrap();
        assert_eq!(restored, body);
    }

    #[test]
    fn incompressible_body_is_rejected() {
        // A short pseudo-random buffer; gzip overhead makes it grow.
        let mut state = 0x2545f4914f6cdd1du64;
        let body: Vec<u8> = (0..64)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        assert_eq!(compress_body(&body), None);
    }

    #[test]
    fn empty_body_is_rejected() {
        assert_eq!(compress_body(&[]), None);
    }

    #[test]
    fn garbage_fails_to_decompress() {
        let err = decompress_body(b"definitely not a gzip stream").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_stream_fails() {
        let body = vec![b'B'; 4096];
        let compressed = compress_body(&body).unwrap();
        assert!(decompress_body(&compressed[..compressed.len() / 2]).is_err());
    }
}
