//! Request body decoding

use flate2::read::GzDecoder;
use std::io::Read;

use crate::error::{SinkError, SinkResult};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Whether the body should be gunzipped, by header or by magic bytes
pub fn is_gzip(body: &[u8], content_encoding: Option<&str>) -> bool {
    let declared = content_encoding
        .map(|e| e.trim().eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);
    declared || body.starts_with(&GZIP_MAGIC)
}

/// Decode a possibly gzip-compressed body, refusing output beyond `limit` bytes
pub fn decode_body(body: &[u8], content_encoding: Option<&str>, limit: u64) -> SinkResult<Vec<u8>> {
    if !is_gzip(body, content_encoding) {
        return Ok(body.to_vec());
    }
    let mut decoded = Vec::new();
    GzDecoder::new(body)
        .take(limit.saturating_add(1))
        .read_to_end(&mut decoded)
        .map_err(|e| SinkError::Decode(format!("gzip: {e}")))?;
    if decoded.len() as u64 > limit {
        return Err(SinkError::Decode(format!("decoded body exceeds {limit} bytes")));
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_plain_body_passes_through() {
        assert_eq!(decode_body(b"{}", None, 1024).unwrap(), b"{}");
    }

    #[test]
    fn test_gzip_detected_without_header() {
        let body = gzip(br#"{"node_key":"k"}"#);
        assert_eq!(decode_body(&body, None, 1024).unwrap(), br#"{"node_key":"k"}"#);
        assert_eq!(decode_body(&body, Some("GZIP"), 1024).unwrap(), br#"{"node_key":"k"}"#);
    }

    #[test]
    fn test_gzip_limit_and_corruption() {
        let body = gzip(&[b'x'; 4096]);
        assert!(decode_body(&body, None, 100).is_err());
        assert!(decode_body(b"not gzip", Some("gzip"), 100).is_err());
    }
}
