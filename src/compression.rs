//! gzip/deflate content codings and `Accept-Encoding` negotiation.
//!
//! Responses at or above the size threshold are compressed when the client
//! advertises support, gzip preferred. Decompression is bounded so a small
//! compressed body cannot expand past the configured body cap.

use std::io::Read;

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

use crate::http::HeaderMap;
use crate::{Error, Result};

/// Bodies smaller than this many bytes are never compressed.
pub const DEFAULT_THRESHOLD: usize = 200;

/// A supported content coding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Gzip,
    Deflate,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
        }
    }

    /// Parses a content-coding token. `x-gzip` is accepted as an alias.
    pub fn from_token(token: &str) -> Option<Encoding> {
        match token.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Encoding::Gzip),
            "deflate" => Some(Encoding::Deflate),
            _ => None,
        }
    }
}

/// Compresses `data` with the given coding.
pub fn compress(data: &[u8], encoding: Encoding) -> Result<Vec<u8>> {
    use std::io::Write;
    match encoding {
        Encoding::Gzip => {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(data)?;
            Ok(enc.finish()?)
        }
        Encoding::Deflate => {
            let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
            enc.write_all(data)?;
            Ok(enc.finish()?)
        }
    }
}

/// Decompresses `data`, failing with [`Error::LimitExceeded`] once the
/// output would exceed `max_len` bytes.
pub fn decompress(data: &[u8], encoding: Encoding, max_len: usize) -> Result<Vec<u8>> {
    let limit = max_len as u64;
    let mut out = Vec::new();
    let read = match encoding {
        Encoding::Gzip => GzDecoder::new(data)
            .take(limit + 1)
            .read_to_end(&mut out),
        Encoding::Deflate => ZlibDecoder::new(data)
            .take(limit + 1)
            .read_to_end(&mut out),
    };
    read.map_err(|e| Error::Parse(format!("invalid {} data: {e}", encoding.as_str())))?;
    if out.len() as u64 > limit {
        return Err(Error::LimitExceeded("decompressed body".into()));
    }
    Ok(out)
}

/// Picks the response coding for a request's `Accept-Encoding`, preferring
/// gzip. `None` when the client accepts neither supported coding.
pub fn negotiate(headers: &HeaderMap) -> Option<Encoding> {
    let mut deflate = false;
    for token in headers.tokens("Accept-Encoding") {
        let coding = token.split(';').next().unwrap_or("").trim();
        match Encoding::from_token(coding) {
            Some(Encoding::Gzip) => return Some(Encoding::Gzip),
            Some(Encoding::Deflate) => deflate = true,
            None => {}
        }
    }
    deflate.then_some(Encoding::Deflate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_both_codings() {
        let data = b"The quick brown fox jumps over the lazy dog".repeat(50);
        for enc in [Encoding::Gzip, Encoding::Deflate] {
            let packed = compress(&data, enc).unwrap();
            assert!(packed.len() < data.len());
            let unpacked = decompress(&packed, enc, 1024 * 1024).unwrap();
            assert_eq!(unpacked, data);
        }
    }

    #[test]
    fn bounded_decompress() {
        let data = vec![0u8; 64 * 1024];
        let packed = compress(&data, Encoding::Gzip).unwrap();
        let err = decompress(&packed, Encoding::Gzip, 1024).unwrap_err();
        assert!(matches!(err, Error::LimitExceeded(_)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(decompress(b"not compressed", Encoding::Gzip, 1024).is_err());
        assert!(decompress(b"not compressed", Encoding::Deflate, 1024).is_err());
    }

    #[test]
    fn negotiation_prefers_gzip() {
        let mut headers = HeaderMap::new();
        headers.set("Accept-Encoding", "deflate, gzip;q=0.8");
        assert_eq!(negotiate(&headers), Some(Encoding::Gzip));

        headers.set("Accept-Encoding", "deflate, br");
        assert_eq!(negotiate(&headers), Some(Encoding::Deflate));

        headers.set("Accept-Encoding", "br, zstd");
        assert_eq!(negotiate(&headers), None);

        headers.remove("Accept-Encoding");
        assert_eq!(negotiate(&headers), None);
    }
}
