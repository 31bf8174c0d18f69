//! Gzip helpers

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};

pub const GZIP_ENCODING: &str = "gzip";

pub fn gzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 32), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn gunzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// True when a `Content-Encoding` value names gzip
pub fn is_gzip(content_encoding: Option<&str>) -> bool {
    content_encoding
        .map(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case(GZIP_ENCODING))
        })
        .unwrap_or(false)
}
