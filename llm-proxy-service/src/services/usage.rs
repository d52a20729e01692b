//! Prepares upstream response bodies for usage parsing.

use flate2::read::GzDecoder;
use http::{header::CONTENT_ENCODING, HeaderMap};
use std::borrow::Cow;
use std::io::Read;

const GZIP: &str = "gzip";

/// Whether any `Content-Encoding` value names gzip (case-insensitive).
pub fn is_gzip_encoded(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONTENT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.to_ascii_lowercase().contains(GZIP))
}

/// The body to hand to usage parsing.
///
/// Gzip bodies are inflated. If inflation fails the raw bytes are returned
/// unchanged; parsing them then yields "no usage" or a parse error, both of
/// which the caller only logs.
pub fn decode_body<'a>(headers: &HeaderMap, body: &'a [u8]) -> Cow<'a, [u8]> {
    if !is_gzip_encoded(headers) {
        return Cow::Borrowed(body);
    }

    let mut decompressed = Vec::with_capacity(body.len().saturating_mul(4));
    match GzDecoder::new(body).read_to_end(&mut decompressed) {
        Ok(_) => {
            tracing::debug!(
                compressed = body.len(),
                decompressed = decompressed.len(),
                "Decompressed upstream response for usage parsing"
            );
            Cow::Owned(decompressed)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to decompress upstream response; parsing raw body");
            Cow::Borrowed(body)
        }
    }
}
