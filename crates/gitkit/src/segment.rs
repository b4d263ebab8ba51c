//! Decoding of the base64url segments of a compact JWT.
use std::borrow::Cow;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed jwt segment: {0}")]
pub struct MalformedSegment(#[from] base64::DecodeError);

/// Decodes a base64url segment, adding back any padding that was stripped.
///
/// Inputs with a length of `2` or `3` (mod 4) get `==` or `=` appended,
/// anything else is decoded as is.
pub fn decode_segment(segment: &str) -> Result<Vec<u8>, MalformedSegment> {
    let padded = match segment.len() % 4 {
        2 => Cow::Owned(format!("{segment}==")),
        3 => Cow::Owned(format!("{segment}=")),
        _ => Cow::Borrowed(segment),
    };

    URL_SAFE.decode(padded.as_bytes()).map_err(MalformedSegment)
}
