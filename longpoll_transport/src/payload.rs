//! Incoming payloads and body decoding.
//!
//! A response body is either delivered untouched (opaque-binary content
//! type) or decoded as text using the charset declared in its content type.

use alloc::{
    string::{String, ToString},
    vec::Vec,
};

use encoding_rs::Encoding;
use mime::Mime;

use crate::{DEFAULT_CHARSET, OCTET_STREAM, error::DecodeError};

/// The payload of a `data` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Raw bytes, exactly as received.
    Binary(Vec<u8>),

    /// Decoded text.
    Text(String),
}

impl Payload {
    /// Whether this is a binary payload.
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        matches!(self, Payload::Binary(_))
    }

    /// The text, if this is a text payload.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            Payload::Binary(_) => None,
        }
    }

    /// The bytes, if this is a binary payload.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Binary(b) => Some(b),
            Payload::Text(_) => None,
        }
    }

    /// Decode a body according to its content type.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the body is not valid text in its declared
    /// charset, or if that charset is unsupported.
    pub fn decode(content_type: Option<&str>, body: Vec<u8>) -> Result<Self, DecodeError> {
        // Unparseable content types are treated like a missing one.
        let Some(media) = content_type.and_then(|raw| raw.parse::<Mime>().ok()) else {
            return decode_text(DEFAULT_CHARSET, &body).map(Payload::Text);
        };

        if media.essence_str() == OCTET_STREAM {
            return Ok(Payload::Binary(body));
        }

        let label = media
            .get_param(mime::CHARSET)
            .map_or(DEFAULT_CHARSET, |name| name.as_str());
        decode_text(label, &body).map(Payload::Text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

fn decode_text(label: &str, body: &[u8]) -> Result<String, DecodeError> {
    let label = label.trim().trim_matches('"');
    let encoding = Encoding::for_label(label.as_bytes())
        .ok_or_else(|| DecodeError::UnsupportedCharset(label.to_string()))?;
    encoding
        .decode_without_bom_handling_and_without_replacement(body)
        .map(|text| text.into_owned())
        .ok_or_else(|| DecodeError::InvalidText {
            charset: encoding.name().to_string(),
        })
}
