use std::fs;
use std::io::Cursor;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat};
use mathsnap_contracts::content::{ImageReference, RawImageRef};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::ImageDecodeError;

#[derive(Debug)]
pub enum Resolution {
    /// Backend-ready payload: encoded file bytes, or a reference that was
    /// already inline base64 or a data URI.
    Resolved(String),
    /// Reading the referenced file failed; the original string goes through.
    Fallback {
        original: String,
        error: ImageDecodeError,
    },
}

impl Resolution {
    pub fn payload(&self) -> &str {
        match self {
            Resolution::Resolved(payload) => payload.as_str(),
            Resolution::Fallback { original, .. } => original.as_str(),
        }
    }

    pub fn into_payload(self) -> String {
        match self {
            Resolution::Resolved(payload) => payload,
            Resolution::Fallback { original, .. } => original,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Resolution::Fallback { .. })
    }
}

/// Never fails: a file that cannot be read degrades to the raw reference.
pub fn resolve_image(raw: &RawImageRef) -> Resolution {
    let reference = ImageReference::classify(raw.as_str(), Path::exists).normalized();
    match reference {
        ImageReference::FilePath(path) => match encode_file(&path) {
            Ok(payload) => Resolution::Resolved(payload),
            Err(error) => {
                warn!(path = %path.display(), error = %error, "image unreadable, passing reference through");
                Resolution::Fallback {
                    original: raw.as_str().to_string(),
                    error,
                }
            }
        },
        other => {
            debug!(kind = other.kind_label(), "image reference already resolved");
            Resolution::Resolved(other.into_inner())
        }
    }
}

fn encode_file(path: &Path) -> Result<String, ImageDecodeError> {
    let bytes = fs::read(path).map_err(|source| ImageDecodeError {
        path: path.to_path_buf(),
        source,
    })?;
    match image::guess_format(&bytes) {
        Ok(format) => debug!(path = %path.display(), ?format, bytes = bytes.len(), "encoded image file"),
        Err(_) => warn!(path = %path.display(), bytes = bytes.len(), "file is not a recognized image format"),
    }
    Ok(BASE64.encode(bytes))
}

/// PNG-encodes an already decoded picture into an inline payload.
pub fn encode_image(image: &DynamicImage) -> Result<String, image::ImageError> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(BASE64.encode(bytes))
}

/// Bare base64 as the backend expects it: strips a `data:image/...;base64,`
/// prefix and leaves everything else untouched.
pub fn wire_payload(payload: &str) -> &str {
    if !payload.starts_with("data:image/") {
        return payload;
    }
    match payload.split_once(',') {
        Some((metadata, data)) if metadata.ends_with(";base64") => data.trim(),
        _ => payload,
    }
}

/// Short digest for logs and events, so payloads never have to be logged.
pub fn payload_fingerprint(payload: &str) -> String {
    let digest = Sha256::digest(payload.as_bytes());
    hex::encode(&digest[..8])
}
