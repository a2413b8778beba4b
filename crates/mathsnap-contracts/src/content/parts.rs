use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const FILE_SCHEME: &str = "file://";
pub const DATA_IMAGE_PREFIX: &str = "data:image/";

/// Image reference exactly as it arrived at the pipeline boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawImageRef(String);

impl RawImageRef {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<&str> for RawImageRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RawImageRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    Image(RawImageRef),
}

impl ContentPart {
    pub fn text(&self) -> Option<&str> {
        match self {
            ContentPart::Text(value) => Some(value.as_str()),
            ContentPart::Image(_) => None,
        }
    }

    pub fn image(&self) -> Option<&RawImageRef> {
        match self {
            ContentPart::Text(_) => None,
            ContentPart::Image(reference) => Some(reference),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageReference {
    FilePath(PathBuf),
    FileUri(String),
    InlineBase64(String),
    DataUri(String),
}

impl ImageReference {
    /// Classifies a raw reference. `path_exists` is consulted only for
    /// strings that carry no recognizable scheme.
    pub fn classify(raw: &str, path_exists: impl FnOnce(&Path) -> bool) -> Self {
        if raw.starts_with(FILE_SCHEME) {
            return ImageReference::FileUri(raw.to_string());
        }
        if raw.starts_with(DATA_IMAGE_PREFIX) {
            return ImageReference::DataUri(raw.to_string());
        }
        let candidate = Path::new(raw);
        if !raw.is_empty() && path_exists(candidate) {
            return ImageReference::FilePath(candidate.to_path_buf());
        }
        ImageReference::InlineBase64(raw.to_string())
    }

    /// `FileUri` collapses to `FilePath`; every other variant is returned as is.
    pub fn normalized(self) -> Self {
        match self {
            ImageReference::FileUri(uri) => {
                let path = uri.strip_prefix(FILE_SCHEME).unwrap_or(uri.as_str());
                ImageReference::FilePath(PathBuf::from(path))
            }
            other => other,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            ImageReference::InlineBase64(_) | ImageReference::DataUri(_)
        )
    }

    pub fn into_inner(self) -> String {
        match self {
            ImageReference::FilePath(path) => path.to_string_lossy().into_owned(),
            ImageReference::FileUri(value)
            | ImageReference::InlineBase64(value)
            | ImageReference::DataUri(value) => value,
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            ImageReference::FilePath(_) => "file_path",
            ImageReference::FileUri(_) => "file_uri",
            ImageReference::InlineBase64(_) => "inline_base64",
            ImageReference::DataUri(_) => "data_uri",
        }
    }
}
