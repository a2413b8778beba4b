use std::path::PathBuf;

use thiserror::Error;

/// Reading or encoding a local image failed. The resolver recovers from
/// this by passing the original reference through.
#[derive(Debug, Error)]
#[error("failed to read image {}: {source}", .path.display())]
pub struct ImageDecodeError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

#[derive(Debug, Error)]
pub enum BackendCallError {
    #[error("{backend} request failed: {message}")]
    Transport { backend: String, message: String },
    #[error("{backend} returned HTTP {code}: {body}")]
    Status {
        backend: String,
        code: u16,
        body: String,
    },
    #[error("{backend} reported an error: {message}")]
    Backend { backend: String, message: String },
    #[error("{backend} returned a malformed response: {message}")]
    Malformed { backend: String, message: String },
}

impl BackendCallError {
    pub fn transport(backend: &str, err: &(dyn std::error::Error + 'static)) -> Self {
        Self::Transport {
            backend: backend.to_string(),
            message: error_chain_text(err, 512),
        }
    }

    pub fn backend(&self) -> &str {
        match self {
            BackendCallError::Transport { backend, .. }
            | BackendCallError::Status { backend, .. }
            | BackendCallError::Backend { backend, .. }
            | BackendCallError::Malformed { backend, .. } => backend.as_str(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("please upload an image containing the problem")]
    MissingImage,
    #[error(transparent)]
    BackendCall(#[from] BackendCallError),
    #[error("recognition produced no text")]
    EmptyRecognition,
}

/// Flattens an error and its sources into one line, skipping repeats.
pub(crate) fn error_chain_text(err: &(dyn std::error::Error + 'static), max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty()
            && !parts
                .last()
                .map(|existing| existing == trimmed)
                .unwrap_or(false)
        {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn transport_error_keeps_the_cause_chain() {
        let inner = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        let decode = ImageDecodeError {
            path: PathBuf::from("/tmp/q.png"),
            source: inner,
        };
        let err = BackendCallError::transport("granite3.2-vision", &decode);
        let text = err.to_string();
        assert!(text.starts_with("granite3.2-vision request failed: "));
        assert!(text.contains("failed to read image /tmp/q.png"));
        assert!(text.ends_with("caused by: connection refused"));
        assert_eq!(err.backend(), "granite3.2-vision");
    }

    #[test]
    fn pipeline_error_messages_are_user_facing() {
        assert_eq!(
            PipelineError::MissingImage.to_string(),
            "please upload an image containing the problem"
        );
        assert_eq!(
            PipelineError::EmptyRecognition.to_string(),
            "recognition produced no text"
        );
        let wrapped = PipelineError::from(BackendCallError::Status {
            backend: "qwen2:latest".to_string(),
            code: 404,
            body: "model 'qwen2:latest' not found".to_string(),
        });
        assert_eq!(
            wrapped.to_string(),
            "qwen2:latest returned HTTP 404: model 'qwen2:latest' not found"
        );
    }

    #[test]
    fn truncate_text_marks_cut_output() {
        assert_eq!(truncate_text("abcdef", 3), "abc…");
        assert_eq!(truncate_text("abc", 3), "abc");
    }
}
