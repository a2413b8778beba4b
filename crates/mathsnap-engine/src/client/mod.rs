mod dryrun;
mod ollama;

pub use dryrun::DryrunClient;
pub use ollama::{build_chat_payload, ChatChunks, OllamaClient};

use crate::error::BackendCallError;

/// Ordered text increments of one backend call. A failure is yielded once
/// and ends the stream.
pub type TextStream = Box<dyn Iterator<Item = Result<String, BackendCallError>> + Send>;

/// One single-turn call to a model backend per invocation, never retried.
/// Implementations hold only immutable configuration and may be shared
/// across concurrent runs.
pub trait ModelClient: Send + Sync {
    /// Model name as sent on the wire.
    fn backend(&self) -> &str;

    fn stream(&self, prompt: &str, image: Option<&str>) -> Result<TextStream, BackendCallError>;

    fn infer(&self, prompt: &str, image: Option<&str>) -> Result<String, BackendCallError> {
        let mut text = String::new();
        for chunk in self.stream(prompt, image)? {
            text.push_str(&chunk?);
        }
        Ok(text)
    }
}
