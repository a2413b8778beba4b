mod normalizer;
mod parts;

pub use normalizer::{normalize, ContentItem, Message, MessageContent, NormalizedContent, RawMessage};
pub use parts::{ContentPart, ImageReference, RawImageRef};
