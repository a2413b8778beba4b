use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::parts::{ContentPart, RawImageRef};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl ContentItem {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            text: Some(value.into()),
            image: None,
        }
    }

    pub fn image(reference: impl Into<String>) -> Self {
        Self {
            text: None,
            image: Some(reference.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Items(Vec<ContentItem>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "default_role")]
    pub role: String,
    pub content: MessageContent,
}

impl Message {
    pub fn user(content: MessageContent) -> Self {
        Self {
            role: default_role(),
            content,
        }
    }
}

fn default_role() -> String {
    "user".to_string()
}

/// Every message shape a front-end may hand to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum RawMessage {
    Typed(Message),
    Mapping(Map<String, Value>),
    Plain(String),
}

impl From<Message> for RawMessage {
    fn from(value: Message) -> Self {
        RawMessage::Typed(value)
    }
}

impl From<&str> for RawMessage {
    fn from(value: &str) -> Self {
        RawMessage::Plain(value.to_string())
    }
}

impl From<String> for RawMessage {
    fn from(value: String) -> Self {
        RawMessage::Plain(value)
    }
}

impl From<Value> for RawMessage {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => RawMessage::Mapping(map),
            Value::String(text) => RawMessage::Plain(text),
            other => RawMessage::Plain(other.to_string()),
        }
    }
}

/// Accepts any JSON value, classified the same way as `From<Value>`.
impl<'de> Deserialize<'de> for RawMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(RawMessage::from)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedContent {
    pub parts: Vec<ContentPart>,
}

impl NormalizedContent {
    pub fn has_image(&self) -> bool {
        self.first_image().is_some()
    }

    /// Only the first image of a message is ever sent to a backend.
    pub fn first_image(&self) -> Option<&RawImageRef> {
        self.parts.iter().find_map(ContentPart::image)
    }

    pub fn image_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|part| matches!(part, ContentPart::Image(_)))
            .count()
    }

    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(ContentPart::text)
            .collect::<Vec<&str>>()
            .join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

pub fn normalize(message: &RawMessage) -> NormalizedContent {
    let parts = match message {
        RawMessage::Plain(text) => text_parts(text),
        RawMessage::Typed(message) => match &message.content {
            MessageContent::Text(text) => text_parts(text),
            MessageContent::Items(items) => {
                let mut parts = Vec::new();
                for item in items {
                    push_item(&mut parts, item.text.as_deref(), item.image.as_deref());
                }
                parts
            }
        },
        RawMessage::Mapping(map) => match map.get("content") {
            Some(Value::String(text)) => text_parts(text),
            Some(Value::Array(items)) => {
                let mut parts = Vec::new();
                for item in items {
                    let Some(object) = item.as_object() else {
                        continue;
                    };
                    push_item(
                        &mut parts,
                        object.get("text").and_then(Value::as_str),
                        object.get("image").and_then(Value::as_str),
                    );
                }
                parts
            }
            _ => Vec::new(),
        },
    };
    NormalizedContent { parts }
}

fn text_parts(text: &str) -> Vec<ContentPart> {
    vec![ContentPart::Text(text.to_string())]
}

fn push_item(parts: &mut Vec<ContentPart>, text: Option<&str>, image: Option<&str>) {
    if let Some(text) = text.filter(|value| !value.is_empty()) {
        parts.push(ContentPart::Text(text.to_string()));
    }
    if let Some(image) = image.filter(|value| !value.is_empty()) {
        parts.push(ContentPart::Image(RawImageRef::new(image)));
    }
}
