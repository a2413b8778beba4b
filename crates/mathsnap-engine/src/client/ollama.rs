use std::io::{BufRead, BufReader};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use tracing::debug;

use super::{ModelClient, TextStream};
use crate::config::ModelProfile;
use crate::error::{truncate_text, BackendCallError};
use crate::resolver::wire_payload;

/// Client for a local Ollama-compatible `/api/chat` endpoint.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    endpoint: String,
    profile: ModelProfile,
    stream: bool,
    timeout: Duration,
    http: HttpClient,
}

impl OllamaClient {
    /// `timeout` is the deadline of one call. The HTTP client applies it to
    /// connect and to each read; a streamed body is additionally cut off
    /// once the deadline passes. System proxies are bypassed.
    pub fn new(base_url: &str, profile: ModelProfile, timeout: Duration, stream: bool) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .context("failed building HTTP client")?;
        Ok(Self {
            endpoint: format!("{}/api/chat", base_url.trim_end_matches('/')),
            profile,
            stream,
            timeout,
            http,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn profile(&self) -> &ModelProfile {
        &self.profile
    }

    fn send(&self, payload: &Value) -> Result<HttpResponse, BackendCallError> {
        let model = self.profile.model.as_str();
        let response = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .json(payload)
            .send()
            .map_err(|err| BackendCallError::transport(model, &err))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(BackendCallError::Status {
            backend: model.to_string(),
            code: status.as_u16(),
            body: error_message(&body).unwrap_or_else(|| truncate_text(body.trim(), 512)),
        })
    }
}

impl ModelClient for OllamaClient {
    fn backend(&self) -> &str {
        &self.profile.model
    }

    fn stream(&self, prompt: &str, image: Option<&str>) -> Result<TextStream, BackendCallError> {
        let payload = build_chat_payload(&self.profile, prompt, image, self.stream);
        debug!(
            model = %self.profile.model,
            endpoint = %self.endpoint,
            has_image = image.is_some(),
            stream = self.stream,
            "sending chat request"
        );
        let deadline = Instant::now() + self.timeout;
        let response = self.send(&payload)?;

        if self.stream {
            let chunks = ChatChunks::new(self.profile.model.clone(), BufReader::new(response))
                .with_deadline(deadline);
            return Ok(Box::new(chunks));
        }
        let model = self.profile.model.as_str();
        let body = response
            .text()
            .map_err(|err| BackendCallError::transport(model, &err))?;
        let text = parse_chat_body(model, &body)?;
        Ok(Box::new(std::iter::once(Ok(text))))
    }
}

/// Request body for `/api/chat`. A data URI image is reduced to its bare
/// base64 part.
pub fn build_chat_payload(
    profile: &ModelProfile,
    prompt: &str,
    image: Option<&str>,
    stream: bool,
) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = profile
        .system_prompt
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        messages.push(json!({ "role": "system", "content": system }));
    }
    let mut user = json!({ "role": "user", "content": prompt });
    if let Some(image) = image {
        user["images"] = json!([wire_payload(image)]);
    }
    messages.push(user);

    json!({
        "model": profile.model,
        "messages": messages,
        "options": {
            "temperature": profile.temperature,
            "max_tokens": profile.max_tokens,
        },
        "stream": stream,
    })
}

fn error_message(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    parsed
        .get("error")
        .and_then(Value::as_str)
        .map(|message| truncate_text(message, 512))
}

fn parse_chat_body(model: &str, body: &str) -> Result<String, BackendCallError> {
    let parsed: Value = serde_json::from_str(body).map_err(|err| BackendCallError::Malformed {
        backend: model.to_string(),
        message: format!("invalid JSON: {err}"),
    })?;
    chat_content(model, &parsed)
}

fn chat_content(model: &str, parsed: &Value) -> Result<String, BackendCallError> {
    if let Some(message) = parsed.get("error").and_then(Value::as_str) {
        return Err(BackendCallError::Backend {
            backend: model.to_string(),
            message: truncate_text(message, 512),
        });
    }
    parsed
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BackendCallError::Malformed {
            backend: model.to_string(),
            message: "missing message.content".to_string(),
        })
}

/// Iterator over newline-delimited chat chunks (`{"message": {...}, "done": ...}`).
pub struct ChatChunks<R> {
    model: String,
    reader: R,
    line: String,
    deadline: Option<Instant>,
    finished: bool,
}

impl<R: BufRead> ChatChunks<R> {
    pub fn new(model: impl Into<String>, reader: R) -> Self {
        Self {
            model: model.into(),
            reader,
            line: String::new(),
            deadline: None,
            finished: false,
        }
    }

    /// No further line is read once `deadline` has passed.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn deadline_passed(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    fn fail(&mut self, err: BackendCallError) -> Option<Result<String, BackendCallError>> {
        self.finished = true;
        Some(Err(err))
    }
}

impl<R: BufRead> Iterator for ChatChunks<R> {
    type Item = Result<String, BackendCallError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            if self.deadline_passed() {
                let err = BackendCallError::Transport {
                    backend: self.model.clone(),
                    message: "deadline exceeded".to_string(),
                };
                return self.fail(err);
            }
            self.line.clear();
            let read = match self.reader.read_line(&mut self.line) {
                Ok(read) => read,
                Err(err) => {
                    let err = BackendCallError::transport(&self.model, &err);
                    return self.fail(err);
                }
            };
            if read == 0 {
                let err = BackendCallError::Malformed {
                    backend: self.model.clone(),
                    message: "stream ended before completion".to_string(),
                };
                return self.fail(err);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let parsed: Value = match serde_json::from_str(trimmed) {
                Ok(parsed) => parsed,
                Err(err) => {
                    let err = BackendCallError::Malformed {
                        backend: self.model.clone(),
                        message: format!("invalid stream chunk: {err}"),
                    };
                    return self.fail(err);
                }
            };
            let done = parsed.get("done").and_then(Value::as_bool).unwrap_or(false);
            let content = match chat_content(&self.model, &parsed) {
                Ok(content) => content,
                Err(err @ BackendCallError::Backend { .. }) => return self.fail(err),
                // The closing chunk may omit the message.
                Err(err) if !done => return self.fail(err),
                Err(_) => String::new(),
            };
            if done {
                self.finished = true;
            }
            if !content.is_empty() {
                return Some(Ok(content));
            }
        }
        None
    }
}
