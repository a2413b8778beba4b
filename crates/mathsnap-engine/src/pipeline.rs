use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use mathsnap_contracts::content::{normalize, NormalizedContent, RawImageRef, RawMessage};
use mathsnap_contracts::events::{EventPayload, EventWriter};
use mathsnap_contracts::stages::{
    PipelineEvent, PipelineResponse, PipelineState, StageKind, StageResult,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::aggregator::{StageAggregator, StageStep};
use crate::client::{DryrunClient, ModelClient, OllamaClient};
use crate::config::{PipelineConfig, Prompts};
use crate::error::{BackendCallError, PipelineError};
use crate::resolver::{payload_fingerprint, resolve_image, Resolution};

/// One incoming call: the normalized content of the last message only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineRequest {
    content: NormalizedContent,
}

impl PipelineRequest {
    pub fn from_message(message: &RawMessage) -> Self {
        Self {
            content: normalize(message),
        }
    }

    /// Earlier messages are ignored; an empty history yields an empty request.
    pub fn from_history(history: &[RawMessage]) -> Self {
        history
            .last()
            .map(Self::from_message)
            .unwrap_or_default()
    }

    pub fn content(&self) -> &NormalizedContent {
        &self.content
    }

    /// Text the caller sent alongside the image, if any.
    pub fn instruction(&self) -> Option<String> {
        let text = self.content.text();
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

/// Two-stage recognition/solving pipeline over injected clients.
#[derive(Clone)]
pub struct Pipeline {
    vision: Arc<dyn ModelClient>,
    solver: Arc<dyn ModelClient>,
    prompts: Prompts,
    events: EventWriter,
}

impl Pipeline {
    pub fn new(vision: Arc<dyn ModelClient>, solver: Arc<dyn ModelClient>, prompts: Prompts) -> Self {
        Self {
            vision,
            solver,
            prompts,
            events: EventWriter::disabled("pipeline"),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let base_url = config.base_url();
        let vision = OllamaClient::new(&base_url, config.vision.clone(), config.timeout(), config.stream)?;
        let solver = OllamaClient::new(&base_url, config.solver.clone(), config.timeout(), config.stream)?;
        Ok(Self::new(
            Arc::new(vision),
            Arc::new(solver),
            config.prompts.clone(),
        ))
    }

    pub fn dryrun(config: &PipelineConfig) -> Self {
        Self::new(
            Arc::new(DryrunClient::new("dryrun-vision")),
            Arc::new(DryrunClient::new("dryrun-solver")),
            config.prompts.clone(),
        )
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = events;
        self
    }

    pub fn vision(&self) -> &dyn ModelClient {
        self.vision.as_ref()
    }

    pub fn solver(&self) -> &dyn ModelClient {
        self.solver.as_ref()
    }

    /// Starts a fresh run. Nothing is called until the run is iterated.
    pub fn run(&self, request: &PipelineRequest) -> PipelineRun {
        let run_id = uuid::Uuid::new_v4().to_string();
        let events = self.events.for_run(run_id.clone());
        let content = request.content();

        let mut payload = EventPayload::new();
        payload.insert("vision_model".to_string(), Value::from(self.vision.backend()));
        payload.insert("solver_model".to_string(), Value::from(self.solver.backend()));
        payload.insert("parts".to_string(), Value::from(content.parts.len()));
        payload.insert("images".to_string(), Value::from(content.image_count()));
        record(&events, "pipeline_started", payload);
        if content.image_count() > 1 {
            warn!(run_id = %run_id, images = content.image_count(), "multiple images attached, using the first");
        }

        let (recognition_prompt, custom_prompt) = match request.instruction() {
            Some(instruction) => (instruction, true),
            None => (self.prompts.recognition.clone(), false),
        };

        PipelineRun {
            run_id,
            state: PipelineState::AwaitingInput,
            vision: Arc::clone(&self.vision),
            solver: Arc::clone(&self.solver),
            prompts: self.prompts.clone(),
            recognition_prompt,
            custom_prompt,
            image: content.first_image().cloned(),
            solving_prompt: None,
            active: None,
            events,
            started: Instant::now(),
        }
    }

    pub fn solve(&self, request: &PipelineRequest) -> PipelineResponse {
        self.run(request).collect_response()
    }
}

/// Lazy, forward-only sequence of a single request's output. Recognition
/// increments all precede Solving increments; the sequence always ends with
/// a `Stage` item.
pub struct PipelineRun {
    run_id: String,
    state: PipelineState,
    vision: Arc<dyn ModelClient>,
    solver: Arc<dyn ModelClient>,
    prompts: Prompts,
    /// The caller's text when present, otherwise the configured instruction.
    recognition_prompt: String,
    custom_prompt: bool,
    image: Option<RawImageRef>,
    solving_prompt: Option<String>,
    active: Option<StageAggregator>,
    events: EventWriter,
    started: Instant,
}

impl PipelineRun {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Completed stages only, increments dropped.
    pub fn results(self) -> impl Iterator<Item = StageResult> {
        self.filter_map(|event| match event {
            PipelineEvent::Stage(result) => Some(result),
            PipelineEvent::Delta { .. } => None,
        })
    }

    pub fn collect_response(mut self) -> PipelineResponse {
        let mut results = Vec::new();
        for event in self.by_ref() {
            if let PipelineEvent::Stage(result) = event {
                results.push(result);
            }
        }
        PipelineResponse {
            results,
            state: self.state,
        }
    }

    fn start_recognition(&mut self) -> Option<PipelineEvent> {
        let image = self.image.take()?;
        let resolution = resolve_image(&image);
        let mut payload = EventPayload::new();
        payload.insert("stage".to_string(), Value::from(StageKind::Recognition.as_str()));
        payload.insert("model".to_string(), Value::from(self.vision.backend()));
        payload.insert("image_sha256".to_string(), Value::from(payload_fingerprint(resolution.payload())));
        payload.insert("image_chars".to_string(), Value::from(resolution.payload().len()));
        payload.insert("image_fallback".to_string(), Value::from(resolution.is_fallback()));
        payload.insert("custom_prompt".to_string(), Value::from(self.custom_prompt));
        if let Resolution::Fallback { error, .. } = &resolution {
            payload.insert("image_error".to_string(), Value::from(error.to_string()));
        }
        record(&self.events, "stage_started", payload);
        info!(run_id = %self.run_id, model = self.vision.backend(), fallback = resolution.is_fallback(), "recognition started");

        let image_payload = resolution.into_payload();
        match self
            .vision
            .stream(&self.recognition_prompt, Some(&image_payload))
        {
            Ok(stream) => {
                self.active = Some(StageAggregator::new(StageKind::Recognition, stream));
                None
            }
            Err(err) => Some(self.fail(StageKind::Recognition, err.into())),
        }
    }

    fn start_solving(&mut self) -> Option<PipelineEvent> {
        let prompt = self.solving_prompt.take()?;
        let mut payload = EventPayload::new();
        payload.insert("stage".to_string(), Value::from(StageKind::Solving.as_str()));
        payload.insert("model".to_string(), Value::from(self.solver.backend()));
        payload.insert("prompt_chars".to_string(), Value::from(prompt.chars().count()));
        record(&self.events, "stage_started", payload);
        info!(run_id = %self.run_id, model = self.solver.backend(), "solving started");

        match self.solver.stream(&prompt, None) {
            Ok(stream) => {
                self.active = Some(StageAggregator::new(StageKind::Solving, stream));
                None
            }
            Err(err) => Some(self.fail(StageKind::Solving, err.into())),
        }
    }

    fn finish_stage(&mut self, kind: StageKind, outcome: Result<String, BackendCallError>) -> PipelineEvent {
        self.active = None;
        let text = match outcome {
            Ok(text) => text,
            Err(err) => return self.fail(kind, err.into()),
        };
        match kind {
            StageKind::Recognition => {
                if text.trim().is_empty() {
                    return self.fail(kind, PipelineError::EmptyRecognition);
                }
                self.solving_prompt = Some(self.prompts.solving_prompt(&text));
                self.state = PipelineState::Solving;
            }
            StageKind::Solving => {
                self.state = PipelineState::Done;
            }
        }
        let result = StageResult::success(kind, text);
        self.record_stage(&result);
        if self.state.is_terminal() {
            self.record_finished();
        }
        PipelineEvent::Stage(result)
    }

    /// Short-circuits on a missing image; everything else is a stage failure.
    fn fail(&mut self, kind: StageKind, err: PipelineError) -> PipelineEvent {
        self.active = None;
        self.solving_prompt = None;
        let message = err.to_string();
        let result = if matches!(err, PipelineError::MissingImage) {
            self.state = PipelineState::Done;
            info!(run_id = %self.run_id, "no image attached, asking for one");
            StageResult::success(kind, message)
        } else {
            self.state = PipelineState::Failed;
            warn!(run_id = %self.run_id, stage = %kind, error = %message, "stage failed");
            StageResult::failure(kind, message)
        };
        self.record_stage(&result);
        self.record_finished();
        PipelineEvent::Stage(result)
    }

    fn record_stage(&self, result: &StageResult) {
        if let Err(err) = self.events.emit_stage(result) {
            warn!(run_id = %self.run_id, error = %err, "failed writing stage event");
        }
    }

    fn record_finished(&self) {
        let mut payload = EventPayload::new();
        payload.insert("state".to_string(), Value::from(self.state.as_str()));
        payload.insert(
            "elapsed_ms".to_string(),
            Value::from(self.started.elapsed().as_millis() as u64),
        );
        record(&self.events, "pipeline_finished", payload);
        info!(run_id = %self.run_id, state = self.state.as_str(), "pipeline finished");
    }
}

impl Iterator for PipelineRun {
    type Item = PipelineEvent;

    fn next(&mut self) -> Option<PipelineEvent> {
        loop {
            let kind = match self.state {
                PipelineState::Done | PipelineState::Failed => return None,
                PipelineState::AwaitingInput => {
                    if self.image.is_none() {
                        return Some(self.fail(StageKind::Recognition, PipelineError::MissingImage));
                    }
                    self.state = PipelineState::Recognizing;
                    if let Some(event) = self.start_recognition() {
                        return Some(event);
                    }
                    continue;
                }
                PipelineState::Recognizing => StageKind::Recognition,
                PipelineState::Solving => StageKind::Solving,
            };

            if self.active.is_none() && kind == StageKind::Solving {
                if let Some(event) = self.start_solving() {
                    return Some(event);
                }
            }
            let Some(active) = self.active.as_mut() else {
                // A stage in flight without a stream cannot make progress.
                let err = BackendCallError::Malformed {
                    backend: self.stage_backend(kind).to_string(),
                    message: "stage has no active call".to_string(),
                };
                return Some(self.fail(kind, err.into()));
            };
            match active.next() {
                Some(StageStep::Delta(text)) => return Some(PipelineEvent::Delta { kind, text }),
                Some(StageStep::Finished(outcome)) => return Some(self.finish_stage(kind, outcome)),
                None => self.active = None,
            }
        }
    }
}

impl PipelineRun {
    fn stage_backend(&self, kind: StageKind) -> &str {
        match kind {
            StageKind::Recognition => self.vision.backend(),
            StageKind::Solving => self.solver.backend(),
        }
    }
}

fn record(events: &EventWriter, event_type: &str, payload: EventPayload) {
    if let Err(err) = events.emit(event_type, payload) {
        warn!(run_id = events.run_id(), error = %err, event_type, "failed writing event");
    }
}
