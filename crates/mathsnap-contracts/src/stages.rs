use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Recognition,
    Solving,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Recognition => "recognition",
            StageKind::Solving => "solving",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one stage. When `ok` is false, `text` is an error message
/// rather than model output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub kind: StageKind,
    pub text: String,
    pub ok: bool,
}

impl StageResult {
    pub fn success(kind: StageKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            ok: true,
        }
    }

    pub fn failure(kind: StageKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            text: message.into(),
            ok: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    AwaitingInput,
    Recognizing,
    Solving,
    Done,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::AwaitingInput => "awaiting_input",
            PipelineState::Recognizing => "recognizing",
            PipelineState::Solving => "solving",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        }
    }
}

/// Item of the ordered output sequence: text increments of the stage in
/// flight, then that stage's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Delta { kind: StageKind, text: String },
    Stage(StageResult),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub results: Vec<StageResult>,
    pub state: PipelineState,
}

impl PipelineResponse {
    pub fn succeeded(&self) -> bool {
        self.state == PipelineState::Done && self.results.iter().all(|result| result.ok)
    }

    pub fn last(&self) -> Option<&StageResult> {
        self.results.last()
    }

    /// Text of the final `Solving` result, when the pipeline got that far.
    pub fn solution(&self) -> Option<&str> {
        self.results
            .iter()
            .rev()
            .find(|result| result.kind == StageKind::Solving && result.ok)
            .map(|result| result.text.as_str())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn stage_event_serializes_with_type_tag() -> anyhow::Result<()> {
        let event = PipelineEvent::Stage(StageResult::failure(
            StageKind::Recognition,
            "recognition produced no text",
        ));
        assert_eq!(
            serde_json::to_value(&event)?,
            json!({
                "type": "stage",
                "kind": "recognition",
                "text": "recognition produced no text",
                "ok": false,
            })
        );
        Ok(())
    }

    #[test]
    fn solution_requires_successful_solving_stage() {
        let failed = PipelineResponse {
            results: vec![
                StageResult::success(StageKind::Recognition, "x + 1 = 2"),
                StageResult::failure(StageKind::Solving, "solver offline"),
            ],
            state: PipelineState::Failed,
        };
        assert_eq!(failed.solution(), None);
        assert!(!failed.succeeded());

        let done = PipelineResponse {
            results: vec![
                StageResult::success(StageKind::Recognition, "x + 1 = 2"),
                StageResult::success(StageKind::Solving, "x = 1"),
            ],
            state: PipelineState::Done,
        };
        assert_eq!(done.solution(), Some("x = 1"));
        assert!(done.succeeded());
    }
}
