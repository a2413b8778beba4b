use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::stages::StageResult;

pub type EventPayload = Map<String, Value>;

/// Append-only JSONL log of pipeline runs.
///
/// - default fields are `type`, `run_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
/// - a writer built with [`EventWriter::disabled`] accepts events and drops them
#[derive(Debug, Clone)]
pub struct EventWriter {
    sink: Arc<EventSink>,
    run_id: Arc<str>,
}

#[derive(Debug)]
struct EventSink {
    path: Option<PathBuf>,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self::build(Some(path.into()), run_id.into())
    }

    pub fn disabled(run_id: impl Into<String>) -> Self {
        Self::build(None, run_id.into())
    }

    fn build(path: Option<PathBuf>, run_id: String) -> Self {
        Self {
            sink: Arc::new(EventSink {
                path,
                lock: Mutex::new(()),
            }),
            run_id: Arc::from(run_id),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.sink.path.as_deref()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Same sink and lock, different run id.
    pub fn for_run(&self, run_id: impl Into<String>) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            run_id: Arc::from(run_id.into()),
        }
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "run_id".to_string(),
            Value::String(self.run_id.to_string()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        let Some(path) = self.sink.path.as_ref() else {
            return Ok(Value::Object(event));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .sink
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }

    pub fn emit_stage(&self, result: &StageResult) -> anyhow::Result<Value> {
        let mut payload = EventPayload::new();
        payload.insert(
            "stage".to_string(),
            Value::String(result.kind.as_str().to_string()),
        );
        payload.insert("ok".to_string(), Value::Bool(result.ok));
        payload.insert(
            "chars".to_string(),
            Value::Number((result.text.chars().count() as u64).into()),
        );
        if !result.ok {
            payload.insert("error".to_string(), Value::String(result.text.clone()));
        }
        let event_type = if result.ok {
            "stage_finished"
        } else {
            "stage_failed"
        };
        self.emit(event_type, payload)
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;
    use crate::stages::StageKind;

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "run-123");

        let mut payload = EventPayload::new();
        payload.insert(
            "vision_model".to_string(),
            Value::String("granite3.2-vision".to_string()),
        );
        let emitted = writer.emit("pipeline_started", payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], Value::String("pipeline_started".to_string()));
        assert_eq!(parsed["run_id"], Value::String("run-123".to_string()));
        assert_eq!(
            parsed["vision_model"],
            Value::String("granite3.2-vision".to_string())
        );

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn stage_events_carry_error_only_on_failure() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("logs").join("events.jsonl");
        let writer = EventWriter::new(&path, "run-9");

        writer.emit_stage(&StageResult::success(StageKind::Recognition, "2x + 3 = 7"))?;
        writer.emit_stage(&StageResult::failure(StageKind::Solving, "solver offline"))?;

        let content = fs::read_to_string(&path)?;
        let rows: Vec<Value> = content
            .lines()
            .map(serde_json::from_str::<Value>)
            .collect::<Result<_, _>>()?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["type"], "stage_finished");
        assert_eq!(rows[0]["stage"], "recognition");
        assert_eq!(rows[0]["chars"], 10);
        assert!(rows[0].get("error").is_none());
        assert_eq!(rows[1]["type"], "stage_failed");
        assert_eq!(rows[1]["error"], "solver offline");
        Ok(())
    }

    #[test]
    fn disabled_writer_touches_no_file() -> anyhow::Result<()> {
        let writer = EventWriter::disabled("run-0");
        let emitted = writer.emit("pipeline_finished", EventPayload::new())?;
        assert!(writer.path().is_none());
        assert_eq!(emitted["run_id"], Value::String("run-0".to_string()));
        Ok(())
    }

    #[test]
    fn for_run_shares_the_sink() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let base = EventWriter::new(&path, "base");

        base.for_run("a").emit("one", EventPayload::new())?;
        base.for_run("b").emit("two", EventPayload::new())?;

        let content = fs::read_to_string(&path)?;
        let ids: Vec<String> = content
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row["run_id"].as_str().map(str::to_string))
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        Ok(())
    }
}
