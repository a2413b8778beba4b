use mathsnap_contracts::stages::StageKind;

use crate::client::TextStream;
use crate::error::BackendCallError;

#[derive(Debug)]
pub enum StageStep {
    Delta(String),
    /// Always the last step: the full stage text, or the call's failure.
    Finished(Result<String, BackendCallError>),
}

/// Forwards one stage's increments in order while accumulating the stage
/// text. Holds nothing beyond the text seen so far.
pub struct StageAggregator {
    kind: StageKind,
    stream: TextStream,
    text: String,
    finished: bool,
}

impl StageAggregator {
    pub fn new(kind: StageKind, stream: TextStream) -> Self {
        Self {
            kind,
            stream,
            text: String::new(),
            finished: false,
        }
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn text_so_far(&self) -> &str {
        &self.text
    }
}

impl Iterator for StageAggregator {
    type Item = StageStep;

    fn next(&mut self) -> Option<StageStep> {
        if self.finished {
            return None;
        }
        loop {
            match self.stream.next() {
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(chunk)) => {
                    self.text.push_str(&chunk);
                    return Some(StageStep::Delta(chunk));
                }
                Some(Err(err)) => {
                    self.finished = true;
                    return Some(StageStep::Finished(Err(err)));
                }
                None => {
                    self.finished = true;
                    return Some(StageStep::Finished(Ok(std::mem::take(&mut self.text))));
                }
            }
        }
    }
}
