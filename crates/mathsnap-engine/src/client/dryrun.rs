use super::{ModelClient, TextStream};
use crate::error::BackendCallError;
use crate::resolver::payload_fingerprint;

/// Offline backend with deterministic output, for wiring checks without a
/// model server.
#[derive(Debug, Clone)]
pub struct DryrunClient {
    name: String,
}

impl DryrunClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn reply(&self, prompt: &str, image: Option<&str>) -> String {
        match image {
            Some(payload) => format!(
                "[{}] transcription of image {} ({} payload chars)",
                self.name,
                payload_fingerprint(payload),
                payload.chars().count()
            ),
            None => {
                let last_line = prompt.lines().last().unwrap_or_default().trim();
                format!("[{}] worked solution for: {last_line}", self.name)
            }
        }
    }
}

impl ModelClient for DryrunClient {
    fn backend(&self) -> &str {
        &self.name
    }

    fn stream(&self, prompt: &str, image: Option<&str>) -> Result<TextStream, BackendCallError> {
        let chunks = self
            .reply(prompt, image)
            .split_inclusive(' ')
            .map(|chunk| Ok(chunk.to_string()))
            .collect::<Vec<Result<String, BackendCallError>>>();
        Ok(Box::new(chunks.into_iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dryrun_is_deterministic_and_chunked() -> anyhow::Result<()> {
        let client = DryrunClient::new("dryrun-vision");
        let chunks = client
            .stream("read", Some("QUJD"))?
            .collect::<Result<Vec<String>, _>>()?;
        assert!(chunks.len() > 1);
        let text = chunks.concat();
        assert_eq!(text, client.infer("read", Some("QUJD"))?);
        assert!(text.starts_with("[dryrun-vision] transcription of image "));
        assert!(text.ends_with("(4 payload chars)"));
        Ok(())
    }

    #[test]
    fn dryrun_solver_echoes_last_prompt_line() -> anyhow::Result<()> {
        let client = DryrunClient::new("dryrun-solver");
        let text = client.infer("please solve the following problem in detail:\n2x + 3 = 7", None)?;
        assert_eq!(text, "[dryrun-solver] worked solution for: 2x + 3 = 7");
        Ok(())
    }
}
