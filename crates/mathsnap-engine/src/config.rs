use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const RECOGNIZED_TEXT_PLACEHOLDER: &str = "{recognized_text}";

const DEFAULT_HOST: &str = "http://localhost:11434";
const DEFAULT_VISION_MODEL: &str = "granite3.2-vision";
const DEFAULT_SOLVER_MODEL: &str = "qwen2:latest";
const DEFAULT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_VISION_SYSTEM_PROMPT: &str = "You are an image recognition expert for math equations, formulas and problems. Transcribe the math content of the image accurately as text.";
const DEFAULT_SOLVER_SYSTEM_PROMPT: &str = "You are a math problem-solving expert for systems of equations, algebra and geometry. Solve the given problem in detail, including the solution steps and the final answer.";

/// Immutable settings of one model backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl ModelProfile {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

fn default_temperature() -> f64 {
    0.1
}

fn default_max_tokens() -> u32 {
    2048
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Prompts {
    pub recognition: String,
    /// Must contain `{recognized_text}`.
    pub solving_template: String,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            recognition: "please identify the math equation or problem in the image and transcribe it as clear text".to_string(),
            solving_template: format!(
                "please solve the following problem in detail:\n{RECOGNIZED_TEXT_PLACEHOLDER}"
            ),
        }
    }
}

impl Prompts {
    /// Substitutes the recognized text verbatim.
    pub fn solving_prompt(&self, recognized_text: &str) -> String {
        self.solving_template
            .replace(RECOGNIZED_TEXT_PLACEHOLDER, recognized_text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub host: String,
    pub timeout_secs: u64,
    pub stream: bool,
    /// A profile given in a config file replaces the default one, system
    /// prompt included.
    pub vision: ModelProfile,
    pub solver: ModelProfile,
    pub prompts: Prompts,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            stream: true,
            vision: ModelProfile::new(DEFAULT_VISION_MODEL)
                .with_system_prompt(DEFAULT_VISION_SYSTEM_PROMPT),
            solver: ModelProfile::new(DEFAULT_SOLVER_MODEL)
                .with_system_prompt(DEFAULT_SOLVER_SYSTEM_PROMPT),
            prompts: Prompts::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults, then the optional JSON file, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid config JSON in {}", path.display()))
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        if let Some(host) = non_empty("MATHSNAP_OLLAMA_HOST").or_else(|| non_empty("OLLAMA_HOST")) {
            self.host = host;
        }
        if let Some(model) = non_empty("MATHSNAP_VISION_MODEL") {
            self.vision.model = model;
        }
        if let Some(model) = non_empty("MATHSNAP_SOLVER_MODEL") {
            self.solver.model = model;
        }
        if let Some(secs) = non_empty("MATHSNAP_TIMEOUT_SECS").and_then(|raw| raw.parse().ok()) {
            self.timeout_secs = secs;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            bail!("host must not be empty");
        }
        if self.timeout_secs == 0 {
            bail!("timeout_secs must be positive");
        }
        for (role, profile) in [("vision", &self.vision), ("solver", &self.solver)] {
            if profile.model.trim().is_empty() {
                bail!("{role} model must not be empty");
            }
            if profile.max_tokens == 0 {
                bail!("{role} max_tokens must be positive");
            }
        }
        if !self
            .prompts
            .solving_template
            .contains(RECOGNIZED_TEXT_PLACEHOLDER)
        {
            bail!("solving_template must contain {RECOGNIZED_TEXT_PLACEHOLDER}");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Host without trailing slashes; `http://` is assumed when no scheme is given.
    pub fn base_url(&self) -> String {
        let trimmed = self.host.trim().trim_end_matches('/');
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("http://{trimmed}")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;

    #[test]
    fn defaults_match_local_deployment() {
        let config = PipelineConfig::default();
        assert_eq!(config.base_url(), "http://localhost:11434");
        assert_eq!(config.vision.model, "granite3.2-vision");
        assert_eq!(config.solver.model, "qwen2:latest");
        assert_eq!(config.vision.temperature, 0.1);
        assert_eq!(config.solver.max_tokens, 2048);
        assert!(config.stream);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_profiles_carry_role_instructions() {
        let config = PipelineConfig::default();
        assert!(config
            .vision
            .system_prompt
            .as_deref()
            .map(|prompt| prompt.starts_with("You are an image recognition expert"))
            .unwrap_or(false));
        assert!(config
            .solver
            .system_prompt
            .as_deref()
            .map(|prompt| prompt.contains("solution steps and the final answer"))
            .unwrap_or(false));
        assert_eq!(ModelProfile::new("m").system_prompt, None);
    }

    #[test]
    fn solving_prompt_embeds_text_verbatim() {
        let prompts = Prompts::default();
        assert_eq!(
            prompts.solving_prompt("2x + 3 = 7"),
            "please solve the following problem in detail:\n2x + 3 = 7"
        );
        assert_eq!(
            prompts.solving_prompt("{recognized_text}"),
            "please solve the following problem in detail:\n{recognized_text}"
        );
    }

    #[test]
    fn partial_json_keeps_other_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("mathsnap.json");
        std::fs::write(
            &path,
            serde_json::to_string(&json!({
                "host": "http://gpu-box:11434/",
                "vision": {"model": "llava:13b", "temperature": 0.0},
            }))?,
        )?;
        let config = PipelineConfig::from_json_file(&path)?;
        assert_eq!(config.base_url(), "http://gpu-box:11434");
        assert_eq!(config.vision.model, "llava:13b");
        assert_eq!(config.vision.temperature, 0.0);
        assert_eq!(config.vision.max_tokens, 2048);
        assert_eq!(config.solver.model, "qwen2:latest");
        assert_eq!(config.vision.system_prompt, None);
        assert!(config.solver.system_prompt.is_some());
        assert_eq!(config.prompts, Prompts::default());
        Ok(())
    }

    #[test]
    fn env_overrides_ignore_blank_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("OLLAMA_HOST", "127.0.0.1:11500"),
            ("MATHSNAP_VISION_MODEL", "  "),
            ("MATHSNAP_SOLVER_MODEL", "deepseek-r1:8b"),
            ("MATHSNAP_TIMEOUT_SECS", "45"),
        ]);
        let mut config = PipelineConfig::default();
        config.apply_env(|key| env.get(key).map(|value| value.to_string()));
        assert_eq!(config.base_url(), "http://127.0.0.1:11500");
        assert_eq!(config.vision.model, "granite3.2-vision");
        assert_eq!(config.solver.model, "deepseek-r1:8b");
        assert_eq!(config.timeout(), Duration::from_secs(45));
    }

    #[test]
    fn specific_host_variable_wins() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("OLLAMA_HOST", "http://a:1"),
            ("MATHSNAP_OLLAMA_HOST", "http://b:2"),
        ]);
        let mut config = PipelineConfig::default();
        config.apply_env(|key| env.get(key).map(|value| value.to_string()));
        assert_eq!(config.host, "http://b:2");
    }

    #[test]
    fn validate_rejects_template_without_placeholder() {
        let mut config = PipelineConfig::default();
        config.prompts.solving_template = "solve it".to_string();
        let err = config.validate().err().map(|err| err.to_string());
        assert_eq!(
            err.as_deref(),
            Some("solving_template must contain {recognized_text}")
        );
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let mut config = PipelineConfig::default();
        config.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.solver.max_tokens = 0;
        assert!(config.validate().is_err());
    }
}
