pub mod aggregator;
pub mod client;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod resolver;

pub use client::{DryrunClient, ModelClient, OllamaClient, TextStream};
pub use config::{ModelProfile, PipelineConfig, Prompts};
pub use error::{BackendCallError, ImageDecodeError, PipelineError};
pub use pipeline::{Pipeline, PipelineRequest, PipelineRun};
pub use resolver::{encode_image, resolve_image, Resolution};
