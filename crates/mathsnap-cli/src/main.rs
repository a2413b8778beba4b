use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mathsnap_contracts::content::{ContentItem, Message, MessageContent, RawMessage};
use mathsnap_contracts::events::EventWriter;
use mathsnap_contracts::stages::{PipelineEvent, PipelineState, StageKind};
use mathsnap_engine::{ModelClient as _, Pipeline, PipelineConfig, PipelineRequest, PipelineRun};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "mathsnap=info,mathsnap_engine=info,mathsnap_cli=info";
const CHAT_HELP: &str = "Commands: /image <path|file://uri|data-uri|base64> /help /quit";
const EXIT_FAILED: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "mathsnap", version, about = "Solve math problems from images with local models")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Recognize and solve the problem in one image.
    Solve(SolveArgs),
    /// Interactive session; attach an image with /image, then ask.
    Chat(ChatArgs),
    /// Print the effective configuration.
    Config(ConfigFlags),
}

#[derive(Debug, Clone, Default, Args)]
struct ConfigFlags {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    vision_model: Option<String>,
    #[arg(long)]
    solver_model: Option<String>,
    /// Ask backends for a single complete reply instead of increments.
    #[arg(long)]
    no_stream: bool,
}

#[derive(Debug, Clone, Default, Args)]
struct RunFlags {
    #[command(flatten)]
    config: ConfigFlags,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Offline clients with deterministic replies.
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct SolveArgs {
    #[arg(long)]
    image: String,
    /// Instruction for the vision model, replacing the default one.
    #[arg(long)]
    text: Option<String>,
    #[command(flatten)]
    run: RunFlags,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[command(flatten)]
    run: RunFlags,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("mathsnap error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Solve(args) => run_solve(args),
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Config(flags) => {
            let config = load_config(&flags)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(0)
        }
    }
}

fn load_config(flags: &ConfigFlags) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load(flags.config.as_deref())?;
    apply_flags(&mut config, flags);
    config.validate()?;
    Ok(config)
}

fn apply_flags(config: &mut PipelineConfig, flags: &ConfigFlags) {
    if let Some(model) = non_blank(flags.vision_model.as_deref()) {
        config.vision.model = model;
    }
    if let Some(model) = non_blank(flags.solver_model.as_deref()) {
        config.solver.model = model;
    }
    if flags.no_stream {
        config.stream = false;
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn build_pipeline(flags: &RunFlags) -> Result<Pipeline> {
    let config = load_config(&flags.config)?;
    let pipeline = if flags.dryrun {
        Pipeline::dryrun(&config)
    } else {
        Pipeline::from_config(&config).context("failed building model clients")?
    };
    info!(
        host = %config.base_url(),
        vision_model = pipeline.vision().backend(),
        solver_model = pipeline.solver().backend(),
        dryrun = flags.dryrun,
        "pipeline ready"
    );
    Ok(match &flags.events {
        Some(path) => pipeline.with_events(EventWriter::new(path, "mathsnap")),
        None => pipeline,
    })
}

fn image_request(text: Option<&str>, image: Option<&str>) -> PipelineRequest {
    let mut items = Vec::new();
    if let Some(text) = text {
        items.push(ContentItem::text(text));
    }
    if let Some(image) = image {
        items.push(ContentItem::image(image));
    }
    PipelineRequest::from_message(&RawMessage::from(Message::user(MessageContent::Items(
        items,
    ))))
}

fn run_solve(args: SolveArgs) -> Result<i32> {
    let pipeline = build_pipeline(&args.run)?;
    let request = image_request(args.text.as_deref(), Some(&args.image));
    let stdout = io::stdout();
    let state = render_run(pipeline.run(&request), &mut stdout.lock())?;
    Ok(exit_code(state))
}

fn exit_code(state: PipelineState) -> i32 {
    match state {
        PipelineState::Failed => EXIT_FAILED,
        _ => 0,
    }
}

/// Writes increments as they arrive under one header per stage. Failures go
/// to the same stream so the transcript stays in order.
fn render_run<W: Write>(mut run: PipelineRun, out: &mut W) -> Result<PipelineState> {
    let mut current: Option<StageKind> = None;
    let mut streamed = false;
    for event in run.by_ref() {
        match event {
            PipelineEvent::Delta { kind, text } => {
                if current != Some(kind) {
                    writeln!(out, "[{kind}]")?;
                    current = Some(kind);
                }
                streamed = true;
                write!(out, "{text}")?;
                out.flush()?;
            }
            PipelineEvent::Stage(result) => {
                if current != Some(result.kind) {
                    writeln!(out, "[{}]", result.kind)?;
                    current = Some(result.kind);
                    streamed = false;
                }
                if result.ok {
                    if !streamed {
                        write!(out, "{}", result.text)?;
                    }
                    writeln!(out)?;
                } else {
                    if streamed {
                        writeln!(out)?;
                    }
                    writeln!(out, "{} failed: {}", result.kind, result.text)?;
                }
                streamed = false;
                out.flush()?;
            }
        }
    }
    Ok(run.state())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplCommand {
    Noop,
    Help,
    Quit,
    Attach(String),
    Ask(String),
    Invalid(String),
}

fn parse_repl_line(line: &str) -> ReplCommand {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ReplCommand::Noop;
    }
    let Some(tail) = trimmed.strip_prefix('/') else {
        return ReplCommand::Ask(trimmed.to_string());
    };
    let words = match shell_words::split(tail) {
        Ok(words) => words,
        Err(err) => return ReplCommand::Invalid(format!("could not parse command: {err}")),
    };
    let Some((command, args)) = words.split_first() else {
        return ReplCommand::Invalid("empty command".to_string());
    };
    match (command.as_str(), args) {
        ("help", _) => ReplCommand::Help,
        ("quit" | "exit", _) => ReplCommand::Quit,
        ("image", [reference]) if !reference.trim().is_empty() => {
            ReplCommand::Attach(reference.clone())
        }
        ("image", _) => ReplCommand::Invalid("/image takes exactly one reference".to_string()),
        (other, _) => ReplCommand::Invalid(format!("unknown command /{other}")),
    }
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let pipeline = build_pipeline(&args.run)?;
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut line = String::new();
    let mut attached: Option<String> = None;

    println!("MathSnap chat started. Type /help for commands.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        match parse_repl_line(&line) {
            ReplCommand::Noop => {}
            ReplCommand::Help => println!("{CHAT_HELP}"),
            ReplCommand::Quit => break,
            ReplCommand::Invalid(message) => println!("{message}"),
            ReplCommand::Attach(reference) => {
                println!("Image attached: {}", attachment_label(&reference));
                attached = Some(reference);
            }
            ReplCommand::Ask(text) => {
                let request = image_request(Some(&text), attached.take().as_deref());
                render_run(pipeline.run(&request), &mut stdout.lock())?;
            }
        }
    }
    Ok(())
}

/// Inline payloads can be megabytes long; only the head is echoed.
fn attachment_label(reference: &str) -> String {
    const MAX_CHARS: usize = 64;
    if reference.chars().count() <= MAX_CHARS {
        return reference.to_string();
    }
    let head: String = reference.chars().take(MAX_CHARS).collect();
    format!("{head}… ({} chars)", reference.chars().count())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dryrun_pipeline() -> Pipeline {
        Pipeline::dryrun(&PipelineConfig::default())
    }

    #[test]
    fn repl_commands_parse_with_shell_quoting() {
        assert_eq!(parse_repl_line("  \n"), ReplCommand::Noop);
        assert_eq!(parse_repl_line("/help"), ReplCommand::Help);
        assert_eq!(parse_repl_line("/quit\n"), ReplCommand::Quit);
        assert_eq!(
            parse_repl_line("/image \"/tmp/my scans/q 1.png\""),
            ReplCommand::Attach("/tmp/my scans/q 1.png".to_string())
        );
        assert_eq!(
            parse_repl_line("what is the answer?\n"),
            ReplCommand::Ask("what is the answer?".to_string())
        );
    }

    #[test]
    fn repl_rejects_malformed_commands() {
        assert!(matches!(parse_repl_line("/image"), ReplCommand::Invalid(_)));
        assert!(matches!(parse_repl_line("/image a.png b.png"), ReplCommand::Invalid(_)));
        assert!(matches!(parse_repl_line("/image \"unterminated"), ReplCommand::Invalid(_)));
        assert_eq!(
            parse_repl_line("/solve"),
            ReplCommand::Invalid("unknown command /solve".to_string())
        );
    }

    #[test]
    fn flags_override_loaded_config() {
        let mut config = PipelineConfig::default();
        let flags = ConfigFlags {
            vision_model: Some("llava:13b".to_string()),
            solver_model: Some("  ".to_string()),
            no_stream: true,
            ..ConfigFlags::default()
        };
        apply_flags(&mut config, &flags);
        assert_eq!(config.vision.model, "llava:13b");
        assert_eq!(config.solver.model, PipelineConfig::default().solver.model);
        assert!(!config.stream);
    }

    #[test]
    fn solve_arguments_parse() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "mathsnap",
            "solve",
            "--image",
            "/tmp/q.png",
            "--dryrun",
            "--solver-model",
            "qwen2:7b",
        ])?;
        let Command::Solve(args) = cli.command else {
            panic!("expected solve subcommand");
        };
        assert_eq!(args.image, "/tmp/q.png");
        assert!(args.run.dryrun);
        assert_eq!(args.run.config.solver_model.as_deref(), Some("qwen2:7b"));
        Ok(())
    }

    #[test]
    fn render_prints_both_stages_in_order() -> anyhow::Result<()> {
        let request = image_request(None, Some("iVBORw0KGgo="));
        let mut out = Vec::new();
        let state = render_run(dryrun_pipeline().run(&request), &mut out)?;
        let text = String::from_utf8(out)?;

        assert_eq!(state, PipelineState::Done);
        assert_eq!(exit_code(state), 0);
        let recognition = text.find("[recognition]\n[dryrun-vision] transcription");
        let solving = text.find("[solving]\n[dryrun-solver] worked solution for: ");
        assert!(recognition.is_some(), "unexpected transcript: {text}");
        assert!(solving > recognition, "unexpected transcript: {text}");
        Ok(())
    }

    #[test]
    fn render_prints_upload_prompt_for_text_only_input() -> anyhow::Result<()> {
        let request = image_request(Some("solve x + 1 = 2"), None);
        let mut out = Vec::new();
        let state = render_run(dryrun_pipeline().run(&request), &mut out)?;
        assert_eq!(
            String::from_utf8(out)?,
            "[recognition]\nplease upload an image containing the problem\n"
        );
        assert_eq!(exit_code(state), 0);
        Ok(())
    }

    #[test]
    fn failed_state_maps_to_exit_code() {
        assert_eq!(exit_code(PipelineState::Failed), EXIT_FAILED);
    }

    #[test]
    fn long_inline_attachments_are_abbreviated() {
        let label = attachment_label(&"A".repeat(500));
        assert!(label.ends_with("… (500 chars)"));
        assert_eq!(attachment_label("/tmp/q.png"), "/tmp/q.png");
    }
}
