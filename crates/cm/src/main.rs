mod schema;

use clap::{ArgAction, Parser, Subcommand};
use cm_core::config::DEFAULT_CONFIG_PATH;
use cm_core::fingerprint::file_set_fingerprint;
use cm_core::orchestrator::OrchestratorDiff;
use cm_core::types::{CodeModeDiff, CodeModeResponse, DiffKind, FileBuffer};
use cm_core::{
    CodeModeConfig, CodeModeService, DiffApplicator, MockOrchestrator, MockScript,
    ValidatorRegistry,
};
use owo_colors::{OwoColorize, Stream};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cm", version, about = "Code mode session orchestration")]
struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Config file (defaults to .codemode/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply a JSON list of diffs to a file and print the result.
    Apply {
        file: PathBuf,
        diffs: PathBuf,
        #[arg(long)]
        no_validate: bool,
    },
    /// Print the fingerprint of a set of files.
    Fingerprint {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Run a task end to end against the built-in mock orchestrator.
    Demo {
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Make the orchestrator never finish.
        #[arg(long)]
        hang: bool,
    },
    /// Print the effective configuration.
    Config,
    /// Print the protocol schemas as OpenAPI JSON.
    Schema,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err}", "error:".if_supports_color(Stream::Stderr, |text| text.red()));
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let fallback = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), String> {
    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = CodeModeConfig::from_env_and_file(&config_path).map_err(|err| err.to_string())?;
    tracing::debug!(path = %config_path.display(), "configuration loaded");

    match cli.command {
        Command::Apply {
            file,
            diffs,
            no_validate,
        } => {
            let buffer = read_buffer(&file)?;
            let raw = std::fs::read_to_string(&diffs)
                .map_err(|err| format!("failed to read {}: {err}", diffs.display()))?;
            let diffs: Vec<CodeModeDiff> = serde_json::from_str(&raw)
                .map_err(|err| format!("invalid diffs in {}: {err}", diffs.display()))?;
            let applicator = DiffApplicator::new(
                ValidatorRegistry::default(),
                config.auto_validate_syntax && !no_validate,
            );
            let output = applicator
                .preview(&buffer.content, &buffer.language, &diffs)
                .map_err(|err| format!("{}: {err}", buffer.path))?;
            println!("{output}");
        }
        Command::Fingerprint { files } => {
            let buffers = files
                .iter()
                .map(|path| read_buffer(path))
                .collect::<Result<Vec<_>, _>>()?;
            println!("{}", file_set_fingerprint(&buffers));
        }
        Command::Demo { timeout_ms, hang } => {
            let config = CodeModeConfig {
                request_timeout_ms: timeout_ms.unwrap_or(config.request_timeout_ms),
                ..config
            };
            config.validate().map_err(|err| err.to_string())?;
            demo(config, hang).await?;
        }
        Command::Config => {
            let rendered = toml::to_string_pretty(&config).map_err(|err| err.to_string())?;
            print!("{rendered}");
        }
        Command::Schema => {
            println!("{}", schema::generate());
        }
    }
    Ok(())
}

fn read_buffer(path: &Path) -> Result<FileBuffer, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    Ok(FileBuffer::new(path.display().to_string(), content))
}

async fn demo(config: CodeModeConfig, hang: bool) -> Result<(), String> {
    let script = if hang {
        MockScript::Hang
    } else {
        MockScript::complete(vec![OrchestratorDiff {
            file_path: "a.ts".to_string(),
            kind: DiffKind::Modify,
            line_start: 1,
            line_end: None,
            new_content: "// comment".to_string(),
            old_content: Some("line1".to_string()),
            confidence: Some(0.9),
        }])
    };
    let service = CodeModeService::new(config, Arc::new(MockOrchestrator::new(script)));
    service.init().await;
    let mut events = service.subscribe();

    let id = service
        .create_session(vec![FileBuffer::new("a.ts", "line0\nline1\nline2")])
        .await
        .map_err(|err| err.to_string())?;
    let response = service
        .execute_code_task(&id, "add a comment", None, None)
        .await;
    print_response(&response)?;

    if let CodeModeResponse::DiffPreview { diffs, .. } = &response {
        let confirmation = service.apply_diffs(&id, diffs).await;
        print_response(&confirmation)?;
        if let Some(file) = service
            .get_session_info(&id)
            .await
            .and_then(|session| session.file("a.ts").cloned())
        {
            println!("{}\n{}", "a.ts:".if_supports_color(Stream::Stdout, |text| text.bold()), file.content);
        }
    }

    service.destroy().await;
    while let Some(record) = events.try_recv() {
        println!(
            "{:>4} {} {}",
            record.seq,
            record
                .body
                .name()
                .if_supports_color(Stream::Stdout, |text| text.cyan()),
            record.body.session_id()
        );
    }
    Ok(())
}

fn print_response(response: &CodeModeResponse) -> Result<(), String> {
    let label = if response.success() {
        response
            .kind()
            .if_supports_color(Stream::Stdout, |text| text.green())
            .to_string()
    } else {
        response
            .kind()
            .if_supports_color(Stream::Stdout, |text| text.red())
            .to_string()
    };
    let body = serde_json::to_string_pretty(response).map_err(|err| err.to_string())?;
    println!("{label}\n{body}");
    Ok(())
}
