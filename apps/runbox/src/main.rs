use anyhow::{Context, Result, bail};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use runbox_client_core::client::{ExecutionClient, SessionState};
use runbox_client_core::config::{self, Config};
use runbox_client_core::session::{JobBroker, JobConfig};
use runbox_client_core::telemetry::logging::{self, LogConfig, LogLevel};
use runbox_client_core::terminal::LineKind;
use runbox_client_core::transport::websocket::WebSocketConnector;

#[derive(Parser, Debug)]
#[command(
    name = "runbox",
    about = "Run a source file on a remote execution sandbox and interact with it"
)]
struct Cli {
    /// Source file to execute; omitted, runs the language's
    /// hello-world template
    file: Option<PathBuf>,

    /// Language override (inferred from the file extension by default)
    #[arg(long, short = 'l')]
    language: Option<String>,

    /// Base URL of the job-creation endpoint
    #[arg(long, env = "RUNBOX_JOBS_URL")]
    jobs_url: Option<String>,

    /// WebSocket URL of the execution service
    #[arg(long, env = "RUNBOX_WS_URL")]
    ws_url: Option<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::default())]
    log_level: LogLevel,

    /// Write logs to a file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let defaults = Config::from_env();
    let jobs_url = cli.jobs_url.unwrap_or(defaults.jobs_url);
    let ws_url = cli.ws_url.unwrap_or(defaults.ws_url);

    let language = match (cli.language, &cli.file) {
        (Some(language), _) => language,
        (None, Some(file)) => {
            let extension = file
                .extension()
                .and_then(|extension| extension.to_str())
                .unwrap_or_default();
            config::language_for_extension(extension)
                .with_context(|| {
                    format!("cannot infer language for '.{extension}'; pass --language")
                })?
                .to_string()
        }
        (None, None) => config::DEFAULT_LANGUAGE.to_string(),
    };
    if !config::is_language_supported(&language) {
        bail!(
            "unsupported language '{language}' (supported: {})",
            config::SUPPORTED_LANGUAGES.join(", ")
        );
    }

    let code = match &cli.file {
        Some(file) => std::fs::read_to_string(file)
            .with_context(|| format!("failed to read {}", file.display()))?,
        None => config::default_code(&language).to_string(),
    };

    let broker = JobBroker::new(JobConfig::new(&jobs_url)?)?;
    let connector = Arc::new(WebSocketConnector::new());
    let client = ExecutionClient::new(broker, connector, ws_url);

    client.execute(&code, &language).await?;

    let mut changes = client.subscribe();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut printed = 0usize;

    loop {
        render_new_lines(&client, &mut printed)?;
        let state = client.state();
        if !state.is_active() {
            break;
        }
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => client.send_input(&line),
                Ok(None) | Err(_) => stdin_open = false,
            },
        }
    }
    render_new_lines(&client, &mut printed)?;

    let exit_code = match client.state() {
        SessionState::Completed => client.exit_code().unwrap_or(0),
        SessionState::Failed => 1,
        _ => 0,
    };
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

/// Prints output lines appended since the last call. Stdout fragments
/// are written verbatim so an open line keeps the cursor inline, the
/// way the remote program left it.
fn render_new_lines(client: &ExecutionClient, printed: &mut usize) -> Result<()> {
    let snapshot = client.output_snapshot();
    let mut stdout = std::io::stdout().lock();
    for line in snapshot.iter().skip(*printed) {
        match line.kind {
            LineKind::Stdout | LineKind::System => write!(stdout, "{}", line.content)?,
            LineKind::Stderr => eprint!("{}", line.content),
            // The user already saw what they typed.
            LineKind::Input => {}
        }
    }
    if snapshot.len() > *printed {
        let last_is_system = snapshot
            .last()
            .map(|line| line.kind == LineKind::System && !line.content.ends_with('\n'))
            .unwrap_or(false);
        if last_is_system {
            writeln!(stdout)?;
        }
        stdout.flush()?;
    }
    *printed = snapshot.len();
    Ok(())
}
