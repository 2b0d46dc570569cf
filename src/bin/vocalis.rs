//! CLI binary for vocalis.

use clap::{Parser, Subcommand};
use std::io::Write as _;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vocalis::transport::types::TtsRequest;
use vocalis::{
    AppConfig, ChatEvent, ChatOrchestrator, HttpTransport, MessageId, SessionConfigUpdate,
    SpeechEvent, TurnEvent,
};

/// Vocalis: streaming chat and voice core for AI-led interviews.
#[derive(Parser)]
#[command(name = "vocalis", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Start an interactive interview in the terminal.
    Chat {
        /// Do not speak replies automatically.
        #[arg(long)]
        mute: bool,
    },

    /// Check whether the backend is reachable.
    Health,

    /// List models offered by the backend.
    Models,

    /// Synthesize text to an audio file.
    Speak {
        /// Text to speak.
        text: String,

        /// Output file.
        #[arg(short, long, default_value = "speech.mp3")]
        out: PathBuf,
    },

    /// Write the effective configuration to the config path.
    InitConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so they do not interleave with streamed replies.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("vocalis=info,reqwest=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let path = cli.config.unwrap_or_else(AppConfig::default_config_path);
    let mut config = AppConfig::load_or_default(&path)?;
    config.apply_env_overrides();
    config.validate()?;

    match cli.command.unwrap_or(Command::Chat { mute: false }) {
        Command::Chat { mute } => run_chat(config, mute).await,
        Command::Health => run_health(&config).await,
        Command::Models => run_models(&config).await,
        Command::Speak { text, out } => run_speak(&config, &text, &out).await,
        Command::InitConfig => {
            config.save_to_file(&path)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
    }
}

async fn run_chat(config: AppConfig, mute: bool) -> anyhow::Result<()> {
    println!("Vocalis v{}", env!("CARGO_PKG_VERSION"));

    let chat = ChatOrchestrator::from_config(&config)?;
    if mute {
        chat.set_auto_speak(false);
    }
    if !chat.health_check().await {
        eprintln!("Backend at {} is not reachable.", config.backend.base_url);
    }

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down...");
            cancel_clone.cancel();
        }
    });

    let printer = tokio::spawn(print_events(chat.subscribe()));

    println!(
        "\nCommands: /clear /stop /pause /resume /play <message id> /model <name> /transcript /quit\n"
    );
    // Ctrl+C during the greeting abandons it like any other turn.
    let greeted = tokio::select! {
        () = cancel.cancelled() => false,
        _ = chat.initialize() => true,
    };
    if !greeted {
        chat.clear_chat();
        printer.abort();
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };
        let line = line.trim();
        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/clear", _) => chat.clear_chat(),
            ("/stop", _) => chat.stop_speech(),
            ("/pause", _) => {
                if let Err(e) = chat.pause_speech() {
                    eprintln!("{e}");
                }
            }
            ("/resume", _) => {
                if let Err(e) = chat.resume_speech() {
                    eprintln!("{e}");
                }
            }
            ("/play", id) => {
                if let Err(e) = chat.play_speech(&MessageId::from_raw(id.trim())).await {
                    eprintln!("{e}");
                }
            }
            ("/model", name) => {
                if let Err(e) = chat.update_config(&SessionConfigUpdate::default().model(name.trim())) {
                    eprintln!("{e}");
                }
            }
            ("/transcript", _) => {
                println!("{}", serde_json::to_string_pretty(&chat.transcript())?);
            }
            _ if line.is_empty() => {}
            _ => {
                // Sent in the background so /clear can interrupt a turn.
                let chat = chat.clone();
                let text = line.to_owned();
                tokio::spawn(async move { chat.send_message(&text).await });
            }
        }
    }

    chat.clear_chat();
    printer.abort();
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<ChatEvent>) {
    loop {
        match events.recv().await {
            Ok(ChatEvent::Turn(TurnEvent::Started { .. })) => {
                print!("Interviewer: ");
                flush();
            }
            Ok(ChatEvent::Turn(TurnEvent::Progress { fragment, .. })) => {
                print!("{fragment}");
                flush();
            }
            Ok(ChatEvent::Turn(TurnEvent::Completed { message, .. })) => {
                println!("\n  [{}]\n", message.id);
            }
            Ok(ChatEvent::Turn(TurnEvent::Failed { error, .. })) => {
                println!();
                if !error.is_cancelled() {
                    eprintln!("{}", error.message());
                }
            }
            Ok(ChatEvent::Speech(SpeechEvent::Failed { error, .. })) => {
                eprintln!("speech: {}", error.message());
            }
            Ok(ChatEvent::Cleared) => println!("(conversation cleared)"),
            Ok(ChatEvent::Speech(_)) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!(skipped = n, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn flush() {
    let _ = std::io::stdout().flush();
}

async fn run_health(config: &AppConfig) -> anyhow::Result<()> {
    let transport = HttpTransport::new(&config.backend)?;
    if transport.health_check().await {
        println!("{}: ok", transport.base_url());
        Ok(())
    } else {
        anyhow::bail!("{}: unreachable", transport.base_url())
    }
}

async fn run_models(config: &AppConfig) -> anyhow::Result<()> {
    let transport = HttpTransport::new(&config.backend)?;
    let models = transport.list_models(&CancellationToken::new()).await?;
    if models.is_empty() {
        println!("No models available.");
    }
    for model in models {
        match model.size {
            Some(size) => println!("  - {} ({:.1} MB)", model.name, size as f64 / 1_048_576.0),
            None => println!("  - {}", model.name),
        }
    }
    Ok(())
}

async fn run_speak(config: &AppConfig, text: &str, out: &std::path::Path) -> anyhow::Result<()> {
    let transport = HttpTransport::new(&config.backend)?;
    let request = TtsRequest {
        text: text.to_owned(),
        lang: config.speech.lang.clone(),
        tld: config.speech.tld.clone(),
        slow: config.speech.slow,
    };
    let report = |p: vocalis::transport::types::SpeechProgress| {
        if let Some(percent) = p.percent() {
            info!(percent = format!("{percent:.0}"), "downloading speech");
        }
    };
    let clip = transport
        .synthesize_speech(&request, &CancellationToken::new(), Some(&report))
        .await?;
    tokio::fs::write(out, &clip.data).await?;
    println!("Wrote {} bytes to {}", clip.len(), out.display());
    Ok(())
}
