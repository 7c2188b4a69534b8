use anyhow::Result;
use clap::Parser;
use radscribe_client::capture::{
    CaptureFactory, LevelMeter, MicCaptureFactory,
};
use radscribe_client::{DictationSession, SessionEvent, SessionState, WsConnector};
use std::io::{IsTerminal, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// WebSocket URL of the dictation service
    #[arg(long, default_value = "wss://localhost:8443/api/dictation")]
    url: String,

    /// Bearer token for the transport handshake
    #[arg(long, env = "RADSCRIBE_TOKEN")]
    auth_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Stream microphone audio and print the live transcript
    Dictate(DictateArgs),
    /// Check microphone input locally (no server required)
    MicCheck(MicCheckArgs),
}

#[derive(clap::Args, Debug)]
struct DictateArgs {
    /// Show elapsed/remaining time on stderr once per second
    #[arg(long)]
    show_clock: bool,
}

#[derive(clap::Args, Debug)]
struct MicCheckArgs {
    /// Duration to run in seconds (0 = until Ctrl+C)
    #[arg(long, default_value = "0")]
    duration: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    match args.command {
        Command::Dictate(dictate_args) => {
            run_dictate(args.url, args.auth_token, dictate_args).await
        }
        Command::MicCheck(mic_check_args) => run_mic_check(mic_check_args).await,
    }
}

async fn run_dictate(url: String, auth_token: Option<String>, args: DictateArgs) -> Result<()> {
    let token = auth_token
        .ok_or_else(|| anyhow::anyhow!("--auth-token or RADSCRIBE_TOKEN is required"))?;

    info!(url = %url, "starting dictation session");
    let connector = Arc::new(WsConnector::new(url));
    let capture = Arc::new(MicCaptureFactory);
    let (session, mut events) = DictationSession::new(connector, capture, token);

    eprintln!("Connecting to dictation service...");
    session.start_recording().await;

    if session.state() != SessionState::Recording {
        match session.last_error() {
            Some(message) => anyhow::bail!(message),
            None => anyhow::bail!("session did not start"),
        }
    }

    if let Some(tier) = session.tier() {
        let limit = session.max_duration_seconds().unwrap_or(0);
        eprintln!("Recording (tier: {tier}, limit: {limit}s). Ctrl+C to stop.");
    }

    let stdout_is_tty = std::io::stdout().is_terminal();
    let mut clock = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nStopping...");
                break;
            }
            _ = clock.tick(), if args.show_clock => {
                let elapsed = session.elapsed_seconds();
                let remaining = session.remaining_seconds().unwrap_or(0);
                eprint!("\r[{}:{:02} elapsed, {}:{:02} remaining] ",
                    elapsed / 60, elapsed % 60, remaining / 60, remaining % 60);
                let _ = std::io::stderr().flush();
            }
            ev = events.recv() => {
                let Some(ev) = ev else {
                    break;
                };

                match ev {
                    SessionEvent::TranscriptUpdate { final_text, interim_text } => {
                        if interim_text.is_empty() {
                            println!("\r\x1b[K{final_text}");
                        } else if stdout_is_tty {
                            print!("\r\x1b[K{interim_text}");
                            let _ = std::io::stdout().flush();
                        }
                    }
                    SessionEvent::LimitReached { message } => {
                        eprintln!("\nRecording limit reached: {message}");
                        eprintln!("Upgrade your plan to extend dictation time.");
                        break;
                    }
                    SessionEvent::Failed { message } => {
                        eprintln!("\nSession failed: {message}");
                        break;
                    }
                }
            }
        }
    }

    session.stop_recording().await;
    Ok(())
}

async fn run_mic_check(args: MicCheckArgs) -> Result<()> {
    let factory = MicCaptureFactory;
    if !factory.is_available() {
        anyhow::bail!("no audio input device available");
    }

    let (mut stream, control) = factory.open().await?;
    let mut meter = LevelMeter::default();

    let stop_at = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));
    eprintln!("Listening... (Ctrl+C to stop)");

    loop {
        let deadline = async {
            match stop_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = deadline => break,
            chunk = stream.recv() => {
                let Some(chunk) = chunk else {
                    break;
                };

                let level = meter.process(chunk.as_bytes());
                let filled = (((level.rms_db + 60.0) / 60.0) * 30.0).clamp(0.0, 30.0) as usize;
                eprint!(
                    "\r[{:<30}] rms {:6.1} dB  peak {:6.1} dB",
                    "#".repeat(filled),
                    level.rms_db,
                    level.peak_db
                );
                let _ = std::io::stderr().flush();
            }
        }
    }

    control.stop();
    eprintln!("\nMicrophone check finished.");
    Ok(())
}
