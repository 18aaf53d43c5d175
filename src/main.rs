//! pastecall - P2P Voice Calls per Copy & Paste
//!
//! # Usage
//!
//! ```bash
//! # Anruf starten: Offer kopieren, Answer des Peers einfügen
//! pastecall call
//!
//! # Anruf annehmen: Offer als Argument oder über stdin
//! pastecall answer '{"type":"offer","sdp":"...","caller":true}'
//!
//! # Diagnose inklusive 10s Mikrofon-Test
//! pastecall diagnose --mic-test 10
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pastecall::call_engine::{list_devices, CpalCapture};
use pastecall::diagnostics::{
    default_checks, microphone_level_test, run_diagnostics, CheckOutcome,
};
use pastecall::{CallConfig, CallError, CallEvent, CallSetupCoordinator, ConnectionState};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Breite der Pegelanzeige im Mikrofon-Test
const LEVEL_BAR_WIDTH: usize = 40;

/// pastecall - Serverless P2P voice calls with copy/paste signaling
#[derive(Parser)]
#[command(name = "pastecall")]
#[command(author, version)]
#[command(about = "Serverless P2P voice calls, signaled by copying text between peers")]
struct Args {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to a config.toml (default: platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print descriptors as base64 instead of JSON
    #[arg(long, global = true)]
    armored: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a call: print the offer, then paste the peer's answer
    Call,

    /// Answer a call: paste the caller's offer, then send back the answer
    Answer {
        /// The offer text (read from stdin if omitted)
        offer: Option<String>,
    },

    /// Check WebRTC support, microphone access and audio output
    Diagnose {
        /// Additionally run a live microphone level test for SECS seconds
        #[arg(long, value_name = "SECS")]
        mic_test: Option<u64>,
    },

    /// List audio input and output devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = format!("pastecall={level},webrtc=warn");

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    let config = CallConfig::load(args.config.as_deref()).context("Failed to load config")?;
    tracing::debug!("Using config: {:?}", config);

    match args.command {
        Command::Call => run_caller(config, args.armored).await,
        Command::Answer { offer } => run_callee(config, offer, args.armored).await,
        Command::Diagnose { mic_test } => run_diagnose(config, mic_test).await,
        Command::Devices => print_devices(),
    }
}

// ============================================================================
// CALL FLOWS
// ============================================================================

async fn run_caller(config: CallConfig, armored: bool) -> Result<()> {
    let (coordinator, mut events) = CallSetupCoordinator::with_webrtc(config);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    eprintln!("Gathering network candidates...");
    let offer = coordinator
        .start_as_caller()
        .await
        .context("Failed to start call")?;

    eprintln!("\nSend this offer to your peer:\n");
    println!("{}", offer.encode(armored));
    eprintln!("\nPaste the peer's answer and press Enter:");

    loop {
        let Some(answer) = read_descriptor(&mut stdin).await? else {
            coordinator.end_call().await;
            bail!("stdin closed before an answer was pasted");
        };

        match coordinator.apply_remote_answer(&answer).await {
            Ok(()) => break,
            // Falsch eingefügt: Session bleibt, erneut versuchen
            Err(e @ (CallError::MalformedDescriptor(_) | CallError::RoleMismatch(_))) => {
                eprintln!("❌ {e}\nPaste the answer again:");
            }
            Err(e) => return Err(e).context("Failed to apply answer"),
        }
    }

    wait_for_call(&coordinator, &mut events).await
}

async fn run_callee(config: CallConfig, offer: Option<String>, armored: bool) -> Result<()> {
    let (coordinator, mut events) = CallSetupCoordinator::with_webrtc(config);

    let offer = match offer {
        Some(offer) => offer,
        None => {
            eprintln!("Paste the caller's offer and press Enter:");
            let mut stdin = BufReader::new(tokio::io::stdin()).lines();
            read_descriptor(&mut stdin)
                .await?
                .context("stdin closed before an offer was pasted")?
        }
    };

    eprintln!("Gathering network candidates...");
    let answer = coordinator
        .accept_as_callee(&offer)
        .await
        .context("Failed to accept offer")?;

    eprintln!("\nSend this answer back to the caller:\n");
    println!("{}", answer.encode(armored));
    eprintln!();

    wait_for_call(&coordinator, &mut events).await
}

/// Liest die nächste nicht-leere Zeile von stdin
async fn read_descriptor(stdin: &mut Lines<BufReader<Stdin>>) -> Result<Option<String>> {
    while let Some(line) = stdin.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if !line.is_empty() {
            return Ok(Some(line.to_string()));
        }
    }
    Ok(None)
}

/// Wartet auf Events bis der Anruf scheitert oder Ctrl+C gedrückt wird
async fn wait_for_call(
    coordinator: &CallSetupCoordinator,
    events: &mut mpsc::UnboundedReceiver<CallEvent>,
) -> Result<()> {
    eprintln!("Waiting for the connection... (Ctrl+C to hang up)");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let result = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                eprintln!("\nHanging up...");
                break Ok(());
            }
            event = events.recv() => match event {
                Some(CallEvent::StateChanged(ConnectionState::Connected)) => {
                    eprintln!("✅ Connected");
                }
                Some(CallEvent::StateChanged(ConnectionState::Disconnected)) => {
                    eprintln!("⚠️  Connection lost, waiting for it to recover...");
                }
                Some(CallEvent::StateChanged(state)) => {
                    tracing::info!("Call state: {}", state);
                }
                Some(CallEvent::RemoteStream(stream)) => {
                    eprintln!("🔊 Receiving audio ({})", stream.mime_type);
                }
                Some(CallEvent::Error(e)) => break Err(e).context("Call failed"),
                None => break Ok(()),
            }
        }
    };

    coordinator.end_call().await;
    result
}

// ============================================================================
// DIAGNOSTICS
// ============================================================================

async fn run_diagnose(config: CallConfig, mic_test: Option<u64>) -> Result<()> {
    let checks = default_checks(&config);
    let report = run_diagnostics(&checks, config.diagnostics_pacing()).await;

    for result in &report.results {
        match &result.outcome {
            CheckOutcome::Passed(detail) => println!("✅ {}: {}", result.name, detail),
            CheckOutcome::Failed(reason) => println!("❌ {}: {}", result.name, reason),
        }
    }

    if let Some(secs) = mic_test {
        println!("\nSpeak into your microphone...");
        let outcome = microphone_level_test(
            &CpalCapture,
            &config.audio,
            Duration::from_secs(secs),
            |level| {
                let filled = ((level * LEVEL_BAR_WIDTH as f32) as usize).min(LEVEL_BAR_WIDTH);
                print!(
                    "\r[{}{}] {:>3.0}%",
                    "█".repeat(filled),
                    " ".repeat(LEVEL_BAR_WIDTH - filled),
                    level * 100.0
                );
                let _ = std::io::stdout().flush();
            },
        )
        .await;
        println!();

        match outcome {
            Ok(level) => println!("✅ Microphone signal detected ({:.0}%)", level * 100.0),
            Err(e) => println!("❌ Microphone test: {e}"),
        }
    }

    let failed = report.failures().count();
    if failed > 0 {
        bail!("{failed} diagnostic check(s) failed");
    }
    Ok(())
}

fn print_devices() -> Result<()> {
    let devices = list_devices().context("Failed to enumerate audio devices")?;

    println!("Input devices:");
    for device in &devices.inputs {
        let marker = if device.is_default { "*" } else { " " };
        println!("  {marker} {}", device.name);
    }

    println!("Output devices:");
    for device in &devices.outputs {
        let marker = if device.is_default { "*" } else { " " };
        println!("  {marker} {}", device.name);
    }
    Ok(())
}
