use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use beacon_duplex::api::ApiServer;
use beacon_duplex::voice::{AudioCapture, AudioPlayback, PlaybackScheduler, pcm};
use beacon_duplex::{ClientEvent, Config, RelayOptions, SessionRelay, VoiceClient, upstream};

/// Beacon Duplex - real-time voice relay between clients and an AI voice service
#[derive(Parser)]
#[command(name = "beacon-duplex", version, about)]
struct Cli {
    /// Config file (default: ~/.config/omni/beacon/duplex.toml)
    #[arg(short, long, env = "BEACON_DUPLEX_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server (default)
    Serve {
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
    },
    /// Talk to a relay through the default microphone and speaker
    Talk {
        /// Relay WebSocket URL
        #[arg(default_value = "ws://127.0.0.1:18790/ws/voice")]
        url: String,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output through the playback scheduler
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,beacon_duplex=info",
        1 => "info,beacon_duplex=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config).await
        }
        Command::Talk { url } => talk(&url, config).await,
        Command::TestMic { duration } => test_mic(&config, duration).await,
        Command::TestSpeaker => test_speaker(&config).await,
    }
}

/// Run the relay until interrupted
async fn serve(config: Config) -> anyhow::Result<()> {
    let upstream = upstream::from_config(&config);
    tracing::info!(
        upstream = upstream.name(),
        url = ?config.upstream.url.as_ref().map(url::Url::as_str),
        "starting voice relay"
    );

    let relay = SessionRelay::new(upstream, RelayOptions::from(&config));
    let server = ApiServer::new(relay, config.server.addr()?, config.relay.client_queue);

    server
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("interrupt received, shutting down");
        })
        .await?;

    Ok(())
}

/// Run an interactive voice session until interrupted or the session ends
#[allow(clippy::future_not_send)]
async fn talk(url: &str, config: Config) -> anyhow::Result<()> {
    let mut client = VoiceClient::connect(url, config.audio).await?;
    println!("Connected to {url}, waiting for session...");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping...");
                break;
            }
            event = client.next_event() => match event {
                Some(ClientEvent::SessionStarted { session_id, .. }) => {
                    println!("Session {session_id} started - speak now (Ctrl-C to stop)");
                    if let Err(e) = client.start_capture() {
                        println!("Microphone unavailable ({}): {e}", e.code());
                        println!("Continuing without capture.");
                    }
                }
                Some(ClientEvent::Transcript(text)) => println!("> {text}"),
                Some(event @ ClientEvent::SessionExpired { .. }) => {
                    if let Some(e) = event.error() {
                        println!("{e}");
                    }
                    break;
                }
                Some(ClientEvent::SessionError { code, message }) => {
                    println!("Session error ({code}): {message}");
                    if code != "session_active" {
                        break;
                    }
                }
                Some(ClientEvent::SessionEnded { reason }) => {
                    println!("Session ended{}", reason.map(|r| format!(": {r}")).unwrap_or_default());
                    break;
                }
                Some(ClientEvent::Disconnected) | None => {
                    println!("Disconnected from relay");
                    break;
                }
            }
        }
    }

    client.stop();
    Ok(())
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let (frames_tx, mut frames_rx) = mpsc::channel(16);
    let mut capture = AudioCapture::new(config.audio.input_sample_rate, config.audio.frame_samples)?;
    capture.start(frames_tx)?;

    let sample_rate = capture.sample_rate();
    println!("Sample rate: {sample_rate} Hz, frame: {} samples", config.audio.frame_samples);
    println!("---");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, frames_rx.recv()).await {
        let samples = pcm::decode_pcm16(&frame.pcm)?;
        let energy = calculate_rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[#{:3} {:5}ms] RMS: {:.4} | Peak: {:.4} | [{}]",
            frame.seq, frame.timestamp_ms, energy, peak, meter
        );
    }

    if let Some(stats) = capture.stats() {
        println!("\n{} frames captured, {} dropped", stats.emitted(), stats.dropped());
    }
    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Test speaker output with a sine wave split into chained buffers
#[allow(clippy::future_not_send)]
async fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a continuous 440Hz tone for 2 seconds\n");

    let sample_rate = config.audio.output_sample_rate;
    let mut scheduler = PlaybackScheduler::new(AudioPlayback::new(sample_rate)?);
    scheduler.start()?;

    let frequency = 440.0_f32;
    let num_samples = sample_rate as usize * 2;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    // Uneven buffers, as they would arrive from the network
    for chunk in samples.chunks((sample_rate as usize / 7).max(1)) {
        scheduler.enqueue(chunk.to_vec());
    }

    println!("Playing {} samples at {sample_rate} Hz...", samples.len());
    tokio::time::sleep(scheduler.duration_of(num_samples) + Duration::from_millis(300)).await;

    let stats = scheduler.stats();
    println!("Played {} buffers, {} underruns", stats.played(), stats.underruns());
    scheduler.stop();

    println!("\n---");
    println!("If you heard a steady tone with no clicks, playback chaining works!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}
