use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use hark::notify::NotifierKind;
use hark::voice::{
    AudioPlayback, CaptureSource, CpalCapture, KeywordSpotter, PlaybackSink, RETRY_BACKOFF,
    ReadOutcome, SAMPLE_RATE, samples_to_wav, sine_tone,
};
use hark::{Config, Daemon, LedNotifier, LogNotifier, StateNotifier, TcpTransport};

/// Hark - wake-word-gated voice assistant
#[derive(Parser)]
#[command(name = "hark", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Dialog service address (host:port)
    #[arg(long)]
    endpoint: Option<String>,

    /// Wake word model file
    #[arg(long)]
    model: Option<PathBuf>,

    /// Log state changes instead of driving LEDs
    #[arg(long)]
    no_leds: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Write the captured audio to a WAV file
        #[arg(long)]
        record: Option<PathBuf>,
    },
    /// Test speaker output
    TestSpeaker,
    /// List capture devices
    ListDevices,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,hark=info",
        1 => "info,hark=debug",
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

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(endpoint) = cli.endpoint {
        config.dialog.endpoint = endpoint;
    }
    if let Some(model) = cli.model {
        config.wake.model_path = Some(model);
    }
    if cli.no_leds {
        config.notify.kind = NotifierKind::Log;
    }

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration, record } => test_mic(&config, duration, record.as_deref()),
            Command::TestSpeaker => test_speaker(&config),
            Command::ListDevices => list_devices(),
        };
    }

    tracing::info!(
        endpoint = %config.dialog.endpoint,
        model = ?config.wake.model_path,
        notifier = ?config.notify.kind,
        "starting hark"
    );

    let spotter = create_spotter(&config)?;
    let capture: Arc<dyn CaptureSource> = Arc::new(CpalCapture::new(
        config.audio.capture_device.clone(),
        config.audio.chunk_frames,
    ));
    let transport = Arc::new(TcpTransport::new(config.dialog.endpoint.clone()));
    let playback = Box::new(AudioPlayback::new(config.audio.playback_device.clone()));
    let notifier: Arc<dyn StateNotifier> = match config.notify.kind {
        NotifierKind::Ubus => Arc::new(LedNotifier::start(
            config.notify.ubus_socket.clone(),
            config.notify.sounds_dir.clone(),
        )?),
        NotifierKind::Log => Arc::new(LogNotifier),
    };

    // Set up shutdown signal
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(()).await;
        }
    });

    let daemon = Daemon::new(
        capture,
        spotter,
        transport,
        playback,
        notifier,
        config.dialog.settings.clone(),
    );
    daemon.run(&mut shutdown_rx).await?;
    Ok(())
}

#[cfg(feature = "wake-word")]
fn create_spotter(config: &Config) -> anyhow::Result<KeywordSpotter> {
    let model = config.wake.model_path.as_ref().ok_or_else(|| {
        hark::Error::Config("wake word model required (--model or HARK_WAKE_MODEL)".to_string())
    })?;
    let engine = hark::voice::RustpotterEngine::new(config.wake.threshold);
    Ok(KeywordSpotter::create(&engine, model)?)
}

#[cfg(not(feature = "wake-word"))]
fn create_spotter(_config: &Config) -> anyhow::Result<KeywordSpotter> {
    Err(hark::Error::Config(
        "built without a wake word engine; rebuild with --features wake-word".to_string(),
    )
    .into())
}

/// Test microphone input with a level meter
fn test_mic(config: &Config, duration: u64, record: Option<&Path>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let source = CpalCapture::new(config.audio.capture_device.clone(), config.audio.chunk_frames);
    let mut device = source.open()?;

    println!("Sample rate: {SAMPLE_RATE} Hz");
    println!("---");

    let mut recorded: Vec<i16> = Vec::new();
    let mut overruns = 0usize;
    let started = Instant::now();

    for i in 0..duration {
        let second_end = started + Duration::from_secs(i + 1);
        let mut sum_squares = 0.0f32;
        let mut peak = 0.0f32;
        let mut frames = 0usize;

        while Instant::now() < second_end {
            match device.read_chunk() {
                Ok(chunk) => {
                    let rms = chunk.rms();
                    #[allow(clippy::cast_precision_loss)]
                    {
                        sum_squares += rms * rms * chunk.frames() as f32;
                    }
                    frames += chunk.frames();
                    for sample in chunk.samples() {
                        peak = peak.max((f32::from(sample) / 32768.0).abs());
                        if record.is_some() {
                            recorded.push(sample);
                        }
                    }
                }
                Err(ReadOutcome::TransientRetry | ReadOutcome::SuspendedRecoverable) => {
                    std::thread::sleep(RETRY_BACKOFF);
                }
                Err(ReadOutcome::Overrun) => overruns += 1,
                Err(ReadOutcome::Fatal) => {
                    device.close();
                    anyhow::bail!("capture device failed");
                }
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let energy = if frames == 0 {
            0.0
        } else {
            (sum_squares / frames as f32).sqrt()
        };

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    device.close();

    if overruns > 0 {
        println!("\n{overruns} overrun(s): audio was dropped");
    }

    if let Some(path) = record {
        let wav = samples_to_wav(&recorded, SAMPLE_RATE)?;
        std::fs::write(path, wav)?;
        println!("\nRecorded {} samples to {}", recorded.len(), path.display());
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: arecord -l (to list devices)");
    println!("  3. Run: hark list-devices");

    Ok(())
}

/// Test speaker output with a sine wave
fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let mut playback = AudioPlayback::new(config.audio.playback_device.clone());
    playback.start()?;
    playback.send(sine_tone(440.0, Duration::from_secs(2), 0.3))?;
    playback.drain();
    playback.stop()?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: aplay -l (to list devices)");
    println!("  2. Check the mixer with: alsamixer");

    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    let devices = CpalCapture::list_devices()?;
    if devices.is_empty() {
        println!("No capture devices found");
    }
    for name in devices {
        println!("{name}");
    }
    Ok(())
}
