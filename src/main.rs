use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use talkback::config::file;
use talkback::voice::{
    AudioCapture, AudioOutput, AudioPlayback, BlockingPcm, Chunker, DeepgramConnector, GlobalKey,
    TtsClient, capture, list_input_devices, parse_key, playback,
};
use talkback::{Components, Config, GeminiClient, Pipeline, Responder, Shared, Speaker};

/// Talkback - hold a key, ask a question, hear the answer
#[derive(Parser)]
#[command(name = "talkback", version, about)]
struct Cli {
    /// Config file (default: <config dir>/talkback/config.toml)
    #[arg(short, long, env = "TALKBACK_CONFIG")]
    config: Option<PathBuf>,

    /// Push-to-talk key (e.g. "space", "f8", "ctrl")
    #[arg(short, long)]
    key: Option<String>,

    /// Number of LLM/TTS workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Record spoken replies to WAV files
    #[arg(long)]
    save_wav: bool,

    /// Do not render partial transcripts
    #[arg(long)]
    no_partials: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Run the push-to-talk assistant (default)
    Run,
    /// List audio input devices
    Devices,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output with a tone
    TestSpeaker,
    /// Speak a phrase through streaming TTS
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
        /// Also save the audio to a WAV file
        #[arg(long)]
        save: bool,
    },
    /// Send one prompt to the LLM
    TestLlm {
        /// Prompt text
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,talkback=info",
        1 => "info,talkback=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_pipeline(config).await,
        Command::Devices => devices(),
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker().await,
        Command::TestTts { text, save } => test_tts(config, &text, save).await,
        Command::TestLlm { text } => test_llm(config, &text).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let overlay = cli
        .config
        .as_deref()
        .map_or_else(file::load_config_file, file::load_from);

    let mut config = Config::load_with(overlay, |name| std::env::var(name).ok())?;

    if let Some(key) = &cli.key {
        config.keys.key.clone_from(key);
    }
    if let Some(workers) = cli.workers {
        config.pipeline.workers = workers;
    }
    if cli.save_wav {
        config.tts.save_wav = true;
    }
    if cli.no_partials {
        config.stt.show_partials = false;
    }

    config.validate()?;
    Ok(config)
}

/// Run the assistant until Ctrl-C
///
/// The capture stream is not `Send`, so it stays on this future while the
/// pipeline tasks run on the runtime.
#[allow(clippy::future_not_send)]
async fn run_pipeline(config: Config) -> anyhow::Result<()> {
    warn_missing_credentials(&config);

    let shared = Arc::new(Shared::new());
    let key = parse_key(&config.keys.key)?;
    let keys = Arc::new(GlobalKey::spawn(key)?);

    let (audio_tx, audio_rx) = mpsc::unbounded_channel();
    let mut capture = AudioCapture::new()?;
    let chunker = Chunker::new(
        capture.sample_rate(),
        config.stt.sample_rate,
        Arc::clone(&shared),
        audio_tx,
    );
    capture.start(chunker, config.stt.chunk_ms)?;
    tracing::info!(
        device = %capture.device_name(),
        sample_rate = capture.sample_rate(),
        channels = capture.channels(),
        "microphone open"
    );

    let output: Arc<dyn AudioOutput> = Arc::new(AudioPlayback);
    let components = Components {
        keys,
        stt: Arc::new(DeepgramConnector::new(config.stt.clone())),
        responder: Arc::new(GeminiClient::new(config.llm.clone())),
        speaker: Arc::new(TtsClient::new(
            config.tts.clone(),
            config.output.tts_dir.clone(),
            output,
        )),
    };

    let stopper = Arc::clone(&shared);
    let signal_task = tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
        }
        stopper.flags.stop();
    });

    Pipeline::new(config, Arc::clone(&shared), components)
        .run(audio_rx)
        .await;

    signal_task.abort();
    capture.stop();
    Ok(())
}

fn warn_missing_credentials(config: &Config) {
    if config.stt.api_key.is_none() {
        tracing::warn!("DEEPGRAM_API_KEY not set, transcription will fail");
    }
    if config.llm.api_key.is_none() {
        tracing::warn!("GEMINI_API_KEY not set, replies will fail");
    }
    if config.tts.api_key.is_none() {
        tracing::warn!("ELEVENLABS_API_KEY not set, replies will not be spoken");
    }
}

fn devices() -> anyhow::Result<()> {
    let devices = list_input_devices()?;
    if devices.is_empty() {
        println!("No input devices found");
        return Ok(());
    }

    for device in devices {
        println!(
            "{} {} ({} ch @ {} Hz)",
            if device.is_default { "*" } else { " " },
            device.name,
            device.input_channels,
            device.sample_rate
        );
    }
    Ok(())
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<f32>>();
    let mut mic = AudioCapture::new()?;
    mic.start_with(None, move |data| {
        let _ = tx.send(data.to_vec());
    })?;

    println!("Device: {}", mic.device_name());
    println!("Sample rate: {} Hz", mic.sample_rate());
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut samples = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            samples.extend(frame);
        }
        let energy = capture::rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]", i + 1);
    }

    mic.stop();

    println!("\n---");
    println!("If the meter moved, your mic is working.");
    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 16000;
    let tone = playback::sine_tone(440.0, Duration::from_secs(2), sample_rate, 0.3);

    let stream = BlockingPcm::new(AudioPlayback.open(sample_rate)?);
    stream.write(tone).await?;
    stream.close().await?;

    println!("Done!");
    Ok(())
}

/// Speak one phrase through streaming TTS
async fn test_tts(mut config: Config, text: &str, save: bool) -> anyhow::Result<()> {
    println!("Speaking: \"{text}\"");

    config.tts.save_wav |= save;
    let tts = TtsClient::new(config.tts, config.output.tts_dir, Arc::new(AudioPlayback));

    if let Some(path) = tts.speak(text).await? {
        println!("Saved to {}", path.display());
    }
    println!("Done!");
    Ok(())
}

/// One LLM round trip
async fn test_llm(config: Config, text: &str) -> anyhow::Result<()> {
    let llm = GeminiClient::new(config.llm);
    let reply = llm.reply(text).await?;
    println!("{reply}");
    Ok(())
}
