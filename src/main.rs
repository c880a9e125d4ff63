use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kiddo_speech::asr::StatusCallback;
use kiddo_speech::config::file;
use kiddo_speech::voice::{self, AudioFrame, SAMPLE_RATE};
use kiddo_speech::{Config, CredentialProvider, HttpCredentialProvider, Listener, Microphone};

/// Kiddo Speech - streaming speech recognition for pronunciation practice
#[derive(Parser)]
#[command(name = "kiddo-speech", version, about)]
struct Cli {
    /// Read configuration from this file instead of the default location
    #[arg(short, long, env = "KIDDO_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one listening attempt and print the transcript
    Listen {
        /// Text the speaker is expected to say; enables early exit and scoring
        #[arg(short, long)]
        expect: Option<String>,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Save the capture, resampled to 16 kHz, as a WAV file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Fetch a credential from the token endpoint
    Token,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn,kiddo_speech=info",
        1 => "info,kiddo_speech=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => Config::from_file(file::load_from(path))?,
        None => Config::load()?,
    };
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Command::Listen { expect } => listen(config, expect).await,
        Command::TestMic { duration, output } => {
            test_mic(duration, output).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Token => {
            token(&config).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// One attempt; Ctrl-C stops it early
async fn listen(config: Config, expected: Option<String>) -> anyhow::Result<ExitCode> {
    let listener = Listener::from_config(config.speech);
    listener.ensure_microphone()?;

    let on_status: StatusCallback = Arc::new(|status| println!("[{}]", status.label()));
    let attempt = listener.start_attempt(expected, Some(on_status));

    let settlement = tokio::select! {
        settlement = attempt.wait() => settlement,
        _ = tokio::signal::ctrl_c() => {
            println!("stopping...");
            attempt.stop().await
        }
    };
    listener.release_microphone();

    let transcript = settlement?;
    println!("\n---");
    println!("Transcript: {}", transcript.text);
    if let Some(heard) = &transcript.heard {
        println!("Heard: {heard}");
    }
    println!(
        "Elapsed: {} ms{}{}",
        transcript.elapsed.as_millis(),
        if transcript.early_exit { " (early exit)" } else { "" },
        if transcript.timed_out { " (timed out)" } else { "" },
    );

    Ok(match transcript.passed {
        Some(true) => {
            println!("Result: PASS");
            ExitCode::SUCCESS
        }
        Some(false) => {
            println!("Result: FAIL");
            ExitCode::from(2)
        }
        None => ExitCode::SUCCESS,
    })
}

/// Test microphone input
async fn test_mic(duration: u64, output: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let microphone = Microphone::system();
    let stream = microphone.ensure_stream()?;
    let mut tap = stream.tap()?;

    let mut recorded: Vec<f32> = Vec::new();
    let mut native_rate = None;
    println!("---");

    for i in 0..duration {
        let mut second: Vec<f32> = Vec::new();
        let tick = tokio::time::sleep(Duration::from_secs(1));
        tokio::pin!(tick);

        loop {
            tokio::select! {
                () = &mut tick => break,
                frame = tap.recv() => match frame {
                    Some(AudioFrame { samples, sample_rate }) => {
                        native_rate.get_or_insert(sample_rate);
                        second.extend_from_slice(&samples);
                        if output.is_some() {
                            recorded.extend(voice::resample(&samples, sample_rate));
                        }
                    }
                    None => anyhow::bail!("capture stream ended"),
                },
            }
        }

        let energy = calculate_rms(&second);
        let peak = second.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    drop(tap);
    microphone.release_stream();

    if let Some(rate) = native_rate {
        println!("\nNative sample rate: {rate} Hz");
    }

    if let Some(path) = output {
        let wav = voice::samples_to_wav(&recorded, SAMPLE_RATE)?;
        std::fs::write(&path, wav)?;
        println!("Saved {} samples to {}", recorded.len(), path.display());
    }

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

/// Fetch and describe a credential without printing the secret
async fn token(config: &Config) -> anyhow::Result<()> {
    let provider =
        HttpCredentialProvider::new(config.speech.token_url.clone(), config.speech.http_timeout);
    let credential = provider.fetch().await?;

    let token = credential.token();
    let prefix: String = token.chars().take(4).collect();
    println!("Endpoint: {}", config.speech.token_url);
    println!("App key:  {}", credential.application_key());
    println!("Token:    {prefix}... ({} chars)", token.chars().count());
    println!("Issued:   {}", credential.issued_at().to_rfc3339());

    Ok(())
}
