//! `talkscriber` command-line client.
//!
//! ```text
//! talkscriber stt [--file in.wav]          live or file transcription
//! talkscriber tts "text" [--output a.wav]  speak through the speakers and/or a file
//! talkscriber batch recording.wav          offline job over HTTP
//! talkscriber devices                      list audio devices
//! talkscriber config show|path|set-key     stored settings
//! ```

mod settings;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::Receiver;
use talkscriber_core::{
    audio::device::{list_devices, DeviceKind},
    batch::{full_transcript, BatchClient, BatchConfig},
    config::{SessionConfig, Task, TurnDetectionConfig},
    CaptureSource, GenerationConfig, JitterBufferConfig, SinkTarget, SpeechClient, SttConfig,
    TranscriptEvent, TranscriptionClient, TtsConfig, UnderrunPolicy,
};
use tracing::{debug, info};

use settings::{default_settings_path, load_settings, save_settings, CliSettings};

#[derive(Parser, Debug)]
#[command(name = "talkscriber", version, about = "Talkscriber speech client")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// API key; falls back to the stored settings
    #[arg(long, global = true, env = "TALKSCRIBER_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Settings file
    #[arg(long, global = true, value_name = "PATH")]
    settings: Option<PathBuf>,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream audio and print the transcript as it arrives
    Stt(SttArgs),
    /// Synthesize speech
    Tts(TtsArgs),
    /// Transcribe a file with the offline batch API
    Batch(BatchArgs),
    /// List audio devices
    Devices {
        #[arg(long)]
        json: bool,
    },
    /// Inspect or edit stored settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args, Debug)]
struct SttArgs {
    /// Stream a WAV file instead of the microphone
    #[arg(long, value_name = "WAV")]
    file: Option<PathBuf>,
    /// Pace file audio at real time
    #[arg(long, requires = "file")]
    realtime: bool,
    /// Input device name
    #[arg(long, value_name = "NAME")]
    device: Option<String>,
    #[arg(long, value_name = "CODE")]
    language: Option<String>,
    /// Let the service detect the language
    #[arg(long)]
    multilingual: bool,
    /// Translate into English
    #[arg(long)]
    translate: bool,
    /// Report turn ends after this much silence
    #[arg(long, value_name = "MS")]
    turn_timeout_ms: Option<u64>,
    /// Do not print partial segments
    #[arg(long)]
    finals_only: bool,
    /// How long to wait for trailing segments after a file ends
    #[arg(long, value_name = "MS", default_value_t = 3000)]
    drain_ms: u64,
    /// One JSON event per line
    #[arg(long)]
    json: bool,
    #[arg(long, value_name = "URL")]
    url: Option<String>,
}

#[derive(Args, Debug)]
struct TtsArgs {
    text: String,
    /// Also write the audio to a WAV file
    #[arg(long, short, value_name = "WAV")]
    output: Option<PathBuf>,
    /// Do not play through the speakers
    #[arg(long, requires = "output")]
    no_play: bool,
    /// Output device name
    #[arg(long, value_name = "NAME")]
    device: Option<String>,
    #[arg(long, value_name = "NAME")]
    speaker: Option<String>,
    #[arg(long)]
    temperature: Option<f32>,
    #[arg(long)]
    top_p: Option<f32>,
    #[arg(long)]
    top_k: Option<u32>,
    #[arg(long)]
    max_tokens: Option<u32>,
    #[arg(long)]
    repetition_penalty: Option<f32>,
    /// Repeat the last chunk instead of playing silence on underrun
    #[arg(long)]
    hold_last: bool,
    #[arg(long)]
    json: bool,
    #[arg(long, value_name = "URL")]
    url: Option<String>,
}

#[derive(Args, Debug)]
struct BatchArgs {
    file: PathBuf,
    #[arg(long, value_name = "CODE")]
    language: Option<String>,
    #[arg(long)]
    translate: bool,
    /// Extra analyses to request, e.g. `--features sentiment redaction`
    #[arg(long, num_args = 1.., value_name = "FEATURE")]
    features: Vec<String>,
    /// Print the segments as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective settings (the key is masked)
    Show,
    /// Print the settings file location
    Path,
    /// Store an API key
    SetKey { key: String },
}

fn init_tracing(quiet: bool) {
    let default = if quiet {
        "warn"
    } else {
        "talkscriber_cli=info,talkscriber_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet);

    let settings_path = cli.settings.clone().unwrap_or_else(default_settings_path);
    let settings = load_settings(&settings_path);
    debug!(path = %settings_path.display(), "settings loaded");

    match cli.command {
        Command::Stt(args) => run_stt(args, &settings, cli.api_key).await,
        Command::Tts(args) => run_tts(args, &settings, cli.api_key).await,
        Command::Batch(args) => run_batch(args, &settings, cli.api_key).await,
        Command::Devices { json } => run_devices(json),
        Command::Config { action } => run_config(action, settings, &settings_path),
    }
}

fn resolve_api_key(flag: Option<String>, settings: &CliSettings) -> Result<String> {
    flag.filter(|k| !k.trim().is_empty())
        .or_else(|| settings.api_key.clone())
        .context("no API key: pass --api-key, set TALKSCRIBER_API_KEY or run `talkscriber config set-key`")
}

fn stt_config(args: &SttArgs, settings: &CliSettings, api_key: String) -> SttConfig {
    let mut config = SttConfig::new(api_key);
    config.session = SessionConfig::new(args.url.as_deref().unwrap_or(&settings.stt_url));
    config.language = args
        .language
        .as_deref()
        .map(settings::normalize_language)
        .unwrap_or_else(|| settings.language.clone());
    config.multilingual = args.multilingual || settings.multilingual;
    config.task = if args.translate {
        Task::Translate
    } else {
        Task::Transcribe
    };
    config.turn_detection = match args.turn_timeout_ms {
        Some(ms) => TurnDetectionConfig {
            enabled: true,
            timeout: Duration::from_millis(ms),
        },
        None => TurnDetectionConfig {
            enabled: settings.turn_detection,
            timeout: Duration::from_millis(settings.turn_timeout_ms),
        },
    };
    config.emit_partials = !args.finals_only;
    config
}

async fn run_stt(args: SttArgs, settings: &CliSettings, api_key: Option<String>) -> Result<()> {
    let config = stt_config(&args, settings, resolve_api_key(api_key, settings)?);
    let client = TranscriptionClient::new(config).context("invalid transcription settings")?;

    let source = match &args.file {
        Some(path) => CaptureSource::WavFile {
            path: path.clone(),
            realtime: args.realtime,
        },
        None => CaptureSource::Microphone {
            preferred: args
                .device
                .clone()
                .or_else(|| settings.preferred_input_device.clone()),
        },
    };
    let from_file = args.file.is_some();

    let session = client.start(source).await.context("failed to start transcription")?;
    info!(uid = %session.uid(), "streaming; press Ctrl+C to stop");

    let json = args.json;
    let events = session.events();
    let mut printer = tokio::task::spawn_blocking(move || print_events(events, json));

    let summary = if from_file {
        tokio::select! {
            summary = session.finish(Duration::from_millis(args.drain_ms)) => summary,
            _ = tokio::signal::ctrl_c() => {
                bail!("interrupted");
            }
        }
    } else {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = &mut printer => {}
        }
        session.stop().await
    };

    if !printer.is_finished() {
        printer.await.context("event printer")?;
    }
    let summary = summary.context("transcription failed")?;
    info!(
        frames = summary.capture.frames_sent,
        finals = summary.assembler.finals_emitted,
        "done"
    );
    Ok(())
}

/// Runs until the session-ended event.
fn print_events(events: Receiver<TranscriptEvent>, json: bool) {
    use std::io::Write;

    let mut partial_open = false;
    for event in events.iter() {
        let terminal = event.is_terminal();
        if json {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{line}");
            }
        } else {
            match &event {
                TranscriptEvent::Partial { segment, .. } => {
                    print!("\r\x1b[2K… {}", segment.text.trim());
                    let _ = std::io::stdout().flush();
                    partial_open = true;
                }
                TranscriptEvent::Final { segment, .. } => {
                    if partial_open {
                        print!("\r\x1b[2K");
                        partial_open = false;
                    }
                    let speaker = segment
                        .speaker_name
                        .as_deref()
                        .map(|s| format!("{s}: "))
                        .unwrap_or_default();
                    println!(
                        "[{:>7.2} - {:>7.2}] {speaker}{}",
                        segment.start,
                        segment.end,
                        segment.text.trim()
                    );
                }
                TranscriptEvent::TurnEnded { silence, .. } => {
                    debug!(silence_ms = silence.as_millis() as u64, "turn ended");
                }
                TranscriptEvent::Anomaly { anomaly, .. } => {
                    debug!(?anomaly, "transcript anomaly");
                }
                TranscriptEvent::SessionEnded { error, .. } => {
                    if partial_open {
                        println!();
                    }
                    if let Some(error) = error {
                        eprintln!("session ended: {error}");
                    }
                }
            }
        }
        if terminal {
            break;
        }
    }
}

fn tts_config(args: &TtsArgs, settings: &CliSettings, api_key: String) -> Result<TtsConfig> {
    let mut config = TtsConfig::new(api_key);
    config.session = SessionConfig::new(args.url.as_deref().unwrap_or(&settings.tts_url));
    config.model = settings.tts_model.clone();
    config.speaker_name = args
        .speaker
        .clone()
        .unwrap_or_else(|| settings.speaker_name.clone());
    config.jitter = JitterBufferConfig {
        capacity: settings.jitter_capacity,
        min_fill: settings.jitter_min_fill,
        ..JitterBufferConfig::default()
    };
    if args.hold_last {
        config.underrun = UnderrunPolicy::HoldLast;
    }

    let mut generation = GenerationConfig::builder();
    if let Some(v) = args.temperature {
        generation = generation.temperature(v);
    }
    if let Some(v) = args.top_p {
        generation = generation.top_p(v);
    }
    if let Some(v) = args.top_k {
        generation = generation.top_k(v);
    }
    if let Some(v) = args.max_tokens {
        generation = generation.max_tokens(v);
    }
    if let Some(v) = args.repetition_penalty {
        generation = generation.repetition_penalty(v);
    }
    config.generation = generation.build().context("invalid generation settings")?;
    Ok(config)
}

async fn run_tts(args: TtsArgs, settings: &CliSettings, api_key: Option<String>) -> Result<()> {
    let config = tts_config(&args, settings, resolve_api_key(api_key, settings)?)?;
    let client = SpeechClient::new(config).context("invalid speech settings")?;

    let mut outputs = Vec::new();
    if !args.no_play {
        outputs.push(SinkTarget::Device {
            preferred: args
                .device
                .clone()
                .or_else(|| settings.preferred_output_device.clone()),
        });
    }
    if let Some(path) = &args.output {
        outputs.push(SinkTarget::WavFile(path.clone()));
    }

    let session = client.open().await.context("failed to open speech session")?;
    let result = tokio::select! {
        report = session.say(&args.text, outputs) => Some(report),
        _ = tokio::signal::ctrl_c() => None,
    };
    session.close().await;

    let Some(report) = result else {
        bail!("interrupted");
    };
    let report = report.context("speech failed")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} chunks, {:.2}s of audio, ttfa {}",
            report.chunks,
            report.duration_secs,
            report
                .time_to_first_audio
                .map(|d| format!("{} ms", d.as_millis()))
                .unwrap_or_else(|| "n/a".into())
        );
        for failure in &report.sink_failures {
            eprintln!("sink {} failed: {}", failure.sink, failure.error);
        }
    }
    if let Some(error) = report.error {
        bail!("request ended early: {error}");
    }
    Ok(())
}

fn batch_config(args: &BatchArgs, settings: &CliSettings, api_key: String) -> BatchConfig {
    let mut config = BatchConfig::new(api_key);
    if let Some(url) = &settings.batch_url {
        config.url = url.clone();
    }
    config.language = args
        .language
        .as_deref()
        .map(settings::normalize_language)
        .unwrap_or_else(|| settings.language.clone());
    if args.translate {
        config.task = Task::Translate;
    }
    config.features = args.features.clone();
    config
}

async fn run_batch(args: BatchArgs, settings: &CliSettings, api_key: Option<String>) -> Result<()> {
    let config = batch_config(&args, settings, resolve_api_key(api_key, settings)?);

    let path = args.file.clone();
    // The batch client blocks while polling.
    let segments = tokio::task::spawn_blocking(move || {
        BatchClient::new(config)?.transcribe_file(&path)
    })
    .await
    .context("batch task")?
    .with_context(|| format!("batch transcription of {} failed", args.file.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&segments)?);
    } else {
        println!("{}", full_transcript(&segments));
    }
    Ok(())
}

fn run_devices(json: bool) -> Result<()> {
    let devices = list_devices();
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }
    if devices.is_empty() {
        println!("no audio devices found");
    }
    for device in devices {
        let mut flags = Vec::new();
        if device.is_default {
            flags.push("default");
        }
        if device.kind == DeviceKind::Input && device.is_loopback_like {
            flags.push("loopback?");
        }
        println!(
            "{:<6} {}{}",
            device.kind.as_str(),
            device.name,
            if flags.is_empty() {
                String::new()
            } else {
                format!("  ({})", flags.join(", "))
            }
        );
    }
    Ok(())
}

fn run_config(action: ConfigAction, mut settings: CliSettings, path: &Path) -> Result<()> {
    match action {
        ConfigAction::Path => println!("{}", path.display()),
        ConfigAction::Show => {
            settings.api_key = settings.api_key.as_deref().map(mask_key);
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        ConfigAction::SetKey { key } => {
            settings.api_key = Some(key);
            settings.normalize();
            if settings.api_key.is_none() {
                bail!("API key must not be empty");
            }
            save_settings(path, &settings)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("saved to {}", path.display());
        }
    }
    Ok(())
}

fn mask_key(key: &str) -> String {
    let visible: String = key.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    format!("****{visible}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_key_wins_over_settings() {
        let settings = CliSettings {
            api_key: Some("stored".into()),
            ..CliSettings::default()
        };
        assert_eq!(resolve_api_key(Some("flag".into()), &settings).unwrap(), "flag");
        assert_eq!(resolve_api_key(Some("  ".into()), &settings).unwrap(), "stored");
        assert!(resolve_api_key(None, &CliSettings::default()).is_err());
    }

    #[test]
    fn turn_timeout_flag_enables_detection() {
        let cli = Cli::parse_from(["talkscriber", "stt", "--turn-timeout-ms", "900"]);
        let Command::Stt(args) = cli.command else {
            panic!("expected stt");
        };
        let config = stt_config(&args, &CliSettings::default(), "k".into());
        assert!(config.turn_detection.enabled);
        assert_eq!(config.turn_detection.timeout, Duration::from_millis(900));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tts_flags_build_generation_config() {
        let cli = Cli::parse_from([
            "talkscriber",
            "tts",
            "hello",
            "--speaker",
            "leo",
            "--temperature",
            "0.5",
        ]);
        let Command::Tts(args) = cli.command else {
            panic!("expected tts");
        };
        let config = tts_config(&args, &CliSettings::default(), "k".into()).unwrap();
        assert_eq!(config.speaker_name, "leo");
        assert_eq!(config.generation.temperature(), Some(0.5));
    }

    #[test]
    fn no_play_requires_an_output_file() {
        assert!(Cli::try_parse_from(["talkscriber", "tts", "hi", "--no-play"]).is_err());
    }

    #[test]
    fn batch_features_reach_the_request_config() {
        let cli = Cli::parse_from([
            "talkscriber",
            "batch",
            "call.wav",
            "--features",
            "sentiment",
            "redaction",
            "--json",
        ]);
        let Command::Batch(args) = cli.command else {
            panic!("expected batch");
        };
        assert!(args.json);
        let config = batch_config(&args, &CliSettings::default(), "k".into());
        assert_eq!(config.features, vec!["sentiment", "redaction"]);
        assert_eq!(config.language, "en");

        let cli = Cli::parse_from(["talkscriber", "batch", "call.wav"]);
        let Command::Batch(args) = cli.command else {
            panic!("expected batch");
        };
        assert!(batch_config(&args, &CliSettings::default(), "k".into())
            .features
            .is_empty());
    }

    #[test]
    fn masks_all_but_the_tail() {
        assert_eq!(mask_key("abcdef123"), "****f123");
    }
}
