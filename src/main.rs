use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use n8n_voice::config::load_config_file;
use n8n_voice::controller::exchange::{ReplySource, synthesize};
use n8n_voice::settings::{DEFAULT_GREETING, MAX_SENSITIVITY, MIN_SENSITIVITY};
use n8n_voice::voice::{
    AudioBlob, AudioDevice, AudioPlayback, CpalMicrophone, EnergyAnalyzer, Player, downmix_to_mono,
    samples_to_wav,
};
use n8n_voice::{
    Collaborators, Command, Config, ControllerEvent, HttpTransport, SettingsStore, TurnController,
    TurnState, VoiceLoop,
};

/// n8n Voice - hands-free voice front end for n8n workflows
#[derive(Parser)]
#[command(name = "n8n-voice", version, about)]
struct Cli {
    /// Voice backend origin
    #[arg(long, env = "N8N_VOICE_SERVER_URL")]
    server: Option<String>,

    /// n8n webhook URL (overrides saved settings)
    #[arg(long, env = "N8N_VOICE_WEBHOOK_URL")]
    webhook: Option<String>,

    /// Voice detection mode ("basic" or "adaptive")
    #[arg(long, env = "N8N_VOICE_VAD_MODE")]
    vad: Option<String>,

    /// Playback policy ("mic-mute" or "barge-in")
    #[arg(long, env = "N8N_VOICE_POLICY")]
    policy: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Cmd {
    /// Test microphone input through the energy analyzer
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test speech synthesis through the voice backend
    TestTts {
        /// Text to speak
        #[arg(default_value = DEFAULT_GREETING)]
        text: String,
    },
    /// Show or change saved settings
    Settings {
        #[command(subcommand)]
        action: SettingsCmd,
    },
    /// Interactive first-run setup
    Setup,
}

#[derive(Subcommand)]
enum SettingsCmd {
    /// Print saved settings
    Show,
    /// Set the n8n webhook URL ("none" clears it)
    SetWebhook {
        /// Webhook URL
        url: String,
    },
    /// Set microphone sensitivity (15-50, lower is more sensitive)
    SetSensitivity {
        /// Loudness threshold
        value: f32,
    },
    /// Enable or disable stopping on silence
    SetAutoStop {
        /// "on" or "off"
        #[arg(action = clap::ArgAction::Set, value_parser = clap::builder::BoolishValueParser::new())]
        enabled: bool,
    },
    /// Set the first-run greeting
    SetGreeting {
        /// Greeting text
        text: String,
    },
    /// Play the greeting again on the next start
    ResetGreeting,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,n8n_voice=info",
        1 => "info,n8n_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
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
    let config = load_config(&cli)?;

    if let Some(cmd) = cli.command {
        return match cmd {
            Cmd::TestMic { duration } => test_mic(&config, duration).await,
            Cmd::TestSpeaker => test_speaker().await,
            Cmd::TestTts { text } => test_tts(&config, &text).await,
            Cmd::Settings { action } => settings_command(&config, action),
            Cmd::Setup => n8n_voice::setup::run_setup(),
        };
    }

    run_voice(config).await
}

/// Resolve configuration with command-line flags taking precedence
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let overrides = [
        ("N8N_VOICE_SERVER_URL", cli.server.clone()),
        ("N8N_VOICE_WEBHOOK_URL", cli.webhook.clone()),
        ("N8N_VOICE_VAD_MODE", cli.vad.clone()),
        ("N8N_VOICE_POLICY", cli.policy.clone()),
    ];

    let mut config = Config::from_sources(load_config_file(), |key| {
        overrides
            .iter()
            .find(|(k, _)| *k == key)
            .and_then(|(_, v)| v.clone())
    })?;

    let settings = SettingsStore::new(config.settings_path()).load();
    config.apply_settings(&settings);
    tracing::debug!(?config, "loaded configuration");
    Ok(config)
}

/// Run the hands-free loop until quit
#[allow(clippy::future_not_send)]
async fn run_voice(config: Config) -> anyhow::Result<()> {
    let transport = HttpTransport::new(&config.server_url, config.request_timeout)?;
    let player = AudioPlayback::new()?;

    if config.turn.webhook_url.is_none() {
        tracing::warn!("no n8n webhook configured, run `n8n-voice setup` or `settings set-webhook`");
    }

    let (controller, events) = TurnController::new(
        config.turn.clone(),
        config.vad.clone(),
        config.capture.clone(),
        Collaborators {
            device: Box::new(CpalMicrophone::new()),
            player: Box::new(player),
            transport: Arc::new(transport),
        },
    );

    let (commands, rx) = mpsc::unbounded_channel();
    tokio::spawn(print_events(events));
    tokio::spawn(read_commands(commands.clone()));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = commands.send(Command::Shutdown);
        }
    });

    println!("n8n voice ready (server {})", config.server_url);
    println!("Enter: start/stop listening | s: send recording now | q: quit");

    let store = SettingsStore::new(config.settings_path());
    let voice = VoiceLoop::new(controller, Some(store));
    let controller = voice.run(rx).await;

    println!(
        "Goodbye ({} exchanges this session)",
        controller.conversation().len()
    );
    Ok(())
}

/// Map terminal input to loop commands
async fn read_commands(commands: mpsc::UnboundedSender<Command>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let command = match line.trim().to_ascii_lowercase().as_str() {
            "" => Command::Toggle,
            "start" => Command::Start,
            "stop" => Command::Stop,
            "s" | "send" => Command::StopRecording,
            "q" | "quit" | "exit" => Command::Shutdown,
            other => {
                println!("unknown command: {other}");
                continue;
            }
        };
        if commands.send(command).is_err() || command == Command::Shutdown {
            break;
        }
    }
}

/// Render controller events for the terminal
async fn print_events(mut events: mpsc::UnboundedReceiver<ControllerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ControllerEvent::StateChanged { to, .. } => {
                let label = match to {
                    TurnState::Idle => "stopped",
                    TurnState::Listening => "listening...",
                    TurnState::Recording => "recording...",
                    TurnState::Processing => "processing...",
                    TurnState::Playing => "speaking...",
                };
                println!("[{label}]");
            }
            ControllerEvent::Level {
                loudness,
                threshold,
            } => {
                tracing::trace!(loudness, threshold, "level");
            }
            ControllerEvent::RecordingStarted { recording_id } => {
                tracing::debug!(recording_id, "recording started");
            }
            ControllerEvent::RecordingDiscarded {
                recording_id,
                bytes,
            } => {
                tracing::debug!(recording_id, bytes, "recording discarded");
            }
            ControllerEvent::Transcript { text, .. } => println!("you: {text}"),
            ControllerEvent::Reply { text, .. } | ControllerEvent::Greeting { text } => {
                println!("assistant: {text}");
            }
            ControllerEvent::Error { message, retryable } => {
                if retryable {
                    eprintln!("error: {message} (press Enter to retry)");
                } else {
                    eprintln!("error: {message}");
                }
            }
        }
    }
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut microphone = CpalMicrophone::new();
    let mut session = microphone.acquire(&config.capture)?;
    let mut analyzer = EnergyAnalyzer::new(
        session.sample_rate(),
        config.vad.strategy,
        config.vad.smoothing,
    );
    let threshold = config.vad.threshold;

    println!(
        "Sample rate: {} Hz | channels: {} | strategy: {} | threshold: {threshold:.0}",
        session.sample_rate(),
        session.channels(),
        config.vad.strategy
    );
    println!("---");

    let interval = config.vad.check_interval;
    let deadline = Instant::now() + Duration::from_secs(duration);
    let mut ticker = tokio::time::interval(interval);
    let mut peak = 0.0f32;

    while Instant::now() < deadline {
        ticker.tick().await;
        let mono = downmix_to_mono(&session.take_samples(), session.channels());
        analyzer.push(&mono);
        let measurement = analyzer.measure();
        peak = peak.max(measurement.loudness);

        // Visual meter, 0-255 scaled to 50 columns
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = ((measurement.loudness / 255.0) * 50.0).clamp(0.0, 50.0) as usize;
        let marker = if measurement.loudness > threshold {
            "speech"
        } else {
            ""
        };
        println!(
            "{:6.1} | zcr {:.2} | [{}{}] {marker}",
            measurement.loudness,
            measurement.zero_crossing_rate,
            "#".repeat(meter_len),
            " ".repeat(50 - meter_len),
        );
    }

    session.release();

    println!("\n---");
    println!("Peak loudness: {peak:.1} (threshold {threshold:.0})");
    println!("If the meter moved above the threshold while you spoke, your mic is working!");
    println!("If it stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
#[allow(clippy::future_not_send)]
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (std::f32::consts::TAU * frequency * t).sin() * 0.3
        })
        .collect();

    let blob = AudioBlob::new(samples_to_wav(&samples, sample_rate, 1)?, "audio/wav");
    let mut playback = AudioPlayback::new()?;
    playback.play(blob)?.completion.await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Test speech synthesis via the voice backend
#[allow(clippy::future_not_send)]
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let transport = HttpTransport::new(&config.server_url, config.request_timeout)?;

    println!("Synthesizing speech via {}...", transport.base_url());
    let reply = synthesize(&transport, text, ReplySource::Greeting).await?;
    println!(
        "Got {} bytes of {} from {}",
        reply.audio.len(),
        reply.audio.mime_type,
        reply.audio_url
    );

    println!("Playing audio...");
    let mut playback = AudioPlayback::new()?;
    playback.play(reply.audio)?.completion.await?;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}

/// Show or edit persisted settings
fn settings_command(config: &Config, action: SettingsCmd) -> anyhow::Result<()> {
    let store = SettingsStore::new(config.settings_path());

    let settings = match action {
        SettingsCmd::Show => {
            let settings = store.load();
            println!("Settings file: {}", store.path().display());
            println!("{}", serde_json::to_string_pretty(&settings)?);
            println!(
                "\nEffective: server {} | vad {} | threshold {:.0} | policy {}",
                config.server_url,
                config.vad.mode,
                config.vad.threshold,
                config.turn.policy
            );
            return Ok(());
        }
        SettingsCmd::SetWebhook { url } => {
            let url = url.trim().to_string();
            let value = if url.is_empty() || url == "none" {
                None
            } else {
                url::Url::parse(&url).map_err(|e| anyhow::anyhow!("invalid webhook URL: {e}"))?;
                Some(url)
            };
            store.update(|s| s.webhook_url = value)?
        }
        SettingsCmd::SetSensitivity { value } => {
            if !(MIN_SENSITIVITY..=MAX_SENSITIVITY).contains(&value) {
                anyhow::bail!("sensitivity must be between {MIN_SENSITIVITY} and {MAX_SENSITIVITY}");
            }
            store.update(|s| s.mic_sensitivity = Some(value))?
        }
        SettingsCmd::SetAutoStop { enabled } => store.update(|s| s.auto_stop_enabled = enabled)?,
        SettingsCmd::SetGreeting { text } => store.update(|s| {
            s.greeting_text = text;
            s.greeting_played = false;
        })?,
        SettingsCmd::ResetGreeting => store.update(|s| s.greeting_played = false)?,
    };

    println!("{}", serde_json::to_string_pretty(&settings)?);
    println!("Saved to {}", store.path().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::parse_from(["n8n-voice", "-vv", "--policy", "barge-in", "test-mic", "-d", "3"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.policy.as_deref(), Some("barge-in"));
        assert!(matches!(cli.command, Some(Cmd::TestMic { duration: 3 })));
    }

    #[test]
    fn test_cli_parses_auto_stop() {
        let cli = Cli::parse_from(["n8n-voice", "settings", "set-auto-stop", "off"]);
        assert!(matches!(
            cli.command,
            Some(Cmd::Settings {
                action: SettingsCmd::SetAutoStop { enabled: false }
            })
        ));
    }
}
