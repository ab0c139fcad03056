//! Interactive first-run setup wizard (`n8n-voice setup`)

use std::path::PathBuf;

use dialoguer::{Confirm, Input, Select};

use crate::config::{
    DEFAULT_SERVER_URL, config_file_path, default_data_dir, load_config_file, save_config_file,
};
use crate::controller::PlaybackPolicy;
use crate::settings::{MAX_SENSITIVITY, MIN_SENSITIVITY, SettingsStore};
use crate::voice::VadMode;

/// Run the interactive setup wizard
///
/// # Errors
///
/// Returns error if user input fails or config cannot be written
pub fn run_setup() -> anyhow::Result<()> {
    println!("n8n Voice Setup\n");

    let mut config_file = load_config_file();
    let config_path = config_file_path()
        .unwrap_or_else(|| PathBuf::from("~/.config/n8n-voice/config.toml"));
    let store = SettingsStore::in_data_dir(&default_data_dir());
    let existing = store.load();

    if config_path.exists() {
        println!("Existing config found at {}\n", config_path.display());
    }

    // 1. Backend server
    let server_url: String = Input::new()
        .with_prompt("Voice server URL")
        .default(
            config_file
                .server
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string()),
        )
        .validate_with(|input: &String| {
            url::Url::parse(input)
                .map(|_| ())
                .map_err(|e| format!("invalid URL: {e}"))
        })
        .interact_text()?;

    // 2. n8n webhook
    let webhook_prompt = existing.webhook().map_or_else(
        || "n8n webhook URL".to_string(),
        |w| format!("n8n webhook URL (current: {w}, leave blank to keep)"),
    );
    let webhook_input: String = Input::new()
        .with_prompt(&webhook_prompt)
        .allow_empty(true)
        .interact_text()?;
    let webhook_url = if webhook_input.trim().is_empty() {
        existing.webhook_url.clone()
    } else {
        Some(webhook_input.trim().to_string())
    };

    // 3. Detection mode
    let modes = [VadMode::Adaptive, VadMode::Basic];
    let labels = ["adaptive (calibrates to room noise)", "basic (fixed threshold)"];
    let current_mode = config_file
        .vad
        .mode
        .as_deref()
        .and_then(|m| m.parse::<VadMode>().ok())
        .unwrap_or_default();
    let mode_idx = Select::new()
        .with_prompt("Voice detection mode")
        .items(&labels)
        .default(modes.iter().position(|m| *m == current_mode).unwrap_or(0))
        .interact()?;

    // 4. Sensitivity
    let sensitivity: f32 = Input::new()
        .with_prompt(format!(
            "Microphone sensitivity ({MIN_SENSITIVITY}-{MAX_SENSITIVITY}, lower is more sensitive)"
        ))
        .default(existing.sensitivity().unwrap_or(30.0))
        .validate_with(|v: &f32| {
            if (MIN_SENSITIVITY..=MAX_SENSITIVITY).contains(v) {
                Ok(())
            } else {
                Err(format!("must be between {MIN_SENSITIVITY} and {MAX_SENSITIVITY}"))
            }
        })
        .interact_text()?;

    // 5. Auto-stop
    let auto_stop = Confirm::new()
        .with_prompt("Stop recording automatically when you stop talking?")
        .default(existing.auto_stop_enabled)
        .interact()?;

    // 6. Playback policy
    let policies = [PlaybackPolicy::MicMute, PlaybackPolicy::BargeIn];
    let policy_labels = [
        "mic-mute (microphone off while the assistant speaks)",
        "barge-in (interrupt the assistant by speaking)",
    ];
    let current_policy = config_file
        .turn
        .policy
        .as_deref()
        .and_then(|p| p.parse::<PlaybackPolicy>().ok())
        .unwrap_or_default();
    let policy_idx = Select::new()
        .with_prompt("While the assistant is speaking")
        .items(&policy_labels)
        .default(policies.iter().position(|p| *p == current_policy).unwrap_or(0))
        .interact()?;

    // 7. Write config and settings
    config_file.server.base_url = Some(server_url);
    config_file.vad.mode = Some(modes[mode_idx].to_string());
    config_file.turn.policy = Some(policies[policy_idx].to_string());
    save_config_file(&config_file, &config_path)?;
    println!("\nConfig written to {}", config_path.display());

    store.update(|s| {
        s.webhook_url = webhook_url;
        s.mic_sensitivity = Some(sensitivity);
        s.auto_stop_enabled = auto_stop;
    })?;
    println!("Settings written to {}", store.path().display());

    println!("\nSetup complete! Run `n8n-voice -v` to start.");

    Ok(())
}
