//! Cooperative run loop
//!
//! One task multiplexes user commands, the analysis tick, and the single
//! outstanding piece of async work. The controller is never borrowed across
//! an await except while the first-run greeting plays, and even then `Stop`
//! and `Shutdown` cut the greeting short.

use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::{Completion, Pending, TurnController, TurnState};
use crate::settings::SettingsStore;

/// User commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start listening
    Start,
    /// Stop everything and return to idle
    Stop,
    /// Start when idle, stop otherwise
    Toggle,
    /// Seal the current recording now
    StopRecording,
    /// Stop and leave the loop
    Shutdown,
}

/// Drives a [`TurnController`]
pub struct VoiceLoop {
    controller: TurnController,
    settings: Option<SettingsStore>,
}

impl VoiceLoop {
    /// Wrap a controller; `settings` enables the first-run greeting
    #[must_use]
    pub const fn new(controller: TurnController, settings: Option<SettingsStore>) -> Self {
        Self {
            controller,
            settings,
        }
    }

    /// Controller being driven
    #[must_use]
    pub const fn controller(&self) -> &TurnController {
        &self.controller
    }

    /// Run until [`Command::Shutdown`] or the command channel closes
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) -> TurnController {
        let mut ticker = tokio::time::interval(self.controller.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut pending: Option<Pending> = None;

        tracing::debug!(
            interval_ms = self.controller.check_interval().as_millis(),
            "voice loop started"
        );

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let command = command.unwrap_or(Command::Shutdown);
                    tracing::debug!(?command, state = %self.controller.state(), "command");
                    match command {
                        Command::Start | Command::Toggle
                            if self.controller.state() == TurnState::Idle =>
                        {
                            if self.start(&mut commands).await == Some(Command::Shutdown) {
                                break;
                            }
                        }
                        Command::Start => {}
                        Command::Stop | Command::Toggle => {
                            pending = None;
                            self.controller.stop();
                        }
                        Command::StopRecording => {
                            if let Some(work) = self.controller.force_stop_recording() {
                                pending = Some(work);
                            }
                        }
                        Command::Shutdown => {
                            pending = None;
                            self.controller.stop();
                            break;
                        }
                    }
                }
                now = ticker.tick() => {
                    if let Some(work) = self.controller.tick(now.into_std()) {
                        pending = Some(work);
                    }
                }
                done = wait_pending(&mut pending) => {
                    pending = self.controller.complete(done);
                }
            }
        }

        drop(pending);
        tracing::debug!("voice loop stopped");
        self.controller
    }

    /// Start listening, greeting first if needed
    ///
    /// Returns the command that interrupted the greeting, in which case
    /// listening is not started.
    async fn start(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> Option<Command> {
        if self.controller.state() != TurnState::Idle {
            return None;
        }
        if let Some(command) = self.greet_once(commands).await {
            return Some(command);
        }
        if let Err(e) = self.controller.start(Instant::now()) {
            tracing::warn!(error = %e, "failed to start listening");
        }
        None
    }

    /// Speak the greeting on the first start, then remember it was played
    ///
    /// `Stop`, `Toggle` and `Shutdown` cancel the greeting; other commands
    /// are ignored until it ends.
    async fn greet_once(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Option<Command> {
        let store = self.settings.clone()?;
        let settings = store.load();
        if settings.greeting_played || settings.greeting_text.trim().is_empty() {
            return None;
        }

        tracing::info!("playing first-run greeting");
        let outcome = {
            let greeting = self.controller.play_greeting(&settings.greeting_text);
            let mut greeting = std::pin::pin!(greeting);
            loop {
                tokio::select! {
                    result = &mut greeting => break Ok(result),
                    command = commands.recv() => match command.unwrap_or(Command::Shutdown) {
                        Command::Start | Command::StopRecording => {}
                        command => break Err(command),
                    },
                }
            }
        };

        match outcome {
            Ok(Ok(())) => {
                if let Err(e) = store.update(|s| s.greeting_played = true) {
                    tracing::warn!(error = %e, "failed to persist greeting flag");
                }
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "greeting failed, starting anyway");
                None
            }
            Err(command) => {
                tracing::debug!(?command, "greeting interrupted");
                self.controller.cancel_greeting();
                Some(command)
            }
        }
    }
}

async fn wait_pending(pending: &mut Option<Pending>) -> Completion {
    match pending {
        Some(work) => work.resolve().await,
        None => std::future::pending().await,
    }
}
