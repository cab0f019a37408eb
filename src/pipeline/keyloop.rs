//! Push-to-talk key state machine
//!
//! [`KeyMachine`] is pure: it is fed key levels with timestamps and returns
//! the action to take. [`KeyLoop`] polls the key on a fixed interval, applies
//! those actions to the shared flags and runs finalization.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant, MissedTickBehavior};

use super::finalize::Finalizer;
use crate::config::KeyConfig;
use crate::state::{ControlSignal, Shared};
use crate::voice::keys::KeySource;
use crate::voice::stt::LinkState;

/// Phase of the push-to-talk cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// Waiting for a press
    Idle,
    /// Key down, waiting for the press window
    DebouncingPress,
    /// Audio is being forwarded and finals collected
    Recording,
    /// Release confirmed, finalization running
    Finalizing,
    /// A job is with the workers
    WaitingWorker,
    /// Waiting for the key to stay up before re-arming
    WaitingKeyUp,
}

/// What the driver must do after a poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    None,
    /// Press confirmed: arm and start collecting
    StartRecording,
    /// Release confirmed: run finalization
    Finalize,
}

/// Debounced push-to-talk state machine
#[derive(Debug, Clone)]
pub struct KeyMachine {
    state: KeyState,
    /// Start of the current timing window (press, release or key-up)
    since: Option<Instant>,
    press_debounce: Duration,
    release_debounce: Duration,
    keyup_confirm: Duration,
    /// A confirmed press was abandoned and the key has not been released since
    press_aborted: bool,
}

impl KeyMachine {
    #[must_use]
    pub const fn new(config: &KeyConfig) -> Self {
        Self {
            state: KeyState::Idle,
            since: None,
            press_debounce: config.press_debounce,
            release_debounce: config.release_debounce,
            keyup_confirm: config.keyup_confirm,
            press_aborted: false,
        }
    }

    #[must_use]
    pub const fn state(&self) -> KeyState {
        self.state
    }

    fn enter(&mut self, state: KeyState) {
        self.state = state;
        self.since = None;
    }

    /// Time the key has been in its current level, starting the window on
    /// first observation
    fn held(&mut self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.since.get_or_insert(now))
    }

    /// Feed one key sample
    pub fn poll(&mut self, down: bool, now: Instant) -> KeyAction {
        if !down {
            self.press_aborted = false;
        }

        match self.state {
            KeyState::Idle => {
                if down {
                    self.enter(KeyState::DebouncingPress);
                    self.since = Some(now);
                }
            }
            KeyState::DebouncingPress => {
                if !down {
                    self.enter(KeyState::Idle);
                } else if self.held(now) >= self.press_debounce {
                    self.enter(KeyState::Recording);
                    return KeyAction::StartRecording;
                }
            }
            KeyState::Recording => {
                if down {
                    self.since = None;
                } else if self.held(now) >= self.release_debounce {
                    self.enter(KeyState::Finalizing);
                    return KeyAction::Finalize;
                }
            }
            KeyState::WaitingKeyUp => {
                if down {
                    self.since = None;
                } else if self.held(now) >= self.keyup_confirm {
                    self.enter(KeyState::Idle);
                }
            }
            KeyState::Finalizing | KeyState::WaitingWorker => {}
        }
        KeyAction::None
    }

    /// Finalization returned; `enqueued` tells whether a job was created
    pub fn finalized(&mut self, enqueued: bool) {
        if self.state == KeyState::Finalizing {
            self.enter(if enqueued {
                KeyState::WaitingWorker
            } else {
                KeyState::WaitingKeyUp
            });
        }
    }

    /// A worker finished its job; returns false if none was pending
    pub fn tts_done(&mut self) -> bool {
        if self.state == KeyState::WaitingWorker {
            self.enter(KeyState::WaitingKeyUp);
            true
        } else {
            false
        }
    }

    /// Abandon a confirmed press
    ///
    /// Returns true only for the first abort since the key was last seen up,
    /// so a held key that keeps re-confirming is reported once.
    pub fn abort(&mut self) -> bool {
        self.enter(KeyState::Idle);
        !std::mem::replace(&mut self.press_aborted, true)
    }
}

/// Async driver for [`KeyMachine`]
pub struct KeyLoop {
    keys: Arc<dyn KeySource>,
    shared: Arc<Shared>,
    link: watch::Receiver<LinkState>,
    finalizer: Finalizer,
    control: mpsc::UnboundedReceiver<ControlSignal>,
    state: watch::Sender<KeyState>,
    config: KeyConfig,
}

impl KeyLoop {
    #[must_use]
    pub const fn new(
        keys: Arc<dyn KeySource>,
        shared: Arc<Shared>,
        link: watch::Receiver<LinkState>,
        finalizer: Finalizer,
        control: mpsc::UnboundedReceiver<ControlSignal>,
        state: watch::Sender<KeyState>,
        config: KeyConfig,
    ) -> Self {
        Self {
            keys,
            shared,
            link,
            finalizer,
            control,
            state,
            config,
        }
    }

    /// Poll the key until shutdown
    ///
    /// Consumes the loop so the job sender held by the finalizer is dropped
    /// on exit, letting workers drain and stop.
    pub async fn run(mut self) {
        let mut machine = KeyMachine::new(&self.config);
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.shared.flags.stopped() => break,
                _ = ticker.tick() => {}
            }

            while let Ok(signal) = self.control.try_recv() {
                match signal {
                    ControlSignal::TtsDone => {
                        if !machine.tts_done() {
                            tracing::debug!(state = ?machine.state(), "ignoring stray ttsDone");
                        }
                    }
                }
            }

            match machine.poll(self.keys.is_down(), Instant::now()) {
                KeyAction::None => {}
                KeyAction::StartRecording => self.start_recording(&mut machine),
                KeyAction::Finalize => {
                    self.publish(&machine);
                    let enqueued = self.finalizer.finalize().await;
                    self.shared.flags.set_collecting(false);
                    machine.finalized(enqueued);
                }
            }

            self.publish(&machine);
        }

        self.shared.flags.disarm();
        tracing::debug!("key loop stopped");
    }

    fn start_recording(&self, machine: &mut KeyMachine) {
        let link = *self.link.borrow();
        if link != LinkState::Connected {
            self.shared.flags.disarm();
            if machine.abort() {
                tracing::error!(link = ?link, "STT not connected, press ignored");
            } else {
                tracing::trace!(link = ?link, "press still held without STT link");
            }
            return;
        }

        self.shared.transcript.clear();
        self.shared.flags.set_collecting(true);
        self.shared.flags.set_armed(true);
        tracing::info!("recording");
    }

    fn publish(&self, machine: &KeyMachine) {
        self.state.send_if_modified(|state| {
            if *state == machine.state() {
                return false;
            }
            tracing::debug!(from = ?*state, to = ?machine.state(), "key state");
            *state = machine.state();
            true
        });
    }
}
