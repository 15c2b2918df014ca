use crate::config::ProgressConfig;
use crate::correlation::Outbox;
use crate::model::{DirectLink, FailurePayload};
use crate::protocol::{Action, Envelope};
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUpdate {
    Percent(u8),
    Auto,
    Pause,
    Resume,
}

impl From<u8> for ProgressUpdate {
    fn from(percent: u8) -> Self {
        ProgressUpdate::Percent(percent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Paused,
    Terminal(Outcome),
}

#[derive(Default)]
struct ProgressState {
    percent: u8,
    started: bool,
    paused: bool,
    holds: usize,
    outcome: Option<Outcome>,
    ticker: Option<JoinHandle<()>>,
}

impl ProgressState {
    fn phase(&self) -> Phase {
        match (self.outcome, self.started, self.is_held()) {
            (Some(outcome), _, _) => Phase::Terminal(outcome),
            (None, false, _) => Phase::Idle,
            (None, true, true) => Phase::Paused,
            (None, true, false) => Phase::Running,
        }
    }

    fn is_held(&self) -> bool {
        self.paused || self.holds > 0
    }

    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

struct ProgressInner {
    outbox: Outbox,
    config: ProgressConfig,
    finish_delay: Duration,
    state: Mutex<ProgressState>,
}

impl ProgressInner {
    fn state(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Called with the state lock held so nothing can slip in after a terminal envelope.
    fn emit(&self, percent: u8) -> bool {
        self.outbox
            .post(Envelope::event(Action::Progress, json!({ "progress": percent })))
            .is_ok()
    }
}

#[derive(Clone)]
pub struct Progress {
    inner: Arc<ProgressInner>,
}

impl Progress {
    pub fn new(outbox: Outbox, config: ProgressConfig, finish_delay: Duration) -> Self {
        Self {
            inner: Arc::new(ProgressInner {
                outbox,
                config,
                finish_delay,
                state: Mutex::new(ProgressState::default()),
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        self.inner.state().phase()
    }

    pub fn percent(&self) -> u8 {
        self.inner.state().percent
    }

    pub fn is_terminal(&self) -> bool {
        self.inner.state().outcome.is_some()
    }

    pub fn update(&self, update: ProgressUpdate) {
        match update {
            ProgressUpdate::Percent(percent) => self.set(percent),
            ProgressUpdate::Auto => self.auto(),
            ProgressUpdate::Pause => {
                self.pause();
            }
            ProgressUpdate::Resume => {
                self.resume();
            }
        }
    }

    pub fn begin(&self) {
        let mut state = self.inner.state();
        if state.outcome.is_none() {
            state.started = true;
        }
    }

    pub fn set(&self, percent: u8) {
        let mut state = self.inner.state();
        if state.outcome.is_some() {
            return;
        }
        state.started = true;
        state.percent = percent.min(100);
        self.inner.emit(state.percent);
    }

    pub fn auto(&self) {
        let mut state = self.inner.state();
        if state.outcome.is_some() {
            return;
        }
        state.started = true;
        if state.ticker.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        state.ticker = Some(spawn_ticker(Arc::downgrade(&self.inner)));
    }

    pub fn pause(&self) -> bool {
        let mut state = self.inner.state();
        if state.outcome.is_some() || !state.started || state.paused {
            return false;
        }
        state.paused = true;
        true
    }

    pub fn resume(&self) -> bool {
        let mut state = self.inner.state();
        if state.outcome.is_some() || !state.paused {
            return false;
        }
        state.paused = false;
        true
    }

    /// Keeps automatic progress still until the guard is dropped. Holds stack
    /// and do not touch the pause flag.
    pub fn hold(&self) -> ProgressHold {
        self.inner.state().holds += 1;
        ProgressHold {
            inner: self.inner.clone(),
        }
    }

    pub async fn finish(&self, link: DirectLink) -> bool {
        {
            let mut state = self.inner.state();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(Outcome::Finished);
            state.stop_ticker();
            state.percent = 100;
            self.inner.emit(100);
        }

        let payload = match serde_json::to_value(&link) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "direct link could not be encoded");
                return true;
            }
        };
        if !self.inner.finish_delay.is_zero() {
            tokio::time::sleep(self.inner.finish_delay).await;
        }
        if self
            .inner
            .outbox
            .post(Envelope::event(Action::Result, payload))
            .is_err()
        {
            tracing::debug!("connection closed before the final result was sent");
        }
        true
    }

    pub fn failed(&self, status: Option<u16>, message: Option<String>) -> bool {
        let mut state = self.inner.state();
        if state.outcome.is_some() {
            return false;
        }
        state.outcome = Some(Outcome::Failed);
        state.stop_ticker();
        let failure = FailurePayload::new(status, message);
        let sent = self.inner.outbox.post(Envelope::event(
            Action::Failed,
            json!({ "status": failure.status, "message": failure.message }),
        ));
        if sent.is_err() {
            tracing::debug!("connection closed before the failure was sent");
        }
        true
    }

    pub fn cancel(&self) {
        self.inner.state().stop_ticker();
    }
}

pub struct ProgressHold {
    inner: Arc<ProgressInner>,
}

impl Drop for ProgressHold {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        state.holds = state.holds.saturating_sub(1);
    }
}

fn spawn_ticker(inner: Weak<ProgressInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let interval = match inner.upgrade() {
                Some(inner) => inner.config.interval(),
                None => return,
            };
            tokio::time::sleep(interval).await;

            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut state = inner.state();
            if state.outcome.is_some() {
                return;
            }
            if state.is_held() {
                continue;
            }
            let cap = inner.config.cap;
            let next = state.percent.saturating_add(inner.config.step).min(cap);
            if next <= state.percent {
                continue;
            }
            state.percent = next;
            if !inner.emit(next) {
                return;
            }
        }
    })
}
