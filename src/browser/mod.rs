use crate::correlation::{new_exchange_id, Correlator};
use crate::error::ExchangeError;
use crate::model::{BrowserInfo, Visibility};
use crate::progress::{Progress, ProgressHold};
use crate::protocol::{Action, Envelope};
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

pub type NavigationRequestFn =
    Arc<dyn Fn(String, bool) -> BoxFuture<'static, bool> + Send + Sync>;
pub type NavigationFinishedFn =
    Arc<dyn Fn(String, BrowserInstance) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct BrowserCallbacks {
    on_navigation_request: Option<NavigationRequestFn>,
    on_navigation_finished: Option<NavigationFinishedFn>,
}

impl BrowserCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_navigation_request<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(String, bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.on_navigation_request =
            Some(Arc::new(move |url, is_main_frame| hook(url, is_main_frame).boxed()));
        self
    }

    pub fn on_navigation_finished<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(String, BrowserInstance) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_navigation_finished =
            Some(Arc::new(move |url, instance| hook(url, instance).boxed()));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserState {
    Opening,
    Active,
    Closed,
}

#[derive(Clone)]
pub struct BrowserControl {
    correlator: Arc<Correlator>,
    progress: Progress,
}

impl BrowserControl {
    pub fn new(correlator: Arc<Correlator>, progress: Progress) -> Self {
        Self {
            correlator,
            progress,
        }
    }

    pub fn spawn(
        &self,
        mut info: BrowserInfo,
        callbacks: BrowserCallbacks,
    ) -> Result<BrowserInstance, ExchangeError> {
        let id = new_exchange_id();
        let events = self.correlator.open_scope(&id)?;
        if info.headers.as_ref().is_some_and(|h| h.is_empty()) {
            info.headers = None;
        }

        let hold = info.visible.is_visible().then(|| self.progress.hold());
        let instance = BrowserInstance {
            inner: Arc::new(InstanceInner {
                id: id.clone(),
                url: info.url.clone(),
                correlator: self.correlator.clone(),
                progress: self.progress.clone(),
                state: Mutex::new(InstanceState {
                    phase: BrowserState::Opening,
                    visible: info.visible.is_visible(),
                    hold,
                }),
            }),
        };

        let payload = serde_json::to_value(&info)
            .map_err(|err| ExchangeError::Malformed(err.to_string()))?;
        if let Err(err) = self
            .correlator
            .post(Envelope::correlated(Action::Browser, id.clone(), payload))
        {
            self.correlator.close_scope(&id);
            return Err(err);
        }
        tracing::debug!(browser_id = %id, url = %info.url, "browser spawned");

        tokio::spawn(serve_scope(instance.clone(), events, callbacks));
        Ok(instance)
    }

    pub async fn cookie_get(&self, url: &str) -> Result<String, ExchangeError> {
        read_cookie(&self.correlator, url).await
    }

    pub fn cookie_set(&self, url: &str, cookie: &str) -> Result<(), ExchangeError> {
        self.correlator.post(Envelope::correlated(
            Action::BrowserSetCookie,
            new_exchange_id(),
            json!({ "url": url, "cookie": cookie }),
        ))
    }
}

async fn read_cookie(correlator: &Correlator, url: &str) -> Result<String, ExchangeError> {
    let reply = correlator
        .send_and_await(
            Action::BrowserCookie,
            json!({ "url": url }),
            &[Action::BrowserCookieResult],
        )
        .await?;
    match reply.field("cookie") {
        Some(Value::String(cookie)) => Ok(cookie.clone()),
        Some(Value::Null) | None => Ok(String::new()),
        Some(other) => Err(ExchangeError::Malformed(format!(
            "cookie must be a string, got {other}"
        ))),
    }
}

struct InstanceState {
    phase: BrowserState,
    visible: bool,
    hold: Option<ProgressHold>,
}

struct InstanceInner {
    id: String,
    url: String,
    correlator: Arc<Correlator>,
    progress: Progress,
    state: Mutex<InstanceState>,
}

#[derive(Clone)]
pub struct BrowserInstance {
    inner: Arc<InstanceInner>,
}

impl BrowserInstance {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> BrowserState {
        self.lock().phase
    }

    pub fn is_visible(&self) -> bool {
        self.lock().visible
    }

    fn lock(&self) -> MutexGuard<'_, InstanceState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), ExchangeError> {
        if self.state() == BrowserState::Closed {
            return Err(ExchangeError::BrowserClosed);
        }
        Ok(())
    }

    fn mark_active(&self) {
        let mut state = self.lock();
        if state.phase == BrowserState::Opening {
            state.phase = BrowserState::Active;
        }
    }

    pub async fn evaluate(&self, script: &str) -> Result<Value, ExchangeError> {
        self.ensure_open()?;
        let reply = self
            .inner
            .correlator
            .send_and_await(
                Action::BrowserEvaluate,
                json!({ "script": script, "browser_id": self.inner.id }),
                &[Action::BrowserEvaluateResult],
            )
            .await?;
        Ok(match reply.field("result") {
            Some(Value::String(raw)) => {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
            }
            Some(other) => other.clone(),
            None => Value::Null,
        })
    }

    pub fn click(&self, x: f64, y: f64) -> Result<(), ExchangeError> {
        self.ensure_open()?;
        self.inner.correlator.post(Envelope::correlated(
            Action::BrowserClick,
            self.inner.id.clone(),
            json!({ "x": x, "y": y }),
        ))
    }

    pub async fn cookie(&self, url: &str) -> Result<String, ExchangeError> {
        read_cookie(&self.inner.correlator, url).await
    }

    pub fn visible(&self, show: bool) -> Result<(), ExchangeError> {
        self.ensure_open()?;
        self.inner.correlator.post(Envelope::correlated(
            Action::BrowserVisible,
            self.inner.id.clone(),
            json!({ "visible": Visibility::from(show) }),
        ))?;

        let mut state = self.lock();
        state.visible = show;
        if !show {
            state.hold = None;
        } else if state.hold.is_none() {
            state.hold = Some(self.inner.progress.hold());
        }
        Ok(())
    }

    pub fn close(&self) -> Result<(), ExchangeError> {
        {
            let mut state = self.lock();
            if state.phase == BrowserState::Closed {
                return Ok(());
            }
            state.phase = BrowserState::Closed;
            state.hold = None;
        }
        self.inner.correlator.close_scope(&self.inner.id);
        tracing::debug!(browser_id = %self.inner.id, "browser closed");
        self.inner.correlator.post(Envelope::correlated(
            Action::BrowserClose,
            self.inner.id.clone(),
            json!({}),
        ))
    }
}

async fn serve_scope(
    instance: BrowserInstance,
    mut events: mpsc::UnboundedReceiver<Envelope>,
    callbacks: BrowserCallbacks,
) {
    while let Some(envelope) = events.recv().await {
        match envelope.action {
            Action::BrowserUrlRequest => {
                let url = envelope.str_field("url").unwrap_or_default().to_string();
                let is_main_frame = envelope
                    .field("is_main_frame")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                let reply_id = envelope
                    .exchange_id
                    .clone()
                    .unwrap_or_else(|| instance.id().to_string());
                let hook = callbacks.on_navigation_request.clone();
                let correlator = instance.inner.correlator.clone();
                tokio::spawn(async move {
                    let allow = match hook {
                        Some(hook) => hook(url.clone(), is_main_frame).await,
                        None => true,
                    };
                    tracing::debug!(url = %url, allow, "navigation request answered");
                    let _ = correlator.post(Envelope::correlated(
                        Action::BrowserResult,
                        reply_id,
                        json!({ "allow": allow }),
                    ));
                });
            }
            Action::BrowserUrlFinished => {
                instance.mark_active();
                if let Some(hook) = callbacks.on_navigation_finished.clone() {
                    let url = envelope.str_field("url").unwrap_or_default().to_string();
                    tokio::spawn(hook(url, instance.clone()));
                }
            }
            other => {
                tracing::debug!(browser_id = %instance.id(), action = %other, "unexpected browser event");
            }
        }
    }
}
