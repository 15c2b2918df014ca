use crate::config::{Config, ProgressConfig};
use crate::controller::Controller;
use crate::correlation::{Correlator, Outbox};
use crate::model::{AppInfo, ClientIdentity, DeviceInfo, MediaRequest};
use crate::plugin::PluginMetadata;
use crate::progress::Progress;
use crate::protocol::{self, Action, Envelope, ProtocolRevision};
use base64::{engine::general_purpose, Engine as _};
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub const IDENTITY_PARAM: &str = "__xci__";

/// Decodes the `__xci__` blob. Each part that is missing or malformed falls
/// back to the corresponding part of `fallback`; a blob that cannot be read
/// at all yields `fallback` itself.
pub fn parse_identity(raw: Option<&str>, fallback: &Arc<ClientIdentity>) -> Arc<ClientIdentity> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return fallback.clone();
    };
    let Some(mut value) = decode_blob(raw) else {
        tracing::warn!("unreadable client identity, using default");
        return fallback.clone();
    };
    if let Value::String(inner) = &value {
        match serde_json::from_str(inner) {
            Ok(inner) => value = inner,
            Err(_) => return fallback.clone(),
        }
    }
    if !value.is_object() {
        return fallback.clone();
    }

    Arc::new(ClientIdentity {
        app: part::<AppInfo>(&value, "app_info").unwrap_or_else(|| fallback.app.clone()),
        device: part::<DeviceInfo>(&value, "device_info")
            .unwrap_or_else(|| fallback.device.clone()),
        plugin: part::<PluginMetadata>(&value, "plugin_info")
            .unwrap_or_else(|| fallback.plugin.clone()),
    })
}

fn decode_blob(raw: &str) -> Option<Value> {
    // Query decoding turns an unescaped '+' into a space.
    let normalized = raw.replace(' ', "+");
    let bytes = general_purpose::STANDARD
        .decode(&normalized)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(normalized.trim_end_matches('=')))
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(normalized.trim_end_matches('=')))
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn part<T: DeserializeOwned>(value: &Value, key: &str) -> Option<T> {
    value
        .get(key)
        .filter(|part| part.is_object())
        .and_then(|part| serde_json::from_value(part.clone()).ok())
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub identity: Arc<ClientIdentity>,
    pub revision: ProtocolRevision,
    pub remote_addr: Option<SocketAddr>,
}

impl SessionInfo {
    pub fn new(identity: Arc<ClientIdentity>, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            revision: identity.revision(),
            identity,
            remote_addr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn abnormal() -> Self {
        Self::new(1006, "")
    }
}

pub struct StreamRequest {
    pub media: MediaRequest,
    pub controller: Controller,
    pub session: Arc<SessionInfo>,
}

/// Application logic behind the bridge. Only `on_stream` is required; the
/// lifecycle hooks default to no-ops.
pub trait PluginHandler: Send + Sync + 'static {
    fn on_stream(&self, request: StreamRequest) -> BoxFuture<'static, ()>;

    fn on_listening(&self, _addr: SocketAddr) {}

    fn on_connection(&self, _session: &SessionInfo) {}

    fn on_closed(&self, _session: &SessionInfo, _reason: &CloseReason) {}
}

struct FnHandler<F>(F);

impl<F, Fut> PluginHandler for FnHandler<F>
where
    F: Fn(StreamRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn on_stream(&self, request: StreamRequest) -> BoxFuture<'static, ()> {
        (self.0)(request).boxed()
    }
}

pub fn handler_fn<F, Fut>(on_stream: F) -> Arc<dyn PluginHandler>
where
    F: Fn(StreamRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler(on_stream))
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub progress: ProgressConfig,
    pub reply_timeout: Option<Duration>,
    pub finish_delay: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            progress: config.progress,
            reply_timeout: config.exchange.reply_timeout(),
            finish_delay: config.exchange.finish_delay(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Stream,
    Reply,
    Scoped,
    Outbound,
}

fn route(action: Action) -> Route {
    match action {
        Action::Stream => Route::Stream,
        Action::Result
        | Action::Failed
        | Action::SelectResult
        | Action::BrowserEvaluateResult
        | Action::BrowserCookieResult => Route::Reply,
        Action::BrowserUrlRequest | Action::BrowserUrlFinished => Route::Scoped,
        Action::Fetch
        | Action::Progress
        | Action::Select
        | Action::Browser
        | Action::BrowserResult
        | Action::BrowserClick
        | Action::BrowserClose
        | Action::BrowserEvaluate
        | Action::BrowserCookie
        | Action::BrowserSetCookie
        | Action::BrowserVisible => Route::Outbound,
    }
}

/// Protocol state of one connection, independent of the transport. The
/// transport feeds inbound frames to [`Session::handle_frame`] and drains the
/// outbox it passed to [`Session::open`].
pub struct Session {
    info: Arc<SessionInfo>,
    correlator: Arc<Correlator>,
    handler: Arc<dyn PluginHandler>,
    settings: SessionSettings,
    streams: Mutex<Vec<Progress>>,
}

impl Session {
    pub fn open(
        info: SessionInfo,
        outbox: Outbox,
        handler: Arc<dyn PluginHandler>,
        settings: SessionSettings,
    ) -> Self {
        let correlator = Correlator::new(outbox, info.revision)
            .with_reply_timeout(settings.reply_timeout);
        let info = Arc::new(info);
        tracing::info!(
            session_id = %info.session_id,
            app = %info.identity.app.app_name,
            version = %info.identity.app.version,
            revision = ?info.revision,
            remote = ?info.remote_addr,
            "client connected"
        );
        handler.on_connection(&info);
        Self {
            info,
            correlator: Arc::new(correlator),
            handler,
            settings,
            streams: Mutex::new(Vec::new()),
        }
    }

    pub fn info(&self) -> &Arc<SessionInfo> {
        &self.info
    }

    pub fn session_id(&self) -> &str {
        &self.info.session_id
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.info.identity
    }

    pub fn handle_frame(&self, raw: &[u8]) {
        match protocol::decode(raw) {
            Ok(envelope) => self.dispatch(envelope),
            Err(err) => {
                tracing::warn!(session_id = %self.info.session_id, error = %err, "dropping malformed frame");
            }
        }
    }

    pub fn dispatch(&self, envelope: Envelope) {
        let action = envelope.action;
        match route(action) {
            Route::Stream => self.start_stream(envelope),
            Route::Reply => {
                if !self.correlator.resolve(envelope) {
                    tracing::debug!(session_id = %self.info.session_id, action = %action, "unmatched reply dropped");
                }
            }
            Route::Scoped => {
                if !self.correlator.route_scoped(envelope) {
                    tracing::debug!(session_id = %self.info.session_id, action = %action, "no browser instance for event");
                }
            }
            Route::Outbound => {
                tracing::warn!(session_id = %self.info.session_id, action = %action, "client sent a server-only action");
            }
        }
    }

    fn start_stream(&self, envelope: Envelope) {
        let media = match MediaRequest::from_payload(&envelope.payload, self.info.revision) {
            Ok(media) => media,
            Err(err) => {
                tracing::warn!(session_id = %self.info.session_id, error = %err, "rejecting stream request");
                return;
            }
        };
        tracing::info!(
            session_id = %self.info.session_id,
            media = %media.describe(),
            "stream requested"
        );

        let progress = Progress::new(
            self.correlator.outbox().clone(),
            self.settings.progress,
            self.settings.finish_delay,
        );
        progress.begin();
        {
            let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
            streams.retain(|stream| !stream.is_terminal());
            streams.push(progress.clone());
        }

        let request = StreamRequest {
            media,
            controller: Controller::new(&self.info.session_id, self.correlator.clone(), progress),
            session: self.info.clone(),
        };
        tokio::spawn(self.handler.on_stream(request));
    }

    // Releases every pending exchange and browser scope, stops progress
    // tickers and runs the close hook. Safe to call more than once.
    pub fn close(&self, reason: CloseReason) {
        if self.correlator.is_closed() {
            return;
        }
        let released = self.correlator.close();
        for progress in self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            progress.cancel();
        }
        tracing::info!(
            session_id = %self.info.session_id,
            code = reason.code,
            released,
            "client disconnected"
        );
        self.handler.on_closed(&self.info, &reason);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close(CloseReason::abnormal());
    }
}
