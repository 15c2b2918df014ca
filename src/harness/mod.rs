use crate::config::{HarnessConfig, SelectPolicy};
use crate::error::HarnessError;
use crate::model::{
    AppInfo, DeviceInfo, DirectLink, FailurePayload, FetchBody, FetchRequest, FetchResponse,
    Headers, MediaRequest,
};
use crate::protocol::{self, Action, Envelope, ProtocolRevision};
use crate::session::IDENTITY_PARAM;
use base64::{engine::general_purpose, Engine as _};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

#[derive(Clone)]
pub struct HarnessOptions {
    pub app_version: String,
    pub select: SelectPolicy,
    pub timeout: Option<Duration>,
    pub on_progress: Option<ProgressFn>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self::from(&HarnessConfig::default())
    }
}

impl From<&HarnessConfig> for HarnessOptions {
    fn from(config: &HarnessConfig) -> Self {
        Self {
            app_version: config.app_version.clone(),
            select: config.select,
            timeout: config.timeout_secs.map(Duration::from_secs),
            on_progress: None,
        }
    }
}

impl HarnessOptions {
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn answer(&self, request: &FetchRequest) -> FetchResponse {
        let target = request.url.strip_prefix("db://").unwrap_or(&request.url);
        let (status, body) = match target.split_once(':') {
            Some(("get", key)) => match self.get(key) {
                Some(value) => (200, FetchBody::Text(value)),
                None => (404, FetchBody::Empty),
            },
            Some(("set", key)) => {
                let value = match &request.body {
                    Some(Value::String(text)) => text.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                self.lock().insert(key.to_string(), value);
                (200, FetchBody::Empty)
            }
            Some(("delete", key)) => {
                self.lock().remove(key);
                (200, FetchBody::Empty)
            }
            _ => (400, FetchBody::Text(format!("unsupported cache url {}", request.url))),
        };
        FetchResponse {
            status,
            body,
            headers: Headers::new(),
        }
    }
}

/// Plays the client app against a plugin endpoint: sends one `stream` request
/// and services every fetch, cache and select request until the plugin
/// reaches a terminal state. `Ok(None)` means the plugin failed, the socket
/// closed early or the timeout elapsed.
pub async fn run_test(
    url: &str,
    media: &MediaRequest,
    options: HarnessOptions,
) -> Result<Option<DirectLink>, HarnessError> {
    if !url.starts_with("ws://") && !url.starts_with("wss://") {
        return Err(HarnessError::Url(url.to_string()));
    }
    let target = with_identity(url, &options.app_version)?;
    let (socket, _) = connect_async(target.as_str()).await?;
    let (mut write, mut read) = socket.split();
    tracing::info!(url = %url, media = %media.describe(), "test connected");

    let revision = ProtocolRevision::for_app_version(&options.app_version);
    let stream = Envelope::event(Action::Stream, media.to_payload(revision));
    write.send(Message::Text(protocol::encode(&stream)?)).await?;

    let client = reqwest::Client::new();
    let store = MemoryStore::default();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Envelope>();
    let deadline = async {
        match options.timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let outcome = loop {
        tokio::select! {
            Some(reply) = reply_rx.recv() => {
                if let Err(err) = write.send(Message::Text(protocol::encode(&reply)?)).await {
                    tracing::warn!(error = %err, "test reply failed");
                    break None;
                }
            }
            msg = read.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Close(_))) | None => break None,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "test socket failed");
                        break None;
                    }
                };
                let envelope = match protocol::decode_str(&text) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping malformed frame from plugin");
                        continue;
                    }
                };
                if let Some(done) = handle_envelope(envelope, media, &options, &client, &store, &reply_tx) {
                    break done;
                }
            }
            _ = &mut deadline => {
                tracing::warn!(media = %media.describe(), "test timed out");
                break None;
            }
        }
    };

    let _ = write.close().await;
    Ok(outcome)
}

// `Some(..)` ends the test.
fn handle_envelope(
    envelope: Envelope,
    media: &MediaRequest,
    options: &HarnessOptions,
    client: &reqwest::Client,
    store: &MemoryStore,
    replies: &mpsc::UnboundedSender<Envelope>,
) -> Option<Option<DirectLink>> {
    match envelope.action {
        Action::Result => match serde_json::from_value::<DirectLink>(envelope.payload) {
            Ok(link) => Some(Some(link)),
            Err(err) => {
                tracing::warn!(error = %err, "final result is not a direct link");
                Some(None)
            }
        },
        Action::Failed => {
            let failure = FailurePayload::from_value(&envelope.payload);
            tracing::info!(status = failure.status, message = %failure.message, "plugin reported failure");
            Some(None)
        }
        Action::Progress => {
            let percent = envelope
                .field("progress")
                .and_then(Value::as_u64)
                .map(|p| p.min(100) as u8)
                .unwrap_or_default();
            match &options.on_progress {
                Some(callback) => callback(percent),
                None => tracing::info!(
                    media = %media.describe(),
                    "received test progress {}%",
                    percent
                ),
            }
            None
        }
        Action::Fetch => {
            let request: FetchRequest = match serde_json::from_value(envelope.payload.clone()) {
                Ok(request) => request,
                Err(err) => {
                    tracing::warn!(error = %err, "unreadable fetch request");
                    return None;
                }
            };
            let client = client.clone();
            let store = store.clone();
            let replies = replies.clone();
            let exchange_id = envelope.exchange_id;
            tokio::spawn(async move {
                let response = if request.url.starts_with("db://") {
                    store.answer(&request)
                } else {
                    execute_fetch(&client, &request).await
                };
                let _ = replies.send(reply(Action::Result, exchange_id, response.to_reply()));
            });
            None
        }
        Action::Select => {
            let item = match options.select {
                SelectPolicy::First => envelope
                    .field("items")
                    .and_then(|items| items.get(0))
                    .cloned()
                    .unwrap_or(Value::Null),
                SelectPolicy::None => Value::Null,
            };
            let _ = replies.send(reply(
                Action::SelectResult,
                envelope.exchange_id,
                json!({ "item": item }),
            ));
            None
        }
        // There is no browser engine here; answer the awaited calls so the
        // plugin does not stall.
        Action::BrowserCookie => {
            let _ = replies.send(reply(
                Action::BrowserCookieResult,
                envelope.exchange_id,
                json!({ "cookie": "" }),
            ));
            None
        }
        Action::BrowserEvaluate => {
            let _ = replies.send(reply(
                Action::BrowserEvaluateResult,
                envelope.exchange_id,
                json!({ "result": null }),
            ));
            None
        }
        other => {
            tracing::debug!(action = %other, "ignoring action in test client");
            None
        }
    }
}

fn reply(action: Action, exchange_id: Option<String>, payload: Value) -> Envelope {
    match exchange_id {
        Some(id) => Envelope::correlated(action, id, payload),
        None => Envelope::event(action, payload),
    }
}

// Performs a real HTTP call. Transport failures are reported as status 0
// with the error text as body.
pub async fn execute_fetch(client: &reqwest::Client, request: &FetchRequest) -> FetchResponse {
    let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let mut builder = client.request(method, &request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    match &request.body {
        Some(Value::String(text)) => builder = builder.body(text.clone()),
        Some(Value::Null) | None => {}
        Some(other) => builder = builder.body(other.to_string()),
    }
    if let Some(secs) = request.timeout {
        builder = builder.timeout(Duration::from_secs(secs));
    }

    let response = match builder.send().await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(url = %request.url, error = %err, "test fetch failed");
            return transport_failure(err);
        }
    };

    let status = response.status().as_u16();
    let mut headers = Headers::new();
    for (name, value) in response.headers() {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    let body = if request.wants_bytes() {
        response.bytes().await.map(|bytes| FetchBody::Bytes(bytes.to_vec()))
    } else {
        response.text().await.map(FetchBody::from_text)
    };
    match body {
        Ok(body) => FetchResponse {
            status,
            body,
            headers,
        },
        Err(err) => transport_failure(err),
    }
}

fn transport_failure(err: reqwest::Error) -> FetchResponse {
    FetchResponse {
        status: 0,
        body: FetchBody::Text(err.to_string()),
        headers: Headers::new(),
    }
}

fn with_identity(url: &str, app_version: &str) -> Result<String, HarnessError> {
    let app = AppInfo {
        version: app_version.to_string(),
        ..AppInfo::default()
    };
    let identity = json!({ "app_info": app, "device_info": DeviceInfo::default() });
    let encoded = general_purpose::STANDARD.encode(serde_json::to_vec(&identity)?);
    let encoded = encoded
        .replace('+', "%2B")
        .replace('/', "%2F")
        .replace('=', "%3D");
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (url, None),
    };
    // The handshake request line needs a path, even if it is only `/`.
    let authority = base.split_once("://").map_or(base, |(_, rest)| rest);
    let path = if authority.contains('/') { "" } else { "/" };
    Ok(match query {
        Some(query) => format!("{base}{path}?{query}&{IDENTITY_PARAM}={encoded}"),
        None => format!("{base}{path}?{IDENTITY_PARAM}={encoded}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::{QualityLink, SelectItem};
    use crate::server::{self, ServerState};
    use crate::session::{handler_fn, parse_identity, PluginHandler, StreamRequest};
    use axum::http::{HeaderMap, Method};
    use axum::{
        routing::{any, get},
        Router,
    };
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    async fn spawn_origin() -> SocketAddr {
        let app = Router::new()
            .route("/title", get(|| async { r#"{"title":"Heat"}"# }))
            .route("/blob", get(|| async { vec![0u8, 1, 2, 254] }))
            .route("/echo", any(echo));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    async fn echo(method: Method, headers: HeaderMap, body: String) -> axum::Json<Value> {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
        axum::Json(json!({
            "method": method.as_str(),
            "flag": header("x-bridge-test"),
            "body": body,
        }))
    }

    async fn spawn_plugin(handler: Arc<dyn PluginHandler>) -> (String, watch::Sender<bool>) {
        let mut config = Config::default();
        config.exchange.finish_delay_ms = 0;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState::new(handler, &config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = server::start(listener, state, shutdown_rx)
                .await
                .map_err(|e| e.to_string());
        });
        (format!("ws://{addr}"), shutdown_tx)
    }

    #[test]
    fn identity_query_is_readable_by_the_server() {
        let url = with_identity("ws://host/plugin?x=1", "9.8.9").unwrap();
        let (base, blob) = url.split_once(&format!("&{IDENTITY_PARAM}=")).unwrap();
        assert_eq!(base, "ws://host/plugin?x=1");
        let blob = blob
            .replace("%2B", "+")
            .replace("%2F", "/")
            .replace("%3D", "=");
        let identity = parse_identity(Some(&blob), &Config::default().default_identity());
        assert_eq!(identity.app.version, "9.8.9");
        assert_eq!(identity.revision(), ProtocolRevision::Current);
    }

    #[test]
    fn identity_query_gets_a_root_path_on_bare_hosts() {
        let url = with_identity("ws://127.0.0.1:8080", "9.8.9").unwrap();
        assert!(url.starts_with(&format!("ws://127.0.0.1:8080/?{IDENTITY_PARAM}=")));

        let url = with_identity("wss://host.test?x=1", "9.8.9").unwrap();
        assert!(url.starts_with(&format!("wss://host.test/?x=1&{IDENTITY_PARAM}=")));

        let url = with_identity("ws://host.test/plugin", "9.8.9").unwrap();
        assert!(url.starts_with(&format!("ws://host.test/plugin?{IDENTITY_PARAM}=")));
    }

    #[test]
    fn memory_store_answers_cache_urls() {
        let store = MemoryStore::default();
        let set = FetchRequest::post("db://set:k", "v");
        assert_eq!(store.answer(&set).status, 200);
        let got = store.answer(&FetchRequest::get("db://get:k"));
        assert_eq!(got.body, FetchBody::Text("v".to_string()));
        store.answer(&FetchRequest::get("db://delete:k"));
        assert_eq!(store.answer(&FetchRequest::get("db://get:k")).status, 404);
        assert_eq!(store.answer(&FetchRequest::get("db://nope")).status, 400);
    }

    #[tokio::test]
    async fn rejects_non_websocket_urls() {
        let err = run_test("http://x.test", &MediaRequest::movie("1"), HarnessOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Url(_)));
    }

    #[tokio::test]
    async fn full_exchange_against_local_plugin() {
        let origin = spawn_origin().await;
        let handler = handler_fn(move |request: StreamRequest| async move {
            let controller = request.controller;
            controller.progress(20u8);

            let page = controller
                .fetch_raw(FetchRequest::get(format!("http://{origin}/title")))
                .await
                .unwrap();
            let blob = controller
                .fetch_raw(
                    FetchRequest::get(format!("http://{origin}/blob"))
                        .response_type(crate::model::ResponseKind::Bytes),
                )
                .await
                .unwrap();
            assert!(controller.cache_set("last", request.media.media_id.clone()).await.unwrap());
            let cached = controller.cache_get("last").await.unwrap();
            let picked = controller
                .select(vec![
                    SelectItem::new("first", json!({ "n": 1 })),
                    SelectItem::new("second", json!({ "n": 2 })),
                ])
                .await
                .unwrap();

            let title = match page.body {
                FetchBody::Json(value) => value["title"].as_str().unwrap_or_default().to_string(),
                _ => String::new(),
            };
            let mut link = DirectLink {
                qualities: vec![QualityLink::new("1080p", "https://cdn.test/heat.m3u8")],
                title: Some(title),
                ..Default::default()
            };
            link.source_name = Some(format!(
                "{}|{}|{}",
                blob.body.as_bytes().map(|b| b.len()).unwrap_or_default(),
                cached.and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default(),
                picked.map(|item| item.title).unwrap_or_default(),
            ));
            controller.finish(link).await;
        });
        let (url, _shutdown) = spawn_plugin(handler).await;
        let url = format!("{url}/plugin");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let options = {
            let seen = seen.clone();
            HarnessOptions::default().on_progress(move |p| seen.lock().unwrap().push(p))
        };
        let link = run_test(&url, &MediaRequest::movie("949"), options)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(link.title.as_deref(), Some("Heat"));
        assert_eq!(link.source_name.as_deref(), Some("4|949|first"));
        assert_eq!(link.qualities[0].name, "1080p");
        assert_eq!(*seen.lock().unwrap(), vec![20, 100]);
    }

    #[tokio::test]
    async fn fetch_forwards_method_headers_and_body() {
        let origin = spawn_origin().await;
        let handler = handler_fn(move |request: StreamRequest| async move {
            let controller = request.controller;
            let echoed = controller
                .fetch_raw(
                    FetchRequest::post(format!("http://{origin}/echo"), json!({ "q": "heat" }))
                        .method("put")
                        .header("x-bridge-test", "yes"),
                )
                .await
                .unwrap();
            let echoed = match echoed.body {
                FetchBody::Json(value) => value,
                other => panic!("unexpected echo body {other:?}"),
            };
            let sent: Value = serde_json::from_str(echoed["body"].as_str().unwrap()).unwrap();
            let link = DirectLink {
                title: echoed["flag"].as_str().map(str::to_string),
                source_name: echoed["method"].as_str().map(str::to_string),
                qualities: vec![QualityLink::new("auto", sent["q"].as_str().unwrap_or_default())],
                ..Default::default()
            };
            controller.finish(link).await;
        });
        let (url, _shutdown) = spawn_plugin(handler).await;

        let link = run_test(&url, &MediaRequest::movie("949"), HarnessOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.source_name.as_deref(), Some("PUT"));
        assert_eq!(link.title.as_deref(), Some("yes"));
        assert_eq!(link.qualities[0].link, "heat");
    }

    #[tokio::test]
    async fn connects_to_a_bare_host_url() {
        let handler = handler_fn(|request: StreamRequest| async move {
            let link = DirectLink {
                qualities: vec![QualityLink::new("auto", "https://cdn.test/a.m3u8")],
                ..Default::default()
            };
            request.controller.finish(link).await;
        });
        let (url, _shutdown) = spawn_plugin(handler).await;
        assert!(!url.trim_start_matches("ws://").contains('/'));

        let link = run_test(&url, &MediaRequest::movie("1"), HarnessOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.qualities[0].link, "https://cdn.test/a.m3u8");
    }

    #[tokio::test]
    async fn failed_plugin_yields_none() {
        let handler = handler_fn(|request: StreamRequest| async move {
            request.controller.failed(Some(404), Some("nothing here".to_string()));
        });
        let (url, _shutdown) = spawn_plugin(handler).await;
        let outcome = run_test(&url, &MediaRequest::episode("1", "2", "3"), HarnessOptions::default())
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn legacy_app_version_sends_compact_media_and_select_none() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |request: StreamRequest| {
            let seen_tx = seen_tx.clone();
            async move {
                let picked = request
                    .controller
                    .select(vec![SelectItem::new("only", json!({}))])
                    .await
                    .unwrap();
                let _ = seen_tx.send((request.session.revision, request.media.clone(), picked));
                request.controller.finish(DirectLink::default()).await;
            }
        });
        let (url, _shutdown) = spawn_plugin(handler).await;
        let options = HarnessOptions {
            app_version: "9.8.0".to_string(),
            select: SelectPolicy::None,
            ..HarnessOptions::default()
        };
        let outcome = run_test(&url, &MediaRequest::episode("1396", "1", "1"), options)
            .await
            .unwrap();
        assert!(outcome.is_some());

        let (revision, media, picked) = seen_rx.recv().await.unwrap();
        assert_eq!(revision, ProtocolRevision::Legacy);
        assert_eq!(media.season_id.as_deref(), Some("1"));
        assert!(picked.is_none());
    }

    #[tokio::test]
    async fn timeout_yields_none() {
        let handler = handler_fn(|_request: StreamRequest| async move {
            std::future::pending::<()>().await;
        });
        let (url, _shutdown) = spawn_plugin(handler).await;
        let options = HarnessOptions {
            timeout: Some(Duration::from_millis(300)),
            ..HarnessOptions::default()
        };
        let outcome = run_test(&url, &MediaRequest::movie("1"), options).await.unwrap();
        assert!(outcome.is_none());
    }
}
