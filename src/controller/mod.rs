use crate::browser::BrowserControl;
use crate::correlation::Correlator;
use crate::error::ExchangeError;
use crate::model::{
    DirectLink, FetchApi, FetchBody, FetchRequest, FetchResponse, SelectItem,
    DEFAULT_AXIOS_CDN,
};
use crate::progress::{Progress, ProgressUpdate};
use crate::protocol::{Action, Envelope};
use serde_json::{json, Value};
use std::sync::Arc;

const FETCH_REPLIES: &[Action] = &[Action::Result];
const SELECT_REPLIES: &[Action] = &[Action::SelectResult];

#[derive(Clone)]
pub struct Controller {
    session_id: Arc<str>,
    correlator: Arc<Correlator>,
    progress: Progress,
    browser: BrowserControl,
}

impl Controller {
    pub fn new(session_id: &str, correlator: Arc<Correlator>, progress: Progress) -> Self {
        let browser = BrowserControl::new(correlator.clone(), progress.clone());
        Self {
            session_id: Arc::from(session_id),
            correlator,
            progress,
            browser,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn browser(&self) -> &BrowserControl {
        &self.browser
    }

    pub async fn fetch_raw(&self, mut request: FetchRequest) -> Result<FetchResponse, ExchangeError> {
        request.api = FetchApi::Http;
        request.axios = None;
        self.fetch(request).await
    }

    pub async fn fetch_via_browser(
        &self,
        mut request: FetchRequest,
        script: Option<String>,
    ) -> Result<FetchResponse, ExchangeError> {
        request.api = FetchApi::Axios;
        let mut axios = request.axios.take().unwrap_or_default();
        if axios.cdn.as_deref().unwrap_or("").is_empty() {
            axios.cdn = Some(DEFAULT_AXIOS_CDN.to_string());
        }
        if script.is_some() {
            axios.script = script;
        }
        request.axios = Some(axios);
        self.fetch(request).await
    }

    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, ExchangeError> {
        let kind = request.response_type;
        let payload =
            serde_json::to_value(&request).map_err(|err| ExchangeError::Malformed(err.to_string()))?;
        let reply = self
            .correlator
            .send_and_await(Action::Fetch, payload, FETCH_REPLIES)
            .await?;
        let response = FetchResponse::from_reply(&reply.payload, kind);
        tracing::debug!(
            session_id = %self.session_id,
            url = %request.url,
            status = response.status,
            "fetch completed"
        );
        Ok(response)
    }

    pub async fn cache_get(&self, key: &str) -> Result<Option<Value>, ExchangeError> {
        let response = self
            .fetch_raw(FetchRequest::get(format!("db://get:{key}")))
            .await?;
        if !response.is_ok() {
            return Ok(None);
        }
        Ok(match response.body {
            FetchBody::Empty => None,
            body => Some(body.into_value()),
        })
    }

    pub async fn cache_set(&self, key: &str, value: impl Into<Value>) -> Result<bool, ExchangeError> {
        let text = match value.into() {
            Value::String(text) => text,
            other => other.to_string(),
        };
        let response = self
            .fetch_raw(FetchRequest::post(format!("db://set:{key}"), text))
            .await?;
        Ok(response.is_ok())
    }

    pub async fn cache_delete(&self, key: &str) -> Result<(), ExchangeError> {
        self.fetch_raw(FetchRequest::get(format!("db://delete:{key}")).method("delete"))
            .await?;
        Ok(())
    }

    pub fn progress(&self, update: impl Into<ProgressUpdate>) {
        self.progress.update(update.into());
    }

    pub async fn finish(&self, link: DirectLink) -> bool {
        let won = self.progress.finish(link).await;
        if won {
            tracing::info!(session_id = %self.session_id, "stream finished");
        }
        won
    }

    pub fn failed(&self, status: Option<u16>, message: Option<String>) -> bool {
        let won = self.progress.failed(status, message);
        if won {
            tracing::info!(session_id = %self.session_id, "stream failed");
        }
        won
    }

    pub async fn select(&self, items: Vec<SelectItem>) -> Result<Option<SelectItem>, ExchangeError> {
        let hold = self.progress.hold();
        let outcome = self
            .correlator
            .send_and_await(Action::Select, json!({ "items": items }), SELECT_REPLIES)
            .await;
        drop(hold);
        parse_selection(outcome?)
    }
}

// `{item: {...}|null}`, or a bare item object.
fn parse_selection(reply: Envelope) -> Result<Option<SelectItem>, ExchangeError> {
    let raw = match reply.payload {
        Value::Object(mut object) if object.contains_key("item") => {
            object.remove("item").unwrap_or(Value::Null)
        }
        Value::Object(object) if object.is_empty() => Value::Null,
        other => other,
    };
    if raw.is_null() {
        return Ok(None);
    }
    serde_json::from_value(raw)
        .map(Some)
        .map_err(|err| ExchangeError::Malformed(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::BrowserCallbacks;
    use crate::config::ProgressConfig;
    use crate::correlation::Outbox;
    use crate::model::{BrowserInfo, ResponseKind, Visibility};
    use crate::progress::Phase;
    use crate::protocol::ProtocolRevision;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn controller() -> (Controller, Arc<Correlator>, mpsc::UnboundedReceiver<Envelope>) {
        let (outbox, rx) = Outbox::channel();
        let correlator = Arc::new(Correlator::new(outbox.clone(), ProtocolRevision::Current));
        let progress = Progress::new(outbox, ProgressConfig::default(), Duration::ZERO);
        (
            Controller::new("session-1", correlator.clone(), progress),
            correlator,
            rx,
        )
    }

    fn spawn_store(correlator: Arc<Correlator>, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        tokio::spawn(async move {
            let mut store: HashMap<String, String> = HashMap::new();
            while let Some(env) = rx.recv().await {
                if env.action != Action::Fetch {
                    continue;
                }
                let url = env.str_field("url").unwrap_or_default().to_string();
                let (status, body) = if let Some(key) = url.strip_prefix("db://set:") {
                    let value = env.str_field("body").unwrap_or_default().to_string();
                    store.insert(key.to_string(), value);
                    (200, Value::Null)
                } else if let Some(key) = url.strip_prefix("db://get:") {
                    match store.get(key) {
                        Some(value) => (200, Value::String(value.clone())),
                        None => (404, Value::Null),
                    }
                } else if let Some(key) = url.strip_prefix("db://delete:") {
                    store.remove(key);
                    (200, Value::Null)
                } else {
                    (404, Value::Null)
                };
                correlator.resolve(Envelope::correlated(
                    Action::Result,
                    env.exchange_id.unwrap_or_default(),
                    json!({ "status": status, "body": body, "headers": {} }),
                ));
            }
        });
    }

    #[tokio::test]
    async fn cache_roundtrips_through_db_urls() {
        let (controller, correlator, rx) = controller();
        spawn_store(correlator, rx);

        assert!(controller.cache_set("k", "v").await.unwrap());
        assert_eq!(controller.cache_get("k").await.unwrap(), Some(json!("v")));

        assert!(controller.cache_set("obj", json!({ "n": 1 })).await.unwrap());
        assert_eq!(controller.cache_get("obj").await.unwrap(), Some(json!("{\"n\":1}")));

        controller.cache_delete("k").await.unwrap();
        assert_eq!(controller.cache_get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cached_strings_come_back_verbatim() {
        let (controller, correlator, rx) = controller();
        spawn_store(correlator, rx);

        for value in ["42", "true", "null", "[1]", "{\"a\":\"b\"}"] {
            assert!(controller.cache_set("k", value).await.unwrap());
            assert_eq!(controller.cache_get("k").await.unwrap(), Some(json!(value)));
        }
    }

    #[tokio::test]
    async fn fetch_raw_sends_http_api_and_decodes_bytes() {
        let (controller, correlator, mut rx) = controller();
        let task = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .fetch_raw(
                        FetchRequest::get("https://origin.test/file")
                            .header("referer", "https://origin.test")
                            .response_type(ResponseKind::Bytes)
                            .timeout_secs(15),
                    )
                    .await
            })
        };

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.action, Action::Fetch);
        assert_eq!(sent.payload["api"], "http");
        assert_eq!(sent.payload["method"], "get");
        assert_eq!(sent.payload["response_type"], "bytes");
        assert_eq!(sent.payload["timeout"], 15);
        assert_eq!(sent.payload["headers"]["referer"], "https://origin.test");
        assert!(sent.payload.get("axios").is_none());

        correlator.resolve(Envelope::correlated(
            Action::Result,
            sent.exchange_id.unwrap(),
            json!({ "status": 200, "body": [1, 2, 255], "headers": { "content-type": "application/octet-stream" } }),
        ));
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.body, FetchBody::Bytes(vec![1, 2, 255]));
        assert_eq!(response.headers["content-type"], "application/octet-stream");
    }

    #[tokio::test]
    async fn fetch_via_browser_requests_axios_with_default_cdn() {
        let (controller, correlator, mut rx) = controller();
        let task = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .fetch_via_browser(
                        FetchRequest::post("https://api.test/search", json!({ "q": "x" }))
                            .initial_origin("https://api.test/404"),
                        Some("window.ready = true;".to_string()),
                    )
                    .await
            })
        };

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.payload["api"], "axios");
        assert_eq!(sent.payload["axios"]["cdn"], DEFAULT_AXIOS_CDN);
        assert_eq!(sent.payload["axios"]["script"], "window.ready = true;");
        assert_eq!(sent.payload["initial_origin"], "https://api.test/404");
        assert_eq!(sent.payload["body"]["q"], "x");

        correlator.resolve(Envelope::correlated(
            Action::Result,
            sent.exchange_id.unwrap(),
            json!({ "status": 201, "body": { "ok": true } }),
        ));
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.body, FetchBody::Json(json!({ "ok": true })));
    }

    #[tokio::test]
    async fn string_bodies_are_not_reparsed() {
        let (controller, correlator, mut rx) = controller();
        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.fetch_raw(FetchRequest::get("https://x.test/n")).await })
        };
        let sent = rx.recv().await.unwrap();
        correlator.resolve(Envelope::correlated(
            Action::Result,
            sent.exchange_id.unwrap(),
            json!({ "status": 200, "body": "{\"ok\":true}" }),
        ));
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.body, FetchBody::Text("{\"ok\":true}".to_string()));
    }

    #[tokio::test]
    async fn select_null_returns_none_and_resumes_progress() {
        let (controller, correlator, mut rx) = controller();
        controller.progress.begin();
        let task = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .select(vec![
                        SelectItem::new("A", json!({ "id": 1 })),
                        SelectItem::new("B", json!({ "id": 2 })),
                    ])
                    .await
            })
        };

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.action, Action::Select);
        assert_eq!(sent.payload["items"][1]["title"], "B");
        assert_eq!(controller.progress.phase(), Phase::Paused);

        correlator.resolve(Envelope::correlated(
            Action::SelectResult,
            sent.exchange_id.unwrap(),
            json!({ "item": null }),
        ));
        assert_eq!(task.await.unwrap().unwrap(), None);
        assert_eq!(controller.progress.phase(), Phase::Running);
    }

    #[tokio::test]
    async fn select_keeps_progress_still_while_a_browser_is_visible() {
        let (controller, correlator, mut rx) = controller();
        controller.progress.begin();
        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.select(vec![SelectItem::new("A", json!({}))]).await })
        };
        let select = rx.recv().await.unwrap();
        assert_eq!(select.action, Action::Select);

        let instance = controller
            .browser()
            .spawn(
                BrowserInfo::new("https://site.test").visible(Visibility::Yes),
                BrowserCallbacks::new(),
            )
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().action, Action::Browser);

        correlator.resolve(Envelope::correlated(
            Action::SelectResult,
            select.exchange_id.unwrap(),
            json!({ "item": null }),
        ));
        assert_eq!(task.await.unwrap().unwrap(), None);
        assert_eq!(controller.progress.phase(), Phase::Paused);

        instance.close().unwrap();
        assert_eq!(controller.progress.phase(), Phase::Running);
    }

    #[tokio::test]
    async fn select_returns_chosen_item() {
        let (controller, correlator, mut rx) = controller();
        let task = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .select(vec![SelectItem::new("A", json!({ "id": 1 }))])
                    .await
            })
        };
        let sent = rx.recv().await.unwrap();
        correlator.resolve(Envelope::correlated(
            Action::SelectResult,
            sent.exchange_id.unwrap(),
            json!({ "title": "A", "data": { "id": 1 } }),
        ));
        let chosen = task.await.unwrap().unwrap().unwrap();
        assert_eq!(chosen.title, "A");
        assert_eq!(chosen.data["id"], 1);
    }

    #[tokio::test]
    async fn remote_failure_surfaces_as_error() {
        let (controller, correlator, mut rx) = controller();
        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.fetch_raw(FetchRequest::get("https://x.test")).await })
        };
        let sent = rx.recv().await.unwrap();
        correlator.resolve(Envelope::correlated(
            Action::Failed,
            sent.exchange_id.unwrap(),
            json!({ "status": 502 }),
        ));
        assert!(matches!(
            task.await.unwrap().unwrap_err(),
            ExchangeError::Remote { status: 502, .. }
        ));
    }

    #[tokio::test]
    async fn terminal_calls_are_single_fire_and_session_id_is_stable() {
        let (controller, _correlator, mut rx) = controller();
        assert_eq!(controller.session_id(), "session-1");
        assert!(controller.failed(Some(404), Some("not found".to_string())));
        assert!(!controller.finish(DirectLink::default()).await);
        controller.progress(40u8);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.action, Action::Failed);
        assert_eq!(first.payload["status"], 404);
        assert!(rx.try_recv().is_err());
    }
}
