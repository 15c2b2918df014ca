use crate::error::ExchangeError;
use crate::model::FailurePayload;
use crate::protocol::{Action, Envelope, ProtocolRevision};
use rand::{distributions::Alphanumeric, Rng};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub const EXCHANGE_ID_LEN: usize = 22;

pub fn new_exchange_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(EXCHANGE_ID_LEN)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn post(&self, envelope: Envelope) -> Result<(), ExchangeError> {
        self.tx
            .send(envelope)
            .map_err(|_| ExchangeError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

type Slot = oneshot::Sender<Result<Envelope, ExchangeError>>;

struct PendingExchange {
    accepts: &'static [Action],
    seq: u64,
    slot: Slot,
}

struct Scope {
    seq: u64,
    events: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct CorrelatorState {
    closed: bool,
    next_seq: u64,
    pending: HashMap<String, PendingExchange>,
    scopes: HashMap<String, Scope>,
}

impl CorrelatorState {
    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Per-connection correlation table: pending request/reply exchanges keyed by
/// exchange id, plus long-lived browser scopes keyed by instance id.
pub struct Correlator {
    outbox: Outbox,
    revision: ProtocolRevision,
    reply_timeout: Option<Duration>,
    state: Mutex<CorrelatorState>,
}

impl Correlator {
    pub fn new(outbox: Outbox, revision: ProtocolRevision) -> Self {
        Self {
            outbox,
            revision,
            reply_timeout: None,
            state: Mutex::new(CorrelatorState::default()),
        }
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Option<Duration>) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    pub fn revision(&self) -> ProtocolRevision {
        self.revision
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    fn state(&self) -> MutexGuard<'_, CorrelatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn post(&self, envelope: Envelope) -> Result<(), ExchangeError> {
        self.outbox.post(envelope)
    }

    /// Sends `action` with a fresh exchange id and suspends until a reply whose
    /// action is in `accepts` arrives for that id, or the connection closes.
    pub async fn send_and_await(
        &self,
        action: Action,
        payload: Value,
        accepts: &'static [Action],
    ) -> Result<Envelope, ExchangeError> {
        let (exchange_id, rx) = self.register(accepts)?;
        let mut guard = AbandonOnDrop {
            correlator: self,
            exchange_id: &exchange_id,
            armed: true,
        };

        self.outbox
            .post(Envelope::correlated(action, exchange_id.clone(), payload))?;
        tracing::debug!(exchange_id = %exchange_id, action = %action, "exchange sent");

        let received = match self.reply_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    tracing::warn!(exchange_id = %exchange_id, action = %action, "exchange timed out");
                    return Err(ExchangeError::Timeout(limit));
                }
            },
            None => rx.await,
        };
        guard.armed = false;
        received.unwrap_or(Err(ExchangeError::ConnectionClosed))
    }

    fn register(
        &self,
        accepts: &'static [Action],
    ) -> Result<(String, oneshot::Receiver<Result<Envelope, ExchangeError>>), ExchangeError> {
        let mut state = self.state();
        if state.closed {
            return Err(ExchangeError::ConnectionClosed);
        }
        let mut exchange_id = new_exchange_id();
        while state.pending.contains_key(&exchange_id) || state.scopes.contains_key(&exchange_id) {
            exchange_id = new_exchange_id();
        }
        let (slot, rx) = oneshot::channel();
        let seq = state.bump();
        state.pending.insert(
            exchange_id.clone(),
            PendingExchange { accepts, seq, slot },
        );
        Ok((exchange_id, rx))
    }

    fn abandon(&self, exchange_id: &str) {
        if self.state().pending.remove(exchange_id).is_some() {
            tracing::debug!(exchange_id = %exchange_id, "exchange abandoned");
        }
    }

    pub fn resolve(&self, envelope: Envelope) -> bool {
        let mut state = self.state();
        let matched = match envelope.exchange_id.as_deref() {
            Some(id) => state
                .pending
                .get(id)
                .filter(|p| p.accepts.contains(&envelope.action) || envelope.action == Action::Failed)
                .map(|_| id.to_string()),
            None if !self.revision.requires_reply_id() => state
                .pending
                .iter()
                .filter(|(_, p)| p.accepts.contains(&envelope.action))
                .min_by_key(|(_, p)| p.seq)
                .map(|(id, _)| id.clone()),
            None => None,
        };

        let Some(exchange_id) = matched else {
            return false;
        };
        let Some(pending) = state.pending.remove(&exchange_id) else {
            return false;
        };
        drop(state);

        let outcome = if envelope.action == Action::Failed {
            let failure = FailurePayload::from_value(&envelope.payload);
            Err(ExchangeError::Remote {
                status: failure.status,
                message: failure.message,
            })
        } else {
            Ok(envelope)
        };
        // The waiter may have been dropped by now; that is not an error.
        let _ = pending.slot.send(outcome);
        true
    }

    pub fn open_scope(
        &self,
        scope_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, ExchangeError> {
        let mut state = self.state();
        if state.closed {
            return Err(ExchangeError::ConnectionClosed);
        }
        let (events, rx) = mpsc::unbounded_channel();
        let seq = state.bump();
        state.scopes.insert(scope_id.to_string(), Scope { seq, events });
        Ok(rx)
    }

    pub fn close_scope(&self, scope_id: &str) {
        self.state().scopes.remove(scope_id);
    }

    pub fn has_scope(&self, scope_id: &str) -> bool {
        self.state().scopes.contains_key(scope_id)
    }

    pub fn route_scoped(&self, envelope: Envelope) -> bool {
        let state = self.state();
        let by_id = envelope
            .exchange_id
            .as_deref()
            .and_then(|id| state.scopes.get(id));
        let by_field = || {
            envelope
                .str_field("browser_id")
                .and_then(|id| state.scopes.get(id))
        };
        let newest = || state.scopes.values().max_by_key(|scope| scope.seq);

        match by_id.or_else(by_field).or_else(newest) {
            Some(scope) => scope.events.send(envelope).is_ok(),
            None => false,
        }
    }

    pub fn close(&self) -> usize {
        let (pending, scopes) = {
            let mut state = self.state();
            state.closed = true;
            let pending: Vec<PendingExchange> = state.pending.drain().map(|(_, p)| p).collect();
            let scopes = state.scopes.len();
            state.scopes.clear();
            (pending, scopes)
        };
        let released = pending.len();
        for exchange in pending {
            let _ = exchange.slot.send(Err(ExchangeError::ConnectionClosed));
        }
        if released > 0 || scopes > 0 {
            tracing::debug!(released, scopes, "released pending exchanges on close");
        }
        released
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }
}

struct AbandonOnDrop<'a> {
    correlator: &'a Correlator,
    exchange_id: &'a str,
    armed: bool,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.correlator.abandon(self.exchange_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;

    const RESULT_ONLY: &[Action] = &[Action::Result];

    fn correlator(revision: ProtocolRevision) -> (Arc<Correlator>, mpsc::UnboundedReceiver<Envelope>) {
        let (outbox, rx) = Outbox::channel();
        (Arc::new(Correlator::new(outbox, revision)), rx)
    }

    fn spawn_fetch(
        correlator: &Arc<Correlator>,
        url: &str,
    ) -> tokio::task::JoinHandle<Result<Envelope, ExchangeError>> {
        let correlator = correlator.clone();
        let payload = json!({ "url": url });
        tokio::spawn(async move {
            correlator
                .send_and_await(Action::Fetch, payload, RESULT_ONLY)
                .await
        })
    }

    #[test]
    fn exchange_ids_do_not_collide() {
        let ids: HashSet<String> = (0..20_000).map(|_| new_exchange_id()).collect();
        assert_eq!(ids.len(), 20_000);
        assert!(ids.iter().all(|id| id.len() == EXCHANGE_ID_LEN));
    }

    #[tokio::test]
    async fn reply_resolves_exactly_once() {
        let (correlator, mut sent) = correlator(ProtocolRevision::Current);
        let task = spawn_fetch(&correlator, "https://a.test");

        let request = sent.recv().await.unwrap();
        assert_eq!(request.action, Action::Fetch);
        let id = request.exchange_id.clone().unwrap();

        let reply = Envelope::correlated(Action::Result, id.clone(), json!({ "status": 200 }));
        assert!(correlator.resolve(reply.clone()));
        assert!(!correlator.resolve(reply), "duplicate must be discarded");

        let resolved = task.await.unwrap().unwrap();
        assert_eq!(resolved.payload["status"], 200);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_exchanges_do_not_cross_resolve() {
        let (correlator, mut sent) = correlator(ProtocolRevision::Current);
        let first = spawn_fetch(&correlator, "https://first.test");
        let second = spawn_fetch(&correlator, "https://second.test");

        let mut ids = HashMap::new();
        for _ in 0..2 {
            let env = sent.recv().await.unwrap();
            ids.insert(
                env.str_field("url").unwrap().to_string(),
                env.exchange_id.unwrap(),
            );
        }

        correlator.resolve(Envelope::correlated(
            Action::Result,
            ids["https://second.test"].clone(),
            json!({ "body": "second" }),
        ));
        correlator.resolve(Envelope::correlated(
            Action::Result,
            ids["https://first.test"].clone(),
            json!({ "body": "first" }),
        ));

        assert_eq!(first.await.unwrap().unwrap().payload["body"], "first");
        assert_eq!(second.await.unwrap().unwrap().payload["body"], "second");
    }

    #[tokio::test]
    async fn wrong_action_or_missing_id_is_ignored_in_current_revision() {
        let (correlator, mut sent) = correlator(ProtocolRevision::Current);
        let task = spawn_fetch(&correlator, "https://a.test");
        let id = sent.recv().await.unwrap().exchange_id.unwrap();

        assert!(!correlator.resolve(Envelope::correlated(
            Action::SelectResult,
            id.clone(),
            json!({})
        )));
        assert!(!correlator.resolve(Envelope::event(Action::Result, json!({}))));
        assert_eq!(correlator.pending_count(), 1);

        assert!(correlator.resolve(Envelope::correlated(Action::Result, id, json!({}))));
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn legacy_replies_without_id_resolve_oldest_first() {
        let (correlator, mut sent) = correlator(ProtocolRevision::Legacy);
        let first = spawn_fetch(&correlator, "https://first.test");
        sent.recv().await.unwrap();
        let second = spawn_fetch(&correlator, "https://second.test");
        sent.recv().await.unwrap();

        assert!(correlator.resolve(Envelope::event(Action::Result, json!({ "n": 1 }))));
        assert!(correlator.resolve(Envelope::event(Action::Result, json!({ "n": 2 }))));
        assert!(!correlator.resolve(Envelope::event(Action::Result, json!({ "n": 3 }))));

        assert_eq!(first.await.unwrap().unwrap().payload["n"], 1);
        assert_eq!(second.await.unwrap().unwrap().payload["n"], 2);
    }

    #[tokio::test]
    async fn failed_reply_surfaces_remote_error() {
        let (correlator, mut sent) = correlator(ProtocolRevision::Current);
        let task = spawn_fetch(&correlator, "https://a.test");
        let id = sent.recv().await.unwrap().exchange_id.unwrap();

        correlator.resolve(Envelope::correlated(
            Action::Failed,
            id,
            json!({ "status": 403, "message": "blocked" }),
        ));
        assert_eq!(
            task.await.unwrap().unwrap_err(),
            ExchangeError::Remote {
                status: 403,
                message: "blocked".to_string()
            }
        );
    }

    #[tokio::test]
    async fn close_releases_every_pending_exchange() {
        let (correlator, mut sent) = correlator(ProtocolRevision::Current);
        let tasks: Vec<_> = (0..5)
            .map(|i| spawn_fetch(&correlator, &format!("https://{i}.test")))
            .collect();
        for _ in 0..5 {
            sent.recv().await.unwrap();
        }

        assert_eq!(correlator.close(), 5);
        for task in tasks {
            let outcome = tokio::time::timeout(Duration::from_secs(1), task)
                .await
                .expect("waiter must not stay suspended")
                .unwrap();
            assert_eq!(outcome.unwrap_err(), ExchangeError::ConnectionClosed);
        }

        let late = correlator
            .send_and_await(Action::Fetch, json!({}), RESULT_ONLY)
            .await;
        assert_eq!(late.unwrap_err(), ExchangeError::ConnectionClosed);
    }

    #[tokio::test]
    async fn dropped_outbox_fails_fast() {
        let (correlator, sent) = correlator(ProtocolRevision::Current);
        drop(sent);
        let outcome = correlator
            .send_and_await(Action::Fetch, json!({}), RESULT_ONLY)
            .await;
        assert_eq!(outcome.unwrap_err(), ExchangeError::ConnectionClosed);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_timeout_abandons_exchange() {
        let (outbox, _sent) = Outbox::channel();
        let correlator = Correlator::new(outbox, ProtocolRevision::Current)
            .with_reply_timeout(Some(Duration::from_secs(5)));
        let outcome = correlator
            .send_and_await(Action::Fetch, json!({}), RESULT_ONLY)
            .await;
        assert_eq!(outcome.unwrap_err(), ExchangeError::Timeout(Duration::from_secs(5)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn scoped_events_route_by_id_field_then_newest() {
        let (correlator, _sent) = correlator(ProtocolRevision::Current);
        let mut older = correlator.open_scope("browser-a").unwrap();
        let mut newer = correlator.open_scope("browser-b").unwrap();

        assert!(correlator.route_scoped(Envelope::correlated(
            Action::BrowserUrlFinished,
            "browser-a",
            json!({ "url": "https://a.test" })
        )));
        assert_eq!(older.recv().await.unwrap().str_field("url"), Some("https://a.test"));

        assert!(correlator.route_scoped(Envelope::correlated(
            Action::BrowserUrlRequest,
            "nav-1",
            json!({ "url": "https://x.test", "browser_id": "browser-a" })
        )));
        assert_eq!(older.recv().await.unwrap().exchange_id.as_deref(), Some("nav-1"));

        assert!(correlator.route_scoped(Envelope::correlated(
            Action::BrowserUrlRequest,
            "nav-2",
            json!({ "url": "https://y.test" })
        )));
        assert_eq!(newer.recv().await.unwrap().exchange_id.as_deref(), Some("nav-2"));

        correlator.close_scope("browser-b");
        correlator.close_scope("browser-a");
        assert!(!correlator.route_scoped(Envelope::event(Action::BrowserUrlFinished, json!({}))));
    }
}
