use crate::config::Config;
use crate::correlation::Outbox;
use crate::model::ClientIdentity;
use crate::protocol;
use crate::session::{
    parse_identity, CloseReason, PluginHandler, Session, SessionInfo, SessionSettings,
    IDENTITY_PARAM,
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Clone)]
pub struct ServerState {
    handler: Arc<dyn PluginHandler>,
    default_identity: Arc<ClientIdentity>,
    settings: SessionSettings,
}

impl ServerState {
    pub fn new(handler: Arc<dyn PluginHandler>, config: &Config) -> Self {
        Self {
            handler,
            default_identity: config.default_identity(),
            settings: SessionSettings::from(config),
        }
    }
}

// Clients may connect on any path; `/health` is the only plain HTTP route.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .fallback(ws_handler)
        .with_state(state)
}

pub async fn start(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "plugin bridge listening");
    state.handler.on_listening(addr);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.changed().await;
    })
    .await?;

    Ok(())
}

async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    query: Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let identity = parse_identity(
        query.0.get(IDENTITY_PARAM).map(String::as_str),
        &state.default_identity,
    );
    let info = SessionInfo::new(identity, Some(remote));
    ws.on_upgrade(move |socket| handle_socket(socket, info, state))
}

async fn handle_socket(socket: WebSocket, info: SessionInfo, state: Arc<ServerState>) {
    let (mut sink, mut stream) = socket.split();
    let (outbox, mut outgoing) = Outbox::channel();
    let session = Session::open(info, outbox, state.handler.clone(), state.settings);
    let session_id = session.session_id().to_string();

    let writer = tokio::spawn(async move {
        while let Some(envelope) = outgoing.recv().await {
            let text = match protocol::encode(&envelope) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(session_id = %session_id, action = %envelope.action, error = %err, "envelope encode failed");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut reason = CloseReason::abnormal();
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => session.handle_frame(text.as_bytes()),
            Ok(Message::Binary(bytes)) => session.handle_frame(&bytes),
            Ok(Message::Close(frame)) => {
                reason = frame
                    .map(|frame| CloseReason::new(frame.code, frame.reason.to_string()))
                    .unwrap_or_else(|| CloseReason::new(1005, ""));
                break;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(session_id = %session.session_id(), error = %err, "socket read failed");
                break;
            }
        }
    }

    session.close(reason);
    writer.abort();
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        axum::Json(serde_json::json!({
            "status": "healthy",
            "timestamp": std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })),
    )
}
