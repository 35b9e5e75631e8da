use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;

use crate::chain::Chain;
use crate::errors::ControlPlaneErrorCode;
use crate::session::{ErrorSink, SessionId, SessionManager};
use crate::store::Store;

/// The message-oriented socket envelope: `{ "event": ..., "data": ... }`.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StartIndexerData {
    chain_id: u64,
    url: String,
}

#[derive(Debug, Deserialize)]
struct StartIndexingData {
    chain_id: u64,
    block_number_start_at: u64,
    address: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ServerError {
    error: String,
    message: String,
    detail: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ServerSuccess {
    event: String,
}

pub type OutboundRegistry = Arc<Mutex<HashMap<SessionId, mpsc::UnboundedSender<String>>>>;

/// Builds the [`ErrorSink`] that lets the Session Manager push asynchronous
/// `server_error` notifications (indexer/writer failures) back to whichever
/// connection owns that session, without the Session Manager knowing
/// anything about websockets.
pub fn error_sink(registry: OutboundRegistry) -> ErrorSink {
    Arc::new(move |session: &SessionId, code: &str, detail: String| {
        let registry = registry.clone();
        let session = session.clone();
        let code = code.to_owned();
        tokio::spawn(async move {
            let senders = registry.lock().await;
            if let Some(tx) = senders.get(&session) {
                let envelope = server_error_envelope(&code, detail);
                let _ = tx.send(envelope);
            }
        });
    })
}

fn code_message(code: &str) -> &'static str {
    match code {
        "start_indexer_0001" => "Failed to deserialize data",
        "start_indexer_0002" => "Failed to create dbwriter",
        "start_indexing_0001" => "Failed to deserialize data",
        "start_indexing_0002" => "Failed to create indexer",
        _ => "Unknown error",
    }
}

fn server_error_envelope(code: &str, detail: String) -> String {
    let payload = ServerError {
        error: code.to_owned(),
        message: code_message(code).to_owned(),
        detail,
    };
    let envelope = Envelope {
        event: "server_error".to_owned(),
        data: serde_json::to_value(payload).expect("ServerError serializes"),
    };
    serde_json::to_string(&envelope).expect("Envelope serializes")
}

fn server_success_envelope(event_name: &str) -> String {
    let payload = ServerSuccess {
        event: event_name.to_owned(),
    };
    let envelope = Envelope {
        event: "server_success".to_owned(),
        data: serde_json::to_value(payload).expect("ServerSuccess serializes"),
    };
    serde_json::to_string(&envelope).expect("Envelope serializes")
}

/// Binds a websocket listener and serves connections until `shutdown` fires,
/// grounded on the reference codebase's `APIServer::serve` shape: bind
/// address plus graceful shutdown via a oneshot channel, adapted here from an
/// HTTP upgrade handshake to a per-connection bidirectional JSON stream.
pub async fn serve<S: Store + 'static>(
    addr: SocketAddr,
    session_manager: Arc<SessionManager<S>>,
    registry: OutboundRegistry,
    mut shutdown: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "control plane listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let session_manager = session_manager.clone();
                let registry = registry.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, session_manager, registry).await {
                        tracing::warn!(%peer, error = %e, "control plane connection ended with error");
                    }
                });
            }
            _ = &mut shutdown => {
                tracing::info!("control plane shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_connection<S: Store + 'static>(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    session_manager: Arc<SessionManager<S>>,
    registry: OutboundRegistry,
) -> anyhow::Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut outgoing, mut incoming) = ws_stream.split();

    let session_id = SessionId(format!("{:016x}", rand::random::<u64>()));
    tracing::info!(%peer, session = %session_id.0, "connect");

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    registry.lock().await.insert(session_id.clone(), tx);

    let forward = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if outgoing.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = incoming.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(_) => break,
        };
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        handle_message(&session_id, &text, &session_manager, &registry).await;
    }

    tracing::info!(session = %session_id.0, "disconnect");
    registry.lock().await.remove(&session_id);
    session_manager.stop_session(&session_id).await;
    forward.abort();
    Ok(())
}

async fn handle_message<S: Store + 'static>(
    session_id: &SessionId,
    text: &str,
    session_manager: &Arc<SessionManager<S>>,
    registry: &OutboundRegistry,
) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(_) => {
            reply(registry, session_id, server_error_envelope(
                ControlPlaneErrorCode::StartIndexerDeserialize.code(),
                "malformed envelope".into(),
            )).await;
            return;
        }
    };

    match envelope.event.as_str() {
        "start_indexer" => handle_start_indexer(session_id, envelope.data, session_manager, registry).await,
        "start_indexing" => handle_start_indexing(session_id, envelope.data, session_manager, registry).await,
        other => {
            tracing::debug!(event = other, "ignoring unrecognized control-plane event");
        }
    }
}

async fn handle_start_indexer<S: Store + 'static>(
    session_id: &SessionId,
    data: serde_json::Value,
    session_manager: &Arc<SessionManager<S>>,
    registry: &OutboundRegistry,
) {
    let parsed: StartIndexerData = match serde_json::from_value(data) {
        Ok(p) => p,
        Err(e) => {
            reply(registry, session_id, server_error_envelope(
                ControlPlaneErrorCode::StartIndexerDeserialize.code(),
                e.to_string(),
            )).await;
            return;
        }
    };

    let chain = match Chain::from_id(parsed.chain_id) {
        Some(c) => c,
        None => {
            reply(registry, session_id, server_error_envelope(
                ControlPlaneErrorCode::StartIndexerDeserialize.code(),
                format!("unknown chain id {}", parsed.chain_id),
            )).await;
            return;
        }
    };

    match session_manager
        .create_writer(session_id.clone(), chain, &parsed.url)
        .await
    {
        Ok(()) => {
            reply(registry, session_id, server_success_envelope("start_indexer")).await;
        }
        Err(e) => {
            let code = if e.is_decode_error() {
                ControlPlaneErrorCode::StartIndexerDeserialize
            } else {
                ControlPlaneErrorCode::StartIndexerWriterFailed
            };
            reply(registry, session_id, server_error_envelope(code.code(), e.to_string())).await;
        }
    }
}

async fn handle_start_indexing<S: Store + 'static>(
    session_id: &SessionId,
    data: serde_json::Value,
    session_manager: &Arc<SessionManager<S>>,
    registry: &OutboundRegistry,
) {
    let parsed: StartIndexingData = match serde_json::from_value(data) {
        Ok(p) => p,
        Err(e) => {
            reply(registry, session_id, server_error_envelope(
                ControlPlaneErrorCode::StartIndexingDeserialize.code(),
                e.to_string(),
            )).await;
            return;
        }
    };

    let chain = match Chain::from_id(parsed.chain_id) {
        Some(c) => c,
        None => {
            reply(registry, session_id, server_error_envelope(
                ControlPlaneErrorCode::StartIndexingDeserialize.code(),
                format!("unknown chain id {}", parsed.chain_id),
            )).await;
            return;
        }
    };

    match session_manager
        .create_indexer(
            session_id.clone(),
            chain,
            parsed.block_number_start_at,
            &parsed.address,
        )
        .await
    {
        Ok(()) => {
            reply(registry, session_id, server_success_envelope("start_indexing")).await;
        }
        Err(e) => {
            let code = if e.is_decode_error() {
                ControlPlaneErrorCode::StartIndexingDeserialize
            } else {
                ControlPlaneErrorCode::StartIndexingIndexerFailed
            };
            reply(registry, session_id, server_error_envelope(code.code(), e.to_string())).await;
        }
    }
}

async fn reply(registry: &OutboundRegistry, session_id: &SessionId, envelope: String) {
    if let Some(tx) = registry.lock().await.get(session_id) {
        let _ = tx.send(envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_indexer_envelope_round_trips() {
        let text = r#"{"event":"start_indexer","data":{"chain_id":1,"url":"wss://node"}}"#;
        let envelope: Envelope = serde_json::from_str(text).unwrap();
        assert_eq!(envelope.event, "start_indexer");
        let data: StartIndexerData = serde_json::from_value(envelope.data).unwrap();
        assert_eq!(data.chain_id, 1);
        assert_eq!(data.url, "wss://node");
    }

    #[test]
    fn envelope_without_data_defaults_to_null() {
        let text = r#"{"event":"ping"}"#;
        let envelope: Envelope = serde_json::from_str(text).unwrap();
        assert!(envelope.data.is_null());
    }

    #[test]
    fn server_error_envelope_carries_code_message_and_detail() {
        let rendered = server_error_envelope("start_indexer_0002", "writer died".into());
        let envelope: Envelope = serde_json::from_str(&rendered).unwrap();
        assert_eq!(envelope.event, "server_error");
        let payload: ServerError = serde_json::from_value(envelope.data).unwrap();
        assert_eq!(payload.error, "start_indexer_0002");
        assert_eq!(payload.message, "Failed to create dbwriter");
        assert_eq!(payload.detail, "writer died");
    }

    #[test]
    fn server_success_envelope_names_the_triggering_event() {
        let rendered = server_success_envelope("start_indexing");
        let envelope: Envelope = serde_json::from_str(&rendered).unwrap();
        assert_eq!(envelope.event, "server_success");
        let payload: ServerSuccess = serde_json::from_value(envelope.data).unwrap();
        assert_eq!(payload.event, "start_indexing");
    }

    #[test]
    fn unknown_error_code_falls_back_to_generic_message() {
        assert_eq!(code_message("not_a_real_code"), "Unknown error");
    }
}
