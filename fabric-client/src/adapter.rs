//! Client storage adapter (component H): `Remote A over the encrypted transport`.
//! One background session-loop task owns the socket, the session key, and the
//! pending-request table; the handle returned by [`ClientAdapter::connect`] only ever
//! talks to it over channels, matching the fabric's one-logical-task-per-connection
//! scheduling model.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use slog::Logger;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;

use fabric_common::crypto;
use fabric_common::crypto::SessionKeyBytes;
use fabric_common::error::{FabricError, FabricResult};
use fabric_common::logging::{debug, error, info, warn};
use fabric_common::protocol::{ClientHello, ClientRequest, EncryptionFrame, ErrorFrame, EventFrame, ResponseFrame, ServerHello};

use crate::config::ClientConfig;
use crate::events::ClientEvent;
use crate::pending::PendingTable;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_CHANNEL_CAPACITY: usize = 256;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Command {
    Send(OutboundRequest),
    Close,
}

struct OutboundRequest {
    request: ClientRequest,
    respond_to: oneshot::Sender<crate::pending::PendingOutcome>,
}

pub struct ClientAdapter {
    log: Logger,
    command_tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ClientEvent>,
    closing: Arc<AtomicBool>,
    next_request_id: AtomicU64,
}

impl ClientAdapter {
    /// Opens the transport, completes the handshake once, and spawns the session
    /// loop that will keep reconnecting (with bounded attempts) for the adapter's
    /// lifetime. Fails immediately if the *first* connection attempt does not
    /// complete the handshake -- reconnects only apply after that.
    pub async fn connect(config: ClientConfig, log: Logger) -> FabricResult<Self> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let closing = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();

        let task_log = log.clone();
        let task_events = events.clone();
        let task_closing = closing.clone();
        tokio::spawn(run_session_loop(config, task_log, command_rx, task_events, task_closing, Some(ready_tx)));

        ready_rx
            .await
            .map_err(|_| FabricError::Transport("client adapter task ended before connecting".into()))??;

        Ok(Self { log, command_tx, events, closing, next_request_id: AtomicU64::new(1) })
    }

    /// Subscribes to `connected`/`disconnected`/`remote`/`error` notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn next_id(&self) -> String {
        format!("req_{}", self.next_request_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Reads one value. Resolves to `None` if `key` is absent.
    pub async fn get(&self, collection: impl Into<String>, key: impl Into<String>) -> FabricResult<Option<Value>> {
        let response = self
            .send(ClientRequest::Get { id: self.next_id(), collection: collection.into(), key: key.into() })
            .await?;
        Ok(response.get("value").filter(|v| !v.is_null()).cloned())
    }

    /// Checks whether `key` is present, without the caller needing to inspect the value.
    pub async fn has(&self, collection: impl Into<String>, key: impl Into<String>) -> FabricResult<bool> {
        Ok(self.get(collection, key).await?.is_some())
    }

    /// Writes `value`, rejected by the server if it fails that key's registered schema.
    pub async fn set(&self, collection: impl Into<String>, key: impl Into<String>, value: Value) -> FabricResult<()> {
        self.send(ClientRequest::Set { id: self.next_id(), collection: collection.into(), key: key.into(), value })
            .await?;
        Ok(())
    }

    /// Deletes `key`, returning whether it was present.
    pub async fn delete(&self, collection: impl Into<String>, key: impl Into<String>) -> FabricResult<bool> {
        let response =
            self.send(ClientRequest::Delete { id: self.next_id(), collection: collection.into(), key: key.into() }).await?;
        Ok(response.get("success").and_then(Value::as_bool).unwrap_or(false))
    }

    /// Clears a single collection, or every collection in this tenant's namespace when
    /// `collection` is `None`. Returns the number of keys removed.
    pub async fn clear(&self, collection: Option<String>) -> FabricResult<u64> {
        let response = self.send(ClientRequest::Clear { id: self.next_id(), collection }).await?;
        Ok(response.get("count").and_then(Value::as_u64).unwrap_or(0))
    }

    /// Counts keys in a single collection, or across the whole tenant namespace when
    /// `collection` is `None`.
    pub async fn size(&self, collection: Option<String>) -> FabricResult<u64> {
        let response = self.send(ClientRequest::Size { id: self.next_id(), collection }).await?;
        Ok(response.get("size").and_then(Value::as_u64).unwrap_or(0))
    }

    /// Lists every key in `collection`.
    pub async fn keys(&self, collection: impl Into<String>) -> FabricResult<Vec<String>> {
        let response = self.send(ClientRequest::Keys { id: self.next_id(), collection: collection.into() }).await?;
        Ok(response
            .get("keys")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default())
    }

    /// Encrypts and sends `request`, resolving once its matching response arrives or
    /// after 5 s, whichever comes first. A timeout rejects this call but does not
    /// cancel whatever the server may already be doing with the request.
    pub async fn send(&self, request: ClientRequest) -> FabricResult<Value> {
        let (respond_to, receiver) = oneshot::channel();
        self.command_tx
            .send(Command::Send(OutboundRequest { request, respond_to }))
            .map_err(|_| FabricError::Transport("client adapter is closed".into()))?;

        match tokio::time::timeout(REQUEST_TIMEOUT, receiver).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(FabricError::Validation(message)),
            Ok(Err(_)) => Err(FabricError::Transport("connection closed before a response arrived".into())),
            Err(_) => Err(FabricError::Timeout(format!("request timed out after {:?}", REQUEST_TIMEOUT))),
        }
    }

    /// Marks the adapter closing, tears down the transport, cancels any pending
    /// reconnect, and rejects every in-flight request.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.command_tx.send(Command::Close);
        debug!(self.log, "client adapter closing");
    }
}

enum LoopOutcome {
    Closed,
    Dropped,
}

async fn run_session_loop(
    config: ClientConfig,
    log: Logger,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<ClientEvent>,
    closing: Arc<AtomicBool>,
    mut ready_tx: Option<oneshot::Sender<FabricResult<()>>>,
) {
    let mut attempts = 0u32;

    loop {
        match connect_and_handshake(&config, &log).await {
            Ok((ws_stream, session_key)) => {
                attempts = 0;
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Ok(()));
                }
                let _ = events.send(ClientEvent::Connected);
                info!(log, "client adapter connected and authenticated");

                let mut pending = PendingTable::new();
                let outcome = run_connected(ws_stream, session_key, &mut command_rx, &events, &mut pending, &log).await;
                let _ = events.send(ClientEvent::Disconnected);

                // A user-initiated close drops every in-flight request immediately; a
                // dropped connection instead leaves them to their own 5s timeouts, since
                // the next reconnect attempt may still deliver a matching response.
                if matches!(outcome, LoopOutcome::Closed) {
                    pending.clear();
                    return;
                }
            }
            Err(err) => {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(err));
                    return;
                }
                warn!(log, "reconnect attempt failed"; "error" => %err);
            }
        }

        if closing.load(Ordering::SeqCst) {
            return;
        }

        attempts += 1;
        if attempts > config.max_reconnect_attempts {
            error!(log, "giving up after exhausting reconnect attempts"; "attempts" => attempts);
            return;
        }

        tokio::time::sleep(Duration::from_millis(config.reconnect_interval_ms)).await;
    }
}

/// Opens the transport and runs the two-frame handshake: `hello` -> record the
/// channel id (nothing further to do with it client-side), `encryption` -> unseal
/// the session key.
async fn connect_and_handshake(config: &ClientConfig, log: &Logger) -> FabricResult<(WsStream, SessionKeyBytes)> {
    let (mut ws_stream, _response) = tokio_tungstenite::connect_async(&config.url).await.map_err(ws_err)?;

    let hello = ClientHello::new(config.token.clone());
    ws_stream.send(Message::Text(serde_json::to_string(&hello)?)).await.map_err(ws_err)?;

    let server_hello: ServerHello = next_typed_frame(&mut ws_stream, "hello").await?;
    debug!(log, "received server hello"; "channel_id" => &server_hello.channel_id);

    let encryption: EncryptionFrame = next_typed_frame(&mut ws_stream, "encryption").await?;
    let token_secret = crypto::derive_token_secret(&config.token);
    let session_key = crypto::unseal_session_key(&token_secret, &encryption.encryption_key)?;

    Ok((ws_stream, session_key))
}

async fn next_typed_frame<T: serde::de::DeserializeOwned>(ws_stream: &mut WsStream, expected: &str) -> FabricResult<T> {
    match ws_stream.next().await {
        Some(Ok(Message::Text(text))) => Ok(serde_json::from_str(&text)?),
        Some(Ok(_)) => Err(FabricError::Validation(format!("expected a {expected} frame"))),
        Some(Err(err)) => Err(ws_err(err)),
        None => Err(FabricError::Transport(format!("connection closed before {expected}"))),
    }
}

/// Runs the authenticated request/response and broadcast loop until the socket
/// drops or a `Close` command arrives.
async fn run_connected(
    ws_stream: WsStream,
    session_key: SessionKeyBytes,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
    events: &broadcast::Sender<ClientEvent>,
    pending: &mut PendingTable,
    log: &Logger,
) -> LoopOutcome {
    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                match command {
                    Some(Command::Send(outbound)) => {
                        match encrypt_request(&session_key, &outbound.request) {
                            Ok(text) => {
                                pending.register(outbound.request.id().to_string(), outbound.respond_to);
                                if sink.send(Message::Text(text)).await.is_err() {
                                    return LoopOutcome::Dropped;
                                }
                            }
                            Err(err) => {
                                let _ = outbound.respond_to.send(Err(err.to_string()));
                            }
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return LoopOutcome::Closed;
                    }
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound_frame(&text, &session_key, events, pending, log);
                    }
                    Some(Ok(Message::Close(_))) | None => return LoopOutcome::Dropped,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(log, "websocket read error"; "error" => %err);
                        return LoopOutcome::Dropped;
                    }
                }
            }
        }
    }
}

fn encrypt_request(session_key: &SessionKeyBytes, request: &ClientRequest) -> FabricResult<String> {
    let serialized = serde_json::to_vec(request)?;
    crypto::encrypt_frame(session_key, &serialized)
}

/// Decrypts one inbound frame and matches it, in order, against server-hello,
/// encryption, event, error, then falls back to response -- the only shape left.
fn handle_inbound_frame(
    frame: &str,
    session_key: &SessionKeyBytes,
    events: &broadcast::Sender<ClientEvent>,
    pending: &mut PendingTable,
    log: &Logger,
) {
    let plaintext = match crypto::decrypt_frame(session_key, frame) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(log, "failed to decrypt inbound frame"; "error" => %err);
            return;
        }
    };

    let value: Value = match serde_json::from_slice(&plaintext) {
        Ok(value) => value,
        Err(err) => {
            warn!(log, "failed to parse inbound frame"; "error" => %err);
            return;
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("hello") | Some("encryption") => {
            debug!(log, "ignoring a post-handshake hello/encryption frame");
        }
        Some("event") => match serde_json::from_value::<EventFrame>(value) {
            Ok(event) => {
                let _ = events.send(ClientEvent::Remote {
                    collection: event.collection,
                    event: event.event,
                    key: event.key,
                    value: event.value,
                });
            }
            Err(err) => warn!(log, "malformed event frame"; "error" => %err),
        },
        Some("error") => match serde_json::from_value::<ErrorFrame>(value) {
            Ok(error) => {
                let _ = events.send(ClientEvent::Error(error.error));
            }
            Err(err) => warn!(log, "malformed error frame"; "error" => %err),
        },
        _ => match serde_json::from_value::<ResponseFrame>(value) {
            Ok(response) => {
                let outcome = match response.error {
                    Some(message) => Err(message),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                pending.resolve(&response.id, outcome);
            }
            Err(err) => warn!(log, "unrecognized frame shape"; "error" => %err),
        },
    }
}

fn ws_err(err: tokio_tungstenite::tungstenite::Error) -> FabricError {
    FabricError::Transport(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encrypted(key: &SessionKeyBytes, value: Value) -> String {
        crypto::encrypt_frame(key, &serde_json::to_vec(&value).unwrap()).unwrap()
    }

    #[test]
    fn event_frames_are_surfaced_as_remote_events() {
        let key = crypto::generate_session_key();
        let (events, mut rx) = broadcast::channel(8);
        let mut pending = PendingTable::new();
        let log = fabric_common::logging::init("test");

        let frame = encrypted(&key, json!({"type": "event", "collection": "widgets", "event": "set", "key": "w1", "value": {"color": "red"}}));
        handle_inbound_frame(&frame, &key, &events, &mut pending, &log);

        match rx.try_recv().unwrap() {
            ClientEvent::Remote { collection, key, .. } => {
                assert_eq!(collection, "widgets");
                assert_eq!(key, Some("w1".to_string()));
            }
            other => panic!("expected a Remote event, got {other:?}"),
        }
    }

    #[test]
    fn error_frames_are_surfaced_as_error_events() {
        let key = crypto::generate_session_key();
        let (events, mut rx) = broadcast::channel(8);
        let mut pending = PendingTable::new();
        let log = fabric_common::logging::init("test");

        let frame = encrypted(&key, json!({"type": "error", "error": "bad request"}));
        handle_inbound_frame(&frame, &key, &events, &mut pending, &log);

        match rx.try_recv().unwrap() {
            ClientEvent::Error(message) => assert_eq!(message, "bad request"),
            other => panic!("expected an Error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn untagged_frames_resolve_the_matching_pending_request() {
        let key = crypto::generate_session_key();
        let (events, _rx) = broadcast::channel(8);
        let mut pending = PendingTable::new();
        let log = fabric_common::logging::init("test");

        let (respond_to, receiver) = oneshot::channel();
        pending.register("req_1".to_string(), respond_to);

        let frame = encrypted(&key, json!({"id": "req_1", "result": {"size": 3}}));
        handle_inbound_frame(&frame, &key, &events, &mut pending, &log);

        assert_eq!(receiver.await.unwrap(), Ok(json!({"size": 3})));
    }

    #[test]
    fn hello_and_encryption_frames_are_ignored_post_handshake() {
        let key = crypto::generate_session_key();
        let (events, mut rx) = broadcast::channel(8);
        let mut pending = PendingTable::new();
        let log = fabric_common::logging::init("test");

        let frame = encrypted(&key, json!({"type": "hello", "channel_id": "channel_abc"}));
        handle_inbound_frame(&frame, &key, &events, &mut pending, &log);

        assert!(rx.try_recv().is_err(), "a post-handshake hello must not surface as a client event");
    }
}
