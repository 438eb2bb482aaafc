//! Per-connection state machine (component F): accept -> hello -> key-exchange ->
//! authenticated request loop -> close. One task per connection, plus a dedicated
//! writer task so a slow peer's socket can never block the broker's fan-out into this
//! connection (§5's backpressure note, carried down from the channel broker).

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use fabric_common::crypto;
use fabric_common::crypto::SessionKeyBytes;
use fabric_common::error::FabricError;
use fabric_common::logging::{debug, info, o, warn};
use fabric_common::protocol::{ClientHello, EncryptionFrame, ErrorFrame, EventFrame, ResponseFrame, ServerHello};
use slog::Logger;

use crate::bucket::BucketManager;
use crate::channel::{ChannelBroker, ConnectionId};
use crate::config::ServerConfig;
use crate::dispatcher::dispatch;

const WS_PATH: &str = "/ws";
const STATIC_HTTP_BODY: &str = "WebSocket Storage Server";

/// Upgrades `stream` to a WebSocket only on the `/ws` path; every other path gets a
/// static 200 response and the TCP connection is closed without ever reaching the
/// handshake below. Handles one accepted connection end to end.
pub async fn accept_and_run(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ServerConfig>,
    bucket_manager: Arc<BucketManager>,
    broker: Arc<ChannelBroker>,
    connection_id: ConnectionId,
    log: Logger,
) {
    let log = log.new(o!("connection_id" => connection_id, "peer" => peer_addr.to_string()));

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if request.uri().path() == WS_PATH {
            Ok(response)
        } else {
            let rejection = Response::builder()
                .status(StatusCode::OK)
                .body(Some(STATIC_HTTP_BODY.to_string()))
                .expect("static response is well-formed");
            Err(rejection)
        }
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(stream) => stream,
        Err(err) => {
            debug!(log, "connection did not upgrade to websocket"; "reason" => %err);
            return;
        }
    };

    info!(log, "websocket connection accepted");

    match handshake(ws_stream, &config).await {
        Ok((session_key, channel_id, token, ws_stream)) => {
            run_authenticated(ws_stream, session_key, channel_id, token, bucket_manager, broker, connection_id, log).await;
        }
        Err(err) => {
            warn!(log, "handshake failed"; "error" => %err);
        }
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// ACCEPTED -> KEY_EXCHANGED: read the client's hello, validate the token, mint and
/// seal a fresh session key, and send both handshake response frames.
async fn handshake(
    mut ws_stream: WsStream,
    config: &ServerConfig,
) -> Result<(SessionKeyBytes, String, String, WsStream), FabricError> {
    let hello_text = match ws_stream.next().await {
        Some(Ok(Message::Text(text))) => text,
        Some(Ok(_)) => return Err(FabricError::Validation("expected a text hello frame".into())),
        Some(Err(err)) => return Err(FabricError::Transport(err.to_string())),
        None => return Err(FabricError::Transport("connection closed before hello".into())),
    };

    let hello: ClientHello = serde_json::from_str(&hello_text)?;

    if !(config.validate_token)(&hello.token) {
        let error = ErrorFrame::new("invalid token");
        let _ = ws_stream.send(Message::Text(serde_json::to_string(&error)?)).await;
        return Err(FabricError::Auth("token rejected by validate_token".into()));
    }

    let channel_id = crypto::channel_id_for_token(&hello.token);
    let token_secret = crypto::derive_token_secret(&hello.token);
    let session_key = crypto::generate_session_key();
    let connection_iv = crypto::generate_connection_iv();
    let sealed_key = crypto::seal_session_key(&token_secret, &session_key)?;

    ws_stream.send(Message::Text(serde_json::to_string(&ServerHello::new(channel_id.clone()))?)).await.map_err(ws_err)?;
    ws_stream
        .send(Message::Text(serde_json::to_string(&EncryptionFrame::new(
            sealed_key,
            base64_encode(&connection_iv),
        ))?))
        .await
        .map_err(ws_err)?;

    Ok((session_key, channel_id, hello.token, ws_stream))
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    STANDARD.encode(bytes)
}

fn ws_err(err: tokio_tungstenite::tungstenite::Error) -> FabricError {
    FabricError::Transport(err.to_string())
}

/// KEY_EXCHANGED -> AUTHENTICATED: resolve the tenant's storage adapter, join the
/// broadcast channel, then run the request loop until the socket closes.
async fn run_authenticated(
    ws_stream: WsStream,
    session_key: SessionKeyBytes,
    channel_id: String,
    token: String,
    bucket_manager: Arc<BucketManager>,
    broker: Arc<ChannelBroker>,
    connection_id: ConnectionId,
    log: Logger,
) {
    let adapter = match bucket_manager.ensure_user_bucket(&token).await {
        Ok(adapter) => adapter,
        Err(err) => {
            warn!(log, "failed to resolve tenant bucket"; "error" => %err);
            return;
        }
    };

    let (sink, mut stream) = ws_stream.split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Message>();
    let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel::<EventFrame>();

    broker.join(&channel_id, connection_id, broadcast_tx).await;
    info!(log, "connection authenticated"; "channel_id" => &channel_id);

    let writer_log = log.clone();
    let writer = tokio::spawn(run_writer(sink, outbound_rx, broadcast_rx, session_key, writer_log));

    loop {
        let frame = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                debug!(log, "websocket read error"; "error" => %err);
                break;
            }
        };

        match handle_request_frame(&frame, &session_key, &*adapter, &bucket_manager, &broker, &channel_id, connection_id).await {
            Ok(response_text) => {
                if outbound_tx.send(Message::Text(response_text)).is_err() {
                    break;
                }
            }
            // A frame that fails to parse into a known request shape gets a single
            // error frame on the ad-hoc error channel (no id to correlate it to).
            // A crypto failure gets no reply at all -- it is dropped silently.
            Err(err @ FabricError::Serialization(_)) => {
                debug!(log, "rejecting an unparseable request frame"; "error" => %err);
                match encrypt_error_frame(&session_key, &err.to_string()) {
                    Ok(text) => {
                        if outbound_tx.send(Message::Text(text)).is_err() {
                            break;
                        }
                    }
                    Err(enc_err) => warn!(log, "failed to encrypt error frame"; "error" => %enc_err),
                }
            }
            Err(err) => {
                debug!(log, "dropping unprocessable frame"; "error" => %err);
            }
        }
    }

    broker.leave(&channel_id, connection_id).await;
    drop(outbound_tx);
    let _ = writer.await;
    info!(log, "connection closed");
}

/// Decrypts and dispatches one inbound request frame, returning the encrypted
/// response text. Any successful mutation's broadcast event is fanned out to the
/// channel before this returns.
async fn handle_request_frame(
    frame: &str,
    session_key: &SessionKeyBytes,
    adapter: &dyn crate::storage::StorageAdapter,
    bucket_manager: &BucketManager,
    broker: &ChannelBroker,
    channel_id: &str,
    connection_id: ConnectionId,
) -> Result<String, FabricError> {
    let plaintext = crypto::decrypt_frame(session_key, frame)?;
    let request = serde_json::from_slice(&plaintext)?;

    let outcome = dispatch(request, adapter, bucket_manager).await;

    if let Some(event) = outcome.broadcast {
        broker.broadcast(channel_id, event, Some(connection_id)).await;
    }

    encrypt_response(session_key, &outcome.response)
}

fn encrypt_response(session_key: &SessionKeyBytes, response: &ResponseFrame) -> Result<String, FabricError> {
    let serialized = serde_json::to_vec(response)?;
    crypto::encrypt_frame(session_key, &serialized)
}

/// Encrypts an ad-hoc `{type: "error", error}` frame with no request id to correlate
/// it to, for inbound frames that never made it far enough to be a known request.
fn encrypt_error_frame(session_key: &SessionKeyBytes, message: &str) -> Result<String, FabricError> {
    let serialized = serde_json::to_vec(&ErrorFrame::new(message))?;
    crypto::encrypt_frame(session_key, &serialized)
}

/// Owns the socket's write half. Merges this connection's own encrypted responses
/// with plaintext events fanned out by the channel broker -- broadcast events are
/// encrypted here, at the last hop, because every connection holds a different
/// session key.
async fn run_writer(
    mut sink: futures_util::stream::SplitSink<WsStream, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    mut broadcast_rx: mpsc::UnboundedReceiver<EventFrame>,
    session_key: SessionKeyBytes,
    log: Logger,
) {
    loop {
        tokio::select! {
            message = outbound_rx.recv() => {
                match message {
                    Some(message) => {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            event = broadcast_rx.recv() => {
                match event {
                    Some(event) => {
                        let encrypted = match serde_json::to_vec(&event).map_err(FabricError::from).and_then(|bytes| crypto::encrypt_frame(&session_key, &bytes)) {
                            Ok(encrypted) => encrypted,
                            Err(err) => {
                                warn!(log, "failed to encrypt broadcast event"; "error" => %err);
                                continue;
                            }
                        };
                        if sink.send(Message::Text(encrypted)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
}
