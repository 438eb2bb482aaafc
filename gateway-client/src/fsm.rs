//! Gateway connection core (component I): `disconnected -> connecting ->
//! hello-received -> identifying|resuming -> ready -> {heartbeating} ->
//! (disconnected|reconnecting)`. Included because this state machine, not the
//! storage RPCs, is the most reusable piece of systems engineering the fabric
//! carries -- grounded on the same background-task-plus-command-channel shape as
//! `fabric-client::adapter`, generalized to the gateway's opcode table, heartbeat
//! loop, and resumable sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use slog::Logger;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;

use fabric_common::error::{FabricError, FabricResult};
use fabric_common::logging::{debug, error, info, o, warn};

use crate::backoff::{self, MAX_ATTEMPTS};
use crate::config::GatewayConfig;
use crate::events::GatewayEvent;
use crate::opcode::{self, GatewayFrame};
use crate::ratelimit::RateLimitTracker;
use crate::session::{GatewaySession, SessionStore};

const CLOSE_CODE_RECONNECT: u16 = 4000;
const INVALID_SESSION_RETRY_DELAY: Duration = Duration::from_millis(150);
const EVENT_CHANNEL_CAPACITY: usize = 256;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Command {
    Send(GatewayFrame),
    Close,
}

pub struct GatewayConnection {
    log: Logger,
    command_tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<GatewayEvent>,
    rate_limits: Arc<RateLimitTracker>,
    closing: Arc<AtomicBool>,
}

impl GatewayConnection {
    /// Spawns the session loop and returns immediately -- unlike the storage
    /// adapter's `connect`, the gateway handshake is driven entirely by server
    /// pushes (`hello` arrives on the server's schedule), so there is no first
    /// frame to block on here.
    pub fn open(config: GatewayConfig, session_store: Arc<dyn SessionStore>, log: Logger) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let closing = Arc::new(AtomicBool::new(false));
        let rate_limits = Arc::new(RateLimitTracker::new());

        let task_log = log.new(o!("component" => "gateway_connection"));
        let task_events = events.clone();
        let task_closing = closing.clone();
        let task_rate_limits = rate_limits.clone();

        tokio::spawn(run_session_loop(config, session_store, task_log, command_rx, task_events, task_closing, task_rate_limits));

        Self { log, command_tx, events, rate_limits, closing }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Sends a custom dispatch-shaped frame, waiting out any recorded rate limit
    /// for `opcode` first.
    pub async fn send(&self, opcode: u8, payload: Value) -> FabricResult<()> {
        self.rate_limits.wait_for_availability(opcode).await;
        self.command_tx
            .send(Command::Send(GatewayFrame::new(opcode, payload)))
            .map_err(|_| FabricError::Transport("gateway connection is closed".into()))
    }

    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.command_tx.send(Command::Close);
        debug!(self.log, "gateway connection closing");
    }
}

async fn run_session_loop(
    config: GatewayConfig,
    session_store: Arc<dyn SessionStore>,
    log: Logger,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<GatewayEvent>,
    closing: Arc<AtomicBool>,
    rate_limits: Arc<RateLimitTracker>,
) {
    let mut dial_url = config.url.clone();
    let mut attempt = 0u32;

    if let Some(existing) = session_store.load().await {
        if existing.token == config.token && !existing.resume_gateway_url.is_empty() {
            dial_url = existing.resume_gateway_url.clone();
        }
    }

    loop {
        let outcome = run_one_connection(&config, &dial_url, &session_store, &log, &mut command_rx, &events, &rate_limits).await;

        let _ = events.send(GatewayEvent::Disconnected);

        match outcome {
            ConnectionOutcome::Closed => return,
            ConnectionOutcome::Terminal => {
                error!(log, "gateway connection terminated, will not reconnect");
                return;
            }
            ConnectionOutcome::Reconnect { next_url } => {
                dial_url = next_url.unwrap_or(dial_url);
            }
        }

        if closing.load(Ordering::SeqCst) {
            return;
        }

        attempt += 1;
        if attempt > MAX_ATTEMPTS {
            error!(log, "giving up after exhausting reconnect attempts"; "attempts" => attempt);
            return;
        }

        let delay = backoff::delay_for_attempt(attempt);
        warn!(log, "reconnecting"; "attempt" => attempt, "delay_ms" => delay.as_millis() as u64);
        tokio::time::sleep(delay).await;
    }
}

enum ConnectionOutcome {
    Closed,
    Terminal,
    Reconnect { next_url: Option<String> },
}

async fn run_one_connection(
    config: &GatewayConfig,
    url: &str,
    session_store: &Arc<dyn SessionStore>,
    log: &Logger,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
    events: &broadcast::Sender<GatewayEvent>,
    rate_limits: &Arc<RateLimitTracker>,
) -> ConnectionOutcome {
    let ws_stream = match tokio_tungstenite::connect_async(url).await {
        Ok((stream, _response)) => stream,
        Err(err) => {
            warn!(log, "failed to dial gateway"; "url" => url, "error" => %err);
            return ConnectionOutcome::Reconnect { next_url: None };
        }
    };

    let (mut sink, mut stream) = ws_stream.split();

    let mut heartbeat_interval: Option<Duration> = None;
    let mut ack_window: Duration = Duration::from_millis(config.heartbeat_ack_fallback_ms.max(1));
    let mut last_sequence: Option<u64> = None;
    let mut session_id: Option<String> = None;
    let mut heartbeat_due = Box::pin(tokio::time::sleep(Duration::from_secs(3600)));
    let mut ack_deadline: Option<std::pin::Pin<Box<tokio::time::Sleep>>> = None;

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                match command {
                    Some(Command::Send(frame)) => {
                        if send_frame(&mut sink, &frame).await.is_err() {
                            return ConnectionOutcome::Reconnect { next_url: None };
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return ConnectionOutcome::Closed;
                    }
                }
            }

            _ = &mut heartbeat_due, if heartbeat_interval.is_some() => {
                let frame = GatewayFrame::heartbeat(last_sequence);
                if send_frame(&mut sink, &frame).await.is_err() {
                    return ConnectionOutcome::Reconnect { next_url: None };
                }
                let interval = heartbeat_interval.expect("guarded by the branch condition");
                heartbeat_due.as_mut().reset(tokio::time::Instant::now() + interval);
                ack_deadline = Some(Box::pin(tokio::time::sleep(ack_window)));
            }

            _ = wait_optional_sleep(&mut ack_deadline) => {
                warn!(log, "heartbeat ack timed out");
                let _ = events.send(GatewayEvent::Error("heartbeat ack timed out".to_string()));
                return ConnectionOutcome::Reconnect { next_url: None };
            }

            frame = stream.next() => {
                let frame = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(close_frame))) => {
                        return outcome_for_close(close_frame.map(|f| f.code.into()));
                    }
                    Some(Ok(_)) => continue,
                    None => return ConnectionOutcome::Reconnect { next_url: None },
                    Some(Err(err)) => {
                        warn!(log, "websocket read error"; "error" => %err);
                        return ConnectionOutcome::Reconnect { next_url: None };
                    }
                };

                let parsed: GatewayFrame = match serde_json::from_str(&frame) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        warn!(log, "malformed gateway frame"; "error" => %err);
                        continue;
                    }
                };

                if let Some(seq) = parsed.s {
                    last_sequence = Some(seq);
                }

                match parsed.op {
                    opcode::HELLO => {
                        let interval_ms = parsed.d.get("heartbeat_interval").and_then(Value::as_u64).unwrap_or(45_000);
                        heartbeat_interval = Some(Duration::from_millis(interval_ms));
                        ack_window = match parsed.d.get("timeout_ms").and_then(Value::as_u64) {
                            Some(timeout_ms) => Duration::from_millis(timeout_ms),
                            None => Duration::from_millis(interval_ms),
                        };
                        heartbeat_due.as_mut().reset(tokio::time::Instant::now());
                        info!(log, "received hello"; "heartbeat_interval_ms" => interval_ms);

                        match session_store.load().await {
                            Some(existing) if existing.token == config.token => {
                                session_id = Some(existing.session_id.clone());
                                last_sequence = Some(existing.sequence);
                                let resume = GatewayFrame::resume(&config.token, &existing.session_id, existing.sequence);
                                if send_frame(&mut sink, &resume).await.is_err() {
                                    return ConnectionOutcome::Reconnect { next_url: None };
                                }
                            }
                            _ => {
                                let identify = GatewayFrame::identify(&config.token, config.identify_payload.clone());
                                if send_frame(&mut sink, &identify).await.is_err() {
                                    return ConnectionOutcome::Reconnect { next_url: None };
                                }
                            }
                        }
                    }

                    opcode::HEARTBEAT => {
                        let frame = GatewayFrame::heartbeat(last_sequence);
                        if send_frame(&mut sink, &frame).await.is_err() {
                            return ConnectionOutcome::Reconnect { next_url: None };
                        }
                    }

                    opcode::HEARTBEAT_ACK => {
                        ack_deadline = None;
                        debug!(log, "heartbeat acked");
                    }

                    opcode::RECONNECT => {
                        info!(log, "server requested a reconnect");
                        return ConnectionOutcome::Reconnect { next_url: None };
                    }

                    opcode::INVALID_SESSION => {
                        let can_resume = parsed.d.as_bool().unwrap_or(false);
                        tokio::time::sleep(INVALID_SESSION_RETRY_DELAY).await;
                        if can_resume {
                            if let Some(ref sid) = session_id {
                                let resume = GatewayFrame::resume(&config.token, sid, last_sequence.unwrap_or(0));
                                if send_frame(&mut sink, &resume).await.is_err() {
                                    return ConnectionOutcome::Reconnect { next_url: None };
                                }
                                continue;
                            }
                        }
                        session_store.clear().await;
                        session_id = None;
                        last_sequence = None;
                        let identify = GatewayFrame::identify(&config.token, config.identify_payload.clone());
                        if send_frame(&mut sink, &identify).await.is_err() {
                            return ConnectionOutcome::Reconnect { next_url: None };
                        }
                    }

                    opcode::DISPATCH => {
                        handle_dispatch(parsed, &config.token, session_store, &mut session_id, events, rate_limits, log).await;
                    }

                    other => {
                        debug!(log, "ignoring unrecognized opcode"; "op" => other);
                    }
                }
            }
        }
    }
}

async fn handle_dispatch(
    frame: GatewayFrame,
    token: &str,
    session_store: &Arc<dyn SessionStore>,
    session_id: &mut Option<String>,
    events: &broadcast::Sender<GatewayEvent>,
    rate_limits: &Arc<RateLimitTracker>,
    log: &Logger,
) {
    let Some(event_type) = frame.t.clone() else {
        warn!(log, "dispatch frame missing t");
        return;
    };

    let sequence = frame.s.unwrap_or(0);

    match event_type.as_str() {
        "READY" => {
            let new_session_id = frame.d.get("session_id").and_then(Value::as_str).map(str::to_string);
            let resume_gateway_url = frame.d.get("resume_gateway_url").and_then(Value::as_str).unwrap_or_default().to_string();
            let user_id = frame.d.get("user").and_then(|u| u.get("id")).and_then(Value::as_str).map(str::to_string);

            if let Some(ref new_session_id) = new_session_id {
                *session_id = Some(new_session_id.clone());
                session_store
                    .save(GatewaySession::new(token.to_string(), new_session_id.clone(), resume_gateway_url, sequence, user_id))
                    .await;
            }

            info!(log, "gateway ready"; "session_id" => session_id.clone().unwrap_or_default());
            let _ = events.send(GatewayEvent::Ready);
        }

        "RESUMED" => {
            if let Some(sid) = session_id.clone() {
                session_store.save(GatewaySession::new(token.to_string(), sid, String::new(), sequence, None)).await;
            }
            info!(log, "gateway resumed");
            let _ = events.send(GatewayEvent::Resumed);
        }

        "RATE_LIMITED" => {
            let limited_opcode = frame.d.get("opcode").and_then(Value::as_u64).map(|op| op as u8);
            let retry_after_ms = frame.d.get("retry_after").and_then(Value::as_u64).unwrap_or(0);
            if let Some(limited_opcode) = limited_opcode {
                rate_limits.record(limited_opcode, Duration::from_millis(retry_after_ms)).await;
            }
            warn!(log, "rate limited dispatch received"; "payload" => frame.d.to_string());
        }

        other => {
            if let Some(sid) = session_id.clone() {
                if let Some(mut existing) = session_store.load().await {
                    existing.sequence = sequence;
                    session_store.save(existing).await;
                } else {
                    session_store.save(GatewaySession::new(token.to_string(), sid, String::new(), sequence, None)).await;
                }
            }
            let _ = events.send(GatewayEvent::Dispatch { t: other.to_string(), d: frame.d });
        }
    }
}

/// Awaits a possibly-absent deadline: pends forever when `None`, so the `select!`
/// branch simply never wins until a heartbeat is actually in flight.
async fn wait_optional_sleep(deadline: &mut Option<std::pin::Pin<Box<tokio::time::Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

fn outcome_for_close(code: Option<u16>) -> ConnectionOutcome {
    match code {
        Some(CLOSE_CODE_RECONNECT) | None => ConnectionOutcome::Reconnect { next_url: None },
        Some(_) => ConnectionOutcome::Terminal,
    }
}

async fn send_frame(
    sink: &mut futures_util::stream::SplitSink<WsStream, Message>,
    frame: &GatewayFrame,
) -> Result<(), ()> {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(_) => return Err(()),
    };
    sink.send(Message::Text(text)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_4000_or_missing_means_reconnect() {
        assert!(matches!(outcome_for_close(Some(CLOSE_CODE_RECONNECT)), ConnectionOutcome::Reconnect { .. }));
        assert!(matches!(outcome_for_close(None), ConnectionOutcome::Reconnect { .. }));
    }

    #[test]
    fn any_other_close_code_is_terminal() {
        assert!(matches!(outcome_for_close(Some(4004)), ConnectionOutcome::Terminal));
    }

    #[tokio::test]
    async fn wait_optional_sleep_never_resolves_when_the_deadline_is_absent() {
        let mut deadline: Option<std::pin::Pin<Box<tokio::time::Sleep>>> = None;
        tokio::select! {
            _ = wait_optional_sleep(&mut deadline) => panic!("must not resolve with no deadline set"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_optional_sleep_resolves_once_the_inner_sleep_elapses() {
        let mut deadline = Some(Box::pin(tokio::time::sleep(Duration::from_millis(50))));
        wait_optional_sleep(&mut deadline).await;
    }
}
