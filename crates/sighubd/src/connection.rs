use crate::config::AuthMethod;
use crate::error::HubError;
use crate::handshake::{self, HandshakeError, PendingChallenge};
use crate::metrics::{counters, gauges, histograms};
use crate::ratelimit::RateLimiter;
use crate::registry::ClientHandle;
use crate::rooms::ConnId;
use crate::router::{self, RouteOutcome};
use crate::server::ServerState;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::rngs::OsRng;
use rand::Rng;
use serde_json::Value;
use sighub_common::eth;
use sighub_common::protocol::{self, AuthResponse, ServerFrame};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Upper bound on a single WebSocket message.
const MAX_FRAME_BYTES: usize = 256 * 1024;
/// Outbound queue depth per connection; overflow drops frames.
const DELIVER_QUEUE: usize = 256;

/// Identity decided by the admission prescreen.
#[derive(Debug, Clone)]
enum Identity {
    /// Wallet handshake required before anything else.
    Pending,
    /// Admitted with a resolved user id (anonymous or token-derived).
    Ready { user_id: String },
}

/// Admission result smuggled out of the upgrade callback.
#[derive(Debug, Clone)]
struct Admission {
    ip: IpAddr,
    identity: Identity,
}

struct IpGuard {
    state: Arc<ServerState>,
    ip: IpAddr,
}

impl Drop for IpGuard {
    fn drop(&mut self) {
        self.state.registry.decrement_ip(self.ip);
    }
}

pub async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), HubError> {
    // Screen the raw request before committing to a WebSocket upgrade:
    // plain HTTP gets the signaling-only document, upgrades aimed at a
    // foreign path are dropped without a response.
    {
        let mut peek_buf = [0u8; 4096];
        let mut n = 0;
        // The header block may land in several segments; peek until the
        // terminator shows up (bounded).
        for _ in 0..8 {
            match stream.peek(&mut peek_buf).await {
                Ok(read) => n = read,
                Err(_) => break,
            }
            if n == peek_buf.len() || peek_buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if let Ok(preview) = std::str::from_utf8(&peek_buf[..n]) {
            let is_http = preview.starts_with("GET ")
                || preview.starts_with("HEAD ")
                || preview.starts_with("POST ");
            if is_http {
                if !preview.to_ascii_lowercase().contains("upgrade: websocket") {
                    respond_signaling_only(&mut stream, &state).await;
                    return Ok(());
                }
                if request_path(preview) != Some(state.config.server.ws_path.as_str()) {
                    debug!("dropping upgrade for foreign path");
                    return Ok(());
                }
            }
        }
    }

    let ws_config = WebSocketConfig {
        max_message_size: Some(MAX_FRAME_BYTES),
        max_frame_size: Some(MAX_FRAME_BYTES),
        ..WebSocketConfig::default()
    };

    // The admission pipeline runs inside the upgrade callback so that
    // rejections surface as HTTP statuses, which are part of the wire
    // contract.
    let admission_cell: Arc<OnceLock<Admission>> = Arc::new(OnceLock::new());
    let cell = admission_cell.clone();
    let callback_state = state.clone();
    let accept = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request, resp: Response| match admit(&callback_state, peer_addr, req) {
            Ok(admission) => {
                let _ = cell.set(admission);
                Ok(resp)
            }
            Err(rejection) => Err(rejection),
        },
        Some(ws_config),
    )
    .await;

    let ws_stream = match accept {
        Ok(ws) => ws,
        Err(e) => {
            // The callback may have taken a per-IP slot before the upgrade
            // failed on the transport; roll it back.
            if let Some(admission) = admission_cell.get() {
                state.registry.decrement_ip(admission.ip);
            }
            counters::admissions_total("rejected");
            return Err(HubError::WebSocket(e));
        }
    };

    let Some(admission) = admission_cell.get().cloned() else {
        return Err(HubError::ConnectionClosed);
    };
    let _ip_guard = IpGuard {
        state: state.clone(),
        ip: admission.ip,
    };

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let now_ms = eth::unix_now_ms()?;

    let (client_id, user_id, authenticated) = match &admission.identity {
        Identity::Pending => (format!("pending_{now_ms}"), None, false),
        Identity::Ready { user_id } => {
            (format!("{user_id}_{now_ms}"), Some(user_id.clone()), true)
        }
    };

    let conn_id = state.registry.allocate_id();
    let (deliver_tx, mut deliver_rx) = mpsc::channel::<Message>(DELIVER_QUEUE);
    state.registry.insert(
        conn_id,
        ClientHandle {
            tx: deliver_tx,
            client_id: client_id.clone(),
            user_id,
            wallet_address: None,
            authenticated,
            room_id: None,
            remote_addr: admission.ip.to_string(),
            connected_at_ms: now_ms,
            message_count: 0,
            last_message_at_ms: None,
        },
    );
    gauges::inc_connections_active();
    counters::admissions_total("admitted");
    if state.config.logging.log_connections {
        info!(client_id = %client_id, ip = %admission.ip, "client connected");
    }

    let mut pending: Option<PendingChallenge> = None;
    if authenticated {
        auto_join_default(&state, conn_id);
    } else {
        let challenge = handshake::issue(&state.config.auth, now_ms);
        send_frame(&mut ws_tx, &handshake::challenge_frame(&challenge)).await?;
        pending = Some(challenge);
    }

    let result = run_loop(
        &mut ws_tx,
        &mut ws_rx,
        &mut deliver_rx,
        &state,
        conn_id,
        pending,
    )
    .await;

    if let Some(removed) = state.registry.remove(conn_id) {
        if state.config.logging.log_connections {
            info!(
                client_id = %removed.client_id,
                messages = removed.message_count,
                "client disconnected"
            );
        }
    }
    gauges::dec_connections_active();
    gauges::rooms_active(state.registry.room_count() as f64);
    result
}

/// Drive the per-connection state machine over the socket and the
/// outbound delivery queue.
async fn run_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    deliver_rx: &mut mpsc::Receiver<Message>,
    state: &Arc<ServerState>,
    conn_id: ConnId,
    mut pending: Option<PendingChallenge>,
) -> Result<(), HubError> {
    let mut authenticated = pending.is_none();
    let mut limiter = RateLimiter::new();
    let mut ping_interval = interval(Duration::from_secs(state.config.server.ping_interval_secs));
    let idle_timeout = Duration::from_secs(state.config.server.idle_timeout_secs);
    let mut last_activity = Instant::now();
    let own_tx = match state.registry.get(conn_id) {
        Some(handle) => handle.tx,
        None => return Ok(()),
    };

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                last_activity = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if authenticated {
                            let start = Instant::now();
                            let outcome = router::route(state, conn_id, &text, &mut limiter, &own_tx);
                            if let RouteOutcome::Forwarded(_) = outcome {
                                if let Ok(now_ms) = eth::unix_now_ms() {
                                    state.registry.note_message(conn_id, now_ms);
                                }
                            }
                            histograms::route_latency_seconds(start.elapsed().as_secs_f64());
                        } else {
                            match handle_pending_frame(ws_tx, state, conn_id, &mut pending, &text).await? {
                                PendingOutcome::Promoted => authenticated = true,
                                PendingOutcome::StillPending => {}
                                PendingOutcome::Terminated => return Ok(()),
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        // The wire contract is UTF-8 JSON text frames.
                        debug!("ignoring binary frame");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            debug!("failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(HubError::WebSocket(e)),
                    _ => {}
                }
            }
            Some(outbound) = deliver_rx.recv() => {
                let closing = matches!(outbound, Message::Close(_));
                ws_tx.send(outbound).await.map_err(HubError::WebSocket)?;
                if closing {
                    return Ok(());
                }
            }
            _ = ping_interval.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    debug!("idle timeout reached, closing connection");
                    return Ok(());
                }
                if let Err(e) = ws_tx.send(Message::Ping(Vec::new())).await {
                    debug!("failed to send ping: {}", e);
                }
            }
        }
    }
}

/// What became of one inbound frame on a pending connection.
enum PendingOutcome {
    /// Handshake verified; the connection is now authenticated.
    Promoted,
    /// Not an auth-response; the auth-required error was sent.
    StillPending,
    /// Handshake failed; the connection was closed with code 4001.
    Terminated,
}

async fn handle_pending_frame(
    ws_tx: &mut WsSink,
    state: &Arc<ServerState>,
    conn_id: ConnId,
    pending: &mut Option<PendingChallenge>,
    raw: &str,
) -> Result<PendingOutcome, HubError> {
    let parsed: Option<Value> = serde_json::from_str(raw).ok();
    if protocol::message_type(parsed.as_ref()) != "auth-response" {
        send_frame(ws_tx, &ServerFrame::error(protocol::AUTH_REQUIRED)).await?;
        return Ok(PendingOutcome::StillPending);
    }

    let response = parsed
        .as_ref()
        .map(AuthResponse::from_value)
        .unwrap_or_default();
    let now_ms = eth::unix_now_ms()?;

    // The challenge is single-use: consumed on the first verification
    // attempt, success or failure.
    let verdict = match pending.take() {
        None => Err(HandshakeError::NoPending),
        Some(challenge) => handshake::verify(
            &challenge,
            response.signature.as_deref(),
            response.address.as_deref(),
            now_ms,
        ),
    };

    match verdict {
        Ok(address) => {
            let client_id = format!("{address}_{now_ms}");
            state
                .registry
                .authenticate(conn_id, &address, Some(&address), &client_id);
            counters::handshakes_total("verified");
            send_frame(
                ws_tx,
                &ServerFrame::AuthSuccess {
                    address: address.clone(),
                    client_id,
                },
            )
            .await?;
            auto_join_default(state, conn_id);
            if state.config.logging.log_connections {
                info!(wallet = %address, "handshake verified");
            }
            Ok(PendingOutcome::Promoted)
        }
        Err(e) => {
            counters::handshakes_total("failed");
            let reason = e.to_string();
            debug!(reason = %reason, "handshake failed");
            send_frame(
                ws_tx,
                &ServerFrame::AuthFailed {
                    reason: reason.clone(),
                },
            )
            .await?;
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::from(protocol::CLOSE_AUTH_FAILED),
                    reason: reason.into(),
                })))
                .await;
            Ok(PendingOutcome::Terminated)
        }
    }
}

/// Admission pipeline: IP filter, total cap, per-IP cap, default-room
/// capacity, auth prescreen. Rejections carry their HTTP status.
fn admit(
    state: &ServerState,
    peer_addr: SocketAddr,
    req: &Request,
) -> Result<Admission, ErrorResponse> {
    let ip = crate::ipfilter::normalize(peer_addr.ip());

    if !state.ip_filter.is_allowed(ip) {
        debug!(ip = %ip, "address rejected by ip filter");
        return Err(reject(StatusCode::FORBIDDEN, "Forbidden"));
    }

    let limits = &state.config.connection_limits;
    if state.registry.len() >= limits.max_total_connections {
        debug!(limit = limits.max_total_connections, "total connection limit reached");
        return Err(reject(
            StatusCode::SERVICE_UNAVAILABLE,
            "Service Unavailable",
        ));
    }
    if !state
        .registry
        .try_increment_ip(ip, limits.max_connections_per_ip)
    {
        debug!(ip = %ip, limit = limits.max_connections_per_ip, "per-IP connection limit exceeded");
        return Err(reject(
            StatusCode::SERVICE_UNAVAILABLE,
            "Service Unavailable",
        ));
    }
    // The per-IP slot is held from here on; later rejections return it.
    if let Some(room) = state.config.default_room() {
        if state.registry.room_occupancy(&room.id) >= limits.max_connections_per_room {
            state.registry.decrement_ip(ip);
            debug!(room = %room.id, "default room is full");
            return Err(reject(
                StatusCode::SERVICE_UNAVAILABLE,
                "Service Unavailable",
            ));
        }
    }

    let auth = &state.config.auth;
    let identity = if !auth.enabled || auth.allow_anonymous {
        Identity::Ready {
            user_id: anonymous_user_id(&auth.anonymous_prefix),
        }
    } else {
        match auth.method {
            AuthMethod::None => Identity::Ready {
                user_id: anonymous_user_id(&auth.anonymous_prefix),
            },
            AuthMethod::Token => match query_param(req.uri().query(), "token") {
                Some(token) if !token.is_empty() => Identity::Ready {
                    // Accepted as-is; token validation is a known gap.
                    user_id: format!("user_{}", token.chars().take(8).collect::<String>()),
                },
                _ => {
                    state.registry.decrement_ip(ip);
                    return Err(reject(StatusCode::UNAUTHORIZED, "Unauthorized"));
                }
            },
            AuthMethod::EthereumHandshake => Identity::Pending,
        }
    };

    Ok(Admission { ip, identity })
}

fn reject(status: StatusCode, body: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(body.to_string()));
    *resp.status_mut() = status;
    resp
}

fn auto_join_default(state: &ServerState, conn_id: ConnId) {
    if state.config.default_room().is_none() {
        return;
    }
    if let Some(room_id) = state.registry.join(conn_id, "", &state.config) {
        gauges::rooms_active(state.registry.room_count() as f64);
        debug!(room = %room_id, "auto-joined default room");
    }
}

/// Serialize and send one server frame on the socket. Serialization
/// failures are absorbed; transport failures propagate.
async fn send_frame(ws_tx: &mut WsSink, frame: &ServerFrame) -> Result<(), HubError> {
    match serde_json::to_string(frame) {
        Ok(text) => ws_tx
            .send(Message::Text(text))
            .await
            .map_err(HubError::WebSocket),
        Err(e) => {
            tracing::error!("failed to serialize frame: {e}");
            Ok(())
        }
    }
}

/// Answer a plain HTTP request with the signaling-only document.
async fn respond_signaling_only(stream: &mut TcpStream, state: &ServerState) {
    let ws_path = &state.config.server.ws_path;
    let body = serde_json::json!({
        "status": "signaling-only",
        "message": format!("UI is disabled. WebSocket signaling available at {ws_path}"),
        "wsPath": ws_path,
    })
    .to_string();
    let response = format!(
        "HTTP/1.1 503 Service Unavailable\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
}

/// Path component of the request line in a peeked HTTP preamble.
fn request_path(preview: &str) -> Option<&str> {
    let line = preview.lines().next()?;
    let target = line.split_whitespace().nth(1)?;
    match target.find('?') {
        Some(idx) => Some(&target[..idx]),
        None => Some(target),
    }
}

/// `<prefix>` + 8 random hex characters.
fn anonymous_user_id(prefix: &str) -> String {
    let mut bytes = [0u8; 4];
    OsRng.fill(&mut bytes);
    format!("{prefix}{}", hex::encode(bytes))
}

/// Query-string lookup without percent-decoding; tokens are opaque.
fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    query?
        .split('&')
        .find_map(|pair| pair.split_once('=').filter(|(k, _)| *k == key))
        .map(|(_, value)| value)
}
