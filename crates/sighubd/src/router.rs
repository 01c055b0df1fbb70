use crate::config::RoutingMode;
use crate::metrics::{counters, gauges};
use crate::ratelimit::RateLimiter;
use crate::rooms::ConnId;
use crate::server::ServerState;
use serde_json::Value;
use sighub_common::protocol::{self, JoinRequest, ServerFrame};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// What the router did with one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Application frame forwarded to this many recipients (possibly 0).
    Forwarded(usize),
    /// Control frame (`join`/`leave`) handled.
    Control,
    /// Rejected by policy; an error frame was queued to the sender.
    Rejected,
}

/// Dispatch one raw text frame from an authenticated connection.
///
/// The frame is parsed leniently: invalid JSON routes as an opaque
/// `custom` message. Forwarding is verbatim; the hub never rewrites
/// payloads, and sender metadata is the sending client's concern.
pub fn route(
    state: &ServerState,
    sender: ConnId,
    raw: &str,
    limiter: &mut RateLimiter,
    own_tx: &mpsc::Sender<Message>,
) -> RouteOutcome {
    let parsed: Option<Value> = serde_json::from_str(raw).ok();
    let msg_type = protocol::message_type(parsed.as_ref()).to_string();

    if !limiter.check_and_record(&state.config.rate_limit_rules, &msg_type) {
        counters::messages_dropped_total("rate_limit");
        reply(own_tx, &ServerFrame::error("Rate limit exceeded"));
        return RouteOutcome::Rejected;
    }

    match msg_type.as_str() {
        "join" => {
            let requested = parsed
                .as_ref()
                .map(JoinRequest::from_value)
                .unwrap_or_default()
                .room_id
                .unwrap_or_default();
            match state.registry.join(sender, &requested, &state.config) {
                Some(room_id) => debug!(room = %room_id, "connection joined room"),
                None => debug!("join ignored, no rooms configured"),
            }
            gauges::rooms_active(state.registry.room_count() as f64);
            return RouteOutcome::Control;
        }
        "leave" => {
            if let Some(room_id) = state.registry.leave(sender) {
                debug!(room = %room_id, "connection left room");
            }
            gauges::rooms_active(state.registry.room_count() as f64);
            return RouteOutcome::Control;
        }
        _ => {}
    }

    let Some(handle) = state.registry.get(sender) else {
        return RouteOutcome::Forwarded(0);
    };

    let room_config = handle
        .room_id
        .as_deref()
        .and_then(|room_id| state.config.room(room_id));

    if let Some(allowed) = room_config.and_then(|room| room.allowed_message_types.as_ref()) {
        if !allowed.iter().any(|t| t == &msg_type) {
            counters::messages_dropped_total("type_policy");
            reply(
                own_tx,
                &ServerFrame::error(format!(
                    "Message type '{msg_type}' not allowed in this room"
                )),
            );
            return RouteOutcome::Rejected;
        }
    }

    let mode = room_config.map(|room| room.routing_mode).unwrap_or_default();
    let delivered = match mode {
        RoutingMode::Unicast => {
            let target = parsed
                .as_ref()
                .and_then(|v| v.get("targetId"))
                .and_then(Value::as_str)
                // The sender never receives its own frame back.
                .filter(|target| *target != handle.client_id);
            match target.and_then(|t| state.registry.find_by_client_id(t)) {
                Some(tx) => deliver(&tx, raw),
                // No such recipient: the frame is silently dropped.
                None => 0,
            }
        }
        // Broadcast is the default; multicast and unknown modes fall
        // through to it.
        RoutingMode::Broadcast | RoutingMode::Multicast | RoutingMode::Unknown => state
            .registry
            .broadcast_targets(sender)
            .iter()
            .map(|tx| deliver(tx, raw))
            .sum::<usize>(),
    };

    counters::messages_forwarded_total(delivered as u64);
    if state.config.logging.log_messages {
        debug!(%msg_type, delivered, "frame routed");
    }
    RouteOutcome::Forwarded(delivered)
}

/// Queue a raw frame to one recipient. Full or closed queues drop the
/// frame; the recipient's own driver handles its socket state.
fn deliver(tx: &mpsc::Sender<Message>, raw: &str) -> usize {
    match tx.try_send(Message::Text(raw.to_string())) {
        Ok(()) => 1,
        Err(mpsc::error::TrySendError::Full(_)) => {
            counters::messages_dropped_total("backpressure");
            0
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            counters::messages_dropped_total("closed");
            0
        }
    }
}

/// Queue a server frame back to the sender; failures are absorbed.
fn reply(tx: &mpsc::Sender<Message>, frame: &ServerFrame) {
    match serde_json::to_string(frame) {
        Ok(text) => {
            let _ = tx.try_send(Message::Text(text));
        }
        Err(e) => tracing::error!("failed to serialize frame: {e}"),
    }
}
