use crate::config::Config;
use crate::connection::handle_connection;
use crate::error::HubError;
use crate::ipfilter::{IpFilter, PatternError};
use crate::registry::Registry;
use sighub_common::protocol::CLOSE_NORMAL;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info};

/// Shared state for the signaling server.
pub struct ServerState {
    /// Immutable configuration snapshot.
    pub config: Config,
    /// Live connections, rooms, and per-IP counters.
    pub registry: Registry,
    /// Compiled whitelist/blacklist patterns.
    pub ip_filter: IpFilter,
}

impl ServerState {
    /// Build server state from a validated configuration snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] when an IP filter pattern cannot be
    /// compiled.
    pub fn new(config: Config) -> Result<Arc<Self>, PatternError> {
        let ip_filter = IpFilter::from_rules(&config.ip_filters)?;
        Ok(Arc::new(Self {
            config,
            registry: Registry::new(),
            ip_filter,
        }))
    }
}

/// Accept loop: one spawned driver task per inbound connection.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), HubError> {
    let local_addr = listener.local_addr().map_err(HubError::Io)?;
    info!("signaling server listening on {}", local_addr);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, addr, state).await {
                        tracing::debug!("connection from {} closed: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("failed to accept connection: {}", e);
            }
        }
    }
}

/// Run until `shutdown` resolves, then drain: every connection is sent a
/// normal close through its outbound queue and the registry is given a
/// bounded grace period to empty.
///
/// # Errors
///
/// Propagates accept-loop failures from [`run`].
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), HubError> {
    tokio::select! {
        result = run(listener, Arc::clone(&state)) => result,
        () = shutdown => {
            info!("shutting down, draining {} connections", state.registry.len());
            for tx in state.registry.all_senders() {
                let close = Message::Close(Some(CloseFrame {
                    code: CloseCode::from(CLOSE_NORMAL),
                    reason: "server shutdown".into(),
                }));
                let _ = tx.try_send(close);
            }
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            while !state.registry.is_empty() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(())
        }
    }
}
