use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use k256::ecdsa::SigningKey;
use serde_json::{json, Value};
use sighub_common::eth;
use sighubd::config::{Config, RoomConfig, RoutingMode};
use sighubd::ServerState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type WsTx = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;
pub type WsRx = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Baseline config: one broadcast default room with the standard
/// signaling types allowed, wallet handshake required, generous caps.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.rooms = vec![RoomConfig {
        id: "default".to_string(),
        routing_mode: RoutingMode::Broadcast,
        allowed_message_types: Some(
            ["offer", "answer", "ice-candidate", "join", "leave", "custom"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        ),
        max_members: None,
    }];
    config.connection_limits.max_connections_per_ip = 100;
    config
}

pub async fn start_server(config: Config) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = ServerState::new(config).unwrap();

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = sighubd::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, state)
}

pub fn test_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32].into()).expect("valid seed")
}

pub struct TestClient {
    pub ws_tx: WsTx,
    pub ws_rx: WsRx,
    pub client_id: String,
    pub address: String,
}

impl TestClient {
    /// Connect to the hub and complete the wallet handshake.
    pub async fn connect(addr: &SocketAddr, key: &SigningKey) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();
        let (mut ws_tx, mut ws_rx) = ws.split();

        let challenge = recv_json_from(&mut ws_rx).await;
        assert_eq!(challenge["type"], "auth-challenge");
        assert_eq!(challenge["method"], "ethereum-handshake");
        let message = challenge["message"].as_str().unwrap();

        let signature = eth::sign_personal(key, message).unwrap();
        let address = eth::address_of(key);
        ws_tx
            .send(Message::Text(
                json!({"type": "auth-response", "signature": signature, "address": address})
                    .to_string(),
            ))
            .await
            .unwrap();

        let success = recv_json_from(&mut ws_rx).await;
        assert_eq!(success["type"], "auth-success", "unexpected frame: {success}");
        let client_id = success["clientId"].as_str().unwrap().to_string();

        Self {
            ws_tx,
            ws_rx,
            client_id,
            address,
        }
    }

    /// Connect without authenticating; anonymous/token modes and manual
    /// handshake tests drive the socket directly.
    pub async fn connect_raw(addr: &SocketAddr, path_and_query: &str) -> (WsTx, WsRx) {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}{path_and_query}"))
            .await
            .unwrap();
        ws.split()
    }

    pub async fn send_json(&mut self, value: &Value) {
        self.ws_tx
            .send(Message::Text(value.to_string()))
            .await
            .unwrap();
    }

    pub async fn send_raw(&mut self, raw: &str) {
        self.ws_tx
            .send(Message::Text(raw.to_string()))
            .await
            .unwrap();
    }

    pub async fn recv_json(&mut self) -> Value {
        recv_json_from(&mut self.ws_rx).await
    }

    pub async fn recv_json_timeout(&mut self, timeout: Duration) -> Option<Value> {
        tokio::time::timeout(timeout, recv_json_from(&mut self.ws_rx))
            .await
            .ok()
    }
}

/// Next JSON text frame, skipping transport keepalives.
pub async fn recv_json_from(ws_rx: &mut WsRx) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws_rx.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

/// Wait for the close frame and return its code and reason.
pub async fn recv_close(ws_rx: &mut WsRx) -> (u16, String) {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws_rx.next())
            .await
            .expect("timeout waiting for close")
            .expect("stream ended without close")
            .expect("websocket error");
        match msg {
            Message::Close(Some(frame)) => {
                return (u16::from(frame.code), frame.reason.to_string())
            }
            Message::Close(None) => return (1005, String::new()),
            _ => {}
        }
    }
}
