//! Scripted signer and helpers shared by the scenarios.

use alloy_primitives::{Address, ChainId, address};
use foundry_wallet_bridge::{
    BridgeConfig, BridgeEvent, ConnectionState, EventDispatcher, EventKind, ListenerRegistration,
    MemorySessionStore, RequestEnvelope, ResponseEnvelope, RpcError, Session, SessionStore,
    WalletBridge,
    envelope::{HANDSHAKE_METHOD, RESUME_METHOD, RequestId},
    error::BridgeError,
    transport::{
        ReconnectPolicy, RelayInterface, SocketRelayTransport, test_utils::ScriptedConnector,
    },
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use url::Url;

pub const ACCOUNT: Address = address!("0x1804c8AB1F12E6bbf3894d4083f33e07309d1f38");
pub const OTHER_ACCOUNT: Address = address!("0x70997970C51812dc3A010C7d01b50e0d17dc79C8");

/// The remote end of one relay connection.
#[derive(Debug)]
pub struct Signer {
    relay: RelayInterface,
}

impl From<RelayInterface> for Signer {
    fn from(relay: RelayInterface) -> Self {
        Self { relay }
    }
}

impl Signer {
    pub fn send(&self, frame: Value) {
        assert!(self.relay.send_to_frontend(frame.to_string()), "transport went away");
    }

    pub fn ready(&self) {
        self.send(json!({ "event": "ready" }));
    }

    pub async fn next_request(&mut self) -> RequestEnvelope {
        let frame = self.relay.recv_from_frontend().await.expect("relay closed");
        serde_json::from_str(&frame).unwrap()
    }

    pub fn try_next_request(&mut self) -> Option<RequestEnvelope> {
        self.relay.try_recv_from_frontend().map(|frame| serde_json::from_str(&frame).unwrap())
    }

    pub fn respond(&self, id: RequestId, result: Value) {
        self.send(serde_json::to_value(ResponseEnvelope::success(id, result)).unwrap());
    }

    pub fn reject(&self, id: RequestId, error: RpcError) {
        self.send(serde_json::to_value(ResponseEnvelope::error(id, error)).unwrap());
    }

    pub fn notify(&self, method: &str, params: Value) {
        self.send(json!({ "method": method, "params": params }));
    }

    /// Answers the next handshake or resume request with `account` on `chain_id`.
    pub async fn approve(&mut self, account: Address, chain_id: ChainId) -> RequestEnvelope {
        let request = self.next_request().await;
        assert!(
            request.method == HANDSHAKE_METHOD || request.method == RESUME_METHOD,
            "unexpected {}",
            request.method
        );
        self.respond(
            request.request_id,
            json!({ "accounts": [account], "chainId": format!("{chain_id:#x}") }),
        );
        request
    }

    /// Whether the transport closed this connection.
    pub async fn closed(&mut self) -> bool {
        self.relay.recv_from_frontend().await.is_none()
    }
}

/// A bridge wired to a scripted relay, recording every event it emits.
pub struct TestBridge {
    pub bridge: WalletBridge,
    pub store: Arc<MemorySessionStore>,
    pub transport: Arc<SocketRelayTransport<ScriptedConnector>>,
    pub dispatcher: EventDispatcher,
    relays: mpsc::UnboundedReceiver<RelayInterface>,
    events: Arc<Mutex<Vec<BridgeEvent>>>,
    _registrations: Vec<ListenerRegistration>,
}

impl TestBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_store(config, Arc::new(MemorySessionStore::new()))
    }

    pub fn with_store(config: BridgeConfig, store: Arc<MemorySessionStore>) -> Self {
        let dispatcher = EventDispatcher::new();
        let (connector, relays) = ScriptedConnector::new();
        let transport =
            Arc::new(SocketRelayTransport::new(connector, ReconnectPolicy::from(&config)));

        let events = Arc::new(Mutex::new(Vec::new()));
        let registrations = [
            EventKind::StateChanged,
            EventKind::ApprovalRequested,
            EventKind::OverlayShown,
            EventKind::OverlayHidden,
            EventKind::OtpReceived,
            EventKind::ChainChanged,
            EventKind::AccountChanged,
            EventKind::RequestCompleted,
            EventKind::RequestFailed,
            EventKind::TransportUnreachable,
            EventKind::HandshakeRejected,
        ]
        .into_iter()
        .map(|kind| {
            let events = events.clone();
            dispatcher.subscribe(kind, move |event| events.lock().push(event.clone()))
        })
        .collect();

        let bridge = WalletBridge::builder(config, dispatcher.sender())
            .transport(transport.clone())
            .store(store.clone())
            .build()
            .unwrap();
        Self { bridge, store, transport, dispatcher, relays, events, _registrations: registrations }
    }

    /// Connects and approves the handshake.
    pub async fn connected(config: BridgeConfig) -> (Self, Signer) {
        let mut this = Self::new(config);
        let signer = this.connect_approved().await;
        (this, signer)
    }

    /// Runs `connect()` and approves whatever the signer is asked.
    pub async fn connect_approved(&mut self) -> Signer {
        let connecting = self.spawn_connect();
        let mut signer = self.signer().await;
        signer.ready();
        signer.approve(ACCOUNT, self.bridge.lifecycle().config().chain_id).await;
        connecting.await.unwrap().unwrap();
        signer
    }

    pub fn spawn_connect(&self) -> JoinHandle<Result<Session, BridgeError>> {
        let bridge = self.bridge.clone();
        tokio::spawn(async move { bridge.connect().await })
    }

    pub fn spawn_request(
        &self,
        method: &str,
        params: Value,
    ) -> JoinHandle<Result<Value, BridgeError>> {
        let bridge = self.bridge.clone();
        let method = method.to_string();
        tokio::spawn(async move { bridge.request(method, params, None).await })
    }

    /// The next relay connection the transport opens.
    pub async fn signer(&mut self) -> Signer {
        let relay = self.relays.recv().await.expect("transport never connected");
        Signer { relay }
    }

    pub async fn wait_for_state(&self, state: ConnectionState) {
        let mut states = self.bridge.lifecycle().subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("never reached {state}"))
            .unwrap();
    }

    /// Waits until `condition` holds, giving the background tasks a chance to run.
    pub async fn until(&self, mut condition: impl FnMut(&Self) -> bool) {
        for _ in 0..1_000 {
            if condition(self) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition never held");
    }

    pub fn events(&self) -> Vec<BridgeEvent> {
        self.events.lock().clone()
    }

    /// Every state the bridge moved into, in order.
    pub fn states(&self) -> Vec<ConnectionState> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                BridgeEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    pub fn persisted(&self) -> Option<Session> {
        self.store.load().unwrap().map(|blob| Session::from_blob(&blob).unwrap())
    }
}

/// Config for a bridge with a fast reconnecting relay.
pub fn config() -> BridgeConfig {
    BridgeConfig { relay_retry_backoff: 10, ..Default::default() }
}

/// Spawns a JSON-RPC server that answers `eth_blockNumber` with `block`.
pub async fn spawn_rpc(block: &'static str) -> Url {
    use axum::{Json, Router, routing::post};

    let handle = move |Json(req): Json<Value>| async move {
        let id = req["id"].clone();
        let body = match req["method"].as_str() {
            Some("eth_blockNumber") => json!({ "jsonrpc": "2.0", "id": id, "result": block }),
            _ => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": "method not found" }
            }),
        };
        Json(body)
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, Router::new().route("/", post(handle))).await.unwrap();
    });
    format!("http://{addr}/").parse().unwrap()
}
