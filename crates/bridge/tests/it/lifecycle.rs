use crate::utils::{ACCOUNT, OTHER_ACCOUNT, Signer, TestBridge, config};
use foundry_wallet_bridge::{
    ApprovalPrompt, BridgeEvent, ConnectionState, ErrorCode, EventDispatcher, EventKind, RpcError,
    WalletBridge,
    envelope::{HANDSHAKE_METHOD, RESUME_METHOD, SWITCH_CHAIN_METHOD},
    error::BridgeError,
    transport::{
        DeepLinkTransport, LinkOpener, ReconnectPolicy, SocketRelayTransport,
        test_utils::ScriptedConnector,
    },
};
use parking_lot::Mutex;
use serde_json::json;
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use ConnectionState::*;

#[tokio::test]
async fn connect_pause_restore_disconnect() {
    crate::init_tracing();
    let mut t = TestBridge::new(config());

    let connecting = t.spawn_connect();
    let mut signer = t.signer().await;
    signer.ready();
    let handshake = signer.approve(ACCOUNT, 1).await;
    assert_eq!(handshake.method, HANDSHAKE_METHOD);
    assert_eq!(handshake.chain_id, Some(1));

    let session = connecting.await.unwrap().unwrap();
    assert_eq!(session.account, Some(ACCOUNT));
    assert_eq!(handshake.params["sessionId"], json!(session.id.as_str()));
    assert_eq!(t.states(), [Connecting, AwaitingApproval, Connected]);
    assert!(t.events().contains(&BridgeEvent::ApprovalRequested(ApprovalPrompt::QrCode {
        uri: format!("wc:{}@relay.test", session.id),
    })));

    // relay drops
    drop(signer);
    t.wait_for_state(Paused).await;
    let err = t.bridge.request("personal_sign", json!(["0xdead", ACCOUNT]), None).await.unwrap_err();
    assert_eq!(err, BridgeError::NotConnected(Paused));
    assert_eq!(t.bridge.switch_chain(10).await.unwrap_err(), BridgeError::NotConnected(Paused));

    // relay comes back
    let signer = t.signer().await;
    signer.ready();
    t.wait_for_state(Connected).await;

    assert_eq!(t.bridge.disconnect(false).await, DisconnectedWithSession);
    assert_eq!(
        t.states(),
        [Connecting, AwaitingApproval, Connected, Paused, Connected, DisconnectedWithSession]
    );
    assert_eq!(t.persisted().map(|s| s.id), Some(session.id));
}

#[tokio::test]
async fn signing_round_trip() {
    let (t, mut signer) = TestBridge::connected(config()).await;

    let signing = t.spawn_request("personal_sign", json!(["0xdead", ACCOUNT]));
    let request = signer.next_request().await;
    assert_eq!(request.method, "personal_sign");
    assert_eq!(request.chain_id, Some(1));
    signer.respond(request.request_id, json!("0xsig"));
    assert_eq!(signing.await.unwrap().unwrap(), json!("0xsig"));

    let signing = t.spawn_request("eth_sendTransaction", json!([{}]));
    let request = signer.next_request().await;
    signer.reject(request.request_id, RpcError::with_message(ErrorCode::UserRejected, "denied"));
    let err = signing.await.unwrap().unwrap_err();
    assert_eq!(err, BridgeError::Remote { code: 4001, message: "denied".to_string() });
    assert_eq!(err.remote_code(), Some(4001));

    let events = t.events();
    assert!(events.iter().any(|event| matches!(
        event,
        BridgeEvent::RequestCompleted { method, .. } if method == "personal_sign"
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        BridgeEvent::RequestFailed { id: Some(_), method, .. } if method == "eth_sendTransaction"
    )));
}

#[tokio::test]
async fn end_session_fails_pending_requests() {
    let (t, mut signer) = TestBridge::connected(config()).await;

    let pending: Vec<_> =
        (0..4).map(|i| t.spawn_request("personal_sign", json!([format!("msg {i}")]))).collect();
    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(signer.next_request().await.request_id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 4);

    assert_eq!(t.bridge.end_session().await, Disconnected);
    for request in pending {
        assert_eq!(request.await.unwrap().unwrap_err(), BridgeError::SessionTorndown);
    }
    assert!(t.bridge.session().is_none());
    assert!(t.persisted().is_none());
    assert_eq!(t.bridge.lifecycle().correlator().pending_count(), 0);
    assert!(signer.closed().await);
}

#[tokio::test]
async fn handshake_rejected() {
    let mut t = TestBridge::new(config());

    let connecting = t.spawn_connect();
    let mut signer = t.signer().await;
    signer.ready();
    let handshake = signer.next_request().await;
    signer.reject(handshake.request_id, RpcError::user_rejected());

    let err = connecting.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        BridgeError::HandshakeRejected {
            code: 4001,
            message: "User rejected the request".to_string()
        }
    );
    assert_eq!(t.bridge.state(), Disconnected);
    assert_eq!(t.states(), [Connecting, AwaitingApproval, Disconnected]);
    assert!(t.events().iter().any(|e| matches!(e, BridgeEvent::HandshakeRejected { code: 4001, .. })));
    assert!(t.persisted().is_none());
}

#[tokio::test(start_paused = true)]
async fn handshake_times_out() {
    let mut t = TestBridge::new(config());

    let connecting = t.spawn_connect();
    let mut signer = t.signer().await;
    signer.ready();
    let _handshake = signer.next_request().await;

    let err = connecting.await.unwrap().unwrap_err();
    assert_eq!(err, BridgeError::HandshakeTimeout(Duration::from_secs(120)));
    assert_eq!(t.bridge.state(), Disconnected);
    assert!(signer.closed().await);

    // a later attempt starts over
    let connecting = t.spawn_connect();
    let mut signer = t.signer().await;
    signer.ready();
    signer.approve(ACCOUNT, 1).await;
    assert!(connecting.await.unwrap().is_ok());
}

#[tokio::test]
async fn concurrent_connects_share_one_handshake() {
    let mut t = TestBridge::new(config());

    let callers: Vec<_> = (0..3).map(|_| t.spawn_connect()).collect();
    let mut signer = t.signer().await;
    signer.ready();
    signer.approve(ACCOUNT, 1).await;

    let mut sessions = Vec::new();
    for caller in callers {
        sessions.push(caller.await.unwrap().unwrap());
    }
    assert!(sessions.windows(2).all(|pair| pair[0] == pair[1]));
    assert!(signer.try_next_request().is_none());
    let prompts =
        t.events().iter().filter(|e| matches!(e, BridgeEvent::ApprovalRequested(_))).count();
    assert_eq!(prompts, 1);
}

#[tokio::test]
async fn resumes_persisted_session() {
    let (first, _signer) = TestBridge::connected(config()).await;
    let session = first.bridge.session().unwrap();
    first.bridge.disconnect(false).await;
    let persisted = first.persisted().unwrap();
    assert!(persisted.sequence > 1);

    // the next process picks it up
    let mut t = TestBridge::with_store(config(), first.store.clone());
    let connecting = t.spawn_connect();
    let mut signer = t.signer().await;
    signer.ready();
    let resume = signer.approve(ACCOUNT, 1).await;
    assert_eq!(resume.method, RESUME_METHOD);
    assert_eq!(resume.params["sessionId"], json!(session.id.as_str()));
    assert!(resume.request_id >= persisted.sequence);

    assert_eq!(connecting.await.unwrap().unwrap().id, session.id);
    assert_eq!(t.states(), [Connecting, Connected]);
}

#[tokio::test]
async fn failed_resume_falls_back_to_handshake() {
    let (first, _signer) = TestBridge::connected(config()).await;
    let old = first.bridge.session().unwrap();
    first.bridge.disconnect(false).await;

    let mut t = TestBridge::with_store(config(), first.store.clone());
    let connecting = t.spawn_connect();
    let mut signer = t.signer().await;
    signer.ready();
    let resume = signer.next_request().await;
    assert_eq!(resume.method, RESUME_METHOD);
    signer.reject(resume.request_id, RpcError::new(ErrorCode::Unauthorized));

    let handshake = signer.approve(OTHER_ACCOUNT, 1).await;
    assert_eq!(handshake.method, HANDSHAKE_METHOD);
    let session = connecting.await.unwrap().unwrap();
    assert_ne!(session.id, old.id);
    assert_eq!(session.account, Some(OTHER_ACCOUNT));
    assert_eq!(t.persisted().map(|s| s.id), Some(session.id));
}

#[tokio::test]
async fn switches_chain() {
    let (t, mut signer) = TestBridge::connected(config()).await;

    let switching = tokio::spawn({
        let bridge = t.bridge.clone();
        async move { bridge.switch_chain(137).await }
    });
    let request = signer.next_request().await;
    assert_eq!(request.method, SWITCH_CHAIN_METHOD);
    assert_eq!(request.params, json!([{ "chainId": "0x89" }]));
    assert_eq!(request.chain_id, Some(1));
    signer.respond(request.request_id, json!(null));
    switching.await.unwrap().unwrap();

    assert_eq!(t.bridge.session().unwrap().chain_id, 137);
    assert_eq!(t.persisted().unwrap().chain_id, 137);
    assert!(t.events().contains(&BridgeEvent::ChainChanged(137)));

    // already there
    t.bridge.switch_chain(137).await.unwrap();
    assert!(signer.try_next_request().is_none());
}

#[tokio::test]
async fn applies_signer_notifications() {
    let (t, signer) = TestBridge::connected(config()).await;

    signer.notify("chainChanged", json!("0xa"));
    t.until(|t| t.bridge.session().is_some_and(|s| s.chain_id == 10)).await;
    assert!(t.events().contains(&BridgeEvent::ChainChanged(10)));

    signer.notify("accountsChanged", json!([OTHER_ACCOUNT]));
    t.until(|t| t.bridge.session().and_then(|s| s.account) == Some(OTHER_ACCOUNT)).await;

    signer.notify("accountsChanged", json!([]));
    t.until(|t| t.bridge.session().is_some_and(|s| s.account.is_none())).await;
    assert!(t.events().contains(&BridgeEvent::AccountChanged(None)));
    assert_eq!(t.persisted().unwrap().account, None);
}

#[tokio::test]
async fn forwards_overlay_and_otp() {
    let (t, signer) = TestBridge::connected(config()).await;

    signer.send(json!({ "event": "show_overlay", "uri": "wc:pair" }));
    signer.send(json!({ "event": "otp", "code": 123456 }));
    signer.send(json!({ "event": "hide_overlay" }));
    t.until(|t| t.events().contains(&BridgeEvent::OverlayHidden)).await;

    let events = t.events();
    similar_asserts::assert_eq!(
        events[events.len() - 3..].to_vec(),
        vec![
            BridgeEvent::OverlayShown { uri: Some("wc:pair".to_string()) },
            BridgeEvent::OtpReceived(123456),
            BridgeEvent::OverlayHidden,
        ]
    );
}

#[tokio::test]
async fn signer_disconnect_ends_session() {
    let (t, signer) = TestBridge::connected(config()).await;

    signer.send(json!({ "event": "disconnect" }));
    t.wait_for_state(Disconnected).await;
    assert!(t.bridge.session().is_none());
    assert!(t.persisted().is_none());
}

#[tokio::test]
async fn disconnect_without_persistence_forgets_session() {
    let mut config = config();
    config.persist_session = false;
    let (t, _signer) = TestBridge::connected(config).await;

    assert!(t.persisted().is_none());
    assert_eq!(t.bridge.disconnect(false).await, Disconnected);
    assert!(t.bridge.session().is_none());
}

#[tokio::test]
async fn connect_reopens_relay_that_gave_up() {
    let mut config = config();
    config.relay_max_retries = 0;
    let (mut t, signer) = TestBridge::connected(config).await;
    let session = t.bridge.session().unwrap();

    drop(signer);
    t.until(|t| {
        t.events().iter().any(|event| matches!(
            event,
            BridgeEvent::TransportUnreachable { reason } if reason.contains("did not come back")
        ))
    })
    .await;
    assert_eq!(t.bridge.state(), Paused);

    // still the same session, now with a fresh relay
    assert_eq!(t.bridge.connect().await.unwrap().id, session.id);
    let mut signer = t.signer().await;
    signer.ready();
    t.wait_for_state(Connected).await;

    let signing = t.spawn_request("personal_sign", json!(["0xdead", ACCOUNT]));
    let request = signer.next_request().await;
    signer.respond(request.request_id, json!("0xsig"));
    assert_eq!(signing.await.unwrap().unwrap(), json!("0xsig"));
    assert_eq!(t.states(), [Connecting, AwaitingApproval, Connected, Paused, Connected]);
}

#[tokio::test]
async fn chain_notification_during_switch_lands_after_it() {
    let (t, mut signer) = TestBridge::connected(config()).await;

    let switching = tokio::spawn({
        let bridge = t.bridge.clone();
        async move { bridge.switch_chain(137).await }
    });
    let request = signer.next_request().await;
    assert_eq!(request.method, SWITCH_CHAIN_METHOD);
    signer.notify("chainChanged", json!("0xa"));
    signer.respond(request.request_id, json!(null));
    switching.await.unwrap().unwrap();

    t.until(|t| t.bridge.session().is_some_and(|s| s.chain_id == 10)).await;
    let chains: Vec<_> = t
        .events()
        .into_iter()
        .filter_map(|event| match event {
            BridgeEvent::ChainChanged(chain) => Some(chain),
            _ => None,
        })
        .collect();
    assert_eq!(chains, [1, 137, 10]);
    assert_eq!(t.persisted().unwrap().chain_id, 10);
}

/// Fails the second open only.
#[derive(Debug, Default)]
struct FlakyOpener {
    opens: AtomicUsize,
}

#[async_trait::async_trait]
impl LinkOpener for FlakyOpener {
    async fn open(&self, _url: &str) -> io::Result<()> {
        match self.opens.fetch_add(1, Ordering::SeqCst) {
            1 => Err(io::Error::other("app did not respond")),
            _ => Ok(()),
        }
    }
}

#[tokio::test]
async fn failed_app_open_keeps_connected_session() {
    let config = config();
    let (connector, mut relays) = ScriptedConnector::new();
    let relay = SocketRelayTransport::new(connector, ReconnectPolicy::from(&config));
    let opener = Arc::new(FlakyOpener::default());
    let transport =
        DeepLinkTransport::new("metamask://connect".parse().unwrap(), relay, opener.clone());

    let dispatcher = EventDispatcher::new();
    let unreachable = Arc::new(Mutex::new(Vec::new()));
    let _registration = dispatcher.subscribe(EventKind::TransportUnreachable, {
        let unreachable = unreachable.clone();
        move |event| unreachable.lock().push(event.clone())
    });
    let bridge = WalletBridge::builder(config, dispatcher.sender())
        .transport(Arc::new(transport))
        .build()
        .unwrap();

    let connecting = tokio::spawn({
        let bridge = bridge.clone();
        async move { bridge.connect().await }
    });
    let mut signer = Signer::from(relays.recv().await.unwrap());
    signer.ready();
    signer.approve(ACCOUNT, 1).await;
    connecting.await.unwrap().unwrap();

    let sign = |message: &'static str| {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.request("personal_sign", json!([message]), None).await })
    };

    // the app fails to open, the relay still delivers
    let signing = sign("first");
    let request = signer.next_request().await;
    signer.respond(request.request_id, json!("0xsig1"));
    assert_eq!(signing.await.unwrap().unwrap(), json!("0xsig1"));
    for _ in 0..1_000 {
        if !unreachable.lock().is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(matches!(
        unreachable.lock().as_slice(),
        [BridgeEvent::TransportUnreachable { reason }] if reason.contains("did not respond")
    ));
    assert_eq!(bridge.state(), Connected);

    let signing = sign("second");
    let request = signer.next_request().await;
    signer.respond(request.request_id, json!("0xsig2"));
    assert_eq!(signing.await.unwrap().unwrap(), json!("0xsig2"));
    tokio::task::yield_now().await;
    assert_eq!(opener.opens.load(Ordering::SeqCst), 3);
    assert_eq!(bridge.state(), Connected);
}
