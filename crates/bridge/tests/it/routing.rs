use crate::utils::{ACCOUNT, TestBridge, config, spawn_rpc};
use alloy_primitives::Address;
use foundry_wallet_bridge::{
    BridgeConfig, ConnectionState,
    error::{BridgeError, ReadError},
};
use serde_json::json;

fn with_rpc(chain_id: u64, url: &url::Url) -> BridgeConfig {
    let mut config = config();
    config.rpc_endpoints.insert(chain_id.to_string(), vec![url.as_str().into()]);
    config
}

#[tokio::test]
async fn reads_through_fallback_without_session() {
    let url = spawn_rpc("0x10").await;
    let mut t = TestBridge::new(with_rpc(1, &url));

    assert_eq!(t.bridge.read("eth_blockNumber", json!([])).await.unwrap(), json!("0x10"));
    assert_eq!(t.bridge.fallback().resolve(1), Some(url));
    assert_eq!(t.bridge.state(), ConnectionState::Disconnected);

    // the signer was never involved
    let connecting = t.spawn_connect();
    let mut signer = t.signer().await;
    signer.ready();
    assert_eq!(signer.approve(ACCOUNT, 1).await.request_id, 1);
    connecting.await.unwrap().unwrap();
}

#[tokio::test]
async fn reads_through_signer_while_connected() {
    let url = spawn_rpc("0x10").await;
    let (t, mut signer) = TestBridge::connected(with_rpc(1, &url)).await;

    let reading = tokio::spawn({
        let bridge = t.bridge.clone();
        async move { bridge.read("eth_blockNumber", json!([])).await }
    });
    let request = signer.next_request().await;
    assert_eq!(request.method, "eth_blockNumber");
    signer.respond(request.request_id, json!("0x20"));
    assert_eq!(reading.await.unwrap().unwrap(), json!("0x20"));

    // paused sessions fall back
    drop(signer);
    t.wait_for_state(ConnectionState::Paused).await;
    assert_eq!(t.bridge.read("eth_blockNumber", json!([])).await.unwrap(), json!("0x10"));
}

#[tokio::test]
async fn reads_follow_session_chain() {
    let mainnet = spawn_rpc("0x1").await;
    let polygon = spawn_rpc("0x89").await;
    let mut config = with_rpc(1, &mainnet);
    config.rpc_endpoints.insert("137".to_string(), vec![polygon.as_str().into()]);

    let mut t = TestBridge::new(config);
    let connecting = t.spawn_connect();
    let mut signer = t.signer().await;
    signer.ready();
    signer.approve(ACCOUNT, 137).await;
    assert_eq!(connecting.await.unwrap().unwrap().chain_id, 137);

    assert_eq!(t.bridge.disconnect(false).await, ConnectionState::DisconnectedWithSession);
    assert_eq!(t.bridge.read_chain(), 137);
    assert_eq!(t.bridge.read("eth_blockNumber", json!([])).await.unwrap(), json!("0x89"));

    t.bridge.end_session().await;
    assert_eq!(t.bridge.read_chain(), 1);
    assert_eq!(t.bridge.read("eth_blockNumber", json!([])).await.unwrap(), json!("0x1"));
}

#[tokio::test]
async fn read_never_signs() {
    let (t, mut signer) = TestBridge::connected(config()).await;

    for method in ["eth_sendTransaction", "personal_sign", "eth_signTypedData_v4"] {
        let err = t.bridge.read(method, json!([])).await.unwrap_err();
        assert_eq!(err, BridgeError::Read(ReadError::SigningNotAllowed(method.to_string())));
    }
    assert!(signer.try_next_request().is_none());
}

#[tokio::test]
async fn typed_results() {
    let (t, mut signer) = TestBridge::connected(config()).await;

    let accounts = tokio::spawn({
        let bridge = t.bridge.clone();
        async move { bridge.request_as::<Vec<Address>>("eth_accounts", json!([]), None).await }
    });
    let request = signer.next_request().await;
    signer.respond(request.request_id, json!([ACCOUNT]));
    assert_eq!(accounts.await.unwrap().unwrap(), vec![ACCOUNT]);

    let malformed = tokio::spawn({
        let bridge = t.bridge.clone();
        async move { bridge.request_as::<Vec<Address>>("eth_accounts", json!([]), None).await }
    });
    let request = signer.next_request().await;
    signer.respond(request.request_id, json!("not a list"));
    assert!(matches!(malformed.await.unwrap(), Err(BridgeError::Malformed(_))));
}

#[tokio::test]
async fn unknown_chain_has_no_fallback() {
    let mut config = config();
    config.chain_id = 999_999_999;
    let t = TestBridge::new(config);

    let err = t.bridge.read("eth_blockNumber", json!([])).await.unwrap_err();
    assert_eq!(err, BridgeError::Read(ReadError::NoEndpoint(999_999_999)));
}
