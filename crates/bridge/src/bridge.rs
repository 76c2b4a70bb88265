use crate::{
    error::{BridgeError, ReadError},
    events::EventSender,
    fallback::{FallbackReadProvider, is_signing_method},
    lifecycle::{ConnectionLifecycle, LifecycleConfig},
    session::{MemorySessionStore, Session, SessionStore},
    state::ConnectionState,
    transport::{self, Transport},
};
use alloy_primitives::ChainId;
use foundry_bridge_config::BridgeConfig;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{sync::Arc, time::Duration};

/// A connection to one remote signer.
///
/// Owns the connection lifecycle and the read-only fallback. Bridges are independent of each
/// other; several may coexist in one process.
#[derive(Clone, Debug)]
pub struct WalletBridge {
    lifecycle: ConnectionLifecycle,
    fallback: FallbackReadProvider,
    default_chain: ChainId,
}

impl WalletBridge {
    /// Starts building a bridge from `config`. Events are emitted through `events`.
    pub fn builder(config: BridgeConfig, events: EventSender) -> WalletBridgeBuilder {
        WalletBridgeBuilder { config, events, transport: None, store: None }
    }

    /// Assembles a bridge from already constructed parts.
    pub fn new(
        lifecycle: ConnectionLifecycle,
        fallback: FallbackReadProvider,
        default_chain: ChainId,
    ) -> Self {
        Self { lifecycle, fallback, default_chain }
    }

    pub fn lifecycle(&self) -> &ConnectionLifecycle {
        &self.lifecycle
    }

    pub fn fallback(&self) -> &FallbackReadProvider {
        &self.fallback
    }

    pub async fn connect(&self) -> Result<Session, BridgeError> {
        self.lifecycle.connect().await
    }

    pub async fn disconnect(&self, end_session: bool) -> ConnectionState {
        self.lifecycle.disconnect(end_session).await
    }

    pub async fn end_session(&self) -> ConnectionState {
        self.lifecycle.end_session().await
    }

    pub async fn switch_chain(&self, chain_id: ChainId) -> Result<(), BridgeError> {
        self.lifecycle.switch_chain(chain_id).await
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn session(&self) -> Option<Session> {
        self.lifecycle.session()
    }

    /// The chain reads are routed to when no signer is connected.
    pub fn read_chain(&self) -> ChainId {
        self.session().map_or(self.default_chain, |session| session.chain_id)
    }

    /// Sends a signing request to the signer.
    pub async fn request(
        &self,
        method: impl Into<String>,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        self.lifecycle.request(method, params, timeout).await
    }

    /// Like [`request`](Self::request), deserializing the result into `T`.
    pub async fn request_as<T: DeserializeOwned>(
        &self,
        method: impl Into<String>,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<T, BridgeError> {
        let value = self.request(method, params, timeout).await?;
        serde_json::from_value(value).map_err(BridgeError::malformed)
    }

    /// Sends a read-only request.
    ///
    /// Goes to the signer while connected and to the fallback endpoints otherwise.
    pub async fn read(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        if is_signing_method(method) {
            return Err(ReadError::SigningNotAllowed(method.to_string()).into());
        }
        if self.state() == ConnectionState::Connected {
            return self.request(method, params, None).await;
        }
        let chain_id = self.read_chain();
        trace!(target: "bridge::fallback", chain_id, method, state = %self.state(), "reading through fallback");
        Ok(self.fallback.read(chain_id, method, params).await?)
    }
}

/// Builder for [`WalletBridge`].
#[derive(Debug)]
#[must_use]
pub struct WalletBridgeBuilder {
    config: BridgeConfig,
    events: EventSender,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn SessionStore>>,
}

impl WalletBridgeBuilder {
    /// Uses `transport` instead of the one configured by `relay_url`/`deep_link`.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Persists sessions in `store`. Defaults to a [`MemorySessionStore`].
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Builds the bridge. Must be called within a tokio runtime.
    pub fn build(self) -> Result<WalletBridge, BridgeError> {
        let Self { config, events, transport, store } = self;

        let table = config.endpoint_table()?;
        let transport = match transport {
            Some(transport) => transport,
            None => transport::from_config(&config)?,
        };
        let store = store.unwrap_or_else(|| Arc::new(MemorySessionStore::new()));
        debug!(target: "bridge::config", kind = %transport.kind(), chain_id = config.chain_id, "building wallet bridge");

        let fallback = FallbackReadProvider::new(table, config.request_timeout());
        let lifecycle =
            ConnectionLifecycle::new(LifecycleConfig::from(&config), transport, store, events);
        Ok(WalletBridge::new(lifecycle, fallback, config.chain_id))
    }
}
