//! Read-only access to the chain while no signer session is active.
//!
//! Each chain is served by the first http endpoint of its [`EndpointTable`] entry. The client for
//! a chain is built on first use and reused afterwards.

use crate::{error::ReadError, transport::HttpTransport};
use alloy_primitives::ChainId;
use foundry_bridge_config::EndpointTable;
use parking_lot::Mutex;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc, time::Duration};
use url::Url;

/// Whether `method` needs a signer and therefore must never reach a read-only endpoint.
pub fn is_signing_method(method: &str) -> bool {
    matches!(
        method,
        "eth_sendTransaction"
            | "eth_sendRawTransaction"
            | "eth_sign"
            | "personal_sign"
            | "eth_signTransaction"
            | "eth_requestAccounts"
    ) || method.starts_with("eth_signTypedData")
        || method.starts_with("wallet_")
}

/// Serves read-only requests through public or managed RPC endpoints.
#[derive(Clone, Debug)]
pub struct FallbackReadProvider {
    inner: Arc<FallbackInner>,
}

#[derive(Debug)]
struct FallbackInner {
    table: EndpointTable,
    timeout: Duration,
    clients: Mutex<HashMap<ChainId, HttpTransport>>,
}

impl FallbackReadProvider {
    pub fn new(table: EndpointTable, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(FallbackInner { table, timeout, clients: Mutex::new(HashMap::new()) }),
        }
    }

    pub fn table(&self) -> &EndpointTable {
        &self.inner.table
    }

    /// All candidate endpoints of `chain_id`, most preferred first.
    pub fn endpoints(&self, chain_id: ChainId) -> Vec<Url> {
        self.inner.table.resolve(chain_id)
    }

    /// The endpoint reads on `chain_id` go to.
    pub fn resolve(&self, chain_id: ChainId) -> Option<Url> {
        if let Some(client) = self.inner.clients.lock().get(&chain_id) {
            return Some(client.url().clone());
        }
        self.endpoints(chain_id).into_iter().find(is_http)
    }

    /// Sends a read-only request to `chain_id`.
    pub async fn read(
        &self,
        chain_id: ChainId,
        method: &str,
        params: Value,
    ) -> Result<Value, ReadError> {
        if is_signing_method(method) {
            return Err(ReadError::SigningNotAllowed(method.to_string()));
        }
        let client = self.client(chain_id)?;
        client.request(method, &params).await
    }

    fn client(&self, chain_id: ChainId) -> Result<HttpTransport, ReadError> {
        let mut clients = self.inner.clients.lock();
        if let Some(client) = clients.get(&chain_id) {
            return Ok(client.clone());
        }
        let url = self
            .endpoints(chain_id)
            .into_iter()
            .find(is_http)
            .ok_or(ReadError::NoEndpoint(chain_id))?;
        debug!(target: "bridge::fallback", chain_id, %url, "selected fallback endpoint");
        let client = HttpTransport::new(url, self.inner.timeout)?;
        clients.insert(chain_id, client.clone());
        Ok(client)
    }
}

fn is_http(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}
