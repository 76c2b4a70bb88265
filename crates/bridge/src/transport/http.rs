//! Read-only JSON-RPC over HTTP, used by the fallback read path.

use crate::{
    envelope::{RpcError, present},
    error::ReadError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use url::Url;

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// A JSON-RPC client bound to a single endpoint.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: Url,
    next_id: Arc<AtomicU64>,
}

impl HttpTransport {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, ReadError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url, next_id: Arc::new(AtomicU64::new(1)) })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Sends `method` and returns its result.
    pub async fn request(&self, method: &str, params: &Value) -> Result<Value, ReadError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(target: "bridge::fallback", id, method, url = %self.url, "sending read request");

        let body = JsonRpcRequest { jsonrpc: "2.0", id, method, params };
        let response = self
            .client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<JsonRpcResponse>()
            .await?;

        match (response.result, response.error) {
            (_, Some(err)) => {
                Err(ReadError::Remote { code: err.code.code(), message: err.message.into_owned() })
            }
            (Some(result), None) => Ok(result),
            (None, None) => Err(ReadError::Malformed("missing both result and error".to_string())),
        }
    }
}
