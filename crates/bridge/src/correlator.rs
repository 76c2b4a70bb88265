//! Matches asynchronous responses to the requests that caused them.
//!
//! Every outbound request gets a fresh, monotonically increasing [`RequestId`] and a slot in the
//! pending table. A response resolves exactly one slot; anything that arrives for an id that is no
//! longer pending is stale and dropped.

use crate::{
    envelope::{RequestEnvelope, RequestId, ResponseEnvelope, ResponsePayload},
    error::BridgeError,
    state::ConnectionState,
    transport::Transport,
};
use alloy_primitives::ChainId;
use parking_lot::Mutex;
use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tokio::{
    sync::oneshot,
    time::{Instant, timeout_at},
};

type Outcome = Result<Value, BridgeError>;

/// A request waiting for its response.
struct PendingRequest {
    method: String,
    /// Serialized envelope as handed to the transport.
    payload: String,
    created_at: Instant,
    tx: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct PendingTable {
    accepting: bool,
    /// Why the table stopped accepting requests.
    closed_with: Option<BridgeError>,
    next_id: RequestId,
    requests: HashMap<RequestId, PendingRequest>,
}

/// A request to hand to [`RequestCorrelator::dispatch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: String,
    pub params: Value,
    pub chain_id: Option<ChainId>,
    pub timeout: Option<Duration>,
}

impl OutboundRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self { method: method.into(), params, chain_id: None, timeout: None }
    }

    pub fn with_chain_id(mut self, chain_id: Option<ChainId>) -> Self {
        self.chain_id = chain_id;
        self
    }

    /// Overrides the correlator's default timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What happened to an inbound response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The response completed the pending request for `method`.
    Delivered { method: String },
    /// The request was already resolved, timed out or torn down.
    Stale,
    /// The id was never handed out.
    Unknown,
}

/// Correlates responses with pending requests.
#[derive(Clone)]
pub struct RequestCorrelator {
    inner: Arc<CorrelatorInner>,
}

struct CorrelatorInner {
    transport: Arc<dyn Transport>,
    default_timeout: Duration,
    table: Mutex<PendingTable>,
}

impl RequestCorrelator {
    pub fn new(transport: Arc<dyn Transport>, default_timeout: Duration) -> Self {
        let table = PendingTable { next_id: 1, ..Default::default() };
        Self { inner: Arc::new(CorrelatorInner { transport, default_timeout, table: Mutex::new(table) }) }
    }

    /// Starts accepting requests. Ids continue from `sequence` if it is ahead of the current one.
    pub fn open(&self, sequence: RequestId) {
        let mut table = self.inner.table.lock();
        table.accepting = true;
        table.closed_with = None;
        table.next_id = table.next_id.max(sequence);
    }

    /// Stops accepting requests and fails everything in flight with `reason`.
    ///
    /// All pending requests are removed in one step, so none of them can be resolved afterwards.
    pub fn close(&self, reason: BridgeError) -> usize {
        let drained: Vec<_> = {
            let mut table = self.inner.table.lock();
            table.accepting = false;
            table.closed_with = Some(reason.clone());
            table.requests.drain().collect()
        };
        let count = drained.len();
        for (id, pending) in drained {
            trace!(target: "bridge::correlator", id, method = %pending.method, %reason, "failing pending request");
            let _ = pending.tx.send(Err(reason.clone()));
        }
        if count > 0 {
            debug!(target: "bridge::correlator", count, %reason, "failed pending requests");
        }
        count
    }

    pub fn is_open(&self) -> bool {
        self.inner.table.lock().accepting
    }

    /// The id the next request will get.
    pub fn next_id(&self) -> RequestId {
        self.inner.table.lock().next_id
    }

    pub fn pending_count(&self) -> usize {
        self.inner.table.lock().requests.len()
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.inner.table.lock().requests.contains_key(&id)
    }

    /// The serialized envelope of a pending request.
    pub fn pending_payload(&self, id: RequestId) -> Option<String> {
        self.inner.table.lock().requests.get(&id).map(|pending| pending.payload.clone())
    }

    /// Registers and sends a request, returning a handle to await its response.
    ///
    /// The request is in the pending table before the transport sees it, so a response can never
    /// overtake its registration.
    pub fn dispatch(&self, request: OutboundRequest) -> Result<PendingResponse, BridgeError> {
        let OutboundRequest { method, params, chain_id, timeout } = request;
        let timeout = timeout.unwrap_or(self.inner.default_timeout);

        let mut table = self.inner.table.lock();
        if !table.accepting {
            return Err(table
                .closed_with
                .clone()
                .unwrap_or(BridgeError::NotConnected(ConnectionState::Disconnected)));
        }

        let id = table.next_id;
        table.next_id += 1;

        let envelope = RequestEnvelope { request_id: id, method: method.clone(), params, chain_id };
        let payload = serde_json::to_string(&envelope).map_err(BridgeError::malformed)?;

        let (tx, rx) = oneshot::channel();
        let created_at = Instant::now();
        table.requests.insert(
            id,
            PendingRequest { method: method.clone(), payload: payload.clone(), created_at, tx },
        );
        trace!(target: "bridge::correlator", id, %method, "dispatching request");
        self.inner.transport.send(payload);
        drop(table);

        Ok(PendingResponse {
            id,
            timeout,
            deadline: created_at + timeout,
            rx,
            correlator: self.clone(),
        })
    }

    /// Dispatches a request and waits for its response.
    pub async fn request(&self, request: OutboundRequest) -> Result<Value, BridgeError> {
        self.dispatch(request)?.response().await
    }

    /// Routes a response to its pending request.
    pub fn resolve(&self, response: ResponseEnvelope) -> Resolution {
        let ResponseEnvelope { request_id, payload } = response;
        let pending = {
            let mut table = self.inner.table.lock();
            match table.requests.remove(&request_id) {
                Some(pending) => pending,
                None if request_id < table.next_id => {
                    debug!(target: "bridge::correlator", id = request_id, "dropping stale response");
                    return Resolution::Stale;
                }
                None => {
                    warn!(target: "bridge::correlator", id = request_id, "response for unknown request");
                    return Resolution::Unknown;
                }
            }
        };

        let outcome = match payload {
            ResponsePayload::Success(result) => Ok(result),
            ResponsePayload::Error(err) => {
                Err(BridgeError::Remote { code: err.code.code(), message: err.message.into_owned() })
            }
        };
        trace!(
            target: "bridge::correlator",
            id = request_id,
            method = %pending.method,
            elapsed = ?pending.created_at.elapsed(),
            ok = outcome.is_ok(),
            "resolved request"
        );
        // the caller may have stopped waiting
        let _ = pending.tx.send(outcome);
        Resolution::Delivered { method: pending.method }
    }

    fn forget(&self, id: RequestId) {
        self.inner.table.lock().requests.remove(&id);
    }
}

impl fmt::Debug for RequestCorrelator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.inner.table.lock();
        f.debug_struct("RequestCorrelator")
            .field("accepting", &table.accepting)
            .field("next_id", &table.next_id)
            .field("pending", &table.requests.len())
            .finish()
    }
}

/// Handle to a dispatched request.
///
/// Dropping it removes the request from the pending table; a late response is then stale.
#[must_use = "the request is abandoned when the handle is dropped"]
pub struct PendingResponse {
    id: RequestId,
    timeout: Duration,
    deadline: Instant,
    rx: oneshot::Receiver<Outcome>,
    correlator: RequestCorrelator,
}

impl PendingResponse {
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// Waits for the response until the request's deadline.
    pub async fn response(mut self) -> Result<Value, BridgeError> {
        match timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BridgeError::SessionTorndown),
            Err(_) => {
                debug!(target: "bridge::correlator", id = self.id, timeout = ?self.timeout, "request timed out");
                Err(BridgeError::RequestTimeout { id: self.id, timeout: self.timeout })
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.correlator.forget(self.id);
    }
}

impl fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponse").field("id", &self.id).field("timeout", &self.timeout).finish()
    }
}
