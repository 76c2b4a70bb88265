//! Socket relay transport.
//!
//! The relay backend runs in its own task and talks to the transport through a
//! [`RelayHandle`]/[`RelayInterface`] channel pair. Payloads sent before the relay reports
//! `ready` are buffered and flushed in order once it does; a dropped connection is reported as a
//! failure and re-established with exponential backoff.

use super::{
    ApprovalPrompt, ReconnectPolicy, SignalSink, Transport, TransportKind, TransportSignal,
};
use crate::{error::TransportError, session::SessionId};
use parking_lot::Mutex;
use std::{collections::VecDeque, fmt, sync::Arc};
use tokio::{
    sync::{
        mpsc,
        oneshot::{self, error::TryRecvError},
    },
    task::JoinHandle,
};

/// A handle to a relay backend. Communicates with a [`RelayInterface`] on the backend.
///
/// The backend SHOULD shut down when the handle is dropped.
#[derive(Debug)]
pub struct RelayHandle {
    /// Outbound channel to the relay.
    to_relay: mpsc::UnboundedSender<String>,
    /// Inbound frames from the relay.
    from_relay: mpsc::UnboundedReceiver<String>,
    /// Notifies the backend of intentional shutdown.
    shutdown: oneshot::Sender<()>,
}

impl RelayHandle {
    /// Creates a new handle and the interface for its backend.
    pub fn new() -> (Self, RelayInterface) {
        let (to_relay, from_frontend) = mpsc::unbounded_channel();
        let (to_frontend, from_relay) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let handle = Self { to_relay, from_relay, shutdown: shutdown_tx };
        let interface = RelayInterface { from_frontend, to_frontend, shutdown: shutdown_rx };
        (handle, interface)
    }
}

/// The reciprocal of [`RelayHandle`], owned by the backend.
#[derive(Debug)]
pub struct RelayInterface {
    from_frontend: mpsc::UnboundedReceiver<String>,
    to_frontend: mpsc::UnboundedSender<String>,
    shutdown: oneshot::Receiver<()>,
}

impl RelayInterface {
    /// Forwards an inbound frame to the transport. Returns `false` if the transport is gone.
    pub fn send_to_frontend(&self, frame: impl Into<String>) -> bool {
        self.to_frontend.send(frame.into()).is_ok()
    }

    /// Receives the next outbound payload. Returns `None` once the frontend shut down.
    pub async fn recv_from_frontend(&mut self) -> Option<String> {
        match self.shutdown.try_recv() {
            Ok(_) | Err(TryRecvError::Closed) => return None,
            Err(TryRecvError::Empty) => {}
        }
        self.from_frontend.recv().await
    }

    /// Receives an outbound payload if one is already waiting.
    pub fn try_recv_from_frontend(&mut self) -> Option<String> {
        self.from_frontend.try_recv().ok()
    }
}

/// Connection details of a relay backend.
#[async_trait::async_trait]
pub trait RelayConnect: Send + Sync + fmt::Debug + 'static {
    /// Spawns the backend, returning a handle to it.
    async fn connect(&self) -> Result<RelayHandle, TransportError>;

    /// Re-establishes a dropped connection.
    async fn try_reconnect(&self) -> Result<RelayHandle, TransportError> {
        self.connect().await
    }

    /// Pairing uri a second device scans to join `session`.
    fn pairing_uri(&self, session: &SessionId) -> String;
}

/// Transport that talks to the signer through a relay.
pub struct SocketRelayTransport<C> {
    inner: Arc<RelayInner<C>>,
}

struct RelayInner<C> {
    connector: C,
    policy: ReconnectPolicy,
    state: Mutex<RelayState>,
}

#[derive(Default)]
struct RelayState {
    outbound: Option<mpsc::UnboundedSender<String>>,
    shutdown: Option<oneshot::Sender<()>>,
    ready: bool,
    queue: VecDeque<String>,
    task: Option<JoinHandle<()>>,
}

impl<C: RelayConnect> SocketRelayTransport<C> {
    pub fn new(connector: C, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(RelayInner { connector, policy, state: Mutex::new(RelayState::default()) }),
        }
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// Whether the relay reported `ready` on the current connection.
    pub fn is_ready(&self) -> bool {
        self.inner.state.lock().ready
    }

    /// Number of payloads waiting for the relay to become ready.
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}

impl<C: RelayConnect> RelayInner<C> {
    async fn run(self: Arc<Self>, sink: SignalSink) {
        let mut retries = 0u32;
        let mut reconnecting = false;
        loop {
            let handle = if reconnecting {
                self.connector.try_reconnect().await
            } else {
                self.connector.connect().await
            };
            match handle {
                Ok(handle) => {
                    debug!(target: "bridge::transport", connector = ?self.connector, "relay connected");
                    retries = 0;
                    self.serve(handle, &sink).await;
                    sink.emit(TransportSignal::Failure("relay connection closed".to_string()));
                }
                Err(err) => {
                    warn!(target: "bridge::transport", %err, "relay connection failed");
                    sink.emit(TransportSignal::Failure(err.to_string()));
                }
            }

            if sink.is_closed() {
                break;
            }
            if retries >= self.policy.max_retries {
                error!(target: "bridge::transport", retries, "giving up on relay");
                sink.emit(TransportSignal::Unreachable(format!(
                    "relay did not come back after {retries} attempts"
                )));
                break;
            }
            let delay = self.policy.backoff(retries);
            retries += 1;
            reconnecting = true;
            debug!(target: "bridge::transport", ?delay, attempt = retries, "reconnecting to relay");
            tokio::time::sleep(delay).await;
        }
    }

    async fn serve(&self, handle: RelayHandle, sink: &SignalSink) {
        let RelayHandle { to_relay, mut from_relay, shutdown } = handle;
        {
            let mut state = self.state.lock();
            state.outbound = Some(to_relay);
            state.shutdown = Some(shutdown);
            state.ready = false;
        }

        while let Some(frame) = from_relay.recv().await {
            let signal = TransportSignal::from_frame(frame);
            if signal == TransportSignal::Ready {
                self.flush();
            }
            if !sink.emit(signal) {
                break;
            }
        }

        let mut state = self.state.lock();
        state.outbound = None;
        state.shutdown = None;
        state.ready = false;
    }

    /// Marks the relay ready and drains the queue in order.
    fn flush(&self) {
        let mut state = self.state.lock();
        let RelayState { outbound, ready, queue, .. } = &mut *state;
        let Some(tx) = outbound else { return };
        *ready = true;
        let queued = queue.len();
        while let Some(payload) = queue.pop_front() {
            if let Err(err) = tx.send(payload) {
                queue.push_front(err.0);
                *ready = false;
                break;
            }
        }
        trace!(target: "bridge::transport", flushed = queued - queue.len(), "relay ready");
    }
}

#[async_trait::async_trait]
impl<C: RelayConnect> Transport for SocketRelayTransport<C> {
    fn kind(&self) -> TransportKind {
        TransportKind::SocketRelay
    }

    fn initialize(&self, sink: SignalSink) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock();
        if state.task.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }
        state.task = Some(tokio::spawn(self.inner.clone().run(sink)));
        Ok(())
    }

    fn send(&self, payload: String) {
        let mut state = self.inner.state.lock();
        let mut payload = payload;
        if state.ready {
            if let Some(tx) = &state.outbound {
                match tx.send(payload) {
                    Ok(()) => return,
                    Err(err) => payload = err.0,
                }
            }
            state.ready = false;
        }
        state.queue.push_back(payload);
        trace!(target: "bridge::transport", queued = state.queue.len(), "relay not ready, buffering payload");
    }

    fn approval_prompt(&self, session: &SessionId) -> ApprovalPrompt {
        ApprovalPrompt::QrCode { uri: self.inner.connector.pairing_uri(session) }
    }

    async fn teardown(&self) {
        let task = {
            let mut state = self.inner.state.lock();
            state.ready = false;
            state.outbound = None;
            if let Some(shutdown) = state.shutdown.take() {
                let _ = shutdown.send(());
            }
            if !state.queue.is_empty() {
                debug!(target: "bridge::transport", dropped = state.queue.len(), "discarding buffered payloads");
                state.queue.clear();
            }
            state.task.take()
        };
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for SocketRelayTransport<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketRelayTransport")
            .field("connector", &self.inner.connector)
            .field("policy", &self.inner.policy)
            .finish_non_exhaustive()
    }
}
