//! Transport backed by a foreign runtime embedded in the host process, such as a web view or a
//! script engine that speaks to the signer on our behalf.
//!
//! The runtime answers through a [`RuntimeCallback`] which may be invoked from any thread. The
//! callback only enqueues; a worker task interprets replies and forwards them as signals.

use super::{ApprovalPrompt, SignalSink, Transport, TransportKind, TransportSignal};
use crate::{
    envelope::{RequestId, ResponseEnvelope, RpcError},
    error::TransportError,
    session::SessionId,
};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};

/// A runtime that executes requests outside of Rust.
pub trait ForeignRuntime: Send + Sync + fmt::Debug + 'static {
    /// Boots the runtime. Replies are handed to `callback`.
    fn start(&self, callback: RuntimeCallback) -> Result<(), TransportError>;

    /// Passes a serialized request envelope to the runtime. Must return promptly.
    fn invoke(&self, payload: &str);

    /// Shuts the runtime down.
    fn terminate(&self);
}

/// Entry point for replies coming out of a [`ForeignRuntime`]. Safe to call from any thread.
#[derive(Clone, Debug)]
pub struct RuntimeCallback {
    replies: mpsc::UnboundedSender<RuntimeReply>,
}

#[derive(Debug)]
enum RuntimeReply {
    Frame(String),
    Rejected { request_id: Option<RequestId>, error: RpcError },
    Crashed(String),
}

impl RuntimeCallback {
    /// Delivers a response, notification or control frame produced by the runtime.
    pub fn deliver(&self, frame: impl Into<String>) -> bool {
        self.replies.send(RuntimeReply::Frame(frame.into())).is_ok()
    }

    /// Reports that the runtime could not serve the request `request_id`.
    pub fn reject(&self, request_id: Option<RequestId>, error: RpcError) -> bool {
        self.replies.send(RuntimeReply::Rejected { request_id, error }).is_ok()
    }

    /// Reports that the runtime itself failed.
    pub fn crashed(&self, reason: impl Into<String>) -> bool {
        self.replies.send(RuntimeReply::Crashed(reason.into())).is_ok()
    }
}

/// Transport that forwards requests to a [`ForeignRuntime`].
pub struct EmbeddedRuntimeTransport<R> {
    runtime: Arc<R>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<R: ForeignRuntime> EmbeddedRuntimeTransport<R> {
    pub fn new(runtime: R) -> Self {
        Self { runtime: Arc::new(runtime), worker: Mutex::new(None) }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }
}

async fn interpret(mut replies: mpsc::UnboundedReceiver<RuntimeReply>, sink: SignalSink) {
    while let Some(reply) = replies.recv().await {
        let signal = match reply {
            RuntimeReply::Frame(frame) => TransportSignal::from_frame(frame),
            RuntimeReply::Rejected { request_id: Some(id), error } => {
                // turn it into a regular error response so the request resolves
                match serde_json::to_string(&ResponseEnvelope::error(id, error)) {
                    Ok(frame) => TransportSignal::Message(frame),
                    Err(err) => TransportSignal::Failure(err.to_string()),
                }
            }
            RuntimeReply::Rejected { request_id: None, error } => {
                warn!(target: "bridge::transport", %error, "runtime rejected an unidentified request");
                continue;
            }
            RuntimeReply::Crashed(reason) => TransportSignal::Unreachable(reason),
        };
        if !sink.emit(signal) {
            break;
        }
    }
}

#[async_trait::async_trait]
impl<R: ForeignRuntime> Transport for EmbeddedRuntimeTransport<R> {
    fn kind(&self) -> TransportKind {
        TransportKind::Embedded
    }

    fn initialize(&self, sink: SignalSink) -> Result<(), TransportError> {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }
        let (replies, rx) = mpsc::unbounded_channel();
        self.runtime.start(RuntimeCallback { replies })?;
        *worker = Some(tokio::spawn(interpret(rx, sink)));
        Ok(())
    }

    fn send(&self, payload: String) {
        if self.worker.lock().is_none() {
            warn!(target: "bridge::transport", "embedded runtime is not running, dropping payload");
            return;
        }
        self.runtime.invoke(&payload);
    }

    fn approval_prompt(&self, _session: &SessionId) -> ApprovalPrompt {
        ApprovalPrompt::External
    }

    async fn teardown(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            self.runtime.terminate();
            worker.abort();
            let _ = worker.await;
        }
    }
}

impl<R: fmt::Debug> fmt::Debug for EmbeddedRuntimeTransport<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedRuntimeTransport").field("runtime", &self.runtime).finish()
    }
}
