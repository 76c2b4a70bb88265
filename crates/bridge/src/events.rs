//! Delivery of bridge events to host listeners.
//!
//! Listeners always run on the dispatcher's context thread, the thread that created the
//! [`EventDispatcher`]. Events emitted on that thread are delivered right away; events emitted
//! anywhere else are queued and delivered, in emission order, the next time the host pumps the
//! dispatcher.
//!
//! A [`ListenerRegistration`] removes its listener when unsubscribed. Once `unsubscribe` returns,
//! the listener will not be invoked again, even for events that were already queued.

use crate::{
    envelope::RequestId, error::BridgeError, error::DispatchError, state::ConnectionState,
    transport::ApprovalPrompt,
};
use alloy_primitives::{Address, ChainId};
use parking_lot::Mutex;
use serde_json::Value;
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
};
use strum::EnumDiscriminants;
use tokio::sync::Notify;

/// Everything the bridge reports to the host.
#[derive(Clone, Debug, PartialEq, Eq, EnumDiscriminants)]
#[strum_discriminants(name(EventKind), derive(Hash, strum::Display))]
pub enum BridgeEvent {
    /// The connection state changed.
    StateChanged { from: ConnectionState, to: ConnectionState },
    /// The user has to approve the pending connection.
    ApprovalRequested(ApprovalPrompt),
    /// The signer asks for the pairing overlay.
    OverlayShown { uri: Option<String> },
    OverlayHidden,
    /// A one-time code to confirm on the signer.
    OtpReceived(u32),
    /// The session's active chain changed.
    ChainChanged(ChainId),
    /// The session's active account changed.
    AccountChanged(Option<Address>),
    RequestCompleted { id: RequestId, method: String, result: Value },
    RequestFailed { id: Option<RequestId>, method: String, error: BridgeError },
    /// The transport could not reach the signer.
    TransportUnreachable { reason: String },
    /// The signer refused the connection.
    HandshakeRejected { code: i64, message: String },
}

impl BridgeEvent {
    pub fn kind(&self) -> EventKind {
        EventKind::from(self)
    }
}

type Handler = Box<dyn FnMut(&BridgeEvent) + Send + 'static>;

struct Listener {
    id: u64,
    kind: EventKind,
    active: AtomicBool,
    handler: Mutex<Handler>,
}

struct Shared {
    context: ThreadId,
    next_listener: AtomicU64,
    listeners: Mutex<Vec<Arc<Listener>>>,
    queue: Mutex<VecDeque<BridgeEvent>>,
    draining: AtomicBool,
    torn_down: AtomicBool,
    wake: Notify,
}

impl Shared {
    fn on_context(&self) -> bool {
        thread::current().id() == self.context
    }

    fn emit(&self, event: BridgeEvent) {
        if self.torn_down.load(Ordering::Acquire) {
            trace!(target: "bridge::events", kind = %event.kind(), "dispatcher torn down, dropping event");
            return;
        }
        self.queue.lock().push_back(event);
        if self.on_context() {
            self.drain();
        } else {
            self.wake.notify_one();
        }
    }

    /// Delivers queued events until the queue is empty. Must run on the context thread.
    fn drain(&self) -> usize {
        // an emit from inside a handler is picked up by the outer loop
        if self.draining.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let _guard = DrainGuard(&self.draining);

        let mut delivered = 0;
        loop {
            let Some(event) = self.queue.lock().pop_front() else { break };
            self.deliver(&event);
            delivered += 1;
        }
        delivered
    }

    fn deliver(&self, event: &BridgeEvent) {
        let kind = event.kind();
        let targets: Vec<_> =
            self.listeners.lock().iter().filter(|l| l.kind == kind).cloned().collect();
        for listener in targets {
            let mut handler = listener.handler.lock();
            if !listener.active.load(Ordering::Acquire) {
                continue;
            }
            (handler)(event);
        }
    }

    fn teardown(&self) {
        self.torn_down.store(true, Ordering::Release);
        for listener in self.listeners.lock().drain(..) {
            listener.active.store(false, Ordering::Release);
        }
        let dropped = std::mem::take(&mut *self.queue.lock()).len();
        if dropped > 0 {
            debug!(target: "bridge::events", dropped, "dropped undelivered events");
        }
        self.wake.notify_waiters();
    }
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns listener registrations and delivers events on its context thread.
///
/// Dropping the dispatcher invalidates every registration.
pub struct EventDispatcher {
    shared: Arc<Shared>,
}

impl EventDispatcher {
    /// Creates a dispatcher whose context is the current thread.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                context: thread::current().id(),
                next_listener: AtomicU64::new(1),
                listeners: Mutex::new(Vec::new()),
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                torn_down: AtomicBool::new(false),
                wake: Notify::new(),
            }),
        }
    }

    /// A handle for emitting events from anywhere.
    pub fn sender(&self) -> EventSender {
        EventSender { shared: Arc::clone(&self.shared) }
    }

    pub fn context(&self) -> ThreadId {
        self.shared.context
    }

    /// Registers `handler` for events of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> ListenerRegistration
    where
        F: FnMut(&BridgeEvent) + Send + 'static,
    {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        let listener = Arc::new(Listener {
            id,
            kind,
            active: AtomicBool::new(true),
            handler: Mutex::new(Box::new(handler)),
        });
        let registration = ListenerRegistration {
            id,
            kind,
            shared: Arc::downgrade(&self.shared),
            listener: Arc::downgrade(&listener),
        };
        self.shared.listeners.lock().push(listener);
        trace!(target: "bridge::events", id, %kind, "listener registered");
        registration
    }

    /// Removes a listener. Same as [`ListenerRegistration::unsubscribe`].
    pub fn unsubscribe(&self, registration: &ListenerRegistration) -> bool {
        registration.unsubscribe()
    }

    /// Emits an event; see [`EventSender::emit`].
    pub fn emit(&self, event: BridgeEvent) {
        self.shared.emit(event);
    }

    /// Delivers every queued event, returning how many were delivered.
    pub fn pump(&self) -> Result<usize, DispatchError> {
        if !self.shared.on_context() {
            return Err(DispatchError::OffContext);
        }
        Ok(self.shared.drain())
    }

    /// Waits until events were emitted off the context thread, then delivers them.
    ///
    /// Must be polled on the context thread, e.g. from a current-thread runtime or a `LocalSet`
    /// driven by the host's main loop.
    pub async fn next_batch(&self) -> Result<usize, DispatchError> {
        if self.shared.torn_down.load(Ordering::Acquire) {
            return Ok(0);
        }
        self.shared.wake.notified().await;
        self.pump()
    }

    /// Number of events waiting for the next pump.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners.lock().len()
    }

    /// Drops all listeners and queued events. Later events are discarded.
    pub fn teardown(&self) {
        self.shared.teardown();
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.shared.teardown();
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("context", &self.shared.context)
            .field("listeners", &self.listener_count())
            .field("queued", &self.queued())
            .finish()
    }
}

/// Emits events into a dispatcher. Cheap to clone and usable from any thread.
#[derive(Clone)]
pub struct EventSender {
    shared: Arc<Shared>,
}

impl EventSender {
    /// Delivers `event` immediately when called on the context thread, otherwise queues it for
    /// the next pump.
    pub fn emit(&self, event: BridgeEvent) {
        self.shared.emit(event);
    }
}

impl fmt::Debug for EventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSender").field("context", &self.shared.context).finish()
    }
}

/// Handle to a subscribed listener.
#[derive(Debug)]
#[must_use = "the registration is needed to unsubscribe"]
pub struct ListenerRegistration {
    id: u64,
    kind: EventKind,
    shared: Weak<Shared>,
    listener: Weak<Listener>,
}

impl ListenerRegistration {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Removes the listener. Returns `false` if it was already removed.
    ///
    /// Off the context thread this waits for an invocation of the listener that is in progress to
    /// finish; on the context thread, including from inside a handler, it returns immediately.
    pub fn unsubscribe(&self) -> bool {
        let Some(listener) = self.listener.upgrade() else { return false };
        if !listener.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.listeners.lock().retain(|l| l.id != self.id);
            if !shared.on_context() {
                drop(listener.handler.lock());
            }
        }
        trace!(target: "bridge::events", id = self.id, kind = %self.kind, "listener removed");
        true
    }

    pub fn is_active(&self) -> bool {
        self.listener.upgrade().is_some_and(|l| l.active.load(Ordering::Acquire))
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").field("id", &self.id).field("kind", &self.kind).finish()
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared").field("context", &self.context).finish_non_exhaustive()
    }
}
