//! Connection state machine.
//!
//! The lifecycle owns the transport, the request correlator and the session. It drives the
//! handshake (or silent resumption of a persisted session), applies everything the transport
//! reports, and gates signing requests on the connection state.

use crate::{
    correlator::{OutboundRequest, RequestCorrelator},
    envelope::{
        HANDSHAKE_METHOD, InboundFrame, RESUME_METHOD, SWITCH_CHAIN_METHOD, SignerNotification,
        parse_chain_id,
    },
    error::BridgeError,
    events::{BridgeEvent, EventSender},
    session::{HandshakeApproval, Session, SessionStore},
    state::ConnectionState,
    transport::{SignalSink, SignalStream, Transport, TransportSignal},
};
use alloy_primitives::{Address, ChainId};
use foundry_bridge_config::BridgeConfig;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde_json::{Value, json};
use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::{mpsc, watch};

/// Lifecycle settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Chain a new session is opened on.
    pub chain_id: ChainId,
    /// Whether the session is persisted across restarts.
    pub persist_session: bool,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

impl From<&BridgeConfig> for LifecycleConfig {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            chain_id: config.chain_id,
            persist_session: config.persist_session,
            handshake_timeout: config.handshake_timeout(),
            request_timeout: config.request_timeout(),
        }
    }
}

type Handshake = Shared<BoxFuture<'static, Result<Session, BridgeError>>>;

/// Drives the connection to the remote signer.
#[derive(Clone)]
pub struct ConnectionLifecycle {
    inner: Arc<Inner>,
}

struct Inner {
    config: LifecycleConfig,
    transport: Arc<dyn Transport>,
    correlator: RequestCorrelator,
    store: Arc<dyn SessionStore>,
    events: EventSender,
    sink: SignalSink,
    state: watch::Sender<ConnectionState>,
    /// Serializes state transitions with their events.
    transitions: ReentrantMutex<()>,
    session: RwLock<Option<Session>>,
    handshake: Mutex<Option<Handshake>>,
    /// Serializes chain switches and signer notifications.
    mutation: tokio::sync::Mutex<()>,
    notifications: mpsc::UnboundedSender<SignerNotification>,
}

impl ConnectionLifecycle {
    /// Creates the lifecycle and starts processing transport signals.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        config: LifecycleConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn SessionStore>,
        events: EventSender,
    ) -> Self {
        let (sink, signals) = SignalSink::channel();
        let correlator = RequestCorrelator::new(Arc::clone(&transport), config.request_timeout);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (notifications, notifications_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            transport,
            correlator,
            store,
            events,
            sink,
            state,
            transitions: ReentrantMutex::new(()),
            session: RwLock::new(None),
            handshake: Mutex::new(None),
            mutation: tokio::sync::Mutex::new(()),
            notifications,
        });
        tokio::spawn(Inner::process_signals(Arc::downgrade(&inner), signals));
        tokio::spawn(Inner::process_notifications(Arc::downgrade(&inner), notifications_rx));
        Self { inner }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watches state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// The current session, if one exists.
    pub fn session(&self) -> Option<Session> {
        self.inner.session.read().clone()
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.inner.config
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.inner.correlator
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Establishes a session, resuming a persisted one when possible.
    ///
    /// Returns the existing session if already connected. A paused session restarts its
    /// transport if it has given up reconnecting. Concurrent callers share a single handshake and
    /// observe the same result.
    pub async fn connect(&self) -> Result<Session, BridgeError> {
        let handshake = {
            let mut slot = self.inner.handshake.lock();
            let state = self.state();
            if matches!(state, ConnectionState::Connected | ConnectionState::Paused) {
                if let Some(session) = self.session() {
                    if state == ConnectionState::Paused {
                        self.inner.reopen_transport();
                    }
                    return Ok(session);
                }
            }
            let running = slot.as_ref().filter(|handshake| handshake.peek().is_none()).cloned();
            match running {
                Some(handshake) => {
                    trace!(target: "bridge::lifecycle", "joining handshake in progress");
                    handshake
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let task = tokio::spawn(inner.negotiate());
                    let handshake = async move {
                        task.await.unwrap_or_else(|err| {
                            Err(BridgeError::TransportUnreachable(format!(
                                "handshake task failed: {err}"
                            )))
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(handshake.clone());
                    handshake
                }
            }
        };
        handshake.await
    }

    /// Leaves the session.
    ///
    /// With `end_session` the session is destroyed, see [`end_session`](Self::end_session).
    /// Otherwise it is persisted (if enabled) so the next [`connect`](Self::connect) can resume
    /// it. In-flight requests fail with [`BridgeError::SessionTorndown`] either way.
    pub async fn disconnect(&self, end_session: bool) -> ConnectionState {
        if end_session {
            return self.end_session().await;
        }
        let inner = &self.inner;
        match self.state() {
            ConnectionState::Connected | ConnectionState::Paused => {
                {
                    let _lock = inner.transitions.lock();
                    inner.correlator.close(BridgeError::SessionTorndown);
                    let target = if inner.config.persist_session {
                        inner.persist();
                        ConnectionState::DisconnectedWithSession
                    } else {
                        inner.session.write().take();
                        inner.delete_persisted();
                        ConnectionState::Disconnected
                    };
                    inner.transition_from(
                        &[ConnectionState::Connected, ConnectionState::Paused],
                        target,
                    );
                }
                inner.transport.teardown().await;
            }
            ConnectionState::Connecting | ConnectionState::AwaitingApproval => {
                // nothing was approved yet, so there is nothing to keep
                inner.handshake.lock().take();
                {
                    let _lock = inner.transitions.lock();
                    inner.correlator.close(BridgeError::SessionTorndown);
                    inner.transition(ConnectionState::Disconnected);
                }
                inner.transport.teardown().await;
            }
            ConnectionState::Disconnected | ConnectionState::DisconnectedWithSession => {}
        }
        info!(target: "bridge::lifecycle", state = %self.state(), "disconnected");
        self.state()
    }

    /// Destroys the session from any state.
    ///
    /// Every in-flight request fails with [`BridgeError::SessionTorndown`], the persisted session
    /// is deleted and the state becomes [`ConnectionState::Disconnected`].
    pub async fn end_session(&self) -> ConnectionState {
        self.inner.end_session().await;
        self.state()
    }

    /// Switches the signer to `chain_id`. A no-op if the session is already on it.
    pub async fn switch_chain(&self, chain_id: ChainId) -> Result<(), BridgeError> {
        let _guard = self.inner.mutation.lock().await;

        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(BridgeError::NotConnected(state));
        }
        if self.session().is_some_and(|session| session.chain_id == chain_id) {
            return Ok(());
        }

        let params = json!([{ "chainId": format!("{chain_id:#x}") }]);
        self.request(SWITCH_CHAIN_METHOD, params, None).await?;
        self.inner.apply_chain(chain_id);
        Ok(())
    }

    /// Sends a signing request to the signer and waits for its result.
    ///
    /// Fails with [`BridgeError::NotConnected`] unless the state is `Connected` or
    /// `AwaitingApproval`.
    pub async fn request(
        &self,
        method: impl Into<String>,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        let method = method.into();
        let inner = &self.inner;

        let dispatched = {
            let state = self.state();
            if state.accepts_requests() {
                let chain_id = inner.session.read().as_ref().map(|session| session.chain_id);
                let mut request =
                    OutboundRequest::new(method.clone(), params).with_chain_id(chain_id);
                request.timeout = timeout;
                inner.correlator.dispatch(request)
            } else {
                Err(BridgeError::NotConnected(state))
            }
        };
        let pending = match dispatched {
            Ok(pending) => pending,
            Err(error) => {
                inner.events.emit(BridgeEvent::RequestFailed { id: None, method, error: error.clone() });
                return Err(error);
            }
        };

        let id = pending.id();
        match pending.response().await {
            Ok(result) => {
                inner.events.emit(BridgeEvent::RequestCompleted {
                    id,
                    method,
                    result: result.clone(),
                });
                Ok(result)
            }
            Err(error) => {
                debug!(target: "bridge::lifecycle", id, %method, %error, "request failed");
                inner.events.emit(BridgeEvent::RequestFailed {
                    id: Some(id),
                    method,
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Moves to `to` if the current state is one of `from` and the move is legal.
    fn transition_from(&self, from: &[ConnectionState], to: ConnectionState) -> bool {
        let _lock = self.transitions.lock();
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if from.contains(state) && state.can_transition_to(to) {
                previous = Some(*state);
                *state = to;
                true
            } else {
                false
            }
        });
        let Some(from) = previous else { return false };
        debug!(target: "bridge::lifecycle", %from, %to, "state transition");
        self.events.emit(BridgeEvent::StateChanged { from, to });
        true
    }

    /// Moves to `to` from whatever state allows it.
    fn transition(&self, to: ConnectionState) -> bool {
        let current = self.state();
        self.transition_from(&[current], to)
    }

    async fn negotiate(self: Arc<Self>) -> Result<Session, BridgeError> {
        if !self.transition_from(
            &[ConnectionState::Disconnected, ConnectionState::DisconnectedWithSession],
            ConnectionState::Connecting,
        ) {
            return Err(BridgeError::NotConnected(self.state()));
        }

        if let Err(err) = self.transport.initialize(self.sink.clone()) {
            warn!(target: "bridge::lifecycle", %err, "failed to initialize transport");
            self.transition_from(&[ConnectionState::Connecting], ConnectionState::Disconnected);
            return Err(err.into());
        }

        let persisted = self.load_persisted();
        {
            // the correlator is closed under the same lock when the session is torn down
            let _lock = self.transitions.lock();
            if self.state() != ConnectionState::Connecting {
                return Err(BridgeError::SessionTorndown);
            }
            self.correlator.open(persisted.as_ref().map_or(1, |session| session.sequence.max(1)));
        }

        if let Some(session) = persisted.filter(Session::is_resumable) {
            match self.resume(session).await {
                Ok(session) => return Ok(session),
                Err(BridgeError::SessionTorndown) => return Err(BridgeError::SessionTorndown),
                Err(err) => {
                    debug!(target: "bridge::lifecycle", %err, "silent resumption failed, starting a new handshake");
                    self.delete_persisted();
                    if self.state() != ConnectionState::Connecting {
                        return Err(err);
                    }
                }
            }
        }

        self.handshake().await
    }

    async fn resume(&self, session: Session) -> Result<Session, BridgeError> {
        info!(target: "bridge::lifecycle", session = %session.id, "resuming persisted session");
        let request = OutboundRequest::new(
            RESUME_METHOD,
            json!({ "sessionId": session.id, "chainId": session.chain_id }),
        )
        .with_chain_id(Some(session.chain_id))
        .with_timeout(self.config.handshake_timeout);
        let approval = self.correlator.request(request).await?;
        let approval: HandshakeApproval =
            serde_json::from_value(approval).map_err(BridgeError::malformed)?;
        if approval.accounts.is_empty() {
            return Err(BridgeError::Malformed("resumed session has no account".to_string()));
        }
        self.activate(session.approved(approval), ConnectionState::Connecting)
    }

    async fn handshake(&self) -> Result<Session, BridgeError> {
        let session = Session::new(self.config.chain_id);
        info!(target: "bridge::lifecycle", session = %session.id, chain_id = session.chain_id, "requesting connection approval");

        let request = OutboundRequest::new(
            HANDSHAKE_METHOD,
            json!({ "sessionId": session.id, "chainId": session.chain_id }),
        )
        .with_chain_id(Some(session.chain_id))
        .with_timeout(self.config.handshake_timeout);
        let pending = match self.correlator.dispatch(request) {
            Ok(pending) => pending,
            Err(err) => return Err(self.abort_handshake(err).await),
        };

        if !self.transition_from(&[ConnectionState::Connecting], ConnectionState::AwaitingApproval)
        {
            return Err(BridgeError::SessionTorndown);
        }
        self.events.emit(BridgeEvent::ApprovalRequested(self.transport.approval_prompt(&session.id)));

        let approval = match pending.response().await {
            Ok(approval) => approval,
            Err(err) => return Err(self.abort_handshake(err).await),
        };
        let approval: HandshakeApproval = match serde_json::from_value(approval) {
            Ok(approval) => approval,
            Err(err) => return Err(self.abort_handshake(BridgeError::malformed(err)).await),
        };
        self.activate(session.approved(approval), ConnectionState::AwaitingApproval)
    }

    /// Fails the handshake, returning the error connect callers observe.
    async fn abort_handshake(&self, err: BridgeError) -> BridgeError {
        let err = match err {
            BridgeError::Remote { code, message } => {
                self.events.emit(BridgeEvent::HandshakeRejected { code, message: message.clone() });
                BridgeError::HandshakeRejected { code, message }
            }
            BridgeError::RequestTimeout { .. } => {
                BridgeError::HandshakeTimeout(self.config.handshake_timeout)
            }
            err => err,
        };
        warn!(target: "bridge::lifecycle", %err, "handshake failed");

        if self.transition_from(
            &[ConnectionState::Connecting, ConnectionState::AwaitingApproval],
            ConnectionState::Disconnected,
        ) {
            self.correlator.close(err.clone());
            self.transport.teardown().await;
        }
        err
    }

    /// Installs an approved session and moves to `Connected`.
    fn activate(&self, session: Session, from: ConnectionState) -> Result<Session, BridgeError> {
        *self.session.write() = Some(session.clone());
        if !self.transition_from(&[from], ConnectionState::Connected) {
            // torn down while waiting for approval
            self.session.write().take();
            return Err(BridgeError::SessionTorndown);
        }
        info!(target: "bridge::lifecycle", session = %session.id, account = ?session.account, chain_id = session.chain_id, "connected");
        self.persist();
        self.events.emit(BridgeEvent::AccountChanged(session.account));
        self.events.emit(BridgeEvent::ChainChanged(session.chain_id));
        Ok(session)
    }

    async fn end_session(&self) {
        let failed = self.close_session();
        self.transport.teardown().await;
        info!(target: "bridge::lifecycle", failed, "session ended");
    }

    /// Forgets the session and stops the correlator, returning the number of failed requests.
    fn close_session(&self) -> usize {
        self.handshake.lock().take();
        let _lock = self.transitions.lock();
        let failed = self.correlator.close(BridgeError::SessionTorndown);
        self.session.write().take();
        self.delete_persisted();
        self.transition(ConnectionState::Disconnected);
        failed
    }

    /// Restarts a transport that gave up reconnecting. A no-op while it is still trying.
    fn reopen_transport(&self) {
        debug!(target: "bridge::lifecycle", "reopening paused transport");
        if let Err(err) = self.transport.initialize(self.sink.clone()) {
            warn!(target: "bridge::lifecycle", %err, "failed to reopen transport");
        }
    }

    async fn process_signals(inner: Weak<Self>, mut signals: SignalStream) {
        while let Some(signal) = signals.recv().await {
            let Some(inner) = inner.upgrade() else { break };
            inner.on_signal(signal).await;
        }
        trace!(target: "bridge::lifecycle", "signal processing stopped");
    }

    /// Applies signer notifications one at a time, after any chain switch in progress.
    async fn process_notifications(
        inner: Weak<Self>,
        mut notifications: mpsc::UnboundedReceiver<SignerNotification>,
    ) {
        while let Some(notification) = notifications.recv().await {
            let Some(inner) = inner.upgrade() else { break };
            let _guard = inner.mutation.lock().await;
            inner.on_notification(notification);
        }
    }

    async fn on_signal(&self, signal: TransportSignal) {
        match signal {
            TransportSignal::Message(frame) => self.on_frame(&frame),
            TransportSignal::Ready => {
                if self.transition_from(&[ConnectionState::Paused], ConnectionState::Connected) {
                    info!(target: "bridge::lifecycle", "transport restored");
                }
            }
            TransportSignal::Failure(reason) => self.on_failure(reason, false).await,
            TransportSignal::Unreachable(reason) => self.on_failure(reason, true).await,
            TransportSignal::ShowOverlay { uri } => {
                self.events.emit(BridgeEvent::OverlayShown { uri });
            }
            TransportSignal::HideOverlay => self.events.emit(BridgeEvent::OverlayHidden),
            TransportSignal::Otp(code) => self.events.emit(BridgeEvent::OtpReceived(code)),
            TransportSignal::Disconnect => {
                info!(target: "bridge::lifecycle", "signer ended the session");
                self.end_session().await;
            }
        }
    }

    async fn on_failure(&self, reason: String, unreachable: bool) {
        let state = self.state();
        match state {
            ConnectionState::Connecting | ConnectionState::AwaitingApproval if unreachable => {
                self.events.emit(BridgeEvent::TransportUnreachable { reason: reason.clone() });
                self.abort_handshake(BridgeError::TransportUnreachable(reason)).await;
            }
            ConnectionState::Connected | ConnectionState::Paused => {
                // in-flight requests stay pending until their own timeout. A drop always arrives
                // as a failure first, so unreachable alone leaves the state as it is.
                if !unreachable
                    && self.transition_from(&[ConnectionState::Connected], ConnectionState::Paused)
                {
                    warn!(target: "bridge::lifecycle", %reason, "transport dropped, session paused");
                }
                self.events.emit(BridgeEvent::TransportUnreachable { reason });
            }
            _ => {
                debug!(target: "bridge::lifecycle", %reason, %state, "transport failure");
            }
        }
    }

    fn on_frame(&self, frame: &str) {
        match InboundFrame::parse(frame) {
            Ok(InboundFrame::Response(response)) => {
                self.correlator.resolve(response);
            }
            Ok(InboundFrame::Notification(notification)) => {
                let _ = self.notifications.send(notification);
            }
            Err(err) => {
                warn!(target: "bridge::lifecycle", %err, "discarding malformed frame");
            }
        }
    }

    fn on_notification(&self, notification: SignerNotification) {
        match notification.method.as_str() {
            "accountsChanged" => {
                match serde_json::from_value::<Vec<Address>>(notification.params) {
                    Ok(accounts) => self.apply_account(accounts.first().copied()),
                    Err(err) => {
                        warn!(target: "bridge::lifecycle", %err, "malformed accountsChanged");
                    }
                }
            }
            "chainChanged" => match parse_chain_id(&notification.params) {
                Some(chain_id) => self.apply_chain(chain_id),
                None => warn!(target: "bridge::lifecycle", params = %notification.params, "malformed chainChanged"),
            },
            method => {
                debug!(target: "bridge::lifecycle", method, "ignoring notification");
            }
        }
    }

    fn apply_chain(&self, chain_id: ChainId) {
        {
            let mut session = self.session.write();
            let Some(session) = session.as_mut() else { return };
            if session.chain_id == chain_id {
                return;
            }
            session.chain_id = chain_id;
        }
        info!(target: "bridge::lifecycle", chain_id, "chain changed");
        self.persist();
        self.events.emit(BridgeEvent::ChainChanged(chain_id));
    }

    fn apply_account(&self, account: Option<Address>) {
        {
            let mut session = self.session.write();
            let Some(session) = session.as_mut() else { return };
            if session.account == account {
                return;
            }
            session.account = account;
        }
        info!(target: "bridge::lifecycle", ?account, "account changed");
        self.persist();
        self.events.emit(BridgeEvent::AccountChanged(account));
    }

    fn load_persisted(&self) -> Option<Session> {
        let blob = match self.store.load() {
            Ok(blob) => blob?,
            Err(err) => {
                warn!(target: "bridge::lifecycle", %err, "failed to load persisted session");
                return None;
            }
        };
        match Session::from_blob(&blob) {
            Ok(session) => Some(session),
            Err(err) => {
                warn!(target: "bridge::lifecycle", %err, "discarding unreadable persisted session");
                self.delete_persisted();
                None
            }
        }
    }

    fn persist(&self) {
        if !self.config.persist_session {
            return;
        }
        let Some(mut session) = self.session.read().clone() else { return };
        session.sequence = self.correlator.next_id();
        let result = session.to_blob().map_err(Into::into).and_then(|blob| self.store.save(&blob));
        if let Err(err) = result {
            warn!(target: "bridge::lifecycle", %err, "failed to persist session");
        }
    }

    fn delete_persisted(&self) {
        if let Err(err) = self.store.delete() {
            warn!(target: "bridge::lifecycle", %err, "failed to delete persisted session");
        }
    }
}

impl fmt::Debug for ConnectionLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLifecycle")
            .field("state", &self.state())
            .field("session", &self.session())
            .field("transport", &self.inner.transport)
            .field("correlator", &self.inner.correlator)
            .finish_non_exhaustive()
    }
}
