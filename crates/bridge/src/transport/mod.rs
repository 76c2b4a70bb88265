//! Interchangeable channels to the remote signer.
//!
//! Every transport exposes the same contract: it is initialized with a [`SignalSink`], takes
//! serialized envelopes through [`Transport::send`] without blocking, and reports everything it
//! observes (inbound frames, readiness, failures, overlay and one-time-code prompts) as
//! [`TransportSignal`]s on that sink.

use crate::{envelope::ControlFrame, error::TransportError, session::SessionId};
use foundry_bridge_config::BridgeConfig;
use std::{fmt, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use url::Url;

pub mod deeplink;
pub mod embedded;
pub mod http;
pub mod relay;
pub mod ws;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use deeplink::{DeepLinkTransport, LinkOpener, SystemLinkOpener};
pub use embedded::{EmbeddedRuntimeTransport, ForeignRuntime, RuntimeCallback};
pub use http::HttpTransport;
pub use relay::{RelayConnect, RelayHandle, RelayInterface, SocketRelayTransport};
pub use ws::WsRelayConnector;

/// Which kind of channel a transport uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum TransportKind {
    DeepLink,
    SocketRelay,
    Embedded,
}

/// Everything a transport reports back to the lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportSignal {
    /// The channel is ready to carry requests.
    Ready,
    /// The signer asks for a pairing overlay to be shown.
    ShowOverlay { uri: Option<String> },
    /// The pairing overlay can be hidden.
    HideOverlay,
    /// A one-time code that the user has to confirm on the signer.
    Otp(u32),
    /// A response or notification frame.
    Message(String),
    /// The channel dropped; it may come back.
    Failure(String),
    /// The signer cannot be reached at all; in-flight requests will not be answered.
    Unreachable(String),
    /// The signer ended the session.
    Disconnect,
}

impl TransportSignal {
    /// Classifies a raw inbound frame: control frames map to their signal, anything else is
    /// forwarded as a [`TransportSignal::Message`].
    pub fn from_frame(frame: String) -> Self {
        match serde_json::from_str::<ControlFrame>(&frame) {
            Ok(control) => control.into(),
            Err(_) => Self::Message(frame),
        }
    }
}

impl From<ControlFrame> for TransportSignal {
    fn from(frame: ControlFrame) -> Self {
        match frame {
            ControlFrame::Ready => Self::Ready,
            ControlFrame::ShowOverlay { uri } => Self::ShowOverlay { uri },
            ControlFrame::HideOverlay => Self::HideOverlay,
            ControlFrame::Otp { code } => Self::Otp(code),
            ControlFrame::Failure { reason } => Self::Failure(reason),
            ControlFrame::Disconnect => Self::Disconnect,
        }
    }
}

/// Receiving half of a [`SignalSink`].
pub type SignalStream = mpsc::UnboundedReceiver<TransportSignal>;

/// Where transports deliver their signals. Cheap to clone and usable from any thread.
#[derive(Clone, Debug)]
pub struct SignalSink(mpsc::UnboundedSender<TransportSignal>);

impl SignalSink {
    pub fn channel() -> (Self, SignalStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    /// Delivers a signal, returning `false` if nobody listens anymore.
    pub fn emit(&self, signal: TransportSignal) -> bool {
        self.0.send(signal).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// How the user is asked to approve a new session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApprovalPrompt {
    /// Scan a pairing code that encodes `uri`.
    QrCode { uri: String },
    /// Open the signer app through `url`.
    DeepLink { url: String },
    /// Approval happens in a surface the bridge does not control.
    External,
}

/// A channel to the remote signer.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn kind(&self) -> TransportKind;

    /// Starts the channel, delivering signals to `sink`. Calling it again while the transport is
    /// running is a no-op.
    fn initialize(&self, sink: SignalSink) -> Result<(), TransportError>;

    /// Hands a serialized envelope to the channel. Never blocks; delivery failures surface as
    /// [`TransportSignal::Failure`].
    fn send(&self, payload: String);

    /// How the user approves `session`.
    fn approval_prompt(&self, session: &SessionId) -> ApprovalPrompt;

    /// Stops the channel and releases its resources. The transport can be initialized again.
    async fn teardown(&self);
}

/// Reconnect policy of the socket relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (zero based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff.saturating_mul(1 << attempt.min(16))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_retries: 5, initial_backoff: Duration::from_millis(500) }
    }
}

impl From<&BridgeConfig> for ReconnectPolicy {
    fn from(config: &BridgeConfig) -> Self {
        Self { max_retries: config.relay_max_retries, initial_backoff: config.relay_retry_backoff() }
    }
}

/// Builds the transport described by `config`: a deep link with a relay side channel if both
/// are set, a plain socket relay otherwise.
pub fn from_config(config: &BridgeConfig) -> Result<Arc<dyn Transport>, TransportError> {
    let relay_url = config.relay_url.as_deref().ok_or_else(|| {
        TransportError::NotConfigured("`relay_url` must be set to reach a signer".to_string())
    })?;
    let connector = WsRelayConnector::new(parse_url(relay_url)?);
    let policy = ReconnectPolicy::from(config);

    if let Some(link) = config.deep_link.as_deref() {
        let relay = SocketRelayTransport::new(connector, policy);
        let transport = DeepLinkTransport::new(parse_url(link)?, relay, Arc::new(SystemLinkOpener));
        return Ok(Arc::new(transport));
    }
    Ok(Arc::new(SocketRelayTransport::new(connector, policy)))
}

fn parse_url(url: &str) -> Result<Url, TransportError> {
    Url::parse(url)
        .map_err(|err| TransportError::InvalidUrl { url: url.to_string(), reason: err.to_string() })
}
