use serde::{Deserialize, Serialize};

/// Connection state of the bridge.
///
/// ```text
/// Disconnected ──connect──▶ Connecting ──dispatch──▶ AwaitingApproval ──approve──▶ Connected
///      ▲                       │ (silent resume) ─────────────────────────────────▶ │  ▲
///      │                                                                  transport │  │ ready
///      └──────── end_session (from any state) ◀── DisconnectedWithSession ◀── Paused ┘
/// ```
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
pub enum ConnectionState {
    /// No session, nothing in flight.
    #[default]
    Disconnected,
    /// Transport is being initialized or a persisted session is being resumed.
    Connecting,
    /// The handshake was dispatched and the user has yet to approve it.
    AwaitingApproval,
    /// The signer approved the session.
    Connected,
    /// The transport dropped while connected; the session survives.
    Paused,
    /// The session is persisted but not active.
    DisconnectedWithSession,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected | DisconnectedWithSession, Connecting)
                | (Connecting, AwaitingApproval | Connected)
                | (AwaitingApproval, Connected)
                | (Connected, Paused | DisconnectedWithSession)
                | (Paused, Connected | DisconnectedWithSession)
                | (
                    Connecting | AwaitingApproval | Connected | Paused | DisconnectedWithSession,
                    Disconnected
                )
        )
    }

    /// Whether signing requests may be dispatched.
    pub const fn accepts_requests(self) -> bool {
        matches!(self, Self::Connected | Self::AwaitingApproval)
    }
}
