//! Bridge errors

use crate::{envelope::RequestId, state::ConnectionState};
use alloy_primitives::ChainId;
use std::time::Duration;

/// Error returned by bridge operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// The signer answered the handshake with an error.
    #[error("signer rejected the connection ({code}): {message}")]
    HandshakeRejected { code: i64, message: String },
    /// The user did not approve the connection in time.
    #[error("connection was not approved within {0:?}")]
    HandshakeTimeout(Duration),
    /// No response arrived for a request in time.
    #[error("request {id} timed out after {timeout:?}")]
    RequestTimeout { id: RequestId, timeout: Duration },
    /// The signer answered a request with an error.
    #[error("signer returned error ({code}): {message}")]
    Remote { code: i64, message: String },
    /// The transport could not reach the signer.
    #[error("signer is unreachable: {0}")]
    TransportUnreachable(String),
    /// The session ended while the request was in flight.
    #[error("session was torn down")]
    SessionTorndown,
    /// The operation requires an active session.
    #[error("wallet is not connected (state: {0})")]
    NotConnected(ConnectionState),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Read(#[from] ReadError),
    /// The signer sent a payload that could not be interpreted.
    #[error("malformed signer payload: {0}")]
    Malformed(String),
    #[error("invalid bridge configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// Returns the remote error code, if the signer produced this error.
    pub const fn remote_code(&self) -> Option<i64> {
        match self {
            Self::HandshakeRejected { code, .. } | Self::Remote { code, .. } => Some(*code),
            Self::Read(ReadError::Remote { code, .. }) => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn malformed(err: impl std::fmt::Display) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<foundry_bridge_config::ConfigError> for BridgeError {
    fn from(err: foundry_bridge_config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Error raised while setting up a transport.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("invalid transport url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to connect to relay: {0}")]
    Connect(String),
    #[error("no transport configured: {0}")]
    NotConfigured(String),
}

/// Error returned by the read-only fallback path.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    #[error("no rpc endpoint available for chain {0}")]
    NoEndpoint(ChainId),
    #[error("`{0}` requires a signer and cannot be served by a read-only endpoint")]
    SigningNotAllowed(String),
    #[error("rpc request failed: {0}")]
    Http(String),
    #[error("rpc endpoint returned error ({code}): {message}")]
    Remote { code: i64, message: String },
    #[error("malformed rpc response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for ReadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() { Self::Malformed(err.to_string()) } else { Self::Http(err.to_string()) }
    }
}

/// Error returned by [`EventDispatcher::pump`](crate::events::EventDispatcher::pump).
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("events can only be dispatched on the thread that owns the dispatcher")]
    OffContext,
}
