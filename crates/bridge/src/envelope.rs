//! Wire envelopes exchanged with the remote signer.
//!
//! Outbound requests carry a correlation id (`requestId`); the signer echoes it on the response.
//! Frames without a `requestId` are notifications pushed by the signer.

use alloy_primitives::ChainId;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};
use serde_json::Value;
use std::{borrow::Cow, fmt};

/// Correlation id of a request. Never reused within a session.
pub type RequestId = u64;

/// Method that asks the signer to approve a new session.
pub const HANDSHAKE_METHOD: &str = "eth_requestAccounts";

/// Method that silently re-establishes a persisted session.
pub const RESUME_METHOD: &str = "wallet_resumeSession";

/// Method that switches the signer's active chain.
pub const SWITCH_CHAIN_METHOD: &str = "wallet_switchEthereumChain";

/// Outbound request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub request_id: RequestId,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<ChainId>,
}

/// Response to a [`RequestEnvelope`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawResponse", into = "RawResponse")]
pub struct ResponseEnvelope {
    pub request_id: RequestId,
    pub payload: ResponsePayload,
}

impl ResponseEnvelope {
    /// A successful response.
    pub fn success(request_id: RequestId, result: Value) -> Self {
        Self { request_id, payload: ResponsePayload::Success(result) }
    }

    /// An error response.
    pub fn error(request_id: RequestId, error: RpcError) -> Self {
        Self { request_id, payload: ResponsePayload::Error(error) }
    }
}

/// Outcome carried by a response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponsePayload {
    Success(Value),
    Error(RpcError),
}

/// Wire representation of a response; `result: null` is a valid success.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResponse {
    request_id: RequestId,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

/// Distinguishes an explicit `null` from an absent field.
pub(crate) fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<RawResponse> for ResponseEnvelope {
    type Error = String;

    fn try_from(raw: RawResponse) -> Result<Self, Self::Error> {
        let payload = match (raw.result, raw.error) {
            (_, Some(error)) => ResponsePayload::Error(error),
            (Some(result), None) => ResponsePayload::Success(result),
            (None, None) => {
                return Err(format!("response {} has neither result nor error", raw.request_id));
            }
        };
        Ok(Self { request_id: raw.request_id, payload })
    }
}

impl From<ResponseEnvelope> for RawResponse {
    fn from(envelope: ResponseEnvelope) -> Self {
        let (result, error) = match envelope.payload {
            ResponsePayload::Success(result) => (Some(result), None),
            ResponsePayload::Error(error) => (None, Some(error)),
        };
        Self { request_id: envelope.request_id, result, error }
    }
}

/// Notification pushed by the signer, e.g. `accountsChanged`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerNotification {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// A message frame received from the signer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundFrame {
    Response(ResponseEnvelope),
    Notification(SignerNotification),
}

impl InboundFrame {
    /// Classifies a raw text frame.
    pub fn parse(frame: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(frame)?;
        if value.get("requestId").is_some() {
            serde_json::from_value(value).map(Self::Response)
        } else if value.get("method").is_some() {
            serde_json::from_value(value).map(Self::Notification)
        } else {
            Err(serde_json::Error::custom("frame is neither a response nor a notification"))
        }
    }
}

/// Control frame emitted by relays and foreign runtimes, distinguished by its `event` tag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlFrame {
    Ready,
    ShowOverlay {
        #[serde(default)]
        uri: Option<String>,
    },
    HideOverlay,
    Otp {
        code: u32,
    },
    Failure {
        #[serde(default)]
        reason: String,
    },
    Disconnect,
}

/// Reads a chain id that may be encoded as a number, a decimal string or a `0x` hex string.
pub fn parse_chain_id(value: &Value) -> Option<ChainId> {
    match value {
        Value::Number(num) => num.as_u64(),
        Value::String(s) => match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => ChainId::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        },
        Value::Array(values) => values.first().and_then(parse_chain_id),
        Value::Object(obj) => obj.get("chainId").and_then(parse_chain_id),
        _ => None,
    }
}

/// Represents a JSON-RPC error returned by the signer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    /// error message
    pub message: Cow<'static, str>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// New [`RpcError`] with the given [`ErrorCode`].
    pub const fn new(code: ErrorCode) -> Self {
        Self { message: Cow::Borrowed(code.message()), code, data: None }
    }

    /// New [`RpcError`] with a custom message.
    pub fn with_message<M>(code: ErrorCode, message: M) -> Self
    where
        M: Into<String>,
    {
        Self { code, message: message.into().into(), data: None }
    }

    /// Creates a new `UserRejected` error.
    pub const fn user_rejected() -> Self {
        Self::new(ErrorCode::UserRejected)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.message(), self.message)
    }
}

/// List of JSON-RPC and EIP-1193 provider error codes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Invalid JSON was received
    ParseError,
    /// invalid request object
    InvalidRequest,
    /// method does not exist or is not available
    MethodNotFound,
    /// invalid method parameter
    InvalidParams,
    /// internal error
    InternalError,
    /// The user rejected the request
    UserRejected,
    /// The requested method or account has not been authorized by the user
    Unauthorized,
    /// The provider does not support the requested method
    UnsupportedMethod,
    /// The provider is disconnected from all chains
    Disconnected,
    /// The provider is not connected to the requested chain
    ChainDisconnected,
    /// The requested chain has not been added to the wallet
    UnrecognizedChain,
    /// Any other code
    Other(i64),
}

impl ErrorCode {
    /// Returns the error code as `i64`
    pub const fn code(&self) -> i64 {
        match *self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::UserRejected => 4001,
            Self::Unauthorized => 4100,
            Self::UnsupportedMethod => 4200,
            Self::Disconnected => 4900,
            Self::ChainDisconnected => 4901,
            Self::UnrecognizedChain => 4902,
            Self::Other(c) => c,
        }
    }

    /// Returns the message associated with the error
    pub const fn message(&self) -> &'static str {
        match *self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
            Self::UserRejected => "User rejected the request",
            Self::Unauthorized => "Unauthorized",
            Self::UnsupportedMethod => "Unsupported method",
            Self::Disconnected => "Disconnected",
            Self::ChainDisconnected => "Chain disconnected",
            Self::UnrecognizedChain => "Unrecognized chain",
            Self::Other(_) => "Server error",
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(self.code())
    }
}

impl<'a> Deserialize<'a> for ErrorCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'a>,
    {
        i64::deserialize(deserializer).map(Into::into)
    }
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32603 => Self::InternalError,
            4001 => Self::UserRejected,
            4100 => Self::Unauthorized,
            4200 => Self::UnsupportedMethod,
            4900 => Self::Disconnected,
            4901 => Self::ChainDisconnected,
            4902 => Self::UnrecognizedChain,
            _ => Self::Other(code),
        }
    }
}
