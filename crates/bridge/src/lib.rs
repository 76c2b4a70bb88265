//! # foundry-wallet-bridge
//!
//! Session bridge between an application and a remote signing wallet.
//!
//! A [`WalletBridge`] negotiates a session with the signer over an interchangeable
//! [`Transport`](transport::Transport) (socket relay, deep link, embedded runtime), correlates
//! every signing request with its response, and reports state changes and results through an
//! [`EventDispatcher`]. Read-only calls fall back to public or managed RPC endpoints while no
//! signer is connected.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
extern crate tracing;

mod bridge;
pub use bridge::{WalletBridge, WalletBridgeBuilder};

pub mod correlator;
pub mod envelope;
pub mod error;
pub mod events;
pub mod fallback;
pub mod lifecycle;
pub mod session;
pub mod state;
pub mod transport;

pub use correlator::{OutboundRequest, PendingResponse, RequestCorrelator, Resolution};
pub use envelope::{ErrorCode, RequestEnvelope, ResponseEnvelope, RpcError};
pub use error::{BridgeError, DispatchError, ReadError, TransportError};
pub use events::{BridgeEvent, EventDispatcher, EventKind, EventSender, ListenerRegistration};
pub use fallback::FallbackReadProvider;
pub use lifecycle::{ConnectionLifecycle, LifecycleConfig};
pub use session::{MemorySessionStore, Session, SessionBlob, SessionId, SessionStore};
pub use state::ConnectionState;
pub use transport::{ApprovalPrompt, Transport, TransportKind, TransportSignal};

pub use foundry_bridge_config::BridgeConfig;
