//! Session model and persistence.

use crate::envelope::RequestId;
use alloy_primitives::{Address, ChainId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque session identifier.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display, derive_more::From,
)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh random id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An authenticated association between this application and the signer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub chain_id: ChainId,
    pub account: Option<Address>,
    /// Next request id to hand out, so ids are never reused across resumption.
    #[serde(default)]
    pub sequence: RequestId,
}

impl Session {
    /// A new, not yet approved session on `chain_id`.
    pub fn new(chain_id: ChainId) -> Self {
        Self { id: SessionId::random(), chain_id, account: None, sequence: 0 }
    }

    /// A session can be resumed silently only once it has been bound to an account.
    pub const fn is_resumable(&self) -> bool {
        self.account.is_some()
    }

    /// Applies the signer's approval.
    pub fn approved(mut self, approval: HandshakeApproval) -> Self {
        if let Some(account) = approval.accounts.first() {
            self.account = Some(*account);
        }
        if let Some(chain_id) = approval.chain_id {
            self.chain_id = chain_id;
        }
        self
    }

    /// Encodes the session for a [`SessionStore`].
    pub fn to_blob(&self) -> Result<SessionBlob, serde_json::Error> {
        serde_json::to_vec(self).map(SessionBlob)
    }

    /// Decodes a persisted session.
    pub fn from_blob(blob: &SessionBlob) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(&blob.0)
    }
}

/// Result of a successful handshake or resumption.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeApproval {
    #[serde(default)]
    pub accounts: Vec<Address>,
    #[serde(default, deserialize_with = "chain_id_opt")]
    pub chain_id: Option<ChainId>,
}

fn chain_id_opt<'de, D>(deserializer: D) -> Result<Option<ChainId>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(crate::envelope::parse_chain_id))
}

/// Serialized session as handed to a [`SessionStore`].
#[derive(Clone, PartialEq, Eq, derive_more::From, derive_more::AsRef)]
pub struct SessionBlob(Vec<u8>);

impl fmt::Debug for SessionBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionBlob({} bytes)", self.0.len())
    }
}

/// Persistence for at most one session.
///
/// Store failures are logged by the caller and never fail a connection.
pub trait SessionStore: Send + Sync + fmt::Debug {
    fn load(&self) -> eyre::Result<Option<SessionBlob>>;

    fn save(&self, blob: &SessionBlob) -> eyre::Result<()>;

    fn delete(&self) -> eyre::Result<()>;
}

/// Keeps the session in memory for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    blob: Mutex<Option<SessionBlob>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the currently stored blob.
    pub fn get(&self) -> Option<SessionBlob> {
        self.blob.lock().clone()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> eyre::Result<Option<SessionBlob>> {
        Ok(self.blob.lock().clone())
    }

    fn save(&self, blob: &SessionBlob) -> eyre::Result<()> {
        *self.blob.lock() = Some(blob.clone());
        Ok(())
    }

    fn delete(&self) -> eyre::Result<()> {
        self.blob.lock().take();
        Ok(())
    }
}
