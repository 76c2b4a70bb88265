//! Relay doubles for tests.

use super::{RelayConnect, RelayHandle, RelayInterface};
use crate::{error::TransportError, session::SessionId};
use tokio::sync::mpsc;

/// Hands every relay backend the transport opens to the test.
#[derive(Debug)]
pub struct ScriptedConnector {
    relays: mpsc::UnboundedSender<RelayInterface>,
}

impl ScriptedConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RelayInterface>) {
        let (relays, rx) = mpsc::unbounded_channel();
        (Self { relays }, rx)
    }
}

#[async_trait::async_trait]
impl RelayConnect for ScriptedConnector {
    async fn connect(&self) -> Result<RelayHandle, TransportError> {
        let (handle, interface) = RelayHandle::new();
        self.relays
            .send(interface)
            .map_err(|_| TransportError::Connect("test finished".to_string()))?;
        Ok(handle)
    }

    fn pairing_uri(&self, session: &SessionId) -> String {
        format!("wc:{session}@relay.test")
    }
}
