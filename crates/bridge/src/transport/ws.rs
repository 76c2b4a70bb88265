//! WebSocket relay backend.

use super::relay::{RelayConnect, RelayHandle, RelayInterface};
use crate::{error::TransportError, session::SessionId};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use url::Url;

/// Connects to a relay over a WebSocket.
#[derive(Clone, Debug)]
pub struct WsRelayConnector {
    url: Url,
}

impl WsRelayConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait::async_trait]
impl RelayConnect for WsRelayConnector {
    async fn connect(&self) -> Result<RelayHandle, TransportError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| TransportError::Connect(format!("{}: {err}", self.url)))?;

        let (handle, interface) = RelayHandle::new();
        tokio::spawn(pump(stream, interface));
        Ok(handle)
    }

    fn pairing_uri(&self, session: &SessionId) -> String {
        let mut uri = self.url.clone();
        uri.query_pairs_mut().append_pair("sessionId", session.as_str());
        uri.to_string()
    }
}

/// Moves frames between the socket and the transport until either side goes away.
async fn pump(stream: WebSocketStream<MaybeTlsStream<TcpStream>>, mut interface: RelayInterface) {
    let (mut writer, mut reader) = stream.split();
    loop {
        tokio::select! {
            outbound = interface.recv_from_frontend() => {
                let Some(text) = outbound else {
                    let _ = writer.send(Message::Close(None)).await;
                    break;
                };
                if let Err(err) = writer.send(Message::Text(text.into())).await {
                    debug!(target: "bridge::transport", %err, "relay write failed");
                    break;
                }
            }
            inbound = reader.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if !interface.send_to_frontend(text.as_str()) {
                        break;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = writer.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(target: "bridge::transport", %err, "relay read failed");
                    break;
                }
            },
        }
    }
    trace!(target: "bridge::transport", "relay backend stopped");
}
