//! Deep link transport.
//!
//! Requests travel over a relay side channel; the signer app is brought to the foreground by
//! opening its deep link whenever a request is sent.

use super::{
    ApprovalPrompt, SignalSink, SocketRelayTransport, Transport, TransportKind, TransportSignal,
    relay::RelayConnect,
};
use crate::{error::TransportError, session::SessionId};
use parking_lot::Mutex;
use std::{fmt, io, process::Stdio, sync::Arc};
use tokio::process::Command;
use url::Url;

/// Opens a url in the platform's handler for its scheme.
#[async_trait::async_trait]
pub trait LinkOpener: Send + Sync + fmt::Debug + 'static {
    async fn open(&self, url: &str) -> io::Result<()>;
}

/// Opens links through `open`, `xdg-open` or `start`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemLinkOpener;

#[async_trait::async_trait]
impl LinkOpener for SystemLinkOpener {
    async fn open(&self, url: &str) -> io::Result<()> {
        let mut command = if cfg!(target_os = "macos") {
            Command::new("open")
        } else if cfg!(windows) {
            let mut command = Command::new("cmd");
            command.args(["/C", "start", ""]);
            command
        } else {
            Command::new("xdg-open")
        };
        let status = command
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("no handler opened `{url}` ({status})")))
        }
    }
}

/// Transport that hands requests to an installed signer app.
pub struct DeepLinkTransport<C> {
    link: Url,
    relay: SocketRelayTransport<C>,
    opener: Arc<dyn LinkOpener>,
    sink: Mutex<Option<SignalSink>>,
}

impl<C: RelayConnect> DeepLinkTransport<C> {
    pub fn new(link: Url, relay: SocketRelayTransport<C>, opener: Arc<dyn LinkOpener>) -> Self {
        Self { link, relay, opener, sink: Mutex::new(None) }
    }

    pub fn link(&self) -> &Url {
        &self.link
    }

    fn open_app(&self) {
        let opener = Arc::clone(&self.opener);
        let link = self.link.to_string();
        let sink = self.sink.lock().clone();
        tokio::spawn(async move {
            if let Err(err) = opener.open(&link).await {
                warn!(target: "bridge::transport", %err, %link, "failed to open signer app");
                if let Some(sink) = sink {
                    sink.emit(TransportSignal::Unreachable(format!(
                        "signer app could not be opened: {err}"
                    )));
                }
            }
        });
    }
}

#[async_trait::async_trait]
impl<C: RelayConnect> Transport for DeepLinkTransport<C> {
    fn kind(&self) -> TransportKind {
        TransportKind::DeepLink
    }

    fn initialize(&self, sink: SignalSink) -> Result<(), TransportError> {
        *self.sink.lock() = Some(sink.clone());
        self.relay.initialize(sink)
    }

    fn send(&self, payload: String) {
        self.relay.send(payload);
        self.open_app();
    }

    fn approval_prompt(&self, session: &SessionId) -> ApprovalPrompt {
        let mut url = self.link.clone();
        url.query_pairs_mut().append_pair("uri", &self.relay.connector().pairing_uri(session));
        ApprovalPrompt::DeepLink { url: url.to_string() }
    }

    async fn teardown(&self) {
        self.sink.lock().take();
        self.relay.teardown().await;
    }
}

impl<C: fmt::Debug> fmt::Debug for DeepLinkTransport<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeepLinkTransport")
            .field("link", &self.link)
            .field("relay", &self.relay)
            .finish_non_exhaustive()
    }
}
