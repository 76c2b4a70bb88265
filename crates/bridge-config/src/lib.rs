//! # foundry-bridge-config
//!
//! Configuration of the wallet bridge.
//!
//! Values are read, in increasing precedence, from the built-in defaults, a `bridge.toml` file
//! (or the file named by `BRIDGE_CONFIG`), and `BRIDGE_`-prefixed env vars.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
extern crate tracing;

use alloy_primitives::ChainId;
use figment::{
    Figment, Metadata, Profile, Provider,
    providers::{Env, Format, Serialized, Toml},
    value::{Dict, Map},
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, time::Duration};
use url::Url;

pub mod defaults;
pub mod endpoints;
pub mod managed;
pub mod resolve;

mod error;
pub use error::ConfigError;

pub use endpoints::{EndpointTable, ManagedKey, RpcEndpointUrl, TransportEndpointConfig};

/// Schemes accepted for rpc overrides.
const ALLOWED_SCHEMES: &[&str] = &["http", "https", "ws", "wss"];

/// Bridge configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Chain a new session is opened on.
    pub chain_id: ChainId,
    /// Whether sessions are persisted across restarts.
    pub persist_session: bool,
    /// Seconds to wait for the user to approve a connection.
    pub handshake_timeout: u64,
    /// Seconds to wait for a response to a signing request.
    pub request_timeout: u64,
    /// Socket relay endpoint.
    pub relay_url: Option<String>,
    /// Deep link that opens the signer app.
    pub deep_link: Option<String>,
    /// How many times the relay reconnects before giving up.
    pub relay_max_retries: u32,
    /// Initial reconnect backoff in milliseconds, doubled on each attempt.
    pub relay_retry_backoff: u64,
    /// Managed RPC provider project key.
    pub managed_rpc_key: Option<ManagedKey>,
    /// Fallback rpc overrides, keyed by decimal chain id.
    pub rpc_endpoints: BTreeMap<String, Vec<RpcEndpointUrl>>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            persist_session: true,
            handshake_timeout: 120,
            request_timeout: 60,
            relay_url: None,
            deep_link: None,
            relay_max_retries: 5,
            relay_retry_backoff: 500,
            managed_rpc_key: None,
            rpc_endpoints: BTreeMap::new(),
        }
    }
}

impl BridgeConfig {
    /// File name of the config toml file
    pub const FILE_NAME: &'static str = "bridge.toml";

    /// Env var that points to a config file other than `./bridge.toml`
    pub const CONFIG_ENV: &'static str = "BRIDGE_CONFIG";

    /// Prefix of env vars that override config values
    pub const ENV_PREFIX: &'static str = "BRIDGE_";

    /// Loads the config from the current directory.
    ///
    /// See [`figment`](Self::figment) for more details.
    pub fn load() -> Result<Self, ConfigError> {
        Self::try_from(Self::figment())
    }

    /// Loads the config with `bridge.toml` looked up in `root`.
    pub fn load_with_root(root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::try_from(Self::figment_with_root(root))
    }

    /// Attempts to extract a `BridgeConfig` from `provider`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use figment::providers::{Format, Toml};
    /// use foundry_bridge_config::BridgeConfig;
    ///
    /// let figment = BridgeConfig::figment().merge(Toml::file("other.toml"));
    ///
    /// let config = BridgeConfig::try_from(figment);
    /// ```
    pub fn try_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let figment = Figment::from(provider);
        trace!(target: "bridge::config", metadata = ?figment.metadata().collect::<Vec<_>>(), "extracting bridge config");
        Ok(figment.extract::<Self>()?)
    }

    /// Returns the default figment: defaults, then `./bridge.toml`, then `BRIDGE_` env vars.
    pub fn figment() -> Figment {
        Self::figment_with_root(".")
    }

    /// Returns the default figment with `bridge.toml` looked up in `root`.
    pub fn figment_with_root(root: impl AsRef<Path>) -> Figment {
        let file = root.as_ref().join(Self::FILE_NAME);
        Figment::from(Self::default())
            .merge(Toml::file(Env::var_or(Self::CONFIG_ENV, file.display().to_string())))
            .merge(Env::prefixed(Self::ENV_PREFIX).ignore(&["CONFIG"]))
    }

    /// Handshake timeout as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Initial relay reconnect backoff as a [`Duration`].
    pub fn relay_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.relay_retry_backoff)
    }

    /// Resolves env vars and validates the overrides into an immutable [`EndpointTable`].
    pub fn endpoint_table(&self) -> Result<EndpointTable, ConfigError> {
        let managed_key = self.managed_rpc_key.clone().map(ManagedKey::resolve).transpose()?;

        let mut overrides = BTreeMap::new();
        for (key, urls) in &self.rpc_endpoints {
            let chain_id: ChainId =
                key.trim().parse().map_err(|_| ConfigError::InvalidChainKey(key.clone()))?;
            let mut resolved = Vec::with_capacity(urls.len());
            for url in urls {
                let raw = url.clone().resolve()?;
                resolved.push(parse_endpoint(chain_id, &raw)?);
            }
            overrides.insert(chain_id, resolved);
        }

        debug!(target: "bridge::config", chains = overrides.len(), managed = managed_key.is_some(), "resolved endpoint table");
        Ok(EndpointTable::new(managed_key, overrides))
    }
}

fn parse_endpoint(chain_id: ChainId, raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidEndpoint {
        chain_id,
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw).map_err(|err| invalid(err.to_string()))?;
    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        return Err(invalid(format!("unsupported scheme `{}`", url.scheme())));
    }
    Ok(url)
}

impl Provider for BridgeConfig {
    fn metadata(&self) -> Metadata {
        Metadata::named("Bridge Config")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}
