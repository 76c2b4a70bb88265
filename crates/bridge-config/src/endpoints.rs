//! Per-chain fallback RPC endpoints

use crate::{
    defaults, managed,
    resolve::{RE_PLACEHOLDER, UnresolvedEnvVarError, interpolate},
};
use alloy_primitives::ChainId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{collections::BTreeMap, fmt};
use url::Url;

/// Represents a single configured endpoint
///
/// This type preserves the value as it's stored in the config. If the value contains a reference
/// to an env var (`${POLYGON_RPC}`), `Env` holds the reference and _not_ the value of the var.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RpcEndpointUrl {
    /// A raw url (http, ws)
    Url(String),
    /// An endpoint that contains at least one `${ENV_VAR}` placeholder
    Env(String),
}

impl RpcEndpointUrl {
    /// Returns the url this type holds, interpolating env vars
    ///
    /// # Error
    ///
    /// Returns an error if the type holds a reference to an env var and the env var is not set
    pub fn resolve(self) -> Result<String, UnresolvedEnvVarError> {
        match self {
            Self::Url(url) => Ok(url),
            Self::Env(val) => interpolate(&val),
        }
    }
}

impl fmt::Display for RpcEndpointUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => url.fmt(f),
            Self::Env(var) => var.fmt(f),
        }
    }
}

impl From<&str> for RpcEndpointUrl {
    fn from(val: &str) -> Self {
        if RE_PLACEHOLDER.is_match(val) { Self::Env(val.into()) } else { Self::Url(val.into()) }
    }
}

impl Serialize for RpcEndpointUrl {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RpcEndpointUrl {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let val = String::deserialize(deserializer)?;
        Ok(Self::from(val.as_str()))
    }
}

/// The project key of the managed RPC provider, either raw or an env var reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManagedKey {
    /// Raw key
    Raw(String),
    /// Key that references an env var, like `${INFURA_KEY}`
    Env(String),
}

impl ManagedKey {
    /// Returns the key, interpolating env vars
    pub fn resolve(self) -> Result<String, UnresolvedEnvVarError> {
        match self {
            Self::Raw(key) => Ok(key),
            Self::Env(val) => interpolate(&val),
        }
    }
}

impl fmt::Display for ManagedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw(key) | Self::Env(key) => key.fmt(f),
        }
    }
}

impl Serialize for ManagedKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ManagedKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let val = String::deserialize(deserializer)?;
        Ok(if RE_PLACEHOLDER.is_match(&val) { Self::Env(val) } else { Self::Raw(val) })
    }
}

/// Resolved endpoint configuration of a single chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportEndpointConfig {
    /// The chain these endpoints serve.
    pub chain_id: ChainId,
    /// Explicit overrides, in configured order.
    pub rpc_urls: Vec<Url>,
    /// Resolved managed project key, if configured.
    pub managed_key: Option<String>,
}

impl TransportEndpointConfig {
    /// Returns the managed endpoint, if a key is configured and the provider serves the chain.
    pub fn managed(&self) -> Option<Url> {
        self.managed_key.as_deref().and_then(|key| managed::managed_url(key, self.chain_id))
    }

    /// Returns every candidate endpoint in preference order: managed, overrides, public defaults.
    pub fn endpoints(&self) -> Vec<Url> {
        let mut endpoints = Vec::with_capacity(self.rpc_urls.len() + 2);
        endpoints.extend(self.managed());
        endpoints.extend(self.rpc_urls.iter().cloned());
        endpoints.extend(
            defaults::public_endpoints(self.chain_id).iter().filter_map(|url| Url::parse(url).ok()),
        );
        endpoints
    }

    /// Returns the most preferred endpoint.
    pub fn primary(&self) -> Option<Url> {
        self.endpoints().into_iter().next()
    }
}

/// Immutable lookup table from chain id to fallback endpoints.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointTable {
    managed_key: Option<String>,
    overrides: BTreeMap<ChainId, Vec<Url>>,
}

impl EndpointTable {
    /// Creates a new table from an optional managed key and per-chain overrides.
    pub fn new(
        managed_key: Option<String>,
        overrides: impl IntoIterator<Item = (ChainId, Vec<Url>)>,
    ) -> Self {
        Self { managed_key: managed_key.filter(|key| !key.is_empty()), overrides: overrides.into_iter().collect() }
    }

    /// Returns `true` if a managed key is configured.
    pub fn has_managed_key(&self) -> bool {
        self.managed_key.is_some()
    }

    /// Returns the endpoint configuration for `chain_id`.
    pub fn entry(&self, chain_id: ChainId) -> TransportEndpointConfig {
        TransportEndpointConfig {
            chain_id,
            rpc_urls: self.overrides.get(&chain_id).cloned().unwrap_or_default(),
            managed_key: self.managed_key.clone(),
        }
    }

    /// Returns the ordered candidate endpoints for `chain_id`. Empty if nothing serves the chain.
    pub fn resolve(&self, chain_id: ChainId) -> Vec<Url> {
        self.entry(chain_id).endpoints()
    }
}
