//! Config errors

use crate::resolve::UnresolvedEnvVarError;

/// Errors that can occur while loading or resolving a [`BridgeConfig`](crate::BridgeConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Extracting the config from its providers failed.
    #[error("failed to extract bridge config: {0}")]
    Extract(#[from] figment::Error),
    /// A `${VAR}` placeholder referenced an unset env var.
    #[error(transparent)]
    UnresolvedEnvVar(#[from] UnresolvedEnvVarError),
    /// A key of `rpc_endpoints` is not a decimal chain id.
    #[error("invalid chain id `{0}` in `rpc_endpoints`, expected a decimal number")]
    InvalidChainKey(String),
    /// An override URL did not parse or uses an unsupported scheme.
    #[error("invalid rpc endpoint `{url}` for chain {chain_id}: {reason}")]
    InvalidEndpoint { chain_id: u64, url: String, reason: String },
}
