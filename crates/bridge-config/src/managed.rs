//! Managed RPC infrastructure.
//!
//! When a project key is configured, chains the provider serves are read through
//! `https://{network}.infura.io/v3/{key}` ahead of any other endpoint.

use alloy_chains::{Chain, NamedChain};
use alloy_primitives::ChainId;
use url::Url;

/// Returns the managed provider's network name for `chain_id`, if it serves that chain.
pub fn network_name(chain_id: ChainId) -> Option<&'static str> {
    let name = match Chain::from_id(chain_id).named()? {
        NamedChain::Mainnet => "mainnet",
        NamedChain::Sepolia => "sepolia",
        NamedChain::Holesky => "holesky",
        NamedChain::Polygon => "polygon-mainnet",
        NamedChain::PolygonAmoy => "polygon-amoy",
        NamedChain::Optimism => "optimism-mainnet",
        NamedChain::OptimismSepolia => "optimism-sepolia",
        NamedChain::Arbitrum => "arbitrum-mainnet",
        NamedChain::ArbitrumSepolia => "arbitrum-sepolia",
        NamedChain::Base => "base-mainnet",
        NamedChain::BaseSepolia => "base-sepolia",
        NamedChain::Linea => "linea-mainnet",
        NamedChain::LineaSepolia => "linea-sepolia",
        NamedChain::Avalanche => "avalanche-mainnet",
        NamedChain::AvalancheFuji => "avalanche-fuji",
        NamedChain::Celo => "celo-mainnet",
        NamedChain::BinanceSmartChain => "bsc-mainnet",
        _ => return None,
    };
    Some(name)
}

/// Whether the managed provider serves `chain_id`.
pub fn is_supported(chain_id: ChainId) -> bool {
    network_name(chain_id).is_some()
}

/// Builds the managed endpoint for `chain_id` with the given project key.
pub fn managed_url(key: &str, chain_id: ChainId) -> Option<Url> {
    let network = network_name(chain_id)?;
    Url::parse(&format!("https://{network}.infura.io/v3/{key}")).ok()
}
