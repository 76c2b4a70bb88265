//! Built-in public endpoints used when neither a managed key nor an override covers a chain.

use alloy_chains::{Chain, NamedChain};
use alloy_primitives::ChainId;

/// Returns the public RPC endpoints known for `chain_id`, most preferred first.
pub fn public_endpoints(chain_id: ChainId) -> &'static [&'static str] {
    let Some(chain) = Chain::from_id(chain_id).named() else { return &[] };
    match chain {
        NamedChain::Mainnet => &["https://eth.llamarpc.com", "https://ethereum-rpc.publicnode.com"],
        NamedChain::Sepolia => &["https://ethereum-sepolia-rpc.publicnode.com"],
        NamedChain::Holesky => &["https://ethereum-holesky-rpc.publicnode.com"],
        NamedChain::Polygon => &["https://polygon-rpc.com", "https://polygon-bor-rpc.publicnode.com"],
        NamedChain::PolygonAmoy => &["https://rpc-amoy.polygon.technology"],
        NamedChain::Optimism => &["https://mainnet.optimism.io"],
        NamedChain::OptimismSepolia => &["https://sepolia.optimism.io"],
        NamedChain::Arbitrum => &["https://arb1.arbitrum.io/rpc"],
        NamedChain::ArbitrumSepolia => &["https://sepolia-rollup.arbitrum.io/rpc"],
        NamedChain::Base => &["https://mainnet.base.org"],
        NamedChain::BaseSepolia => &["https://sepolia.base.org"],
        NamedChain::Linea => &["https://rpc.linea.build"],
        NamedChain::Avalanche => &["https://api.avax.network/ext/bc/C/rpc"],
        NamedChain::AvalancheFuji => &["https://api.avax-test.network/ext/bc/C/rpc"],
        NamedChain::Celo => &["https://forno.celo.org"],
        NamedChain::BinanceSmartChain => &["https://bsc-dataseed.bnbchain.org"],
        NamedChain::Gnosis => &["https://rpc.gnosischain.com"],
        _ => &[],
    }
}
