//! Network and token registry.
//!
//! Defines the supported EVM networks and known token deployments, and builds
//! the per-network chain clients at process start. The registry is read-only
//! after construction: handlers and background tasks resolve networks, tokens,
//! and chain clients through it, and unknown entries surface as typed
//! [`RegistryError`] values rather than panics.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{Address, address};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::chain::{AlloyGateway, ChainError, EvmGateway};
use crate::config::Config;
use crate::types::EvmAddress;

/// Supported Ethereum-compatible networks.
///
/// Identified on the wire by a stable slug (e.g. `base-sepolia`).
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Network {
    /// Base Sepolia testnet (chain ID 84532).
    #[serde(rename = "base-sepolia")]
    BaseSepolia,
    /// Ethereum Sepolia testnet (chain ID 11155111).
    #[serde(rename = "ethereum-sepolia")]
    EthereumSepolia,
    /// Base mainnet (chain ID 8453).
    #[serde(rename = "base")]
    Base,
    /// Ethereum mainnet (chain ID 1).
    #[serde(rename = "ethereum")]
    Ethereum,
    /// 0G mainnet (chain ID 16661).
    #[serde(rename = "0g-mainnet")]
    ZgMainnet,
    /// 0G Galileo testnet (chain ID 16601).
    #[serde(rename = "0g-testnet")]
    ZgTestnet,
    /// SKALE Base Sepolia hub (chain ID 324705682).
    #[serde(rename = "skale-base-sepolia")]
    SkaleBaseSepolia,
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.slug())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown network slug: {0}")]
pub struct UnknownNetwork(pub String);

impl FromStr for Network {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Network::variants()
            .iter()
            .find(|network| network.slug() == s)
            .copied()
            .ok_or_else(|| UnknownNetwork(s.to_string()))
    }
}

impl Network {
    /// Return all known [`Network`] variants in presentation order.
    pub fn variants() -> &'static [Network] {
        &[
            Network::BaseSepolia,
            Network::EthereumSepolia,
            Network::Base,
            Network::Ethereum,
            Network::ZgMainnet,
            Network::ZgTestnet,
            Network::SkaleBaseSepolia,
        ]
    }

    /// Stable textual identifier used in requests and persisted records.
    pub fn slug(&self) -> &'static str {
        match self {
            Network::BaseSepolia => "base-sepolia",
            Network::EthereumSepolia => "ethereum-sepolia",
            Network::Base => "base",
            Network::Ethereum => "ethereum",
            Network::ZgMainnet => "0g-mainnet",
            Network::ZgTestnet => "0g-testnet",
            Network::SkaleBaseSepolia => "skale-base-sepolia",
        }
    }

    /// Return the numeric chain ID associated with the network.
    pub fn chain_id(&self) -> u64 {
        match self {
            Network::BaseSepolia => 84532,
            Network::EthereumSepolia => 11155111,
            Network::Base => 8453,
            Network::Ethereum => 1,
            Network::ZgMainnet => 16661,
            Network::ZgTestnet => 16601,
            Network::SkaleBaseSepolia => 324705682,
        }
    }

    /// Human-readable network name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Network::BaseSepolia => "Base Sepolia",
            Network::EthereumSepolia => "Ethereum Sepolia",
            Network::Base => "Base",
            Network::Ethereum => "Ethereum",
            Network::ZgMainnet => "0G Mainnet",
            Network::ZgTestnet => "0G Galileo Testnet",
            Network::SkaleBaseSepolia => "SKALE Base Sepolia",
        }
    }

    /// Environment variable carrying the RPC endpoint for this network.
    pub fn rpc_env_var(&self) -> &'static str {
        match self {
            Network::BaseSepolia => "BASE_SEPOLIA_RPC_URL",
            Network::EthereumSepolia => "ETHEREUM_SEPOLIA_RPC_URL",
            Network::Base => "BASE_MAINNET_RPC_URL",
            Network::Ethereum => "ETHEREUM_MAINNET_RPC_URL",
            Network::ZgMainnet => "ZG_MAINNET_RPC_URL",
            Network::ZgTestnet => "ZG_TESTNET_RPC_URL",
            Network::SkaleBaseSepolia => "SKALE_BASE_SEPOLIA_RPC_URL",
        }
    }

    /// Block confirmations required before a settlement counts as final.
    pub fn required_confirmations(&self) -> u64 {
        match self {
            Network::BaseSepolia => 1,
            Network::EthereumSepolia => 1,
            Network::Base => 2,
            Network::Ethereum => 2,
            Network::ZgMainnet => 2,
            Network::ZgTestnet => 1,
            Network::SkaleBaseSepolia => 1,
        }
    }

    /// Symbol of the token a merchant on this network most likely charges in.
    pub fn default_token(&self) -> &'static str {
        match self {
            Network::ZgMainnet | Network::ZgTestnet => "w0g",
            _ => "usdc",
        }
    }
}

/// A known token deployment across networks.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    /// Lowercase token symbol (e.g. `usdc`).
    pub symbol: String,
    /// Number of decimals in the token's base unit.
    pub decimals: u8,
    /// Whether the token implements ERC-3009 `transferWithAuthorization`.
    pub supports_eip3009: bool,
    /// Contract address per network. A `(network, token)` pair is supported
    /// iff this map contains the network.
    pub addresses: HashMap<Network, Address>,
}

impl TokenRecord {
    /// Contract address of this token on the given network, if deployed there.
    pub fn address_on(&self, network: Network) -> Option<Address> {
        self.addresses.get(&network).copied()
    }
}

/// Statically known token deployments.
static BUILTIN_TOKENS: Lazy<Vec<TokenRecord>> = Lazy::new(|| {
    vec![
        TokenRecord {
            symbol: "usdc".to_string(),
            decimals: 6,
            supports_eip3009: true,
            addresses: HashMap::from([
                (
                    Network::BaseSepolia,
                    address!("0x036CbD53842c5426634e7929541eC2318f3dCF7e"),
                ),
                (
                    Network::Base,
                    address!("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
                ),
                (
                    Network::Ethereum,
                    address!("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"),
                ),
                (
                    Network::EthereumSepolia,
                    address!("0x1c7d4b196cb0c7b01d743fbc6116a902379c7238"),
                ),
                (
                    Network::SkaleBaseSepolia,
                    address!("0x2aebcdc4f9f9149a50422fff86198cb0939ea165"),
                ),
            ]),
        },
        TokenRecord {
            symbol: "w0g".to_string(),
            decimals: 18,
            supports_eip3009: false,
            addresses: HashMap::from([
                (
                    Network::ZgMainnet,
                    address!("0x1cd0690ff9a693f5ef2dd976660a8dafc81a109c"),
                ),
                (
                    Network::ZgTestnet,
                    address!("0x493ea9950bb5a806b4964d4b3cdabad6c03bfc33"),
                ),
            ]),
        },
    ]
});

/// A configured network with its live RPC endpoint.
#[derive(Debug, Clone)]
pub struct NetworkRecord {
    pub network: Network,
    pub chain_id: u64,
    pub display_name: String,
    pub rpc_url: Url,
    pub required_confirmations: u64,
    pub default_token: String,
}

/// Errors surfaced by registry lookups and construction.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The network is not configured on this facilitator.
    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(Network),
    /// The asset symbol or address is not known on the given network.
    #[error("Unsupported asset: {0}")]
    UnsupportedAsset(String),
    /// A write operation was requested but no signing key is configured.
    #[error("Facilitator signing key is not configured")]
    NoWallet,
    /// The configured signing key could not be parsed.
    #[error("Invalid facilitator signing key: {0}")]
    InvalidSigningKey(String),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Two-map registry of configured networks and known tokens, plus the chain
/// clients other components use to reach them.
///
/// Per network the registry vends a read-only public client (balance and
/// receipt reads, block numbers) and, when a signing key is configured, a
/// wallet client for contract writes. These handles are the only surfaces
/// through which the rest of the crate touches a chain, which keeps them
/// substitutable in tests.
#[derive(Clone)]
pub struct Registry {
    networks: BTreeMap<Network, NetworkRecord>,
    tokens: BTreeMap<String, TokenRecord>,
    publics: HashMap<Network, Arc<dyn EvmGateway>>,
    wallets: HashMap<Network, Arc<dyn EvmGateway>>,
}

impl Registry {
    /// Build the registry from configuration.
    ///
    /// Networks without a configured RPC URL are skipped with a warning, in
    /// line with partial deployments; a malformed signing key or RPC URL
    /// fails construction.
    pub fn from_config(config: &Config) -> Result<Self, RegistryError> {
        let wallet = match &config.private_key {
            Some(key) => Some(
                AlloyGateway::wallet_from_key(key)
                    .map_err(|e| RegistryError::InvalidSigningKey(e.to_string()))?,
            ),
            None => None,
        };

        let mut networks = BTreeMap::new();
        let mut publics: HashMap<Network, Arc<dyn EvmGateway>> = HashMap::new();
        let mut wallets: HashMap<Network, Arc<dyn EvmGateway>> = HashMap::new();

        for network in Network::variants() {
            let Some(rpc_url) = config.rpc_urls.get(network) else {
                tracing::warn!("No RPC URL configured for {network} (skipped)");
                continue;
            };
            let public = AlloyGateway::connect(*network, rpc_url.clone(), None)?;
            let signer_address = match &wallet {
                Some(wallet) => {
                    let gateway =
                        AlloyGateway::connect(*network, rpc_url.clone(), Some(wallet.clone()))?;
                    let signer = gateway.signer_address();
                    wallets.insert(*network, gateway);
                    signer
                }
                None => None,
            };
            publics.insert(*network, public);
            networks.insert(
                *network,
                NetworkRecord {
                    network: *network,
                    chain_id: network.chain_id(),
                    display_name: network.display_name().to_string(),
                    rpc_url: rpc_url.clone(),
                    required_confirmations: network.required_confirmations(),
                    default_token: network.default_token().to_string(),
                },
            );
            match signer_address {
                Some(signer) => tracing::info!(
                    "Initialized {network} (chain id {}) at {rpc_url} using {signer}",
                    network.chain_id()
                ),
                None => tracing::info!(
                    "Initialized {network} (chain id {}) at {rpc_url} (read-only)",
                    network.chain_id()
                ),
            }
        }

        Ok(Self {
            networks,
            tokens: builtin_token_map(),
            publics,
            wallets,
        })
    }

    /// Assemble a registry from pre-built parts. Used by tests to substitute
    /// in-memory gateways for live RPC endpoints.
    pub fn with_parts(
        networks: BTreeMap<Network, NetworkRecord>,
        tokens: BTreeMap<String, TokenRecord>,
        publics: HashMap<Network, Arc<dyn EvmGateway>>,
        wallets: HashMap<Network, Arc<dyn EvmGateway>>,
    ) -> Self {
        Self {
            networks,
            tokens,
            publics,
            wallets,
        }
    }

    /// Resolve a configured network, or fail with `UnsupportedNetwork`.
    pub fn chain_of(&self, network: Network) -> Result<&NetworkRecord, RegistryError> {
        self.networks
            .get(&network)
            .ok_or(RegistryError::UnsupportedNetwork(network))
    }

    /// Resolve a known token by its lowercase symbol.
    pub fn token_of(&self, symbol: &str) -> Result<&TokenRecord, RegistryError> {
        self.tokens
            .get(&symbol.to_lowercase())
            .ok_or_else(|| RegistryError::UnsupportedAsset(symbol.to_string()))
    }

    /// Contract address of `symbol` on `network`.
    pub fn address_of(&self, network: Network, symbol: &str) -> Result<Address, RegistryError> {
        self.token_of(symbol)?
            .address_on(network)
            .ok_or_else(|| RegistryError::UnsupportedAsset(symbol.to_string()))
    }

    /// Resolve an asset given either a token symbol or a contract address.
    ///
    /// Address-form assets are reverse-looked-up against the token table for
    /// the request's network; unknown addresses are rejected.
    pub fn resolve_asset(
        &self,
        network: Network,
        asset: &str,
    ) -> Result<(&TokenRecord, Address), RegistryError> {
        if asset.starts_with("0x") || asset.starts_with("0X") {
            let wanted = Address::from_str(asset)
                .map_err(|_| RegistryError::UnsupportedAsset(asset.to_string()))?;
            return self
                .tokens
                .values()
                .find_map(|token| {
                    token
                        .address_on(network)
                        .filter(|address| *address == wanted)
                        .map(|address| (token, address))
                })
                .ok_or_else(|| RegistryError::UnsupportedAsset(asset.to_string()));
        }
        let token = self.token_of(asset)?;
        let address = token
            .address_on(network)
            .ok_or_else(|| RegistryError::UnsupportedAsset(asset.to_string()))?;
        Ok((token, address))
    }

    pub fn confirmations_of(&self, network: Network) -> Result<u64, RegistryError> {
        Ok(self.chain_of(network)?.required_confirmations)
    }

    pub fn chain_id_of(&self, network: Network) -> Result<u64, RegistryError> {
        Ok(self.chain_of(network)?.chain_id)
    }

    /// Configured networks in stable order.
    pub fn supported_networks(&self) -> Vec<Network> {
        self.networks.keys().copied().collect()
    }

    /// Symbols of tokens deployed on `network`, in stable order.
    pub fn supported_assets(&self, network: Network) -> Vec<String> {
        self.tokens
            .values()
            .filter(|token| token.address_on(network).is_some())
            .map(|token| token.symbol.clone())
            .collect()
    }

    /// Whether the asset resolves to the chain's native token (zero address).
    pub fn is_native(&self, network: Network, asset: &str) -> bool {
        self.resolve_asset(network, asset)
            .map(|(_, address)| address == Address::ZERO)
            .unwrap_or(false)
    }

    /// Read-only chain client for `network`.
    pub fn public_client(&self, network: Network) -> Result<&Arc<dyn EvmGateway>, RegistryError> {
        self.publics
            .get(&network)
            .ok_or(RegistryError::UnsupportedNetwork(network))
    }

    /// Signing chain client for `network`. Fails with `NoWallet` when the
    /// facilitator runs without a signing key.
    pub fn wallet_client(&self, network: Network) -> Result<&Arc<dyn EvmGateway>, RegistryError> {
        if !self.networks.contains_key(&network) {
            return Err(RegistryError::UnsupportedNetwork(network));
        }
        self.wallets.get(&network).ok_or(RegistryError::NoWallet)
    }

    /// Address the facilitator signs and relays from on `network`.
    pub fn facilitator_address(&self, network: Network) -> Result<EvmAddress, RegistryError> {
        self.wallet_client(network)?
            .signer_address()
            .ok_or(RegistryError::NoWallet)
    }
}

fn builtin_token_map() -> BTreeMap<String, TokenRecord> {
    BUILTIN_TOKENS
        .iter()
        .map(|token| (token.symbol.clone(), token.clone()))
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::chain::testing::MockGateway;

    /// Registry over a single mock-backed network, returning the mock for
    /// test orchestration.
    pub fn mock_registry(network: Network) -> (Registry, Arc<MockGateway>) {
        let gateway = Arc::new(MockGateway::new());
        let record = NetworkRecord {
            network,
            chain_id: network.chain_id(),
            display_name: network.display_name().to_string(),
            rpc_url: Url::parse("http://localhost:8545").unwrap(),
            required_confirmations: network.required_confirmations(),
            default_token: network.default_token().to_string(),
        };
        let registry = Registry::with_parts(
            BTreeMap::from([(network, record)]),
            builtin_token_map(),
            HashMap::from([(network, gateway.clone() as Arc<dyn EvmGateway>)]),
            HashMap::from([(network, gateway.clone() as Arc<dyn EvmGateway>)]),
        );
        (registry, gateway)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_round_trips_for_all_networks() {
        for network in Network::variants() {
            assert_eq!(Network::from_str(network.slug()).unwrap(), *network);
        }
    }

    #[test]
    fn serde_uses_slugs() {
        let json = serde_json::to_string(&Network::ZgMainnet).unwrap();
        assert_eq!(json, "\"0g-mainnet\"");
        let network: Network = serde_json::from_str("\"base-sepolia\"").unwrap();
        assert_eq!(network, Network::BaseSepolia);
    }

    #[test]
    fn resolve_asset_accepts_symbol_and_address() {
        let (registry, _gateway) = testing::mock_registry(Network::BaseSepolia);
        let (by_symbol, address) = registry.resolve_asset(Network::BaseSepolia, "usdc").unwrap();
        assert_eq!(by_symbol.decimals, 6);
        let (by_address, _) = registry
            .resolve_asset(Network::BaseSepolia, &format!("{address}"))
            .unwrap();
        assert_eq!(by_address.symbol, "usdc");
    }

    #[test]
    fn resolve_asset_rejects_unknown_address() {
        let (registry, _gateway) = testing::mock_registry(Network::BaseSepolia);
        let error = registry
            .resolve_asset(
                Network::BaseSepolia,
                "0x00000000000000000000000000000000000000aa",
            )
            .unwrap_err();
        assert!(matches!(error, RegistryError::UnsupportedAsset(_)));
    }

    #[test]
    fn unsupported_network_is_a_typed_error() {
        let (registry, _gateway) = testing::mock_registry(Network::BaseSepolia);
        assert!(matches!(
            registry.chain_of(Network::ZgMainnet),
            Err(RegistryError::UnsupportedNetwork(Network::ZgMainnet))
        ));
        assert!(matches!(
            registry.public_client(Network::ZgMainnet),
            Err(RegistryError::UnsupportedNetwork(_))
        ));
    }

    #[test]
    fn supported_assets_are_scoped_to_network() {
        let (registry, _gateway) = testing::mock_registry(Network::BaseSepolia);
        assert_eq!(registry.supported_assets(Network::BaseSepolia), ["usdc"]);
        assert_eq!(registry.supported_assets(Network::ZgMainnet), ["w0g"]);
    }

    #[test]
    fn address_and_chain_id_lookups_resolve() {
        let (registry, _gateway) = testing::mock_registry(Network::BaseSepolia);
        let address = registry.address_of(Network::BaseSepolia, "usdc").unwrap();
        assert_ne!(address, Address::ZERO);
        assert!(!registry.is_native(Network::BaseSepolia, "usdc"));
        assert_eq!(registry.chain_id_of(Network::BaseSepolia).unwrap(), 84532);
        assert_eq!(registry.confirmations_of(Network::BaseSepolia).unwrap(), 1);
    }

    #[test]
    fn token_lookup_is_case_insensitive() {
        let (registry, _gateway) = testing::mock_registry(Network::BaseSepolia);
        assert!(registry.token_of("USDC").is_ok());
        assert!(matches!(
            registry.token_of("doge"),
            Err(RegistryError::UnsupportedAsset(_))
        ));
    }
}
