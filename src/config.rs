/// Wallet configuration from environment variables
///
/// Controls which GLIN network the wallet talks to, where wallet data is
/// stored, and the cost parameters of password stretching.
/// Defaults to the local development node.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::crypto::vault::KdfParams;

/// Known networks. `Custom` carries its own RPC URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkId {
    Mainnet,
    Testnet,
    Localhost,
    Custom(String),
}

impl NetworkId {
    /// Human readable network name
    pub fn name(&self) -> &'static str {
        match self {
            NetworkId::Mainnet => "GLIN Mainnet",
            NetworkId::Testnet => "GLIN Testnet",
            NetworkId::Localhost => "Local Node",
            NetworkId::Custom(_) => "Custom RPC",
        }
    }

    /// WebSocket RPC endpoint for this network
    pub fn rpc_url(&self) -> &str {
        match self {
            NetworkId::Mainnet => "wss://glin-rpc-mainnet.up.railway.app",
            NetworkId::Testnet => "wss://glin-rpc-production.up.railway.app",
            NetworkId::Localhost => "ws://localhost:9944",
            NetworkId::Custom(url) => url,
        }
    }
}

/// Pallet and call index of `Balances.transfer_keep_alive` in the target
/// runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallIndex {
    pub pallet: u8,
    pub call: u8,
}

impl Default for CallIndex {
    fn default() -> Self {
        // Substrate node-template layout: Balances = 4, transfer_keep_alive = 3
        Self { pallet: 4, call: 3 }
    }
}

impl std::str::FromStr for CallIndex {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pallet, call) = s
            .split_once(':')
            .ok_or_else(|| format!("expected 'pallet:call', got '{}'", s))?;
        Ok(Self {
            pallet: pallet.trim().parse().map_err(|e| format!("bad pallet index: {}", e))?,
            call: call.trim().parse().map_err(|e| format!("bad call index: {}", e))?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct WalletConfig {
    /// Selected network
    pub network: NetworkId,
    /// WebSocket JSON-RPC endpoint of the node
    pub rpc_url: String,
    /// Directory holding the wallet database
    pub data_dir: PathBuf,
    /// SS58 address prefix (42 = generic Substrate)
    pub ss58_prefix: u16,
    /// Balance auto-refresh interval while a wallet is unlocked
    pub balance_poll_interval: Duration,
    /// Argon2id cost parameters for vault encryption
    pub kdf: KdfParams,
    /// Call index used to build transfer extrinsics
    pub transfer_call: CallIndex,
    /// Upper bound for connecting and for each node request
    pub request_timeout: Duration,
}

impl WalletConfig {
    /// Load configuration from environment variables (and `.env` if present)
    ///
    /// Environment variables:
    /// - `GLIN_NETWORK`: "localhost" (default), "testnet", "mainnet" or "custom"
    /// - `GLIN_RPC_URL`: RPC endpoint; required for "custom", overrides presets otherwise
    /// - `WALLET_DATA_DIR`: wallet database directory (default "./wallets")
    /// - `SS58_PREFIX`: address prefix (default 42)
    /// - `BALANCE_POLL_SECS`: balance refresh interval (default 10)
    /// - `KDF_MEMORY_KIB`, `KDF_ITERATIONS`, `KDF_PARALLELISM`: Argon2id costs
    /// - `TRANSFER_CALL_INDEX`: "pallet:call" of `Balances.transfer_keep_alive`
    /// - `RPC_TIMEOUT_SECS`: per-request node timeout (default 30)
    ///
    /// # Examples
    ///
    /// ```bash
    /// GLIN_NETWORK=testnet cargo test
    /// GLIN_NETWORK=custom GLIN_RPC_URL=ws://10.0.0.5:9944 cargo test
    /// ```
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        let network_str = env::var("GLIN_NETWORK")
            .unwrap_or_else(|_| "localhost".to_string())
            .to_lowercase();
        let rpc_override = env::var("GLIN_RPC_URL").ok().filter(|url| !url.trim().is_empty());

        let network = match network_str.as_str() {
            "mainnet" => NetworkId::Mainnet,
            "testnet" => NetworkId::Testnet,
            "localhost" | "" => NetworkId::Localhost,
            "custom" => match rpc_override.clone() {
                Some(url) => NetworkId::Custom(url),
                None => {
                    log::warn!("GLIN_NETWORK=custom without GLIN_RPC_URL, falling back to localhost");
                    NetworkId::Localhost
                }
            },
            other => {
                log::warn!("Unknown network '{}', defaulting to localhost", other);
                NetworkId::Localhost
            }
        };

        let rpc_url = match rpc_override {
            Some(url) => match validate_rpc_url(&url) {
                Ok(()) => url,
                Err(e) => {
                    log::warn!("Ignoring GLIN_RPC_URL ({}), using {} preset", e, network.name());
                    network.rpc_url().to_string()
                }
            },
            None => network.rpc_url().to_string(),
        };
        log::info!("Using {} at {}", network.name(), rpc_url);

        let data_dir = env::var("WALLET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let ss58_prefix = parse_env("SS58_PREFIX").unwrap_or(defaults.ss58_prefix);

        let balance_poll_interval = parse_env("BALANCE_POLL_SECS")
            .filter(|secs: &u64| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.balance_poll_interval);

        let kdf = KdfParams {
            memory_kib: parse_env("KDF_MEMORY_KIB").unwrap_or(defaults.kdf.memory_kib),
            iterations: parse_env("KDF_ITERATIONS").unwrap_or(defaults.kdf.iterations),
            parallelism: parse_env("KDF_PARALLELISM").unwrap_or(defaults.kdf.parallelism),
        };

        let transfer_call = env::var("TRANSFER_CALL_INDEX")
            .ok()
            .and_then(|raw| match raw.parse::<CallIndex>() {
                Ok(index) => Some(index),
                Err(e) => {
                    log::warn!("Ignoring TRANSFER_CALL_INDEX: {}", e);
                    None
                }
            })
            .unwrap_or(defaults.transfer_call);

        let request_timeout = parse_env("RPC_TIMEOUT_SECS")
            .filter(|secs: &u64| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);

        Self {
            network,
            rpc_url,
            data_dir,
            ss58_prefix,
            balance_poll_interval,
            kdf,
            transfer_call,
            request_timeout,
        }
    }
}

impl Default for WalletConfig {
    /// Default configuration (local node)
    fn default() -> Self {
        Self {
            network: NetworkId::Localhost,
            rpc_url: NetworkId::Localhost.rpc_url().to_string(),
            data_dir: PathBuf::from("./wallets"),
            ss58_prefix: crate::crypto::ss58::GENERIC_PREFIX,
            balance_poll_interval: Duration::from_secs(10),
            kdf: KdfParams::default(),
            transfer_call: CallIndex::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring unparsable {}='{}'", key, raw);
            None
        }
    }
}

/// Check that an RPC URL is a well-formed `ws://` or `wss://` URL
pub fn validate_rpc_url(url: &str) -> Result<(), String> {
    let url = url.trim();
    if url.is_empty() {
        return Err("RPC URL cannot be empty".to_string());
    }
    if !url.starts_with("ws://") && !url.starts_with("wss://") {
        return Err("RPC URL must start with ws:// or wss://".to_string());
    }
    let parsed = url::Url::parse(url).map_err(|_| "Invalid URL format".to_string())?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        _ => Err("Invalid WebSocket protocol".to_string()),
    }
}
