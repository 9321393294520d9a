use eyre::{eyre, Result, WrapErr};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::dedup::{DEFAULT_SEEN_EVENT_CACHE_SIZE, DEFAULT_SEEN_EVENT_TTL_SECS};
use crate::fees::{
    FeeParams, FeeWindowState, DEFAULT_ADJUSTMENT_DENOMINATOR, DEFAULT_GAS_TARGET_PER_WINDOW,
    DEFAULT_INITIAL_BASE_FEE, DEFAULT_MIN_BASE_FEE, DEFAULT_WINDOW_DURATION_SECONDS,
};

/// Main configuration for the oracle
#[derive(Debug, Clone)]
pub struct Config {
    pub network: Network,
    pub evm: EvmConfig,
    pub solana: SolanaConfig,
    pub watcher: WatcherConfig,
    pub oracle: OracleConfig,
    pub fees: FeeConfig,
}

/// Deployment flavour; selects the Solana commitment level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn commitment(&self) -> CommitmentConfig {
        match self {
            Network::Mainnet => CommitmentConfig::finalized(),
            Network::Testnet => CommitmentConfig::confirmed(),
        }
    }
}

impl FromStr for Network {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" | "devnet" | "local" => Ok(Network::Testnet),
            other => Err(eyre!("NETWORK must be mainnet or testnet, got {}", other)),
        }
    }
}

/// Base (source of messages, destination of deposits)
#[derive(Clone)]
pub struct EvmConfig {
    pub rpc_url: String,
    /// Watch endpoint; `ws://`/`wss://` selects subscription mode
    pub watch_url: String,
    pub chain_id: u64,
    pub bridge_address: String,
    pub private_key: String,
    pub finality_blocks: u64,
    pub start_block: u64,
    pub max_block_range: u64,
    /// Safety margin over the suggested gas price, in percent
    pub gas_price_multiplier_pct: u64,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for EvmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmConfig")
            .field("rpc_url", &self.rpc_url)
            .field("watch_url", &self.watch_url)
            .field("chain_id", &self.chain_id)
            .field("bridge_address", &self.bridge_address)
            .field("private_key", &"<redacted>")
            .field("finality_blocks", &self.finality_blocks)
            .field("start_block", &self.start_block)
            .field("max_block_range", &self.max_block_range)
            .field("gas_price_multiplier_pct", &self.gas_price_multiplier_pct)
            .finish()
    }
}

/// Solana (destination of checkpoints and messages, source of deposits)
#[derive(Clone)]
pub struct SolanaConfig {
    pub rpc_url: String,
    pub watch_url: String,
    pub program_id: String,
    /// Keypair file path or base58-encoded secret key
    pub keypair: String,
    pub start_slot: Option<u64>,
}

/// Custom Debug that redacts the keypair to prevent accidental log leakage.
impl fmt::Debug for SolanaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SolanaConfig")
            .field("rpc_url", &self.rpc_url)
            .field("watch_url", &self.watch_url)
            .field("program_id", &self.program_id)
            .field("keypair", &"<redacted>")
            .field("start_slot", &self.start_slot)
            .finish()
    }
}

impl SolanaConfig {
    pub fn program_id(&self) -> Result<Pubkey> {
        Pubkey::from_str(&self.program_id)
            .map_err(|e| eyre!("SOLANA_PROGRAM_ID is not a valid pubkey: {}", e))
    }

    /// Load the signing keypair from a file path or a base58 secret.
    pub fn load_keypair(&self) -> Result<Keypair> {
        if Path::new(&self.keypair).exists() {
            return solana_sdk::signature::read_keypair_file(&self.keypair)
                .map_err(|e| eyre!("Failed to read keypair file {}: {}", self.keypair, e));
        }
        let bytes = bs58::decode(self.keypair.trim())
            .into_vec()
            .wrap_err("SOLANA_KEYPAIR is neither a file nor base58")?;
        Keypair::from_bytes(&bytes).map_err(|e| eyre!("SOLANA_KEYPAIR is not a valid keypair: {}", e))
    }
}

/// Watcher timing
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub poll_interval_ms: u64,
    pub recv_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Checkpointing, relay and dedup behaviour
#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub checkpoint_interval_blocks: u64,
    /// Prove and relay Base messages on Solana after each checkpoint
    pub auto_relay: bool,
    pub seen_event_cache_size: usize,
    pub seen_event_ttl_secs: u64,
}

/// Fee controller parameters
#[derive(Debug, Clone)]
pub struct FeeConfig {
    pub target: u64,
    pub denominator: u64,
    pub window_secs: u64,
    pub initial_base_fee: u64,
    pub min_base_fee: u64,
    pub gas_cost_scaler: u64,
    pub gas_cost_scaler_dp: u64,
}

impl FeeConfig {
    pub fn window_state(&self, now: i64) -> FeeWindowState {
        FeeWindowState {
            target: self.target,
            denominator: self.denominator,
            window_duration_seconds: self.window_secs,
            current_base_fee: self.initial_base_fee,
            current_window_gas_used: 0,
            window_start_time: now,
        }
    }

    pub fn params(&self) -> FeeParams {
        FeeParams {
            min_base_fee: self.min_base_fee,
            gas_cost_scaler: self.gas_cost_scaler,
            gas_cost_scaler_dp: self.gas_cost_scaler_dp,
        }
    }
}

/// Default functions
fn default_network() -> Network {
    Network::Testnet
}

fn default_finality_blocks() -> u64 {
    1
}

fn default_max_block_range() -> u64 {
    1000
}

fn default_gas_price_multiplier_pct() -> u64 {
    120
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_recv_timeout() -> u64 {
    5000
}

fn default_rpc_timeout() -> u64 {
    10_000
}

fn default_checkpoint_interval() -> u64 {
    300
}

fn default_gas_cost_scaler() -> u64 {
    1_000_000
}

fn default_gas_cost_scaler_dp() -> u64 {
    1_000_000
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn required(key: &str) -> Result<String> {
    env::var(key).map_err(|_| eyre!("{} environment variable is required", key))
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Self> {
        let network = match env::var("NETWORK") {
            Ok(v) => v.parse()?,
            Err(_) => default_network(),
        };

        let evm_rpc_url = required("EVM_RPC_URL")?;
        let evm = EvmConfig {
            watch_url: env::var("EVM_WATCH_URL").unwrap_or_else(|_| evm_rpc_url.clone()),
            rpc_url: evm_rpc_url,
            chain_id: required("EVM_CHAIN_ID")?
                .parse()
                .wrap_err("EVM_CHAIN_ID must be a valid u64")?,
            bridge_address: required("EVM_BRIDGE_ADDRESS")?,
            private_key: required("EVM_PRIVATE_KEY")?,
            finality_blocks: parse_or("EVM_FINALITY_BLOCKS", default_finality_blocks()),
            start_block: parse_or("EVM_START_BLOCK", 0),
            max_block_range: parse_or("EVM_MAX_BLOCK_RANGE", default_max_block_range()),
            gas_price_multiplier_pct: parse_or(
                "GAS_PRICE_MULTIPLIER_PCT",
                default_gas_price_multiplier_pct(),
            ),
        };

        let solana_rpc_url = required("SOLANA_RPC_URL")?;
        let solana = SolanaConfig {
            watch_url: env::var("SOLANA_WATCH_URL").unwrap_or_else(|_| solana_rpc_url.clone()),
            rpc_url: solana_rpc_url,
            program_id: required("SOLANA_PROGRAM_ID")?,
            keypair: required("SOLANA_KEYPAIR")?,
            start_slot: env::var("SOLANA_START_SLOT")
                .ok()
                .and_then(|v| v.parse().ok()),
        };

        let watcher = WatcherConfig {
            poll_interval_ms: parse_or("POLL_INTERVAL_MS", default_poll_interval()),
            recv_timeout_ms: parse_or("RECV_TIMEOUT_MS", default_recv_timeout()),
            rpc_timeout_ms: parse_or("RPC_TIMEOUT_MS", default_rpc_timeout()),
        };

        let oracle = OracleConfig {
            checkpoint_interval_blocks: parse_or(
                "CHECKPOINT_INTERVAL_BLOCKS",
                default_checkpoint_interval(),
            ),
            auto_relay: parse_or("AUTO_RELAY", false),
            seen_event_cache_size: parse_or("SEEN_EVENT_CACHE_SIZE", DEFAULT_SEEN_EVENT_CACHE_SIZE),
            seen_event_ttl_secs: parse_or("SEEN_EVENT_TTL_SECS", DEFAULT_SEEN_EVENT_TTL_SECS),
        };

        let fees = FeeConfig {
            target: parse_or("FEE_TARGET", DEFAULT_GAS_TARGET_PER_WINDOW),
            denominator: parse_or("FEE_DENOMINATOR", DEFAULT_ADJUSTMENT_DENOMINATOR),
            window_secs: parse_or("FEE_WINDOW_SECS", DEFAULT_WINDOW_DURATION_SECONDS),
            initial_base_fee: parse_or("FEE_INITIAL_BASE_FEE", DEFAULT_INITIAL_BASE_FEE),
            min_base_fee: parse_or("FEE_MIN_BASE_FEE", DEFAULT_MIN_BASE_FEE),
            gas_cost_scaler: parse_or("GAS_COST_SCALER", default_gas_cost_scaler()),
            gas_cost_scaler_dp: parse_or("GAS_COST_SCALER_DP", default_gas_cost_scaler_dp()),
        };

        let config = Config {
            network,
            evm,
            solana,
            watcher,
            oracle,
            fees,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_url("EVM_RPC_URL", &self.evm.rpc_url, &["http", "https"])?;
        validate_url("EVM_WATCH_URL", &self.evm.watch_url, &["http", "https", "ws", "wss"])?;
        validate_url("SOLANA_RPC_URL", &self.solana.rpc_url, &["http", "https"])?;
        validate_url(
            "SOLANA_WATCH_URL",
            &self.solana.watch_url,
            &["http", "https", "ws", "wss"],
        )?;

        if self.evm.bridge_address.len() != 42 || !self.evm.bridge_address.starts_with("0x") {
            return Err(eyre!(
                "evm.bridge_address must be a valid hex address (42 chars with 0x prefix)"
            ));
        }
        hex::decode(&self.evm.bridge_address[2..])
            .wrap_err("evm.bridge_address must be hex")?;

        if self.evm.private_key.len() != 66 || !self.evm.private_key.starts_with("0x") {
            return Err(eyre!("evm.private_key must be 66 chars (0x + 64 hex chars)"));
        }

        if self.evm.max_block_range == 0 {
            return Err(eyre!("evm.max_block_range must be positive"));
        }

        if self.evm.gas_price_multiplier_pct < 100 {
            return Err(eyre!("GAS_PRICE_MULTIPLIER_PCT must be at least 100"));
        }

        self.solana.program_id()?;

        if self.solana.keypair.is_empty() {
            return Err(eyre!("solana.keypair cannot be empty"));
        }

        if self.watcher.poll_interval_ms == 0 || self.watcher.recv_timeout_ms == 0 {
            return Err(eyre!("poll and receive intervals must be positive"));
        }

        if self.oracle.checkpoint_interval_blocks == 0 {
            return Err(eyre!("CHECKPOINT_INTERVAL_BLOCKS must be positive"));
        }

        if self.fees.target == 0 || self.fees.denominator == 0 {
            return Err(eyre!("fee target and denominator must be positive"));
        }

        if self.fees.window_secs == 0 {
            return Err(eyre!("FEE_WINDOW_SECS must be positive"));
        }

        if self.fees.gas_cost_scaler_dp == 0 {
            return Err(eyre!("GAS_COST_SCALER_DP must be positive"));
        }

        Ok(())
    }
}

fn validate_url(key: &str, value: &str, schemes: &[&str]) -> Result<()> {
    let parsed = url::Url::parse(value).wrap_err_with(|| format!("{} is not a valid URL", key))?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(eyre!(
            "{} must use one of {:?}, got {}",
            key,
            schemes,
            parsed.scheme()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "NETWORK",
        "EVM_RPC_URL",
        "EVM_WATCH_URL",
        "EVM_CHAIN_ID",
        "EVM_BRIDGE_ADDRESS",
        "EVM_PRIVATE_KEY",
        "SOLANA_RPC_URL",
        "SOLANA_WATCH_URL",
        "SOLANA_PROGRAM_ID",
        "SOLANA_KEYPAIR",
        "GAS_PRICE_MULTIPLIER_PCT",
        "AUTO_RELAY",
    ];

    fn set_required_env() {
        for key in VARS {
            env::remove_var(key);
        }
        env::set_var("EVM_RPC_URL", "http://localhost:8545");
        env::set_var("EVM_CHAIN_ID", "8453");
        env::set_var(
            "EVM_BRIDGE_ADDRESS",
            "0x0000000000000000000000000000000000000001",
        );
        env::set_var(
            "EVM_PRIVATE_KEY",
            "0x0000000000000000000000000000000000000000000000000000000000000001",
        );
        env::set_var("SOLANA_RPC_URL", "http://localhost:8899");
        env::set_var(
            "SOLANA_PROGRAM_ID",
            "11111111111111111111111111111111",
        );
        env::set_var("SOLANA_KEYPAIR", "/nonexistent/id.json");
    }

    #[test]
    fn test_defaults() {
        assert_eq!(default_poll_interval(), 2000);
        assert_eq!(default_recv_timeout(), 5000);
        assert_eq!(default_gas_price_multiplier_pct(), 120);
        assert_eq!(default_checkpoint_interval(), 300);
    }

    #[test]
    #[serial]
    fn test_load_from_env_with_defaults() {
        set_required_env();
        let config = Config::load_from_env().unwrap();
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.evm.watch_url, "http://localhost:8545");
        assert_eq!(config.solana.watch_url, "http://localhost:8899");
        assert_eq!(config.evm.gas_price_multiplier_pct, 120);
        assert!(!config.oracle.auto_relay);
        assert_eq!(config.fees.gas_cost_scaler, 1_000_000);
    }

    #[test]
    #[serial]
    fn test_overrides() {
        set_required_env();
        env::set_var("NETWORK", "mainnet");
        env::set_var("EVM_WATCH_URL", "wss://base.example/ws");
        env::set_var("AUTO_RELAY", "true");
        let config = Config::load_from_env().unwrap();
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.network.commitment(), CommitmentConfig::finalized());
        assert_eq!(config.evm.watch_url, "wss://base.example/ws");
        assert!(config.oracle.auto_relay);
    }

    #[test]
    #[serial]
    fn test_missing_required_var() {
        set_required_env();
        env::remove_var("EVM_BRIDGE_ADDRESS");
        let err = Config::load_from_env().unwrap_err();
        assert!(err.to_string().contains("EVM_BRIDGE_ADDRESS"));
    }

    #[test]
    #[serial]
    fn test_invalid_values_rejected() {
        set_required_env();
        env::set_var("EVM_BRIDGE_ADDRESS", "0x1234");
        assert!(Config::load_from_env().is_err());

        set_required_env();
        env::set_var("SOLANA_PROGRAM_ID", "not-a-pubkey");
        assert!(Config::load_from_env().is_err());

        set_required_env();
        env::set_var("GAS_PRICE_MULTIPLIER_PCT", "90");
        assert!(Config::load_from_env().is_err());

        set_required_env();
        env::set_var("NETWORK", "moon");
        assert!(Config::load_from_env().is_err());

        set_required_env();
        env::set_var("EVM_WATCH_URL", "ftp://example.org");
        assert!(Config::load_from_env().is_err());
    }

    #[test]
    #[serial]
    fn test_debug_redacts_secrets() {
        set_required_env();
        let config = Config::load_from_env().unwrap();
        let debug = format!("{:?}", config);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(&config.evm.private_key));
    }

    #[test]
    fn test_keypair_from_base58() {
        let keypair = Keypair::new();
        let solana = SolanaConfig {
            rpc_url: "http://localhost:8899".to_string(),
            watch_url: "http://localhost:8899".to_string(),
            program_id: "11111111111111111111111111111111".to_string(),
            keypair: keypair.to_base58_string(),
            start_slot: None,
        };
        let loaded = solana.load_keypair().unwrap();
        assert_eq!(loaded.to_bytes(), keypair.to_bytes());
    }
}
