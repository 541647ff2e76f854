//! Node configuration: defaults, a TOML file, `TEMPO_*` environment
//! variables, and CLI flags, merged in that order.

use std::path::PathBuf;

use alloy_primitives::Address;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    value::{Dict, Map},
    Figment, Metadata, Profile, Provider,
};
use serde::{Deserialize, Serialize};

use crate::{engine::EngineAuth, errors::FatalError};

/// The full node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// API bind host
    pub rpc_addr: String,
    /// API bind port
    pub rpc_port: u16,
    /// L1 JSON-RPC endpoint
    pub l1_rpc_url: String,
    /// L1 chain id
    pub l1_chain_id: u64,
    /// Hex-encoded sequencer signing key; unset disables L1 submission
    pub sequencer_key: Option<String>,
    /// Execution-client read endpoint
    pub l2_rpc_url: String,
    /// Execution-client engine-API endpoint
    pub l2_engine_url: String,
    /// Hex-encoded shared HMAC secret; unset makes engine calls fail
    pub jwt_secret: Option<String>,
    /// Batch size limit in blocks
    pub batch_size_limit: usize,
    /// Batch size limit in serialized bytes
    pub batch_byte_limit: usize,
    /// Flush a non-empty batch older than this many milliseconds
    pub batch_max_age_ms: u64,
    /// Block gas limit
    pub block_gas_limit: u64,
    /// Sequencing tick interval in milliseconds
    pub tick_interval_ms: u64,
    /// Count cap on transactions per built block
    pub max_txs_per_block: usize,
    /// Mempool capacity in entries
    pub mempool_capacity: usize,
    /// Mempool WAL path; defaults to `~/.tempo/wal` when unset
    pub wal_path: Option<PathBuf>,
    /// WAL fsync cadence in milliseconds; zero syncs every record
    pub wal_fsync_interval_ms: u64,
    /// Metrics port
    pub metrics_port: u16,
    /// Emergency halt flag: refuse all admissions
    pub halted: bool,
    /// Admission rate limit per second
    pub admission_rate_limit: u64,
    /// Batch-inbox address on L1; unset derives from every transaction
    pub batch_inbox: Option<Address>,
    /// Stateless-execution precompile the ExecuteTx targets
    pub execute_tx_target: Option<Address>,
    /// Suggested coinbase for built payloads
    pub fee_recipient: Address,
    /// L1 depth at which derived blocks finalize
    pub confirmation_depth: u64,
    /// First L1 block the derivation reader consumes
    pub l1_start_block: u64,
    /// Fee cap for submitted envelopes, in wei
    pub max_fee_per_gas: u64,
    /// Tip cap for submitted envelopes, in wei
    pub max_priority_fee_per_gas: u64,
    /// Gas limit for submitted envelopes
    pub execute_gas_limit: u64,
    /// Confirmations to wait after batch submission
    pub submit_confirmations: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_addr: "0.0.0.0".to_string(),
            rpc_port: 8545,
            l1_rpc_url: "http://localhost:8545".to_string(),
            l1_chain_id: 1,
            sequencer_key: None,
            l2_rpc_url: "http://localhost:8546".to_string(),
            l2_engine_url: "http://localhost:8551".to_string(),
            jwt_secret: None,
            batch_size_limit: 1000,
            batch_byte_limit: 128 * 1024,
            batch_max_age_ms: 600_000,
            block_gas_limit: 30_000_000,
            tick_interval_ms: 2000,
            max_txs_per_block: 1000,
            mempool_capacity: 100_000,
            wal_path: None,
            wal_fsync_interval_ms: 0,
            metrics_port: 9090,
            halted: false,
            admission_rate_limit: 1000,
            batch_inbox: None,
            execute_tx_target: None,
            fee_recipient: Address::ZERO,
            confirmation_depth: 12,
            l1_start_block: 0,
            max_fee_per_gas: 100_000_000_000,
            max_priority_fee_per_gas: 2_000_000_000,
            execute_gas_limit: 10_000_000,
            submit_confirmations: 1,
        }
    }
}

impl Config {
    /// Loads configuration: defaults, then the TOML file, then `TEMPO_*`
    /// env vars, then CLI overrides.
    pub fn load(cli: CliConfig) -> Result<Self, FatalError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = &cli.config {
            figment = figment.merge(Toml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed("TEMPO_"))
            .merge(cli)
            .extract()
            .map_err(|e| FatalError::ConfigInvalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the node cannot run with.
    pub fn validate(&self) -> Result<(), FatalError> {
        if self.tick_interval_ms == 0 {
            return Err(FatalError::ConfigInvalid(
                "tick_interval_ms must be positive".to_string(),
            ));
        }
        if self.mempool_capacity == 0 {
            return Err(FatalError::ConfigInvalid(
                "mempool_capacity must be positive".to_string(),
            ));
        }
        if self.batch_size_limit == 0 {
            return Err(FatalError::ConfigInvalid(
                "batch_size_limit must be positive".to_string(),
            ));
        }
        if let Some(secret) = &self.jwt_secret {
            EngineAuth::from_hex(secret)
                .map_err(|e| FatalError::ConfigInvalid(format!("jwt_secret: {e}")))?;
        }
        if let Some(key) = &self.sequencer_key {
            let digits = key.strip_prefix("0x").unwrap_or(key);
            let bytes = hex::decode(digits)
                .map_err(|e| FatalError::ConfigInvalid(format!("sequencer_key: {e}")))?;
            secp256k1::SecretKey::from_slice(&bytes)
                .map_err(|e| FatalError::ConfigInvalid(format!("sequencer_key: {e}")))?;
        }
        Ok(())
    }

    /// The parsed sequencer signing key, if configured.
    pub fn sequencer_secret_key(&self) -> Option<secp256k1::SecretKey> {
        let key = self.sequencer_key.as_ref()?;
        let digits = key.strip_prefix("0x").unwrap_or(key);
        let bytes = hex::decode(digits).ok()?;
        secp256k1::SecretKey::from_slice(&bytes).ok()
    }

    /// The WAL path, defaulting to the home data dir when unset.
    pub fn wal_path_or_default(&self) -> PathBuf {
        self.wal_path.clone().unwrap_or_else(|| {
            let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
            path.push(".tempo");
            path.push("wal");
            path
        })
    }
}

/// CLI flags; every field overrides the merged file/env configuration.
#[derive(Debug, Clone, Default, clap::Parser, Serialize)]
pub struct CliConfig {
    /// Path to a TOML configuration file
    #[clap(long, short = 'c')]
    #[serde(skip_serializing)]
    pub config: Option<PathBuf>,
    /// Verbose logging
    #[clap(long, short = 'v')]
    #[serde(skip_serializing)]
    pub verbose: bool,
    /// API bind port
    #[clap(long)]
    pub rpc_port: Option<u16>,
    /// L1 JSON-RPC endpoint
    #[clap(long)]
    pub l1_rpc_url: Option<String>,
    /// Execution-client read endpoint
    #[clap(long)]
    pub l2_rpc_url: Option<String>,
    /// Execution-client engine-API endpoint
    #[clap(long)]
    pub l2_engine_url: Option<String>,
    /// Hex-encoded engine JWT secret
    #[clap(long, env = "TEMPO_JWT_SECRET")]
    pub jwt_secret: Option<String>,
    /// Hex-encoded sequencer signing key
    #[clap(long, env = "TEMPO_SEQUENCER_KEY")]
    pub sequencer_key: Option<String>,
    /// Mempool WAL path
    #[clap(long)]
    pub wal_path: Option<PathBuf>,
    /// Sequencing tick interval in milliseconds
    #[clap(long)]
    pub tick_interval_ms: Option<u64>,
}

impl Provider for CliConfig {
    fn metadata(&self) -> Metadata {
        Metadata::named("cli flags")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        let value = figment::value::Value::serialize(self)?;
        let mut dict = Dict::new();
        if let figment::value::Value::Dict(_, entries) = value {
            for (key, entry) in entries {
                // only present flags override the underlying configuration
                if !matches!(entry, figment::value::Value::Empty(_, _)) {
                    dict.insert(key, entry);
                }
            }
        }
        Ok(Profile::Default.collect(dict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.rpc_addr, "0.0.0.0");
        assert_eq!(config.rpc_port, 8545);
        assert_eq!(config.l1_chain_id, 1);
        assert_eq!(config.batch_size_limit, 1000);
        assert_eq!(config.block_gas_limit, 30_000_000);
        assert_eq!(config.tick_interval_ms, 2000);
        assert_eq!(config.mempool_capacity, 100_000);
        assert_eq!(config.metrics_port, 9090);
        assert!(!config.halted);
        assert_eq!(config.admission_rate_limit, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_tick_interval() {
        let config = Config {
            tick_interval_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(FatalError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn rejects_malformed_jwt_secret() {
        let config = Config {
            jwt_secret: Some("not-hex".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_sequencer_key() {
        let config = Config {
            sequencer_key: Some(format!("0x{}", "11".repeat(32))),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.sequencer_secret_key().is_some());
    }

    #[test]
    fn cli_flags_override_defaults() {
        let cli = CliConfig {
            rpc_port: Some(9999),
            ..Default::default()
        };
        let config = Config::load(cli).unwrap();
        assert_eq!(config.rpc_port, 9999);
        // untouched fields keep their defaults
        assert_eq!(config.rpc_addr, "0.0.0.0");
    }
}
