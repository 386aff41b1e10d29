//! Configuration management for the payjoin gateway
//!
//! Configuration is loaded from TOML files.
//!
//! # Example Configuration File
//!
//! ```toml
//! [node]
//! network = "regtest"
//! data_dir = "/var/lib/payjoin-gateway"
//!
//! [payjoin]
//! dust_threshold_sats = 546
//! proposal_timeout_minutes = 15
//! coin_cache_ttl_seconds = 30
//! fee_floor_sat_per_vb = 1
//!
//! [store]
//! default_payment_tolerance = 0
//!
//! [api]
//! bind_address = "0.0.0.0:8080"
//! ```

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node identity configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Payjoin negotiation configuration
    #[serde(default)]
    pub payjoin: PayjoinConfig,

    /// Invoice store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// API server configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network to run on (mainnet, testnet, signet, regtest)
    #[serde(default = "default_network")]
    pub network: String,

    /// Data directory for gateway state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_network() -> String {
    "regtest".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("payjoin-gateway"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Payjoin negotiation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayjoinConfig {
    /// Outputs below this value (satoshis) are dropped rather than created
    #[serde(default = "default_dust_threshold")]
    pub dust_threshold_sats: u64,

    /// How long a proposal may wait for broadcast before its reservation is
    /// released (minutes)
    #[serde(default = "default_proposal_timeout")]
    pub proposal_timeout_minutes: u64,

    /// How long a fetched coin set stays fresh (seconds)
    #[serde(default = "default_coin_cache_ttl")]
    pub coin_cache_ttl_seconds: u64,

    /// Static minimum relay fee rate (sat/vbyte), also the fallback when the
    /// fee API is unreachable
    #[serde(default = "default_fee_floor")]
    pub fee_floor_sat_per_vb: u64,

    /// Fee estimation API endpoint; unset disables remote lookup
    pub fee_api_url: Option<String>,
}

impl Default for PayjoinConfig {
    fn default() -> Self {
        Self {
            dust_threshold_sats: default_dust_threshold(),
            proposal_timeout_minutes: default_proposal_timeout(),
            coin_cache_ttl_seconds: default_coin_cache_ttl(),
            fee_floor_sat_per_vb: default_fee_floor(),
            fee_api_url: None,
        }
    }
}

fn default_dust_threshold() -> u64 {
    546
}

fn default_proposal_timeout() -> u64 {
    15
}

fn default_coin_cache_ttl() -> u64 {
    30
}

fn default_fee_floor() -> u64 {
    1
}

/// Invoice store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Payment tolerance (percent, 0-100) copied onto new invoices
    #[serde(default = "default_payment_tolerance")]
    pub default_payment_tolerance: Decimal,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_payment_tolerance: default_payment_tolerance(),
        }
    }
}

fn default_payment_tolerance() -> Decimal {
    Decimal::ZERO
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind the API server to
    #[serde(default = "default_api_bind")]
    pub bind_address: String,

    /// API request timeout in seconds
    #[serde(default = "default_api_timeout")]
    pub timeout_seconds: u64,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_bind(),
            timeout_seconds: default_api_timeout(),
            enable_cors: true,
        }
    }
}

fn default_api_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_api_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Get the API bind address
    pub fn api_bind_address(&self) -> String {
        self.api.bind_address.clone()
    }

    /// Check if running on mainnet
    pub fn is_mainnet(&self) -> bool {
        self.node.network == "mainnet"
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        let valid_networks = ["mainnet", "testnet", "signet", "regtest"];
        if !valid_networks.contains(&self.node.network.as_str()) {
            return Err(format!(
                "Invalid network: {}. Must be one of: {:?}",
                self.node.network, valid_networks
            ));
        }

        if self.payjoin.proposal_timeout_minutes == 0 {
            return Err("Proposal timeout must be at least 1 minute".to_string());
        }

        if self.payjoin.fee_floor_sat_per_vb == 0 {
            return Err("Fee floor must be at least 1 sat/vbyte".to_string());
        }

        let tolerance = self.store.default_payment_tolerance;
        if tolerance < Decimal::ZERO || tolerance > Decimal::from(100) {
            return Err(format!(
                "Default payment tolerance must be between 0 and 100, got {}",
                tolerance
            ));
        }

        if self.api.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!(
                "Invalid API bind address: {}",
                self.api.bind_address
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = Config::default();
        config.node.network = "lopnet".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.payjoin.proposal_timeout_minutes = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.store.default_payment_tolerance = dec!(150);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.api.bind_address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [payjoin]
            dust_threshold_sats = 1000

            [api]
            bind_address = "0.0.0.0:9090"
            "#,
        )
        .unwrap();

        assert_eq!(config.payjoin.dust_threshold_sats, 1000);
        assert_eq!(config.payjoin.proposal_timeout_minutes, 15);
        assert_eq!(config.api.bind_address, "0.0.0.0:9090");
        assert_eq!(config.node.network, "regtest");
        assert!(config.validate().is_ok());
    }
}
