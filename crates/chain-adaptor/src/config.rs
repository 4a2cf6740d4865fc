//! Adaptor configuration, read from TOML.
//!
//! ```toml
//! network = "testnet"
//! log_level = "chain_btc=debug,info"
//! request_timeout_ms = 15000
//!
//! [fee]
//! floor_sat_per_vb = 2
//! default_target_blocks = 3
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use bitcoin::FeeRate;
use chain_btc::network::BtcNetwork;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::AdaptorError;

/// Largest confirmation target a node estimates for.
const MAX_TARGET_BLOCKS: u16 = 1008;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptorConfig {
    pub network: BtcNetwork,
    /// `EnvFilter` directive; `RUST_LOG` overrides it.
    pub log_level: String,
    /// Deadline for each request, in milliseconds.
    pub request_timeout_ms: u64,
    pub fee: FeeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    /// Lowest fee rate ever returned.
    pub floor_sat_per_vb: u64,
    /// Target used when a fee request names none.
    pub default_target_blocks: u16,
}

impl Default for AdaptorConfig {
    fn default() -> Self {
        Self {
            network: BtcNetwork::Mainnet,
            log_level: "info".into(),
            request_timeout_ms: 30_000,
            fee: FeeConfig::default(),
        }
    }
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            floor_sat_per_vb: 1,
            default_target_blocks: 6,
        }
    }
}

impl AdaptorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn fee_floor(&self) -> FeeRate {
        FeeRate::from_sat_per_vb(self.fee.floor_sat_per_vb).unwrap_or(FeeRate::BROADCAST_MIN)
    }

    /// Check value ranges, reporting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.request_timeout_ms == 0 {
            errors.push("request_timeout_ms must be > 0".to_string());
        }
        if self.fee.floor_sat_per_vb == 0 {
            errors.push("fee.floor_sat_per_vb must be > 0".to_string());
        } else if FeeRate::from_sat_per_vb(self.fee.floor_sat_per_vb).is_none() {
            errors.push("fee.floor_sat_per_vb is out of range".to_string());
        }
        if self.fee.default_target_blocks == 0 || self.fee.default_target_blocks > MAX_TARGET_BLOCKS {
            errors.push(format!(
                "fee.default_target_blocks must be between 1 and {MAX_TARGET_BLOCKS}"
            ));
        }
        if let Err(e) = EnvFilter::try_new(&self.log_level) {
            errors.push(format!("log_level {:?} is not a valid filter: {e}", self.log_level));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Parse and validate a TOML document.
pub fn from_toml_str(content: &str) -> Result<AdaptorConfig, AdaptorError> {
    let config: AdaptorConfig = toml::from_str(content)?;
    config.validate().map_err(AdaptorError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<AdaptorConfig, AdaptorError> {
    let content = fs::read_to_string(path)?;
    from_toml_str(&content)
}
