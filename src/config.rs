//! Process configuration: environment variables and the JSON config
//! files under `config/`.
//!
//! Validation is fatal at load; a collection entry that fails its
//! invariants rejects the whole file rather than silently bidding with
//! bad bounds.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::models::CollectionConfig;
use crate::pricing;

fn env_bool(var: &str, default: bool) -> bool {
    env::var(var)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Environment-derived settings (see `.env`).
#[derive(Debug, Clone)]
pub struct BotEnv {
    /// Marketplace API key, sent as `X-NFT-API-Key` on every request.
    pub api_key: String,
    /// Funding wallet WIF for single-wallet setups; opaque here.
    pub funding_wif: Option<String>,
    /// Receive address used when centralizing won items.
    pub token_receive_address: Option<String>,
    /// Shared marketplace request budget, requests per second.
    pub rate_limit: u32,
    /// Fallback outbid margin (BTC) for collections that omit one.
    pub default_outbid_margin: f64,
    /// Fallback scheduled-loop interval in seconds.
    pub default_loop_secs: u64,
    /// Per-wallet bid budget per minute.
    pub bids_per_minute: u32,
    pub enable_wallet_rotation: bool,
    pub wallet_config_path: PathBuf,
    pub wallet_passphrase: Option<String>,
    pub enable_address_rotation: bool,
    pub address_pool_size: usize,
    pub address_pool_seed: Option<String>,
    /// Send every win to `token_receive_address` instead of the bidding
    /// wallet's own taproot address.
    pub centralize_receive_address: bool,
    /// Status API port.
    pub api_port: u16,
}

impl BotEnv {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let api_key = env::var("API_KEY").unwrap_or_default();
        if api_key.trim().is_empty() {
            bail!("API_KEY is not set");
        }

        Ok(Self {
            api_key,
            funding_wif: env::var("FUNDING_WIF").ok().filter(|v| !v.is_empty()),
            token_receive_address: env::var("TOKEN_RECEIVE_ADDRESS")
                .ok()
                .filter(|v| !v.is_empty()),
            rate_limit: env_parse("RATE_LIMIT", 8u32).max(1),
            default_outbid_margin: env_parse("DEFAULT_OUTBID_MARGIN", 0.000001f64),
            default_loop_secs: env_parse("DEFAULT_LOOP", 600u64).max(1),
            bids_per_minute: env_parse("BIDS_PER_MINUTE", 10u32).max(1),
            enable_wallet_rotation: env_bool("ENABLE_WALLET_ROTATION", false),
            wallet_config_path: PathBuf::from(
                env::var("WALLET_CONFIG_PATH")
                    .unwrap_or_else(|_| "config/wallets.json".to_string()),
            ),
            wallet_passphrase: env::var("WALLET_PASSPHRASE").ok().filter(|v| !v.is_empty()),
            enable_address_rotation: env_bool("ENABLE_ADDRESS_ROTATION", false),
            address_pool_size: env_parse("ADDRESS_POOL_SIZE", 0usize),
            address_pool_seed: env::var("ADDRESS_POOL_SEED").ok().filter(|v| !v.is_empty()),
            centralize_receive_address: env_bool("CENTRALIZE_RECEIVE_ADDRESS", false),
            api_port: env_parse("API_PORT", 8900u16),
        })
    }
}

/// Load and validate `config/collections.json`.
///
/// Entries that omit `outBidMargin` or `scheduledLoop` inherit the
/// environment defaults; an explicit zero margin stays zero (it still
/// outbids by one sat).
pub fn load_collections(path: &Path, env_cfg: &BotEnv) -> Result<Vec<CollectionConfig>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read collections config {}", path.display()))?;
    let mut entries: Vec<serde_json::Value> = serde_json::from_slice(&bytes)
        .with_context(|| format!("invalid collections config {}", path.display()))?;

    for entry in &mut entries {
        let Some(obj) = entry.as_object_mut() else {
            bail!("collections config entries must be objects");
        };
        obj.entry("outBidMargin")
            .or_insert_with(|| serde_json::json!(env_cfg.default_outbid_margin));
        obj.entry("scheduledLoop")
            .or_insert_with(|| serde_json::json!(env_cfg.default_loop_secs));
    }

    let configs: Vec<CollectionConfig> = serde_json::from_value(serde_json::Value::Array(entries))
        .with_context(|| format!("invalid collections config {}", path.display()))?;

    validate_collections(&configs)?;
    info!(
        collections = configs.len(),
        path = %path.display(),
        "collections config loaded"
    );
    Ok(configs)
}

pub fn validate_collections(configs: &[CollectionConfig]) -> Result<()> {
    if configs.is_empty() {
        bail!("collections config has no entries");
    }

    let mut seen = HashSet::new();
    for cfg in configs {
        let symbol = cfg.collection_symbol.as_str();
        if symbol.trim().is_empty() {
            bail!("collection entry with empty symbol");
        }
        if !seen.insert(symbol) {
            bail!("duplicate collection symbol '{}'", symbol);
        }
        if cfg.min_bid > cfg.max_bid {
            bail!("{}: minBid {} exceeds maxBid {}", symbol, cfg.min_bid, cfg.max_bid);
        }
        if cfg.min_floor_bid > cfg.max_floor_bid {
            bail!(
                "{}: minFloorBid {} exceeds maxFloorBid {}",
                symbol,
                cfg.min_floor_bid,
                cfg.max_floor_bid
            );
        }
        if let Err(rejection) = pricing::check_floor_cap(cfg) {
            bail!("{}: {}", symbol, rejection);
        }
        if cfg.quantity == 0 {
            bail!("{}: quantity must be at least 1", symbol);
        }
        if cfg.bid_count == 0 {
            bail!("{}: bidCount must be at least 1", symbol);
        }
        if cfg.scheduled_loop == 0 {
            bail!("{}: scheduledLoop must be at least 1 second", symbol);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_env() -> BotEnv {
        BotEnv {
            api_key: "test-key".to_string(),
            funding_wif: None,
            token_receive_address: None,
            rate_limit: 8,
            default_outbid_margin: 0.000002,
            default_loop_secs: 120,
            bids_per_minute: 10,
            enable_wallet_rotation: true,
            wallet_config_path: PathBuf::from("config/wallets.json"),
            wallet_passphrase: None,
            enable_address_rotation: false,
            address_pool_size: 0,
            address_pool_seed: None,
            centralize_receive_address: false,
            api_port: 8900,
        }
    }

    fn write_collections(json: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collections.json");
        std::fs::write(&path, json).unwrap();
        (dir, path)
    }

    #[test]
    fn test_env_defaults_fill_omitted_fields() {
        let (_dir, path) = write_collections(
            r#"[{"collectionSymbol": "frogs", "minBid": 0.0001, "maxBid": 0.0002}]"#,
        );
        let configs = load_collections(&path, &test_env()).unwrap();
        assert_eq!(configs[0].out_bid_margin, 0.000002);
        assert_eq!(configs[0].scheduled_loop, 120);
    }

    #[test]
    fn test_explicit_zero_margin_survives() {
        let (_dir, path) = write_collections(
            r#"[{"collectionSymbol": "frogs", "minBid": 0.0001, "maxBid": 0.0002, "outBidMargin": 0}]"#,
        );
        let configs = load_collections(&path, &test_env()).unwrap();
        assert_eq!(configs[0].out_bid_margin, 0.0);
        assert_eq!(configs[0].out_bid_margin_sats(), 1);
    }

    #[test]
    fn test_min_bid_above_max_rejected() {
        let (_dir, path) = write_collections(
            r#"[{"collectionSymbol": "frogs", "minBid": 0.001, "maxBid": 0.0002}]"#,
        );
        assert!(load_collections(&path, &test_env()).is_err());
    }

    #[test]
    fn test_floor_cap_rejected_without_traits() {
        let (_dir, path) = write_collections(
            r#"[{"collectionSymbol": "frogs", "minBid": 0.0001, "maxBid": 0.0002, "maxFloorBid": 101}]"#,
        );
        assert!(load_collections(&path, &test_env()).is_err());
    }

    #[test]
    fn test_duplicate_symbols_rejected() {
        let (_dir, path) = write_collections(
            r#"[
                {"collectionSymbol": "frogs", "minBid": 0.0001, "maxBid": 0.0002},
                {"collectionSymbol": "frogs", "minBid": 0.0001, "maxBid": 0.0002}
            ]"#,
        );
        assert!(load_collections(&path, &test_env()).is_err());
    }
}
