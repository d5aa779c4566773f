// ===============================
// src/config.rs
// ===============================
use std::env;

use dotenvy::dotenv;
use thiserror::Error;

use crate::domain::Side;

/// Which Delta deployment we trade against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeMode {
    Demo,
    Live,
}

impl ExchangeMode {
    pub fn from_env(key: &str, default_mode: ExchangeMode) -> ExchangeMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "demo" | "testnet" => ExchangeMode::Demo,
            "live" | "mainnet" => ExchangeMode::Live,
            _ => default_mode,
        }
    }

    // Endpoint defaults per mode
    pub fn default_rest_url(&self) -> &'static str {
        match self {
            ExchangeMode::Demo => "https://cdn-ind.testnet.deltaex.org",
            ExchangeMode::Live => "https://api.india.delta.exchange",
        }
    }

    pub fn default_ws_url(&self) -> &'static str {
        match self {
            ExchangeMode::Demo => "wss://socket-ind.testnet.deltaex.org",
            ExchangeMode::Live => "wss://socket.india.delta.exchange",
        }
    }

    /// Uppercase token embedded in client order ids, so demo and live
    /// runs can never collide on identity.
    pub fn env_token(&self) -> &'static str {
        match self {
            ExchangeMode::Demo => "DEMO",
            ExchangeMode::Live => "LIVE",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Grid/martingale parameters. Validated once at load time; the strategy
/// engine itself never re-checks them.
#[derive(Clone, Debug)]
pub struct StrategyConfig {
    pub seed_side: Side,
    pub seed_offset_usd: f64,
    pub tp_step_usd: f64,
    pub avg_step_usd: f64,
    pub avg_multiplier: u32,
    pub max_total_lots: u32,
}

#[derive(Clone, Debug)]
pub struct BotConfig {
    pub symbol: String,
    pub mode: ExchangeMode,
    pub rest_url: String,
    pub fallback_rest_url: Option<String>,
    pub ws_url: String,

    pub poll_interval_ms: u64,
    pub leverage: Option<u32>,
    pub use_post_only: bool,
    pub shade_ticks: i64,
    pub follow_threshold_ticks: i64,
    pub placement_guard_secs: u64,
    /// WS mark price older than this falls back to a REST ticker query.
    pub mark_price_max_age_secs: i64,

    pub metrics_port: u16,
    pub strategy: StrategyConfig,
}

#[derive(Clone, Debug)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

fn env_parsed<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            key,
            reason: format!("cannot parse {raw:?}"),
        }),
    }
}

fn require_positive(key: &'static str, v: f64) -> Result<f64, ConfigError> {
    if v > 0.0 {
        Ok(v)
    } else {
        Err(ConfigError::Invalid { key, reason: format!("must be > 0, got {v}") })
    }
}

pub fn load() -> Result<(BotConfig, Credentials), ConfigError> {
    // Make sure .env is read before anything else
    let _ = dotenv();

    let api_key = env::var("API_KEY").map_err(|_| ConfigError::Missing("API_KEY"))?;
    let api_secret = env::var("API_SECRET").map_err(|_| ConfigError::Missing("API_SECRET"))?;

    let symbol = env::var("SYMBOL")
        .unwrap_or_else(|_| "BTCUSD".to_string())
        .to_ascii_uppercase();
    let mode = ExchangeMode::from_env("DELTA_MODE", ExchangeMode::Demo);

    let rest_url =
        env::var("DELTA_REST_URL").unwrap_or_else(|_| mode.default_rest_url().to_string());
    let fallback_rest_url = env::var("DELTA_FALLBACK_REST_URL").ok();
    let ws_url = env::var("DELTA_WS_URL").unwrap_or_else(|_| mode.default_ws_url().to_string());

    let poll_interval_ms: u64 = env_parsed("POLL_INTERVAL_MS", 1000)?.max(200);
    let leverage = match env::var("LEVERAGE") {
        Err(_) => None,
        Ok(raw) => Some(raw.parse().map_err(|_| ConfigError::Invalid {
            key: "LEVERAGE",
            reason: format!("cannot parse {raw:?}"),
        })?),
    };
    let use_post_only: bool = env_parsed("POST_ONLY", true)?;

    let shade_ticks: i64 = env_parsed("SHADE_TICKS", 1)?;
    if shade_ticks < 0 {
        return Err(ConfigError::Invalid {
            key: "SHADE_TICKS",
            reason: format!("must be >= 0, got {shade_ticks}"),
        });
    }
    let follow_threshold_ticks: i64 = env_parsed("FOLLOW_THRESHOLD_TICKS", 2)?;
    if follow_threshold_ticks < 0 {
        return Err(ConfigError::Invalid {
            key: "FOLLOW_THRESHOLD_TICKS",
            reason: format!("must be >= 0, got {follow_threshold_ticks}"),
        });
    }
    let placement_guard_secs: u64 = env_parsed("PLACEMENT_GUARD_SECS", 30)?;
    let mark_price_max_age_secs: i64 = env_parsed("MARK_PRICE_MAX_AGE_SECS", 10)?;

    let metrics_port: u16 = env_parsed("METRICS_PORT", 9898)?;

    // ===== Strategy =====
    let seed_side = match env::var("SEED_SIDE")
        .unwrap_or_else(|_| "buy".to_string())
        .to_ascii_lowercase()
        .as_str()
    {
        "buy" => Side::Buy,
        "sell" => Side::Sell,
        other => {
            return Err(ConfigError::Invalid {
                key: "SEED_SIDE",
                reason: format!("expected buy|sell, got {other:?}"),
            })
        }
    };
    let seed_offset_usd = require_positive("SEED_OFFSET_USD", env_parsed("SEED_OFFSET_USD", 5.0)?)?;
    let tp_step_usd = require_positive("TP_STEP_USD", env_parsed("TP_STEP_USD", 20.0)?)?;
    let avg_step_usd = require_positive("AVG_STEP_USD", env_parsed("AVG_STEP_USD", 20.0)?)?;
    let avg_multiplier: u32 = env_parsed("AVG_MULTIPLIER", 1)?;
    if avg_multiplier < 1 {
        return Err(ConfigError::Invalid {
            key: "AVG_MULTIPLIER",
            reason: "must be >= 1".to_string(),
        });
    }
    let max_total_lots: u32 = env_parsed("MAX_TOTAL_LOTS", 10)?;
    if max_total_lots < 1 {
        return Err(ConfigError::Invalid {
            key: "MAX_TOTAL_LOTS",
            reason: "must be >= 1".to_string(),
        });
    }

    let strategy = StrategyConfig {
        seed_side,
        seed_offset_usd,
        tp_step_usd,
        avg_step_usd,
        avg_multiplier,
        max_total_lots,
    };

    let cfg = BotConfig {
        symbol,
        mode,
        rest_url,
        fallback_rest_url,
        ws_url,
        poll_interval_ms,
        leverage,
        use_post_only,
        shade_ticks,
        follow_threshold_ticks,
        placement_guard_secs,
        mark_price_max_age_secs,
        metrics_port,
        strategy,
    };
    let creds = Credentials { api_key, api_secret };
    Ok((cfg, creds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_tokens_differ() {
        assert_ne!(ExchangeMode::Demo.env_token(), ExchangeMode::Live.env_token());
        assert_ne!(
            ExchangeMode::Demo.default_rest_url(),
            ExchangeMode::Live.default_rest_url()
        );
    }

    #[test]
    fn positive_check_rejects_zero_step() {
        assert!(require_positive("TP_STEP_USD", 0.0).is_err());
        assert!(require_positive("TP_STEP_USD", -1.5).is_err());
        assert!(require_positive("TP_STEP_USD", 0.5).is_ok());
    }
}
