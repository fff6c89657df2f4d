//! Process configuration, resolved from environment variables.
//!
//! `.env` values are loaded by `main` before [`Config::from_env`] runs.
//! Missing optional settings degrade features (no signing key means verify-only
//! operation, no database means the finality confirmer stays off); malformed
//! settings are fatal [`ConfigError`]s and abort bootstrap with exit code 1.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::registry::Network;
use crate::types::EvmAddress;

const ENV_PORT: &str = "PORT";
const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
const ENV_FACILITATOR_MODE: &str = "FACILITATOR_MODE";
const ENV_DEFAULT_CHAIN: &str = "DEFAULT_CHAIN";
const ENV_PRIVATE_KEY: &str = "FACILITATOR_PRIVATE_KEY";
const ENV_TREASURY_ADDRESS: &str = "TREASURY_ADDRESS";
const ENV_DATABASE_URL: &str = "DATABASE_URL";
const ENV_IDEMPOTENCY_TTL_SECS: &str = "IDEMPOTENCY_TTL_SECS";
const ENV_RATE_LIMIT_MAX: &str = "RATE_LIMIT_MAX";
const ENV_RATE_LIMIT_WINDOW_SECS: &str = "RATE_LIMIT_WINDOW_SECS";
const ENV_CHAOSCHAIN_ENABLED: &str = "CHAOSCHAIN_ENABLED";

pub const DEFAULT_PORT: u16 = 8402;
pub const DEFAULT_IDEMPOTENCY_TTL_SECS: u64 = 300;
pub const DEFAULT_RATE_LIMIT_MAX: u32 = 60;
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// How settlements are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacilitatorMode {
    /// Settlements executed directly on-chain by this service.
    Managed,
    /// Settlements proxied to an external consensus workflow.
    Decentralized,
}

impl FacilitatorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FacilitatorMode::Managed => "managed",
            FacilitatorMode::Decentralized => "decentralized",
        }
    }
}

impl FromStr for FacilitatorMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "managed" => Ok(FacilitatorMode::Managed),
            "decentralized" => Ok(FacilitatorMode::Decentralized),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

/// Fixed-window rate limiter parameters.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    pub max_requests: u32,
    pub window: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("env {name} is not a valid number: {value}")]
    InvalidNumber { name: &'static str, value: String },
    #[error("Unknown facilitator mode: {0}")]
    InvalidMode(String),
    #[error("env {ENV_DEFAULT_CHAIN} names an unknown network: {0}")]
    UnknownDefaultChain(String),
    #[error("env {ENV_TREASURY_ADDRESS} is not a valid address: {0}")]
    InvalidTreasury(String),
    #[error("env {name} is not a valid URL: {value}")]
    InvalidUrl { name: &'static str, value: String },
}

/// Resolved process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub log_level: String,
    pub mode: FacilitatorMode,
    pub default_chain: Network,
    pub private_key: Option<String>,
    pub treasury_address: Option<EvmAddress>,
    pub database_url: Option<String>,
    pub idempotency_ttl: Duration,
    pub rate_limit: RateLimitSettings,
    pub chaoschain_enabled: bool,
    pub rpc_urls: HashMap<Network, Url>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match env::var(ENV_PORT) {
            Ok(value) => value.parse::<u16>().map_err(|_| ConfigError::InvalidNumber {
                name: ENV_PORT,
                value,
            })?,
            Err(_) => DEFAULT_PORT,
        };

        let log_level = env::var(ENV_LOG_LEVEL).unwrap_or_else(|_| "info".to_string());

        let mode = match env::var(ENV_FACILITATOR_MODE) {
            Ok(value) => value.parse()?,
            Err(_) => FacilitatorMode::Managed,
        };

        let default_chain = match env::var(ENV_DEFAULT_CHAIN) {
            Ok(value) => value
                .parse::<Network>()
                .map_err(|_| ConfigError::UnknownDefaultChain(value))?,
            Err(_) => Network::BaseSepolia,
        };

        let private_key = env::var(ENV_PRIVATE_KEY)
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());

        let treasury_address = match env::var(ENV_TREASURY_ADDRESS) {
            Ok(value) => Some(
                value
                    .parse::<EvmAddress>()
                    .map_err(|_| ConfigError::InvalidTreasury(value))?,
            ),
            Err(_) => None,
        };

        let database_url = env::var(ENV_DATABASE_URL).ok().filter(|s| !s.is_empty());

        let idempotency_ttl = Duration::from_secs(parse_env_number(
            ENV_IDEMPOTENCY_TTL_SECS,
            DEFAULT_IDEMPOTENCY_TTL_SECS,
        )?);

        let rate_limit = RateLimitSettings {
            max_requests: parse_env_number(ENV_RATE_LIMIT_MAX, DEFAULT_RATE_LIMIT_MAX)?,
            window: Duration::from_secs(parse_env_number(
                ENV_RATE_LIMIT_WINDOW_SECS,
                DEFAULT_RATE_LIMIT_WINDOW_SECS,
            )?),
        };

        let chaoschain_enabled = env::var(ENV_CHAOSCHAIN_ENABLED)
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let mut rpc_urls = HashMap::new();
        for network in Network::variants() {
            if let Ok(value) = env::var(network.rpc_env_var()) {
                if value.is_empty() {
                    continue;
                }
                let url = Url::parse(&value).map_err(|_| ConfigError::InvalidUrl {
                    name: network.rpc_env_var(),
                    value,
                })?;
                rpc_urls.insert(*network, url);
            }
        }

        Ok(Self {
            port,
            log_level,
            mode,
            default_chain,
            private_key,
            treasury_address,
            database_url,
            idempotency_ttl,
            rate_limit,
            chaoschain_enabled,
            rpc_urls,
        })
    }
}

fn parse_env_number<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn restore_env(key: &str, original: Option<String>) {
        if let Some(value) = original {
            // Safety: guarded by `ENV_LOCK`, so no concurrent environment mutation occurs.
            unsafe { env::set_var(key, value) };
        } else {
            // Safety: guarded by `ENV_LOCK`, so no concurrent environment mutation occurs.
            unsafe { env::remove_var(key) };
        }
    }

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        let originals: Vec<(&str, Option<String>)> = [ENV_PORT, ENV_FACILITATOR_MODE, ENV_DEFAULT_CHAIN]
            .iter()
            .map(|key| (*key, env::var(key).ok()))
            .collect();
        // Safety: guarded by `ENV_LOCK`, so no concurrent environment mutation occurs.
        unsafe {
            env::remove_var(ENV_PORT);
            env::remove_var(ENV_FACILITATOR_MODE);
            env::remove_var(ENV_DEFAULT_CHAIN);
        }

        let config = Config::from_env().expect("config");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.mode, FacilitatorMode::Managed);
        assert_eq!(config.default_chain, Network::BaseSepolia);
        assert_eq!(
            config.idempotency_ttl,
            Duration::from_secs(DEFAULT_IDEMPOTENCY_TTL_SECS)
        );

        for (key, original) in originals {
            restore_env(key, original);
        }
    }

    #[test]
    fn malformed_port_is_fatal() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        let original = env::var(ENV_PORT).ok();
        // Safety: guarded by `ENV_LOCK`, so no concurrent environment mutation occurs.
        unsafe { env::set_var(ENV_PORT, "not-a-port") };

        let error = Config::from_env().unwrap_err();
        assert!(matches!(error, ConfigError::InvalidNumber { .. }));

        restore_env(ENV_PORT, original);
    }

    #[test]
    fn unknown_default_chain_is_fatal() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        let original = env::var(ENV_DEFAULT_CHAIN).ok();
        // Safety: guarded by `ENV_LOCK`, so no concurrent environment mutation occurs.
        unsafe { env::set_var(ENV_DEFAULT_CHAIN, "dogechain") };

        let error = Config::from_env().unwrap_err();
        assert!(matches!(error, ConfigError::UnknownDefaultChain(_)));

        restore_env(ENV_DEFAULT_CHAIN, original);
    }
}
