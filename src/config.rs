use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::ledger::units::parse_units;
use crate::ledger::{EvmLedgerConfig, is_valid_address};
use crate::reward::IssuerSettings;

/// Configuration for the reward issuance service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardConfig {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Ledger backend configuration
    pub ledger: LedgerConfig,
    /// Reward amounts and token metadata
    pub reward: RewardSettings,
    /// Transfer queue configuration
    pub queue: QueueConfig,
    /// Confirmation tracking configuration
    pub confirmation: ConfirmationConfig,
    /// Audit database configuration
    pub database: DatabaseConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Security configuration
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerMode {
    /// Process-local ledger (development)
    Memory,
    /// ERC-20 contract behind a JSON-RPC signer node
    Evm,
}

impl FromStr for LedgerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(LedgerMode::Memory),
            "evm" => Ok(LedgerMode::Evm),
            other => Err(anyhow::anyhow!("Unknown ledger mode: {} (expected memory or evm)", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub mode: LedgerMode,
    /// JSON-RPC endpoint of a node that can sign for the custodial address
    pub rpc_url: String,
    /// ERC-20 token contract address
    pub token_contract: String,
    /// The only address rewards are paid from
    pub custodial_address: String,
    /// Bound on every ledger call
    pub timeout_secs: u64,
    /// Blocks on top of the inclusion block before a transfer counts as confirmed
    pub confirmations: u64,
    /// Gas limit for transfers; 0 lets the node estimate
    pub gas_limit: u64,
    /// Custodial balance in base units (memory mode only)
    pub memory_initial_balance: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardSettings {
    /// Amount granted per reward, in base units
    pub amount: u128,
    /// Per-request ceiling, in base units
    pub max_amount: u128,
    pub symbol: String,
    pub decimals: u8,
    /// How long a custodial balance read stays usable
    pub snapshot_freshness_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long a request waits for its turn and the ledger acknowledgement
    pub timeout_secs: u64,
    /// Depth at which a backlog warning is logged
    pub depth_warning: usize,
    /// How long funds stay reserved after an unknown submission outcome
    pub unresolved_hold_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    pub poll_interval_secs: u64,
    /// A transfer still unconfirmed after this long is marked failed
    pub timeout_secs: u64,
    /// Terminal transfers kept in memory
    pub history_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string; auditing is off when unset
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Require HTTPS for the ledger RPC endpoint
    pub require_https: bool,
    /// Reward requests per minute per requester
    pub rate_limit_per_minute: u32,
}

const ONE_TOKEN: u128 = 1_000_000_000_000_000_000;

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            ledger: LedgerConfig {
                mode: LedgerMode::Memory,
                rpc_url: "http://127.0.0.1:8545".to_string(),
                token_contract: String::new(),
                custodial_address: "0x0000000000000000000000000000000000c0ffee".to_string(),
                timeout_secs: 10,
                confirmations: 1,
                gas_limit: 100_000,
                memory_initial_balance: 1_000_000 * ONE_TOKEN,
            },
            reward: RewardSettings {
                amount: ONE_TOKEN,
                max_amount: 100 * ONE_TOKEN,
                symbol: "CTK".to_string(),
                decimals: 18,
                snapshot_freshness_secs: 15,
            },
            queue: QueueConfig {
                timeout_secs: 30,
                depth_warning: 100,
                unresolved_hold_secs: 600,
            },
            confirmation: ConfirmationConfig {
                poll_interval_secs: 5,
                timeout_secs: 600,
                history_limit: 10_000,
            },
            database: DatabaseConfig {
                url: None,
                max_connections: 5,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
            security: SecurityConfig {
                require_https: false,
                rate_limit_per_minute: 10,
            },
        }
    }
}

fn parse_var<T>(value: &str, name: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {} value", name))
}

impl RewardConfig {
    /// Load configuration from environment variables and validate it
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from any key lookup (the process environment in production)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Server configuration
        if let Some(host) = lookup("REWARD_HOST") {
            config.server.host = host;
        }
        if let Some(port) = lookup("REWARD_PORT") {
            config.server.port = parse_var(&port, "REWARD_PORT")?;
        }

        // Security configuration
        if let Some(require_https) = lookup("REWARD_REQUIRE_HTTPS") {
            config.security.require_https = parse_var(&require_https, "REWARD_REQUIRE_HTTPS")?;
        }
        if let Some(rate_limit) = lookup("REWARD_RATE_LIMIT_PER_MINUTE") {
            config.security.rate_limit_per_minute = parse_var(&rate_limit, "REWARD_RATE_LIMIT_PER_MINUTE")?;
        }

        // Ledger configuration
        if let Some(mode) = lookup("REWARD_LEDGER_MODE") {
            config.ledger.mode = mode.parse()?;
        }
        if let Some(rpc_url) = lookup("REWARD_RPC_URL").or_else(|| lookup("RPC_URL")) {
            config.ledger.rpc_url = rpc_url;
        }
        if let Some(contract) = lookup("REWARD_TOKEN_CONTRACT").or_else(|| lookup("TOKEN_CONTRACT")) {
            config.ledger.token_contract = contract;
        }
        if let Some(custodial) = lookup("REWARD_CUSTODIAL_ADDRESS") {
            config.ledger.custodial_address = custodial;
        }
        if let Some(timeout) = lookup("REWARD_LEDGER_TIMEOUT_SECS") {
            config.ledger.timeout_secs = parse_var(&timeout, "REWARD_LEDGER_TIMEOUT_SECS")?;
        }
        if let Some(confirmations) = lookup("REWARD_CONFIRMATIONS") {
            config.ledger.confirmations = parse_var(&confirmations, "REWARD_CONFIRMATIONS")?;
        }
        if let Some(gas_limit) = lookup("REWARD_GAS_LIMIT") {
            config.ledger.gas_limit = parse_var(&gas_limit, "REWARD_GAS_LIMIT")?;
        }

        // Token metadata first: amounts below are given in whole tokens
        if let Some(symbol) = lookup("REWARD_TOKEN_SYMBOL") {
            config.reward.symbol = symbol;
        }
        if let Some(decimals) = lookup("REWARD_TOKEN_DECIMALS") {
            config.reward.decimals = parse_var(&decimals, "REWARD_TOKEN_DECIMALS")?;
        }
        let decimals = config.reward.decimals;
        let tokens = |value: &str, name: &str| {
            parse_units(value, decimals)
                .ok_or_else(|| anyhow::anyhow!("Invalid {} value: {} (expected a token amount)", name, value))
        };

        if let Some(amount) = lookup("REWARD_AMOUNT") {
            config.reward.amount = tokens(&amount, "REWARD_AMOUNT")?;
        }
        if let Some(max_amount) = lookup("REWARD_MAX_AMOUNT") {
            config.reward.max_amount = tokens(&max_amount, "REWARD_MAX_AMOUNT")?;
        }
        if let Some(balance) = lookup("REWARD_MEMORY_INITIAL_BALANCE") {
            config.ledger.memory_initial_balance = tokens(&balance, "REWARD_MEMORY_INITIAL_BALANCE")?;
        }
        if let Some(freshness) = lookup("REWARD_BALANCE_FRESHNESS_SECS") {
            config.reward.snapshot_freshness_secs = parse_var(&freshness, "REWARD_BALANCE_FRESHNESS_SECS")?;
        }

        // Queue configuration
        if let Some(timeout) = lookup("REWARD_QUEUE_TIMEOUT_SECS") {
            config.queue.timeout_secs = parse_var(&timeout, "REWARD_QUEUE_TIMEOUT_SECS")?;
        }
        if let Some(depth) = lookup("REWARD_QUEUE_DEPTH_WARNING") {
            config.queue.depth_warning = parse_var(&depth, "REWARD_QUEUE_DEPTH_WARNING")?;
        }
        if let Some(hold) = lookup("REWARD_UNRESOLVED_HOLD_SECS") {
            config.queue.unresolved_hold_secs = parse_var(&hold, "REWARD_UNRESOLVED_HOLD_SECS")?;
        }

        // Confirmation configuration
        if let Some(interval) = lookup("REWARD_CONFIRMATION_POLL_SECS") {
            config.confirmation.poll_interval_secs = parse_var(&interval, "REWARD_CONFIRMATION_POLL_SECS")?;
        }
        if let Some(timeout) = lookup("REWARD_CONFIRMATION_TIMEOUT_SECS") {
            config.confirmation.timeout_secs = parse_var(&timeout, "REWARD_CONFIRMATION_TIMEOUT_SECS")?;
        }
        if let Some(limit) = lookup("REWARD_HISTORY_LIMIT") {
            config.confirmation.history_limit = parse_var(&limit, "REWARD_HISTORY_LIMIT")?;
        }

        // Database configuration
        config.database.url = lookup("REWARD_DATABASE_URL").filter(|url| !url.trim().is_empty());
        if let Some(max) = lookup("REWARD_DATABASE_MAX_CONNECTIONS") {
            config.database.max_connections = parse_var(&max, "REWARD_DATABASE_MAX_CONNECTIONS")?;
        }

        // Logging configuration
        if let Some(level) = lookup("REWARD_LOG_LEVEL") {
            config.logging.level = level;
        }

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration for consistency
    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            return Err(anyhow::anyhow!("Server host cannot be empty"));
        }
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port must be non-zero"));
        }

        if self.reward.amount == 0 {
            return Err(anyhow::anyhow!("Reward amount must be positive"));
        }
        if self.reward.amount > self.reward.max_amount {
            return Err(anyhow::anyhow!(
                "Reward amount {} exceeds the per-request maximum {}",
                self.reward.amount,
                self.reward.max_amount
            ));
        }
        if self.reward.symbol.is_empty() {
            return Err(anyhow::anyhow!("Token symbol cannot be empty"));
        }

        if self.ledger.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Ledger timeout must be non-zero"));
        }
        if self.queue.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Queue timeout must be non-zero"));
        }
        if self.confirmation.poll_interval_secs == 0 {
            return Err(anyhow::anyhow!("Confirmation poll interval must be non-zero"));
        }
        if self.confirmation.history_limit == 0 {
            return Err(anyhow::anyhow!("Transfer history limit must be non-zero"));
        }
        if self.security.rate_limit_per_minute == 0 {
            return Err(anyhow::anyhow!("Rate limit must be non-zero"));
        }

        if !is_valid_address(&self.ledger.custodial_address) {
            return Err(anyhow::anyhow!(
                "Custodial address is not a valid address: {}",
                self.ledger.custodial_address
            ));
        }

        if self.ledger.mode == LedgerMode::Evm {
            let rpc_url = Url::parse(&self.ledger.rpc_url).with_context(|| {
                format!("Invalid ledger RPC URL: {}", sanitize_for_logging(&self.ledger.rpc_url))
            })?;
            if self.security.require_https && rpc_url.scheme() != "https" {
                return Err(anyhow::anyhow!(
                    "HTTPS is required but ledger RPC URL is not HTTPS: {}",
                    sanitize_for_logging(&self.ledger.rpc_url)
                ));
            }
            if !is_valid_address(&self.ledger.token_contract) {
                return Err(anyhow::anyhow!(
                    "Token contract address is required in evm mode (REWARD_TOKEN_CONTRACT)"
                ));
            }
        }

        Ok(())
    }

    pub fn issuer_settings(&self) -> IssuerSettings {
        IssuerSettings {
            max_amount: self.reward.max_amount,
            snapshot_freshness: Duration::from_secs(self.reward.snapshot_freshness_secs),
            ledger_timeout: Duration::from_secs(self.ledger.timeout_secs),
            queue_timeout: Duration::from_secs(self.queue.timeout_secs),
            queue_depth_warning: self.queue.depth_warning,
            unresolved_hold: Duration::from_secs(self.queue.unresolved_hold_secs),
            confirmation_timeout: Duration::from_secs(self.confirmation.timeout_secs),
            history_limit: self.confirmation.history_limit,
        }
    }

    pub fn evm_ledger_config(&self) -> EvmLedgerConfig {
        EvmLedgerConfig {
            rpc_url: self.ledger.rpc_url.clone(),
            token_contract: self.ledger.token_contract.clone(),
            custodial_address: self.ledger.custodial_address.clone(),
            timeout_secs: self.ledger.timeout_secs,
            confirmations: self.ledger.confirmations,
            gas_limit: (self.ledger.gas_limit > 0).then_some(self.ledger.gas_limit),
        }
    }

    pub fn confirmation_interval(&self) -> Duration {
        Duration::from_secs(self.confirmation.poll_interval_secs)
    }
}

/// Mask credentials in URLs before they reach a log line.
///
/// RPC providers put API keys in the path (`/v2/<key>`) or query string, so
/// everything after the host is masked; userinfo passwords are dropped.
pub fn sanitize_for_logging(data: &str) -> String {
    match Url::parse(data) {
        Ok(url) if url.has_host() => {
            let mut masked = format!("{}://", url.scheme());
            if !url.username().is_empty() {
                masked.push_str(url.username());
                masked.push_str(":***@");
            }
            masked.push_str(url.host_str().unwrap_or_default());
            if let Some(port) = url.port() {
                masked.push_str(&format!(":{}", port));
            }
            if url.path() != "/" || url.query().is_some() {
                masked.push_str("/***");
            }
            masked
        }
        _ if data.is_ascii() && data.len() > 20 => format!("{}***{}", &data[..6], &data[data.len() - 6..]),
        _ => data.to_string(),
    }
}
