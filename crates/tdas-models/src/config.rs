use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::opinion::Role;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Provider weights must sum to 1.00, got {0}")]
    WeightSum(Decimal),

    #[error("Weight for {role} out of range [0, 1]: {weight}")]
    WeightRange { role: Role, weight: Decimal },

    #[error("Expected exactly one provider for role {role}, found {count}")]
    ProviderRoles { role: Role, count: usize },

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level configuration for TDAS.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TdasConfig {
    pub context: ContextConfig,
    pub providers: ProvidersConfig,
    pub weights: WeightsConfig,
    pub sizing: SizingConfig,
    pub gate: GateConfig,
    pub router: RouterConfig,
    pub ledger: LedgerConfig,
    pub logging: LoggingConfig,
}

impl TdasConfig {
    /// Check every configuration-time invariant. Run before building anything from the config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.weights.validate()?;
        self.providers.validate()?;
        self.sizing.validate()?;
        self.ledger.validate()?;
        Ok(())
    }
}

/// Configuration for the market-context cache reader.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContextConfig {
    /// Path to the shared SQLite cache file (written by data pipelines, read by TDAS).
    pub sqlite_path: String,
    /// Maximum number of entries in the in-memory moka cache.
    pub memory_max_capacity: u64,
    /// How long to keep a read in memory, in seconds.
    pub memory_ttl_seconds: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "data/tdas_cache.db".to_string(),
            memory_max_capacity: 10_000,
            memory_ttl_seconds: 5,
        }
    }
}

/// Configuration for a single opinion provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub name: String,
    pub role: Role,
    /// External scoring program. Receives the scoring request as JSON on stdin.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Overrides `ProvidersConfig::default_timeout_ms`.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProvidersConfig {
    pub default_timeout_ms: u64,
    /// Arbitration, gate and routing allowance added to the provider budgets.
    pub session_overhead_ms: u64,
    /// Explicit session deadline. Defaults to the sum of budgets plus overhead.
    pub session_deadline_ms: Option<u64>,
    pub providers: Vec<ProviderConfig>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            session_overhead_ms: 2_000,
            session_deadline_ms: None,
            providers: Role::ALL
                .iter()
                .map(|role| ProviderConfig {
                    name: role.to_string(),
                    role: *role,
                    command: format!("scorers/{role}"),
                    args: Vec::new(),
                    timeout_ms: None,
                })
                .collect(),
        }
    }
}

impl ProvidersConfig {
    pub fn timeout_ms(&self, provider: &ProviderConfig) -> u64 {
        provider.timeout_ms.unwrap_or(self.default_timeout_ms)
    }

    /// Overall session deadline in milliseconds.
    pub fn session_deadline_ms(&self) -> u64 {
        self.session_deadline_ms.unwrap_or_else(|| {
            self.providers
                .iter()
                .map(|p| self.timeout_ms(p))
                .sum::<u64>()
                + self.session_overhead_ms
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for role in Role::ALL {
            let count = self.providers.iter().filter(|p| p.role == role).count();
            if count != 1 {
                return Err(ConfigError::ProviderRoles { role, count });
            }
        }
        for provider in &self.providers {
            if self.timeout_ms(provider) == 0 {
                return Err(ConfigError::Invalid {
                    field: "providers.timeout_ms",
                    reason: format!("provider {} has a zero budget", provider.name),
                });
            }
            if provider.command.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "providers.command",
                    reason: format!("provider {} has no command", provider.name),
                });
            }
        }
        if self.session_deadline_ms == Some(0) {
            return Err(ConfigError::Invalid {
                field: "providers.session_deadline_ms",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Fixed per-role vote weights. Must sum to exactly 1.00.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WeightsConfig {
    pub trader: Decimal,
    pub risk: Decimal,
    pub analyst: Decimal,
}

impl Default for WeightsConfig {
    fn default() -> Self {
        Self {
            trader: Decimal::new(35, 2),
            risk: Decimal::new(35, 2),
            analyst: Decimal::new(30, 2),
        }
    }
}

impl WeightsConfig {
    pub fn weight(&self, role: Role) -> Decimal {
        match role {
            Role::Trader => self.trader,
            Role::Risk => self.risk,
            Role::Analyst => self.analyst,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for role in Role::ALL {
            let weight = self.weight(role);
            if weight < Decimal::ZERO || weight > Decimal::ONE {
                return Err(ConfigError::WeightRange { role, weight });
            }
        }
        let sum = self.trader + self.risk + self.analyst;
        if sum != Decimal::ONE {
            return Err(ConfigError::WeightSum(sum));
        }
        Ok(())
    }
}

/// Constants of the four-stage position-sizing calculation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SizingConfig {
    /// Fraction of capital risked per trade.
    pub risk_fraction: Decimal,
    /// Largest position as a fraction of portfolio value.
    pub hard_cap_fraction: Decimal,
    pub default_stop_pct: Decimal,
    pub min_stop_pct: Decimal,
    pub max_stop_pct: Decimal,
    /// Stop distance = `atr_multiplier * ATR / price`.
    pub atr_multiplier: Decimal,
    /// Buffer beyond a support/resistance level.
    pub level_buffer_pct: Decimal,
    pub min_volatility_multiplier: Decimal,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            risk_fraction: Decimal::new(2, 2),
            hard_cap_fraction: Decimal::new(10, 2),
            default_stop_pct: Decimal::new(5, 2),
            min_stop_pct: Decimal::new(3, 2),
            max_stop_pct: Decimal::new(10, 2),
            atr_multiplier: Decimal::new(2, 0),
            level_buffer_pct: Decimal::new(1, 2),
            min_volatility_multiplier: Decimal::new(3, 1),
        }
    }
}

impl SizingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("sizing.risk_fraction", self.risk_fraction),
            ("sizing.hard_cap_fraction", self.hard_cap_fraction),
            ("sizing.default_stop_pct", self.default_stop_pct),
            ("sizing.min_stop_pct", self.min_stop_pct),
            ("sizing.atr_multiplier", self.atr_multiplier),
            ("sizing.min_volatility_multiplier", self.min_volatility_multiplier),
        ];
        for (field, value) in positive {
            if value <= Decimal::ZERO {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("must be positive, got {value}"),
                });
            }
        }
        if self.min_stop_pct > self.max_stop_pct {
            return Err(ConfigError::Invalid {
                field: "sizing.max_stop_pct",
                reason: format!(
                    "clamp bounds out of order: [{}, {}]",
                    self.min_stop_pct, self.max_stop_pct
                ),
            });
        }
        Ok(())
    }
}

/// Thresholds of the eight portfolio-safety rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GateConfig {
    pub max_position_pct: Decimal,
    pub low_confidence_threshold: Decimal,
    pub low_confidence_max_position_pct: Decimal,
    pub max_stop_distance_pct: Decimal,
    pub earnings_days_before: i64,
    pub earnings_days_after: i64,
    /// Daily P&L (fraction) below which no new trade is allowed.
    pub daily_loss_limit_pct: Decimal,
    pub extreme_volatility: Decimal,
    pub risk_off_volatility: Decimal,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_position_pct: Decimal::new(30, 2),
            low_confidence_threshold: Decimal::new(70, 2),
            low_confidence_max_position_pct: Decimal::new(10, 2),
            max_stop_distance_pct: Decimal::new(10, 2),
            earnings_days_before: 2,
            earnings_days_after: 1,
            daily_loss_limit_pct: Decimal::new(-5, 2),
            extreme_volatility: Decimal::new(40, 0),
            risk_off_volatility: Decimal::new(30, 0),
        }
    }
}

/// Fast-track thresholds for the execution router.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouterConfig {
    pub daily_loss_limit_pct: Decimal,
    pub extreme_volatility: Decimal,
    /// Decisions sized above this fraction of portfolio value are always deliberative.
    pub deliberative_size_pct: Decimal,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            daily_loss_limit_pct: Decimal::new(-5, 2),
            extreme_volatility: Decimal::new(40, 0),
            deliberative_size_pct: Decimal::new(10, 2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LedgerConfig {
    pub starting_cash: Decimal,
    pub margin_allowance: Decimal,
    /// SQLite audit journal. In-memory when unset.
    pub journal_path: Option<String>,
    /// Capacity of the position-event broadcast channel.
    pub event_buffer: usize,
    /// Capacity of the ledger command mailbox.
    pub command_buffer: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            starting_cash: Decimal::new(100_000, 0),
            margin_allowance: Decimal::ZERO,
            journal_path: None,
            event_buffer: 256,
            command_buffer: 64,
        }
    }
}

impl LedgerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.starting_cash <= Decimal::ZERO {
            return Err(ConfigError::Invalid {
                field: "ledger.starting_cash",
                reason: format!("must be positive, got {}", self.starting_cash),
            });
        }
        if self.margin_allowance < Decimal::ZERO {
            return Err(ConfigError::Invalid {
                field: "ledger.margin_allowance",
                reason: format!("must not be negative, got {}", self.margin_allowance),
            });
        }
        if self.event_buffer == 0 || self.command_buffer == 0 {
            return Err(ConfigError::Invalid {
                field: "ledger.event_buffer",
                reason: "channel capacities must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of the human-readable format.
    pub json: bool,
}
