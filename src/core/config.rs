//! Configuration - Type-safe, validated config
//!
//! Loaded from `config.toml` (or the path in `BASKET_TX_CONFIG`).
//! Every trading parameter is runtime-configurable.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::{Error, Instrument, Result};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "BASKET_TX_CONFIG";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Driver cadence and gateway timeouts
    #[serde(default)]
    pub engine: EngineConfig,

    /// Position limits
    #[serde(default)]
    pub risk: RiskConfig,

    /// Which signal to trade
    #[serde(default)]
    pub strategy: StrategyConfig,

    /// In-process venue used when no real gateway is wired in
    #[serde(default)]
    pub paper: PaperConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Milliseconds between decision cycles
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_ms: u64,

    /// Upper bound on any single gateway call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// A submission still unacknowledged after this long is cancelled on the venue
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,

    /// Emit a PnL/position report every N cycles (0 disables)
    #[serde(default = "default_report_every")]
    pub report_every_cycles: u64,

    /// Run an extra cycle when the gateway signals a book change
    #[serde(default)]
    pub react_to_book_updates: bool,
}

fn default_cycle_interval() -> u64 {
    1000
}
fn default_request_timeout() -> u64 {
    500
}
fn default_ack_timeout() -> u64 {
    5000
}
fn default_report_every() -> u64 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: default_cycle_interval(),
            request_timeout_ms: default_request_timeout(),
            ack_timeout_ms: default_ack_timeout(),
            report_every_cycles: default_report_every(),
            react_to_book_updates: false,
        }
    }
}

impl EngineConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Absolute position limit for instruments not listed in `limits`
    #[serde(default = "default_position_limit")]
    pub default_limit: u64,

    /// Per-instrument absolute position limits
    #[serde(default)]
    pub limits: BTreeMap<Instrument, u64>,
}

fn default_position_limit() -> u64 {
    750
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self { default_limit: default_position_limit(), limits: BTreeMap::new() }
    }
}

/// Signal selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// Quote inside the spread on one instrument
    PriceImprovement {
        instrument: Instrument,
        #[serde(default = "default_tick")]
        tick: Decimal,
        #[serde(default = "default_min_spread")]
        min_spread: Decimal,
        #[serde(default = "default_quote_volume")]
        quote_volume: u64,
    },
    /// Trade a strict cross between two equivalent instruments
    Arbitrage {
        /// Checked first when both directions cross
        primary: Instrument,
        secondary: Instrument,
        #[serde(default)]
        max_volume: Option<u64>,
    },
}

fn default_tick() -> Decimal {
    Decimal::new(10, 2)
}
fn default_min_spread() -> Decimal {
    Decimal::new(1, 2)
}
fn default_quote_volume() -> u64 {
    1
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig::Arbitrage {
            primary: Instrument::new("SEMIS_ETF_US"),
            secondary: Instrument::new("SEMIS_ETF_EU"),
            max_volume: None,
        }
    }
}

impl StrategyConfig {
    pub fn instruments(&self) -> Vec<Instrument> {
        match self {
            StrategyConfig::PriceImprovement { instrument, .. } => vec![instrument.clone()],
            StrategyConfig::Arbitrage { primary, secondary, .. } => {
                vec![primary.clone(), secondary.clone()]
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    /// Milliseconds between simulated book moves
    #[serde(default = "default_paper_tick")]
    pub update_interval_ms: u64,

    /// Largest mid move per update, in price units
    #[serde(default = "default_max_step")]
    pub max_step: Decimal,

    #[serde(default = "default_paper_markets")]
    pub markets: Vec<PaperMarket>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperMarket {
    pub instrument: Instrument,
    pub mid: Decimal,
    pub half_spread: Decimal,
    #[serde(default = "default_level_volume")]
    pub volume: u64,
}

fn default_paper_tick() -> u64 {
    250
}
fn default_max_step() -> Decimal {
    Decimal::new(30, 2)
}
fn default_level_volume() -> u64 {
    20
}
fn default_paper_markets() -> Vec<PaperMarket> {
    vec![
        PaperMarket {
            instrument: Instrument::new("SEMIS_ETF_US"),
            mid: Decimal::new(9050, 2),
            half_spread: Decimal::new(50, 2),
            volume: default_level_volume(),
        },
        PaperMarket {
            instrument: Instrument::new("SEMIS_ETF_EU"),
            mid: Decimal::new(9000, 2),
            half_spread: Decimal::new(20, 2),
            volume: default_level_volume(),
        },
    ]
}

impl PaperConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms.max(1))
    }
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: default_paper_tick(),
            max_step: default_max_step(),
            markets: default_paper_markets(),
        }
    }
}

impl Config {
    /// Load from TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `$BASKET_TX_CONFIG`, then the project root, else defaults.
    pub fn load_default() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }

        let candidates = [
            PathBuf::from("config.toml"),
            PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/config.toml")),
        ];

        for path in &candidates {
            if path.exists() {
                let cfg = Self::load(path)?;
                tracing::info!("📋 Loaded config from {}", path.display());
                return Ok(cfg);
            }
        }

        tracing::warn!("⚠️ No config.toml found, using defaults");
        Ok(Self::default())
    }

    /// Position limit for an instrument
    pub fn limit_for(&self, instrument: &Instrument) -> u64 {
        self.risk.limits.get(instrument).copied().unwrap_or(self.risk.default_limit)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.cycle_interval_ms == 0 {
            return Err(Error::Config("engine.cycle_interval_ms must be > 0".into()));
        }
        if self.engine.request_timeout_ms == 0 {
            return Err(Error::Config("engine.request_timeout_ms must be > 0".into()));
        }
        match &self.strategy {
            StrategyConfig::PriceImprovement { tick, min_spread, quote_volume, .. } => {
                if *tick <= Decimal::ZERO {
                    return Err(Error::Config(format!("tick must be positive, got {}", tick)));
                }
                if *min_spread < Decimal::ZERO {
                    return Err(Error::Config(format!(
                        "min_spread must be non-negative, got {}",
                        min_spread
                    )));
                }
                if *quote_volume == 0 {
                    return Err(Error::Config("quote_volume must be > 0".into()));
                }
            }
            StrategyConfig::Arbitrage { primary, secondary, max_volume } => {
                if primary == secondary {
                    return Err(Error::Config(format!(
                        "arbitrage needs two distinct instruments, got {} twice",
                        primary
                    )));
                }
                if *max_volume == Some(0) {
                    return Err(Error::Config("max_volume must be > 0 when set".into()));
                }
            }
        }
        for market in &self.paper.markets {
            if market.half_spread <= Decimal::ZERO {
                return Err(Error::Config(format!(
                    "paper market {} needs a positive half_spread",
                    market.instrument
                )));
            }
        }
        Ok(())
    }
}
