// =============================================================================
// Environment configuration: loaded once at startup, validated eagerly.
// Mirrors the teacher's "fail loudly before spawning any task" posture.
// =============================================================================

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Classic,
    Stop,
    Hedging,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Classic => write!(f, "classic"),
            Self::Stop => write!(f, "stop"),
            Self::Hedging => write!(f, "hedging"),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "classic" => Ok(Self::Classic),
            "stop" => Ok(Self::Stop),
            "hedging" | "take" => Ok(Self::Hedging),
            other => bail!("unknown strategy variant: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub venue_api_key: String,
    pub venue_secret: String,
    pub position_size: Decimal,
    pub leverage: u32,
    pub symbol: String,
    pub allowed_ips: HashSet<IpAddr>,
    pub strategy: StrategyKind,
    pub activation_percent: Decimal,
    pub stop_percent: Decimal,
    pub activation_pnl: Decimal,
    pub sl_pnl: Decimal,
    pub trigger_pnl: Decimal,
    pub tp_pnl: Decimal,
    pub max_failures: u32,
    pub notifier_token: Option<String>,
    pub notifier_chats: Vec<String>,
}

impl Config {
    /// Human-readable strategy name for logs and notifier messages.
    pub fn strategy_label(&self) -> String {
        self.strategy.to_string()
    }

    /// Loads and validates every field from the process environment. Any
    /// missing or ill-typed required field is a fatal, loud error — the
    /// process must refuse to start rather than run with defaults for
    /// trading secrets.
    pub fn from_env() -> Result<Self> {
        let venue_api_key = required_string("VENUE_API_KEY")?;
        let venue_secret = required_string("VENUE_SECRET")?;
        let position_size = required_decimal("POSITION_SIZE")?;
        if position_size <= Decimal::ZERO {
            bail!("POSITION_SIZE must be positive, got {position_size}");
        }
        let leverage = required_u32("LEVERAGE")?;
        if leverage == 0 {
            bail!("LEVERAGE must be a positive integer");
        }
        let symbol = required_string("SYMBOL")?;
        let allowed_ips = required_ip_list("ALLOWED_IPS")?;
        let strategy = required_string("STRATEGY")?.parse::<StrategyKind>()?;

        let activation_percent = optional_decimal("ACTIVATION_PERCENT", Decimal::ZERO)?;
        let stop_percent = optional_decimal("STOP_PERCENT", Decimal::ZERO)?;
        let activation_pnl = optional_decimal("ACTIVATION_PNL", Decimal::ZERO)?;
        let sl_pnl = optional_decimal("SL_PNL", Decimal::ZERO)?;
        let trigger_pnl = optional_decimal("TRIGGER_PNL", Decimal::ZERO)?;
        let tp_pnl = optional_decimal("TP_PNL", Decimal::ZERO)?;
        let max_failures = optional_u32("MAX_FAILURES", 3)?;

        if matches!(strategy, StrategyKind::Stop)
            && (activation_percent <= Decimal::ZERO || stop_percent <= Decimal::ZERO)
        {
            bail!("stop strategy requires ACTIVATION_PERCENT and STOP_PERCENT to be positive");
        }
        if matches!(strategy, StrategyKind::Hedging) && max_failures == 0 {
            bail!("hedging strategy requires MAX_FAILURES to be positive");
        }

        let notifier_token = std::env::var("NOTIFIER_TOKEN").ok().filter(|s| !s.is_empty());
        let notifier_chats = std::env::var("NOTIFIER_CHATS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            venue_api_key,
            venue_secret,
            position_size,
            leverage,
            symbol,
            allowed_ips,
            strategy,
            activation_percent,
            stop_percent,
            activation_pnl,
            sl_pnl,
            trigger_pnl,
            tp_pnl,
            max_failures,
            notifier_token,
            notifier_chats,
        })
    }
}

fn required_string(key: &str) -> Result<String> {
    let val = std::env::var(key).with_context(|| format!("missing required env var {key}"))?;
    if val.trim().is_empty() {
        bail!("env var {key} must not be empty");
    }
    Ok(val)
}

fn required_decimal(key: &str) -> Result<Decimal> {
    let raw = required_string(key)?;
    Decimal::from_str(raw.trim()).with_context(|| format!("env var {key} is not a valid decimal: {raw}"))
}

fn optional_decimal(key: &str, default: Decimal) -> Result<Decimal> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            Decimal::from_str(raw.trim()).with_context(|| format!("env var {key} is not a valid decimal: {raw}"))
        }
        _ => Ok(default),
    }
}

fn required_u32(key: &str) -> Result<u32> {
    let raw = required_string(key)?;
    raw.trim()
        .parse::<u32>()
        .with_context(|| format!("env var {key} is not a valid positive integer: {raw}"))
}

fn optional_u32(key: &str, default: u32) -> Result<u32> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<u32>()
            .with_context(|| format!("env var {key} is not a valid positive integer: {raw}")),
        _ => Ok(default),
    }
}

fn required_ip_list(key: &str) -> Result<HashSet<IpAddr>> {
    let raw = required_string(key)?;
    let values: Vec<String> = serde_json::from_str(&raw)
        .with_context(|| format!("env var {key} must be a JSON array of strings: {raw}"))?;
    if values.is_empty() {
        bail!("env var {key} must list at least one allowed IP");
    }
    values
        .iter()
        .map(|s| {
            s.parse::<IpAddr>()
                .with_context(|| format!("env var {key} contains an invalid IP address: {s}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_kind_parses_known_variants() {
        assert_eq!("classic".parse::<StrategyKind>().unwrap(), StrategyKind::Classic);
        assert_eq!("STOP".parse::<StrategyKind>().unwrap(), StrategyKind::Stop);
        assert_eq!("hedging".parse::<StrategyKind>().unwrap(), StrategyKind::Hedging);
        assert_eq!("take".parse::<StrategyKind>().unwrap(), StrategyKind::Hedging);
        assert!("unknown".parse::<StrategyKind>().is_err());
    }
}
