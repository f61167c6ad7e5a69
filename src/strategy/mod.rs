// =============================================================================
// Strategy Core — the variant dispatch point. Exactly one of
// {Classic, Stop, Hedging} is instantiated per process (chosen by
// `Config.strategy`); the outer interface (`process_webhook`, `cleanup`,
// `status`) and the shared skeleton (parse, duplicate filter, startup
// reconciliation) are implemented once here. Per spec.md §9's migration
// note, inheritance is replaced by a tagged union with a single dispatch
// point at the top of each public method — grounded on the teacher's
// `StrategyEngine` (src/strategy.rs), generalized from an indicator-scoring
// engine to a signal-driven one.
// =============================================================================

pub mod classic;
pub mod hedging;
pub mod stop;

use anyhow::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};

use crate::config::{Config, StrategyKind};
use crate::notifier::Notifier;
use crate::price_stream::PriceStream;
use crate::types::{Action, Side};
use crate::venue::VenueAdapter;

/// Process memory shared by every variant: the duplicate filter and the
/// reversal-sizing calculation both read/write this.
#[derive(Debug, Clone, Default)]
pub struct CoreState {
    pub last_action: Option<Action>,
    pub last_quantity: Option<Decimal>,
}

pub enum StrategyState {
    Classic(classic::ClassicState),
    Stop(stop::StopState),
    Hedging(hedging::HedgingState),
}

impl StrategyState {
    fn core(&self) -> &CoreState {
        match self {
            Self::Classic(s) => &s.core,
            Self::Stop(s) => &s.core,
            Self::Hedging(s) => &s.core,
        }
    }

    fn core_mut(&mut self) -> &mut CoreState {
        match self {
            Self::Classic(s) => &mut s.core,
            Self::Stop(s) => &mut s.core,
            Self::Hedging(s) => &mut s.core,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalEcho {
    pub symbol: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status")]
pub enum WebhookOutcome {
    #[serde(rename = "success")]
    Success { signal: SignalEcho },
    #[serde(rename = "ignored")]
    Ignored { reason: String },
    #[serde(rename = "error")]
    Error { message: String },
}

/// Shared outer interface, owning the placement lock and dispatching into
/// whichever variant is active. Constructed once in `lifecycle::run`.
pub struct StrategyCore {
    pub config: Arc<Config>,
    pub venue: Arc<VenueAdapter>,
    pub price_stream: PriceStream,
    pub notifier: Arc<dyn Notifier>,
    state: AsyncMutex<StrategyState>,
}

impl StrategyCore {
    pub fn new(config: Arc<Config>, venue: Arc<VenueAdapter>, price_stream: PriceStream, notifier: Arc<dyn Notifier>) -> Arc<Self> {
        let state = match config.strategy {
            StrategyKind::Classic => StrategyState::Classic(classic::ClassicState::default()),
            StrategyKind::Stop => StrategyState::Stop(stop::StopState::default()),
            StrategyKind::Hedging => StrategyState::Hedging(hedging::HedgingState::new(config.max_failures)),
        };
        Arc::new(Self {
            config,
            venue,
            price_stream,
            notifier,
            state: AsyncMutex::new(state),
        })
    }

    /// Parses a webhook body: lower-case, match substring "buy" before
    /// "sell". A body containing both resolves to "buy".
    pub fn parse_action(body: &str) -> Option<Action> {
        let lower = body.to_ascii_lowercase();
        if lower.contains("buy") {
            Some(Action::Buy)
        } else if lower.contains("sell") {
            Some(Action::Sell)
        } else {
            None
        }
    }

    /// Queries the venue for an existing position and restores `last_action`
    /// / `last_quantity` so the duplicate filter and reversal sizing behave
    /// correctly across a restart. Variant-specific restoration (e.g.
    /// rearming a stop watch) happens inside each variant's own hook.
    #[instrument(skip(self), name = "strategy::startup_reconciliation")]
    pub async fn startup_reconciliation(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.state.lock().await;
        match self.venue.get_current_position(None).await? {
            Some(position) => {
                let action = match position.side {
                    Side::Long => Action::Buy,
                    Side::Short => Action::Sell,
                };
                guard.core_mut().last_action = Some(action);
                guard.core_mut().last_quantity = Some(position.size);
                info!(side = %position.side, size = %position.size, "restored position from venue at startup");
                drop(guard);
                self.variant_restore(position.side, position.size, position.entry_price).await?;
            }
            None => {
                info!("no open position found at startup");
            }
        }
        Ok(())
    }

    async fn variant_restore(self: &Arc<Self>, side: Side, size: Decimal, entry_price: Decimal) -> Result<()> {
        match self.config.strategy {
            StrategyKind::Classic => Ok(()),
            StrategyKind::Stop => stop::restore(self, side, size, entry_price).await,
            StrategyKind::Hedging => hedging::restore(self, side, size, entry_price).await,
        }
    }

    /// The full pipeline: parse -> duplicate filter -> variant dispatch.
    #[instrument(skip(self, body), name = "strategy::process_webhook")]
    pub async fn process_webhook(self: &Arc<Self>, body: &str) -> WebhookOutcome {
        let action = match Self::parse_action(body) {
            Some(a) => a,
            None => {
                warn!("webhook body did not contain a recognizable action");
                return WebhookOutcome::Error { message: "body must contain 'buy' or 'sell'".to_string() };
            }
        };

        let mut guard = self.state.lock().await;
        let previous_action = guard.core().last_action;
        if previous_action == Some(action) {
            info!(%action, "duplicate signal dropped");
            return WebhookOutcome::Ignored { reason: "duplicate of last accepted action".to_string() };
        }
        guard.core_mut().last_action = Some(action);

        let result = match &mut *guard {
            StrategyState::Classic(state) => classic::handle_signal(self, state, action, previous_action).await,
            StrategyState::Stop(state) => stop::handle_signal(self, state, action, previous_action).await,
            StrategyState::Hedging(state) => hedging::handle_signal(self, state, action, previous_action).await,
        };
        drop(guard);

        match result {
            Ok(()) => {
                self.notifier.send(&format!("{} {}: signal accepted ({action})", self.venue.symbol(), self.config.strategy_label())).await;
                WebhookOutcome::Success {
                    signal: SignalEcho { symbol: self.venue.symbol().to_string(), action: action.to_string() },
                }
            }
            Err(err) => {
                warn!(error = %err, "strategy failed to act on accepted signal");
                self.notifier.send(&format!("{} {}: failed to act on {action} signal: {err}", self.venue.symbol(), self.config.strategy_label())).await;
                WebhookOutcome::Error { message: err.to_string() }
            }
        }
    }

    /// Best-effort shutdown cleanup: cancel every outstanding watch and
    /// every stop order this process placed. Idempotent.
    #[instrument(skip(self), name = "strategy::cleanup")]
    pub async fn cleanup(self: &Arc<Self>) {
        self.price_stream.cancel_all_watches();
        if let Err(err) = self.venue.cancel_all_stops().await {
            warn!(error = %err, "failed to cancel stop orders during shutdown");
        }
    }

    /// Computes the market-order quantity for a fresh open: `(position_size
    /// * leverage) / current_price`, rounded to the instrument's grid.
    pub(crate) fn entry_quantity(&self, current_price: Decimal) -> Result<Decimal> {
        let leverage = Decimal::from(self.config.leverage);
        let raw = (self.config.position_size * leverage) / current_price;
        self.venue.instrument().round_quantity(raw)
    }

    /// Converts an ROI percent (signed) into a target price for `side`,
    /// leverage-adjusted: `fraction = pnl_percent / (100 * leverage)`.
    pub(crate) fn pnl_percent_to_price(&self, entry: Decimal, pnl_percent: Decimal, side: Side) -> Decimal {
        let leverage = Decimal::from(self.config.leverage);
        let fraction = pnl_percent / (Decimal::from(100) * leverage);
        match side {
            Side::Long => entry * (Decimal::ONE + fraction),
            Side::Short => entry * (Decimal::ONE - fraction),
        }
    }

    /// Acquires the placement lock outside the `process_webhook` call path —
    /// used by watch-fire continuations (activation, SL, trigger, TP) that
    /// run as their own spawned tasks once their `oneshot` resolves.
    pub(crate) async fn lock_state(&self) -> tokio::sync::MutexGuard<'_, StrategyState> {
        self.state.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_action_prefers_buy_when_both_present() {
        assert_eq!(StrategyCore::parse_action("Buy and sell signal"), Some(Action::Buy));
    }

    #[test]
    fn parse_action_matches_sell_case_insensitive() {
        assert_eq!(StrategyCore::parse_action("SELL now"), Some(Action::Sell));
    }

    #[test]
    fn parse_action_returns_none_for_unrecognized_body() {
        assert_eq!(StrategyCore::parse_action("ping"), None);
    }
}
