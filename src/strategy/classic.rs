// =============================================================================
// Classic variant — open on a fresh signal, reverse on an opposite signal,
// no-op on a same-direction signal (the latter is already absorbed by the
// shared duplicate filter upstream, since for this variant "direction" and
// "last_action" are the same fact).
// =============================================================================

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;

use super::{CoreState, StrategyCore};
use crate::types::Action;

#[derive(Debug, Clone, Default)]
pub struct ClassicState {
    pub core: CoreState,
}

pub async fn handle_signal(
    core: &Arc<StrategyCore>,
    state: &mut ClassicState,
    action: Action,
    previous_action: Option<Action>,
) -> Result<()> {
    let current_price = core
        .price_stream
        .latest_price()
        .context("no price available yet from the stream")?;

    match previous_action {
        None => {
            let quantity = core.entry_quantity(current_price)?;
            core.venue.open_market(action.side(), quantity, None).await?;
            state.core.last_quantity = Some(quantity);
            info!(%action, %quantity, "opened fresh position");
        }
        Some(_previous) => {
            let new_quantity = core.entry_quantity(current_price)?;
            let previous_quantity = state.core.last_quantity.unwrap_or(new_quantity * Decimal::from(2));
            let total = core.venue.instrument().round_quantity(previous_quantity + new_quantity)?;
            core.venue.open_market(action.side(), total, None).await?;
            state.core.last_quantity = Some(new_quantity);
            info!(%action, %total, %new_quantity, "reversed position");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversal_falls_back_to_double_new_quantity_when_last_unknown() {
        let state = ClassicState { core: CoreState { last_action: Some(Action::Buy), last_quantity: None } };
        let new_quantity = Decimal::from(1);
        let fallback = state.core.last_quantity.unwrap_or(new_quantity * Decimal::from(2));
        assert_eq!(fallback, Decimal::from(2));
    }
}
