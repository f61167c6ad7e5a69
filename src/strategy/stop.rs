// =============================================================================
// Stop variant — Classic's open/reverse plus a trailing stop armed by PnL
// percent. Two watches are never concurrently active for the same position:
// the activation watch is cancelled the moment it fires (single-shot) and
// any new signal cancels whatever stop/watch is outstanding before acting.
//
// REDESIGN FLAG applied: the source's hard-coded `stop_price = limit ± 1`
// offset is symbol-agnostic and breaks on instruments with a much smaller or
// larger tick. Parameterized here as `offset = STOP_OFFSET_TICKS * tick_size`
// (see DESIGN.md for the chosen constant) instead of replicating the bug.
// =============================================================================

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

use super::{CoreState, StrategyCore, StrategyState};
use crate::types::{Direction, OrderId, Side};

/// Number of price ticks the stop-trigger price sits past the limit price,
/// in the direction that guarantees trigger-before-execution.
const STOP_OFFSET_TICKS: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct PendingStop {
    pub position_side: Side,
    pub activation_price: Decimal,
    pub stop_limit_price: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct StopState {
    pub core: CoreState,
    pub active_stop_order_id: Option<OrderId>,
    pub pending_stop: Option<PendingStop>,
    pub monitoring: bool,
}

pub async fn handle_signal(
    core: &Arc<StrategyCore>,
    state: &mut StopState,
    action: crate::types::Action,
    previous_action: Option<crate::types::Action>,
) -> Result<()> {
    cancel_outstanding(core, state).await;

    let current_price = core
        .price_stream
        .latest_price()
        .context("no price available yet from the stream")?;

    let quantity = match previous_action {
        None => {
            let quantity = core.entry_quantity(current_price)?;
            core.venue.open_market(action.side(), quantity, None).await?;
            info!(%action, %quantity, "opened fresh position");
            quantity
        }
        Some(_) => {
            let new_quantity = core.entry_quantity(current_price)?;
            let previous_quantity = state.core.last_quantity.unwrap_or(new_quantity * Decimal::from(2));
            let total = core.venue.instrument().round_quantity(previous_quantity + new_quantity)?;
            core.venue.open_market(action.side(), total, None).await?;
            info!(%action, %total, %new_quantity, "reversed position");
            new_quantity
        }
    };
    state.core.last_quantity = Some(quantity);

    arm_activation_watch(core, state, action.side()).await?;
    Ok(())
}

async fn cancel_outstanding(core: &Arc<StrategyCore>, state: &mut StopState) {
    if let Some(order_id) = state.active_stop_order_id.take() {
        if let Err(err) = core.venue.cancel_order(&order_id).await {
            warn!(order_id, error = %err, "failed to cancel active stop order");
        }
    }
    if let Some(pending) = state.pending_stop.take() {
        core.price_stream.cancel_watch(pending.activation_price, Direction::from(pending.position_side), None);
    }
    state.monitoring = false;
}

async fn arm_activation_watch(core: &Arc<StrategyCore>, state: &mut StopState, side: Side) -> Result<()> {
    let entry = core
        .venue
        .get_exact_entry_price(Some(side))
        .await?
        .context("position vanished before the stop could be armed")?;

    let activation_price = core.pnl_percent_to_price(entry, core.config.activation_percent, side);
    let stop_limit_price = core.pnl_percent_to_price(entry, core.config.stop_percent, side);

    let pending = PendingStop { position_side: side, activation_price, stop_limit_price };
    state.pending_stop = Some(pending);
    state.monitoring = true;

    let rx = core.price_stream.watch(activation_price, Direction::from(side), None);
    info!(%activation_price, %stop_limit_price, "armed stop activation watch");

    let core = core.clone();
    tokio::spawn(async move {
        if rx.await.is_ok() {
            on_activation_fired(&core).await;
        }
    });

    Ok(())
}

async fn on_activation_fired(core: &Arc<StrategyCore>) {
    let mut guard = core.lock_state().await;
    let StrategyState::Stop(state) = &mut *guard else { return };

    let Some(pending) = state.pending_stop.take() else { return };
    state.monitoring = false;

    let position = match core.venue.get_current_position(Some(pending.position_side)).await {
        Ok(Some(p)) => p,
        Ok(None) => {
            warn!("position closed before the stop could be placed");
            return;
        }
        Err(err) => {
            warn!(error = %err, "failed to re-query position before placing stop");
            return;
        }
    };

    let tick = core.venue.instrument().price_tick;
    let offset = tick * Decimal::from(STOP_OFFSET_TICKS);
    let stop_price = match pending.position_side {
        Side::Long => pending.stop_limit_price + offset,
        Side::Short => pending.stop_limit_price - offset,
    };

    let closing_side = pending.position_side.opposite();
    match core
        .venue
        .place_stop_limit(closing_side, position.size, stop_price, pending.stop_limit_price)
        .await
    {
        Ok(order_id) => {
            info!(order_id, %stop_price, limit_price = %pending.stop_limit_price, "placed trailing stop order");
            state.active_stop_order_id = Some(order_id);
        }
        Err(err) => {
            warn!(error = %err, "failed to place trailing stop order");
        }
    }
}

/// Startup restoration: a position already exists, but we have no
/// knowledge of a prior activation watch (that state lived only in the
/// previous process's memory), so we re-arm from scratch against the
/// restored position's exact entry.
pub async fn restore(core: &Arc<StrategyCore>, side: Side, size: Decimal, _entry_price: Decimal) -> Result<()> {
    let mut guard = core.lock_state().await;
    let StrategyState::Stop(state) = &mut *guard else { return Ok(()) };
    state.core.last_quantity = Some(size);
    arm_activation_watch(core, state, side).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn stop_offset_is_tick_relative_not_a_fixed_unit() {
        let tick = dec!(0.01);
        let offset = tick * Decimal::from(STOP_OFFSET_TICKS);
        assert_eq!(offset, dec!(0.05));
    }
}
