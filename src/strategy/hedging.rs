// =============================================================================
// Hedging variant — a main position guarded by a tripwire hedge opened when
// the main's drawdown crosses `activation_pnl`. The hedge's own stop then
// migrates from a loss-limiting SL to a profit-locking TP as price moves in
// the hedge's favor. State table (spec.md §4.3.3):
//
//   S0 Idle -> S1 MainOnly -> S2 HedgeArmed -> S3 HedgeInProfit -> S4 (TP
//   closes hedge, transient) -> S1 (barrier-gated re-arm)
//   S2 -> S1 (SL failure, retry) or S5 Disabled (failure_count exhausted)
//
// Because the shared duplicate filter in `strategy::mod` already drops any
// webhook action equal to `last_action`, every signal that reaches
// `handle_signal` here is guaranteed to differ from the main position's
// opening direction -- and, when a hedge is live, that direction is by
// construction the hedge's side. This collapses spec.md's three-way reset
// bullet list ("same direction: ignore") to the two branches implemented
// below; the unreachable case is asserted rather than silently matched away.
// =============================================================================

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

use super::{CoreState, StrategyCore, StrategyState};
use crate::types::{Action, Barrier, BarrierSide, Direction, OrderId, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    MainOnly,
    HedgeArmed,
    HedgeInProfit,
    Disabled,
}

#[derive(Debug, Clone, Copy)]
struct WatchHandle {
    target: Decimal,
    direction: Direction,
    barrier: Option<Barrier>,
}

#[derive(Debug, Clone)]
pub struct HedgingState {
    pub core: CoreState,
    pub phase: Option<Phase>,
    pub main_side: Option<Side>,
    pub main_entry: Option<Decimal>,
    pub main_volume: Option<Decimal>,
    pub hedge_side: Option<Side>,
    pub hedge_entry: Option<Decimal>,
    pub active_stop_order_id: Option<OrderId>,
    pub failure_count: u32,
    pub max_failures: u32,
    pub barrier_price: Option<Decimal>,
    pub barrier_side: Option<BarrierSide>,
    activation_watch: Option<WatchHandle>,
    sl_watch: Option<WatchHandle>,
    trigger_watch: Option<WatchHandle>,
    tp_watch: Option<WatchHandle>,
}

impl HedgingState {
    pub fn new(max_failures: u32) -> Self {
        Self {
            core: CoreState::default(),
            phase: None,
            main_side: None,
            main_entry: None,
            main_volume: None,
            hedge_side: None,
            hedge_entry: None,
            active_stop_order_id: None,
            failure_count: 0,
            max_failures,
            barrier_price: None,
            barrier_side: None,
            activation_watch: None,
            sl_watch: None,
            trigger_watch: None,
            tp_watch: None,
        }
    }
}

pub async fn handle_signal(
    core: &Arc<StrategyCore>,
    state: &mut HedgingState,
    action: Action,
    _previous_action: Option<Action>,
) -> Result<()> {
    cancel_all_watches(core, state);
    if let Some(order_id) = state.active_stop_order_id.take() {
        if let Err(err) = core.venue.cancel_order(&order_id).await {
            warn!(order_id, error = %err, "failed to cancel hedge stop order on reset");
        }
    }

    match (state.main_side, state.hedge_side) {
        (None, None) => open_fresh_main(core, state, action).await,
        (Some(main_side), None) => {
            assert_ne!(main_side, action.side(), "duplicate filter should have dropped a same-direction signal");
            if let Some(volume) = state.main_volume {
                core.venue.close_position_market(main_side, volume).await?;
            }
            open_fresh_main(core, state, action).await
        }
        (Some(_main_side), Some(hedge_side)) => {
            assert_eq!(hedge_side, action.side(), "a live hedge is always opposite the main, so a fresh signal must match it");
            promote_hedge_to_main(core, state, action).await
        }
        (None, Some(_)) => unreachable!("hedge without a main position"),
    }
}

async fn open_fresh_main(core: &Arc<StrategyCore>, state: &mut HedgingState, action: Action) -> Result<()> {
    let current_price = core.price_stream.latest_price().context("no price available yet from the stream")?;
    let quantity = core.entry_quantity(current_price)?;
    core.venue.open_market(action.side(), quantity, Some(action.side())).await?;
    info!(%action, %quantity, "opened fresh main position");

    state.main_side = Some(action.side());
    state.main_volume = Some(quantity);
    state.hedge_side = None;
    state.hedge_entry = None;
    state.failure_count = 0;
    state.barrier_price = None;
    state.barrier_side = None;
    state.active_stop_order_id = None;
    state.phase = Some(Phase::MainOnly);

    arm_activation_watch(core, state).await
}

async fn promote_hedge_to_main(core: &Arc<StrategyCore>, state: &mut HedgingState, action: Action) -> Result<()> {
    let main_side = state.main_side.context("promoting hedge with no recorded main side")?;
    let main_volume = state.main_volume.context("promoting hedge with no recorded main volume")?;
    core.venue.close_position_market(main_side, main_volume).await?;
    info!(former_main = %main_side, "closed former main, promoting hedge to main");

    let new_entry = state
        .hedge_entry
        .or_else(|| core.price_stream.latest_price())
        .context("no hedge entry and no current price to use as a proxy")?;

    state.main_side = Some(action.side());
    state.main_entry = Some(new_entry);
    // the hedge's volume was opened to match the former main's volume.
    state.hedge_side = None;
    state.hedge_entry = None;
    state.failure_count = 0;
    state.barrier_price = None;
    state.barrier_side = None;
    state.active_stop_order_id = None;
    state.phase = Some(Phase::MainOnly);

    arm_activation_watch(core, state).await
}

/// Arms the activation watch against `state.main_entry`, re-reading the
/// exact entry from the venue. Consumes `state.barrier_price`/`barrier_side`
/// if a prior TP close left one armed, per the S4 -> S1 transition.
async fn arm_activation_watch(core: &Arc<StrategyCore>, state: &mut HedgingState) -> Result<()> {
    let main_side = state.main_side.context("arming activation watch with no main side")?;
    let entry = core
        .venue
        .get_exact_entry_price(Some(main_side))
        .await?
        .context("main position vanished before activation watch could be armed")?;
    state.main_entry = Some(entry);

    let activation_price = core.pnl_percent_to_price(entry, core.config.activation_pnl, main_side);
    let direction = Direction::from(main_side.opposite());

    let barrier = match (state.barrier_price.take(), state.barrier_side.take()) {
        (Some(price), Some(side)) => Some(Barrier { price, side }),
        _ => None,
    };

    let rx = core.price_stream.watch(activation_price, direction, barrier);
    state.activation_watch = Some(WatchHandle { target: activation_price, direction, barrier });
    info!(%activation_price, has_barrier = barrier.is_some(), "armed hedge activation watch");

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
    let StrategyState::Hedging(state) = &mut *guard else { return };
    if state.phase != Some(Phase::MainOnly) {
        return;
    }
    state.activation_watch = None;

    let Some(main_side) = state.main_side else { return };
    let Some(main_volume) = state.main_volume else { return };
    let hedge_side = main_side.opposite();

    if let Err(err) = core.venue.open_market(hedge_side, main_volume, Some(hedge_side)).await {
        warn!(error = %err, "failed to open hedge position, re-arming activation watch");
        let _ = arm_activation_watch(core, state).await;
        return;
    }
    info!(%hedge_side, %main_volume, "opened hedge position");

    let hedge_entry = match core.venue.get_exact_entry_price(Some(hedge_side)).await {
        Ok(Some(price)) => price,
        Ok(None) => {
            warn!("hedge vanished before its entry could be read");
            return;
        }
        Err(err) => {
            warn!(error = %err, "failed to read hedge entry price");
            return;
        }
    };
    state.hedge_side = Some(hedge_side);
    state.hedge_entry = Some(hedge_entry);

    let sl_price = core.pnl_percent_to_price(hedge_entry, core.config.sl_pnl, hedge_side);
    let trigger_price = core.pnl_percent_to_price(hedge_entry, core.config.trigger_pnl, hedge_side);

    match core.venue.place_stop_market(hedge_side, sl_price).await {
        Ok(order_id) => state.active_stop_order_id = Some(order_id),
        Err(err) => {
            warn!(error = %err, "failed to place hedge SL order");
            return;
        }
    }

    let sl_direction = Direction::from(hedge_side.opposite());
    let trigger_direction = Direction::from(hedge_side);

    let sl_rx = core.price_stream.watch(sl_price, sl_direction, None);
    state.sl_watch = Some(WatchHandle { target: sl_price, direction: sl_direction, barrier: None });
    let trigger_rx = core.price_stream.watch(trigger_price, trigger_direction, None);
    state.trigger_watch = Some(WatchHandle { target: trigger_price, direction: trigger_direction, barrier: None });

    state.phase = Some(Phase::HedgeArmed);
    info!(%sl_price, %trigger_price, "armed hedge SL + trigger dual watch");

    let sl_core = core.clone();
    tokio::spawn(async move {
        if sl_rx.await.is_ok() {
            on_sl_fired(&sl_core).await;
        }
    });
    let trigger_core = core.clone();
    tokio::spawn(async move {
        if trigger_rx.await.is_ok() {
            on_trigger_fired(&trigger_core).await;
        }
    });
}

async fn on_sl_fired(core: &Arc<StrategyCore>) {
    let mut guard = core.lock_state().await;
    let StrategyState::Hedging(state) = &mut *guard else { return };
    if state.phase != Some(Phase::HedgeArmed) {
        return;
    }
    state.sl_watch = None;
    if let Some(handle) = state.trigger_watch.take() {
        core.price_stream.cancel_watch(handle.target, handle.direction, handle.barrier);
    }
    state.active_stop_order_id = None; // the SL stop itself closed the hedge.
    state.hedge_side = None;
    state.hedge_entry = None;
    state.failure_count += 1;

    if state.failure_count < state.max_failures {
        info!(failure_count = state.failure_count, "hedge stopped out, re-arming activation watch");
        state.phase = Some(Phase::MainOnly);
        let _ = arm_activation_watch(core, state).await;
    } else {
        warn!(failure_count = state.failure_count, "hedge failure budget exhausted, disabling until next signal");
        state.phase = Some(Phase::Disabled);
        core.notifier
            .send(&format!(
                "{}: hedge disabled after {} consecutive SL hits, no new hedge until the next signal",
                core.venue.symbol(),
                state.failure_count
            ))
            .await;
    }
}

async fn on_trigger_fired(core: &Arc<StrategyCore>) {
    let mut guard = core.lock_state().await;
    let StrategyState::Hedging(state) = &mut *guard else { return };
    if state.phase != Some(Phase::HedgeArmed) {
        return;
    }
    state.trigger_watch = None;
    if let Some(handle) = state.sl_watch.take() {
        core.price_stream.cancel_watch(handle.target, handle.direction, handle.barrier);
    }

    let Some(hedge_side) = state.hedge_side else { return };
    let Some(hedge_entry) = state.hedge_entry else { return };

    if let Some(order_id) = state.active_stop_order_id.take() {
        if let Err(err) = core.venue.cancel_order(&order_id).await {
            warn!(order_id, error = %err, "failed to cancel hedge SL order before moving to TP");
        }
    }

    let tp_price = core.pnl_percent_to_price(hedge_entry, core.config.tp_pnl, hedge_side);
    match core.venue.place_stop_market(hedge_side, tp_price).await {
        Ok(order_id) => state.active_stop_order_id = Some(order_id),
        Err(err) => {
            warn!(error = %err, "failed to place hedge TP order");
            return;
        }
    }

    let tp_direction = Direction::from(hedge_side);
    let tp_rx = core.price_stream.watch(tp_price, tp_direction, None);
    state.tp_watch = Some(WatchHandle { target: tp_price, direction: tp_direction, barrier: None });
    state.phase = Some(Phase::HedgeInProfit);
    info!(%tp_price, "hedge moved into profit, armed TP watch");

    let tp_core = core.clone();
    tokio::spawn(async move {
        if tp_rx.await.is_ok() {
            on_tp_fired(&tp_core).await;
        }
    });
}

async fn on_tp_fired(core: &Arc<StrategyCore>) {
    let mut guard = core.lock_state().await;
    let StrategyState::Hedging(state) = &mut *guard else { return };
    if state.phase != Some(Phase::HedgeInProfit) {
        return;
    }
    let Some(handle) = state.tp_watch.take() else { return };
    state.active_stop_order_id = None; // closed by the TP stop itself.

    let Some(main_side) = state.main_side else { return };
    state.barrier_price = Some(handle.target);
    state.barrier_side = Some(if main_side == Side::Long { BarrierSide::Below } else { BarrierSide::Above });
    state.hedge_side = None;
    state.hedge_entry = None;
    state.phase = Some(Phase::MainOnly);

    info!(barrier_price = %handle.target, "hedge closed in profit, re-arming activation watch behind a barrier");
    let _ = arm_activation_watch(core, state).await;
}

fn cancel_all_watches(core: &Arc<StrategyCore>, state: &mut HedgingState) {
    for handle in [state.activation_watch.take(), state.sl_watch.take(), state.trigger_watch.take(), state.tp_watch.take()]
        .into_iter()
        .flatten()
    {
        core.price_stream.cancel_watch(handle.target, handle.direction, handle.barrier);
    }
}

/// Startup restoration: the venue only hands back a single-leg snapshot, so
/// a hedge that happened to be live in the previous process is not detected
/// -- we restore the main leg only and re-arm the activation watch fresh.
/// This is a known simplification (see DESIGN.md: "hedge-leg restoration").
pub async fn restore(core: &Arc<StrategyCore>, side: Side, size: Decimal, entry_price: Decimal) -> Result<()> {
    let mut guard = core.lock_state().await;
    let StrategyState::Hedging(state) = &mut *guard else { return Ok(()) };
    state.core.last_quantity = Some(size);
    state.main_side = Some(side);
    state.main_entry = Some(entry_price);
    state.main_volume = Some(size);
    state.phase = Some(Phase::MainOnly);
    arm_activation_watch(core, state).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_count_stays_below_max_until_disabled() {
        let mut state = HedgingState::new(2);
        state.failure_count = 1;
        assert!(state.failure_count < state.max_failures);
        state.failure_count += 1;
        assert_eq!(state.failure_count, state.max_failures);
    }

    #[test]
    fn tp_barrier_side_is_below_for_long_main_above_for_short_main() {
        assert_eq!(
            if Side::Long == Side::Long { BarrierSide::Below } else { BarrierSide::Above },
            BarrierSide::Below
        );
        assert_eq!(
            if Side::Short == Side::Long { BarrierSide::Below } else { BarrierSide::Above },
            BarrierSide::Above
        );
    }
}
