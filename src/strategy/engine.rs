//! Strategy Engine: the per-cycle orchestration of data, signal, ladder,
//! risk and funds.
//!
//! A single task owns all mutable strategy state and awaits each cycle in
//! turn, so cycles never overlap. Exchange I/O is the only suspension point.

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::allocator::{AllocationInputs, AssetAllocation, FundAllocator};
use super::grid::{CancelIntent, CancelOutcome, GridManager, PlaceOutcome};
use super::position::Position;
use super::signal::{breakout_adjustment, compute_signal, BreakoutInputs, S1State, SignalError};
use super::snapshot::{ActionKind, ActionRecord, EngineSnapshot};
use crate::config::Config;
use crate::exchange::{
    AccountBalances, ExchangeGateway, OrderReport, PriceSnapshot, RetryPolicy, Side,
};
use crate::market::{annualized_volatility, step_for_volatility, MarketDataGate};
use crate::persistence::{PersistedState, PersistenceManager};
use crate::risk::{
    AlertKind, AlertSeverity, HealthMonitor, OrderLimits, ProposedOrder, RiskContext,
    RiskDecision, RiskLimiter, RiskViolation,
};

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub placed: usize,
    pub cancelled: usize,
    pub rejected_by_risk: usize,
    pub fills: usize,
    pub transfers: usize,
    pub adopted: usize,
    pub orphans_cancelled: usize,
    /// Inputs were unavailable and nothing was decided
    pub skipped: bool,
}

impl CycleReport {
    pub fn is_quiet(&self) -> bool {
        self.placed == 0 && self.cancelled == 0 && self.fills == 0 && self.transfers == 0
    }
}

/// Funds a cycle may still commit, tracked locally between placements.
#[derive(Debug, Clone, Copy)]
struct Budget {
    equity: Decimal,
    mark_price: Decimal,
    quote_free: Decimal,
    base_free: Decimal,
}

pub struct StrategyEngine<G: ExchangeGateway> {
    config: Config,
    gateway: G,
    retry: RetryPolicy,
    gate: MarketDataGate,
    risk: RiskLimiter,
    grid: GridManager,
    allocator: FundAllocator,
    health: HealthMonitor,
    store: Option<PersistenceManager>,
    cycle: u64,
    s1: Option<S1State>,
    s1_fallback: bool,
    allocation: Vec<AssetAllocation>,
    /// Last risk violation per slot, so repeats are not logged as new actions
    risk_notes: HashMap<i64, RiskViolation>,
    /// Cycle from which a breakout order on this side may be sent again
    breakout_retry_after: HashMap<Side, u64>,
    recent_actions: VecDeque<ActionRecord>,
    snapshot_tx: watch::Sender<EngineSnapshot>,
}

impl<G: ExchangeGateway> StrategyEngine<G> {
    pub fn new(config: Config, gateway: G, store: Option<PersistenceManager>) -> Self {
        let limits = OrderLimits::from_market(&config.market);
        let (snapshot_tx, _) = watch::channel(EngineSnapshot::default());
        Self {
            retry: RetryPolicy::from_config(&config.engine),
            gate: MarketDataGate::new(&config.market, &config.s1),
            risk: RiskLimiter::new(config.risk.clone(), limits),
            grid: GridManager::new(config.grid.clone(), &config.market),
            allocator: FundAllocator::new(config.allocator.clone(), &config.market),
            health: HealthMonitor::new(
                config.risk.max_errors_per_window,
                config.risk.error_window_minutes,
            ),
            store,
            cycle: 0,
            s1: None,
            s1_fallback: false,
            allocation: Vec::new(),
            risk_notes: HashMap::new(),
            breakout_retry_after: HashMap::new(),
            recent_actions: VecDeque::new(),
            snapshot_tx,
            gateway,
            config,
        }
    }

    /// Feed the market data gate from a price stream.
    pub fn with_stream(mut self, stream: watch::Receiver<Option<PriceSnapshot>>) -> Self {
        self.gate = self.gate.with_stream(stream);
        self
    }

    /// Dashboard feed, replaced after every cycle.
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn grid(&self) -> &GridManager {
        &self.grid
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn s1(&self) -> Option<&S1State> {
        self.s1.as_ref()
    }

    async fn read_account(&self) -> Result<(AccountBalances, Vec<OrderReport>)> {
        let symbol = self.config.market.symbol.as_str();
        let gateway = &self.gateway;
        let (balances, open_orders) = tokio::try_join!(
            self.retry.read("get_balance", || gateway.get_balance()),
            self.retry.read("list_open_orders", || gateway.list_open_orders(symbol)),
        )?;
        Ok((balances, open_orders))
    }

    /// Initial reconciliation: restore hints, anchor the ladder, sync it with
    /// live orders and rehydrate the position from balances.
    pub async fn startup(&mut self) -> Result<()> {
        let persisted = match &self.store {
            Some(store) => store.load_state().unwrap_or_else(|e| {
                warn!(error = %e, "Could not load persisted state, starting fresh");
                None
            }),
            None => None,
        };

        let now = Utc::now();
        let price = self
            .gate
            .refresh(&self.gateway, &self.retry, now)
            .await
            .context("Failed to fetch initial price")?;
        let (balances, open_orders) = self
            .read_account()
            .await
            .context("Failed to read account state")?;

        let mut seed_position = Position::default();
        match persisted {
            Some(state) if state.anchor > Decimal::ZERO && state.step > Decimal::ZERO => {
                if !self.config.grid.volatility_step && state.step != self.config.grid.step_pct {
                    warn!(
                        persisted = %state.step,
                        configured = %self.config.grid.step_pct,
                        "Configured grid step differs from the persisted ladder; keeping the ladder's step"
                    );
                }
                self.grid.set_ladder(state.anchor, state.step);
                self.grid.restore(state.levels, state.center);
                self.cycle = state.cycle;
                seed_position = state.position;
            }
            _ => {
                let anchor = self.config.grid.anchor_price.unwrap_or_else(|| {
                    crate::utils::round_to_tick(price.last, self.config.market.tick_size)
                });
                let step = self.initial_step().await;
                self.grid.set_ladder(anchor, step);
            }
        }

        self.grid.set_position(seed_position);
        self.grid.begin_cycle(self.cycle);
        let sync = self
            .grid
            .sync(&self.gateway, &self.retry, &mut self.health, &open_orders, price.last)
            .await;
        for orphan in &sync.orphans_to_cancel {
            self.grid
                .cancel_orphan(&self.gateway, &self.retry, &mut self.health, orphan)
                .await;
        }

        // Balances are the truth for quantity; the seed only carries cost basis and PnL
        let base_total = balances.get(&self.config.market.base_asset).total();
        let position = Position::rehydrate(base_total, price.last, Some(self.grid.position()));
        self.grid.set_position(position);

        info!(
            price = %price.last,
            anchor = ?self.grid.ladder().map(|l| l.anchor),
            levels = self.grid.levels().count(),
            adopted = sync.adopted,
            orphans = sync.orphans_to_cancel.len() + sync.flagged,
            position = %self.grid.position().quantity,
            "Startup reconciliation complete"
        );

        self.finish_cycle();
        Ok(())
    }

    /// Step for a fresh ladder: the configured one, or picked from hourly
    /// volatility when `grid.volatility_step` is on.
    async fn initial_step(&self) -> Decimal {
        let configured = self.config.grid.step_pct;
        if !self.config.grid.volatility_step {
            return configured;
        }
        let symbol = &self.config.market.symbol;
        let window = self.config.grid.volatility_window;
        let candles = self
            .retry
            .read("get_candles", || self.gateway.get_candles(symbol, "1h", window))
            .await;
        match candles.map(|c| annualized_volatility(&c)) {
            Ok(Some(volatility)) => {
                let step = step_for_volatility(volatility);
                info!(volatility, %step, "Grid step chosen from hourly volatility");
                step
            }
            Ok(None) => {
                warn!(%configured, "Not enough hourly candles for volatility, using configured step");
                configured
            }
            Err(e) => {
                warn!(error = %e, %configured, "Hourly candles unavailable, using configured step");
                configured
            }
        }
    }

    /// One decision cycle. Never fails: missing inputs skip the cycle.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycle += 1;
        let cycle = self.cycle;
        self.grid.begin_cycle(cycle);
        let mut report = CycleReport {
            cycle,
            ..Default::default()
        };
        let now = Utc::now();

        // 1. Reads, all awaited before any decision
        let symbol = self.config.market.symbol.clone();
        let gateway = &self.gateway;
        let retry = &self.retry;
        let (price, balances, open_orders) = tokio::join!(
            self.gate.refresh(gateway, retry, now),
            retry.read("get_balance", || gateway.get_balance()),
            retry.read("list_open_orders", || gateway.list_open_orders(&symbol)),
        );
        let (price, balances, open_orders) = match (price, balances, open_orders) {
            (Ok(p), Ok(b), Ok(o)) => (p, b, o),
            (p, b, o) => {
                let reason = [p.err(), b.err(), o.err()]
                    .into_iter()
                    .flatten()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                warn!(cycle, %reason, "Cycle skipped, market or account state unavailable");
                self.health.record_error(&reason);
                self.health.record_cycle_failure(&reason);
                report.skipped = true;
                self.publish();
                return report;
            }
        };

        // 2. S1 signal, or the fallback scale while history is short
        let scale = self.update_signal(&price, now);

        // 3. Reconciliation and drift check
        let sync = self
            .grid
            .sync(&self.gateway, &self.retry, &mut self.health, &open_orders, price.last)
            .await;
        report.fills += sync.fills.len();
        report.adopted = sync.adopted;
        for orphan in &sync.orphans_to_cancel {
            if self
                .grid
                .cancel_orphan(&self.gateway, &self.retry, &mut self.health, orphan)
                .await
            {
                report.orphans_cancelled += 1;
            }
        }
        let base_total = balances.get(&self.config.market.base_asset).total();
        if sync.fills.is_empty() && sync.unresolved == 0 {
            self.grid
                .check_position_drift(base_total, price.last, &mut self.health);
        }
        self.grid.mark(price.last);

        let mut mutated = report.orphans_cancelled > 0;
        let mut budget = Budget {
            equity: balances.equity(
                &self.config.market.base_asset,
                &self.config.market.quote_asset,
                price.last,
            ),
            mark_price: price.last,
            quote_free: balances.get(&self.config.market.quote_asset).free,
            base_free: balances.get(&self.config.market.base_asset).free,
        };

        // 4. Plan: cancels first, then risk-checked placements
        self.grid.set_equity(budget.equity);
        let plan = self.grid.plan(&price, cycle);
        for intent in &plan.cancels {
            if let CancelOutcome::Cancelled { fill } = self
                .grid
                .cancel(&self.gateway, &self.retry, &mut self.health, intent)
                .await
            {
                report.cancelled += 1;
                report.fills += usize::from(fill.is_some());
                mutated = true;
            }
        }
        // Cancelled orders released their funds on the exchange
        if report.cancelled > 0 {
            if let Ok(fresh) = self
                .retry
                .read("get_balance", || self.gateway.get_balance())
                .await
            {
                budget.quote_free = fresh.get(&self.config.market.quote_asset).free;
                budget.base_free = fresh.get(&self.config.market.base_asset).free;
            }
        }

        for intent in &plan.placements {
            if intent.side == Side::Sell && budget.base_free < intent.quantity {
                debug!(slot = intent.slot, free = %budget.base_free, "Not enough free base for sell, waiting for funds");
                continue;
            }
            let proposed = ProposedOrder {
                side: intent.side,
                price: intent.price,
                quantity: intent.quantity,
            };
            let order = match self.risk.authorize(&proposed, &self.risk_context(&budget, scale)) {
                RiskDecision::Authorized(order) => {
                    self.risk_notes.remove(&intent.slot);
                    order
                }
                RiskDecision::Rejected(violation) => {
                    report.rejected_by_risk += 1;
                    self.note_risk_rejection(intent.slot, intent.side, intent.price, intent.quantity, violation);
                    continue;
                }
            };

            match self
                .grid
                .place(&self.gateway, &self.retry, &mut self.health, intent, order.quantity)
                .await
            {
                PlaceOutcome::Placed(placed) => {
                    report.placed += 1;
                    report.fills += usize::from(placed.executed_qty > Decimal::ZERO);
                    match intent.side {
                        Side::Buy => budget.quote_free -= order.quantity * order.price,
                        Side::Sell => budget.base_free -= order.quantity,
                    }
                    mutated = true;
                }
                PlaceOutcome::Deferred => mutated = true,
                PlaceOutcome::Rejected { .. } | PlaceOutcome::Degraded => {}
            }
        }

        // 5. Optional breakout rebalance
        if self.breakout(&price, &budget, scale).await {
            mutated = true;
        }

        // 6. Fund allocator on its own cadence
        if self.allocator.is_due(cycle) {
            let balances = if mutated {
                match self
                    .retry
                    .read("get_balance", || self.gateway.get_balance())
                    .await
                {
                    Ok(fresh) => Some(fresh),
                    Err(e) => {
                        warn!(error = %e, "Balance refresh failed, allocator skipped this cycle");
                        self.health.record_error(&e.to_string());
                        None
                    }
                }
            } else {
                Some(balances)
            };
            if let Some(balances) = balances {
                report.transfers = self.allocate(&balances, &price).await;
            }
        }

        self.health.record_cycle_success();
        self.finish_cycle();

        if report.is_quiet() && report.rejected_by_risk == 0 {
            debug!(cycle, price = %price.last, "Cycle complete, nothing to do");
        } else {
            info!(
                cycle,
                price = %price.last,
                placed = report.placed,
                cancelled = report.cancelled,
                fills = report.fills,
                rejected_by_risk = report.rejected_by_risk,
                transfers = report.transfers,
                position = %self.grid.position().quantity,
                "Cycle complete"
            );
        }
        report
    }

    fn update_signal(&mut self, price: &PriceSnapshot, now: chrono::DateTime<Utc>) -> Decimal {
        match compute_signal(self.gate.window(), price.last, &self.config.s1, now) {
            Ok(state) => {
                if self.s1_fallback {
                    info!(scale = %state.scale, "S1 history available again");
                    self.health.clear_degraded("s1:history");
                }
                self.s1_fallback = false;
                let scale = state.scale;
                self.s1 = Some(state);
                scale
            }
            Err(SignalError::InsufficientHistory { have, need }) => {
                if self.health.set_degraded("s1:history") {
                    warn!(have, need, fallback = %self.config.s1.fallback_scale, "Insufficient S1 history, using fallback scale");
                    self.health.raise(
                        AlertKind::InsufficientHistory { have, need },
                        AlertSeverity::Warning,
                        format!("Only {} of {} candles available for S1", have, need),
                        "New buy exposure limited to the fallback scale",
                    );
                }
                self.s1_fallback = true;
                self.s1 = None;
                self.config.s1.fallback_scale
            }
        }
    }

    fn risk_context(&self, budget: &Budget, scale: Decimal) -> RiskContext {
        RiskContext {
            position: self.grid.position().quantity,
            pending_buys: self.grid.pending_buy_quantity(),
            pending_sells: self.grid.pending_sell_quantity(),
            equity: budget.equity,
            mark_price: budget.mark_price,
            quote_free: budget.quote_free,
            s1_scale: scale,
            s1_fallback: self.s1_fallback,
        }
    }

    fn note_risk_rejection(
        &mut self,
        slot: i64,
        side: Side,
        price: Decimal,
        quantity: Decimal,
        violation: RiskViolation,
    ) {
        if self.risk_notes.insert(slot, violation) == Some(violation) {
            return;
        }
        debug!(slot, side = %side, %price, %quantity, %violation, "Order not authorized");
        self.grid.record(
            ActionKind::RiskRejected,
            Some(slot),
            Some(side),
            Some(price),
            Some(quantity),
            violation.to_string(),
        );
    }

    async fn breakout(&mut self, price: &PriceSnapshot, budget: &Budget, scale: Decimal) -> bool {
        let Some(state) = &self.s1 else {
            return false;
        };
        let limits = self.risk.limits();
        let inputs = BreakoutInputs {
            position: self.grid.position().quantity,
            equity: budget.equity,
            lot_size: limits.lot_size,
            min_notional: limits.min_notional,
        };
        let Some(proposal) = breakout_adjustment(state, price, &inputs, &self.config.s1) else {
            return false;
        };
        if let Some(&retry_after) = self.breakout_retry_after.get(&proposal.side) {
            if self.cycle < retry_after {
                debug!(side = %proposal.side, retry_after, "Breakout order cooling down");
                return false;
            }
        }
        info!(
            side = %proposal.side,
            quantity = %proposal.quantity,
            current_ratio = %proposal.current_ratio,
            target_ratio = %proposal.target_ratio,
            "Price outside S1 range, rebalancing"
        );

        let proposed = ProposedOrder {
            side: proposal.side,
            price: proposal.price,
            quantity: proposal.quantity,
        };
        let order = match self.risk.authorize(&proposed, &self.risk_context(budget, scale)) {
            RiskDecision::Authorized(order) => order,
            RiskDecision::Rejected(violation) => {
                debug!(%violation, "Breakout order not authorized");
                return false;
            }
        };
        let executed = self
            .grid
            .place_breakout(
                &self.gateway,
                &self.retry,
                &mut self.health,
                order.side,
                order.price,
                order.quantity,
            )
            .await;
        if executed > Decimal::ZERO {
            self.breakout_retry_after.remove(&order.side);
        } else {
            let retry_after = self.cycle + self.config.s1.breakout_cooldown_cycles;
            info!(side = %order.side, retry_after, "Breakout order did not fill, cooling down");
            self.breakout_retry_after.insert(order.side, retry_after);
        }
        true
    }

    async fn allocate(&mut self, balances: &AccountBalances, price: &PriceSnapshot) -> usize {
        let inputs = AllocationInputs {
            idle_floor: self.risk.idle_floor(),
            reserved_quote: self.grid.reserved_quote(),
            reserved_base: self.grid.reserved_base(),
            next_buy_notional: self.grid.level_notional(),
            next_sell_quantity: self.grid.order_quantity(price.ask).unwrap_or_default(),
        };
        let allocations = self.allocator.assess(balances, &inputs);
        let decisions = self.allocator.plan(&allocations);
        self.allocation = allocations;

        let mut transfers = 0;
        for decision in &decisions {
            if self
                .allocator
                .execute(&self.gateway, &self.retry, &mut self.health, decision)
                .await
            {
                transfers += 1;
                self.grid.record(
                    ActionKind::Transfer,
                    None,
                    None,
                    None,
                    Some(decision.amount),
                    format!("{} {}", decision.asset, decision.direction),
                );
            }
        }
        transfers
    }

    /// Record actions, persist and publish the snapshot.
    fn finish_cycle(&mut self) {
        let actions = self.grid.take_actions();
        if let Some(store) = &self.store {
            if let Err(e) = store.record_actions(&actions) {
                warn!(error = %e, "Failed to persist actions");
            }
        }
        self.recent_actions.extend(actions);
        while self.recent_actions.len() > self.config.engine.recent_actions {
            self.recent_actions.pop_front();
        }
        self.persist();
        self.publish();
    }

    fn persist(&self) {
        let (Some(store), Some(ladder)) = (&self.store, self.grid.ladder()) else {
            return;
        };
        let state = PersistedState {
            anchor: ladder.anchor,
            step: ladder.step,
            center: self.grid.center(),
            cycle: self.cycle,
            position: self.grid.position().clone(),
            levels: self.grid.levels().cloned().collect(),
            last_saved: Utc::now(),
        };
        if let Err(e) = store.save_state(&state) {
            warn!(error = %e, "Failed to persist engine state");
        }
    }

    fn publish(&self) {
        let ladder = self.grid.ladder();
        let snapshot = EngineSnapshot {
            cycle: self.cycle,
            timestamp: Some(Utc::now()),
            price: self.gate.latest().cloned(),
            anchor: ladder.map(|l| l.anchor).unwrap_or_default(),
            step: ladder.map(|l| l.step).unwrap_or_default(),
            center: self.grid.center(),
            levels: self.grid.levels().cloned().collect(),
            position: self.grid.position().clone(),
            s1: self.s1.clone(),
            s1_degraded: self.s1_fallback,
            allocation: self.allocation.clone(),
            recent_actions: self.recent_actions.iter().cloned().collect(),
            alerts: self.health.recent_alerts(20),
            degraded: self.health.degraded(),
        };
        self.snapshot_tx.send_replace(snapshot);
    }

    /// Swap in a reloaded configuration between cycles.
    pub fn apply_config(&mut self, mut config: Config) {
        if config.market.symbol != self.config.market.symbol {
            warn!(
                current = %self.config.market.symbol,
                requested = %config.market.symbol,
                "Changing the traded pair requires a restart, keeping current market settings"
            );
        }
        config.market = self.config.market.clone();
        config.engine.db_path = self.config.engine.db_path.clone();

        self.retry = RetryPolicy::from_config(&config.engine);
        self.gate.apply_config(&config.s1);
        self.risk.replace_config(config.risk.clone());
        self.grid.apply_config(config.grid.clone());
        self.allocator.apply_config(config.allocator.clone());
        self.health
            .set_thresholds(config.risk.max_errors_per_window, config.risk.error_window_minutes);
        self.config = config;
        info!("Configuration reloaded");
    }

    /// Decision loop. Stops before the next cycle once `shutdown` flips to
    /// true; the current cycle always completes.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
        mut reload: watch::Receiver<Config>,
    ) {
        let mut poll_secs = self.config.engine.poll_interval_secs;
        let mut interval = tokio::time::interval(Duration::from_secs(poll_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(poll_interval_secs = poll_secs, "Strategy engine running");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }

            if reload.has_changed().unwrap_or(false) {
                let config = reload.borrow_and_update().clone();
                self.apply_config(config);
                if self.config.engine.poll_interval_secs != poll_secs {
                    poll_secs = self.config.engine.poll_interval_secs;
                    interval = tokio::time::interval(Duration::from_secs(poll_secs));
                    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    interval.reset();
                }
            }

            let report = self.run_cycle().await;
            if report.skipped && self.health.consecutive_cycle_failures() >= 10 {
                error!(
                    failures = self.health.consecutive_cycle_failures(),
                    "Exchange unreachable for many consecutive cycles"
                );
            }
        }

        self.shutdown().await;
    }

    /// Optional cancel-all, a final reconciliation and a final persist.
    pub async fn shutdown(&mut self) {
        info!(cycle = self.cycle, "Shutting down strategy engine");

        if self.config.engine.cancel_on_shutdown {
            let intents: Vec<CancelIntent> = self
                .grid
                .levels()
                .filter(|l| l.status.is_live())
                .filter_map(|l| {
                    l.order_id.map(|order_id| CancelIntent {
                        slot: l.slot,
                        order_id,
                        side: l.side,
                        reason: "shutdown",
                    })
                })
                .collect();
            for intent in &intents {
                self.grid
                    .cancel(&self.gateway, &self.retry, &mut self.health, intent)
                    .await;
            }
            info!(cancelled = intents.len(), "Grid orders cancelled on shutdown");
        }

        let last_price = self
            .gate
            .latest()
            .map(|p| p.last)
            .or_else(|| self.grid.ladder().map(|l| l.anchor));
        match (self.read_account().await, last_price) {
            (Ok((_, open_orders)), Some(price)) => {
                let sync = self
                    .grid
                    .sync(&self.gateway, &self.retry, &mut self.health, &open_orders, price)
                    .await;
                debug!(fills = sync.fills.len(), "Final reconciliation done");
            }
            (Err(e), _) => warn!(error = %e, "Final reconciliation skipped"),
            (_, None) => {}
        }

        self.finish_cycle();
        info!("Strategy engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{
        AccountBalances, Candle, GatewayError, GatewayResult, OrderReport, OrderRequest,
        OrderStatus, PaperExchange, PaperOp, TimeInForce, TransferDirection,
    };
    use async_trait::async_trait;
    use crate::strategy::LevelStatus;
    use crate::test_support::{daily_candles, test_config};
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    async fn exchange(candles: usize) -> Arc<PaperExchange> {
        let exchange = Arc::new(PaperExchange::new("BNBUSDT", "BNB", "USDT", dec!(10000), dec!(4)));
        let now = Utc::now();
        exchange.set_price(PriceSnapshot::at(dec!(600), now)).await;
        exchange
            .set_candles(daily_candles(now - ChronoDuration::days(candles as i64), candles, dec!(600)))
            .await;
        exchange
    }

    fn quiet_config() -> Config {
        let mut config = test_config();
        config.grid.anchor_price = Some(dec!(600));
        config.allocator.enabled = false;
        config
    }

    async fn engine(config: Config, exchange: &Arc<PaperExchange>) -> StrategyEngine<Arc<PaperExchange>> {
        let mut engine = StrategyEngine::new(config, exchange.clone(), None);
        engine.startup().await.unwrap();
        engine
    }

    /// Paper exchange that can serve an older open-orders listing for one
    /// read, as when the listing lags a fill, and can let IOC orders expire
    /// as if the touch moved before they arrived.
    struct ScriptedVenue {
        inner: Arc<PaperExchange>,
        stale: std::sync::Mutex<Option<Vec<OrderReport>>>,
        miss_ioc: bool,
        ioc_sent: std::sync::Mutex<u32>,
    }

    impl ScriptedVenue {
        fn new(inner: Arc<PaperExchange>, miss_ioc: bool) -> Arc<Self> {
            Arc::new(Self {
                inner,
                stale: std::sync::Mutex::new(None),
                miss_ioc,
                ioc_sent: std::sync::Mutex::new(0),
            })
        }

        fn serve_once(&self, orders: Vec<OrderReport>) {
            *self.stale.lock().unwrap() = Some(orders);
        }

        fn ioc_sent(&self) -> u32 {
            *self.ioc_sent.lock().unwrap()
        }
    }

    #[async_trait]
    impl ExchangeGateway for ScriptedVenue {
        async fn get_price(&self, symbol: &str) -> GatewayResult<PriceSnapshot> {
            self.inner.get_price(symbol).await
        }

        async fn get_candles(&self, symbol: &str, interval: &str, limit: usize) -> GatewayResult<Vec<Candle>> {
            self.inner.get_candles(symbol, interval, limit).await
        }

        async fn get_balance(&self) -> GatewayResult<AccountBalances> {
            self.inner.get_balance().await
        }

        async fn place_order(&self, order: &OrderRequest) -> GatewayResult<OrderReport> {
            if order.time_in_force == TimeInForce::Ioc {
                *self.ioc_sent.lock().unwrap() += 1;
                if self.miss_ioc {
                    return Ok(OrderReport {
                        order_id: 9_000 + i64::from(self.ioc_sent()),
                        client_order_id: order.client_order_id.clone(),
                        side: order.side,
                        price: order.price,
                        orig_qty: order.quantity,
                        executed_qty: Decimal::ZERO,
                        status: OrderStatus::Expired,
                    });
                }
            }
            self.inner.place_order(order).await
        }

        async fn cancel_order(&self, symbol: &str, order_id: i64) -> GatewayResult<OrderReport> {
            self.inner.cancel_order(symbol, order_id).await
        }

        async fn list_open_orders(&self, symbol: &str) -> GatewayResult<Vec<OrderReport>> {
            let stale = self.stale.lock().unwrap().take();
            match stale {
                Some(orders) => Ok(orders),
                None => self.inner.list_open_orders(symbol).await,
            }
        }

        async fn get_order(&self, symbol: &str, client_order_id: &str) -> GatewayResult<Option<OrderReport>> {
            self.inner.get_order(symbol, client_order_id).await
        }

        async fn transfer(&self, asset: &str, amount: Decimal, direction: TransferDirection) -> GatewayResult<()> {
            self.inner.transfer(asset, amount, direction).await
        }
    }

    fn manual_buy(price: Decimal, id: &str) -> OrderRequest {
        OrderRequest {
            symbol: "BNBUSDT".into(),
            side: Side::Buy,
            price,
            quantity: dec!(0.034),
            time_in_force: TimeInForce::Gtc,
            client_order_id: id.into(),
        }
    }

    #[tokio::test]
    async fn test_second_cycle_without_change_is_idempotent() {
        let exchange = exchange(60).await;
        let mut config = quiet_config();
        config.allocator.enabled = true;
        let mut engine = engine(config, &exchange).await;

        let first = engine.run_cycle().await;
        assert_eq!(first.placed, 10);
        assert!(first.transfers > 0);

        let second = engine.run_cycle().await;
        assert_eq!(second.placed, 0);
        assert_eq!(second.cancelled, 0);
        assert_eq!(second.transfers, 0);
        assert_eq!(exchange.open_orders().await.len(), 10);
    }

    #[tokio::test]
    async fn test_ladder_follows_ten_percent_drop() {
        let exchange = exchange(60).await;
        let mut engine = engine(quiet_config(), &exchange).await;
        engine.run_cycle().await;

        exchange.set_price(PriceSnapshot::at(dec!(540), Utc::now())).await;
        let report = engine.run_cycle().await;

        assert_eq!(report.fills, 5);
        assert_eq!(report.cancelled, 5);
        assert_eq!(report.placed, 10);
        // 540 sits exactly on slot -10
        assert_eq!(engine.grid().center(), Some(-10));

        let slots: Vec<i64> = engine.grid().levels().map(|l| l.slot).collect();
        assert_eq!(slots, vec![-15, -14, -13, -12, -11, -9, -8, -7, -6, -5]);
        assert!(engine
            .grid()
            .levels()
            .all(|l| (l.side == Side::Buy) == (l.slot < -10)));
        assert_eq!(engine.grid().position().quantity, dec!(4.170));
    }

    #[tokio::test]
    async fn test_lagging_order_list_does_not_double_count_fill() {
        let paper = exchange(60).await;
        let gateway = ScriptedVenue::new(paper.clone(), false);
        let mut engine = StrategyEngine::new(quiet_config(), gateway.clone(), None);
        engine.startup().await.unwrap();
        engine.run_cycle().await;

        let before_fill = paper.open_orders().await;
        paper.set_price(PriceSnapshot::at(dec!(593), Utc::now())).await;
        assert_eq!(paper.open_orders().await.len(), 9);
        gateway.serve_once(before_fill);

        // Balance already shows the fill while the listing still has the order
        let lagging = engine.run_cycle().await;
        assert_eq!(lagging.fills, 0);
        let caught_up = engine.run_cycle().await;
        assert_eq!(caught_up.fills, 1);

        assert_eq!(engine.grid().position().quantity, paper.balance("BNB").await.total());
        assert!(!engine
            .health()
            .alerts()
            .any(|a| matches!(a.kind, AlertKind::PositionDrift { .. })));
    }

    #[tokio::test]
    async fn test_unfilled_breakout_order_waits_for_cooldown() {
        let paper = Arc::new(PaperExchange::new("BNBUSDT", "BNB", "USDT", dec!(1000), dec!(4)));
        let now = Utc::now();
        paper.set_price(PriceSnapshot::at(dec!(620), now)).await;
        paper
            .set_candles(daily_candles(now - ChronoDuration::days(60), 60, dec!(600)))
            .await;
        let gateway = ScriptedVenue::new(paper.clone(), true);
        let mut config = quiet_config();
        config.s1.breakout_rebalance = true;
        config.s1.breakout_cooldown_cycles = 3;
        let mut engine = StrategyEngine::new(config, gateway.clone(), None);
        engine.startup().await.unwrap();

        // 620 is above the 606 range high with ~71% of equity in BNB
        engine.run_cycle().await;
        assert_eq!(gateway.ioc_sent(), 1);
        assert_eq!(engine.grid().position().quantity, dec!(4));

        engine.run_cycle().await;
        engine.run_cycle().await;
        assert_eq!(gateway.ioc_sent(), 1);

        engine.run_cycle().await;
        assert_eq!(gateway.ioc_sent(), 2);
    }

    #[tokio::test]
    async fn test_fresh_ladder_step_from_hourly_volatility() {
        let exchange = exchange(60).await;
        let mut config = quiet_config();
        config.grid.step_pct = dec!(0.02);
        config.grid.volatility_step = true;
        let engine = engine(config, &exchange).await;

        // Flat closes sit in the lowest band
        assert_eq!(engine.grid().ladder().map(|l| l.step), Some(dec!(0.010)));
        assert_eq!(exchange.calls(PaperOp::GetCandles).await, 2);
    }

    #[tokio::test]
    async fn test_volatility_step_falls_back_without_candles() {
        let exchange = exchange(60).await;
        exchange.set_candles(Vec::new()).await;
        let mut config = quiet_config();
        config.grid.step_pct = dec!(0.02);
        config.grid.volatility_step = true;
        let engine = engine(config, &exchange).await;

        assert_eq!(engine.grid().ladder().map(|l| l.step), Some(dec!(0.02)));
    }

    #[tokio::test]
    async fn test_orders_sized_from_equity_share() {
        let exchange = exchange(60).await;
        let mut config = quiet_config();
        config.grid.order_notional_ratio = Some(dec!(0.01));
        let mut engine = engine(config, &exchange).await;

        // 1% of 10000 + 4 * 600 = 124 USDT per level
        engine.run_cycle().await;
        assert_eq!(engine.grid().level(-1).map(|l| l.quantity), Some(dec!(0.208)));
        assert_eq!(engine.grid().level(1).map(|l| l.quantity), Some(dec!(0.204)));
    }

    #[tokio::test]
    async fn test_short_history_blocks_buys() {
        let exchange = exchange(30).await;
        let mut engine = engine(quiet_config(), &exchange).await;

        let report = engine.run_cycle().await;

        assert_eq!(report.rejected_by_risk, 5);
        assert_eq!(report.placed, 5);
        assert!(engine.grid().levels().all(|l| l.side == Side::Sell));
        assert!(engine.s1().is_none());
        assert!(engine
            .health()
            .alerts()
            .any(|a| matches!(a.kind, AlertKind::InsufficientHistory { have: 30, need: 52 })));
        assert!(engine.subscribe().borrow().s1_degraded);
    }

    #[tokio::test]
    async fn test_matching_orphan_is_adopted_without_resubmission() {
        let exchange = exchange(60).await;
        exchange.place_order(&manual_buy(dec!(588), "manual-7")).await.unwrap();
        let mut config = quiet_config();
        config.grid.adopt_orphans = true;
        let mut engine = engine(config, &exchange).await;

        assert_eq!(engine.grid().level(-2).map(|l| l.status), Some(LevelStatus::Open));
        let report = engine.run_cycle().await;

        assert_eq!(report.placed, 9);
        assert_eq!(exchange.calls(PaperOp::PlaceOrder).await, 10);
        assert_eq!(exchange.open_orders().await.len(), 10);
    }

    #[tokio::test]
    async fn test_unknown_orphan_is_cancelled() {
        let exchange = exchange(60).await;
        let orphan = exchange.place_order(&manual_buy(dec!(585.5), "manual-8")).await.unwrap();
        let mut engine = engine(quiet_config(), &exchange).await;

        assert!(!exchange.open_orders().await.iter().any(|o| o.order_id == orphan.order_id));
        assert!(engine
            .health()
            .alerts()
            .any(|a| matches!(a.kind, AlertKind::ReconciliationConflict { .. })));

        engine.run_cycle().await;
        assert_eq!(exchange.open_orders().await.len(), 10);
    }

    #[tokio::test]
    async fn test_placement_timeout_resolved_by_client_id() {
        let exchange = exchange(60).await;
        let mut engine = engine(quiet_config(), &exchange).await;
        exchange
            .lose_next_response(PaperOp::PlaceOrder, GatewayError::Unknown("timed out".into()))
            .await;

        let first = engine.run_cycle().await;
        assert_eq!(first.placed, 9);
        assert_eq!(exchange.open_orders().await.len(), 10);

        let second = engine.run_cycle().await;
        assert_eq!(second.placed, 0);
        assert_eq!(exchange.calls(PaperOp::PlaceOrder).await, 10);
        assert!(engine
            .grid()
            .levels()
            .all(|l| l.status == LevelStatus::Open && l.order_id.is_some()));
    }

    #[tokio::test]
    async fn test_transfer_failures_alert_and_grid_keeps_trading() {
        let exchange = exchange(60).await;
        let mut config = quiet_config();
        config.allocator.enabled = true;
        config.allocator.manage_base = false;
        let mut engine = engine(config, &exchange).await;
        for _ in 0..3 {
            exchange
                .fail_next(PaperOp::Transfer, GatewayError::Transient("earn unavailable".into()))
                .await;
        }

        let report = engine.run_cycle().await;

        assert_eq!(report.placed, 10);
        assert_eq!(report.transfers, 0);
        assert!(engine
            .health()
            .alerts()
            .any(|a| matches!(a.kind, AlertKind::TransferFailed { .. })));
        assert_eq!(exchange.balance("USDT").await.earn, Decimal::ZERO);

        let retried = engine.run_cycle().await;
        assert_eq!(retried.transfers, 1);
        assert!(!engine.health().is_degraded("transfer:USDT"));
    }

    #[tokio::test]
    async fn test_unavailable_price_skips_cycle() {
        let exchange = exchange(60).await;
        let mut config = quiet_config();
        config.engine.retry_max_attempts = 1;
        let mut engine = engine(config, &exchange).await;
        exchange
            .fail_next(PaperOp::GetPrice, GatewayError::Transient("connection refused".into()))
            .await;

        let report = engine.run_cycle().await;
        assert!(report.skipped);
        assert_eq!(report.placed, 0);
        assert_eq!(engine.health().consecutive_cycle_failures(), 1);

        let report = engine.run_cycle().await;
        assert!(!report.skipped);
        assert_eq!(report.placed, 10);
    }

    #[tokio::test]
    async fn test_reload_keeps_ladder_geometry() {
        let exchange = exchange(60).await;
        let mut engine = engine(quiet_config(), &exchange).await;
        engine.run_cycle().await;

        let mut reloaded = quiet_config();
        reloaded.grid.step_pct = dec!(0.02);
        reloaded.grid.levels = 3;
        engine.apply_config(reloaded);

        assert_eq!(engine.grid().ladder().map(|l| l.step), Some(dec!(0.01)));
        let report = engine.run_cycle().await;
        // Depth 3 with tolerance 1 keeps slots within +-4
        assert_eq!(report.cancelled, 2);
        assert_eq!(report.placed, 0);
    }

    #[tokio::test]
    async fn test_restart_resumes_persisted_ladder() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("grid.db");
        let exchange = exchange(60).await;
        let mut config = quiet_config();
        config.grid.anchor_price = None;

        let mut first = StrategyEngine::new(
            config.clone(),
            exchange.clone(),
            Some(PersistenceManager::new(&db_path).unwrap()),
        );
        first.startup().await.unwrap();
        assert_eq!(first.run_cycle().await.placed, 10);
        let vanished = first.grid().level(-3).and_then(|l| l.order_id).unwrap();
        drop(first);

        // While the bot is down one order is cancelled by hand and price drifts
        exchange.cancel_order("BNBUSDT", vanished).await.unwrap();
        exchange.set_price(PriceSnapshot::at(dec!(603), Utc::now())).await;

        let mut second = StrategyEngine::new(
            config,
            exchange.clone(),
            Some(PersistenceManager::new(&db_path).unwrap()),
        );
        second.startup().await.unwrap();

        assert_eq!(second.grid().ladder().map(|l| l.anchor), Some(dec!(600)));
        assert_eq!(second.cycle(), 1);
        assert!(second.grid().level(-3).is_none());
        assert_eq!(second.grid().levels().count(), 9);

        let report = second.run_cycle().await;
        assert_eq!(report.placed, 1);
        assert_eq!(second.grid().level(-3).map(|l| l.price), Some(dec!(582)));
        assert_eq!(exchange.open_orders().await.len(), 10);
        assert_eq!(exchange.calls(PaperOp::PlaceOrder).await, 11);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_cancels() {
        let exchange = exchange(60).await;
        let mut config = quiet_config();
        config.engine.cancel_on_shutdown = true;
        let mut engine = engine(config.clone(), &exchange).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_reload_tx, reload_rx) = watch::channel(config);
        let mut snapshots = engine.subscribe();

        let stopper = async {
            snapshots.changed().await.unwrap();
            shutdown_tx.send(true).unwrap();
        };
        tokio::join!(engine.run(shutdown_rx, reload_rx), stopper);

        assert_eq!(engine.cycle(), 1);
        assert!(exchange.open_orders().await.is_empty());
        assert_eq!(engine.grid().levels().count(), 0);
    }
}
