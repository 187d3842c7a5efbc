//! Grid Manager: the ladder of limit orders around the current price.
//!
//! Slots form an arithmetic ladder `price(k) = anchor * (1 + k * step)`.
//! The center slot tracks the last fill and is clamped to the floor slot of
//! the current price (or the one above), leaving exactly one empty slot
//! between the buy and sell sides. The ladder is keyed by slot, so a slot can
//! never hold two levels.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use super::position::Position;
use super::snapshot::{ActionKind, ActionRecord};
use crate::config::{GridConfig, MarketConfig, OrphanPolicy};
use crate::exchange::{
    ExchangeGateway, GatewayError, OrderReport, OrderRequest, OrderStatus, PriceSnapshot,
    RetryPolicy, Side, TimeInForce,
};
use crate::risk::{AlertKind, AlertSeverity, HealthMonitor, OrderLimits};
use crate::utils::{round_down_to_lot, round_to_tick};

static NONCE: AtomicU64 = AtomicU64::new(0);

/// Lifecycle of a grid level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelStatus {
    /// Submitted, exchange id not confirmed yet
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    /// Placement failed; the slot waits until `retry_after_cycle`
    Degraded,
}

impl LevelStatus {
    /// Level may hold an order on the exchange.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            LevelStatus::Pending | LevelStatus::Open | LevelStatus::PartiallyFilled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LevelStatus::Pending => "pending",
            LevelStatus::Open => "open",
            LevelStatus::PartiallyFilled => "partially_filled",
            LevelStatus::Filled => "filled",
            LevelStatus::Cancelled => "cancelled",
            LevelStatus::Degraded => "degraded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "pending" => LevelStatus::Pending,
            "open" => LevelStatus::Open,
            "partially_filled" => LevelStatus::PartiallyFilled,
            "filled" => LevelStatus::Filled,
            "cancelled" => LevelStatus::Cancelled,
            "degraded" => LevelStatus::Degraded,
            _ => return None,
        })
    }
}

/// One rung of the ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    pub slot: i64,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub status: LevelStatus,
    pub order_id: Option<i64>,
    pub client_order_id: String,
    /// Consecutive failed placements on this slot
    pub attempts: u32,
    pub retry_after_cycle: u64,
    pub updated_at: DateTime<Utc>,
}

impl GridLevel {
    pub fn remaining(&self) -> Decimal {
        (self.quantity - self.filled_quantity).max(Decimal::ZERO)
    }
}

/// Fixed slot geometry of a ladder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Ladder {
    pub anchor: Decimal,
    pub step: Decimal,
    pub tick_size: Decimal,
}

impl Ladder {
    pub fn slot_price(&self, slot: i64) -> Decimal {
        round_to_tick(
            self.anchor * (Decimal::ONE + Decimal::from(slot) * self.step),
            self.tick_size,
        )
    }

    /// Highest slot whose price is at or below `price`.
    pub fn floor_slot(&self, price: Decimal) -> i64 {
        let mut slot = ((price / self.anchor - Decimal::ONE) / self.step)
            .floor()
            .to_i64()
            .unwrap_or(0);
        while self.slot_price(slot) > price {
            slot -= 1;
        }
        while self.slot_price(slot + 1) <= price {
            slot += 1;
        }
        slot
    }

    /// Slot whose price is exactly `price`.
    pub fn slot_for_price(&self, price: Decimal) -> Option<i64> {
        let slot = self.floor_slot(price);
        (self.slot_price(slot) == price).then_some(slot)
    }
}

/// Order the ladder wants cancelled.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelIntent {
    pub slot: i64,
    pub order_id: i64,
    pub side: Side,
    pub reason: &'static str,
}

/// Slot the ladder wants covered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacementIntent {
    pub slot: i64,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridPlan {
    pub center: i64,
    pub cancels: Vec<CancelIntent>,
    pub placements: Vec<PlacementIntent>,
}

impl GridPlan {
    pub fn is_empty(&self) -> bool {
        self.cancels.is_empty() && self.placements.is_empty()
    }
}

/// Executed quantity observed on a level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    pub slot: i64,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Level is fully filled
    pub complete: bool,
    pub realized_pnl: Decimal,
}

/// Outcome of reconciling the ladder with the exchange.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub fills: Vec<Fill>,
    pub adopted: usize,
    /// Levels dropped because the exchange has no record of them
    pub dropped: usize,
    pub orphans_to_cancel: Vec<OrderReport>,
    pub flagged: usize,
    /// Levels whose state could not be determined this cycle
    pub unresolved: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaceOutcome {
    Placed(OrderReport),
    /// Outcome unknown; resolved by the next sync
    Deferred,
    Rejected { code: i64 },
    /// Retries exhausted; retried next cycle
    Degraded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    Cancelled { fill: Option<Fill> },
    /// Left for the next sync
    Deferred,
}

pub struct GridManager {
    config: GridConfig,
    symbol: String,
    tick_size: Decimal,
    limits: OrderLimits,
    ladder: Option<Ladder>,
    center: Option<i64>,
    levels: BTreeMap<i64, GridLevel>,
    position: Position,
    /// Total equity in quote as of the current cycle
    equity: Decimal,
    /// Orphans already reported, so each raises one alert
    alerted_orphans: HashSet<i64>,
    /// Drift seen on the previous check, awaiting confirmation
    pending_drift: Option<Decimal>,
    cycle: u64,
    actions: Vec<ActionRecord>,
}

impl GridManager {
    pub fn new(config: GridConfig, market: &MarketConfig) -> Self {
        Self {
            config,
            symbol: market.symbol.clone(),
            tick_size: market.tick_size,
            limits: OrderLimits::from_market(market),
            ladder: None,
            center: None,
            levels: BTreeMap::new(),
            position: Position::default(),
            equity: Decimal::ZERO,
            alerted_orphans: HashSet::new(),
            pending_drift: None,
            cycle: 0,
            actions: Vec::new(),
        }
    }

    /// Fix the ladder geometry. Ignored once a ladder exists.
    pub fn set_ladder(&mut self, anchor: Decimal, step: Decimal) {
        if self.ladder.is_some() || anchor <= Decimal::ZERO || step <= Decimal::ZERO {
            return;
        }
        info!(%anchor, %step, "Grid ladder anchored");
        self.ladder = Some(Ladder {
            anchor,
            step,
            tick_size: self.tick_size,
        });
    }

    /// Ladder, anchoring it on `price` when none exists yet.
    fn anchor_at(&mut self, price: Decimal) -> Ladder {
        if self.ladder.is_none() {
            let anchor = self
                .config
                .anchor_price
                .unwrap_or_else(|| round_to_tick(price, self.tick_size));
            self.set_ladder(anchor, self.config.step_pct);
        }
        self.ladder.unwrap_or(Ladder {
            anchor: price,
            step: self.config.step_pct,
            tick_size: self.tick_size,
        })
    }

    /// Last fill slot clamped to `[f, f + 1]` around the price's floor slot.
    /// A price sitting exactly on slot `f` pins the center to `f`.
    fn effective_center(&self, ladder: &Ladder, price: Decimal) -> i64 {
        let floor = ladder.floor_slot(price);
        if ladder.slot_price(floor) == price {
            return floor;
        }
        self.center.unwrap_or(floor).clamp(floor, floor + 1)
    }

    /// Restore persisted levels and center. Only live levels are kept; the
    /// next sync verifies each against the exchange.
    pub fn restore(&mut self, levels: Vec<GridLevel>, center: Option<i64>) {
        for level in levels.into_iter().filter(|l| l.status.is_live()) {
            self.levels.insert(level.slot, level);
        }
        self.center = center;
        info!(levels = self.levels.len(), ?center, "Restored grid levels");
    }

    /// Adopt reloaded settings. Step and anchor are fixed for the ladder's lifetime.
    pub fn apply_config(&mut self, config: GridConfig) {
        if let Some(ladder) = &self.ladder {
            if !config.volatility_step && config.step_pct != ladder.step {
                warn!(
                    current = %ladder.step,
                    requested = %config.step_pct,
                    "Grid step change requires a restart with a fresh ladder, ignoring"
                );
            }
            if config.anchor_price.is_some_and(|a| a != ladder.anchor) {
                warn!(
                    current = %ladder.anchor,
                    "Grid anchor change requires a restart with a fresh ladder, ignoring"
                );
            }
        }
        self.config = config;
    }

    pub fn begin_cycle(&mut self, cycle: u64) {
        self.cycle = cycle;
    }

    /// Drain actions recorded since the last call.
    pub fn take_actions(&mut self) -> Vec<ActionRecord> {
        std::mem::take(&mut self.actions)
    }

    pub fn record(
        &mut self,
        kind: ActionKind,
        slot: Option<i64>,
        side: Option<Side>,
        price: Option<Decimal>,
        quantity: Option<Decimal>,
        detail: impl Into<String>,
    ) {
        self.actions.push(ActionRecord {
            timestamp: Utc::now(),
            cycle: self.cycle,
            kind,
            slot,
            side,
            price,
            quantity,
            detail: detail.into(),
        });
    }

    pub fn levels(&self) -> impl Iterator<Item = &GridLevel> {
        self.levels.values()
    }

    pub fn level(&self, slot: i64) -> Option<&GridLevel> {
        self.levels.get(&slot)
    }

    pub fn ladder(&self) -> Option<&Ladder> {
        self.ladder.as_ref()
    }

    pub fn center(&self) -> Option<i64> {
        self.center
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn set_position(&mut self, position: Position) {
        self.position = position;
    }

    pub fn mark(&mut self, price: Decimal) {
        self.position.mark(price);
    }

    pub fn limits(&self) -> &OrderLimits {
        &self.limits
    }

    fn live_levels(&self, side: Side) -> impl Iterator<Item = &GridLevel> {
        self.levels
            .values()
            .filter(move |l| l.side == side && l.status.is_live())
    }

    /// Unfilled base quantity of live buys.
    pub fn pending_buy_quantity(&self) -> Decimal {
        self.live_levels(Side::Buy).map(|l| l.remaining()).sum()
    }

    /// Unfilled base quantity of live sells.
    pub fn pending_sell_quantity(&self) -> Decimal {
        self.live_levels(Side::Sell).map(|l| l.remaining()).sum()
    }

    /// Quote committed to live buys.
    pub fn reserved_quote(&self) -> Decimal {
        self.live_levels(Side::Buy)
            .map(|l| l.remaining() * l.price)
            .sum()
    }

    /// Base committed to live sells.
    pub fn reserved_base(&self) -> Decimal {
        self.pending_sell_quantity()
    }

    pub fn set_equity(&mut self, equity: Decimal) {
        self.equity = equity;
    }

    /// Quote notional per level. With `order_notional_ratio` set it is that
    /// share of equity, never below `order_notional`.
    pub fn level_notional(&self) -> Decimal {
        match self.config.order_notional_ratio {
            Some(ratio) if self.equity > Decimal::ZERO => {
                (ratio * self.equity).max(self.config.order_notional)
            }
            _ => self.config.order_notional,
        }
    }

    /// Grid order size at `price`, or `None` below the exchange minimums.
    pub fn order_quantity(&self, price: Decimal) -> Option<Decimal> {
        if price <= Decimal::ZERO {
            return None;
        }
        let quantity = round_down_to_lot(self.level_notional() / price, self.limits.lot_size);
        self.limits.admits(quantity, price).then_some(quantity)
    }

    fn client_order_id(&self, side: Side, slot: i64) -> String {
        let side = match side {
            Side::Buy => 'B',
            Side::Sell => 'S',
        };
        let slot = if slot < 0 {
            format!("m{}", -slot)
        } else {
            slot.to_string()
        };
        format!("{}-{}-{}-{}", self.config.client_id_prefix, side, slot, nonce())
    }

    /// Side and slot encoded in one of our client order ids.
    pub fn parse_client_order_id(&self, client_order_id: &str) -> Option<(Side, i64)> {
        let mut parts = client_order_id.split('-');
        if parts.next()? != self.config.client_id_prefix {
            return None;
        }
        let side = match parts.next()? {
            "B" => Side::Buy,
            "S" => Side::Sell,
            _ => return None,
        };
        let slot = parts.next()?;
        let slot = match slot.strip_prefix('m') {
            Some(abs) => -abs.parse::<i64>().ok()?,
            None => slot.parse::<i64>().ok()?,
        };
        Some((side, slot))
    }

    /// Compute cancellations and placements against the current price.
    pub fn plan(&mut self, snapshot: &PriceSnapshot, cycle: u64) -> GridPlan {
        let ladder = self.anchor_at(snapshot.last);
        let center = self.effective_center(&ladder, snapshot.last);
        if self.center != Some(center) {
            debug!(previous = ?self.center, center, "Grid center moved");
        }
        self.center = Some(center);

        let depth = self.config.levels as i64;
        let reach = depth + self.config.cancel_tolerance as i64;

        let mut cancels = Vec::new();
        for level in self.levels.values() {
            let Some(order_id) = level.order_id else {
                continue;
            };
            if !level.status.is_live() {
                continue;
            }
            let reason = if level.slot < center - reach || level.slot > center + reach {
                "outside ladder depth"
            } else if level.side == Side::Buy && level.slot >= center {
                "buy at or above center"
            } else if level.side == Side::Sell && level.slot <= center {
                "sell at or below center"
            } else {
                continue;
            };
            cancels.push(CancelIntent {
                slot: level.slot,
                order_id,
                side: level.side,
                reason,
            });
        }

        let mut ideal = Vec::with_capacity(2 * depth as usize);
        for i in 1..=depth {
            let buy = center - i;
            let price = ladder.slot_price(buy);
            if price > Decimal::ZERO && price < snapshot.bid {
                ideal.push((buy, Side::Buy, price));
            }
            let sell = center + i;
            let price = ladder.slot_price(sell);
            if price > snapshot.ask {
                ideal.push((sell, Side::Sell, price));
            }
        }

        // Failure markers outside the ideal set no longer block anything
        let wanted: HashSet<i64> = ideal.iter().map(|(slot, _, _)| *slot).collect();
        self.levels
            .retain(|slot, level| level.status.is_live() || wanted.contains(slot));

        let mut placements = Vec::new();
        for (slot, side, price) in ideal {
            if let Some(level) = self.levels.get(&slot) {
                if level.status.is_live() || cycle < level.retry_after_cycle {
                    continue;
                }
            }
            if let Some(quantity) = self.order_quantity(price) {
                placements.push(PlacementIntent {
                    slot,
                    side,
                    price,
                    quantity,
                });
            }
        }

        GridPlan {
            center,
            cancels,
            placements,
        }
    }

    /// Apply an exchange report to the level at `slot`.
    ///
    /// Executed quantity beyond what was already seen is applied to the
    /// position. Final statuses remove the level.
    fn absorb(&mut self, slot: i64, report: &OrderReport) -> Option<Fill> {
        let level = self.levels.get_mut(&slot)?;
        level.order_id = Some(report.order_id);
        level.updated_at = Utc::now();
        let delta = report.executed_qty - level.filled_quantity;
        if delta > Decimal::ZERO {
            level.filled_quantity = report.executed_qty;
        }
        level.status = match report.status {
            OrderStatus::Filled => LevelStatus::Filled,
            OrderStatus::PartiallyFilled => LevelStatus::PartiallyFilled,
            OrderStatus::New | OrderStatus::PendingCancel if level.filled_quantity > Decimal::ZERO => {
                LevelStatus::PartiallyFilled
            }
            OrderStatus::New | OrderStatus::PendingCancel => LevelStatus::Open,
            OrderStatus::Canceled
            | OrderStatus::Rejected
            | OrderStatus::Expired
            | OrderStatus::ExpiredInMatch => LevelStatus::Cancelled,
        };
        let side = level.side;
        let price = level.price;
        let status = level.status;
        if !report.status.is_open() {
            self.levels.remove(&slot);
        }

        if delta <= Decimal::ZERO {
            return None;
        }
        let realized_pnl = self.position.apply_fill(side, delta, price);
        self.pending_drift = None;
        let complete = status == LevelStatus::Filled;
        info!(slot, side = %side, %price, quantity = %delta, complete, "Grid fill");
        self.record(
            ActionKind::Filled,
            Some(slot),
            Some(side),
            Some(price),
            Some(delta),
            if complete { "filled" } else { "partial fill" },
        );
        Some(Fill {
            slot,
            side,
            price,
            quantity: delta,
            complete,
            realized_pnl,
        })
    }

    /// Reconcile the ladder against the exchange's open orders.
    pub async fn sync<G: ExchangeGateway + ?Sized>(
        &mut self,
        gateway: &G,
        retry: &RetryPolicy,
        health: &mut HealthMonitor,
        open_orders: &[OrderReport],
        last_price: Decimal,
    ) -> SyncReport {
        let ladder = self.anchor_at(last_price);
        let mut report = SyncReport::default();

        let by_id: HashMap<i64, &OrderReport> =
            open_orders.iter().map(|o| (o.order_id, o)).collect();
        let by_client: HashMap<&str, &OrderReport> = open_orders
            .iter()
            .map(|o| (o.client_order_id.as_str(), o))
            .collect();
        let mut matched: HashSet<i64> = HashSet::new();

        let tracked: Vec<(i64, Option<i64>, String)> = self
            .levels
            .values()
            .filter(|l| l.status.is_live())
            .map(|l| (l.slot, l.order_id, l.client_order_id.clone()))
            .collect();

        for (slot, order_id, client_order_id) in tracked {
            let listed = order_id
                .and_then(|id| by_id.get(&id))
                .or_else(|| by_client.get(client_order_id.as_str()))
                .copied();

            if let Some(order) = listed {
                matched.insert(order.order_id);
                report.fills.extend(self.absorb(slot, order));
                continue;
            }

            // No longer open, or never placed: ask for the final state
            let symbol = self.symbol.as_str();
            let lookup = retry
                .read("get_order", || gateway.get_order(symbol, &client_order_id))
                .await;
            match lookup {
                Ok(Some(order)) => report.fills.extend(self.absorb(slot, &order)),
                Ok(None) => {
                    if order_id.is_some() {
                        warn!(slot, %client_order_id, "Exchange has no record of grid order, dropping level");
                    } else {
                        info!(slot, %client_order_id, "Unconfirmed placement never reached the exchange, slot freed");
                    }
                    self.levels.remove(&slot);
                    report.dropped += 1;
                }
                Err(e) => {
                    warn!(slot, %client_order_id, error = %e, "Could not resolve grid order, retrying next cycle");
                    health.record_error(&e.to_string());
                    report.unresolved += 1;
                }
            }
        }

        let center = self.effective_center(&ladder, last_price);
        for order in open_orders.iter().filter(|o| !matched.contains(&o.order_id)) {
            if self.try_adopt(&ladder, center, order) {
                report.adopted += 1;
                continue;
            }

            let first_seen = self.alerted_orphans.insert(order.order_id);
            if first_seen {
                health.raise(
                    AlertKind::ReconciliationConflict {
                        order_id: order.order_id,
                        client_order_id: order.client_order_id.clone(),
                    },
                    AlertSeverity::Warning,
                    format!(
                        "Open {} order {} at {} is not part of the ladder",
                        order.side, order.order_id, order.price
                    ),
                    match self.config.orphan_policy {
                        OrphanPolicy::Cancel => "Order will be cancelled",
                        OrphanPolicy::Flag => "Cancel or adopt the order manually",
                    },
                );
            }
            match self.config.orphan_policy {
                OrphanPolicy::Cancel => report.orphans_to_cancel.push(order.clone()),
                OrphanPolicy::Flag => {
                    report.flagged += 1;
                    if first_seen {
                        self.record(
                            ActionKind::OrphanFlagged,
                            None,
                            Some(order.side),
                            Some(order.price),
                            Some(order.remaining()),
                            format!("order {} left in place", order.order_id),
                        );
                    }
                }
            }
        }
        self.alerted_orphans
            .retain(|id| open_orders.iter().any(|o| o.order_id == *id));

        let complete_buys = report
            .fills
            .iter()
            .filter(|f| f.complete && f.side == Side::Buy)
            .map(|f| f.slot)
            .min();
        let complete_sells = report
            .fills
            .iter()
            .filter(|f| f.complete && f.side == Side::Sell)
            .map(|f| f.slot)
            .max();
        match (complete_buys, complete_sells) {
            (Some(slot), None) | (None, Some(slot)) => self.center = Some(slot),
            // Price crossed both sides since the last look
            (Some(_), Some(_)) => self.center = None,
            (None, None) => {}
        }

        if !report.fills.is_empty() || report.adopted > 0 || report.dropped > 0 {
            debug!(
                fills = report.fills.len(),
                adopted = report.adopted,
                dropped = report.dropped,
                orphans = report.orphans_to_cancel.len() + report.flagged,
                "Grid synced"
            );
        }
        report
    }

    /// Take over an unknown open order if it fits a free slot on its side.
    ///
    /// Our own orders (by client id prefix) are always taken back; foreign
    /// ones only when adoption is enabled.
    fn try_adopt(&mut self, ladder: &Ladder, center: i64, order: &OrderReport) -> bool {
        let Some(slot) = ladder.slot_for_price(order.price) else {
            return false;
        };
        let side_fits = match order.side {
            Side::Buy => slot < center,
            Side::Sell => slot > center,
        };
        let slot_free = self.levels.get(&slot).map_or(true, |l| !l.status.is_live());
        let owned = self.parse_client_order_id(&order.client_order_id) == Some((order.side, slot));
        if !side_fits || !slot_free || !(owned || self.config.adopt_orphans) {
            return false;
        }

        let status = if order.executed_qty > Decimal::ZERO {
            LevelStatus::PartiallyFilled
        } else {
            LevelStatus::Open
        };
        self.levels.insert(
            slot,
            GridLevel {
                slot,
                side: order.side,
                price: order.price,
                quantity: order.orig_qty,
                // Balances already reflect earlier fills
                filled_quantity: order.executed_qty,
                status,
                order_id: Some(order.order_id),
                client_order_id: order.client_order_id.clone(),
                attempts: 0,
                retry_after_cycle: 0,
                updated_at: Utc::now(),
            },
        );
        info!(slot, order_id = order.order_id, side = %order.side, price = %order.price, "Adopted open order into ladder");
        self.record(
            ActionKind::Adopted,
            Some(slot),
            Some(order.side),
            Some(order.price),
            Some(order.remaining()),
            format!("order {}", order.order_id),
        );
        true
    }

    /// Submit the order for one slot. `quantity` is the risk-authorized size.
    pub async fn place<G: ExchangeGateway + ?Sized>(
        &mut self,
        gateway: &G,
        retry: &RetryPolicy,
        health: &mut HealthMonitor,
        intent: &PlacementIntent,
        quantity: Decimal,
    ) -> PlaceOutcome {
        let attempts = self.levels.get(&intent.slot).map_or(0, |l| l.attempts);
        let client_order_id = self.client_order_id(intent.side, intent.slot);
        let request = OrderRequest {
            symbol: self.symbol.clone(),
            side: intent.side,
            price: intent.price,
            quantity,
            time_in_force: TimeInForce::Gtc,
            client_order_id: client_order_id.clone(),
        };

        // Recorded before the call so a lost response can be resolved by client id
        self.levels.insert(
            intent.slot,
            GridLevel {
                slot: intent.slot,
                side: intent.side,
                price: intent.price,
                quantity,
                filled_quantity: Decimal::ZERO,
                status: LevelStatus::Pending,
                order_id: None,
                client_order_id: client_order_id.clone(),
                attempts,
                retry_after_cycle: 0,
                updated_at: Utc::now(),
            },
        );

        let result = retry
            .mutate("place_order", || gateway.place_order(&request))
            .await;
        let degraded_key = format!("slot:{}", intent.slot);

        match result {
            Ok(report) => {
                info!(
                    slot = intent.slot,
                    order_id = report.order_id,
                    side = %intent.side,
                    price = %intent.price,
                    quantity = %quantity,
                    "Grid order placed"
                );
                if let Some(level) = self.levels.get_mut(&intent.slot) {
                    level.attempts = 0;
                    level.status = LevelStatus::Open;
                }
                self.record(
                    ActionKind::Placed,
                    Some(intent.slot),
                    Some(intent.side),
                    Some(intent.price),
                    Some(quantity),
                    client_order_id,
                );
                if let Some(fill) = self.absorb(intent.slot, &report) {
                    if fill.complete {
                        self.center = Some(intent.slot);
                    }
                }
                health.clear_degraded(&degraded_key);
                PlaceOutcome::Placed(report)
            }
            Err(e) if e.is_unknown_outcome() || matches!(e, GatewayError::Decode(_)) => {
                warn!(slot = intent.slot, %client_order_id, error = %e, "Placement outcome unknown, deferring to reconciliation");
                health.record_error(&e.to_string());
                self.record(
                    ActionKind::Deferred,
                    Some(intent.slot),
                    Some(intent.side),
                    Some(intent.price),
                    Some(quantity),
                    e.to_string(),
                );
                PlaceOutcome::Deferred
            }
            Err(GatewayError::Rejected { code, message }) => {
                let retry_after = self.cycle + self.config.rejection_cooldown_cycles;
                warn!(slot = intent.slot, code, %message, retry_after, "Grid order rejected by exchange");
                self.mark_degraded(intent.slot, retry_after);
                if health.set_degraded(&degraded_key) {
                    health.raise(
                        AlertKind::OrderRejected {
                            slot: intent.slot,
                            code,
                        },
                        AlertSeverity::Warning,
                        format!("Order for slot {} rejected: {}", intent.slot, message),
                        "Check balances and symbol filters",
                    );
                }
                self.record(
                    ActionKind::ExchangeRejected,
                    Some(intent.slot),
                    Some(intent.side),
                    Some(intent.price),
                    Some(quantity),
                    format!("{}: {}", code, message),
                );
                PlaceOutcome::Rejected { code }
            }
            Err(e) => {
                warn!(slot = intent.slot, error = %e, "Grid order failed after retries, slot degraded");
                health.record_error(&e.to_string());
                let attempts = self.mark_degraded(intent.slot, self.cycle + 1);
                if health.set_degraded(&degraded_key) {
                    health.raise(
                        AlertKind::SlotDegraded {
                            slot: intent.slot,
                            side: intent.side,
                            attempts,
                        },
                        AlertSeverity::Warning,
                        format!("Slot {} could not be placed: {}", intent.slot, e),
                        "Slot is retried next cycle",
                    );
                }
                self.record(
                    ActionKind::Degraded,
                    Some(intent.slot),
                    Some(intent.side),
                    Some(intent.price),
                    Some(quantity),
                    e.to_string(),
                );
                PlaceOutcome::Degraded
            }
        }
    }

    fn mark_degraded(&mut self, slot: i64, retry_after_cycle: u64) -> u32 {
        match self.levels.get_mut(&slot) {
            Some(level) => {
                level.status = LevelStatus::Degraded;
                level.attempts += 1;
                level.retry_after_cycle = retry_after_cycle;
                level.updated_at = Utc::now();
                level.attempts
            }
            None => 0,
        }
    }

    /// Cancel a grid level's order.
    pub async fn cancel<G: ExchangeGateway + ?Sized>(
        &mut self,
        gateway: &G,
        retry: &RetryPolicy,
        health: &mut HealthMonitor,
        intent: &CancelIntent,
    ) -> CancelOutcome {
        let symbol = self.symbol.clone();
        let result = retry
            .mutate("cancel_order", || gateway.cancel_order(&symbol, intent.order_id))
            .await;

        match result {
            Ok(report) => {
                info!(slot = intent.slot, order_id = intent.order_id, reason = intent.reason, "Grid order cancelled");
                let price = self.levels.get(&intent.slot).map(|l| l.price);
                let fill = self.absorb(intent.slot, &report);
                self.levels.remove(&intent.slot);
                self.record(
                    ActionKind::Cancelled,
                    Some(intent.slot),
                    Some(intent.side),
                    price,
                    Some(report.remaining()),
                    intent.reason,
                );
                CancelOutcome::Cancelled { fill }
            }
            Err(GatewayError::UnknownOrder) => {
                debug!(slot = intent.slot, order_id = intent.order_id, "Order already gone, next sync resolves it");
                CancelOutcome::Deferred
            }
            Err(e) => {
                warn!(slot = intent.slot, order_id = intent.order_id, error = %e, "Cancel failed, retrying next cycle");
                health.record_error(&e.to_string());
                CancelOutcome::Deferred
            }
        }
    }

    /// Cancel an order that is not part of the ladder.
    pub async fn cancel_orphan<G: ExchangeGateway + ?Sized>(
        &mut self,
        gateway: &G,
        retry: &RetryPolicy,
        health: &mut HealthMonitor,
        order: &OrderReport,
    ) -> bool {
        let symbol = self.symbol.clone();
        match retry
            .mutate("cancel_order", || gateway.cancel_order(&symbol, order.order_id))
            .await
        {
            Ok(_) | Err(GatewayError::UnknownOrder) => {
                info!(order_id = order.order_id, client_order_id = %order.client_order_id, "Orphan order cancelled");
                self.alerted_orphans.remove(&order.order_id);
                self.record(
                    ActionKind::OrphanCancelled,
                    None,
                    Some(order.side),
                    Some(order.price),
                    Some(order.remaining()),
                    format!("order {}", order.order_id),
                );
                true
            }
            Err(e) => {
                warn!(order_id = order.order_id, error = %e, "Orphan cancel failed, retrying next cycle");
                health.record_error(&e.to_string());
                false
            }
        }
    }

    /// Send an immediate-or-cancel order for a breakout rebalance and apply
    /// whatever executed. Returns the executed quantity.
    pub async fn place_breakout<G: ExchangeGateway + ?Sized>(
        &mut self,
        gateway: &G,
        retry: &RetryPolicy,
        health: &mut HealthMonitor,
        side: Side,
        price: Decimal,
        quantity: Decimal,
    ) -> Decimal {
        let request = OrderRequest {
            symbol: self.symbol.clone(),
            side,
            price,
            quantity,
            time_in_force: TimeInForce::Ioc,
            client_order_id: format!("{}-R-{}", self.config.client_id_prefix, nonce()),
        };

        match retry
            .mutate("place_order", || gateway.place_order(&request))
            .await
        {
            Ok(report) => {
                let executed = report.executed_qty;
                if executed > Decimal::ZERO {
                    self.position.apply_fill(side, executed, price);
                    self.pending_drift = None;
                }
                info!(side = %side, %price, requested = %quantity, %executed, "Breakout rebalance order done");
                self.record(
                    ActionKind::Breakout,
                    None,
                    Some(side),
                    Some(price),
                    Some(executed),
                    format!("requested {}", quantity),
                );
                executed
            }
            Err(e) => {
                // An unknown outcome is corrected by the drift check
                warn!(side = %side, error = %e, "Breakout rebalance order failed");
                health.record_error(&e.to_string());
                Decimal::ZERO
            }
        }
    }

    /// Compare the tracked position with the exchange's base total and
    /// resync when they differ beyond the tolerance. The exchange wins, but
    /// only once the same discrepancy shows on two consecutive checks with
    /// no fill applied in between, so a balance read that raced a fill
    /// cannot be counted twice.
    pub fn check_position_drift(
        &mut self,
        exchange_quantity: Decimal,
        price: Decimal,
        health: &mut HealthMonitor,
    ) -> bool {
        let tolerance = self.config.position_drift_tolerance;
        let tracked = self.position.quantity;
        let drift = exchange_quantity - tracked;
        if drift.abs() <= tolerance {
            self.pending_drift = None;
            return false;
        }
        let confirmed = self
            .pending_drift
            .is_some_and(|previous| (previous - drift).abs() <= tolerance);
        if !confirmed {
            debug!(%tracked, exchange = %exchange_quantity, %drift, "Position drift seen, awaiting confirmation");
            self.pending_drift = Some(drift);
            return false;
        }
        self.pending_drift = None;
        health.raise(
            AlertKind::PositionDrift {
                tracked,
                exchange: exchange_quantity,
            },
            AlertSeverity::Warning,
            format!(
                "Tracked position {} differs from exchange balance {}",
                tracked, exchange_quantity
            ),
            "Position resynced from exchange",
        );
        self.position.resync_quantity(exchange_quantity, price);
        true
    }
}

/// Unique suffix for client order ids: millisecond clock plus a counter.
fn nonce() -> String {
    let seq = NONCE.fetch_add(1, Ordering::Relaxed) % 256;
    format!("{:x}{:02x}", Utc::now().timestamp_millis(), seq)
}
