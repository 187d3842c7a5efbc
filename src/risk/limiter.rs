//! Pre-trade risk limits.
//!
//! `authorize` is a pure function over the proposed order and a fresh
//! context. It can clamp an order's size downward when the clamp policy
//! allows it, but never lets a buy push committed exposure past the
//! effective cap.

use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::config::{ClampPolicy, MarketConfig, RiskConfig};
use crate::exchange::Side;
use crate::utils::{round_down_to_lot, safe_div};

/// Reason an order was not authorized. Always recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
pub enum RiskViolation {
    #[error("position ratio cap exceeded")]
    RatioExceeded,
    #[error("S1-scaled absolute position cap exceeded")]
    AbsoluteCapExceeded,
    #[error("buy would breach the minimum cash buffer")]
    InsufficientBuffer,
    #[error("no S1 history, new buy exposure disabled")]
    InsufficientHistory,
    #[error("order larger than the maximum order size")]
    OrderTooLarge,
    #[error("sell would take the position below its floor")]
    BelowMinPosition,
    #[error("order below exchange minimum quantity or notional")]
    BelowExchangeMinimum,
}

/// Order as proposed by the grid or the breakout rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProposedOrder {
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
}

/// State the decision is made against. Rebuilt before every attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskContext {
    /// Base held across spot and earn
    pub position: Decimal,
    /// Unfilled base quantity of open and pending buys
    pub pending_buys: Decimal,
    /// Unfilled base quantity of open and pending sells
    pub pending_sells: Decimal,
    /// Total equity in quote, valued at `mark_price`
    pub equity: Decimal,
    /// Last traded price the equity was valued at
    pub mark_price: Decimal,
    /// Spot free quote available for new buys
    pub quote_free: Decimal,
    pub s1_scale: Decimal,
    /// `s1_scale` is the configured fallback, not a computed signal
    pub s1_fallback: bool,
}

/// Exchange filters relevant to sizing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderLimits {
    pub lot_size: Decimal,
    pub min_quantity: Decimal,
    pub min_notional: Decimal,
}

impl OrderLimits {
    pub fn from_market(market: &MarketConfig) -> Self {
        Self {
            lot_size: market.lot_size,
            min_quantity: market.min_quantity,
            min_notional: market.min_notional,
        }
    }

    /// Quantity and notional clear the exchange minimums.
    pub fn admits(&self, quantity: Decimal, price: Decimal) -> bool {
        quantity > Decimal::ZERO
            && quantity >= self.min_quantity
            && quantity * price >= self.min_notional
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RiskDecision {
    Authorized(ProposedOrder),
    Rejected(RiskViolation),
}

impl RiskDecision {
    pub fn is_authorized(&self) -> bool {
        matches!(self, RiskDecision::Authorized(_))
    }
}

/// Largest base position the ratio limit admits for a buy at `price`.
///
/// Holds both at the mark and at the order price, with equity revalued to the
/// order price: a buy below market fills when the held base is worth less.
fn ratio_cap(price: Decimal, ctx: &RiskContext, config: &RiskConfig) -> Decimal {
    let mark = if ctx.mark_price > Decimal::ZERO {
        ctx.mark_price
    } else {
        price
    };
    let equity_at_price = ctx.equity - ctx.position * (mark - price);
    let at_price = safe_div(config.max_position_ratio * equity_at_price, price);
    let at_mark = safe_div(config.max_position_ratio * ctx.equity, mark);
    at_price.min(at_mark).max(Decimal::ZERO)
}

/// Authorize, clamp or reject a proposed order.
pub fn authorize(
    order: &ProposedOrder,
    ctx: &RiskContext,
    config: &RiskConfig,
    limits: &OrderLimits,
) -> RiskDecision {
    if order.price <= Decimal::ZERO || order.quantity <= Decimal::ZERO {
        return RiskDecision::Rejected(RiskViolation::BelowExchangeMinimum);
    }
    let partial = config.clamp_policy == ClampPolicy::Partial;

    // Clamped size is only useful if it still clears every minimum
    let usable = |qty: Decimal| {
        qty >= config.clamp_min_quantity && limits.admits(qty, order.price)
    };

    let mut qty = order.quantity;
    if qty > config.max_order_size {
        let clamped = round_down_to_lot(config.max_order_size, limits.lot_size);
        if partial && usable(clamped) {
            qty = clamped;
        } else {
            return RiskDecision::Rejected(RiskViolation::OrderTooLarge);
        }
    }

    match order.side {
        Side::Buy => {
            let abs_cap = config.max_absolute_position * ctx.s1_scale;
            let ratio_cap = ratio_cap(order.price, ctx, config);
            let (cap, binding) = if ratio_cap < abs_cap {
                (ratio_cap, RiskViolation::RatioExceeded)
            } else if ctx.s1_fallback {
                (abs_cap, RiskViolation::InsufficientHistory)
            } else {
                (abs_cap, RiskViolation::AbsoluteCapExceeded)
            };

            let committed = ctx.position + ctx.pending_buys;
            if committed + qty > cap {
                let headroom = round_down_to_lot((cap - committed).max(Decimal::ZERO), limits.lot_size);
                if partial && usable(headroom) {
                    qty = headroom;
                } else {
                    return RiskDecision::Rejected(binding);
                }
            }

            if ctx.quote_free - qty * order.price < config.min_cash_buffer {
                return RiskDecision::Rejected(RiskViolation::InsufficientBuffer);
            }
        }
        Side::Sell => {
            let floor = safe_div(config.min_position_ratio * ctx.equity, order.price);
            let available = ctx.position - ctx.pending_sells;
            if available - qty < floor {
                let headroom = round_down_to_lot((available - floor).max(Decimal::ZERO), limits.lot_size);
                if partial && usable(headroom) {
                    qty = headroom;
                } else {
                    return RiskDecision::Rejected(RiskViolation::BelowMinPosition);
                }
            }
        }
    }

    if !limits.admits(qty, order.price) {
        return RiskDecision::Rejected(RiskViolation::BelowExchangeMinimum);
    }

    RiskDecision::Authorized(ProposedOrder {
        quantity: qty,
        ..*order
    })
}

/// Holds the active risk configuration and exchange filters.
#[derive(Debug, Clone)]
pub struct RiskLimiter {
    config: RiskConfig,
    limits: OrderLimits,
}

impl RiskLimiter {
    pub fn new(config: RiskConfig, limits: OrderLimits) -> Self {
        Self { config, limits }
    }

    pub fn authorize(&self, order: &ProposedOrder, ctx: &RiskContext) -> RiskDecision {
        authorize(order, ctx, &self.config, &self.limits)
    }

    /// Quote that must stay idle in spot; used by the fund allocator.
    pub fn idle_floor(&self) -> Decimal {
        self.config.min_cash_buffer
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn limits(&self) -> &OrderLimits {
        &self.limits
    }

    /// Swap in a reloaded configuration as a whole.
    pub fn replace_config(&mut self, config: RiskConfig) {
        self.config = config;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn limits() -> OrderLimits {
        OrderLimits {
            lot_size: dec!(0.001),
            min_quantity: dec!(0.001),
            min_notional: dec!(10),
        }
    }

    fn config(policy: ClampPolicy) -> RiskConfig {
        RiskConfig {
            clamp_policy: policy,
            ..RiskConfig::default()
        }
    }

    fn ctx() -> RiskContext {
        RiskContext {
            position: dec!(1),
            pending_buys: Decimal::ZERO,
            pending_sells: Decimal::ZERO,
            equity: dec!(2000),
            mark_price: dec!(600),
            quote_free: dec!(1400),
            s1_scale: Decimal::ONE,
            s1_fallback: false,
        }
    }

    fn buy(price: Decimal, quantity: Decimal) -> ProposedOrder {
        ProposedOrder { side: Side::Buy, price, quantity }
    }

    fn sell(price: Decimal, quantity: Decimal) -> ProposedOrder {
        ProposedOrder { side: Side::Sell, price, quantity }
    }

    #[test]
    fn test_buy_within_limits_is_authorized_unchanged() {
        let order = buy(dec!(600), dec!(0.05));
        let decision = authorize(&order, &ctx(), &config(ClampPolicy::Reject), &limits());
        assert_eq!(decision, RiskDecision::Authorized(order));
    }

    #[test]
    fn test_fallback_scale_blocks_buys_with_insufficient_history() {
        let mut context = ctx();
        context.s1_scale = Decimal::ZERO;
        context.s1_fallback = true;

        let decision = authorize(&buy(dec!(600), dec!(0.05)), &context, &config(ClampPolicy::Partial), &limits());
        assert_eq!(decision, RiskDecision::Rejected(RiskViolation::InsufficientHistory));
    }

    #[test]
    fn test_ratio_cap_rejects_or_clamps() {
        // ratio cap = 0.9 * 2000 / 600 = 3 BNB; committed 2.9
        let mut context = ctx();
        context.pending_buys = dec!(1.9);
        let order = buy(dec!(600), dec!(0.5));

        let rejected = authorize(&order, &context, &config(ClampPolicy::Reject), &limits());
        assert_eq!(rejected, RiskDecision::Rejected(RiskViolation::RatioExceeded));

        match authorize(&order, &context, &config(ClampPolicy::Partial), &limits()) {
            RiskDecision::Authorized(o) => assert_eq!(o.quantity, dec!(0.1)),
            other => panic!("expected clamp, got {:?}", other),
        }
    }

    #[test]
    fn test_absolute_cap_scaled_by_s1() {
        let mut context = ctx();
        context.equity = dec!(1000000);
        context.quote_free = dec!(1000000);
        context.s1_scale = dec!(0.05); // 20 * 0.05 = 1 BNB, already held

        let decision = authorize(&buy(dec!(600), dec!(0.05)), &context, &config(ClampPolicy::Partial), &limits());
        assert_eq!(decision, RiskDecision::Rejected(RiskViolation::AbsoluteCapExceeded));
    }

    #[test]
    fn test_cash_buffer_enforced() {
        let mut context = ctx();
        context.quote_free = dec!(35);
        let decision = authorize(&buy(dec!(600), dec!(0.05)), &context, &config(ClampPolicy::Partial), &limits());
        assert_eq!(decision, RiskDecision::Rejected(RiskViolation::InsufficientBuffer));
    }

    #[test]
    fn test_order_size_cap() {
        let mut context = ctx();
        context.equity = dec!(100000);
        context.quote_free = dec!(100000);
        let order = buy(dec!(600), dec!(2.5));

        let rejected = authorize(&order, &context, &config(ClampPolicy::Reject), &limits());
        assert_eq!(rejected, RiskDecision::Rejected(RiskViolation::OrderTooLarge));

        match authorize(&order, &context, &config(ClampPolicy::Partial), &limits()) {
            RiskDecision::Authorized(o) => assert_eq!(o.quantity, dec!(1)),
            other => panic!("expected clamp, got {:?}", other),
        }
    }

    #[test]
    fn test_sells_ignore_caps_but_keep_min_position() {
        let mut context = ctx();
        context.position = dec!(10); // far above every buy cap
        context.equity = dec!(6600);
        let decision = authorize(&sell(dec!(612), dec!(0.5)), &context, &config(ClampPolicy::Reject), &limits());
        assert!(decision.is_authorized());

        // floor = 0.1 * 2000 / 600 = 0.333..
        let mut context = ctx();
        context.position = dec!(0.4);
        let decision = authorize(&sell(dec!(600), dec!(0.1)), &context, &config(ClampPolicy::Reject), &limits());
        assert_eq!(decision, RiskDecision::Rejected(RiskViolation::BelowMinPosition));
    }

    #[test]
    fn test_dust_orders_rejected() {
        let decision = authorize(&buy(dec!(600), dec!(0.01)), &ctx(), &config(ClampPolicy::Reject), &limits());
        assert_eq!(decision, RiskDecision::Rejected(RiskViolation::BelowExchangeMinimum));
    }

    #[test]
    fn test_buy_below_market_respects_ratio_at_fill_price() {
        // 3 BNB + 200 USDT at 600: ratio already 0.9
        let context = RiskContext {
            position: dec!(3),
            pending_buys: Decimal::ZERO,
            pending_sells: Decimal::ZERO,
            equity: dec!(2000),
            mark_price: dec!(600),
            quote_free: dec!(200),
            s1_scale: Decimal::ONE,
            s1_fallback: false,
        };
        let decision = authorize(&buy(dec!(570), dec!(0.15)), &context, &config(ClampPolicy::Reject), &limits());
        assert_eq!(decision, RiskDecision::Rejected(RiskViolation::RatioExceeded));
    }

    #[test]
    fn test_authorized_buy_never_exceeds_ratio_cap() {
        let cfg = config(ClampPolicy::Partial);
        let tolerance = dec!(0.000001);
        let quote = dec!(2500);
        let prices = [dec!(300), dec!(570), dec!(600), dec!(900)];
        let marks = [dec!(300), dec!(600), dec!(900)];
        let positions = [dec!(0), dec!(0.5), dec!(2), dec!(3.5)];
        let pendings = [dec!(0), dec!(0.3), dec!(1.2)];
        let scales = [dec!(0), dec!(0.25), dec!(1)];
        let quantities = [dec!(0.02), dec!(0.4), dec!(1.5)];

        for &price in &prices {
            for &mark in &marks {
                for &position in &positions {
                    for &pending in &pendings {
                        for &scale in &scales {
                            for &qty in &quantities {
                                let context = RiskContext {
                                    position,
                                    pending_buys: pending,
                                    pending_sells: Decimal::ZERO,
                                    equity: quote + position * mark,
                                    mark_price: mark,
                                    quote_free: quote,
                                    s1_scale: scale,
                                    s1_fallback: false,
                                };
                                if let RiskDecision::Authorized(o) =
                                    authorize(&buy(price, qty), &context, &cfg, &limits())
                                {
                                    let after = position + pending + o.quantity;
                                    // Ratio once filled, valued at the fill price
                                    let equity_at_fill = quote + position * price;
                                    assert!(after * price <= cfg.max_position_ratio * equity_at_fill + tolerance);
                                    // And valued at the current mark
                                    assert!(after * mark <= cfg.max_position_ratio * context.equity + tolerance);
                                    assert!(after <= cfg.max_absolute_position * scale);
                                    assert!(o.quantity <= qty);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}
