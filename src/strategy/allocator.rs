//! Fund Allocator: moves idle capital between spot and Simple Earn.
//!
//! Spot keeps what the ladder has committed plus a floor and the next
//! expected order. Anything clearly above that is subscribed to flexible
//! earn; a spot shortfall is redeemed back with some padding.

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{AllocatorConfig, MarketConfig};
use crate::exchange::{AccountBalances, ExchangeGateway, RetryPolicy, TransferDirection};
use crate::risk::{AlertKind, AlertSeverity, HealthMonitor};
use crate::utils::{round_up_dp, transfer_precision, truncate_dp};

/// Spot and earn view of one managed asset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetAllocation {
    pub asset: String,
    pub spot_free: Decimal,
    pub spot_locked: Decimal,
    pub yield_balance: Decimal,
    /// Committed to live grid orders
    pub reserved: Decimal,
    pub floor: Decimal,
    pub next_order: Decimal,
}

impl AssetAllocation {
    /// Free balance spot should hold: floor plus the next expected order.
    pub fn keep(&self) -> Decimal {
        self.floor + self.next_order
    }

    pub fn spot_total(&self) -> Decimal {
        self.spot_free + self.spot_locked
    }
}

/// Thresholds applied to one asset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferPolicy {
    pub excess_threshold: Decimal,
    pub min_transfer: Decimal,
    pub redeem_padding: Decimal,
    pub precision: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferDecision {
    pub asset: String,
    pub amount: Decimal,
    pub direction: TransferDirection,
}

/// Ladder-side figures the allocator needs each run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AllocationInputs {
    /// Idle quote floor from the risk limiter
    pub idle_floor: Decimal,
    pub reserved_quote: Decimal,
    pub reserved_base: Decimal,
    pub next_buy_notional: Decimal,
    pub next_sell_quantity: Decimal,
}

/// Decide at most one transfer for an asset.
pub fn decide(state: &AssetAllocation, policy: &TransferPolicy) -> Option<TransferDecision> {
    let keep = state.keep();

    let excess = (state.spot_total() - state.reserved - keep).min(state.spot_free - keep);
    if excess > policy.excess_threshold {
        let amount = truncate_dp(excess, policy.precision);
        if amount < policy.min_transfer {
            debug!(asset = %state.asset, %amount, "Excess below minimum transfer");
            return None;
        }
        return Some(TransferDecision {
            asset: state.asset.clone(),
            amount,
            direction: TransferDirection::ToYield,
        });
    }

    if state.spot_free < keep && state.yield_balance > Decimal::ZERO {
        let shortfall = (keep - state.spot_free) * (Decimal::ONE + policy.redeem_padding);
        let amount = truncate_dp(
            round_up_dp(shortfall, policy.precision)
                .max(policy.min_transfer)
                .min(state.yield_balance),
            policy.precision,
        );
        if amount > Decimal::ZERO {
            return Some(TransferDecision {
                asset: state.asset.clone(),
                amount,
                direction: TransferDirection::ToSpot,
            });
        }
    }

    None
}

pub struct FundAllocator {
    config: AllocatorConfig,
    base_asset: String,
    quote_asset: String,
}

impl FundAllocator {
    pub fn new(config: AllocatorConfig, market: &MarketConfig) -> Self {
        Self {
            config,
            base_asset: market.base_asset.clone(),
            quote_asset: market.quote_asset.clone(),
        }
    }

    pub fn apply_config(&mut self, config: AllocatorConfig) {
        self.config = config;
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Allocator runs on this cycle.
    pub fn is_due(&self, cycle: u64) -> bool {
        self.config.enabled && cycle % self.config.every_n_cycles.max(1) == 0
    }

    /// Per-asset state: quote always, base when managed.
    pub fn assess(&self, balances: &AccountBalances, inputs: &AllocationInputs) -> Vec<AssetAllocation> {
        let quote = balances.get(&self.quote_asset);
        let mut out = vec![AssetAllocation {
            asset: self.quote_asset.clone(),
            spot_free: quote.free,
            spot_locked: quote.locked,
            yield_balance: quote.earn,
            reserved: inputs.reserved_quote,
            floor: self.config.quote_buffer.max(inputs.idle_floor),
            next_order: inputs.next_buy_notional,
        }];

        if self.config.manage_base {
            let base = balances.get(&self.base_asset);
            out.push(AssetAllocation {
                asset: self.base_asset.clone(),
                spot_free: base.free,
                spot_locked: base.locked,
                yield_balance: base.earn,
                reserved: inputs.reserved_base,
                floor: self.config.base_buffer,
                next_order: inputs.next_sell_quantity,
            });
        }
        out
    }

    fn policy_for(&self, asset: &str) -> TransferPolicy {
        let (excess_threshold, min_transfer) = if asset == self.quote_asset {
            (self.config.quote_excess_threshold, self.config.min_transfer_quote)
        } else {
            (self.config.base_excess_threshold, self.config.min_transfer_base)
        };
        TransferPolicy {
            excess_threshold,
            min_transfer,
            redeem_padding: self.config.redeem_padding,
            precision: transfer_precision(asset),
        }
    }

    pub fn plan(&self, allocations: &[AssetAllocation]) -> Vec<TransferDecision> {
        allocations
            .iter()
            .filter_map(|a| decide(a, &self.policy_for(&a.asset)))
            .collect()
    }

    /// Execute one transfer. Exhausted retries raise a `TransferFailed`
    /// alert once until a transfer of that asset succeeds again.
    pub async fn execute<G: ExchangeGateway + ?Sized>(
        &self,
        gateway: &G,
        retry: &RetryPolicy,
        health: &mut HealthMonitor,
        decision: &TransferDecision,
    ) -> bool {
        let key = format!("transfer:{}", decision.asset);
        let result = retry
            .mutate("transfer", || {
                gateway.transfer(&decision.asset, decision.amount, decision.direction)
            })
            .await;

        match result {
            Ok(()) => {
                info!(
                    asset = %decision.asset,
                    amount = %decision.amount,
                    direction = %decision.direction,
                    "Funds transferred"
                );
                health.clear_degraded(&key);
                true
            }
            Err(e) => {
                warn!(asset = %decision.asset, amount = %decision.amount, error = %e, "Transfer failed");
                health.record_error(&e.to_string());
                if health.set_degraded(&key) {
                    health.raise(
                        AlertKind::TransferFailed {
                            asset: decision.asset.clone(),
                            amount: decision.amount,
                        },
                        AlertSeverity::Error,
                        format!(
                            "Transfer of {} {} ({}) failed: {}",
                            decision.amount, decision.asset, decision.direction, e
                        ),
                        "Check Simple Earn availability; grid keeps trading",
                    );
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{AssetBalance, GatewayError, MockExchangeGateway};
    use crate::test_support::test_config;
    use rust_decimal_macros::dec;

    fn quote_state(free: Decimal, locked: Decimal, earn: Decimal, reserved: Decimal) -> AssetAllocation {
        AssetAllocation {
            asset: "USDT".to_string(),
            spot_free: free,
            spot_locked: locked,
            yield_balance: earn,
            reserved,
            floor: dec!(50),
            next_order: dec!(20),
        }
    }

    fn quote_policy() -> TransferPolicy {
        TransferPolicy {
            excess_threshold: dec!(10),
            min_transfer: dec!(1),
            redeem_padding: dec!(0.05),
            precision: 2,
        }
    }

    #[test]
    fn test_excess_goes_to_yield() {
        // 500 free, 100 locked for buys, keep 70 -> excess 430
        let state = quote_state(dec!(500), dec!(100), Decimal::ZERO, dec!(100));
        let decision = decide(&state, &quote_policy()).unwrap();
        assert_eq!(decision.direction, TransferDirection::ToYield);
        assert_eq!(decision.amount, dec!(430));
    }

    #[test]
    fn test_excess_below_threshold_is_left_alone() {
        let state = quote_state(dec!(75), Decimal::ZERO, dec!(1000), Decimal::ZERO);
        assert!(decide(&state, &quote_policy()).is_none());
    }

    #[test]
    fn test_pending_reservations_limit_subscription() {
        // Pending buys not yet locked still count against spot
        let state = quote_state(dec!(500), Decimal::ZERO, Decimal::ZERO, dec!(300));
        let decision = decide(&state, &quote_policy()).unwrap();
        assert_eq!(decision.amount, dec!(130));
    }

    #[test]
    fn test_shortfall_redeemed_with_padding() {
        let state = quote_state(dec!(30), Decimal::ZERO, dec!(1000), Decimal::ZERO);
        let decision = decide(&state, &quote_policy()).unwrap();
        assert_eq!(decision.direction, TransferDirection::ToSpot);
        // (70 - 30) * 1.05
        assert_eq!(decision.amount, dec!(42));
    }

    #[test]
    fn test_redeem_capped_by_yield_and_raised_to_minimum() {
        let state = quote_state(dec!(30), Decimal::ZERO, dec!(12.5), Decimal::ZERO);
        assert_eq!(decide(&state, &quote_policy()).unwrap().amount, dec!(12.5));

        let state = quote_state(dec!(69.9), Decimal::ZERO, dec!(1000), Decimal::ZERO);
        assert_eq!(decide(&state, &quote_policy()).unwrap().amount, dec!(1));
    }

    #[test]
    fn test_subscription_never_drops_spot_below_reserved() {
        let frees = [dec!(0), dec!(40), dec!(120), dec!(800)];
        let lockeds = [dec!(0), dec!(60), dec!(500)];
        let reserveds = [dec!(0), dec!(100), dec!(650)];
        for &free in &frees {
            for &locked in &lockeds {
                for &reserved in &reserveds {
                    let state = quote_state(free, locked, dec!(200), reserved);
                    if let Some(d) = decide(&state, &quote_policy()) {
                        if d.direction == TransferDirection::ToYield {
                            assert!(free + locked - d.amount >= reserved + state.keep());
                            assert!(free - d.amount >= state.keep());
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_assess_uses_risk_floor_and_base_management() {
        let config = test_config();
        let allocator = FundAllocator::new(config.allocator.clone(), &config.market);
        let mut balances = AccountBalances::default();
        balances.assets.insert(
            "USDT".into(),
            AssetBalance { free: dec!(900), locked: dec!(100), earn: Decimal::ZERO },
        );
        balances.assets.insert(
            "BNB".into(),
            AssetBalance { free: dec!(2), locked: dec!(0.1), earn: Decimal::ZERO },
        );
        let inputs = AllocationInputs {
            idle_floor: dec!(80),
            reserved_quote: dec!(100),
            reserved_base: dec!(0.1),
            next_buy_notional: dec!(20),
            next_sell_quantity: dec!(0.033),
        };

        let states = allocator.assess(&balances, &inputs);
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].floor, dec!(80));
        let decisions = allocator.plan(&states);
        assert_eq!(decisions[0].amount, dec!(800));
        // 2.1 - 0.1 - (0.05 + 0.033)
        assert_eq!(decisions[1].asset, "BNB");
        assert_eq!(decisions[1].amount, dec!(1.917));
    }

    #[test]
    fn test_cadence() {
        let config = test_config();
        let mut allocator_config = config.allocator.clone();
        allocator_config.every_n_cycles = 3;
        let mut allocator = FundAllocator::new(allocator_config.clone(), &config.market);
        assert!(!allocator.is_due(1));
        assert!(allocator.is_due(3));

        allocator_config.enabled = false;
        allocator.apply_config(allocator_config);
        assert!(!allocator.is_due(3));
    }

    #[tokio::test]
    async fn test_failed_transfer_alerts_once() {
        let config = test_config();
        let allocator = FundAllocator::new(config.allocator.clone(), &config.market);
        let retry = RetryPolicy::from_config(&config.engine);
        let mut health = HealthMonitor::new(100, 5);

        let mut mock = MockExchangeGateway::new();
        mock.expect_transfer()
            .times(6)
            .returning(|_, _, _| Err(GatewayError::Transient("earn busy".into())));
        let decision = TransferDecision {
            asset: "USDT".into(),
            amount: dec!(100),
            direction: TransferDirection::ToYield,
        };

        assert!(!allocator.execute(&mock, &retry, &mut health, &decision).await);
        assert!(!allocator.execute(&mock, &retry, &mut health, &decision).await);
        let failures = health
            .alerts()
            .filter(|a| matches!(a.kind, AlertKind::TransferFailed { .. }))
            .count();
        assert_eq!(failures, 1);
        assert!(health.is_degraded("transfer:USDT"));
    }
}
