//! In-memory exchange for paper trading and tests.
//!
//! Resting limit orders lock funds and fill at their limit price once the
//! market trades through them. Failures can be queued per operation to
//! exercise the engine's error handling.

use super::error::{GatewayError, GatewayResult};
use super::traits::ExchangeGateway;
use super::types::*;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Gateway operation, used to target injected failures and count calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    GetPrice,
    GetCandles,
    GetBalance,
    PlaceOrder,
    CancelOrder,
    ListOpenOrders,
    GetOrder,
    Transfer,
}

/// When an injected failure strikes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureMode {
    /// Request never reaches the book
    Before,
    /// Request is applied but the response is lost
    After,
}

/// Mutable simulation state.
#[derive(Debug, Default)]
pub struct PaperState {
    pub price: Option<PriceSnapshot>,
    pub candles: Vec<Candle>,
    pub balances: HashMap<String, AssetBalance>,
    /// Resting orders by exchange id
    pub open: BTreeMap<i64, OrderReport>,
    /// Last known report per client order id, open or final
    pub history: HashMap<String, OrderReport>,
    pub fee_paid: Decimal,
    failures: HashMap<PaperOp, VecDeque<(FailureMode, GatewayError)>>,
    calls: HashMap<PaperOp, u32>,
}

/// Simulated Binance spot account with a flexible earn wallet.
pub struct PaperExchange {
    state: Arc<RwLock<PaperState>>,
    order_id_counter: AtomicI64,
    symbol: String,
    base_asset: String,
    quote_asset: String,
    /// Fee charged in quote on every fill
    fee_rate: Decimal,
}

impl PaperExchange {
    /// Create a paper account holding `quote` and `base` in spot.
    pub fn new(symbol: &str, base_asset: &str, quote_asset: &str, quote: Decimal, base: Decimal) -> Self {
        let mut state = PaperState::default();
        state.balances.insert(
            quote_asset.to_string(),
            AssetBalance { free: quote, ..Default::default() },
        );
        state.balances.insert(
            base_asset.to_string(),
            AssetBalance { free: base, ..Default::default() },
        );

        Self {
            state: Arc::new(RwLock::new(state)),
            order_id_counter: AtomicI64::new(1),
            symbol: symbol.to_string(),
            base_asset: base_asset.to_string(),
            quote_asset: quote_asset.to_string(),
            fee_rate: Decimal::ZERO,
        }
    }

    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    /// Publish a new market price and fill every resting order it crosses.
    pub async fn set_price(&self, snapshot: PriceSnapshot) {
        let mut state = self.state.write().await;
        let crossed: Vec<i64> = state
            .open
            .values()
            .filter(|o| match o.side {
                Side::Buy => snapshot.last <= o.price,
                Side::Sell => snapshot.last >= o.price,
            })
            .map(|o| o.order_id)
            .collect();
        state.price = Some(snapshot);

        for order_id in crossed {
            self.fill_resting(&mut state, order_id, None);
        }
    }

    /// Replace the candle history served by `get_candles`.
    pub async fn set_candles(&self, candles: Vec<Candle>) {
        self.state.write().await.candles = candles;
    }

    /// Overwrite the spot free balance of an asset.
    pub async fn set_free_balance(&self, asset: &str, free: Decimal) {
        self.state
            .write()
            .await
            .balances
            .entry(asset.to_string())
            .or_default()
            .free = free;
    }

    /// Fill `quantity` of a resting order at its limit price.
    pub async fn partial_fill(&self, order_id: i64, quantity: Decimal) {
        let mut state = self.state.write().await;
        self.fill_resting(&mut state, order_id, Some(quantity));
    }

    /// Fail the next call of `op` without side effects.
    pub async fn fail_next(&self, op: PaperOp, error: GatewayError) {
        self.push_failure(op, FailureMode::Before, error).await;
    }

    /// Apply the next call of `op` but report `error` to the caller.
    pub async fn lose_next_response(&self, op: PaperOp, error: GatewayError) {
        self.push_failure(op, FailureMode::After, error).await;
    }

    async fn push_failure(&self, op: PaperOp, mode: FailureMode, error: GatewayError) {
        self.state
            .write()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back((mode, error));
    }

    /// Number of calls made to `op`.
    pub async fn calls(&self, op: PaperOp) -> u32 {
        self.state.read().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// Current balance of one asset.
    pub async fn balance(&self, asset: &str) -> AssetBalance {
        self.state
            .read()
            .await
            .balances
            .get(asset)
            .copied()
            .unwrap_or_default()
    }

    /// Snapshot of resting orders.
    pub async fn open_orders(&self) -> Vec<OrderReport> {
        self.state.read().await.open.values().cloned().collect()
    }

    /// Begin a call: count it and pop any queued failure.
    async fn begin(&self, op: PaperOp) -> GatewayResult<Option<GatewayError>> {
        let mut state = self.state.write().await;
        *state.calls.entry(op).or_default() += 1;
        match state.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some((FailureMode::Before, err)) => Err(err),
            Some((FailureMode::After, err)) => Ok(Some(err)),
            None => Ok(None),
        }
    }

    fn finish<T>(value: T, lost: Option<GatewayError>) -> GatewayResult<T> {
        match lost {
            Some(err) => Err(err),
            None => Ok(value),
        }
    }

    fn next_order_id(&self) -> i64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Move `quantity` (or the full remainder) of a resting order to filled.
    fn fill_resting(&self, state: &mut PaperState, order_id: i64, quantity: Option<Decimal>) {
        let Some(mut order) = state.open.remove(&order_id) else {
            return;
        };
        let qty = quantity.unwrap_or(order.remaining()).min(order.remaining());
        let notional = qty * order.price;
        let fee = notional * self.fee_rate;

        match order.side {
            Side::Buy => {
                let quote = state.balances.entry(self.quote_asset.clone()).or_default();
                quote.locked -= notional;
                quote.free -= fee;
                state.balances.entry(self.base_asset.clone()).or_default().free += qty;
            }
            Side::Sell => {
                state.balances.entry(self.base_asset.clone()).or_default().locked -= qty;
                state.balances.entry(self.quote_asset.clone()).or_default().free += notional - fee;
            }
        }
        state.fee_paid += fee;

        order.executed_qty += qty;
        order.status = if order.remaining().is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };

        info!(
            order_id,
            client_order_id = %order.client_order_id,
            side = %order.side,
            price = %order.price,
            quantity = %qty,
            status = ?order.status,
            "Paper order filled"
        );

        state.history.insert(order.client_order_id.clone(), order.clone());
        if order.status.is_open() {
            state.open.insert(order_id, order);
        }
    }

    fn reject(code: i64, message: &str) -> GatewayError {
        GatewayError::Rejected {
            code,
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn get_price(&self, symbol: &str) -> GatewayResult<PriceSnapshot> {
        let lost = self.begin(PaperOp::GetPrice).await?;
        if symbol != self.symbol {
            return Err(Self::reject(-1121, "Invalid symbol."));
        }
        let price = self
            .state
            .read()
            .await
            .price
            .clone()
            .ok_or_else(|| GatewayError::Transient("no paper price yet".to_string()))?;
        Self::finish(price, lost)
    }

    async fn get_candles(
        &self,
        _symbol: &str,
        _interval: &str,
        limit: usize,
    ) -> GatewayResult<Vec<Candle>> {
        let lost = self.begin(PaperOp::GetCandles).await?;
        let state = self.state.read().await;
        let skip = state.candles.len().saturating_sub(limit);
        Self::finish(state.candles[skip..].to_vec(), lost)
    }

    async fn get_balance(&self) -> GatewayResult<AccountBalances> {
        let lost = self.begin(PaperOp::GetBalance).await?;
        let balances = AccountBalances {
            assets: self.state.read().await.balances.clone(),
        };
        Self::finish(balances, lost)
    }

    async fn place_order(&self, order: &OrderRequest) -> GatewayResult<OrderReport> {
        let lost = self.begin(PaperOp::PlaceOrder).await?;
        if order.symbol != self.symbol {
            return Err(Self::reject(-1121, "Invalid symbol."));
        }
        if order.price <= Decimal::ZERO || order.quantity <= Decimal::ZERO {
            return Err(Self::reject(-1013, "Filter failure: invalid price or quantity"));
        }

        let mut state = self.state.write().await;
        if state
            .open
            .values()
            .any(|o| o.client_order_id == order.client_order_id)
        {
            return Err(Self::reject(-2010, "Duplicate order sent."));
        }

        let marketable = state.price.as_ref().is_some_and(|p| match order.side {
            Side::Buy => p.ask <= order.price,
            Side::Sell => p.bid >= order.price,
        });

        let order_id = self.next_order_id();
        let mut report = OrderReport {
            order_id,
            client_order_id: order.client_order_id.clone(),
            side: order.side,
            price: order.price,
            orig_qty: order.quantity,
            executed_qty: Decimal::ZERO,
            status: OrderStatus::New,
        };

        if order.time_in_force == TimeInForce::Ioc && !marketable {
            report.status = OrderStatus::Expired;
            state.history.insert(report.client_order_id.clone(), report.clone());
            debug!(order_id, "Paper IOC order expired");
            return Self::finish(report, lost);
        }

        // Lock funds
        match order.side {
            Side::Buy => {
                let cost = order.quantity * order.price;
                let quote = state.balances.entry(self.quote_asset.clone()).or_default();
                if quote.free < cost {
                    return Err(Self::reject(
                        -2010,
                        "Account has insufficient balance for requested action.",
                    ));
                }
                quote.free -= cost;
                quote.locked += cost;
            }
            Side::Sell => {
                let base = state.balances.entry(self.base_asset.clone()).or_default();
                if base.free < order.quantity {
                    return Err(Self::reject(
                        -2010,
                        "Account has insufficient balance for requested action.",
                    ));
                }
                base.free -= order.quantity;
                base.locked += order.quantity;
            }
        }

        info!(
            order_id,
            client_order_id = %order.client_order_id,
            side = %order.side,
            price = %order.price,
            quantity = %order.quantity,
            "Paper order placed"
        );

        state.open.insert(order_id, report.clone());
        state.history.insert(report.client_order_id.clone(), report.clone());

        if marketable {
            self.fill_resting(&mut state, order_id, None);
            if let Some(filled) = state.history.get(&order.client_order_id) {
                report = filled.clone();
            }
        }

        Self::finish(report, lost)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: i64) -> GatewayResult<OrderReport> {
        let lost = self.begin(PaperOp::CancelOrder).await?;
        let mut state = self.state.write().await;
        let Some(mut order) = state.open.remove(&order_id) else {
            return Err(GatewayError::UnknownOrder);
        };

        let remaining = order.remaining();
        match order.side {
            Side::Buy => {
                let quote = state.balances.entry(self.quote_asset.clone()).or_default();
                quote.locked -= remaining * order.price;
                quote.free += remaining * order.price;
            }
            Side::Sell => {
                let base = state.balances.entry(self.base_asset.clone()).or_default();
                base.locked -= remaining;
                base.free += remaining;
            }
        }
        order.status = OrderStatus::Canceled;
        state.history.insert(order.client_order_id.clone(), order.clone());

        debug!(order_id, client_order_id = %order.client_order_id, "Paper order cancelled");
        Self::finish(order, lost)
    }

    async fn list_open_orders(&self, _symbol: &str) -> GatewayResult<Vec<OrderReport>> {
        let lost = self.begin(PaperOp::ListOpenOrders).await?;
        let orders = self.state.read().await.open.values().cloned().collect();
        Self::finish(orders, lost)
    }

    async fn get_order(
        &self,
        _symbol: &str,
        client_order_id: &str,
    ) -> GatewayResult<Option<OrderReport>> {
        let lost = self.begin(PaperOp::GetOrder).await?;
        let found = self.state.read().await.history.get(client_order_id).cloned();
        Self::finish(found, lost)
    }

    async fn transfer(
        &self,
        asset: &str,
        amount: Decimal,
        direction: TransferDirection,
    ) -> GatewayResult<()> {
        let lost = self.begin(PaperOp::Transfer).await?;
        if amount <= Decimal::ZERO {
            return Err(Self::reject(-6003, "Amount must be positive"));
        }

        let mut state = self.state.write().await;
        let balance = state.balances.entry(asset.to_string()).or_default();
        match direction {
            TransferDirection::ToYield => {
                if balance.free < amount {
                    return Err(Self::reject(-6004, "Insufficient spot balance"));
                }
                balance.free -= amount;
                balance.earn += amount;
            }
            TransferDirection::ToSpot => {
                if balance.earn < amount {
                    return Err(Self::reject(-6005, "Insufficient earn balance"));
                }
                balance.earn -= amount;
                balance.free += amount;
            }
        }

        info!(asset, %amount, %direction, "Paper transfer");
        Self::finish((), lost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn exchange() -> PaperExchange {
        PaperExchange::new("BNBUSDT", "BNB", "USDT", dec!(1000), dec!(1))
    }

    fn order(side: Side, price: Decimal, qty: Decimal, id: &str) -> OrderRequest {
        OrderRequest {
            symbol: "BNBUSDT".to_string(),
            side,
            price,
            quantity: qty,
            time_in_force: TimeInForce::Gtc,
            client_order_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_resting_buy_locks_then_fills() {
        let ex = exchange();
        ex.set_price(PriceSnapshot::at(dec!(600), Utc::now())).await;

        let report = ex.place_order(&order(Side::Buy, dec!(590), dec!(0.1), "b1")).await.unwrap();
        assert_eq!(report.status, OrderStatus::New);
        assert_eq!(ex.balance("USDT").await.locked, dec!(59.0));

        ex.set_price(PriceSnapshot::at(dec!(589), Utc::now())).await;
        assert!(ex.open_orders().await.is_empty());
        assert_eq!(ex.balance("BNB").await.free, dec!(1.1));
        assert_eq!(ex.balance("USDT").await.spot_total(), dec!(941.0));

        let looked_up = ex.get_order("BNBUSDT", "b1").await.unwrap().unwrap();
        assert_eq!(looked_up.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_cancel_unlocks_remaining() {
        let ex = exchange();
        ex.set_price(PriceSnapshot::at(dec!(600), Utc::now())).await;
        let report = ex.place_order(&order(Side::Sell, dec!(612), dec!(0.5), "s1")).await.unwrap();

        ex.partial_fill(report.order_id, dec!(0.2)).await;
        let cancelled = ex.cancel_order("BNBUSDT", report.order_id).await.unwrap();

        assert_eq!(cancelled.executed_qty, dec!(0.2));
        assert_eq!(cancelled.status, OrderStatus::Canceled);
        assert_eq!(ex.balance("BNB").await.free, dec!(0.8));
        assert_eq!(ex.balance("BNB").await.locked, Decimal::ZERO);
        assert!(matches!(
            ex.cancel_order("BNBUSDT", report.order_id).await,
            Err(GatewayError::UnknownOrder)
        ));
    }

    #[tokio::test]
    async fn test_insufficient_funds_rejected() {
        let ex = exchange();
        let result = ex.place_order(&order(Side::Sell, dec!(700), dec!(5), "s1")).await;
        assert!(matches!(result, Err(GatewayError::Rejected { code: -2010, .. })));
    }

    #[tokio::test]
    async fn test_lost_response_still_places_order() {
        let ex = exchange();
        ex.set_price(PriceSnapshot::at(dec!(600), Utc::now())).await;
        ex.lose_next_response(PaperOp::PlaceOrder, GatewayError::Unknown("timeout".into()))
            .await;

        let result = ex.place_order(&order(Side::Buy, dec!(580), dec!(0.1), "b9")).await;
        assert!(result.unwrap_err().is_unknown_outcome());
        assert_eq!(ex.open_orders().await.len(), 1);
        assert!(ex.get_order("BNBUSDT", "b9").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_transfer_round_trip_between_wallets() {
        let ex = exchange();
        ex.transfer("USDT", dec!(400), TransferDirection::ToYield).await.unwrap();
        assert_eq!(ex.balance("USDT").await.free, dec!(600));
        assert_eq!(ex.balance("USDT").await.earn, dec!(400));

        let err = ex.transfer("USDT", dec!(500), TransferDirection::ToSpot).await;
        assert!(err.is_err());
        assert_eq!(ex.calls(PaperOp::Transfer).await, 2);
    }

    #[tokio::test]
    async fn test_ioc_expires_when_not_marketable() {
        let ex = exchange();
        ex.set_price(PriceSnapshot::at(dec!(600), Utc::now())).await;
        let mut req = order(Side::Buy, dec!(590), dec!(0.1), "ioc1");
        req.time_in_force = TimeInForce::Ioc;

        let report = ex.place_order(&req).await.unwrap();
        assert_eq!(report.status, OrderStatus::Expired);
        assert_eq!(ex.balance("USDT").await.free, dec!(1000));
    }
}
