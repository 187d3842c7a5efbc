//! Exchange gateway abstraction.
//!
//! The strategy engine talks to the exchange only through this trait, so the
//! Binance client, the paper exchange and test doubles are interchangeable.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;

use super::error::GatewayResult;
use super::types::{
    AccountBalances, Candle, OrderReport, OrderRequest, PriceSnapshot, TransferDirection,
};

/// Async request/response interface to a spot exchange with a yield account.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Current top of book and last price.
    async fn get_price(&self, symbol: &str) -> GatewayResult<PriceSnapshot>;

    /// Most recent `limit` candles, oldest first. May include the forming candle.
    async fn get_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> GatewayResult<Vec<Candle>>;

    /// Spot free/locked plus flexible earn balances for every asset.
    async fn get_balance(&self) -> GatewayResult<AccountBalances>;

    /// Submit a limit order.
    async fn place_order(&self, order: &OrderRequest) -> GatewayResult<OrderReport>;

    /// Cancel an open order, returning its final state.
    async fn cancel_order(&self, symbol: &str, order_id: i64) -> GatewayResult<OrderReport>;

    /// All open orders on `symbol`.
    async fn list_open_orders(&self, symbol: &str) -> GatewayResult<Vec<OrderReport>>;

    /// Look an order up by client order id; `None` when the exchange never saw it.
    async fn get_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> GatewayResult<Option<OrderReport>>;

    /// Move funds between spot and the yield account.
    async fn transfer(
        &self,
        asset: &str,
        amount: Decimal,
        direction: TransferDirection,
    ) -> GatewayResult<()>;
}

#[async_trait]
impl<T: ExchangeGateway + ?Sized> ExchangeGateway for Arc<T> {
    async fn get_price(&self, symbol: &str) -> GatewayResult<PriceSnapshot> {
        (**self).get_price(symbol).await
    }

    async fn get_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> GatewayResult<Vec<Candle>> {
        (**self).get_candles(symbol, interval, limit).await
    }

    async fn get_balance(&self) -> GatewayResult<AccountBalances> {
        (**self).get_balance().await
    }

    async fn place_order(&self, order: &OrderRequest) -> GatewayResult<OrderReport> {
        (**self).place_order(order).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> GatewayResult<OrderReport> {
        (**self).cancel_order(symbol, order_id).await
    }

    async fn list_open_orders(&self, symbol: &str) -> GatewayResult<Vec<OrderReport>> {
        (**self).list_open_orders(symbol).await
    }

    async fn get_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> GatewayResult<Option<OrderReport>> {
        (**self).get_order(symbol, client_order_id).await
    }

    async fn transfer(
        &self,
        asset: &str,
        amount: Decimal,
        direction: TransferDirection,
    ) -> GatewayResult<()> {
        (**self).transfer(asset, amount, direction).await
    }
}
