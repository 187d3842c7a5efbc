//! Binance spot REST client with Simple Earn support.

use crate::config::BinanceConfig;
use crate::exchange::error::{GatewayError, GatewayResult};
use crate::exchange::traits::ExchangeGateway;
use crate::exchange::types::*;
use crate::utils::{transfer_precision, truncate_dp};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

const SPOT_BASE_URL: &str = "https://api.binance.com";
const SPOT_TESTNET_URL: &str = "https://testnet.binance.vision";
const RECV_WINDOW_MS: u64 = 5_000;

/// Binance spot client. Simple Earn endpoints are unavailable on testnet, so
/// they are disabled there and earn balances read as zero.
pub struct BinanceSpotClient {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
    earn_enabled: bool,
    /// Flexible product id per asset
    earn_products: RwLock<HashMap<String, String>>,
}

impl BinanceSpotClient {
    /// Create a new client from configuration.
    pub fn new(config: &BinanceConfig) -> Result<Self> {
        let base_url = if config.testnet {
            SPOT_TESTNET_URL
        } else {
            SPOT_BASE_URL
        };
        Self::with_base_url(config, base_url)
    }

    /// Create a client against an explicit base URL.
    pub fn with_base_url(config: &BinanceConfig, base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            earn_enabled: !config.testnet,
            earn_products: RwLock::new(HashMap::new()),
        })
    }

    /// Whether signed endpoints can be used.
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.secret_key.is_empty()
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn encode(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn public<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> GatewayResult<T> {
        let url = format!("{}{}?{}", self.base_url, path, Self::encode(params));
        let response = self.http.get(&url).send().await?;
        Self::handle_response(response).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> GatewayResult<T> {
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        let query_string = Self::encode(&params);
        let signature = self.sign(&query_string);
        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url, path, query_string, signature
        );

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Decode a success body or classify the Binance error payload.
    async fn handle_response<T: DeserializeOwned>(response: Response) -> GatewayResult<T> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(match serde_json::from_str::<BinanceErrorBody>(&body) {
                Ok(err) => GatewayError::from_binance(status.as_u16(), err.code, &err.msg),
                Err(_) => GatewayError::from_binance(status.as_u16(), 0, &body),
            });
        }

        serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()))
    }

    // ==================== Exchange Info ====================

    /// Trading filters for `symbol`, falling back to `defaults` for missing ones.
    #[instrument(skip(self, defaults))]
    pub async fn get_symbol_filters(
        &self,
        symbol: &str,
        defaults: SymbolFilters,
    ) -> GatewayResult<SymbolFilters> {
        let info: SpotExchangeInfo = self
            .public("/api/v3/exchangeInfo", &[("symbol", symbol.to_string())])
            .await?;

        info.symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .map(|s| s.filters(defaults))
            .ok_or_else(|| GatewayError::Decode(format!("symbol {} not in exchangeInfo", symbol)))
    }

    // ==================== Simple Earn ====================

    async fn earn_positions(&self) -> GatewayResult<Vec<EarnPosition>> {
        if !self.earn_enabled {
            return Ok(Vec::new());
        }
        let page: EarnPage<EarnPosition> = self
            .signed(
                Method::GET,
                "/sapi/v1/simple-earn/flexible/position",
                vec![("size", "100".to_string())],
            )
            .await?;
        Ok(page.rows)
    }

    async fn earn_product_id(&self, asset: &str) -> GatewayResult<String> {
        if let Some(id) = self.earn_products.read().await.get(asset) {
            return Ok(id.clone());
        }

        let page: EarnPage<EarnProduct> = self
            .signed(
                Method::GET,
                "/sapi/v1/simple-earn/flexible/list",
                vec![("asset", asset.to_string())],
            )
            .await?;

        let product = page
            .rows
            .into_iter()
            .find(|p| p.asset == asset)
            .ok_or_else(|| GatewayError::Rejected {
                code: 0,
                message: format!("no flexible earn product for {}", asset),
            })?;

        debug!(asset, product_id = %product.product_id, status = %product.status, "Resolved earn product");
        self.earn_products
            .write()
            .await
            .insert(asset.to_string(), product.product_id.clone());
        Ok(product.product_id)
    }
}

#[async_trait]
impl ExchangeGateway for BinanceSpotClient {
    #[instrument(skip(self))]
    async fn get_price(&self, symbol: &str) -> GatewayResult<PriceSnapshot> {
        let params = [("symbol", symbol.to_string())];
        let (book, last): (BookTicker, TickerPrice) = tokio::try_join!(
            self.public("/api/v3/ticker/bookTicker", &params),
            self.public("/api/v3/ticker/price", &params),
        )?;

        Ok(PriceSnapshot {
            timestamp: Utc::now(),
            last: last.price,
            bid: book.bid_price,
            ask: book.ask_price,
        })
    }

    #[instrument(skip(self))]
    async fn get_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> GatewayResult<Vec<Candle>> {
        let rows: Vec<Vec<serde_json::Value>> = self
            .public(
                "/api/v3/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        rows.iter().map(|row| parse_kline(row)).collect()
    }

    #[instrument(skip(self))]
    async fn get_balance(&self) -> GatewayResult<AccountBalances> {
        let (account, earn): (SpotAccount, Vec<EarnPosition>) = tokio::try_join!(
            self.signed(Method::GET, "/api/v3/account", vec![("omitZeroBalances", "true".to_string())]),
            self.earn_positions(),
        )?;

        let mut balances = AccountBalances::default();
        for b in account.balances {
            let entry = balances.assets.entry(b.asset).or_default();
            entry.free = b.free;
            entry.locked = b.locked;
        }
        for position in earn {
            let entry = balances.assets.entry(position.asset.clone()).or_default();
            entry.earn += position.total_amount;
            self.earn_products
                .write()
                .await
                .entry(position.asset)
                .or_insert(position.product_id);
        }
        Ok(balances)
    }

    #[instrument(skip(self), fields(client_order_id = %order.client_order_id))]
    async fn place_order(&self, order: &OrderRequest) -> GatewayResult<OrderReport> {
        let time_in_force = match order.time_in_force {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
        };
        let params = vec![
            ("symbol", order.symbol.clone()),
            ("side", order.side.as_str().to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", time_in_force.to_string()),
            ("quantity", order.quantity.normalize().to_string()),
            ("price", order.price.normalize().to_string()),
            ("newClientOrderId", order.client_order_id.clone()),
            ("newOrderRespType", "RESULT".to_string()),
        ];

        debug!("Placing spot order: {:?}", order);

        let response: SpotOrder = self.signed(Method::POST, "/api/v3/order", params).await?;
        Ok(response.into())
    }

    #[instrument(skip(self))]
    async fn cancel_order(&self, symbol: &str, order_id: i64) -> GatewayResult<OrderReport> {
        let response: SpotOrder = self
            .signed(
                Method::DELETE,
                "/api/v3/order",
                vec![("symbol", symbol.to_string()), ("orderId", order_id.to_string())],
            )
            .await?;
        Ok(response.into())
    }

    #[instrument(skip(self))]
    async fn list_open_orders(&self, symbol: &str) -> GatewayResult<Vec<OrderReport>> {
        let orders: Vec<SpotOrder> = self
            .signed(
                Method::GET,
                "/api/v3/openOrders",
                vec![("symbol", symbol.to_string())],
            )
            .await?;
        Ok(orders.into_iter().map(OrderReport::from).collect())
    }

    #[instrument(skip(self))]
    async fn get_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> GatewayResult<Option<OrderReport>> {
        let result: GatewayResult<SpotOrder> = self
            .signed(
                Method::GET,
                "/api/v3/order",
                vec![
                    ("symbol", symbol.to_string()),
                    ("origClientOrderId", client_order_id.to_string()),
                ],
            )
            .await;

        match result {
            Ok(order) => Ok(Some(order.into())),
            Err(GatewayError::UnknownOrder) => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn transfer(
        &self,
        asset: &str,
        amount: Decimal,
        direction: TransferDirection,
    ) -> GatewayResult<()> {
        if !self.earn_enabled {
            return Err(GatewayError::Rejected {
                code: 0,
                message: "Simple Earn is not available on testnet".to_string(),
            });
        }

        let amount = truncate_dp(amount, transfer_precision(asset));
        let product_id = self.earn_product_id(asset).await?;

        let (path, mut params) = match direction {
            TransferDirection::ToYield => (
                "/sapi/v1/simple-earn/flexible/subscribe",
                vec![("productId", product_id)],
            ),
            TransferDirection::ToSpot => (
                "/sapi/v1/simple-earn/flexible/redeem",
                vec![("productId", product_id), ("redeemType", "FAST".to_string())],
            ),
        };
        params.push(("amount", amount.normalize().to_string()));

        let _: serde_json::Value = self.signed(Method::POST, path, params).await?;
        info!(asset, %amount, %direction, "Earn transfer submitted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn testnet_config() -> BinanceConfig {
        BinanceConfig {
            api_key: "test-key".to_string(),
            secret_key: "test-secret".to_string(),
            testnet: true,
        }
    }

    #[test]
    fn test_signature_matches_documented_example() {
        let config = BinanceConfig {
            api_key: String::new(),
            secret_key: "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j"
                .to_string(),
            testnet: false,
        };
        let client = BinanceSpotClient::new(&config).unwrap();
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            client.sign(query),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[tokio::test]
    async fn test_get_price_combines_book_and_last() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/ticker/bookTicker"))
            .and(query_param("symbol", "BNBUSDT"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"symbol":"BNBUSDT","bidPrice":"599.90","bidQty":"3.1","askPrice":"600.10","askQty":"2.0"}"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v3/ticker/price"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"symbol":"BNBUSDT","price":"600.00"}"#),
            )
            .mount(&server)
            .await;

        let client = BinanceSpotClient::with_base_url(&testnet_config(), &server.uri()).unwrap();
        let snapshot = client.get_price("BNBUSDT").await.unwrap();
        assert_eq!(snapshot.last, dec!(600.00));
        assert_eq!(snapshot.bid, dec!(599.90));
        assert_eq!(snapshot.ask, dec!(600.10));
    }

    #[tokio::test]
    async fn test_signed_request_carries_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/account"))
            .and(header("X-MBX-APIKEY", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"balances":[{"asset":"BNB","free":"1.5","locked":"0.5"},{"asset":"USDT","free":"300","locked":"0"}]}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client = BinanceSpotClient::with_base_url(&testnet_config(), &server.uri()).unwrap();
        let balances = client.get_balance().await.unwrap();
        assert_eq!(balances.get("BNB").spot_total(), dec!(2.0));
        assert_eq!(balances.get("USDT").free, dec!(300));
        assert_eq!(balances.get("USDT").earn, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/openOrders"))
            .respond_with(
                ResponseTemplate::new(429)
                    .set_body_string(r#"{"code":-1003,"msg":"Too many requests."}"#),
            )
            .mount(&server)
            .await;

        let client = BinanceSpotClient::with_base_url(&testnet_config(), &server.uri()).unwrap();
        let err = client.list_open_orders("BNBUSDT").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_insufficient_balance_is_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/order"))
            .and(query_param("newClientOrderId", "bgb-B-1-abc"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                r#"{"code":-2010,"msg":"Account has insufficient balance for requested action."}"#,
            ))
            .mount(&server)
            .await;

        let client = BinanceSpotClient::with_base_url(&testnet_config(), &server.uri()).unwrap();
        let order = OrderRequest {
            symbol: "BNBUSDT".to_string(),
            side: Side::Buy,
            price: dec!(588.00),
            quantity: dec!(0.034),
            time_in_force: TimeInForce::Gtc,
            client_order_id: "bgb-B-1-abc".to_string(),
        };
        let err = client.place_order(&order).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { code: -2010, .. }));
    }

    #[tokio::test]
    async fn test_get_order_missing_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/order"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"code":-2013,"msg":"Order does not exist."}"#),
            )
            .mount(&server)
            .await;

        let client = BinanceSpotClient::with_base_url(&testnet_config(), &server.uri()).unwrap();
        let found = client.get_order("BNBUSDT", "bgb-S-2-abc").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_transfer_disabled_on_testnet() {
        let client = BinanceSpotClient::new(&testnet_config()).unwrap();
        let err = client
            .transfer("USDT", dec!(100), TransferDirection::ToYield)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { .. }));
    }
}
