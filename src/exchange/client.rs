//! Binance REST client (spot + USDⓈ-M futures).

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use tracing::{debug, instrument};

use crate::config::ExchangeConfig;
use crate::error::ExchangeError;
use crate::exchange::traits::ExchangeClient;
use crate::exchange::types::*;

const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
const FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";
const SPOT_BASE_URL: &str = "https://api.binance.com";
const SPOT_TESTNET_URL: &str = "https://testnet.binance.vision";

const QUOTE_ASSET: &str = "USDT";

/// Binance error codes that indicate an unusable API key or signature.
const AUTH_ERROR_CODES: [i64; 3] = [-1022, -2014, -2015];
/// Timestamp outside recvWindow: clock skew, retry with a fresh timestamp.
const RECV_WINDOW_CODE: i64 = -1021;
/// Unknown order on cancel: it already reached a terminal state.
const UNKNOWN_ORDER_CODE: i64 = -2011;
/// Order lookup found nothing under the given id.
const ORDER_NOT_FOUND_CODE: i64 = -2013;

/// Binance API client for both spot and futures markets.
pub struct BinanceClient {
    http: Client,
    api_key: String,
    secret_key: String,
    futures_base_url: String,
    spot_base_url: String,
}

impl BinanceClient {
    /// Create a new Binance client from configuration.
    pub fn new(config: &ExchangeConfig) -> anyhow::Result<Self> {
        let (futures_base_url, spot_base_url) = if config.testnet {
            (FUTURES_TESTNET_URL, SPOT_TESTNET_URL)
        } else {
            (FUTURES_BASE_URL, SPOT_BASE_URL)
        };
        Self::with_base_urls(config, futures_base_url, spot_base_url)
    }

    /// Create a client against explicit endpoints.
    pub fn with_base_urls(
        config: &ExchangeConfig,
        futures_base_url: &str,
        spot_base_url: &str,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            futures_base_url: futures_base_url.trim_end_matches('/').to_string(),
            spot_base_url: spot_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Get current timestamp in milliseconds.
    fn timestamp() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn base_url(&self, market: Market) -> &str {
        match market {
            Market::Spot => &self.spot_base_url,
            Market::Perp => &self.futures_base_url,
        }
    }

    fn order_path(market: Market) -> &'static str {
        match market {
            Market::Spot => "/api/v3/order",
            Market::Perp => "/fapi/v1/order",
        }
    }

    /// Build a signed URL: params, timestamp, then signature over both.
    fn signed_url(&self, base: &str, path: &str, params: &[(&str, String)]) -> String {
        let mut pairs: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect();
        pairs.push(format!("timestamp={}", Self::timestamp()));

        let query_string = pairs.join("&");
        let signature = self.sign(&query_string);
        format!("{}{}?{}&signature={}", base, path, query_string, signature)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("X-MBX-APIKEY", &self.api_key)
    }

    /// Send a request and decode the body, classifying failures.
    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<T, ExchangeError> {
        let response = request
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("{what}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|e| {
                ExchangeError::Transient(format!("{what}: failed to parse response: {e}"))
            });
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_error(status, &body, what))
    }
}

/// Map an HTTP failure onto the engine's error classes.
pub fn classify_error(status: StatusCode, body: &str, what: &str) -> ExchangeError {
    let parsed = serde_json::from_str::<BinanceErrorBody>(body).ok();
    let code = parsed.as_ref().map(|e| e.code);
    let detail = match &parsed {
        Some(e) => format!("{what}: {} (code {})", e.msg, e.code),
        None => format!("{what}: HTTP {status}: {body}"),
    };

    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::IM_A_TEAPOT
        || status.is_server_error()
        || code == Some(RECV_WINDOW_CODE)
    {
        ExchangeError::Transient(detail)
    } else if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || code.is_some_and(|c| AUTH_ERROR_CODES.contains(&c))
    {
        ExchangeError::Auth(detail)
    } else {
        ExchangeError::Rejected(detail)
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    #[instrument(skip(self), fields(pair = %pair.symbol))]
    async fn get_funding_rate(&self, pair: &TradingPair) -> Result<FundingSnapshot, ExchangeError> {
        let premium_url = format!(
            "{}/fapi/v1/premiumIndex?symbol={}",
            self.futures_base_url, pair.perp_instrument
        );
        let premium = self.send::<PremiumIndex>(self.http.get(&premium_url), "premium index");
        let spot = self.get_spot_price(pair);

        let (premium, spot_price) = tokio::try_join!(premium, spot)?;

        Ok(FundingSnapshot {
            pair: pair.symbol.clone(),
            funding_rate: premium.funding_rate,
            next_funding_time: from_millis(premium.next_funding_time),
            mark_price: premium.mark_price,
            spot_price,
            observed_at: from_millis(premium.time),
        })
    }

    #[instrument(skip(self), fields(pair = %pair.symbol))]
    async fn get_spot_price(&self, pair: &TradingPair) -> Result<Decimal, ExchangeError> {
        let url = format!(
            "{}/api/v3/ticker/price?symbol={}",
            self.spot_base_url, pair.spot_instrument
        );
        let ticker: TickerPrice = self.send(self.http.get(&url), "spot price").await?;
        Ok(ticker.price)
    }

    #[instrument(skip(self))]
    async fn get_account_balance(&self) -> Result<AccountBalance, ExchangeError> {
        let futures_url = self.signed_url(&self.futures_base_url, "/fapi/v2/balance", &[]);
        let spot_url = self.signed_url(&self.spot_base_url, "/api/v3/account", &[]);

        let futures = self.send::<Vec<FuturesBalance>>(
            self.authed(self.http.get(&futures_url)),
            "futures balance",
        );
        let spot = self.send::<SpotAccount>(self.authed(self.http.get(&spot_url)), "spot account");
        let (futures, spot) = tokio::try_join!(futures, spot)?;

        let futures_available = futures
            .iter()
            .find(|b| b.asset == QUOTE_ASSET)
            .map(|b| b.available_balance)
            .unwrap_or_default();
        let spot_free = spot
            .balances
            .iter()
            .find(|b| b.asset == QUOTE_ASSET)
            .map(|b| b.free)
            .unwrap_or_default();

        Ok(AccountBalance {
            spot_free,
            futures_available,
        })
    }

    #[instrument(skip(self))]
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderHandle, ExchangeError> {
        let mut params = vec![
            ("symbol", request.instrument.clone()),
            ("side", request.side.as_str().to_string()),
            ("type", request.order_type.as_str().to_string()),
            ("quantity", request.quantity.normalize().to_string()),
        ];
        if request.reduce_only && request.market == Market::Perp {
            params.push(("reduceOnly", "true".to_string()));
        }
        if let Some(client_id) = &request.client_order_id {
            params.push(("newClientOrderId", client_id.clone()));
        }

        let url = self.signed_url(
            self.base_url(request.market),
            Self::order_path(request.market),
            &params,
        );

        debug!(?request, "Placing order");

        let order: BinanceOrder = self
            .send(self.authed(self.http.post(&url)), "place order")
            .await?;

        Ok(OrderHandle {
            market: request.market,
            instrument: request.instrument.clone(),
            order_id: order.order_id.to_string(),
        })
    }

    #[instrument(skip(self))]
    async fn get_order_status(&self, handle: &OrderHandle) -> Result<OrderUpdate, ExchangeError> {
        let url = self.signed_url(
            self.base_url(handle.market),
            Self::order_path(handle.market),
            &[
                ("symbol", handle.instrument.clone()),
                ("orderId", handle.order_id.clone()),
            ],
        );

        let order: BinanceOrder = self
            .send(self.authed(self.http.get(&url)), "order status")
            .await?;

        Ok(OrderUpdate {
            status: order.status.into(),
            filled_qty: order.executed_qty,
            avg_price: order.average_price(),
            fee: None,
        })
    }

    #[instrument(skip(self))]
    async fn get_order_by_client_id(
        &self,
        market: Market,
        instrument: &str,
        client_order_id: &str,
    ) -> Result<Option<OrderHandle>, ExchangeError> {
        let url = self.signed_url(
            self.base_url(market),
            Self::order_path(market),
            &[
                ("symbol", instrument.to_string()),
                ("origClientOrderId", client_order_id.to_string()),
            ],
        );

        let response = self
            .authed(self.http.get(&url))
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("order lookup: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let order: BinanceOrder = response.json().await.map_err(|e| {
                ExchangeError::Transient(format!("order lookup: failed to parse response: {e}"))
            })?;
            return Ok(Some(OrderHandle {
                market,
                instrument: instrument.to_string(),
                order_id: order.order_id.to_string(),
            }));
        }

        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<BinanceErrorBody>(&body) {
            Ok(err) if err.code == ORDER_NOT_FOUND_CODE => Ok(None),
            _ => Err(classify_error(status, &body, "order lookup")),
        }
    }

    #[instrument(skip(self))]
    async fn cancel_order(&self, handle: &OrderHandle) -> Result<(), ExchangeError> {
        let url = self.signed_url(
            self.base_url(handle.market),
            Self::order_path(handle.market),
            &[
                ("symbol", handle.instrument.clone()),
                ("orderId", handle.order_id.clone()),
            ],
        );

        let response = self
            .authed(self.http.delete(&url))
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("cancel order: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<BinanceErrorBody>(&body) {
            Ok(err) if err.code == UNKNOWN_ORDER_CODE => {
                debug!(order_id = %handle.order_id, "Cancel on terminal order ignored");
                Ok(())
            }
            _ => Err(classify_error(status, &body, "cancel order")),
        }
    }

    #[instrument(skip(self), fields(pair = %pair.symbol))]
    async fn set_leverage(&self, pair: &TradingPair, leverage: u8) -> Result<(), ExchangeError> {
        let url = self.signed_url(
            &self.futures_base_url,
            "/fapi/v1/leverage",
            &[
                ("symbol", pair.perp_instrument.clone()),
                ("leverage", leverage.to_string()),
            ],
        );

        self.send::<serde_json::Value>(self.authed(self.http.post(&url)), "set leverage")
            .await?;
        Ok(())
    }

    fn venue(&self) -> &'static str {
        "binance"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit_is_transient() {
        let err = classify_error(StatusCode::TOO_MANY_REQUESTS, "", "place order");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_auth_codes() {
        let body = r#"{"code":-2015,"msg":"Invalid API-key, IP, or permissions for action."}"#;
        let err = classify_error(StatusCode::BAD_REQUEST, body, "place order");
        assert!(matches!(err, ExchangeError::Auth(_)));
    }

    #[test]
    fn test_classify_rejection() {
        let body = r#"{"code":-2010,"msg":"Account has insufficient balance for requested action."}"#;
        let err = classify_error(StatusCode::BAD_REQUEST, body, "place order");
        assert!(matches!(err, ExchangeError::Rejected(_)));
    }

    #[test]
    fn test_classify_clock_skew_is_transient() {
        let body = r#"{"code":-1021,"msg":"Timestamp for this request is outside of the recvWindow."}"#;
        let err = classify_error(StatusCode::BAD_REQUEST, body, "order status");
        assert!(err.is_retryable());
    }
}
