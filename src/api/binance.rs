use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::{Exchange, ExchangeError};
use crate::config::ExchangeConfig;
use crate::models::{
    Candle, ExchangePosition, Fill, OrderIntent, OrderStatus, OrderType, Side, SymbolFilters,
};

type HmacSha256 = Hmac<Sha256>;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Decimal places used when rendering quantities and prices on the wire
const WIRE_DECIMALS: u32 = 8;

#[derive(Clone)]
struct Credentials {
    api_key: String,
    api_secret: String,
}

/// Binance USDⓈ-M futures REST client
///
/// Cloneable; all clones share one rate limiter.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    recv_window_ms: u64,
    rate_limiter: Arc<BinanceRateLimiter>,
}

/// Error body returned by Binance on failure
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceEntry {
    asset: String,
    balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    client_order_id: String,
    status: OrderStatus,
    executed_qty: String,
    #[serde(default)]
    avg_price: Option<String>,
    #[serde(default)]
    update_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    quantity_precision: u32,
    price_precision: u32,
    #[serde(default)]
    filters: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: String,
    entry_price: String,
}

impl BinanceFuturesClient {
    pub fn new(config: &ExchangeConfig) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ExchangeError::Network(format!("failed to build HTTP client: {}", e)))?;

        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        let credentials = match (&config.api_key, &config.api_secret) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                Some(Credentials {
                    api_key: key.clone(),
                    api_secret: secret.clone(),
                })
            }
            _ => None,
        };

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials,
            recv_window_ms: config.recv_window_ms,
            rate_limiter,
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Unauthenticated GET
    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        self.rate_limiter.until_ready().await;

        let mut url = format!("{}{}", self.base_url, path);
        if !params.is_empty() {
            url.push('?');
            url.push_str(&encode_params(params));
        }

        let response = self.client.get(&url).send().await?;
        parse_response(response).await
    }

    /// Authenticated request; parameters go in the query string with
    /// `timestamp`, `recvWindow` and `signature` appended
    async fn signed_request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<T, ExchangeError> {
        let credentials = self.credentials.as_ref().ok_or_else(|| ExchangeError::Rejected {
            code: -2014,
            message: "API key and secret are required for signed endpoints".to_string(),
        })?;

        self.rate_limiter.until_ready().await;

        params.push(("recvWindow", self.recv_window_ms.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        let query = encode_params(&params);
        let signature = sign(&credentials.api_secret, &query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &credentials.api_key)
            .send()
            .await?;
        parse_response(response).await
    }
}

/// HMAC-SHA256 of the query string, hex encoded
pub fn sign(secret: &str, payload: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::InvalidResponse(format!("invalid HMAC key: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn encode_params(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

async fn parse_response<T: DeserializeOwned>(response: Response) -> Result<T, ExchangeError> {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await?;

    if status.is_success() {
        return serde_json::from_str(&body).map_err(|e| {
            ExchangeError::InvalidResponse(format!("{} (body: {})", e, truncate(&body, 200)))
        });
    }

    let (code, message) = match serde_json::from_str::<ApiErrorBody>(&body) {
        Ok(err) => (err.code, err.msg),
        Err(_) => (0, truncate(&body, 200).to_string()),
    };

    let mut err = ExchangeError::classify(status.as_u16(), code, &message);
    if let ExchangeError::RateLimited {
        retry_after: ref mut after,
        ..
    } = err
    {
        *after = retry_after;
    }
    Err(err)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn parse_f64(value: &str, field: &str) -> Result<f64, ExchangeError> {
    value
        .parse::<f64>()
        .map_err(|_| ExchangeError::InvalidResponse(format!("{} is not a number: {:?}", field, value)))
}

/// Render a quantity or price without float noise (0.104, not 0.10400000000000001)
pub fn format_decimal(value: f64) -> Result<String, ExchangeError> {
    let decimal = Decimal::from_f64(value)
        .ok_or_else(|| ExchangeError::InvalidResponse(format!("cannot encode {}", value)))?;
    Ok(decimal
        .round_dp_with_strategy(WIRE_DECIMALS, RoundingStrategy::ToZero)
        .normalize()
        .to_string())
}

/// Number of decimals implied by a step size such as "0.00100000"
fn precision_from_step(step: &str) -> Option<u32> {
    let step: Decimal = step.parse().ok()?;
    if step <= Decimal::ZERO {
        return None;
    }
    Some(step.normalize().scale())
}

/// Parse one kline row: `[openTime, open, high, low, close, volume, closeTime, ...]`
fn parse_kline(row: &[serde_json::Value]) -> Result<Candle, ExchangeError> {
    if row.len() < 6 {
        return Err(ExchangeError::InvalidResponse(format!(
            "kline row has {} fields",
            row.len()
        )));
    }

    let open_time_ms = row[0]
        .as_i64()
        .ok_or_else(|| ExchangeError::InvalidResponse("kline open time".to_string()))?;
    let open_time = DateTime::from_timestamp_millis(open_time_ms)
        .ok_or_else(|| ExchangeError::InvalidResponse(format!("bad timestamp {}", open_time_ms)))?;

    let field = |idx: usize, name: &str| -> Result<f64, ExchangeError> {
        match &row[idx] {
            serde_json::Value::String(s) => parse_f64(s, name),
            serde_json::Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| ExchangeError::InvalidResponse(name.to_string())),
            _ => Err(ExchangeError::InvalidResponse(format!("kline {}", name))),
        }
    };

    Ok(Candle {
        open_time,
        open: field(1, "open")?,
        high: field(2, "high")?,
        low: field(3, "low")?,
        close: field(4, "close")?,
        volume: field(5, "volume")?,
    })
}

fn filters_from_symbol(info: &SymbolInfo) -> SymbolFilters {
    let mut filters = SymbolFilters {
        quantity_precision: info.quantity_precision,
        price_precision: info.price_precision,
        ..SymbolFilters::default()
    };

    for filter in &info.filters {
        let text = |key: &str| filter.get(key).and_then(|v| v.as_str());
        match text("filterType") {
            Some("LOT_SIZE") => {
                if let Some(min_qty) = text("minQty").and_then(|v| v.parse().ok()) {
                    filters.min_qty = min_qty;
                }
                if let Some(precision) = text("stepSize").and_then(precision_from_step) {
                    filters.quantity_precision = filters.quantity_precision.min(precision);
                }
            }
            Some("PRICE_FILTER") => {
                if let Some(precision) = text("tickSize").and_then(precision_from_step) {
                    filters.price_precision = filters.price_precision.min(precision);
                }
            }
            Some("MIN_NOTIONAL") => {
                if let Some(notional) = text("notional").and_then(|v| v.parse().ok()) {
                    filters.min_notional = notional;
                }
            }
            _ => {}
        }
    }

    filters
}

#[async_trait]
impl Exchange for BinanceFuturesClient {
    async fn get_recent_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let rows: Vec<Vec<serde_json::Value>> = self
            .public_get(
                "/fapi/v1/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let candles = rows
            .iter()
            .map(|row| parse_kline(row))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(symbol = %symbol, count = candles.len(), "Fetched klines");
        Ok(candles)
    }

    async fn get_latest_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let ticker: TickerPrice = self
            .public_get("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        parse_f64(&ticker.price, "price")
    }

    async fn get_account_equity(&self, asset: &str) -> Result<f64, ExchangeError> {
        let balances: Vec<BalanceEntry> = self
            .signed_request(Method::GET, "/fapi/v2/balance", Vec::new())
            .await?;

        let entry = balances
            .iter()
            .find(|b| b.asset.eq_ignore_ascii_case(asset))
            .ok_or_else(|| {
                ExchangeError::InvalidResponse(format!("no {} balance in account", asset))
            })?;
        parse_f64(&entry.balance, "balance")
    }

    async fn place_order(&self, symbol: &str, intent: &OrderIntent) -> Result<Fill, ExchangeError> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", intent.side.as_str().to_string()),
            ("type", intent.order_type.as_str().to_string()),
            ("quantity", format_decimal(intent.quantity)?),
            ("newClientOrderId", intent.client_order_id.clone()),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        if intent.order_type == OrderType::Limit {
            params.push(("timeInForce", "GTC".to_string()));
        }
        if let Some(price) = intent.price {
            params.push(("price", format_decimal(price)?));
        }
        if let Some(stop_price) = intent.stop_price {
            params.push(("stopPrice", format_decimal(stop_price)?));
            params.push(("workingType", "MARK_PRICE".to_string()));
        }
        if intent.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let response: OrderResponse = self
            .signed_request(Method::POST, "/fapi/v1/order", params)
            .await?;

        let executed_qty = parse_f64(&response.executed_qty, "executedQty")?;
        let avg_price = match response.avg_price.as_deref() {
            Some(p) => parse_f64(p, "avgPrice")?,
            None => 0.0,
        };
        let timestamp = response
            .update_time
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        Ok(Fill {
            order_id: response.order_id.to_string(),
            client_order_id: response.client_order_id,
            status: response.status,
            executed_qty,
            avg_price,
            timestamp,
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self
            .signed_request(
                Method::POST,
                "/fapi/v1/leverage",
                vec![
                    ("symbol", symbol.to_string()),
                    ("leverage", leverage.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        let info: ExchangeInfo = self.public_get("/fapi/v1/exchangeInfo", &[]).await?;

        info.symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .map(filters_from_symbol)
            .ok_or_else(|| ExchangeError::InvalidResponse(format!("unknown symbol {}", symbol)))
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<ExchangePosition>, ExchangeError> {
        let positions: Vec<PositionRisk> = self
            .signed_request(
                Method::GET,
                "/fapi/v2/positionRisk",
                vec![("symbol", symbol.to_string())],
            )
            .await?;

        // One-way mode reports a single signed amount per symbol
        for position in positions.iter().filter(|p| p.symbol == symbol) {
            let amount = parse_f64(&position.position_amt, "positionAmt")?;
            if amount == 0.0 {
                continue;
            }
            let side = if amount > 0.0 { Side::Long } else { Side::Short };
            return Ok(Some(ExchangePosition {
                side,
                quantity: amount.abs(),
                entry_price: parse_f64(&position.entry_price, "entryPrice")?,
            }));
        }
        Ok(None)
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self
            .signed_request(
                Method::DELETE,
                "/fapi/v1/allOpenOrders",
                vec![("symbol", symbol.to_string())],
            )
            .await?;
        Ok(())
    }
}
