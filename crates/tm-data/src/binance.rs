use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use tm_types::{Candle, FetchError, Interval, Ticker24h, Trade};

const DEFAULT_BASE_URL: &str = "https://api.binance.com/api/v3";

/// Largest page the klines endpoint will return.
pub const MAX_PAGE_LIMIT: u16 = 1000;

/// Read-only market data source. The ingestion loop depends on this trait so
/// tests can script responses without a network.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Fetch at most `limit` candles with `open_time >= start_time`, ascending
    /// by open time. An empty result means no data exists at or after
    /// `start_time` (e.g. requesting the future) and is not an error.
    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &Interval,
        start_time: Option<DateTime<Utc>>,
        limit: u16,
    ) -> Result<Vec<Candle>, FetchError>;

    /// Most recent trades for a symbol. Out-of-band utility; not part of the
    /// ingestion state machine.
    async fn fetch_recent_trades(&self, symbol: &str, limit: u16)
        -> Result<Vec<Trade>, FetchError>;

    /// 24-hour rolling statistics. Out-of-band utility as well.
    async fn fetch_24h_ticker(&self, symbol: &str) -> Result<Ticker24h, FetchError>;
}

/// HTTP client for the Binance public REST API.
#[derive(Debug, Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
}

impl BinanceClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Point the client at a different host (test servers, mirrors).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn get_json(&self, url: &str) -> Result<Value, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Http {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        response.json().await.map_err(|e| FetchError::MalformedPayload {
            message: e.to_string(),
        })
    }
}

impl Default for BinanceClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataSource for BinanceClient {
    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &Interval,
        start_time: Option<DateTime<Utc>>,
        limit: u16,
    ) -> Result<Vec<Candle>, FetchError> {
        let limit = limit.min(MAX_PAGE_LIMIT);
        let mut url = format!(
            "{}/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol.to_uppercase(),
            interval,
            limit
        );
        if let Some(start) = start_time {
            url.push_str(&format!("&startTime={}", start.timestamp_millis()));
        }

        let json = self.get_json(&url).await?;
        let candles = parse_kline_array(symbol, interval, &json)?;

        tracing::debug!(
            symbol = %symbol,
            interval = %interval,
            count = candles.len(),
            "fetched klines"
        );
        Ok(candles)
    }

    async fn fetch_recent_trades(
        &self,
        symbol: &str,
        limit: u16,
    ) -> Result<Vec<Trade>, FetchError> {
        let url = format!(
            "{}/trades?symbol={}&limit={}",
            self.base_url,
            symbol.to_uppercase(),
            limit.min(MAX_PAGE_LIMIT)
        );
        let json = self.get_json(&url).await?;
        serde_json::from_value(json).map_err(|e| FetchError::MalformedPayload {
            message: format!("trades: {e}"),
        })
    }

    async fn fetch_24h_ticker(&self, symbol: &str) -> Result<Ticker24h, FetchError> {
        let url = format!(
            "{}/ticker/24hr?symbol={}",
            self.base_url,
            symbol.to_uppercase()
        );
        let json = self.get_json(&url).await?;
        serde_json::from_value(json).map_err(|e| FetchError::MalformedPayload {
            message: format!("24h ticker: {e}"),
        })
    }
}

/// Parse the positional kline wire format:
/// `[openTime(ms), open, high, low, close, volume, closeTime(ms),
///   quoteVolume, tradeCount, takerBuyBase, takerBuyQuote, ignore]`,
/// numeric fields arriving as strings or numbers.
pub fn parse_kline_array(
    symbol: &str,
    interval: &Interval,
    json: &Value,
) -> Result<Vec<Candle>, FetchError> {
    let rows = json.as_array().ok_or_else(|| FetchError::MalformedPayload {
        message: "expected a JSON array of klines".to_string(),
    })?;

    let symbol = symbol.to_uppercase();
    let mut candles = Vec::with_capacity(rows.len());

    for (i, row) in rows.iter().enumerate() {
        let fields = row.as_array().ok_or_else(|| FetchError::MalformedPayload {
            message: format!("kline row {i} is not an array"),
        })?;
        if fields.len() < 9 {
            return Err(FetchError::MalformedPayload {
                message: format!("kline row {i} has {} fields, expected 12", fields.len()),
            });
        }

        let open_ms = fields[0].as_i64().ok_or_else(|| FetchError::MalformedPayload {
            message: format!("kline row {i}: open time is not an integer"),
        })?;
        let open_time =
            DateTime::from_timestamp_millis(open_ms).ok_or_else(|| FetchError::MalformedPayload {
                message: format!("kline row {i}: open time {open_ms} out of range"),
            })?;

        let trade_count = fields[8].as_u64().ok_or_else(|| FetchError::MalformedPayload {
            message: format!("kline row {i}: trade count is not an integer"),
        })?;

        candles.push(Candle {
            symbol: symbol.clone(),
            interval: interval.clone(),
            open_time,
            open: field_decimal(&fields[1], i, "open")?,
            high: field_decimal(&fields[2], i, "high")?,
            low: field_decimal(&fields[3], i, "low")?,
            close: field_decimal(&fields[4], i, "close")?,
            volume: field_decimal(&fields[5], i, "volume")?,
            quote_volume: field_decimal(&fields[7], i, "quote_volume")?,
            trade_count,
        });
    }

    candles.sort_by_key(|c| c.open_time);
    Ok(candles)
}

/// Accepts `"42000.5"` as well as `42000.5`.
fn field_decimal(value: &Value, row: usize, name: &str) -> Result<Decimal, FetchError> {
    let parsed = match value {
        Value::String(s) => s.parse::<Decimal>().ok(),
        Value::Number(n) => n.to_string().parse::<Decimal>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| FetchError::MalformedPayload {
        message: format!("kline row {row}: bad {name} value {value}"),
    })
}
