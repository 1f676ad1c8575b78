use crate::interval::Interval;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One OHLCV kline bar for a symbol at a given interval and open time.
///
/// `(symbol, interval, open_time)` is the natural key: candles are immutable
/// once stored, and a conflicting insert is skipped rather than overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Uppercase ticker, e.g. `BTCUSDT`.
    pub symbol: String,
    pub interval: Interval,
    /// Bar open time, UTC, millisecond precision on the wire.
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// Base-asset volume.
    pub volume: Decimal,
    /// Quote-asset volume.
    pub quote_volume: Decimal,
    /// Number of trades in the bar.
    pub trade_count: u64,
}

impl Candle {
    /// The natural key identifying this candle.
    pub fn natural_key(&self) -> (&str, &str, DateTime<Utc>) {
        (&self.symbol, self.interval.token(), self.open_time)
    }
}

impl fmt::Display for Candle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} @ {} close={}",
            self.symbol, self.interval, self.open_time, self.close
        )
    }
}

/// One executed trade from the recent-trades endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub price: Decimal,
    pub qty: Decimal,
    #[serde(rename = "quoteQty")]
    pub quote_qty: Decimal,
    /// Trade time, milliseconds since epoch on the wire.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
    #[serde(rename = "isBuyerMaker")]
    pub is_buyer_maker: bool,
}

/// 24-hour rolling ticker statistics for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker24h {
    pub symbol: String,
    pub price_change: Decimal,
    pub price_change_percent: Decimal,
    pub weighted_avg_price: Decimal,
    pub last_price: Decimal,
    pub open_price: Decimal,
    pub high_price: Decimal,
    pub low_price: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub open_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub close_time: DateTime<Utc>,
    pub count: u64,
}
