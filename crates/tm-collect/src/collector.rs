//! The incremental ingestion loop: resume from the stored watermark, fetch a
//! bounded page, persist it atomically, advance, sleep, repeat.

use crate::shutdown::ShutdownToken;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::time::Duration;
use tm_data::{KlineStore, MarketDataSource, MAX_PAGE_LIMIT};
use tm_types::{Interval, TidemarkError};
use tracing::{info, warn};

/// Policy for an empty fetch result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Empty page means no more data beyond the cursor: stop this pair.
    Bounded,
    /// Empty page means caught up to live: keep polling the same cursor
    /// after the normal delay, until shutdown.
    Continuous,
}

/// Why a pair's loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The source returned no data beyond the cursor (bounded mode only).
    Exhausted,
    /// Shutdown was requested; the in-flight unit of work completed first.
    ShutdownRequested,
}

/// Configuration for one (symbol, interval) collection loop.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub symbol: String,
    pub interval: Interval,
    /// Where to start when no watermark exists. Midnight UTC of this date.
    pub start_date: Option<NaiveDate>,
    /// Inter-request delay (rate-limit courtesy) and retry backoff.
    pub poll_delay: Duration,
    pub page_limit: u16,
    pub mode: PollMode,
}

impl CollectorConfig {
    pub fn new(symbol: impl Into<String>, interval: Interval) -> Self {
        Self {
            symbol: symbol.into().to_uppercase(),
            interval,
            start_date: None,
            poll_delay: Duration::from_secs(10),
            page_limit: MAX_PAGE_LIMIT,
            mode: PollMode::Bounded,
        }
    }
}

enum Step {
    /// Batch persisted; next cursor position.
    Advanced(DateTime<Utc>),
    /// Source had nothing at or after the cursor.
    Empty,
}

/// One sequential ingestion loop. A single collector owns its (symbol,
/// interval) pair for its lifetime; pairs never share a collector, which is
/// what keeps watermark advancement single-writer.
pub struct Collector<S: MarketDataSource> {
    source: S,
    store: KlineStore,
    config: CollectorConfig,
    shutdown: ShutdownToken,
    records_collected: u64,
}

impl<S: MarketDataSource> Collector<S> {
    pub fn new(
        source: S,
        store: KlineStore,
        config: CollectorConfig,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            source,
            store,
            config,
            shutdown,
            records_collected: 0,
        }
    }

    /// Total rows actually inserted so far (duplicates excluded).
    pub fn records_collected(&self) -> u64 {
        self.records_collected
    }

    /// Run the loop until the source is exhausted (bounded mode) or shutdown
    /// is requested. Every per-iteration error is logged and retried at the
    /// same cursor after the configured delay; nothing here is fatal.
    pub async fn run(&mut self) -> StopReason {
        info!(
            symbol = %self.config.symbol,
            interval = %self.config.interval,
            mode = ?self.config.mode,
            "starting collection"
        );

        let mut cursor = loop {
            if self.shutdown.is_triggered() {
                return self.stopped();
            }
            match self.resume_point() {
                Ok(cursor) => break cursor,
                Err(e) => {
                    warn!(
                        symbol = %self.config.symbol,
                        interval = %self.config.interval,
                        error = %e,
                        "failed to compute resume point; retrying"
                    );
                    self.pause().await;
                }
            }
        };

        info!(
            symbol = %self.config.symbol,
            interval = %self.config.interval,
            cursor = %cursor,
            "resuming collection"
        );

        loop {
            if self.shutdown.is_triggered() {
                return self.stopped();
            }

            match self.step(cursor).await {
                Ok(Step::Advanced(next)) => {
                    cursor = next;
                    self.pause().await;
                }
                Ok(Step::Empty) => match self.config.mode {
                    PollMode::Bounded => {
                        info!(
                            symbol = %self.config.symbol,
                            interval = %self.config.interval,
                            records = self.records_collected,
                            "no new data available; collection exhausted"
                        );
                        return StopReason::Exhausted;
                    }
                    PollMode::Continuous => {
                        // Caught up to live; same cursor next time around.
                        self.pause().await;
                    }
                },
                Err(e) => {
                    // Watermark and cursor are untouched: the next iteration
                    // re-fetches the identical window, and idempotent storage
                    // absorbs any rows that did land.
                    warn!(
                        symbol = %self.config.symbol,
                        interval = %self.config.interval,
                        cursor = %cursor,
                        error = %e,
                        "iteration failed; retrying after delay"
                    );
                    self.pause().await;
                }
            }
        }
    }

    /// Where to start fetching for this pair:
    /// 1. stored watermark + one interval (never re-request the last bar),
    /// 2. else the explicit start date at midnight UTC,
    /// 3. else one full page's worth of bars before now.
    fn resume_point(&self) -> Result<DateTime<Utc>, TidemarkError> {
        if let Some(watermark) = self
            .store
            .last_update(&self.config.symbol, &self.config.interval)?
        {
            return Ok(watermark + self.config.interval.duration());
        }

        if let Some(date) = self.config.start_date {
            return Ok(date.and_time(NaiveTime::MIN).and_utc());
        }

        let lookback = self.config.interval.duration() * i32::from(self.config.page_limit);
        Ok(Utc::now() - lookback)
    }

    async fn step(&mut self, cursor: DateTime<Utc>) -> Result<Step, TidemarkError> {
        let page = self
            .source
            .fetch_klines(
                &self.config.symbol,
                &self.config.interval,
                Some(cursor),
                self.config.page_limit,
            )
            .await?;

        if page.is_empty() {
            return Ok(Step::Empty);
        }

        // Persist and advance the watermark in one atomic unit; on failure
        // neither moves.
        let outcome = self.store.append_batch(&page)?;
        self.records_collected += outcome.inserted as u64;

        info!(
            symbol = %self.config.symbol,
            interval = %self.config.interval,
            fetched = page.len(),
            inserted = outcome.inserted,
            watermark = %outcome.last_open_time,
            "stored batch"
        );

        Ok(Step::Advanced(
            outcome.last_open_time + self.config.interval.duration(),
        ))
    }

    /// Cancellable inter-request sleep.
    async fn pause(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.poll_delay) => {}
        }
    }

    fn stopped(&self) -> StopReason {
        info!(
            symbol = %self.config.symbol,
            interval = %self.config.interval,
            records = self.records_collected,
            "collection stopped gracefully"
        );
        StopReason::ShutdownRequested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tm_types::{Candle, FetchError, Ticker24h, Trade};

    fn hourly() -> Interval {
        "1h".parse().unwrap()
    }

    fn base_time() -> DateTime<Utc> {
        "2024-01-01T00:00:00Z".parse().unwrap()
    }

    fn hourly_candles(start: DateTime<Utc>, count: i64) -> Vec<Candle> {
        (0..count)
            .map(|i| Candle {
                symbol: "BTCUSDT".to_string(),
                interval: hourly(),
                open_time: start + chrono::Duration::hours(i),
                open: dec!(42000) + Decimal::from(i),
                high: dec!(42100) + Decimal::from(i),
                low: dec!(41900) + Decimal::from(i),
                close: dec!(42050) + Decimal::from(i),
                volume: dec!(12.5),
                quote_volume: dec!(525000),
                trade_count: 100,
            })
            .collect()
    }

    /// Scripted market data source; clones share the script and call log.
    #[derive(Clone, Default)]
    struct ScriptedSource {
        state: Arc<ScriptState>,
    }

    #[derive(Default)]
    struct ScriptState {
        pages: Mutex<VecDeque<Result<Vec<Candle>, FetchError>>>,
        calls: Mutex<Vec<Option<DateTime<Utc>>>>,
        /// Triggered when the script runs out, so continuous-mode tests can
        /// stop the loop.
        on_drained: Mutex<Option<ShutdownToken>>,
    }

    impl ScriptedSource {
        fn new(pages: Vec<Result<Vec<Candle>, FetchError>>) -> Self {
            Self {
                state: Arc::new(ScriptState {
                    pages: Mutex::new(pages.into()),
                    calls: Mutex::new(Vec::new()),
                    on_drained: Mutex::new(None),
                }),
            }
        }

        fn trigger_when_drained(self, token: ShutdownToken) -> Self {
            *self.state.on_drained.lock() = Some(token);
            self
        }

        fn calls(&self) -> Vec<Option<DateTime<Utc>>> {
            self.state.calls.lock().clone()
        }
    }

    #[async_trait]
    impl MarketDataSource for ScriptedSource {
        async fn fetch_klines(
            &self,
            _symbol: &str,
            _interval: &Interval,
            start_time: Option<DateTime<Utc>>,
            _limit: u16,
        ) -> Result<Vec<Candle>, FetchError> {
            self.state.calls.lock().push(start_time);
            match self.state.pages.lock().pop_front() {
                Some(page) => page,
                None => {
                    if let Some(token) = self.state.on_drained.lock().as_ref() {
                        token.trigger();
                    }
                    Ok(Vec::new())
                }
            }
        }

        async fn fetch_recent_trades(
            &self,
            _symbol: &str,
            _limit: u16,
        ) -> Result<Vec<Trade>, FetchError> {
            Ok(Vec::new())
        }

        async fn fetch_24h_ticker(&self, _symbol: &str) -> Result<Ticker24h, FetchError> {
            Err(FetchError::Http {
                message: "not scripted".to_string(),
            })
        }
    }

    fn test_config() -> CollectorConfig {
        let mut config = CollectorConfig::new("BTCUSDT", hourly());
        config.poll_delay = Duration::ZERO;
        config
    }

    #[tokio::test]
    async fn test_resume_strictly_after_watermark() {
        let store = KlineStore::open_in_memory().unwrap();
        let watermark = base_time() + chrono::Duration::hours(41);
        store
            .set_last_update("BTCUSDT", &hourly(), watermark)
            .unwrap();

        let source = ScriptedSource::new(vec![Ok(Vec::new())]);
        let mut collector = Collector::new(
            source.clone(),
            store,
            test_config(),
            ShutdownToken::new(),
        );

        assert_eq!(collector.run().await, StopReason::Exhausted);
        // Never re-request the last stored bar.
        assert_eq!(
            source.calls(),
            vec![Some(watermark + chrono::Duration::hours(1))]
        );
    }

    #[tokio::test]
    async fn test_resume_from_explicit_start_date() {
        let store = KlineStore::open_in_memory().unwrap();
        let source = ScriptedSource::new(vec![Ok(Vec::new())]);

        let mut config = test_config();
        config.start_date = Some(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());

        let mut collector =
            Collector::new(source.clone(), store, config, ShutdownToken::new());
        collector.run().await;

        assert_eq!(source.calls(), vec![Some(base_time())]);
    }

    #[tokio::test]
    async fn test_default_lookback_is_one_page() {
        let store = KlineStore::open_in_memory().unwrap();
        let source = ScriptedSource::new(vec![Ok(Vec::new())]);

        let before = Utc::now();
        let mut collector = Collector::new(
            source.clone(),
            store,
            test_config(),
            ShutdownToken::new(),
        );
        collector.run().await;
        let after = Utc::now();

        let cursor = source.calls()[0].unwrap();
        let lookback = chrono::Duration::hours(1000);
        assert!(cursor >= before - lookback);
        assert!(cursor <= after - lookback);
    }

    #[tokio::test]
    async fn test_first_page_end_to_end() {
        let store = KlineStore::open_in_memory().unwrap();
        let source = ScriptedSource::new(vec![
            Ok(hourly_candles(base_time(), 1000)),
            Ok(Vec::new()),
        ]);

        let mut config = test_config();
        config.start_date = Some(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());

        let mut collector = Collector::new(
            source.clone(),
            store.clone(),
            config,
            ShutdownToken::new(),
        );
        assert_eq!(collector.run().await, StopReason::Exhausted);
        assert_eq!(collector.records_collected(), 1000);

        // The 1000th hourly bar opens 999 hours after midnight Jan 1.
        let expected_watermark: DateTime<Utc> = "2024-02-11T15:00:00Z".parse().unwrap();
        assert_eq!(
            store.last_update("BTCUSDT", &hourly()).unwrap(),
            Some(expected_watermark)
        );
        assert_eq!(store.count("BTCUSDT", &hourly()).unwrap(), 1000);

        // Second fetch starts one interval after the new watermark.
        assert_eq!(
            source.calls(),
            vec![
                Some(base_time()),
                Some(expected_watermark + chrono::Duration::hours(1)),
            ]
        );
    }

    #[tokio::test]
    async fn test_transient_error_retries_same_cursor() {
        let store = KlineStore::open_in_memory().unwrap();
        let batch = hourly_candles(base_time(), 2);
        let source = ScriptedSource::new(vec![
            Err(FetchError::Http {
                message: "connection reset".to_string(),
            }),
            Ok(batch.clone()),
            Ok(Vec::new()),
        ]);

        let mut config = test_config();
        config.start_date = Some(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());

        let mut collector = Collector::new(
            source.clone(),
            store.clone(),
            config,
            ShutdownToken::new(),
        );
        assert_eq!(collector.run().await, StopReason::Exhausted);

        let calls = source.calls();
        assert_eq!(calls.len(), 3);
        // The failed iteration left the cursor untouched.
        assert_eq!(calls[0], calls[1]);
        // Nothing was stored by the failed iteration; the retry stored all.
        assert_eq!(store.count("BTCUSDT", &hourly()).unwrap(), 2);
        assert_eq!(
            store.last_update("BTCUSDT", &hourly()).unwrap(),
            Some(batch[1].open_time)
        );
    }

    #[tokio::test]
    async fn test_continuous_mode_polls_until_shutdown() {
        let store = KlineStore::open_in_memory().unwrap();
        let shutdown = ShutdownToken::new();
        let source = ScriptedSource::new(vec![Ok(hourly_candles(base_time(), 3))])
            .trigger_when_drained(shutdown.clone());

        let mut config = test_config();
        config.start_date = Some(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        config.mode = PollMode::Continuous;

        let mut collector = Collector::new(source.clone(), store.clone(), config, shutdown);
        assert_eq!(collector.run().await, StopReason::ShutdownRequested);

        // One batch stored, then the caught-up poll drained the script and
        // triggered shutdown.
        assert_eq!(store.count("BTCUSDT", &hourly()).unwrap(), 3);
        assert_eq!(source.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_pretriggered_shutdown_fetches_nothing() {
        let store = KlineStore::open_in_memory().unwrap();
        let source = ScriptedSource::new(vec![Ok(hourly_candles(base_time(), 1))]);
        let shutdown = ShutdownToken::new();
        shutdown.trigger();

        let mut collector = Collector::new(source.clone(), store, test_config(), shutdown);
        assert_eq!(collector.run().await, StopReason::ShutdownRequested);
        assert!(source.calls().is_empty());
    }
}
