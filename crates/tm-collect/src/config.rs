//! Environment-driven service settings.

use crate::collector::PollMode;
use chrono::NaiveDate;
use std::time::Duration;
use tm_types::{Interval, TidemarkError, TmResult};

pub const DEFAULT_DB_PATH: &str = "tidemark.duckdb";
pub const DEFAULT_PAIRS: &str = "BTCUSDT:1h";
pub const DEFAULT_POLL_SECONDS: u64 = 10;

/// Settings for the collector service, read from `TIDEMARK_*` environment
/// variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: String,
    /// (symbol, interval) pairs to collect, one loop each.
    pub pairs: Vec<(String, Interval)>,
    pub start_date: Option<NaiveDate>,
    pub poll_delay: Duration,
    pub mode: PollMode,
}

impl Settings {
    /// Read settings from the process environment.
    ///
    /// * `TIDEMARK_DB` — database file path (default `tidemark.duckdb`)
    /// * `TIDEMARK_PAIRS` — comma-separated `SYMBOL:interval` list
    ///   (default `BTCUSDT:1h`)
    /// * `TIDEMARK_START_DATE` — `YYYY-MM-DD` backfill start for pairs with
    ///   no watermark yet
    /// * `TIDEMARK_POLL_SECONDS` — inter-request delay (default 10)
    /// * `TIDEMARK_POLL_MODE` — `bounded` (default) or `continuous`
    pub fn from_env() -> TmResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> TmResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let db_path = lookup("TIDEMARK_DB").unwrap_or_else(|| DEFAULT_DB_PATH.to_string());

        let raw_pairs = lookup("TIDEMARK_PAIRS").unwrap_or_else(|| DEFAULT_PAIRS.to_string());
        let pairs = parse_pairs(&raw_pairs)?;

        let start_date = match lookup("TIDEMARK_START_DATE") {
            Some(raw) => Some(
                NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| {
                    TidemarkError::Config(format!("TIDEMARK_START_DATE '{raw}': {e}"))
                })?,
            ),
            None => None,
        };

        let poll_seconds = match lookup("TIDEMARK_POLL_SECONDS") {
            Some(raw) => raw.parse::<u64>().map_err(|e| {
                TidemarkError::Config(format!("TIDEMARK_POLL_SECONDS '{raw}': {e}"))
            })?,
            None => DEFAULT_POLL_SECONDS,
        };

        let mode = match lookup("TIDEMARK_POLL_MODE").as_deref() {
            None => PollMode::Bounded,
            Some("bounded") => PollMode::Bounded,
            Some("continuous") => PollMode::Continuous,
            Some(other) => {
                return Err(TidemarkError::Config(format!(
                    "TIDEMARK_POLL_MODE '{other}': expected 'bounded' or 'continuous'"
                )))
            }
        };

        Ok(Self {
            db_path,
            pairs,
            start_date,
            poll_delay: Duration::from_secs(poll_seconds),
            mode,
        })
    }
}

fn parse_pairs(raw: &str) -> TmResult<Vec<(String, Interval)>> {
    let mut pairs = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (symbol, interval) = entry.split_once(':').ok_or_else(|| {
            TidemarkError::Config(format!("pair '{entry}': expected SYMBOL:interval"))
        })?;
        if symbol.is_empty() {
            return Err(TidemarkError::Config(format!(
                "pair '{entry}': empty symbol"
            )));
        }
        let pair = (symbol.to_uppercase(), interval.parse::<Interval>()?);
        // One loop per pair; a duplicate entry would create a second writer.
        if !pairs.contains(&pair) {
            pairs.push(pair);
        }
    }

    if pairs.is_empty() {
        return Err(TidemarkError::Config(
            "TIDEMARK_PAIRS resolved to no pairs".to_string(),
        ));
    }
    Ok(pairs)
}
