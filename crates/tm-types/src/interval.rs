use crate::errors::InvalidInterval;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A validated kline interval token such as `"15m"` or `"1h"`.
///
/// The trailing unit is one of `m` (minute), `h` (hour), `d` (day),
/// `w` (week) or `M` (30-day month); the leading part is a positive
/// integer. Binance accepts `1m,3m,5m,15m,30m,1h,2h,4h,6h,8h,12h,1d,3d,1w,1M`,
/// all of which parse here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Interval {
    token: String,
    minutes: u32,
}

impl Interval {
    /// Duration of one bar, in minutes.
    pub fn minutes(&self) -> u32 {
        self.minutes
    }

    /// Duration of one bar as a chrono duration.
    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.minutes))
    }

    /// The original token, e.g. `"1h"`.
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl FromStr for Interval {
    type Err = InvalidInterval;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let unit = token
            .chars()
            .last()
            .ok_or_else(|| InvalidInterval::new(token, "empty token"))?;

        let per_unit: u32 = match unit {
            'm' => 1,
            'h' => 60,
            'd' => 1440,
            'w' => 10080,
            'M' => 43200,
            _ => {
                return Err(InvalidInterval::new(
                    token,
                    format!("unknown unit '{unit}', expected one of m/h/d/w/M"),
                ))
            }
        };

        let count: u32 = token[..token.len() - unit.len_utf8()]
            .parse()
            .map_err(|_| InvalidInterval::new(token, "leading part is not a positive integer"))?;

        if count == 0 {
            return Err(InvalidInterval::new(token, "leading part must be positive"));
        }

        Ok(Self {
            token: token.to_string(),
            minutes: count * per_unit,
        })
    }
}

impl TryFrom<String> for Interval {
    type Error = InvalidInterval;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(interval: Interval) -> Self {
        interval.token
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token)
    }
}
