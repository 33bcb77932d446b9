//! Unix timestamps for receipts, flow records and daily budget windows.
//!
//! [`UnixTimestamp`] is whole seconds since the Unix epoch. Budget windows are
//! UTC calendar days, obtained with [`UnixTimestamp::utc_day`].

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::ops::Add;
use std::time::SystemTime;

/// Number of seconds in one UTC day. Unix time has no leap seconds, so
/// integer division by this constant yields the calendar day.
pub const SECONDS_PER_DAY: u64 = 86_400;

/// A Unix timestamp in seconds (1970-01-01T00:00:00Z based).
///
/// # Serialization
///
/// Serialized as a stringified integer so JavaScript consumers of exported
/// receipts do not lose precision:
///
/// ```json
/// "1699999999"
/// ```
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash)]
pub struct UnixTimestamp(u64);

impl Serialize for UnixTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let ts = s
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom("timestamp must be a non-negative integer"))?;
        Ok(Self(ts))
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.saturating_add(rhs))
    }
}

impl UnixTimestamp {
    /// Creates a timestamp from raw seconds.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Returns the current system time.
    ///
    /// A clock set before the epoch yields `0` rather than panicking.
    #[must_use]
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        Self(secs)
    }

    /// Returns the raw seconds.
    #[must_use]
    pub const fn as_secs(&self) -> u64 {
        self.0
    }

    /// Returns the number of whole UTC days since the epoch.
    ///
    /// Two timestamps fall in the same budget window iff their `utc_day`
    /// values are equal; the window rolls over at 00:00:00 UTC.
    #[must_use]
    pub const fn utc_day(&self) -> u64 {
        self.0 / SECONDS_PER_DAY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_as_string() {
        let ts = UnixTimestamp::from_secs(1_699_999_999);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "\"1699999999\"");
        let back: UnixTimestamp = serde_json::from_str("\"1699999999\"").unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn test_rejects_negative() {
        assert!(serde_json::from_str::<UnixTimestamp>("\"-1\"").is_err());
    }

    #[test]
    fn test_utc_day_rolls_over_at_midnight() {
        let last_second = UnixTimestamp::from_secs(SECONDS_PER_DAY * 20_000 - 1);
        let midnight = last_second + 1;
        assert_eq!(last_second.utc_day() + 1, midnight.utc_day());
        assert_eq!(midnight.utc_day(), (midnight + 3_600).utc_day());
    }
}
