use crate::error::SyncError;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Opaque monotonic marker into the change ledger's history.
///
/// Ordered by wall-clock milliseconds first, then by the ledger's
/// write-time sequence number. The sequence tie-break makes replay
/// deterministic when two records share a timestamp.
///
/// Wire form is the string `"<ts_ms>-<seq>"`; clients must treat it as
/// opaque and only ever echo it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor {
    pub ts_ms: i64,
    pub seq: i64,
}

impl Cursor {
    /// The cursor before any recorded change.
    pub const ZERO: Cursor = Cursor { ts_ms: 0, seq: 0 };

    pub fn new(ts_ms: i64, seq: i64) -> Self {
        Cursor { ts_ms, seq }
    }

    pub fn is_zero(&self) -> bool {
        *self == Cursor::ZERO
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ts_ms, self.seq)
    }
}

impl FromStr for Cursor {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SyncError::InvalidCursor(s.to_string());
        let (ts, seq) = s.split_once('-').ok_or_else(invalid)?;
        let ts_ms: i64 = ts.parse().map_err(|_| invalid())?;
        let seq: i64 = seq.parse().map_err(|_| invalid())?;
        if ts_ms < 0 || seq < 0 {
            return Err(invalid());
        }
        Ok(Cursor { ts_ms, seq })
    }
}

impl Serialize for Cursor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
