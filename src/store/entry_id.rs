//! Stream entry identifiers
//!
//! Ids have the Redis Streams shape `<millis>-<seq>`: the append time in Unix
//! milliseconds plus a sequence number that disambiguates entries appended in
//! the same millisecond. Ordering is lexicographic on `(millis, seq)`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    pub millis: u64,
    pub seq: u64,
}

impl EntryId {
    /// The id no entry can have; a group created at `ZERO` sees every entry as new
    pub const ZERO: EntryId = EntryId { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        EntryId { millis, seq }
    }

    /// Smallest id strictly greater than `self` that an append at `now_ms` may take
    pub fn next_after(&self, now_ms: u64) -> EntryId {
        if now_ms > self.millis {
            EntryId::new(now_ms, 0)
        } else {
            EntryId::new(self.millis, self.seq + 1)
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid entry id: {0:?}")]
pub struct ParseEntryIdError(pub String);

impl FromStr for EntryId {
    type Err = ParseEntryIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseEntryIdError(s.to_string());
        let (millis, seq) = s.split_once('-').ok_or_else(err)?;
        let millis = millis.parse().map_err(|_| err())?;
        let seq = seq.parse().map_err(|_| err())?;
        Ok(EntryId { millis, seq })
    }
}

impl Serialize for EntryId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntryId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let id: EntryId = "1526919030474-55".parse().unwrap();
        assert_eq!(id, EntryId::new(1526919030474, 55));
        assert_eq!(id.to_string(), "1526919030474-55");
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["", "123", "-1", "1-", "a-1", "1-b", "1-2-3"] {
            assert!(bad.parse::<EntryId>().is_err(), "{:?} should not parse", bad);
        }
    }

    #[test]
    fn test_ordering_is_numeric_not_lexical() {
        let a = EntryId::new(9, 0);
        let b = EntryId::new(10, 0);
        let c = EntryId::new(10, 1);
        assert!(a < b && b < c);
        assert!("9-0" > "10-0", "strings would sort the other way");
    }

    #[test]
    fn test_next_after_same_millisecond_bumps_sequence() {
        let last = EntryId::new(100, 4);
        assert_eq!(last.next_after(100), EntryId::new(100, 5));
        assert_eq!(last.next_after(99), EntryId::new(100, 5));
        assert_eq!(last.next_after(101), EntryId::new(101, 0));
    }

    #[test]
    fn test_serde_as_string() {
        let id = EntryId::new(5, 6);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"5-6\"");
        let back: EntryId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
