//! GTID sets and single-source ranges
//!
//! Binlog GTID sets are kept as the raw strings the server reports; only the
//! simple `source:start-end` form is parsed locally. Anything involving
//! several intervals of one source is compared by the database
//! (`GTID_SUBSET`, `GTID_SUBTRACT`) instead.

use std::fmt;
use std::str::FromStr;

use crate::error::{PitrError, Result};

/// A GTID set as reported by the server, e.g. `uuid:1-40,uuid2:1-3`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GtidSet(String);

impl GtidSet {
    /// Wrap a raw set, dropping surrounding whitespace
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_string())
    }

    /// The set as text
    pub fn raw(&self) -> &str {
        &self.0
    }

    /// True for the empty set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Per-source members
    pub fn list(&self) -> Vec<&str> {
        self.0
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source id of a GTID or single-source set, without line breaks
pub fn source_id(gtid: &str) -> String {
    gtid.split(':')
        .next()
        .unwrap_or_default()
        .replace(['\n', '\r'], "")
}

/// One contiguous transaction range of a single source
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GtidRange {
    /// Server or cluster UUID
    pub source: String,
    /// First transaction number
    pub start: u64,
    /// Last transaction number, equal to `start` for a single GTID
    pub end: u64,
}

impl GtidRange {
    /// Combine two ranges of the same source into `min(start)-max(end)`.
    ///
    /// The result covers both inputs and everything between them.
    pub fn merge(&self, other: &GtidRange) -> Result<GtidRange> {
        if self.source != other.source {
            return Err(PitrError::invalid_gtid(
                format!("{self},{other}"),
                "ranges of different sources can't be merged",
            ));
        }
        Ok(GtidRange {
            source: self.source.clone(),
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        })
    }
}

impl FromStr for GtidRange {
    type Err = PitrError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (source, interval) = s
            .split_once(':')
            .ok_or_else(|| PitrError::invalid_gtid(s, "missing source"))?;
        if source.is_empty() {
            return Err(PitrError::invalid_gtid(s, "missing source"));
        }
        // Tagged GTIDs and multi-interval sets have more separators.
        if interval.contains(':') || interval.contains(',') {
            return Err(PitrError::invalid_gtid(
                s,
                "only a single interval of a single source is supported",
            ));
        }

        let number = |v: &str| {
            v.parse::<u64>()
                .map_err(|_| PitrError::invalid_gtid(s, format!("{v} is not a transaction number")))
        };
        let (start, end) = match interval.split_once('-') {
            Some((a, b)) => (number(a)?, number(b)?),
            None => {
                let n = number(interval)?;
                (n, n)
            }
        };
        if start > end {
            return Err(PitrError::invalid_gtid(s, "range start is after its end"));
        }

        Ok(GtidRange {
            source: source.to_string(),
            start,
            end,
        })
    }
}

impl fmt::Display for GtidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}:{}", self.source, self.start)
        } else {
            write!(f, "{}:{}-{}", self.source, self.start, self.end)
        }
    }
}

/// Merge two single-source sets given as text
pub fn merge(a: &str, b: &str) -> Result<String> {
    let a: GtidRange = a.parse()?;
    let b: GtidRange = b.parse()?;
    Ok(a.merge(&b)?.to_string())
}

/// Set to exclude when replaying up to a target transaction.
///
/// Spans from the target transaction to the end of the binlog's first range,
/// so `mysqlbinlog --exclude-gtids` skips the target and everything after it.
pub fn extend_to_binlog_end(binlog_set: &str, target: &str) -> Result<String> {
    if binlog_set == target {
        return Ok(target.to_string());
    }
    let first = GtidSet::new(binlog_set);
    let first = first
        .list()
        .first()
        .copied()
        .ok_or_else(|| PitrError::invalid_gtid(binlog_set, "empty set"))?
        .to_string();
    let binlog: GtidRange = first.parse()?;
    let target: GtidRange = target.parse()?;
    Ok(format!("{}:{}-{}", target.source, target.start, binlog.end))
}

/// Reject a target transaction that precedes the backup's last transaction
/// or belongs to a different source
pub fn validate_transaction_target(start_set: &str, target: &str) -> Result<()> {
    let start: GtidRange = start_set
        .parse()
        .map_err(|_| PitrError::invalid_gtid(start_set, "invalid start gtid set provided"))?;
    let target: GtidRange = target.parse()?;
    // Transaction numbers only order within one source
    if target.source != start.source {
        return Err(PitrError::Recovery(format!(
            "transaction {target} is from another source than the backup ({})",
            start.source
        )));
    }
    if target.start < start.end {
        return Err(PitrError::Recovery(
            "can't restore to transaction before backup".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_outer_bounds() {
        let single = merge("src:1-40", "src:15").unwrap();
        let range = merge("src:1-40", "src:11-15").unwrap();
        assert_eq!(single, "src:1-40");
        assert_eq!(single, range);

        assert_eq!(merge("src:5-7", "src:1-2").unwrap(), "src:1-7");
        assert_eq!(merge("src:3", "src:3").unwrap(), "src:3");
    }

    #[test]
    fn test_merge_rejects_other_sources() {
        assert!(merge("a:1-5", "b:1-5").is_err());
    }

    #[test]
    fn test_parse_range() {
        let r: GtidRange = "3e11fa47-71ca-11e1-9e33-c80aa9429562:23".parse().unwrap();
        assert_eq!(r.source, "3e11fa47-71ca-11e1-9e33-c80aa9429562");
        assert_eq!((r.start, r.end), (23, 23));

        let r: GtidRange = " src:1-10\n".parse().unwrap();
        assert_eq!(r.to_string(), "src:1-10");
    }

    #[test]
    fn test_parse_rejects_multi_interval_and_garbage() {
        for bad in ["src:1-5:7-9", "src:1-5,other:1", "src", ":1-2", "src:x", "src:9-1"] {
            assert!(bad.parse::<GtidRange>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_set_list_and_source() {
        let set = GtidSet::new("a:1-5,\nb:1-3 ");
        assert_eq!(set.list(), vec!["a:1-5", "b:1-3"]);
        assert_eq!(source_id("a\r\n:1-5"), "a");
        assert!(GtidSet::new("  ").is_empty());
    }

    #[test]
    fn test_extend_to_binlog_end() {
        assert_eq!(extend_to_binlog_end("src:10-50", "src:20").unwrap(), "src:20-50");
        assert_eq!(extend_to_binlog_end("src:20", "src:20").unwrap(), "src:20");
        assert_eq!(extend_to_binlog_end("src:10-50,x:1-2", "src:30").unwrap(), "src:30-50");
    }

    #[test]
    fn test_validate_transaction_target() {
        validate_transaction_target("src:1-100", "src:100").unwrap();
        validate_transaction_target("src:7", "src:9").unwrap();

        let err = validate_transaction_target("src:1-100", "src:50").unwrap_err();
        assert!(err.to_string().contains("before backup"));

        assert!(validate_transaction_target("src:1-5:7-9", "src:10").is_err());

        let err = validate_transaction_target("src:1-100", "other:500").unwrap_err();
        assert!(err.to_string().contains("another source"));
    }
}
