//! Data model shared by the dispatch service and its stores.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Opaque identifier of a stored segment.
///
/// Paths are raw bytes; [`fmt::Display`] renders them lossily for logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentPath(Vec<u8>);

impl SegmentPath {
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SegmentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for SegmentPath {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for SegmentPath {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<Vec<u8>> for SegmentPath {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for SegmentPath {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A queue entry describing a segment that needs repair.
///
/// `inserted_at` is `None` for legacy entries written before insertion
/// timestamps were tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjuredSegment {
    pub path: SegmentPath,
    #[serde(default)]
    pub inserted_at: Option<SystemTime>,
}

impl InjuredSegment {
    #[must_use]
    pub fn new(path: impl Into<SegmentPath>) -> Self {
        Self {
            path: path.into(),
            inserted_at: None,
        }
    }

    #[must_use]
    pub const fn with_inserted_at(mut self, inserted_at: SystemTime) -> Self {
        self.inserted_at = Some(inserted_at);
        self
    }

    /// Time elapsed since the checker queued this segment.
    ///
    /// `None` when there is no insertion timestamp or the clock moved
    /// backwards past it.
    #[must_use]
    pub fn time_since_inserted(&self, now: SystemTime) -> Option<Duration> {
        self.inserted_at
            .and_then(|inserted| now.duration_since(inserted).ok())
    }
}

/// Piece accounting reported by the repairer for a segment it cannot rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrreparableDetail {
    pub pieces_required: i32,
    pub pieces_available: i32,
    /// Opaque serialized segment metadata, stored as-is.
    pub segment_detail: Vec<u8>,
}

impl IrreparableDetail {
    #[must_use]
    pub const fn lost_pieces(&self) -> i32 {
        self.pieces_required.saturating_sub(self.pieces_available)
    }
}

/// Persistent record of a segment that could not be repaired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrreparableSegment {
    pub path: SegmentPath,
    pub segment_detail: Vec<u8>,
    pub lost_pieces: i32,
    /// Unix seconds of the most recent failed attempt.
    pub last_repair_attempt: i64,
    pub repair_attempt_count: i64,
}

impl IrreparableSegment {
    /// Build the single-attempt record a repair job submits for merging.
    #[must_use]
    pub fn first_attempt(path: SegmentPath, detail: IrreparableDetail, now: SystemTime) -> Self {
        let lost_pieces = detail.lost_pieces();
        Self {
            path,
            segment_detail: detail.segment_detail,
            lost_pieces,
            last_repair_attempt: unix_seconds(now),
            repair_attempt_count: 1,
        }
    }
}

/// Seconds since the Unix epoch; negative for instants before it.
#[must_use]
pub fn unix_seconds(at: SystemTime) -> i64 {
    match at.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_secs()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_secs()).map_or(i64::MIN, |s| -s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_path_displays_lossily() {
        let path = SegmentPath::new(vec![b'a', 0xff, b'b']);
        assert_eq!(path.to_string(), "a\u{fffd}b");
        assert_eq!(SegmentPath::from("s0/obj").to_string(), "s0/obj");
    }

    #[test]
    fn lost_pieces_is_required_minus_available() {
        let detail = IrreparableDetail {
            pieces_required: 10,
            pieces_available: 3,
            segment_detail: vec![1, 2, 3],
        };
        assert_eq!(detail.lost_pieces(), 7);
    }

    #[test]
    fn first_attempt_record_has_count_one() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let record = IrreparableSegment::first_attempt(
            SegmentPath::from("p/s0/b/o"),
            IrreparableDetail {
                pieces_required: 29,
                pieces_available: 20,
                segment_detail: b"meta".to_vec(),
            },
            now,
        );
        assert_eq!(record.lost_pieces, 9);
        assert_eq!(record.repair_attempt_count, 1);
        assert_eq!(record.last_repair_attempt, 1_700_000_000);
        assert_eq!(record.segment_detail, b"meta");
    }

    #[test]
    fn time_since_inserted_absent_without_timestamp() {
        let legacy = InjuredSegment::new("legacy");
        assert!(legacy.time_since_inserted(SystemTime::now()).is_none());
    }

    #[test]
    fn time_since_inserted_ignores_future_timestamps() {
        let now = SystemTime::now();
        let future = InjuredSegment::new("skewed").with_inserted_at(now + Duration::from_secs(60));
        assert!(future.time_since_inserted(now).is_none());

        let past = InjuredSegment::new("ok").with_inserted_at(now - Duration::from_secs(5));
        assert_eq!(past.time_since_inserted(now), Some(Duration::from_secs(5)));
    }

    #[test]
    fn unix_seconds_handles_pre_epoch() {
        assert_eq!(unix_seconds(UNIX_EPOCH), 0);
        assert_eq!(unix_seconds(UNIX_EPOCH - Duration::from_secs(3)), -3);
    }

    #[test]
    fn injured_segment_serde_defaults_missing_timestamp() {
        let json = r#"{"path":[115,48]}"#;
        let seg: InjuredSegment = serde_json::from_str(json).expect("deserialize");
        assert_eq!(seg.path, SegmentPath::from("s0"));
        assert!(seg.inserted_at.is_none());
    }
}
