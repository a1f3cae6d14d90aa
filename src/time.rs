//! Detector/PV timestamps and the three-degree comparator (§4.4a).
//!
//! Timestamps are supplied by the detector and PV source; this module only
//! compares them — it never reads a wall clock to "fix up" cross-host skew.

use std::cmp::Ordering;

/// `{seconds, nanoseconds}` pair carried on event and PV datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Timestamp {
    pub seconds: u32,
    pub nanoseconds: u32,
}

impl Timestamp {
    pub const fn new(seconds: u32, nanoseconds: u32) -> Self {
        Self { seconds, nanoseconds }
    }

    /// Sentinel used by degree-0 comparisons; `compare` treats it specially.
    pub const MAX: Timestamp = Timestamp { seconds: u32::MAX, nanoseconds: u32::MAX };

    /// Packs into a single ordered 64-bit value (seconds in the high word).
    #[inline]
    pub fn value(&self) -> u64 {
        ((self.seconds as u64) << 32) | self.nanoseconds as u64
    }

    pub fn checked_sub_millis(&self, millis: u64) -> Timestamp {
        let total_ns = self.value().saturating_sub(millis.saturating_mul(1_000_000));
        Timestamp {
            seconds: (total_ns >> 32) as u32,
            nanoseconds: total_ns as u32,
        }
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value().cmp(&other.value())
    }
}

/// Strictness of timestamp matching (process-wide, write-once at startup).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchDegree {
    /// Always equal unless `ts2 == Timestamp::MAX`; used only by the timeout path.
    Wildcard,
    /// Fiducial-ignored: mask off the low 17 bits of nanoseconds, 10ms tolerance.
    /// Preserved for completeness but rejected at the CLI (see config::Parameters).
    FiducialIgnored,
    /// Strict integer compare. Default.
    Strict,
}

impl MatchDegree {
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => MatchDegree::Wildcard,
            1 => MatchDegree::FiducialIgnored,
            _ => MatchDegree::Strict,
        }
    }
}

impl Default for MatchDegree {
    fn default() -> Self {
        MatchDegree::Strict
    }
}

/// Result of comparing an event timestamp to a PV timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// `t1 == t2` (within the active degree's tolerance).
    Equal,
    /// `t1 < t2` — the event is older than the PV.
    EventOlder,
    /// `t1 > t2` — the event is newer than the PV.
    EventNewer,
}

/// `compare(t1, t2)` per §4.4a. `t1` is the event (detector) timestamp,
/// `t2` is the PV timestamp.
pub fn compare(degree: MatchDegree, t1: Timestamp, t2: Timestamp) -> Comparison {
    match degree {
        MatchDegree::Wildcard => {
            if t2 == Timestamp::MAX {
                // Ambiguous by design (see Design Notes open question); callers
                // in the match path never reach here in practice since degree 0
                // is only exercised on the timeout watermark.
                if t1 == t2 { Comparison::Equal } else if t1 < t2 { Comparison::EventOlder } else { Comparison::EventNewer }
            } else {
                Comparison::Equal
            }
        }
        MatchDegree::FiducialIgnored => {
            const MASK: u64 = 0xffff_ffff_fffe_0000;
            const DELTA_NS: u64 = 10_000_000; // 10 ms
            let t1m = t1.value() & MASK;
            let t2m = t2.value() & MASK;
            if t1m > t2m {
                if t1m - t2m > DELTA_NS { Comparison::EventNewer } else { Comparison::Equal }
            } else if t2m > t1m {
                if t2m - t1m > DELTA_NS { Comparison::EventOlder } else { Comparison::Equal }
            } else {
                Comparison::Equal
            }
        }
        MatchDegree::Strict => match t1.cmp(&t2) {
            Ordering::Equal => Comparison::Equal,
            Ordering::Less => Comparison::EventOlder,
            Ordering::Greater => Comparison::EventNewer,
        },
    }
}
