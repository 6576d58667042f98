use crate::error::LockError;
use crate::Result;
use std::cmp::Ordering;
use std::fmt;

pub type Key = Vec<u8>;

/// Fixed per-lock overhead used when estimating the memory held by locks.
pub const ROW_LOCK_OVERHEAD: usize = 64;

/// A position in the key space between keys.
///
/// `Before(k)` sits just before `k` and `After(k)` just after it, so a closed
/// key interval `[a, b]` is the half-open endpoint interval
/// `[Before(a), After(b))` and can be split at any key boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    NegativeInfinity,
    Before(Key),
    After(Key),
    PositiveInfinity,
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        use Endpoint::*;
        match (self, other) {
            (NegativeInfinity, NegativeInfinity) | (PositiveInfinity, PositiveInfinity) => {
                Ordering::Equal
            }
            (NegativeInfinity, _) | (_, PositiveInfinity) => Ordering::Less,
            (_, NegativeInfinity) | (PositiveInfinity, _) => Ordering::Greater,
            (Before(a), Before(b)) | (After(a), After(b)) => a.cmp(b),
            (Before(a), After(b)) => match a.cmp(b) {
                Ordering::Equal => Ordering::Less,
                o => o,
            },
            (After(a), Before(b)) => match a.cmp(b) {
                Ordering::Equal => Ordering::Greater,
                o => o,
            },
        }
    }
}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Endpoint {
    fn key_len(&self) -> usize {
        match self {
            Endpoint::Before(k) | Endpoint::After(k) => k.len(),
            _ => 0,
        }
    }
}

/// Half-open interval `[start, end)` over endpoints. Always non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    start: Endpoint,
    end: Endpoint,
}

impl KeyRange {
    /// Closed interval `[low, high]`.
    pub fn new(low: impl Into<Key>, high: impl Into<Key>) -> Result<KeyRange> {
        let low = low.into();
        let high = high.into();
        if low > high {
            return Err(LockError::InvalidRange(format!(
                "left key {:?} is greater than right key {:?}",
                low, high
            )));
        }
        Ok(KeyRange {
            start: Endpoint::Before(low),
            end: Endpoint::After(high),
        })
    }

    /// Zero-width range covering one key.
    pub fn point(key: impl Into<Key>) -> KeyRange {
        let key = key.into();
        KeyRange {
            start: Endpoint::Before(key.clone()),
            end: Endpoint::After(key),
        }
    }

    /// The whole key space of a resource, i.e. a table lock.
    pub fn full() -> KeyRange {
        KeyRange {
            start: Endpoint::NegativeInfinity,
            end: Endpoint::PositiveInfinity,
        }
    }

    pub(crate) fn from_endpoints(start: Endpoint, end: Endpoint) -> KeyRange {
        debug_assert!(start < end);
        KeyRange { start, end }
    }

    #[inline]
    pub fn start(&self) -> &Endpoint {
        &self.start
    }

    #[inline]
    pub fn end(&self) -> &Endpoint {
        &self.end
    }

    pub fn is_full(&self) -> bool {
        self.start == Endpoint::NegativeInfinity && self.end == Endpoint::PositiveInfinity
    }

    pub fn is_point(&self) -> bool {
        match (&self.start, &self.end) {
            (Endpoint::Before(a), Endpoint::After(b)) => a == b,
            _ => false,
        }
    }

    #[inline]
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    #[inline]
    pub fn contains(&self, other: &KeyRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.contains(&KeyRange::point(key.to_vec()))
    }

    pub fn intersection(&self, other: &KeyRange) -> Option<KeyRange> {
        if !self.overlaps(other) {
            return None;
        }
        let start = std::cmp::max(&self.start, &other.start).clone();
        let end = std::cmp::min(&self.end, &other.end).clone();
        Some(KeyRange { start, end })
    }

    /// Whether any key falls inside the range. Only the gap between a key
    /// and its immediate successor, or the one below the empty key, has none.
    pub fn has_keys(&self) -> bool {
        has_keys_between(&self.start, &self.end)
    }

    /// Estimated bytes this range costs in the lock table.
    pub fn footprint(&self) -> usize {
        self.start.key_len() + self.end.key_len() + ROW_LOCK_OVERHEAD
    }
}

pub(crate) fn has_keys_between(start: &Endpoint, end: &Endpoint) -> bool {
    if start >= end {
        return false;
    }
    match (start, end) {
        (Endpoint::NegativeInfinity, Endpoint::Before(high)) => !high.is_empty(),
        (Endpoint::After(low), Endpoint::Before(high)) => {
            !(high.len() == low.len() + 1 && high.starts_with(low) && high[low.len()] == 0)
        }
        _ => true,
    }
}

fn write_key(f: &mut fmt::Formatter<'_>, key: &[u8]) -> fmt::Result {
    write!(f, "{}", String::from_utf8_lossy(key))
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.start {
            Endpoint::NegativeInfinity => write!(f, "(-inf")?,
            Endpoint::Before(k) => {
                write!(f, "[")?;
                write_key(f, k)?;
            }
            Endpoint::After(k) => {
                write!(f, "(")?;
                write_key(f, k)?;
            }
            Endpoint::PositiveInfinity => write!(f, "(+inf")?,
        }
        write!(f, ", ")?;
        match &self.end {
            Endpoint::NegativeInfinity => write!(f, "-inf)"),
            Endpoint::Before(k) => {
                write_key(f, k)?;
                write!(f, ")")
            }
            Endpoint::After(k) => {
                write_key(f, k)?;
                write!(f, "]")
            }
            Endpoint::PositiveInfinity => write!(f, "+inf)"),
        }
    }
}
