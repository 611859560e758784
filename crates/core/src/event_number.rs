//! Last-event-number lookup results
//!
//! "No stream" and "could not determine" are explicit variants rather than
//! negative event numbers, and "not cached" is `Option::None`.

use std::fmt;

/// Outcome of resolving a stream's last event number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LastEventNumber {
    /// The stream exists; this is its most recent event number
    Found(u32),
    /// No index entry exists for the stream
    NoStream,
    /// The answer could not be determined within the collision read limit
    ///
    /// This is ambiguity, not absence: callers must not treat it as `NoStream`.
    Invalid,
}

impl LastEventNumber {
    /// The event number, if the stream was found
    pub fn event_number(&self) -> Option<u32> {
        match self {
            LastEventNumber::Found(n) => Some(*n),
            _ => None,
        }
    }

    /// Whether the lookup produced a definite answer
    pub fn is_determinate(&self) -> bool {
        !matches!(self, LastEventNumber::Invalid)
    }
}

impl fmt::Display for LastEventNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LastEventNumber::Found(n) => write!(f, "{}", n),
            LastEventNumber::NoStream => write!(f, "no-stream"),
            LastEventNumber::Invalid => write!(f, "invalid"),
        }
    }
}

/// A cache read of a stream's last event number
///
/// `version` is the cache version observed at read time and must be handed
/// back on the conditional update; 0 means the stream has no cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventNumberCached {
    /// Cache version token
    pub version: u64,
    /// Cached value, `None` when not cached
    pub last_event_number: Option<LastEventNumber>,
}

impl EventNumberCached {
    /// A miss observed at the given version
    pub const fn uncached(version: u64) -> Self {
        EventNumberCached {
            version,
            last_event_number: None,
        }
    }

    /// A hit
    pub const fn cached(version: u64, value: LastEventNumber) -> Self {
        EventNumberCached {
            version,
            last_event_number: Some(value),
        }
    }

    /// Whether the cache held a value
    pub fn is_cached(&self) -> bool {
        self.last_event_number.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_number_accessor() {
        assert_eq!(LastEventNumber::Found(7).event_number(), Some(7));
        assert_eq!(LastEventNumber::NoStream.event_number(), None);
        assert_eq!(LastEventNumber::Invalid.event_number(), None);
    }

    #[test]
    fn test_invalid_is_not_determinate() {
        assert!(LastEventNumber::Found(0).is_determinate());
        assert!(LastEventNumber::NoStream.is_determinate());
        assert!(!LastEventNumber::Invalid.is_determinate());
    }

    #[test]
    fn test_cached_markers() {
        assert!(!EventNumberCached::uncached(0).is_cached());
        let hit = EventNumberCached::cached(3, LastEventNumber::NoStream);
        assert!(hit.is_cached());
        assert_eq!(hit.version, 3);
    }
}
