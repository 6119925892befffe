//! Utilities shared by every mfabric crate
//!
//! ## Core Features:
//! - **Byte Size Handling**: Human-readable byte size parsing/formatting with [`Bytesize`]
//! - **Duration Conversion**: String-to-Duration parsing supporting multiple time units
//! - **Timestamp Utilities**: second, millisecond and nanosecond resolution, plus a
//!   strictly increasing nanosecond clock ([`NanoClock`]) for broker-side `created` stamps
//! - **Counter Implementation**: Thread-safe current/max counter ([`Counter`])
//!
//! ## Usage Examples:
//! ```rust
//! use mfabric_utils::{Bytesize, to_duration};
//!
//! let size = Bytesize::from("64K");
//! assert_eq!(size.as_usize(), 65536);
//!
//! let duration = to_duration("1h30m15s");
//! assert_eq!(duration.as_secs(), 5415);
//! ```

#![deny(unsafe_code)]

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde::{de::Deserializer, ser::Serializer, Deserialize, Serialize};

mod counter;

pub use counter::Counter;

/// Timestamp representation in seconds since Unix epoch
pub type Timestamp = i64;

/// Timestamp representation in milliseconds since Unix epoch
pub type TimestampMillis = i64;

/// Timestamp representation in nanoseconds since Unix epoch
pub type TimestampNanos = i64;

const BYTESIZE_K: usize = 1024;
const BYTESIZE_M: usize = 1048576;
const BYTESIZE_G: usize = 1073741824;

/// Human-readable byte size representation with parsing/serialization support
///
/// # Example:
/// ```
/// use mfabric_utils::Bytesize;
///
/// let size = Bytesize::from("2G512M");
/// assert_eq!(size.as_usize(), 2_684_354_560);
///
/// let size = Bytesize::from(1024);
/// assert_eq!(size.string(), "1K");
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Bytesize(pub usize);

impl Bytesize {
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0 as u64
    }

    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }

    /// Format bytesize to human-readable string, e.g. `2G1M`
    #[inline]
    pub fn string(&self) -> String {
        let mut v = self.0;
        let mut res = String::new();

        for (unit, size) in [('G', BYTESIZE_G), ('M', BYTESIZE_M), ('K', BYTESIZE_K)] {
            let n = v / size;
            if n > 0 {
                res.push_str(&format!("{}{}", n, unit));
                v %= size;
            }
        }

        if v > 0 || res.is_empty() {
            res.push_str(&format!("{}B", v));
        }

        res
    }
}

impl Deref for Bytesize {
    type Target = usize;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Bytesize {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<usize> for Bytesize {
    fn from(v: usize) -> Self {
        Bytesize(v)
    }
}

impl From<&str> for Bytesize {
    fn from(v: &str) -> Self {
        Bytesize(to_bytesize(v))
    }
}

impl fmt::Debug for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.string())
    }
}

impl fmt::Display for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.string())
    }
}

impl Serialize for Bytesize {
    #[inline]
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.string())
    }
}

impl<'de> Deserialize<'de> for Bytesize {
    #[inline]
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(usize),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(Bytesize(n)),
            Raw::Text(s) => Ok(Bytesize(to_bytesize(&s))),
        }
    }
}

/// Parse human-readable byte size string to usize
///
/// ```
/// assert_eq!(mfabric_utils::to_bytesize("2G512K"), 2148007936);
/// assert_eq!(mfabric_utils::to_bytesize("1MB"), 1048576);
/// ```
#[inline]
pub fn to_bytesize(text: &str) -> usize {
    let text = text.to_uppercase().replace("GB", "G").replace("MB", "M").replace("KB", "K");
    text.split_inclusive(['G', 'M', 'K', 'B'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            if u.is_ascii_digit() {
                return x.parse::<usize>().unwrap_or(0);
            }
            let v = match chars.as_str().parse::<usize>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'B' => v,
                'K' => v * BYTESIZE_K,
                'M' => v * BYTESIZE_M,
                'G' => v * BYTESIZE_G,
                _ => 0,
            }
        })
        .sum()
}

/// Convert human-readable duration string to Duration
///
/// Supported units: `ms`, `s`, `m`, `h`, `d`, `w`.
///
/// ```
/// let duration = mfabric_utils::to_duration("1h30m15s");
/// assert_eq!(duration.as_secs(), 5415);
///
/// let short = mfabric_utils::to_duration("100ms");
/// assert_eq!(short.as_millis(), 100);
/// ```
#[inline]
pub fn to_duration(text: &str) -> Duration {
    let text = text.trim().to_lowercase().replace("ms", "Y");
    let ms: u64 = text
        .split_inclusive(['s', 'm', 'h', 'd', 'w', 'Y'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().parse::<u64>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'Y' => v,
                's' => v * 1000,
                'm' => v * 60000,
                'h' => v * 3600000,
                'd' => v * 86400000,
                'w' => v * 604800000,
                _ => 0,
            }
        })
        .sum();
    Duration::from_millis(ms)
}

/// Deserialize Duration from human-readable string format
#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

/// Deserialize optional Duration from string, empty string is `None`
#[inline]
pub fn deserialize_duration_option<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<String>::deserialize(deserializer)?;
    match v {
        Some(v) if !v.is_empty() => Ok(Some(to_duration(&v))),
        _ => Ok(None),
    }
}

/// Get current timestamp as Duration since the Unix epoch
#[inline]
pub fn timestamp() -> Duration {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_else(|_| {
        let now = chrono::Local::now();
        Duration::new(now.timestamp() as u64, now.timestamp_subsec_nanos())
    })
}

/// Get current timestamp in seconds
///
/// ```
/// assert!(mfabric_utils::timestamp_secs() > 0);
/// ```
#[inline]
pub fn timestamp_secs() -> Timestamp {
    timestamp().as_secs() as i64
}

/// Get current timestamp in nanoseconds
#[inline]
pub fn timestamp_nanos() -> TimestampNanos {
    timestamp().as_nanos() as i64
}

/// Wall-clock nanosecond source that never goes backwards.
///
/// Two calls on the same clock always return strictly increasing values,
/// even when the system clock steps back or two calls land in the same
/// nanosecond.
///
/// ```
/// let clock = mfabric_utils::NanoClock::new();
/// let a = clock.now();
/// let b = clock.now();
/// assert!(b > a);
/// ```
#[derive(Debug, Default)]
pub struct NanoClock {
    last: AtomicI64,
}

impl NanoClock {
    #[inline]
    pub fn new() -> Self {
        Self { last: AtomicI64::new(0) }
    }

    #[inline]
    pub fn now(&self) -> TimestampNanos {
        let wall = timestamp_nanos();
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let next = if wall > prev { wall } else { prev + 1 };
            match self.last.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}
