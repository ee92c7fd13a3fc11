//! Wall-clock time and cluster timestamp functionality.
//!
//! [`TimeProvider`] abstracts the wall clock so that background scanners and
//! lease trackers can be driven deterministically in tests.
//! [`TimestampProvider`] issues the monotonically increasing, cluster-tagged
//! timestamps that order transactions across cells.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// An instant in wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Time(DateTime<Utc>);

impl Time {
    /// Construct from nanoseconds since the unix epoch.
    pub fn from_timestamp_nanos(nanos: i64) -> Self {
        Self(Utc.timestamp_nanos(nanos))
    }

    /// Nanoseconds since the unix epoch.
    pub fn timestamp_nanos(&self) -> i64 {
        self.0.timestamp_nanos()
    }

    /// The duration elapsed since `earlier`, or `None` if `earlier` is in the
    /// future.
    pub fn checked_duration_since(&self, earlier: Self) -> Option<Duration> {
        (self.0 - earlier.0).to_std().ok()
    }

    /// This instant advanced by `duration`.
    pub fn add(self, duration: Duration) -> Self {
        Self(self.0 + chrono::Duration::from_std(duration).expect("duration overflow"))
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// A source of wall-clock time.
pub trait TimeProvider: fmt::Debug + Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> Time;
}

/// [`TimeProvider`] backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider;

impl SystemProvider {
    /// Create a new system clock provider.
    pub fn new() -> Self {
        Self
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// A [`TimeProvider`] whose notion of "now" is advanced manually.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Create a provider frozen at `now`.
    pub fn new(now: Time) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    /// Move the clock forward by `duration`.
    pub fn inc(&self, duration: Duration) {
        let mut now = self.now.write();
        *now = now.add(duration);
    }

    /// Set the clock to an absolute instant.
    pub fn set(&self, time: Time) {
        *self.now.write() = time;
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}

/// A cluster-wide logical timestamp.
///
/// Timestamps are totally ordered within the clock domain identified by a
/// [`ClusterTag`]. [`Timestamp::NULL`] marks "no timestamp".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The absent timestamp.
    pub const NULL: Self = Self(0);
    /// The smallest valid timestamp.
    pub const MIN: Self = Self(1);
    /// The largest representable timestamp.
    pub const MAX: Self = Self(u64::MAX);

    /// Raw value accessor.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identifies the clock domain a timestamp was generated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterTag(pub u16);

impl ClusterTag {
    /// Tag of timestamps whose origin is unknown; never validated against.
    pub const INVALID: Self = Self(0);
}

impl fmt::Display for ClusterTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issues monotonically increasing cluster timestamps.
pub trait TimestampProvider: fmt::Debug + Send + Sync + 'static {
    /// Generate the next timestamp. Strictly greater than all previously
    /// generated or observed timestamps.
    fn generate(&self) -> Timestamp;

    /// The latest timestamp issued so far.
    fn latest(&self) -> Timestamp;

    /// The clock domain of this provider.
    fn cluster_tag(&self) -> ClusterTag;
}

/// An in-process [`TimestampProvider`].
///
/// Serves both production single-cell deployments and tests; multi-cell
/// deployments substitute a provider backed by the cluster timestamp service.
#[derive(Debug)]
pub struct LocalTimestampProvider {
    tag: ClusterTag,
    latest: AtomicU64,
}

impl LocalTimestampProvider {
    /// Create a provider for `tag` starting at [`Timestamp::MIN`].
    pub fn new(tag: ClusterTag) -> Self {
        Self {
            tag,
            latest: AtomicU64::new(Timestamp::MIN.0),
        }
    }

    /// Advance the provider past an externally observed timestamp.
    pub fn observe(&self, timestamp: Timestamp) {
        self.latest.fetch_max(timestamp.0, Ordering::SeqCst);
    }
}

impl TimestampProvider for LocalTimestampProvider {
    fn generate(&self) -> Timestamp {
        Timestamp(self.latest.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn latest(&self) -> Timestamp {
        Timestamp(self.latest.load(Ordering::SeqCst))
    }

    fn cluster_tag(&self) -> ClusterTag {
        self.tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_provider_advances() {
        let provider = MockProvider::new(Time::from_timestamp_nanos(0));
        assert_eq!(provider.now().timestamp_nanos(), 0);

        provider.inc(Duration::from_nanos(42));
        assert_eq!(provider.now().timestamp_nanos(), 42);

        let earlier = Time::from_timestamp_nanos(10);
        assert_eq!(
            provider.now().checked_duration_since(earlier),
            Some(Duration::from_nanos(32))
        );
        assert_eq!(earlier.checked_duration_since(provider.now()), None);
    }

    #[test]
    fn timestamps_are_strictly_increasing() {
        let provider = LocalTimestampProvider::new(ClusterTag(7));
        let a = provider.generate();
        let b = provider.generate();
        assert!(b > a);
        assert_eq!(provider.latest(), b);
        assert_eq!(provider.cluster_tag(), ClusterTag(7));
    }

    #[test]
    fn observe_skips_forward() {
        let provider = LocalTimestampProvider::new(ClusterTag(1));
        provider.observe(Timestamp(1000));
        assert!(provider.generate() > Timestamp(1000));
    }
}
