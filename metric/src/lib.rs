//! An in-process metric registry.
//!
//! Components register named metrics once and then obtain cheap recorders for
//! a given attribute set. Observers fetch the current value for assertions and
//! exposition.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::Mutex;
use std::{
    any::Any,
    borrow::Cow,
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// A set of key-value attributes identifying one time series of a metric.
///
/// Keys and values are stored sorted so that equal attribute sets compare
/// equal regardless of construction order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Attributes(BTreeMap<&'static str, Cow<'static, str>>);

impl Attributes {
    /// Insert or replace an attribute.
    pub fn insert(&mut self, key: &'static str, value: impl Into<Cow<'static, str>>) {
        self.0.insert(key, value.into());
    }
}

impl<const N: usize> From<&[(&'static str, &'static str); N]> for Attributes {
    fn from(attributes: &[(&'static str, &'static str); N]) -> Self {
        Self(
            attributes
                .iter()
                .map(|(k, v)| (*k, Cow::Borrowed(*v)))
                .collect(),
        )
    }
}

impl From<&[(&'static str, &'static str)]> for Attributes {
    fn from(attributes: &[(&'static str, &'static str)]) -> Self {
        Self(
            attributes
                .iter()
                .map(|(k, v)| (*k, Cow::Borrowed(*v)))
                .collect(),
        )
    }
}

/// A recorder/observer pair for one time series.
///
/// Implementations are cheap handles onto shared state: cloning a recorder
/// and fetching through any clone observes the same series.
pub trait MetricObserver: Clone + Default + std::fmt::Debug + Send + Sync + 'static {
    /// The value reported by [`MetricObserver::fetch`].
    type Recorded;

    /// Return the current value of this series.
    fn fetch(&self) -> Self::Recorded;
}

/// A monotonic counter of `u64` values.
#[derive(Debug, Clone, Default)]
pub struct U64Counter(Arc<AtomicU64>);

impl U64Counter {
    /// Increment the counter by `count`.
    pub fn inc(&self, count: u64) {
        self.0.fetch_add(count, Ordering::Relaxed);
    }
}

impl MetricObserver for U64Counter {
    type Recorded = u64;

    fn fetch(&self) -> Self::Recorded {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge of `u64` values that can move in both directions.
#[derive(Debug, Clone, Default)]
pub struct U64Gauge(Arc<AtomicU64>);

impl U64Gauge {
    /// Set the gauge to `value`.
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Increment the gauge by `delta`.
    pub fn inc(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    /// Decrement the gauge by `delta`, saturating at zero.
    pub fn dec(&self, delta: u64) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(delta);
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

impl MetricObserver for U64Gauge {
    type Recorded = u64;

    fn fetch(&self) -> Self::Recorded {
        self.0.load(Ordering::Relaxed)
    }
}

/// A named metric: a family of series distinguished by [`Attributes`].
#[derive(Debug)]
pub struct Metric<T: MetricObserver> {
    name: &'static str,
    description: &'static str,
    series: Arc<Mutex<HashMap<Attributes, T>>>,
}

impl<T: MetricObserver> Clone for Metric<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            description: self.description,
            series: Arc::clone(&self.series),
        }
    }
}

impl<T: MetricObserver> Metric<T> {
    fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            series: Default::default(),
        }
    }

    /// The registered metric name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The registered help text.
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Return the recorder for the series identified by `attributes`,
    /// creating it on first use.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T {
        let attributes = attributes.into();
        let mut series = self.series.lock();
        series.entry(attributes).or_default().clone()
    }

    /// Return the observer for an existing series, if any.
    pub fn get_observer(&self, attributes: &Attributes) -> Option<T> {
        self.series.lock().get(attributes).cloned()
    }
}

/// The process-wide metric registry.
///
/// Re-registering a metric with the same name returns the existing instance;
/// registering the same name with a different observer type panics, as that
/// is a programming error.
#[derive(Debug, Default)]
pub struct Registry {
    metrics: Mutex<HashMap<&'static str, Box<dyn Any + Send + Sync>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Default::default()
    }

    /// Register (or look up) a metric of observer type `T`.
    pub fn register_metric<T: MetricObserver>(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Metric<T> {
        let mut metrics = self.metrics.lock();
        let slot = metrics
            .entry(name)
            .or_insert_with(|| Box::new(Metric::<T>::new(name, description)));
        slot.downcast_ref::<Metric<T>>()
            .unwrap_or_else(|| panic!("metric {name} already registered with a different type"))
            .clone()
    }

    /// Look up a previously registered metric.
    pub fn get_instrument<T: MetricObserver>(&self, name: &'static str) -> Option<Metric<T>> {
        self.metrics
            .lock()
            .get(name)
            .and_then(|m| m.downcast_ref::<Metric<T>>())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_series_are_shared_by_attributes() {
        let registry = Registry::new();
        let metric: Metric<U64Counter> =
            registry.register_metric("requests", "number of requests handled");

        let ok = metric.recorder(&[("outcome", "ok")]);
        let err = metric.recorder(&[("outcome", "error")]);
        ok.inc(2);
        ok.inc(1);
        err.inc(5);

        // A second recorder for the same attributes observes the same series.
        assert_eq!(metric.recorder(&[("outcome", "ok")]).fetch(), 3);
        assert_eq!(
            metric
                .get_observer(&Attributes::from(&[("outcome", "error")]))
                .unwrap()
                .fetch(),
            5
        );
        assert!(metric
            .get_observer(&Attributes::from(&[("outcome", "missing")]))
            .is_none());
    }

    #[test]
    fn registry_returns_existing_metric() {
        let registry = Registry::new();
        let a: Metric<U64Counter> = registry.register_metric("hits", "hit count");
        a.recorder(&[("k", "v")]).inc(7);

        let b: Metric<U64Counter> = registry.register_metric("hits", "hit count");
        assert_eq!(b.recorder(&[("k", "v")]).fetch(), 7);

        let found = registry.get_instrument::<U64Counter>("hits").unwrap();
        assert_eq!(found.recorder(&[("k", "v")]).fetch(), 7);
        assert!(registry.get_instrument::<U64Counter>("absent").is_none());
    }

    #[test]
    fn gauge_moves_both_ways() {
        let registry = Registry::new();
        let metric: Metric<U64Gauge> = registry.register_metric("queue_depth", "queued entries");
        let gauge = metric.recorder(&[("queue", "refresh")]);

        gauge.set(10);
        gauge.inc(5);
        gauge.dec(3);
        assert_eq!(gauge.fetch(), 12);

        gauge.dec(100);
        assert_eq!(gauge.fetch(), 0);
    }
}
