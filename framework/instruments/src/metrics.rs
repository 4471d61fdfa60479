mod tags;
mod value;

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use tags::{MetricRef, TagSelector, Tags};
pub use value::{CounterValue, GaugeValue, MetricValue, RateValue, TrendValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
    Gauge,
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Rate => write!(f, "rate"),
            MetricKind::Trend => write!(f, "trend"),
            MetricKind::Gauge => write!(f, "gauge"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Metric `{name}` is registered as a {existing}, cannot use it as a {requested}")]
    KindMismatch {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },
    #[error("Invalid value {value} for metric `{name}`: {reason}")]
    InvalidValue {
        name: String,
        value: f64,
        reason: String,
    },
    #[error("Metrics registry is frozen, rejected write to `{0}`")]
    Frozen(String),
    #[error("Invalid metric name `{0}`, use letters, digits, `_`, `.` or `-`")]
    InvalidName(String),
    #[error("Invalid metric reference `{reference}`: {reason}")]
    InvalidReference { reference: String, reason: String },
    #[error("Unknown metric `{0}`")]
    UnknownMetric(String),
    #[error("Could not create histogram: {0}")]
    Histogram(String),
    #[error("Metrics registry must be frozen before it is summarised")]
    NotFrozen,
}

#[derive(Debug)]
struct SubMetric {
    selector: TagSelector,
    value: Mutex<MetricValue>,
}

#[derive(Debug)]
struct MetricEntry {
    name: String,
    kind: MetricKind,
    value: Mutex<MetricValue>,
    submetrics: RwLock<Vec<Arc<SubMetric>>>,
}

impl MetricEntry {
    fn new(name: &str, kind: MetricKind) -> Result<Self, MetricsError> {
        Ok(Self {
            name: name.to_string(),
            kind,
            value: Mutex::new(MetricValue::new(kind)?),
            submetrics: RwLock::new(Vec::new()),
        })
    }

    fn write(&self, frozen: &AtomicBool, value: f64, tags: &Tags) -> Result<(), MetricsError> {
        MetricValue::validate(self.kind, &self.name, value)?;

        // The frozen flag is checked under the value lock. `freeze` takes every lock once after
        // raising the flag, so a write either lands before the freeze completes or is rejected.
        // Sub-metrics are updated before the parent lock is released so that a frozen registry
        // never holds a sample in the parent that its sub-metrics are missing.
        let mut parent = self.value.lock();
        if frozen.load(Ordering::Acquire) {
            return Err(MetricsError::Frozen(self.name.clone()));
        }
        parent.add(value);
        for sub in self.submetrics.read().iter() {
            if sub.selector.matches(tags) {
                sub.value.lock().add(value);
            }
        }

        Ok(())
    }
}

/// The single store for every metric in a run.
///
/// Metrics are created on first reference, or ahead of time with [MetricsRegistry::register], and
/// keep the kind they were created with. Each metric has its own lock so VUs writing to different
/// metrics never contend with each other.
///
/// Once [MetricsRegistry::freeze] has been called the registry is read-only.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    metrics: RwLock<BTreeMap<String, Arc<MetricEntry>>>,
    frozen: Arc<AtomicBool>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str, kind: MetricKind) -> Result<Arc<MetricEntry>, MetricsError> {
        if let Some(existing) = self.metrics.read().get(name) {
            return Self::check_kind(existing, kind);
        }

        tags::validate_metric_name(name)?;
        if self.is_frozen() {
            return Err(MetricsError::Frozen(name.to_string()));
        }

        let mut metrics = self.metrics.write();
        // Another writer may have created it between dropping the read lock and taking the write lock
        if let Some(existing) = metrics.get(name) {
            return Self::check_kind(existing, kind);
        }

        log::trace!("Registering {kind} metric `{name}`");
        let entry = Arc::new(MetricEntry::new(name, kind)?);
        metrics.insert(name.to_string(), entry.clone());
        Ok(entry)
    }

    fn check_kind(
        existing: &Arc<MetricEntry>,
        requested: MetricKind,
    ) -> Result<Arc<MetricEntry>, MetricsError> {
        if existing.kind == requested {
            Ok(existing.clone())
        } else {
            Err(MetricsError::KindMismatch {
                name: existing.name.clone(),
                existing: existing.kind,
                requested,
            })
        }
    }

    /// Declare a metric. Declaring the same metric again with the same kind does nothing.
    pub fn register(&self, name: &str, kind: MetricKind) -> Result<(), MetricsError> {
        self.entry(name, kind).map(|_| ())
    }

    /// Record a single sample, creating the metric if this is the first time it is referenced.
    ///
    /// For a [MetricKind::Rate] any non-zero value counts as true.
    pub fn record(
        &self,
        name: &str,
        kind: MetricKind,
        value: f64,
        tags: &Tags,
    ) -> Result<(), MetricsError> {
        self.entry(name, kind)?.write(&self.frozen, value, tags)
    }

    pub fn counter(&self, name: &str) -> Result<Counter, MetricsError> {
        Ok(Counter(self.handle(name, MetricKind::Counter)?))
    }

    pub fn rate(&self, name: &str) -> Result<Rate, MetricsError> {
        Ok(Rate(self.handle(name, MetricKind::Rate)?))
    }

    pub fn trend(&self, name: &str) -> Result<Trend, MetricsError> {
        Ok(Trend(self.handle(name, MetricKind::Trend)?))
    }

    pub fn gauge(&self, name: &str) -> Result<Gauge, MetricsError> {
        Ok(Gauge(self.handle(name, MetricKind::Gauge)?))
    }

    fn handle(&self, name: &str, kind: MetricKind) -> Result<Handle, MetricsError> {
        Ok(Handle {
            entry: self.entry(name, kind)?,
            frozen: self.frozen.clone(),
        })
    }

    /// Start tracking the samples of an existing metric that match the reference's tag selector.
    ///
    /// Only samples recorded after this call are counted, so sub-metrics should be added before
    /// the run starts. Adding the same selector twice does nothing.
    pub fn add_submetric(&self, reference: &MetricRef) -> Result<(), MetricsError> {
        if !reference.is_submetric() {
            return Ok(());
        }

        let entry = self
            .metrics
            .read()
            .get(&reference.name)
            .cloned()
            .ok_or_else(|| MetricsError::UnknownMetric(reference.name.clone()))?;

        let mut submetrics = entry.submetrics.write();
        if submetrics.iter().any(|s| s.selector == reference.selector) {
            return Ok(());
        }

        log::debug!("Tracking sub-metric `{reference}`");
        submetrics.push(Arc::new(SubMetric {
            selector: reference.selector.clone(),
            value: Mutex::new(MetricValue::new(entry.kind)?),
        }));

        Ok(())
    }

    pub fn kind(&self, name: &str) -> Option<MetricKind> {
        self.metrics.read().get(name).map(|e| e.kind)
    }

    /// A copy of the current value of a metric or sub-metric.
    pub fn value(&self, reference: &MetricRef) -> Option<MetricValue> {
        let entry = self.metrics.read().get(&reference.name).cloned()?;
        if !reference.is_submetric() {
            return Some(entry.value.lock().clone());
        }

        let submetrics = entry.submetrics.read();
        submetrics
            .iter()
            .find(|s| s.selector == reference.selector)
            .map(|s| s.value.lock().clone())
    }

    /// Copies of every metric and sub-metric, keyed by name, with sub-metrics under their full
    /// `name{key:value}` reference.
    pub fn snapshot(&self) -> BTreeMap<String, MetricValue> {
        let metrics = self.metrics.read();
        let mut out = BTreeMap::new();
        for (name, entry) in metrics.iter() {
            let parent = entry.value.lock();
            out.insert(name.clone(), parent.clone());
            for sub in entry.submetrics.read().iter() {
                out.insert(format!("{name}{}", sub.selector), sub.value.lock().clone());
            }
        }
        out
    }

    /// Make the registry read-only. Every write after this returns [MetricsError::Frozen].
    pub fn freeze(&self) {
        if self.frozen.swap(true, Ordering::AcqRel) {
            return;
        }

        // Wait out any write that was already holding a value lock when the flag was raised
        for entry in self.metrics.read().values() {
            drop(entry.value.lock());
        }
        log::debug!("Metrics registry frozen");
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
struct Handle {
    entry: Arc<MetricEntry>,
    frozen: Arc<AtomicBool>,
}

impl Handle {
    fn write(&self, value: f64, tags: &Tags) -> Result<(), MetricsError> {
        self.entry.write(&self.frozen, value, tags)
    }
}

/// A monotonic sum. Only non-negative contributions are accepted.
#[derive(Debug, Clone)]
pub struct Counter(Handle);

impl Counter {
    pub fn add(&self, value: f64, tags: &Tags) -> Result<(), MetricsError> {
        self.0.write(value, tags)
    }

    pub fn incr(&self, tags: &Tags) -> Result<(), MetricsError> {
        self.add(1.0, tags)
    }
}

/// The fraction of samples that were true.
#[derive(Debug, Clone)]
pub struct Rate(Handle);

impl Rate {
    pub fn add(&self, value: bool, tags: &Tags) -> Result<(), MetricsError> {
        self.0.write(if value { 1.0 } else { 0.0 }, tags)
    }
}

/// A distribution of values, summarised with percentiles.
#[derive(Debug, Clone)]
pub struct Trend(Handle);

impl Trend {
    pub fn add(&self, value: f64, tags: &Tags) -> Result<(), MetricsError> {
        self.0.write(value, tags)
    }

    /// Record a duration in milliseconds.
    pub fn add_duration(&self, duration: Duration, tags: &Tags) -> Result<(), MetricsError> {
        self.add(duration.as_secs_f64() * 1000.0, tags)
    }
}

/// The last value written, along with the smallest and largest values seen.
#[derive(Debug, Clone)]
pub struct Gauge(Handle);

impl Gauge {
    pub fn set(&self, value: f64, tags: &Tags) -> Result<(), MetricsError> {
        self.0.write(value, tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::Aggregation;
    use pretty_assertions::assert_eq;
    use std::thread;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn registration_is_idempotent_per_kind() {
        let registry = MetricsRegistry::new();
        registry.register("errors", MetricKind::Counter).unwrap();
        registry.register("errors", MetricKind::Counter).unwrap();

        let err = registry.register("errors", MetricKind::Rate).unwrap_err();
        assert!(matches!(err, MetricsError::KindMismatch { .. }), "{err}");
        assert_eq!(Some(MetricKind::Counter), registry.kind("errors"));
    }

    #[test]
    fn counter_sums_across_threads() {
        let registry = Arc::new(MetricsRegistry::new());

        let workers = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let counter = registry.counter("http_reqs").unwrap();
                    for _ in 0..1000 {
                        counter.incr(&Tags::new()).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for w in workers {
            w.join().unwrap();
        }

        match registry.value(&MetricRef::parse("http_reqs").unwrap()) {
            Some(MetricValue::Counter(c)) => {
                assert_eq!(8000.0, c.sum);
                assert_eq!(8000, c.samples);
            }
            other => panic!("Unexpected value {other:?}"),
        }
    }

    #[test]
    fn negative_counter_is_rejected_without_side_effects() {
        let registry = MetricsRegistry::new();
        let counter = registry.counter("c").unwrap();
        counter.add(2.0, &Tags::new()).unwrap();
        assert!(counter.add(-1.0, &Tags::new()).is_err());
        assert!(counter.add(f64::NAN, &Tags::new()).is_err());

        let value = registry.value(&MetricRef::parse("c").unwrap()).unwrap();
        assert_eq!(
            Some(2.0),
            value.aggregate(&Aggregation::Count, Duration::from_secs(1))
        );
    }

    #[test]
    fn writes_after_freeze_are_rejected() {
        let registry = MetricsRegistry::new();
        let rate = registry.rate("checks").unwrap();
        rate.add(true, &Tags::new()).unwrap();

        registry.freeze();
        assert!(registry.is_frozen());

        assert!(matches!(
            rate.add(false, &Tags::new()),
            Err(MetricsError::Frozen(_))
        ));
        assert!(matches!(
            registry.record("new_metric", MetricKind::Gauge, 1.0, &Tags::new()),
            Err(MetricsError::Frozen(_))
        ));

        match registry.value(&MetricRef::parse("checks").unwrap()) {
            Some(MetricValue::Rate(r)) => assert_eq!(RateValue { trues: 1, total: 1 }, r),
            other => panic!("Unexpected value {other:?}"),
        }
    }

    #[test]
    fn submetric_sees_only_matching_samples() {
        let registry = MetricsRegistry::new();
        let trend = registry.trend("http_req_duration").unwrap();
        let home = MetricRef::parse("http_req_duration{name:home}").unwrap();
        registry.add_submetric(&home).unwrap();

        trend
            .add(100.0, &tags(&[("name", "home"), ("method", "GET")]))
            .unwrap();
        trend.add(900.0, &tags(&[("name", "search")])).unwrap();

        let elapsed = Duration::from_secs(1);
        let parent = registry
            .value(&MetricRef::parse("http_req_duration").unwrap())
            .unwrap();
        assert_eq!(Some(2.0), parent.aggregate(&Aggregation::Count, elapsed));

        let sub = registry.value(&home).unwrap();
        assert_eq!(Some(1.0), sub.aggregate(&Aggregation::Count, elapsed));
        assert_eq!(Some(100.0), sub.aggregate(&Aggregation::Max, elapsed));

        let snapshot = registry.snapshot();
        assert!(snapshot.contains_key("http_req_duration{name:home}"));
    }

    #[test]
    fn freeze_leaves_submetrics_consistent_with_parent() {
        let registry = Arc::new(MetricsRegistry::new());
        let counter = registry.counter("http_reqs").unwrap();
        let home = MetricRef::parse("http_reqs{name:home}").unwrap();
        registry.add_submetric(&home).unwrap();

        let workers = (0..4)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    let tags = tags(&[("name", "home")]);
                    while counter.incr(&tags).is_ok() {}
                })
            })
            .collect::<Vec<_>>();

        while registry.snapshot().get("http_reqs").map_or(true, |v| {
            v.aggregate(&Aggregation::Count, Duration::from_secs(1)) < Some(1000.0)
        }) {
            thread::yield_now();
        }
        registry.freeze();
        for w in workers {
            w.join().unwrap();
        }

        let snapshot = registry.snapshot();
        let count = |name: &str| {
            snapshot[name]
                .aggregate(&Aggregation::Count, Duration::from_secs(1))
                .unwrap()
        };
        assert!(count("http_reqs") >= 1000.0);
        assert_eq!(count("http_reqs"), count("http_reqs{name:home}"));
    }

    #[test]
    fn submetric_requires_parent() {
        let registry = MetricsRegistry::new();
        let err = registry
            .add_submetric(&MetricRef::parse("missing{name:x}").unwrap())
            .unwrap_err();
        assert!(matches!(err, MetricsError::UnknownMetric(_)));
    }

    #[test]
    fn invalid_names_are_rejected() {
        let registry = MetricsRegistry::new();
        assert!(matches!(
            registry.register("has space", MetricKind::Counter),
            Err(MetricsError::InvalidName(_))
        ));
    }
}
