//! Metrics sinks.
//!
//! The scheduler reports one duration observation per invocation through a
//! [`MetricsSink`]. Test functions reach the same sink through
//! [`TestContext::metrics`](crate::TestContext::metrics) for their own
//! domain metrics. Flushing or scraping is the sink's concern.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
use tracing::warn;

use crate::error::SinkError;

/// A metric dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Destination for named duration observations.
///
/// Implementations must be safe for concurrent use.
pub trait MetricsSink: Send + Sync {
    /// Record one observation of `value` under `name` with `tags`.
    fn observe(&self, name: &str, value: Duration, tags: &[Tag]);
}

// =============================================================================
// Prometheus
// =============================================================================

const HISTOGRAM_HELP: &str = "Duration of canary observations in seconds";

/// Sorted `(label, value)` pairs identifying one series.
type SeriesKey = Vec<(String, String)>;

/// Prometheus-backed sink.
///
/// Each observation name becomes a histogram `<namespace>_<name>_seconds`
/// labelled by the tags. Different observations of the same name may carry
/// different tag keys; each distinct tag set is its own series and a label
/// missing from a series reads as empty, as Prometheus treats absent labels.
pub struct PrometheusSink {
    registry: Registry,
    namespace: String,
    const_tags: Vec<Tag>,
    families: Mutex<HashMap<String, SeriesCollector>>,
}

impl PrometheusSink {
    /// Create a sink registering into `registry` with metric names prefixed
    /// by `namespace`.
    pub fn new(registry: Registry, namespace: impl Into<String>) -> Self {
        Self {
            registry,
            namespace: namespace.into(),
            const_tags: Vec::new(),
            families: Mutex::new(HashMap::new()),
        }
    }

    /// Attach `tags` to every observation (for example the build version).
    pub fn with_const_tags(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.const_tags.extend(tags);
        self
    }

    /// The registry observations are recorded into.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the registry in the Prometheus text format.
    pub fn encode(&self) -> Result<String, SinkError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    fn families(&self) -> MutexGuard<'_, HashMap<String, SeriesCollector>> {
        self.families
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn metric_name(&self, name: &str) -> String {
        let raw = if self.namespace.is_empty() {
            format!("{name}_seconds")
        } else {
            format!("{}_{name}_seconds", self.namespace)
        };
        sanitize(&raw, true)
    }

    /// Const tags then `tags`, sanitized. The first occurrence of a key wins.
    fn series_key(&self, tags: &[Tag]) -> SeriesKey {
        let mut labels = BTreeMap::new();
        for tag in self.const_tags.iter().chain(tags) {
            labels
                .entry(sanitize(&tag.key, false))
                .or_insert_with(|| tag.value.clone());
        }
        labels.into_iter().collect()
    }

    /// The collector for `metric`, registering it on first use.
    fn family(&self, metric: &str) -> Result<SeriesCollector, prometheus::Error> {
        let mut families = self.families();
        if let Some(family) = families.get(metric) {
            return Ok(family.clone());
        }

        let family = SeriesCollector::new(metric)?;
        self.registry.register(Box::new(family.clone()))?;
        families.insert(metric.to_string(), family.clone());
        Ok(family)
    }
}

impl Default for PrometheusSink {
    /// Sink with its own registry and the `canary` namespace.
    fn default() -> Self {
        Self::new(Registry::new(), "canary")
    }
}

impl MetricsSink for PrometheusSink {
    fn observe(&self, name: &str, value: Duration, tags: &[Tag]) {
        let metric = self.metric_name(name);
        let key = self.series_key(tags);

        let observed = self
            .family(&metric)
            .and_then(|family| family.series(key))
            .map(|histogram| histogram.observe(value.as_secs_f64()));

        if let Err(e) = observed {
            warn!(metric = %metric, error = %e, "Dropping observation");
        }
    }
}

/// One histogram family whose series may differ in label names.
///
/// Registered under a label-less descriptor; each series is a histogram
/// with its tags as const labels. The registry merges the families of all
/// series into one when gathering.
#[derive(Clone)]
struct SeriesCollector {
    desc: Desc,
    series: Arc<Mutex<BTreeMap<SeriesKey, Histogram>>>,
}

impl SeriesCollector {
    fn new(metric: &str) -> Result<Self, prometheus::Error> {
        let desc = Desc::new(
            metric.to_string(),
            HISTOGRAM_HELP.to_string(),
            Vec::new(),
            HashMap::new(),
        )?;
        Ok(Self {
            desc,
            series: Arc::new(Mutex::new(BTreeMap::new())),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<SeriesKey, Histogram>> {
        self.series
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn series(&self, key: SeriesKey) -> Result<Histogram, prometheus::Error> {
        let mut series = self.lock();
        if let Some(histogram) = series.get(&key) {
            return Ok(histogram.clone());
        }

        let opts = HistogramOpts::new(self.desc.fq_name.clone(), HISTOGRAM_HELP)
            .const_labels(key.iter().cloned().collect());
        let histogram = Histogram::with_opts(opts)?;
        series.insert(key, histogram.clone());
        Ok(histogram)
    }
}

impl Collector for SeriesCollector {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.desc]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.lock()
            .values()
            .flat_map(|histogram| histogram.collect())
            .collect()
    }
}

/// Map `raw` onto the Prometheus name charset.
fn sanitize(raw: &str, allow_colon: bool) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || (allow_colon && c == ':') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

// =============================================================================
// In-memory
// =============================================================================

/// One recorded observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub name: String,
    pub value: Duration,
    pub tags: Vec<Tag>,
}

impl Observation {
    /// Value of the first tag with `key`.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.key == key)
            .map(|tag| tag.value.as_str())
    }
}

/// Sink that keeps every observation in memory. Useful in tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    observations: Mutex<Vec<Observation>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything observed so far.
    pub fn observations(&self) -> Vec<Observation> {
        self.observations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of observations named `name` carrying `key=value`.
    pub fn count(&self, name: &str, key: &str, value: &str) -> usize {
        self.observations()
            .iter()
            .filter(|o| o.name == name && o.tag(key) == Some(value))
            .count()
    }
}

impl MetricsSink for MemorySink {
    fn observe(&self, name: &str, value: Duration, tags: &[Tag]) {
        self.observations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Observation {
                name: name.to_string(),
                value,
                tags: tags.to_vec(),
            });
    }
}
