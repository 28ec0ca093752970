//! Sample collection and aggregation.
//!
//! Every virtual user records [`Sample`]s into one shared [`MetricRegistry`].
//! The registry keeps a [`Series`] per metric name + tag set and is sharded so
//! concurrent producers rarely touch the same lock. Aggregation per series is
//! commutative, so samples from different virtual users may land in any order.
//!
//! Percentiles come from a capped reservoir (algorithm R): while a series has
//! seen at most [`DEFAULT_RESERVOIR_CAP`] samples the reservoir holds every
//! value and percentiles are exact; beyond that each sample is kept with
//! probability `cap / seen`, an unbiased sample of the whole stream. The
//! reported percentile is the nearest-rank value over the sorted reservoir.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Instant;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Built-in series names recorded by the engine itself.
pub mod names {
    /// Wall-clock latency of each HTTP call, in milliseconds. Tagged with
    /// `status` and `expected_response`.
    pub const REQUEST_DURATION: &str = "http_req_duration";
    /// 0/1 per HTTP call; 1 when the call failed or returned an unexpected
    /// status. Failures carry a `reason` tag.
    pub const REQUEST_FAILED: &str = "http_req_failed";
    /// 0/1 per named check, tagged `check`.
    pub const CHECKS: &str = "checks";
    /// 1 per completed iteration, tagged `status` (`ok` or `error`).
    pub const ITERATIONS: &str = "iterations";
    /// Live virtual-user count, recorded once per control tick.
    pub const VUS: &str = "vus";
}

/// Reservoir size per series. Below this every percentile is exact.
pub const DEFAULT_RESERVOIR_CAP: usize = 16_384;

const SHARDS: usize = 16;

/// Identity of a series: metric name plus its full tag set.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetricKey {
    pub name: String,
    pub tags: BTreeMap<String, String>,
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.tags.is_empty() {
            write!(f, "{{")?;
            for (i, (k, v)) in self.tags.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{k}:{v}")?;
            }
            write!(f, "}}")?;
        }
        Ok(())
    }
}

/// One recorded observation. Immutable once constructed.
#[derive(Clone, Debug)]
pub struct Sample {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub value: f64,
    pub at: Instant,
}

impl Sample {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
            value,
            at: Instant::now(),
        }
    }

    pub fn with_tags(name: impl Into<String>, value: f64, tags: &[(&str, &str)]) -> Self {
        let mut sample = Self::new(name, value);
        sample.tags = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sample
    }
}

struct Reservoir {
    values: Vec<f64>,
    cap: usize,
    seen: u64,
    rng: SmallRng,
}

impl Reservoir {
    fn new(cap: usize) -> Self {
        Self {
            values: Vec::new(),
            cap,
            seen: 0,
            rng: SmallRng::from_entropy(),
        }
    }

    fn offer(&mut self, value: f64) {
        self.seen += 1;
        if self.values.len() < self.cap {
            self.values.push(value);
        } else {
            let slot = self.rng.gen_range(0..self.seen);
            if (slot as usize) < self.cap {
                self.values[slot as usize] = value;
            }
        }
    }
}

struct Series {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    nonzero: u64,
    reservoir: Reservoir,
}

impl Series {
    fn new(reservoir_cap: usize) -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            nonzero: 0,
            reservoir: Reservoir::new(reservoir_cap),
        }
    }

    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        if value != 0.0 {
            self.nonzero += 1;
        }
        self.reservoir.offer(value);
    }

    fn snapshot(&self) -> SeriesSnapshot {
        let mut values = self.reservoir.values.clone();
        values.sort_by(|a, b| a.total_cmp(b));
        SeriesSnapshot {
            count: self.count,
            sum: self.sum,
            min: (self.count > 0).then_some(self.min),
            max: (self.count > 0).then_some(self.max),
            nonzero: self.nonzero,
            values,
        }
    }
}

/// Point-in-time view of one series. Each snapshot is taken under the series'
/// shard lock, so it never observes a half-applied sample.
#[derive(Clone, Debug, Default)]
pub struct SeriesSnapshot {
    pub count: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub nonzero: u64,
    /// Reservoir contents, sorted ascending.
    pub values: Vec<f64>,
}

impl SeriesSnapshot {
    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Fraction of samples with a non-zero value. For 0/1 series this is the
    /// hit rate.
    pub fn rate(&self) -> Option<f64> {
        (self.count > 0).then(|| self.nonzero as f64 / self.count as f64)
    }

    /// Nearest-rank percentile over the reservoir, `p` in `[0, 100]`.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        let n = self.values.len();
        let rank = ((p / 100.0) * n as f64).ceil() as usize;
        Some(self.values[rank.clamp(1, n) - 1])
    }

    /// Combine two snapshots of the same metric name into one view.
    pub fn merge(mut self, other: &SeriesSnapshot) -> SeriesSnapshot {
        self.count += other.count;
        self.sum += other.sum;
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.nonzero += other.nonzero;
        self.values.extend_from_slice(&other.values);
        self.values.sort_by(|a, b| a.total_cmp(b));
        self
    }
}

/// Consistent view of every series at one point in time.
#[derive(Clone, Debug, Default)]
pub struct MetricsSnapshot {
    pub series: BTreeMap<MetricKey, SeriesSnapshot>,
}

impl MetricsSnapshot {
    /// Merged view of every series with the given name, regardless of tags.
    pub fn get(&self, name: &str) -> Option<SeriesSnapshot> {
        self.merged(|key| key.name == name)
    }

    /// Merged view of every series matching `filter`.
    pub fn merged(&self, filter: impl Fn(&MetricKey) -> bool) -> Option<SeriesSnapshot> {
        let mut merged: Option<SeriesSnapshot> = None;
        for (key, series) in &self.series {
            if filter(key) {
                merged = Some(match merged {
                    Some(acc) => acc.merge(series),
                    None => series.clone(),
                });
            }
        }
        merged
    }
}

/// Shared, concurrently-writable sample store.
///
/// Sharded by key hash; each record takes one short critical section on its
/// shard. NaN values are dropped rather than poisoning min/max/percentiles.
pub struct MetricRegistry {
    shards: Vec<Mutex<HashMap<MetricKey, Series>>>,
    reservoir_cap: usize,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::with_reservoir_cap(DEFAULT_RESERVOIR_CAP)
    }

    pub fn with_reservoir_cap(reservoir_cap: usize) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            reservoir_cap,
        }
    }

    pub fn record(&self, sample: Sample) {
        if sample.value.is_nan() {
            tracing::debug!(metric = %sample.name, "dropping NaN sample");
            return;
        }
        let key = MetricKey {
            name: sample.name,
            tags: sample.tags,
        };
        let mut shard = self.shards[self.shard_index(&key)].lock();
        shard
            .entry(key)
            .or_insert_with(|| Series::new(self.reservoir_cap))
            .record(sample.value);
    }

    pub fn add(&self, name: &str, value: f64) {
        self.record(Sample::new(name, value));
    }

    pub fn add_tagged(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.record(Sample::with_tags(name, value, tags));
    }

    /// Take a snapshot of every series. Consistency is per series: each one is
    /// copied under its shard lock, so no sample is half-applied.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut out = BTreeMap::new();
        for shard in &self.shards {
            let shard = shard.lock();
            for (key, series) in shard.iter() {
                out.insert(key.clone(), series.snapshot());
            }
        }
        MetricsSnapshot { series: out }
    }

    fn shard_index(&self, key: &MetricKey) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as usize % SHARDS
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}
