//! General-purpose metric collection with JSONL persistence.
//!
//! Thread-safe ring buffer; any subsystem records fire-and-forget data
//! points and queries aggregated summaries (count/mean/min/max/p50/p90/p99).

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Process-wide monotonic origin so `ts` values compare across collectors.
static MONOTONIC_ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);

fn monotonic_now() -> f64 {
    MONOTONIC_ORIGIN.elapsed().as_secs_f64()
}

/// A single metric data point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub tags: HashMap<String, String>,
    /// Seconds since the process monotonic origin.
    pub ts: f64,
    /// Wall-clock ISO 8601 UTC timestamp.
    pub wall_ts: String,
}

/// Aggregated statistics for one metric name.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub name: String,
    pub count: usize,
    pub total: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    pub unit: String,
}

/// Compute the p-th percentile (0–100) using nearest-rank interpolation.
///
/// Fails on an empty slice or out-of-range `p`.
pub fn percentile(values: &[f64], p: f64) -> Result<f64> {
    if values.is_empty() {
        bail!("cannot compute percentile of empty sequence");
    }
    if !(0.0..=100.0).contains(&p) {
        bail!("p must be between 0 and 100, got {p}");
    }

    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    if n == 1 {
        return Ok(sorted[0]);
    }

    let rank = (p / 100.0) * (n - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    let frac = rank - lo as f64;
    Ok(sorted[lo] + frac * (sorted[hi] - sorted[lo]))
}

struct Inner {
    records: Vec<MetricRecord>,
}

/// Metric collector with a bounded in-memory buffer. Share via `Arc`.
pub struct MetricsCollector {
    inner: Mutex<Inner>,
    max_records: usize,
    jsonl_path: Option<PathBuf>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(10_000, None)
    }
}

impl MetricsCollector {
    pub fn new(max_records: usize, jsonl_path: Option<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: Vec::new(),
            }),
            max_records,
            jsonl_path,
        }
    }

    /// Record a metric data point. Drops the oldest points on overflow.
    pub fn record(&self, name: &str, value: f64, unit: &str, tags: HashMap<String, String>) {
        let rec = MetricRecord {
            name: name.to_string(),
            value,
            unit: unit.to_string(),
            tags,
            ts: monotonic_now(),
            wall_ts: Utc::now().to_rfc3339(),
        };

        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.records.push(rec);
        let len = inner.records.len();
        if len > self.max_records {
            inner.records.drain(..len - self.max_records);
        }
    }

    /// Shorthand for untagged recording.
    pub fn record_value(&self, name: &str, value: f64, unit: &str) {
        self.record(name, value, unit, HashMap::new());
    }

    /// Return matching records: by name, by time window (last N seconds of
    /// monotonic time), and by tag superset.
    pub fn get_records(
        &self,
        name: Option<&str>,
        last_seconds: Option<f64>,
        tags: Option<&HashMap<String, String>>,
    ) -> Vec<MetricRecord> {
        let snapshot: Vec<MetricRecord> = {
            let inner = self.inner.lock().expect("metrics lock poisoned");
            inner.records.clone()
        };

        let cutoff = last_seconds.map(|s| monotonic_now() - s);
        snapshot
            .into_iter()
            .filter(|r| name.is_none_or(|n| r.name == n))
            .filter(|r| cutoff.is_none_or(|c| r.ts >= c))
            .filter(|r| {
                tags.is_none_or(|want| want.iter().all(|(k, v)| r.tags.get(k) == Some(v)))
            })
            .collect()
    }

    /// Aggregate stats for one metric name; `None` when nothing matches.
    pub fn summarize(&self, name: &str) -> Option<MetricsSummary> {
        let records = self.get_records(Some(name), None, None);
        if records.is_empty() {
            return None;
        }

        let values: Vec<f64> = records.iter().map(|r| r.value).collect();
        let total: f64 = values.iter().sum();
        let count = values.len();
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

        // Non-empty by construction; percentile cannot fail here.
        Some(MetricsSummary {
            name: name.to_string(),
            count,
            total,
            mean: total / count as f64,
            min,
            max,
            p50: percentile(&values, 50.0).expect("non-empty"),
            p90: percentile(&values, 90.0).expect("non-empty"),
            p99: percentile(&values, 99.0).expect("non-empty"),
            unit: records[0].unit.clone(),
        })
    }

    /// Summaries for every metric name currently buffered.
    pub fn summarize_all(&self) -> Vec<MetricsSummary> {
        self.metric_names()
            .into_iter()
            .filter_map(|name| self.summarize(&name))
            .collect()
    }

    /// Append the buffered records to the JSONL file. Returns records
    /// written; 0 when no path is configured or the buffer is empty.
    pub fn flush(&self) -> Result<usize> {
        let Some(path) = &self.jsonl_path else {
            return Ok(0);
        };

        let snapshot: Vec<MetricRecord> = {
            let inner = self.inner.lock().expect("metrics lock poisoned");
            inner.records.clone()
        };
        if snapshot.is_empty() {
            return Ok(0);
        }

        self.append_jsonl(path, &snapshot)
            .with_context(|| format!("failed to flush metrics to {}", path.display()))?;

        tracing::debug!(count = snapshot.len(), path = %path.display(), "flushed metric records");
        Ok(snapshot.len())
    }

    fn append_jsonl(&self, path: &Path, records: &[MetricRecord]) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        for rec in records {
            serde_json::to_writer(&mut file, rec)?;
            file.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Drop all in-memory records.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.records.clear();
    }

    pub fn count(&self) -> usize {
        self.inner.lock().expect("metrics lock poisoned").records.len()
    }

    /// Sorted list of distinct metric names currently buffered.
    pub fn metric_names(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        let mut names: Vec<String> = inner.records.iter().map(|r| r.name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }
}
