// Copyright 2023 runtime-shady-backroom
// This file is part of bilateral-haptic-core.
// bilateral-haptic-core is licensed under the AGPL-3.0 license (see LICENSE file for details).

//! Sync latency statistics: a capped ring buffer of samples plus a quantile
//! report, collected on the SECONDARY side of every `EXECUTE_BUZZ`.
//!
//! The source kept three parallel ring buffers and popped the oldest entry
//! from each individually on overflow, which can misalign them if one push
//! fails partway through. Here a sample is one struct in one buffer, so a
//! partial append is not representable.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Target for `total_latency_us`; the report flags mean/p95/p99 against it.
pub const TOTAL_LATENCY_TARGET_US: f64 = 10_000.0;

pub const DEFAULT_MAX_SAMPLES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncSample {
    pub network_latency_us: f64,
    pub execution_time_us: f64,
    pub total_latency_us: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSummary {
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncStatsReport {
    pub sample_count: usize,
    pub network_latency: MetricSummary,
    pub execution_time: MetricSummary,
    pub total_latency: MetricSummary,
    pub mean_within_target: bool,
    pub p95_within_target: bool,
    pub p99_within_target: bool,
}

/// A capacity-capped ring buffer of [`SyncSample`]s with quantile reporting.
pub struct SyncStats {
    samples: Mutex<VecDeque<SyncSample>>,
    max_samples: usize,
}

impl SyncStats {
    pub fn new(max_samples: usize) -> Self {
        SyncStats { samples: Mutex::new(VecDeque::with_capacity(max_samples)), max_samples }
    }

    /// Appends one sample, evicting the oldest if at capacity. All three
    /// metrics land together or not at all.
    pub fn add_sample(&self, network_latency_us: f64, execution_time_us: f64, total_latency_us: f64) {
        let mut samples = self.samples.lock().expect("sync stats mutex poisoned");
        if samples.len() >= self.max_samples {
            samples.pop_front();
        }
        samples.push_back(SyncSample { network_latency_us, execution_time_us, total_latency_us });
    }

    pub fn len(&self) -> usize {
        self.samples.lock().expect("sync stats mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Computes mean/median/min/max/p95/p99 per metric. Percentiles fall
    /// back to the max when the sample count is below the threshold that
    /// makes them meaningful (p95 needs n≥20, p99 needs n≥100).
    pub fn report(&self) -> Option<SyncStatsReport> {
        let samples = self.samples.lock().expect("sync stats mutex poisoned");
        if samples.is_empty() {
            return None;
        }

        let network: Vec<f64> = samples.iter().map(|s| s.network_latency_us).collect();
        let execution: Vec<f64> = samples.iter().map(|s| s.execution_time_us).collect();
        let total: Vec<f64> = samples.iter().map(|s| s.total_latency_us).collect();

        let network_summary = summarize(&network);
        let execution_summary = summarize(&execution);
        let total_summary = summarize(&total);

        Some(SyncStatsReport {
            sample_count: samples.len(),
            network_latency: network_summary,
            execution_time: execution_summary,
            total_latency: total_summary,
            mean_within_target: total_summary.mean <= TOTAL_LATENCY_TARGET_US,
            p95_within_target: total_summary.p95 <= TOTAL_LATENCY_TARGET_US,
            p99_within_target: total_summary.p99 <= TOTAL_LATENCY_TARGET_US,
        })
    }
}

fn summarize(values: &[f64]) -> MetricSummary {
    let n = values.len();
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("latency samples are never NaN"));

    let mean = sorted.iter().sum::<f64>() / n as f64;
    let max = sorted[n - 1];
    let min = sorted[0];
    let median = percentile(&sorted, 50.0);
    let p95 = if n >= 20 { percentile(&sorted, 95.0) } else { max };
    let p99 = if n >= 100 { percentile(&sorted, 99.0) } else { max };

    MetricSummary { mean, median, min, max, p95, p99 }
}

/// Nearest-rank percentile over an already-sorted slice.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let rank = (pct / 100.0) * (n - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let weight = rank - lower as f64;
        sorted[lower] * (1.0 - weight) + sorted[upper] * weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stats_report_none() {
        let stats = SyncStats::new(DEFAULT_MAX_SAMPLES);
        assert!(stats.report().is_none());
    }

    #[test]
    fn single_sample_round_trips_through_every_metric() {
        let stats = SyncStats::new(DEFAULT_MAX_SAMPLES);
        stats.add_sample(1000.0, 200.0, 1200.0);
        let report = stats.report().unwrap();
        assert_eq!(report.sample_count, 1);
        assert_eq!(report.total_latency.mean, 1200.0);
        assert_eq!(report.total_latency.max, 1200.0);
        assert_eq!(report.total_latency.p95, 1200.0); // falls back to max, n < 20
    }

    #[test]
    fn percentiles_fall_back_to_max_below_threshold() {
        let stats = SyncStats::new(DEFAULT_MAX_SAMPLES);
        for i in 0..19 {
            stats.add_sample(i as f64, i as f64, i as f64 * 10.0);
        }
        let report = stats.report().unwrap();
        assert_eq!(report.total_latency.p95, report.total_latency.max);
        assert_eq!(report.total_latency.p99, report.total_latency.max);
    }

    #[test]
    fn p95_activates_at_twenty_samples() {
        let stats = SyncStats::new(DEFAULT_MAX_SAMPLES);
        for i in 0..20 {
            stats.add_sample(i as f64, i as f64, i as f64 * 100.0);
        }
        let report = stats.report().unwrap();
        assert!(report.total_latency.p95 < report.total_latency.max);
    }

    #[test]
    fn ring_buffer_evicts_oldest_on_overflow() {
        let stats = SyncStats::new(3);
        stats.add_sample(1.0, 1.0, 1.0);
        stats.add_sample(2.0, 2.0, 2.0);
        stats.add_sample(3.0, 3.0, 3.0);
        stats.add_sample(4.0, 4.0, 4.0);
        assert_eq!(stats.len(), 3);
        let report = stats.report().unwrap();
        assert_eq!(report.total_latency.min, 2.0);
        assert_eq!(report.total_latency.max, 4.0);
    }

    #[test]
    fn compliance_flags_trip_above_target() {
        let stats = SyncStats::new(DEFAULT_MAX_SAMPLES);
        stats.add_sample(5000.0, 8000.0, 13000.0);
        let report = stats.report().unwrap();
        assert!(!report.mean_within_target);
    }
}
