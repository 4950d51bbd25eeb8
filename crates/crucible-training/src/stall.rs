//! Stall detection over ETA and throughput time series.
//!
//! Healthy training burns down its ETA roughly one second per second of wall
//! clock. The detector looks at the most recent window of samples and flags a
//! stall when the ETA burn-down rate stays under a threshold for the whole
//! window. It is advisory only: callers decide what to do with a verdict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// ETA observation at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EtaSample {
    pub at: DateTime<Utc>,
    pub step: u64,
    pub eta_seconds: f64,
}

/// Throughput observation at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSample {
    pub at: DateTime<Utc>,
    pub steps_per_second: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StallConfig {
    /// Samples required before any verdict is given.
    pub min_samples: usize,
    /// Number of most recent ETA samples examined.
    pub window: usize,
    /// ETA decrease per elapsed second below which an interval counts as stalled.
    pub convergence_threshold: f64,
    /// Fractional drop from peak throughput that upgrades confidence to high.
    pub throughput_drop: f64,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self { min_samples: 4, window: 4, convergence_threshold: 0.5, throughput_drop: 0.5 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallConfidence {
    Low,
    Medium,
    High,
}

impl StallConfidence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StallVerdict {
    pub is_stalling: bool,
    pub confidence: StallConfidence,
    /// ETA seconds removed per wall-clock second across the window.
    pub convergence_ratio: Option<f64>,
    /// Fractional drop of the latest throughput from its observed peak.
    pub throughput_drop: Option<f64>,
    pub reason: String,
    pub recommendation: String,
}

impl StallVerdict {
    fn not_stalling(reason: String, convergence_ratio: Option<f64>) -> Self {
        Self {
            is_stalling: false,
            confidence: StallConfidence::Low,
            convergence_ratio,
            throughput_drop: None,
            reason,
            recommendation: "keep monitoring".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StallDetector {
    config: StallConfig,
}

impl StallDetector {
    #[must_use]
    pub fn new(config: StallConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &StallConfig {
        &self.config
    }

    /// Analyze the sample series. Samples must be in chronological order.
    #[must_use]
    pub fn analyze(&self, eta: &[EtaSample], throughput: &[ThroughputSample]) -> StallVerdict {
        if eta.len() < self.config.min_samples.max(2) {
            return StallVerdict::not_stalling(
                format!(
                    "insufficient data: {} of {} samples",
                    eta.len(),
                    self.config.min_samples.max(2)
                ),
                None,
            );
        }

        let window = &eta[eta.len().saturating_sub(self.config.window.max(2))..];
        let mut interval_ratios = Vec::with_capacity(window.len() - 1);
        for pair in window.windows(2) {
            let elapsed = seconds_between(pair[0].at, pair[1].at);
            if elapsed > 0.0 {
                interval_ratios.push((pair[0].eta_seconds - pair[1].eta_seconds) / elapsed);
            }
        }

        let first = window[0];
        let last = window[window.len() - 1];
        let total_elapsed = seconds_between(first.at, last.at);
        if interval_ratios.is_empty() || total_elapsed <= 0.0 {
            return StallVerdict::not_stalling(
                "samples share a timestamp; no elapsed time to compare".to_string(),
                None,
            );
        }

        let eta_drop = first.eta_seconds - last.eta_seconds;
        let ratio = eta_drop / total_elapsed;
        let sustained = interval_ratios.iter().all(|r| *r < self.config.convergence_threshold);
        if !sustained {
            return StallVerdict::not_stalling(
                format!("ETA converging at {ratio:.2}s per elapsed second"),
                Some(ratio),
            );
        }

        let drop = throughput_drop(throughput);
        let high = drop.is_some_and(|d| d > self.config.throughput_drop);
        let minutes = total_elapsed / 60.0;
        let reason = format!(
            "ETA moved {:.0}s over {:.0} min of training (ratio {:.2}, threshold {:.2}) at step {}",
            eta_drop, minutes, ratio, self.config.convergence_threshold, last.step
        );

        if high {
            let pct = drop.unwrap_or_default() * 100.0;
            StallVerdict {
                is_stalling: true,
                confidence: StallConfidence::High,
                convergence_ratio: Some(ratio),
                throughput_drop: drop,
                reason: format!("{reason}; throughput down {pct:.0}% from peak"),
                recommendation: "terminate and inspect the instance: throughput collapsed alongside the ETA"
                    .to_string(),
            }
        } else {
            StallVerdict {
                is_stalling: true,
                confidence: StallConfidence::Medium,
                convergence_ratio: Some(ratio),
                throughput_drop: drop,
                reason,
                recommendation: "re-check after the grace period; throughput looks normal so the ETA estimate may be noisy"
                    .to_string(),
            }
        }
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

fn throughput_drop(samples: &[ThroughputSample]) -> Option<f64> {
    let latest = samples.last()?.steps_per_second;
    let peak = samples.iter().map(|s| s.steps_per_second).fold(f64::NAN, f64::max);
    if peak.is_nan() || peak <= 0.0 {
        return None;
    }
    Some((1.0 - latest / peak).max(0.0))
}
