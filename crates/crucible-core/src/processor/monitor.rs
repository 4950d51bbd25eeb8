//! Per-job monitoring state threaded through each training tick.
//!
//! Holds the sample series fed to the stall detector and the one-shot flags
//! that keep milestone alerts from repeating. Pure: the caller supplies time
//! and progress, so every decision here is testable with synthetic series.

use chrono::{DateTime, Duration, Utc};
use crucible_training::{
    EtaSample, ProgressReport, StallDetector, StallVerdict, ThroughputSample, TrainingJob,
};

/// Throughput samples kept for peak detection (a day at one tick per minute).
const MAX_THROUGHPUT_SAMPLES: usize = 1440;

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// The prepaid budget is spent. Always reported alone.
    HardTimeout { deadline: DateTime<Utc> },
    /// Expected completion passed. Reported once.
    SoftTimeout { deadline: DateTime<Utc> },
    /// The detector flagged a stall; the grace period starts now.
    StallSuspected { verdict: StallVerdict, notify_user: bool },
    /// The stall outlived its grace period.
    StallConfirmed { verdict: StallVerdict, since: DateTime<Utc> },
    StallRecovered,
}

#[derive(Debug, Clone)]
pub struct MonitorState {
    soft_timeout_at: Option<DateTime<Utc>>,
    hard_timeout_at: Option<DateTime<Utc>>,
    stall_grace: Duration,
    eta_capacity: usize,
    eta: Vec<EtaSample>,
    throughput: Vec<ThroughputSample>,
    soft_warned: bool,
    stall_since: Option<DateTime<Utc>>,
    stall_warned: bool,
    unreachable_polls: u32,
}

impl MonitorState {
    pub fn new(job: &TrainingJob, stall_grace: Duration, detector: &StallDetector) -> Self {
        let config = detector.config();
        Self {
            soft_timeout_at: job.soft_timeout_at,
            hard_timeout_at: job.hard_timeout_at,
            stall_grace,
            eta_capacity: config.window.max(config.min_samples).max(2),
            eta: Vec::new(),
            throughput: Vec::new(),
            soft_warned: false,
            stall_since: None,
            stall_warned: false,
            unreachable_polls: 0,
        }
    }

    pub fn record(&mut self, at: DateTime<Utc>, report: &ProgressReport) {
        if let Some(eta_seconds) = report.eta_seconds {
            self.eta.push(EtaSample { at, step: report.step, eta_seconds });
            let excess = self.eta.len().saturating_sub(self.eta_capacity);
            self.eta.drain(..excess);
        }
        if let Some(steps_per_second) = report.steps_per_second {
            self.throughput.push(ThroughputSample { at, steps_per_second });
            let excess = self.throughput.len().saturating_sub(MAX_THROUGHPUT_SAMPLES);
            self.throughput.drain(..excess);
        }
    }

    /// Count a poll that could not reach the instance. Returns the running total.
    pub fn note_unreachable(&mut self) -> u32 {
        self.unreachable_polls += 1;
        self.unreachable_polls
    }

    pub fn unreachable_polls(&self) -> u32 {
        self.unreachable_polls
    }

    pub fn eta_samples(&self) -> &[EtaSample] {
        &self.eta
    }

    pub fn evaluate(&mut self, now: DateTime<Utc>, detector: &StallDetector) -> Vec<MonitorEvent> {
        if let Some(deadline) = self.hard_timeout_at.filter(|d| now >= *d) {
            return vec![MonitorEvent::HardTimeout { deadline }];
        }

        let mut events = Vec::new();
        if let Some(deadline) = self.soft_timeout_at.filter(|d| now >= *d && !self.soft_warned) {
            self.soft_warned = true;
            events.push(MonitorEvent::SoftTimeout { deadline });
        }

        let verdict = detector.analyze(&self.eta, &self.throughput);
        if verdict.is_stalling {
            match self.stall_since {
                None => {
                    self.stall_since = Some(now);
                    events.push(MonitorEvent::StallSuspected {
                        verdict,
                        notify_user: !self.stall_warned,
                    });
                    self.stall_warned = true;
                }
                Some(since) if now - since >= self.stall_grace => {
                    events.push(MonitorEvent::StallConfirmed { verdict, since });
                }
                Some(_) => {}
            }
        } else if self.stall_since.take().is_some() {
            events.push(MonitorEvent::StallRecovered);
        }
        events
    }
}
