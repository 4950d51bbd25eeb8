//! Parsing of remote training progress output.
//!
//! Two formats are understood: a JSON status line written by the training
//! harness, and the tqdm progress bar most trainers print to their log.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Running,
    Completed,
    Failed,
}

/// A single progress observation taken from the remote machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub step: u64,
    #[serde(default)]
    pub total_steps: Option<u64>,
    #[serde(default)]
    pub loss: Option<f64>,
    #[serde(default)]
    pub eta_seconds: Option<f64>,
    #[serde(default)]
    pub steps_per_second: Option<f64>,
    #[serde(default)]
    pub state: RunState,
}

impl ProgressReport {
    /// Whether the run reached its end, either by saying so or by step count.
    #[must_use]
    pub fn reached_end(&self, expected_total: u64) -> bool {
        if self.state == RunState::Completed {
            return true;
        }
        let total = self.total_steps.unwrap_or(expected_total);
        total > 0 && self.step >= total
    }
}

// 900/2000 [12:00<14:40,  1.25it/s, loss=0.123]
static TQDM_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?P<step>\d+)/(?P<total>\d+)\s*\[(?P<elapsed>[\d:]+|\?)<(?P<eta>[\d:]+|\?),\s*(?P<rate>[\d.]+|\?)(?P<unit>it/s|s/it)(?P<rest>[^\]]*)\]",
    )
    .expect("tqdm regex is valid")
});

static LOSS_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[,\s])loss=(?P<loss>[-+]?[\d.]+(?:e[-+]?\d+)?)").expect("loss regex is valid"));

/// Find the most recent progress observation in a chunk of remote output.
///
/// Lines are scanned from the end; tqdm's carriage-return redraws count as lines.
#[must_use]
pub fn parse_progress(output: &str) -> Option<ProgressReport> {
    output
        .split(['\n', '\r'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .rev()
        .find_map(|line| parse_json_line(line).or_else(|| parse_tqdm_line(line)))
}

fn parse_json_line(line: &str) -> Option<ProgressReport> {
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

fn parse_tqdm_line(line: &str) -> Option<ProgressReport> {
    let caps = TQDM_LINE.captures_iter(line).last()?;
    let step = caps.name("step")?.as_str().parse().ok()?;
    let total = caps.name("total")?.as_str().parse().ok()?;
    let eta_seconds = caps.name("eta").and_then(|m| parse_clock(m.as_str()));
    let rate: Option<f64> = caps.name("rate").and_then(|m| m.as_str().parse().ok());
    let steps_per_second = match (rate, caps.name("unit").map(|m| m.as_str())) {
        (Some(r), Some("s/it")) if r > 0.0 => Some(1.0 / r),
        (Some(r), Some("it/s")) => Some(r),
        _ => None,
    };
    let loss = caps
        .name("rest")
        .and_then(|m| LOSS_FIELD.captures(m.as_str()))
        .and_then(|c| c.name("loss")?.as_str().parse().ok());

    Some(ProgressReport {
        step,
        total_steps: Some(total),
        loss,
        eta_seconds,
        steps_per_second,
        state: RunState::Running,
    })
}

/// `MM:SS` or `H:MM:SS` into seconds.
fn parse_clock(value: &str) -> Option<f64> {
    let mut seconds = 0u64;
    let mut parts = 0;
    for part in value.split(':') {
        seconds = seconds * 60 + part.parse::<u64>().ok()?;
        parts += 1;
    }
    (parts >= 2).then_some(seconds as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_status_line() {
        let out = r#"{"step": 450, "total_steps": 2000, "loss": 0.081, "eta_seconds": 3100, "steps_per_second": 0.5, "state": "running"}"#;
        let report = parse_progress(out).unwrap();
        assert_eq!(report.step, 450);
        assert_eq!(report.total_steps, Some(2000));
        assert_eq!(report.eta_seconds, Some(3100.0));
        assert_eq!(report.state, RunState::Running);
    }

    #[test]
    fn test_parse_tqdm_line_with_loss() {
        let out = "steps:  45%|████▌     | 900/2000 [12:00<14:40,  1.25it/s, avr_loss=0.1, loss=0.123]";
        let report = parse_progress(out).unwrap();
        assert_eq!(report.step, 900);
        assert_eq!(report.total_steps, Some(2000));
        assert_eq!(report.eta_seconds, Some(880.0));
        assert_eq!(report.steps_per_second, Some(1.25));
        assert_eq!(report.loss, Some(0.123));
    }

    #[test]
    fn test_parse_tqdm_seconds_per_iteration() {
        let out = "  3/100 [00:08<1:02:03,  4.00s/it]";
        let report = parse_progress(out).unwrap();
        assert_eq!(report.eta_seconds, Some(3723.0));
        assert_eq!(report.steps_per_second, Some(0.25));
        assert_eq!(report.loss, None);
    }

    #[test]
    fn test_last_redraw_wins() {
        let out = "10/100 [00:10<01:30, 1.00it/s]\r20/100 [00:20<01:20, 1.00it/s]\r30/100 [00:30<01:10, 1.00it/s]\n";
        assert_eq!(parse_progress(out).unwrap().step, 30);
    }

    #[test]
    fn test_unknown_eta_is_none() {
        let report = parse_progress("0/100 [00:00<?, ?it/s]").unwrap();
        assert_eq!(report.step, 0);
        assert_eq!(report.eta_seconds, None);
        assert_eq!(report.steps_per_second, None);
    }

    #[test]
    fn test_garbage_yields_none() {
        assert!(parse_progress("loading checkpoint shards...\n").is_none());
        assert!(parse_progress("").is_none());
    }

    #[test]
    fn test_reached_end() {
        let mut report = parse_progress("2000/2000 [40:00<00:00, 0.83it/s]").unwrap();
        assert!(report.reached_end(2000));
        report.step = 1999;
        assert!(!report.reached_end(2000));
        report.state = RunState::Completed;
        assert!(report.reached_end(2000));
    }
}
