//! Build Progress Monitoring
//!
//! Progress reports with change detection and publication rate limiting, as
//! JSON on stdout or as log lines.

use crate::json_output::current_timestamp;
use crate::machine::Position;
use crate::runner::{BuildStatus, RunState};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressData {
    /// System timestamp (Unix epoch seconds)
    pub stime: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub job_id: String,
    pub state: RunState,
    pub lines_processed: usize,
    pub lines_total: usize,
    pub percent: f64,
    pub outstanding_commands: usize,
    /// Intended position [x, y, z, a, b] in mm
    pub position: [f64; 5],
    /// Position acknowledged by the device
    pub confirmed_position: [f64; 5],
    pub estimated_minutes: f64,
}

impl ProgressData {
    pub fn new_rounded(job_id: &str, status: &BuildStatus, decimal_places: u32) -> Self {
        let multiplier = 10.0_f64.powi(decimal_places as i32);
        let round_value = |value: f64| (value * multiplier).round() / multiplier;
        let rounded = |p: &Position| p.0.map(round_value);

        Self {
            stime: current_timestamp(),
            event_type: "progress".to_string(),
            job_id: job_id.to_string(),
            state: status.state,
            lines_processed: status.lines_processed,
            lines_total: status.lines_total,
            percent: round_value(status.percent()),
            outstanding_commands: status.outstanding_commands,
            position: rounded(&status.position),
            confirmed_position: rounded(&status.confirmed_position),
            estimated_minutes: round_value(status.estimated_minutes),
        }
    }
}

/// Decides which progress snapshots are worth reporting
pub struct ProgressMonitor {
    last_progress: Option<(usize, RunState)>,
    last_output: Option<Instant>,
    pub_rate_hz: u32,
    /// Only report when lines or state changed
    dynamic_mode: bool,
    pub decimal_places: u32,
}

impl ProgressMonitor {
    pub fn new(pub_rate_hz: u32, dynamic_mode: bool, decimal_places: u32) -> Self {
        Self { last_progress: None, last_output: None, pub_rate_hz: pub_rate_hz.max(1), dynamic_mode, decimal_places }
    }

    /// State changes are never rate limited
    pub fn should_output(&mut self, status: &BuildStatus) -> bool {
        let now = Instant::now();
        let current = (status.lines_processed, status.state);
        let state_changed = self.last_progress.map(|(_, state)| state != status.state).unwrap_or(true);

        if !state_changed {
            if let Some(last_output) = self.last_output {
                let min_interval = Duration::from_millis(1000 / self.pub_rate_hz as u64);
                if now.duration_since(last_output) < min_interval {
                    return false;
                }
            }
            if self.dynamic_mode && self.last_progress == Some(current) {
                return false;
            }
        }

        self.last_progress = Some(current);
        self.last_output = Some(now);
        true
    }

    pub fn output_json(&self, job_id: &str, status: &BuildStatus) {
        let data = ProgressData::new_rounded(job_id, status, self.decimal_places);
        if let Ok(json) = serde_json::to_string(&data) {
            println!("{}", json);
        }
    }

    pub fn output_log(&self, status: &BuildStatus) {
        info!(
            "{}/{} lines ({:.1}%), at {}, ~{:.1} min",
            status.lines_processed,
            status.lines_total,
            status.percent(),
            status.position,
            status.estimated_minutes
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(lines_processed: usize, state: RunState) -> BuildStatus {
        BuildStatus {
            state,
            lines_processed,
            lines_total: 8,
            outstanding_commands: 0,
            position: Position::new(1.23456, 0.0, 0.0),
            confirmed_position: Position::default(),
            travel_distance: 0.0,
            estimated_minutes: 0.0,
        }
    }

    #[test]
    fn test_rate_limit_holds_back_fast_updates() {
        let mut monitor = ProgressMonitor::new(1, false, 3);
        assert!(monitor.should_output(&status(1, RunState::Running)));
        assert!(!monitor.should_output(&status(2, RunState::Running)));
    }

    #[test]
    fn test_state_change_bypasses_rate_limit() {
        let mut monitor = ProgressMonitor::new(1, true, 3);
        assert!(monitor.should_output(&status(8, RunState::Running)));
        assert!(monitor.should_output(&status(8, RunState::Finished)));
    }

    #[test]
    fn test_dynamic_mode_skips_unchanged() {
        let mut monitor = ProgressMonitor::new(1000, true, 3);
        assert!(monitor.should_output(&status(3, RunState::Running)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!monitor.should_output(&status(3, RunState::Running)));
        assert!(monitor.should_output(&status(4, RunState::Running)));
    }

    #[test]
    fn test_progress_data_rounding() {
        let data = ProgressData::new_rounded("job", &status(2, RunState::Running), 2);
        assert_eq!(data.position[0], 1.23);
        assert_eq!(data.percent, 25.0);
        assert_eq!(serde_json::to_value(&data).unwrap()["state"], "running");
    }
}
