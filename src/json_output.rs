//! JSON Output for Build Jobs
//!
//! Structured job, halt and error events on stdout, one object per line, for
//! tools driving `fabd` from a script.

use crate::commands::{StopKind, StopSignal};
use crate::job::{JobReport, JobTarget};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current time as f64 seconds since the UNIX epoch, microsecond precision
pub fn current_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Fresh identifier tying together every event of one job
pub fn new_job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Started,
    Finished,
    Halted,
    Cancelled,
    Failed,
}

/// Job lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub job_id: String,
    pub status: JobStatus,
    pub target: JobTarget,
    /// Build file or remote file name
    pub source: String,
    pub lines_processed: usize,
    pub lines_total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_secs: Option<f64>,
}

/// Halt reached during a build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaltEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub job_id: String,
    pub kind: StopKind,
    pub message: String,
    /// The operator chose to carry on past an optional halt
    pub continued: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub error: String,
}

impl JobEvent {
    pub fn new(job_id: &str, status: JobStatus, target: JobTarget, source: &str, lines_processed: usize, lines_total: usize) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "job".to_string(),
            job_id: job_id.to_string(),
            status,
            target,
            source: source.to_string(),
            lines_processed,
            lines_total,
            elapsed_secs: None,
        }
    }

    pub fn started(job_id: &str, target: JobTarget, source: &str, lines_total: usize) -> Self {
        Self::new(job_id, JobStatus::Started, target, source, 0, lines_total)
    }

    /// Closing event for a job that ran to the end or to a halt
    pub fn from_report(job_id: &str, source: &str, report: &JobReport) -> Self {
        let status = if report.halt.is_some() { JobStatus::Halted } else { JobStatus::Finished };
        let mut event = Self::new(job_id, status, report.target, source, report.lines_processed, report.lines_total);
        event.elapsed_secs = Some(report.elapsed.as_secs_f64());
        event
    }
}

impl HaltEvent {
    pub fn new(job_id: &str, signal: &StopSignal, continued: bool) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "halt".to_string(),
            job_id: job_id.to_string(),
            kind: signal.kind,
            message: signal.message.clone(),
            continued,
        }
    }
}

impl ErrorEvent {
    pub fn new(error: &str, job_id: Option<&str>) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "error".to_string(),
            job_id: job_id.map(str::to_string),
            error: error.to_string(),
        }
    }
}

/// Output a JSON event to stdout
pub fn output_event<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        println!("{}", json);
    }
}

/// Convenience functions for outputting specific event types
pub mod output {
    use super::*;

    pub fn job(event: JobEvent) {
        output_event(&event);
    }

    pub fn halt(event: HaltEvent) {
        output_event(&event);
    }

    pub fn error(event: ErrorEvent) {
        output_event(&event);
    }

    pub fn job_started(job_id: &str, target: JobTarget, source: &str, lines_total: usize) {
        job(JobEvent::started(job_id, target, source, lines_total));
    }

    pub fn job_finished(job_id: &str, source: &str, report: &JobReport) {
        job(JobEvent::from_report(job_id, source, report));
    }

    pub fn job_cancelled(job_id: &str, target: JobTarget, source: &str) {
        job(JobEvent::new(job_id, JobStatus::Cancelled, target, source, 0, 0));
    }

    pub fn job_failed(job_id: &str, error_msg: &str) {
        error(ErrorEvent::new(error_msg, Some(job_id)));
    }

    pub fn halt_reached(job_id: &str, signal: &StopSignal, continued: bool) {
        halt(HaltEvent::new(job_id, signal, continued));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_halt_event_fields() {
        let signal = StopSignal::with_comment(StopKind::OptionalHalt, Some("inspect"));
        let json = serde_json::to_value(HaltEvent::new("job-1", &signal, true)).unwrap();
        assert_eq!(json["type"], "halt");
        assert_eq!(json["kind"], "optional_halt");
        assert_eq!(json["message"], "Optional Halt: inspect");
        assert_eq!(json["continued"], true);
    }

    #[test]
    fn test_report_with_halt_is_halted() {
        let report = JobReport {
            target: JobTarget::LocalFile,
            lines_processed: 4,
            lines_total: 9,
            halt: Some(StopSignal::new(StopKind::ProgramEnd, "Program End")),
            elapsed: Duration::from_millis(1500),
        };
        let json = serde_json::to_value(JobEvent::from_report("job-2", "part.gcode", &report)).unwrap();
        assert_eq!(json["status"], "halted");
        assert_eq!(json["target"], "local_file");
        assert_eq!(json["lines_processed"], 4);
        assert_eq!(json["elapsed_secs"], 1.5);
    }

    #[test]
    fn test_error_event_omits_missing_job() {
        let json = serde_json::to_string(&ErrorEvent::new("no port", None)).unwrap();
        assert!(!json.contains("job_id"));
        assert!(json.contains(r#""type":"error""#));
    }

    #[test]
    fn test_job_ids_are_unique() {
        assert_ne!(new_job_id(), new_job_id());
        assert!(current_timestamp() > 1_600_000_000.0);
    }
}
