//! Reply-line parsing for the ASCII line protocol
//!
//! Outbound frames are plain text lines. Inbound lines are classified here:
//! `ok` acknowledges the oldest in-flight frame and may carry a temperature
//! report, `start` announces a freshly booted controller, `Resend:` or `rs`
//! asks for a numbered frame again, fault lines stop the job, everything else
//! is informational.
//!
//! With line numbering on, each frame goes out as `N<n> <frame> *<xor>`,
//! where the checksum covers every byte before the `*`.

use crate::device::{PlaybackProgress, SdResponse};
use crate::{FabError, Result};
use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok {
        temperature: Option<f64>,
        platform_temperature: Option<f64>,
    },
    Start,
    /// Line the device wants again, if it said which
    Resend(Option<u64>),
    Fault(String),
    Info(String),
}

pub struct ReplyParser {
    temperature_pattern: Regex,
    platform_pattern: Regex,
    progress_pattern: Regex,
    resend_pattern: Regex,
}

impl ReplyParser {
    pub fn new() -> Result<Self> {
        let build = |pattern: &str| {
            Regex::new(pattern).map_err(|e| FabError::Configuration(format!("bad reply pattern: {}", e)))
        };
        Ok(Self {
            temperature_pattern: build(r"T:\s*(-?\d+(?:\.\d+)?)")?,
            platform_pattern: build(r"B:\s*(-?\d+(?:\.\d+)?)")?,
            progress_pattern: build(r"SD printing byte (\d+)\s*/\s*(\d+)")?,
            resend_pattern: build(r"(\d+)")?,
        })
    }

    pub fn parse(&self, line: &str) -> Reply {
        let line = line.trim();
        if line.starts_with("ok") {
            return Reply::Ok {
                temperature: capture_f64(&self.temperature_pattern, line),
                platform_temperature: capture_f64(&self.platform_pattern, line),
            };
        }
        if line.starts_with("start") {
            return Reply::Start;
        }
        if line.starts_with("Resend:") || line.starts_with("rs ") {
            return Reply::Resend(
                self.resend_pattern
                    .captures(line)
                    .and_then(|caps| caps.get(1))
                    .and_then(|m| m.as_str().parse().ok()),
            );
        }
        if line.starts_with("Extruder Fail") || line.starts_with("!!") {
            return Reply::Fault(line.to_string());
        }
        Reply::Info(line.to_string())
    }

    /// `Some(None)` when the device says it is not playing a file
    pub fn sd_progress(&self, line: &str) -> Option<Option<PlaybackProgress>> {
        if line.contains("Not SD printing") {
            return Some(None);
        }
        let caps = self.progress_pattern.captures(line)?;
        let bytes_done = caps.get(1)?.as_str().parse().ok()?;
        let bytes_total = caps.get(2)?.as_str().parse().ok()?;
        Some(Some(PlaybackProgress { bytes_done, bytes_total }))
    }
}

/// Classify an informational line as a storage request outcome
pub fn sd_response(line: &str) -> Option<SdResponse> {
    let lower = line.trim().to_ascii_lowercase();
    let response = if lower.starts_with("writing to file")
        || lower.starts_with("file opened")
        || lower.starts_with("file selected")
        || lower.starts_with("done saving")
    {
        SdResponse::Success
    } else if lower.contains("open failed") {
        SdResponse::NoFile
    } else if lower.contains("no sd card") || lower.contains("no media") {
        SdResponse::NoCard
    } else if lower.contains("sd init fail") {
        SdResponse::InitFailed
    } else if lower.contains("volume.init failed") {
        SdResponse::BadPartition
    } else if lower.contains("filesystem") {
        SdResponse::BadFilesystem
    } else if lower.contains("openroot failed") {
        SdResponse::BadRootDirectory
    } else if lower.contains("locked") {
        SdResponse::Locked
    } else if lower.starts_with("sd error") || lower.starts_with("error:sd") {
        SdResponse::Generic
    } else {
        return None;
    };
    Some(response)
}

/// XOR of every byte of `text`
pub fn checksum(text: &str) -> u8 {
    text.bytes().fold(0, |acc, b| acc ^ b)
}

/// `frame` numbered as line `number`, with its checksum
pub fn numbered(number: u64, frame: &str) -> String {
    let body = format!("N{} {} ", number, frame);
    let sum = checksum(&body);
    format!("{}*{}", body, sum)
}

/// Number the frame that follows line `last`; returns the number it carries.
///
/// A frame that already starts with `N<n>` keeps that number. `M110` restarts
/// the count.
pub fn number_frame(last: u64, frame: &str) -> (u64, String) {
    if let Some(number) = leading_line_number(frame) {
        return (number, format!("{}*{}", frame, checksum(frame)));
    }
    let number = if frame.contains("M110") { 1 } else { last + 1 };
    (number, numbered(number, frame))
}

fn leading_line_number(frame: &str) -> Option<u64> {
    let digits: String = frame.strip_prefix('N')?.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

fn capture_f64(pattern: &Regex, line: &str) -> Option<f64> {
    pattern
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
