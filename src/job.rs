//! Build jobs and the tick loop that drives them
//!
//! A job decides where a build ends up: straight to the machine, captured to
//! a local file, saved to the device's own storage, or played back from it.
//! `run_job` paces any of them with the same cooperative loop.

use crate::commands::StopSignal;
use crate::device::{Device, PlaybackProgress};
use crate::runner::{BuildRunner, BuildStatus, RunState, Tick};
use crate::{FabError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTarget {
    Machine,
    LocalFile,
    RemoteFile,
    RemotePlayback,
}

impl fmt::Display for JobTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobTarget::Machine => "machine",
            JobTarget::LocalFile => "local file",
            JobTarget::RemoteFile => "remote file",
            JobTarget::RemotePlayback => "remote playback",
        };
        f.write_str(label)
    }
}

pub trait BuildJob: Send {
    fn run_next(&mut self) -> Result<Tick>;

    fn finished(&self) -> bool;

    fn lines_total(&self) -> usize;

    fn lines_processed(&self) -> usize;

    fn is_interactive(&self) -> bool;

    fn target(&self) -> JobTarget;

    fn status(&self) -> BuildStatus;

    /// Wait for device traffic, at most `timeout`
    fn idle(&mut self, timeout: Duration) -> Result<()>;

    /// Stop the device now and release its link
    fn abort(&mut self) -> Result<()>;
}

/// Build sent straight to the machine
pub struct Direct<D: Device> {
    runner: BuildRunner<D>,
}

impl<D: Device> Direct<D> {
    pub fn new(runner: BuildRunner<D>) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &BuildRunner<D> {
        &self.runner
    }
}

impl<D: Device> BuildJob for Direct<D> {
    fn run_next(&mut self) -> Result<Tick> {
        self.runner.run_next()
    }

    fn finished(&self) -> bool {
        self.runner.finished()
    }

    fn lines_total(&self) -> usize {
        self.runner.lines_total()
    }

    fn lines_processed(&self) -> usize {
        self.runner.lines_processed()
    }

    fn is_interactive(&self) -> bool {
        self.runner.is_interactive()
    }

    fn target(&self) -> JobTarget {
        JobTarget::Machine
    }

    fn status(&self) -> BuildStatus {
        self.runner.status()
    }

    fn idle(&mut self, timeout: Duration) -> Result<()> {
        self.runner.idle(timeout)
    }

    fn abort(&mut self) -> Result<()> {
        let stopped = self.runner.abort();
        self.runner.device_mut().disconnect();
        stopped
    }
}

/// Build captured into a file on this host
pub struct ToLocalFile<D: Device> {
    runner: BuildRunner<D>,
    path: PathBuf,
    written: Option<u64>,
}

impl<D: Device> ToLocalFile<D> {
    pub fn new(mut runner: BuildRunner<D>, path: &Path) -> Result<Self> {
        let name = runner.device().name().to_string();
        runner
            .device_mut()
            .file_capture()
            .ok_or_else(|| FabError::Configuration(format!("{} cannot capture builds to a file", name)))?
            .begin_capture(path)?;
        Ok(Self { runner, path: path.to_path_buf(), written: None })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written, once the capture has been closed
    pub fn bytes_written(&self) -> Option<u64> {
        self.written
    }

    fn close(&mut self) -> Result<()> {
        if self.written.is_some() {
            return Ok(());
        }
        let bytes = match self.runner.device_mut().file_capture() {
            Some(capture) => capture.end_capture()?,
            None => 0,
        };
        self.written = Some(bytes);
        Ok(())
    }
}

impl<D: Device> BuildJob for ToLocalFile<D> {
    fn run_next(&mut self) -> Result<Tick> {
        let tick = self.runner.run_next();
        if self.runner.finished() {
            let closed = self.close();
            let tick = tick?;
            closed?;
            return Ok(tick);
        }
        tick
    }

    fn finished(&self) -> bool {
        self.runner.finished()
    }

    fn lines_total(&self) -> usize {
        self.runner.lines_total()
    }

    fn lines_processed(&self) -> usize {
        self.runner.lines_processed()
    }

    fn is_interactive(&self) -> bool {
        false
    }

    fn target(&self) -> JobTarget {
        JobTarget::LocalFile
    }

    fn status(&self) -> BuildStatus {
        self.runner.status()
    }

    fn idle(&mut self, timeout: Duration) -> Result<()> {
        self.runner.idle(timeout)
    }

    fn abort(&mut self) -> Result<()> {
        self.runner.abort()?;
        self.close()
    }
}

/// Build saved to the device's storage instead of being executed
pub struct ToRemoteFile<D: Device> {
    runner: BuildRunner<D>,
    name: String,
    saved: Option<u64>,
}

impl<D: Device> ToRemoteFile<D> {
    pub fn new(mut runner: BuildRunner<D>, name: &str) -> Result<Self> {
        let device = runner.device().name().to_string();
        runner
            .device_mut()
            .remote_storage()
            .ok_or_else(|| FabError::RemoteStorage(format!("{} has no build storage", device)))?
            .begin_remote_capture(name)?
            .into_result()?;
        info!("Saving build to {} on {}", name, device);
        Ok(Self { runner, name: name.to_string(), saved: None })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes_saved(&self) -> Option<u64> {
        self.saved
    }

    fn close(&mut self) -> Result<()> {
        if self.saved.is_some() {
            return Ok(());
        }
        let storage = self
            .runner
            .device_mut()
            .remote_storage()
            .ok_or_else(|| FabError::RemoteStorage("build storage went away".to_string()))?;
        self.saved = Some(storage.end_remote_capture()?);
        Ok(())
    }
}

impl<D: Device> BuildJob for ToRemoteFile<D> {
    fn run_next(&mut self) -> Result<Tick> {
        let tick = self.runner.run_next();
        if self.runner.finished() {
            let closed = self.close();
            let tick = tick?;
            closed?;
            return Ok(tick);
        }
        tick
    }

    fn finished(&self) -> bool {
        self.runner.finished()
    }

    fn lines_total(&self) -> usize {
        self.runner.lines_total()
    }

    fn lines_processed(&self) -> usize {
        self.runner.lines_processed()
    }

    fn is_interactive(&self) -> bool {
        false
    }

    fn target(&self) -> JobTarget {
        JobTarget::RemoteFile
    }

    fn status(&self) -> BuildStatus {
        self.runner.status()
    }

    fn idle(&mut self, timeout: Duration) -> Result<()> {
        self.runner.idle(timeout)
    }

    fn abort(&mut self) -> Result<()> {
        let stopped = self.runner.abort();
        self.runner.device_mut().disconnect();
        stopped
    }
}

/// Build played by the device from its own storage. Progress is in bytes.
pub struct UsingRemoteFile<D: Device> {
    device: D,
    name: String,
    progress: PlaybackProgress,
    finished: bool,
}

impl<D: Device> UsingRemoteFile<D> {
    pub fn new(mut device: D, name: &str) -> Result<Self> {
        let label = device.name().to_string();
        device
            .remote_storage()
            .ok_or_else(|| FabError::RemoteStorage(format!("{} has no build storage", label)))?
            .begin_remote_playback(name)?
            .into_result()?;
        info!("Playing {} from {}", name, label);
        Ok(Self {
            device,
            name: name.to_string(),
            progress: PlaybackProgress { bytes_done: 0, bytes_total: 0 },
            finished: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<D: Device> BuildJob for UsingRemoteFile<D> {
    fn run_next(&mut self) -> Result<Tick> {
        if self.finished {
            return Ok(Tick::Finished);
        }
        self.device.check_errors()?;
        let storage = self
            .device
            .remote_storage()
            .ok_or_else(|| FabError::RemoteStorage("build storage went away".to_string()))?;
        match storage.playback_progress() {
            Ok(Some(progress)) => {
                self.progress = progress;
                Ok(Tick::Progressed)
            }
            Ok(None) => {
                self.progress.bytes_done = self.progress.bytes_total;
                self.finished = true;
                info!("Playback of {} complete", self.name);
                Ok(Tick::Finished)
            }
            Err(e) => {
                self.finished = true;
                Err(e)
            }
        }
    }

    fn finished(&self) -> bool {
        self.finished
    }

    fn lines_total(&self) -> usize {
        self.progress.bytes_total as usize
    }

    fn lines_processed(&self) -> usize {
        self.progress.bytes_done as usize
    }

    fn is_interactive(&self) -> bool {
        true
    }

    fn target(&self) -> JobTarget {
        JobTarget::RemotePlayback
    }

    fn status(&self) -> BuildStatus {
        let state = self.device.state();
        BuildStatus {
            state: if self.finished { RunState::Finished } else { RunState::Running },
            lines_processed: self.lines_processed(),
            lines_total: self.lines_total(),
            outstanding_commands: self.device.outstanding_commands(),
            position: state.position,
            confirmed_position: state.confirmed_position,
            travel_distance: state.travel_distance,
            estimated_minutes: state.estimated_minutes,
        }
    }

    /// Playback is polled, so waiting means one full interval
    fn idle(&mut self, timeout: Duration) -> Result<()> {
        std::thread::sleep(timeout);
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.finished = true;
        let stopped = self.device.stop();
        self.device.disconnect();
        stopped
    }
}

/// How a job ended
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub target: JobTarget,
    pub lines_processed: usize,
    pub lines_total: usize,
    /// The halt that ended the build, if any
    pub halt: Option<StopSignal>,
    pub elapsed: Duration,
}

/// Tick `job` until it finishes, errors or `cancel` is raised
pub fn run_job<F>(job: &mut dyn BuildJob, interval: Duration, cancel: &AtomicBool, mut progress: F) -> Result<JobReport>
where
    F: FnMut(&BuildStatus, &Tick),
{
    let started = Instant::now();
    let mut halt = None;
    info!("Running {} job ({} lines)", job.target(), job.lines_total());

    loop {
        if cancel.load(Ordering::Acquire) {
            warn!("Build cancelled after {} lines", job.lines_processed());
            job.abort()?;
            return Err(FabError::Cancelled);
        }

        let tick = match job.run_next() {
            Ok(tick) => tick,
            Err(e) => return Err(failed(job, e)),
        };
        progress(&job.status(), &tick);
        let waiting = match tick {
            Tick::Finished => break,
            Tick::Halted { signal, continued: false } => {
                halt = Some(signal);
                false
            }
            Tick::Progressed => job.target() == JobTarget::RemotePlayback,
            Tick::Stalled | Tick::Waiting => true,
            Tick::Halted { .. } => false,
        };
        if waiting {
            if let Err(e) = job.idle(interval) {
                return Err(failed(job, e));
            }
        }
    }

    Ok(JobReport {
        target: job.target(),
        lines_processed: job.lines_processed(),
        lines_total: job.lines_total(),
        halt,
        elapsed: started.elapsed(),
    })
}

/// Stop the device and drop the link when `e` means the link is gone
fn failed(job: &mut dyn BuildJob, e: FabError) -> FabError {
    if e.is_transport() {
        if let Err(abort) = job.abort() {
            warn!("Could not stop device after link failure: {}", abort);
        }
    }
    e
}
