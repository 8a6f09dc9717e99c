//! Device abstraction
//!
//! A `Device` owns the logical machine state and the transport that carries
//! wire frames. Commands reach it only through [`Device::emit`], which accepts a
//! frame into the outstanding-buffer accounting or refuses it with `Retry`.

use crate::config::MachineConfig;
use crate::error::{CommandResult, FabError, Result};
use crate::machine::{MachineState, Position};
use std::path::Path;
use std::time::Duration;
use tracing::trace;

pub trait Device: Send {
    fn name(&self) -> &str;

    fn machine(&self) -> &MachineConfig;

    fn state(&self) -> &MachineState;

    fn state_mut(&mut self) -> &mut MachineState;

    /// Send one frame. `target` is the position the machine holds once the
    /// frame is acknowledged.
    fn emit(&mut self, frame: &str, target: Option<Position>) -> CommandResult;

    /// Commands sent but not yet acknowledged
    fn outstanding_commands(&self) -> usize;

    /// Drain any acknowledgements that have already arrived, without blocking
    fn process_responses(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_finished(&mut self) -> Result<bool> {
        self.process_responses()?;
        Ok(self.outstanding_commands() == 0)
    }

    /// Surface faults the device reported since the last check
    fn check_errors(&mut self) -> Result<()> {
        Ok(())
    }

    /// False when frames go to a capture file instead of a live machine
    fn is_interactive(&self) -> bool {
        true
    }

    fn is_simulator(&self) -> bool {
        false
    }

    /// Emergency stop; forgets everything in flight
    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// Wait for inbound traffic, at most `timeout`
    fn idle(&mut self, timeout: Duration) -> Result<()> {
        std::thread::sleep(timeout);
        Ok(())
    }

    /// Release the transport. Further emits fail.
    fn disconnect(&mut self) {}

    fn file_capture(&mut self) -> Option<&mut dyn FileCapture> {
        None
    }

    fn remote_storage(&mut self) -> Option<&mut dyn RemoteStorage> {
        None
    }
}

/// Frames redirected into a local file
pub trait FileCapture {
    fn begin_capture(&mut self, path: &Path) -> Result<()>;

    /// Stop capturing and return the number of bytes written
    fn end_capture(&mut self) -> Result<u64>;

    fn is_capturing(&self) -> bool;
}

/// Progress of a build playing from device storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackProgress {
    pub bytes_done: u64,
    pub bytes_total: u64,
}

/// Build files stored on the device itself
pub trait RemoteStorage {
    /// Start saving subsequent frames to `name` on the device
    fn begin_remote_capture(&mut self, name: &str) -> Result<SdResponse>;

    /// Finish saving; returns bytes sent while capturing
    fn end_remote_capture(&mut self) -> Result<u64>;

    /// Select `name` and start playing it
    fn begin_remote_playback(&mut self, name: &str) -> Result<SdResponse>;

    /// `None` once the device reports it is no longer playing
    fn playback_progress(&mut self) -> Result<Option<PlaybackProgress>>;
}

/// Outcome of a device storage request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdResponse {
    Success,
    NoCard,
    InitFailed,
    BadPartition,
    BadFilesystem,
    BadRootDirectory,
    Locked,
    NoFile,
    Generic,
}

impl SdResponse {
    pub fn message(&self) -> &'static str {
        match self {
            SdResponse::Success => "OK",
            SdResponse::NoCard => {
                "No SD card was detected. Make sure a working, formatted card is in the controller's slot and try again."
            }
            SdResponse::InitFailed => "Unable to initialize the SD card. Make sure the card works properly.",
            SdResponse::BadPartition => {
                "Unable to read the SD card's partition table. Check that the card is partitioned properly, then reset the device."
            }
            SdResponse::BadFilesystem => {
                "Unable to open the filesystem on the SD card. It needs a single FAT16 partition."
            }
            SdResponse::BadRootDirectory => {
                "Unable to read the SD card's root directory. Check that the card was formatted properly."
            }
            SdResponse::Locked => "The SD card is locked. Remove it, switch the lock off and try again.",
            SdResponse::NoFile => "The build file was not found on the SD card.",
            SdResponse::Generic => "Unknown SD card error.",
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            SdResponse::Success => Ok(()),
            failure => Err(FabError::RemoteStorage(failure.message().to_string())),
        }
    }
}

/// Device that accepts everything at once. Drives the preview path and dry runs.
#[derive(Debug)]
pub struct SimulationDevice {
    config: MachineConfig,
    state: MachineState,
    frames: usize,
}

impl SimulationDevice {
    pub fn new(config: MachineConfig) -> Self {
        let mut state = MachineState::new(config.tool_count());
        state.ready = true;
        Self { config, state, frames: 0 }
    }

    pub fn frames_emitted(&self) -> usize {
        self.frames
    }
}

impl Device for SimulationDevice {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn machine(&self) -> &MachineConfig {
        &self.config
    }

    fn state(&self) -> &MachineState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut MachineState {
        &mut self.state
    }

    fn emit(&mut self, frame: &str, target: Option<Position>) -> CommandResult {
        trace!("sim <- {}", frame);
        self.frames += 1;
        if let Some(target) = target {
            self.state.confirmed_position = target;
        }
        Ok(())
    }

    fn outstanding_commands(&self) -> usize {
        0
    }

    fn is_simulator(&self) -> bool {
        true
    }

    fn idle(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}
