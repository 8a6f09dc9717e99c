//! fabd - serial build daemon for fabrication machines
//!
//! Streams line-oriented build files to a motion and tool controller over a
//! serial link, keeping the device's small command buffer full without ever
//! overrunning it.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use fabd::{BuildRunner, ConsolePrompt, DaemonConfig, Direct, GCodeSource, LinkRegistry, SerialDevice, SerialLink};
//! use std::path::Path;
//! use std::sync::atomic::AtomicBool;
//!
//! fn main() -> fabd::Result<()> {
//!     let config = DaemonConfig::load_from_path("config/default_config.yaml")?;
//!     let registry = LinkRegistry::new();
//!     let link = SerialLink::open(&config.link, &registry)?;
//!     let device = SerialDevice::connect(config.machine.clone(), link)?;
//!
//!     let source = GCodeSource::from_path(Path::new("part.gcode"))?;
//!     let mut job = Direct::new(BuildRunner::new(device, source, Box::new(ConsolePrompt)));
//!     let report = fabd::run_job(&mut job, config.build().tick_interval(), &AtomicBool::new(false), |_, _| {})?;
//!     println!("{} of {} lines", report.lines_processed, report.lines_total);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **ByteRing**: bounded byte ring between the link reader and the dispatcher
//! - **SerialLink**: port lifecycle, background reader, timed line reads
//! - **DeviceCommand**: one device action and its wire frame
//! - **CommandDispatcher**: instruction line to device commands
//! - **BuildRunner**: the tick-driven build state machine
//! - **BuildJob**: machine, local file and device storage routing

pub mod byte_ring;
pub mod commands;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod job;
pub mod json_output;
pub mod link;
pub mod loopback;
pub mod machine;
pub mod monitoring;
pub mod prompt;
pub mod protocol;
pub mod runner;
pub mod source;
pub mod virtual_printer;

// High-level exports for easy usage
pub use config::{BuildConfig, DaemonConfig, LinkConfig, MachineConfig, ParityConfig};
pub use device::{Device, SimulationDevice};
pub use driver::SerialDevice;
pub use error::{CommandError, CommandResult, FabError, Result};
pub use job::{run_job, BuildJob, Direct, JobReport, JobTarget, ToLocalFile, ToRemoteFile, UsingRemoteFile};
pub use link::{scan_ports, LinkRegistry, PortInfo, SerialLink};
pub use prompt::{AutoPrompt, ConsolePrompt, OperatorPrompt};
pub use runner::{BuildRunner, BuildStatus, RunState, Tick};
pub use source::GCodeSource;

// Lower-level pieces
pub use byte_ring::{ByteRing, RingError, SharedRing};
pub use commands::{DeviceCommand, StopKind, StopSignal};
pub use device::{FileCapture, PlaybackProgress, RemoteStorage, SdResponse};
pub use dispatcher::CommandDispatcher;
pub use json_output::{ErrorEvent, HaltEvent, JobEvent, JobStatus};
pub use machine::{Axis, Direction, MachineState, Position, ToolState};
pub use monitoring::{ProgressData, ProgressMonitor};
pub use virtual_printer::{PrinterOptions, VirtualPrinter};
