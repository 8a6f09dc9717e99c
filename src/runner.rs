//! Build execution state machine
//!
//! `BuildRunner` walks an instruction source one tick at a time. Each tick
//! either translates a fresh instruction or re-runs the commands left over from
//! the previous one, so an instruction is always fully drained before the next
//! is read. A busy device makes the tick return [`Tick::Stalled`] without
//! advancing; the caller decides when to tick again.

use crate::commands::{DeviceCommand, StopKind, StopSignal};
use crate::device::{Device, SimulationDevice};
use crate::dispatcher::CommandDispatcher;
use crate::error::CommandError;
use crate::machine::Position;
use crate::prompt::OperatorPrompt;
use crate::source::GCodeSource;
use crate::{FabError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::watch;
use tracing::{debug, error, info, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    WaitingForDeviceFinish,
    Finished,
}

/// What one call to [`BuildRunner::run_next`] did
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    /// An instruction was fully consumed
    Progressed,
    /// The device refused a command; the same command runs next tick
    Stalled,
    /// Source exhausted, device still working
    Waiting,
    Halted { signal: StopSignal, continued: bool },
    Finished,
}

/// Snapshot published after every tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStatus {
    pub state: RunState,
    pub lines_processed: usize,
    pub lines_total: usize,
    pub outstanding_commands: usize,
    pub position: Position,
    pub confirmed_position: Position,
    pub travel_distance: f64,
    pub estimated_minutes: f64,
}

impl BuildStatus {
    pub fn percent(&self) -> f64 {
        if self.lines_total == 0 {
            return 100.0;
        }
        self.lines_processed as f64 * 100.0 / self.lines_total as f64
    }
}

pub struct BuildRunner<D: Device> {
    device: D,
    dispatcher: CommandDispatcher,
    source: GCodeSource,
    queue: VecDeque<DeviceCommand>,
    /// Commands of the current instruction are still queued
    pending: bool,
    state: RunState,
    lines_processed: usize,
    lines_total: usize,
    retries: u64,
    prompt: Box<dyn OperatorPrompt>,
    simulator: Option<SimulationDevice>,
    status: watch::Sender<BuildStatus>,
}

impl<D: Device> BuildRunner<D> {
    pub fn new(device: D, source: GCodeSource, prompt: Box<dyn OperatorPrompt>) -> Self {
        let dispatcher = CommandDispatcher::new(device.machine());
        let lines_total = source.line_count();
        let (status, _) = watch::channel(BuildStatus {
            state: RunState::Running,
            lines_processed: 0,
            lines_total,
            outstanding_commands: 0,
            position: device.state().position,
            confirmed_position: device.state().confirmed_position,
            travel_distance: 0.0,
            estimated_minutes: 0.0,
        });

        info!("Starting build of {} ({} lines) on {}", source.name(), lines_total, device.name());
        Self {
            device,
            dispatcher,
            source,
            queue: VecDeque::new(),
            pending: false,
            state: RunState::Running,
            lines_processed: 0,
            lines_total,
            retries: 0,
            prompt,
            simulator: None,
            status,
        }
    }

    /// Mirror every fresh instruction onto a preview device
    pub fn with_simulation(mut self, simulator: SimulationDevice) -> Self {
        if self.device.is_simulator() {
            debug!("{} is already simulated, no preview needed", self.device.name());
            return self;
        }
        self.simulator = Some(simulator);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<BuildStatus> {
        self.status.subscribe()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn finished(&self) -> bool {
        self.state == RunState::Finished
    }

    pub fn lines_processed(&self) -> usize {
        self.lines_processed
    }

    pub fn lines_total(&self) -> usize {
        self.lines_total
    }

    /// Stalled ticks so far
    pub fn retries(&self) -> u64 {
        self.retries
    }

    pub fn is_interactive(&self) -> bool {
        self.device.is_interactive()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn simulator(&self) -> Option<&SimulationDevice> {
        self.simulator.as_ref()
    }

    pub fn source(&self) -> &GCodeSource {
        &self.source
    }

    pub fn status(&self) -> BuildStatus {
        let state = self.device.state();
        BuildStatus {
            state: self.state,
            lines_processed: self.lines_processed,
            lines_total: self.lines_total,
            outstanding_commands: self.device.outstanding_commands(),
            position: state.position,
            confirmed_position: state.confirmed_position,
            travel_distance: state.travel_distance,
            estimated_minutes: state.estimated_minutes,
        }
    }

    /// Advance the build by at most one instruction
    pub fn run_next(&mut self) -> Result<Tick> {
        if self.state == RunState::Finished {
            return Ok(Tick::Finished);
        }
        if let Err(e) = self.device.check_errors() {
            return self.fail(e);
        }

        let tick = match self.state {
            RunState::WaitingForDeviceFinish => self.poll_finish(),
            _ if self.pending => self.drain_queue(),
            _ => match self.source.next() {
                Some(line) => {
                    if let Err(e) = self.dispatcher.parse(&line, &mut self.queue) {
                        return self.fail(e);
                    }
                    self.simulate();
                    self.drain_queue()
                }
                None => {
                    debug!("Source exhausted, waiting for {} to finish", self.device.name());
                    self.state = RunState::WaitingForDeviceFinish;
                    self.poll_finish()
                }
            },
        };

        self.publish();
        tick
    }

    fn drain_queue(&mut self) -> Result<Tick> {
        while let Some(command) = self.queue.front() {
            match command.run(&mut self.device) {
                Ok(()) => {
                    self.queue.pop_front();
                }
                Err(CommandError::Retry) => {
                    self.pending = true;
                    self.retries += 1;
                    return Ok(Tick::Stalled);
                }
                Err(CommandError::Stop(signal)) => return Ok(self.halt(signal)),
                Err(CommandError::Fatal(e)) => return self.fail(e),
            }
        }
        self.complete_instruction();
        Ok(Tick::Progressed)
    }

    fn complete_instruction(&mut self) {
        self.pending = false;
        self.lines_processed += 1;
    }

    fn halt(&mut self, signal: StopSignal) -> Tick {
        if signal.kind == StopKind::OptionalHalt && self.prompt.confirm_continue(&signal) {
            info!("Continuing past: {}", signal);
            self.queue.pop_front();
            if self.queue.is_empty() {
                self.complete_instruction();
            } else {
                self.pending = true;
            }
            return Tick::Halted { signal, continued: true };
        }

        if signal.kind != StopKind::OptionalHalt {
            self.prompt.notify(&signal);
        }
        info!("Build stopped: {}", signal);
        self.finish();
        Tick::Halted { signal, continued: false }
    }

    fn poll_finish(&mut self) -> Result<Tick> {
        match self.device.is_finished() {
            Ok(true) => {
                info!("Build complete: {} of {} lines", self.lines_processed, self.lines_total);
                self.finish();
                Ok(Tick::Finished)
            }
            Ok(false) => Ok(Tick::Waiting),
            Err(e) => self.fail(e),
        }
    }

    fn simulate(&mut self) {
        if let Some(simulator) = self.simulator.as_mut() {
            for command in &self.queue {
                if let Err(e) = command.run(simulator) {
                    trace!("preview ignored {:?}: {}", command, e);
                }
            }
        }
    }

    fn finish(&mut self) {
        self.state = RunState::Finished;
        self.queue.clear();
        self.pending = false;
    }

    fn fail<T>(&mut self, e: FabError) -> Result<T> {
        error!("Build failed after {} lines: {}", self.lines_processed, e);
        self.finish();
        self.publish();
        Err(e)
    }

    fn publish(&self) {
        self.status.send_replace(self.status());
    }

    /// Stop the build and the device now
    pub fn abort(&mut self) -> Result<()> {
        if self.state != RunState::Finished {
            info!("Aborting build after {} lines", self.lines_processed);
        }
        self.finish();
        self.publish();
        self.device.stop()
    }

    /// Wait for device traffic, at most `timeout`
    pub fn idle(&mut self, timeout: std::time::Duration) -> Result<()> {
        match self.device.idle(timeout) {
            Ok(()) => Ok(()),
            Err(e) => self.fail(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;
    use crate::error::CommandResult;
    use crate::machine::MachineState;
    use crate::prompt::AutoPrompt;

    /// Device with a fixed number of buffer slots, acknowledged by hand
    struct SlotDevice {
        config: MachineConfig,
        state: MachineState,
        slots: usize,
        in_flight: usize,
        frames: Vec<String>,
    }

    impl SlotDevice {
        fn new(slots: usize) -> Self {
            let config = MachineConfig::named("slots");
            Self { state: MachineState::new(config.tool_count()), config, slots, in_flight: 0, frames: Vec::new() }
        }

        fn ack(&mut self) {
            self.in_flight -= 1;
        }
    }

    impl Device for SlotDevice {
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

        fn emit(&mut self, frame: &str, _target: Option<Position>) -> CommandResult {
            if self.in_flight >= self.slots {
                return Err(CommandError::Retry);
            }
            self.in_flight += 1;
            self.frames.push(frame.to_string());
            Ok(())
        }

        fn outstanding_commands(&self) -> usize {
            self.in_flight
        }
    }

    fn runner(lines: &[&str], slots: usize, continue_optional: bool) -> BuildRunner<SlotDevice> {
        let source = GCodeSource::from_lines("test", lines.iter().map(|l| l.to_string()).collect());
        BuildRunner::new(SlotDevice::new(slots), source, Box::new(AutoPrompt::new(continue_optional)))
    }

    #[test]
    fn test_single_slot_device_stalls_until_acknowledged() {
        let mut runner = runner(&["G1 X10", "M104 S200", "G1 X0"], 1, false);

        assert_eq!(runner.run_next().unwrap(), Tick::Progressed);
        assert_eq!(runner.lines_processed(), 1);

        assert_eq!(runner.run_next().unwrap(), Tick::Stalled);
        assert_eq!(runner.run_next().unwrap(), Tick::Stalled);
        assert_eq!(runner.lines_processed(), 1);

        runner.device_mut().ack();
        assert_eq!(runner.run_next().unwrap(), Tick::Progressed);
        assert_eq!(runner.lines_processed(), 2);

        assert_eq!(runner.run_next().unwrap(), Tick::Stalled);
        assert_eq!(runner.lines_processed(), 2);
        runner.device_mut().ack();
        assert_eq!(runner.run_next().unwrap(), Tick::Progressed);
        assert_eq!(runner.lines_processed(), 3);

        assert_eq!(runner.run_next().unwrap(), Tick::Waiting);
        assert_eq!(runner.state(), RunState::WaitingForDeviceFinish);
        runner.device_mut().ack();
        assert_eq!(runner.run_next().unwrap(), Tick::Finished);
        assert!(runner.finished());

        assert_eq!(runner.lines_processed(), 3);
        assert_eq!(runner.retries(), 3);
        assert_eq!(runner.device().frames, vec!["G1 X10 Y0 Z0", "M104 S200", "G1 X0 Y0 Z0"]);
    }

    #[test]
    fn test_unconditional_halt_waits_for_buffer_then_finishes() {
        let mut runner = runner(&["G1 X10", "M0 (swap nozzle)", "G1 X20"], 4, true);

        assert_eq!(runner.run_next().unwrap(), Tick::Progressed);
        assert_eq!(runner.run_next().unwrap(), Tick::Stalled);
        assert_eq!(runner.lines_processed(), 1);

        runner.device_mut().ack();
        match runner.run_next().unwrap() {
            Tick::Halted { signal, continued } => {
                assert_eq!(signal.kind, StopKind::UnconditionalHalt);
                assert_eq!(signal.message, "Automatic Halt: swap nozzle");
                assert!(!continued);
            }
            other => panic!("expected halt, got {:?}", other),
        }
        assert_eq!(runner.state(), RunState::Finished);

        assert_eq!(runner.run_next().unwrap(), Tick::Finished);
        assert_eq!(runner.source().remaining(), 1);
        assert_eq!(runner.lines_processed(), 1);
        assert_eq!(runner.device().frames.len(), 1);
    }

    #[test]
    fn test_optional_halt_continue_drops_only_the_halt() {
        let mut runner = runner(&["M1", "G1 X5"], 4, true);
        match runner.run_next().unwrap() {
            Tick::Halted { continued, .. } => assert!(continued),
            other => panic!("expected halt, got {:?}", other),
        }
        assert_eq!(runner.state(), RunState::Running);
        assert_eq!(runner.lines_processed(), 1);

        assert_eq!(runner.run_next().unwrap(), Tick::Progressed);
        assert_eq!(runner.device().frames, vec!["G1 X5 Y0 Z0"]);
    }

    #[test]
    fn test_optional_halt_stop_finishes() {
        let mut runner = runner(&["M1", "G1 X5"], 4, false);
        assert!(matches!(runner.run_next().unwrap(), Tick::Halted { continued: false, .. }));
        assert!(runner.finished());
        assert!(runner.device().frames.is_empty());
    }

    #[test]
    fn test_configuration_error_finishes_the_build() {
        let mut runner = runner(&["G1 X1", "T7", "G1 X2"], 4, false);
        runner.run_next().unwrap();
        let err = runner.run_next().unwrap_err();
        assert!(matches!(err, FabError::Configuration(_)));
        assert!(runner.finished());
        assert_eq!(runner.run_next().unwrap(), Tick::Finished);
    }

    #[test]
    fn test_status_is_published() {
        let mut runner = runner(&["G1 X10 F600", "G1 X20"], 4, false);
        let status = runner.subscribe();
        runner.run_next().unwrap();
        runner.run_next().unwrap();

        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.lines_processed, 2);
        assert_eq!(snapshot.lines_total, 2);
        assert_eq!(snapshot.outstanding_commands, 2);
        assert_eq!(snapshot.position, Position::new(20.0, 0.0, 0.0));
        assert!((snapshot.percent() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_preview_swallows_halts() {
        let sim = SimulationDevice::new(MachineConfig::named("preview"));
        let mut runner = runner(&["G1 X3", "M1", "G1 X4"], 8, true).with_simulation(sim);
        while !runner.finished() {
            runner.run_next().unwrap();
            runner.device_mut().in_flight = 0;
        }
        let preview = runner.simulator().unwrap();
        assert_eq!(preview.state().position, Position::new(4.0, 0.0, 0.0));
        assert_eq!(preview.frames_emitted(), 2);
    }
}
