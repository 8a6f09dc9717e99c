//! Device commands
//!
//! A `DeviceCommand` is one atomic action translated from an instruction. It is
//! consumed by [`DeviceCommand::run`], which emits at most one wire frame through
//! the device and then applies the state change. Nothing is applied when the
//! frame is refused, so a retried command runs exactly once in effect.

use crate::device::Device;
use crate::error::{CommandError, CommandResult, FabError};
use crate::machine::{Axis, Direction, Position};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a build is being stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    UnconditionalHalt,
    OptionalHalt,
    ProgramEnd,
    ProgramRewind,
}

impl StopKind {
    /// Operator-facing prefix for halt messages
    pub fn label(&self) -> &'static str {
        match self {
            StopKind::UnconditionalHalt => "Automatic Halt",
            StopKind::OptionalHalt => "Optional Halt",
            StopKind::ProgramEnd => "Program End",
            StopKind::ProgramRewind => "Program Rewind",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopSignal {
    pub kind: StopKind,
    pub message: String,
}

impl StopSignal {
    pub fn new(kind: StopKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// Build the standard message, appending the instruction comment if any
    pub fn with_comment(kind: StopKind, comment: Option<&str>) -> Self {
        let message = match comment.map(str::trim).filter(|c| !c.is_empty()) {
            Some(comment) => format!("{}: {}", kind.label(), comment),
            None => kind.label().to_string(),
        };
        Self { kind, message }
    }
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceCommand {
    QueuePoint(Position),
    SetCurrentPosition(Position),
    SetFeedrate(f64),
    SelectTool(usize),
    RequestToolChange(usize),
    Home { axes: Vec<Axis>, direction: Direction },
    /// Dwell, milliseconds
    Delay(f64),
    EnableDrives,
    DisableDrives,
    /// Clamp index
    OpenClamp(u8),
    CloseClamp(u8),
    ChangeGearRatio(u8),
    SetMotorDirection(Direction),
    SetMotorRpm(f64),
    SetMotorPwm(u8),
    EnableMotor,
    DisableMotor,
    SetSpindleDirection(Direction),
    SetSpindleRpm(f64),
    EnableSpindle,
    DisableSpindle,
    SetTemperature(f64),
    ReadTemperature,
    SetPlatformTemperature(f64),
    EnableFloodCoolant,
    EnableMistCoolant,
    DisableCoolant,
    EnableFan,
    DisableFan,
    OpenValve,
    CloseValve,
    OpenCollet,
    CloseCollet,
    WaitUntilBufferEmpty,
    Halt(StopSignal),
}

impl DeviceCommand {
    /// Execute against `device`.
    ///
    /// `Retry` means the frame was not accepted and nothing changed.
    pub fn run(&self, device: &mut dyn Device) -> CommandResult {
        match self {
            DeviceCommand::Halt(signal) => return Err(CommandError::Stop(signal.clone())),
            DeviceCommand::WaitUntilBufferEmpty => {
                device.process_responses()?;
                if device.outstanding_commands() > 0 {
                    return Err(CommandError::Retry);
                }
                return Ok(());
            }
            DeviceCommand::SelectTool(index) | DeviceCommand::RequestToolChange(index) => {
                let tool_count = device.state().tool_count();
                if *index >= tool_count {
                    return Err(FabError::Configuration(format!(
                        "tool {} requested but machine has {} tool(s)",
                        index, tool_count
                    ))
                    .into());
                }
            }
            _ => {}
        }

        if let Some(frame) = self.frame(device) {
            let target = self.target(device);
            device.emit(&frame, target)?;
        }
        self.apply(device);
        Ok(())
    }

    /// Position the device reaches once this command's frame is acknowledged
    fn target(&self, device: &dyn Device) -> Option<Position> {
        match self {
            DeviceCommand::QueuePoint(p) | DeviceCommand::SetCurrentPosition(p) => Some(*p),
            DeviceCommand::Home { axes, .. } => Some(homed(device.state().position, axes)),
            _ => None,
        }
    }

    /// The wire frame for this command, if it has one
    pub fn frame(&self, device: &dyn Device) -> Option<String> {
        let state = device.state();
        let tool = tool_prefix(device);
        let frame = match self {
            DeviceCommand::QueuePoint(p) => {
                let mut frame = format!("G1 {}", coordinates(p, &state.position));
                if state.feedrate > 0.0 {
                    frame.push_str(&format!(" F{}", number(state.feedrate)));
                }
                frame
            }
            DeviceCommand::SetCurrentPosition(p) => format!("G92 {}", coordinates(p, &state.position)),
            DeviceCommand::SetFeedrate(_) => return None,
            DeviceCommand::SelectTool(index) => format!("T{}", index),
            DeviceCommand::RequestToolChange(index) => format!("M6 T{}", index),
            DeviceCommand::Home { axes, .. } => {
                let axes: Vec<String> = axes.iter().map(|a| format!("{}0", a.letter())).collect();
                if axes.is_empty() {
                    "G28".to_string()
                } else {
                    format!("G28 {}", axes.join(" "))
                }
            }
            DeviceCommand::Delay(millis) => format!("G4 P{}", number(*millis)),
            DeviceCommand::EnableDrives => "M17".to_string(),
            DeviceCommand::DisableDrives => "M18".to_string(),
            DeviceCommand::OpenClamp(index) => format!("M11 Q{}", index),
            DeviceCommand::CloseClamp(index) => format!("M10 Q{}", index),
            DeviceCommand::ChangeGearRatio(ratio) => format!("M{}", 40 + u32::from((*ratio).min(6))),
            DeviceCommand::SetMotorDirection(_) | DeviceCommand::SetSpindleDirection(_) => return None,
            DeviceCommand::SetMotorRpm(rpm) => format!("{}M108 R{}", tool, number(*rpm)),
            DeviceCommand::SetMotorPwm(pwm) => format!("{}M108 S{}", tool, pwm),
            DeviceCommand::EnableMotor => match state.tool().motor.direction {
                Direction::Clockwise => format!("{}M101", tool),
                Direction::CounterClockwise => format!("{}M102", tool),
            },
            DeviceCommand::DisableMotor => format!("{}M103", tool),
            DeviceCommand::SetSpindleRpm(rpm) => format!("S{}", number(*rpm)),
            DeviceCommand::EnableSpindle => {
                let spindle = state.tool().spindle;
                let code = match spindle.direction {
                    Direction::Clockwise => "M3",
                    Direction::CounterClockwise => "M4",
                };
                if spindle.rpm > 0.0 {
                    format!("{} S{}", code, number(spindle.rpm))
                } else {
                    code.to_string()
                }
            }
            DeviceCommand::DisableSpindle => "M5".to_string(),
            DeviceCommand::SetTemperature(t) => format!("{}M104 S{}", tool, number(*t)),
            DeviceCommand::ReadTemperature => format!("{}M105", tool),
            DeviceCommand::SetPlatformTemperature(t) => format!("{}M140 S{}", tool, number(*t)),
            DeviceCommand::EnableFloodCoolant => "M7".to_string(),
            DeviceCommand::EnableMistCoolant => "M8".to_string(),
            DeviceCommand::DisableCoolant => "M9".to_string(),
            DeviceCommand::EnableFan => format!("{}M106", tool),
            DeviceCommand::DisableFan => format!("{}M107", tool),
            DeviceCommand::OpenValve => format!("{}M126", tool),
            DeviceCommand::CloseValve => format!("{}M127", tool),
            DeviceCommand::OpenCollet => "M21".to_string(),
            DeviceCommand::CloseCollet => "M22".to_string(),
            DeviceCommand::WaitUntilBufferEmpty | DeviceCommand::Halt(_) => return None,
        };
        Some(frame)
    }

    fn apply(&self, device: &mut dyn Device) {
        let limits = device.machine().max_feedrates();
        let state = device.state_mut();
        match self {
            DeviceCommand::QueuePoint(p) => {
                state.record_move(p, &limits);
                state.position = *p;
            }
            DeviceCommand::SetCurrentPosition(p) => state.position = *p,
            DeviceCommand::SetFeedrate(rate) => state.feedrate = *rate,
            DeviceCommand::SelectTool(index) | DeviceCommand::RequestToolChange(index) => {
                state.current_tool = *index
            }
            DeviceCommand::Home { axes, .. } => state.position = homed(state.position, axes),
            DeviceCommand::Delay(millis) => state.record_dwell(*millis),
            DeviceCommand::EnableDrives => state.drives_enabled = true,
            DeviceCommand::DisableDrives => state.drives_enabled = false,
            DeviceCommand::OpenClamp(_) => state.clamp_open = true,
            DeviceCommand::CloseClamp(_) => state.clamp_open = false,
            DeviceCommand::ChangeGearRatio(ratio) => state.gear_ratio = (*ratio).min(6),
            DeviceCommand::SetMotorDirection(d) => state.tool_mut().motor.direction = *d,
            DeviceCommand::SetMotorRpm(rpm) => state.tool_mut().motor.rpm = *rpm,
            DeviceCommand::SetMotorPwm(pwm) => state.tool_mut().motor.pwm = Some(*pwm),
            DeviceCommand::EnableMotor => state.tool_mut().motor.enabled = true,
            DeviceCommand::DisableMotor => state.tool_mut().motor.enabled = false,
            DeviceCommand::SetSpindleDirection(d) => state.tool_mut().spindle.direction = *d,
            DeviceCommand::SetSpindleRpm(rpm) => state.tool_mut().spindle.rpm = *rpm,
            DeviceCommand::EnableSpindle => state.tool_mut().spindle.enabled = true,
            DeviceCommand::DisableSpindle => state.tool_mut().spindle.enabled = false,
            DeviceCommand::SetTemperature(t) => state.tool_mut().target_temperature = *t,
            DeviceCommand::SetPlatformTemperature(t) => {
                state.tool_mut().platform_target_temperature = *t
            }
            DeviceCommand::EnableFloodCoolant => state.tool_mut().flood_coolant = true,
            DeviceCommand::EnableMistCoolant => state.tool_mut().mist_coolant = true,
            DeviceCommand::DisableCoolant => {
                let tool = state.tool_mut();
                tool.flood_coolant = false;
                tool.mist_coolant = false;
            }
            DeviceCommand::EnableFan => state.tool_mut().fan = true,
            DeviceCommand::DisableFan => state.tool_mut().fan = false,
            DeviceCommand::OpenValve => state.tool_mut().valve_open = true,
            DeviceCommand::CloseValve => state.tool_mut().valve_open = false,
            DeviceCommand::OpenCollet => state.tool_mut().collet_open = true,
            DeviceCommand::CloseCollet => state.tool_mut().collet_open = false,
            DeviceCommand::ReadTemperature
            | DeviceCommand::WaitUntilBufferEmpty
            | DeviceCommand::Halt(_) => {}
        }
    }
}

fn homed(mut position: Position, axes: &[Axis]) -> Position {
    if axes.is_empty() {
        return Position::default();
    }
    for axis in axes {
        position.set(*axis, 0.0);
    }
    position
}

/// Tool selector prepended to per-tool codes on multi-tool machines
fn tool_prefix(device: &dyn Device) -> String {
    let state = device.state();
    if state.tool_count() > 1 {
        format!("T{} ", state.current_tool)
    } else {
        String::new()
    }
}

/// XYZ always; A and B only when either end of the move uses them
fn coordinates(target: &Position, current: &Position) -> String {
    let mut parts = Vec::with_capacity(5);
    for axis in Axis::ALL {
        let rotary = matches!(axis, Axis::A | Axis::B);
        if rotary && target.get(axis) == 0.0 && current.get(axis) == 0.0 {
            continue;
        }
        parts.push(format!("{}{}", axis.letter(), number(target.get(axis))));
    }
    parts.join(" ")
}

/// Shortest decimal form with at most three places
pub fn number(value: f64) -> String {
    let text = format!("{:.3}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;
    use crate::device::SimulationDevice;
    use crate::machine::MachineState;

    /// Device whose in-flight count drops by one per response poll
    struct DrainingDevice {
        config: MachineConfig,
        state: MachineState,
        outstanding: usize,
        emitted: usize,
    }

    impl DrainingDevice {
        fn new(outstanding: usize) -> Self {
            Self { config: MachineConfig::named("drain"), state: MachineState::new(1), outstanding, emitted: 0 }
        }
    }

    impl Device for DrainingDevice {
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

        fn emit(&mut self, _frame: &str, _target: Option<Position>) -> CommandResult {
            self.emitted += 1;
            Ok(())
        }

        fn outstanding_commands(&self) -> usize {
            self.outstanding
        }

        fn process_responses(&mut self) -> crate::Result<()> {
            self.outstanding = self.outstanding.saturating_sub(1);
            Ok(())
        }
    }

    fn sim(tools: usize) -> SimulationDevice {
        let mut config = MachineConfig::named("test");
        config.tool_count = Some(tools);
        SimulationDevice::new(config)
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(number(10.0), "10");
        assert_eq!(number(0.5), "0.5");
        assert_eq!(number(-0.0001), "0");
        assert_eq!(number(1.23456), "1.235");
    }

    #[test]
    fn test_queue_point_frame_and_state() {
        let mut device = sim(1);
        DeviceCommand::SetFeedrate(3000.0).run(&mut device).unwrap();
        let target = Position::new(10.0, 0.0, 0.0);
        let command = DeviceCommand::QueuePoint(target);
        assert_eq!(command.frame(&device).as_deref(), Some("G1 X10 Y0 Z0 F3000"));

        command.run(&mut device).unwrap();
        assert_eq!(device.state().position, target);
        assert!((device.state().travel_distance - 10.0).abs() < 1e-9);
        assert_eq!(device.frames_emitted(), 1);
    }

    #[test]
    fn test_select_tool_out_of_range_is_configuration_error() {
        let mut device = sim(2);
        DeviceCommand::SelectTool(1).run(&mut device).unwrap();
        assert_eq!(device.state().current_tool, 1);

        let err = DeviceCommand::SelectTool(2).run(&mut device).unwrap_err();
        assert!(matches!(err, CommandError::Fatal(FabError::Configuration(_))));
        assert_eq!(device.state().current_tool, 1);
    }

    #[test]
    fn test_halt_always_stops() {
        let mut device = sim(1);
        let signal = StopSignal::with_comment(StopKind::UnconditionalHalt, Some("change filament"));
        assert_eq!(signal.message, "Automatic Halt: change filament");

        match DeviceCommand::Halt(signal.clone()).run(&mut device) {
            Err(CommandError::Stop(got)) => assert_eq!(got, signal),
            other => panic!("expected stop, got {:?}", other),
        }
    }

    #[test]
    fn test_tool_prefix_on_multi_tool_machine() {
        let device = sim(2);
        assert_eq!(
            DeviceCommand::SetTemperature(200.0).frame(&device).as_deref(),
            Some("T0 M104 S200")
        );
        let single = sim(1);
        assert_eq!(DeviceCommand::SetTemperature(200.0).frame(&single).as_deref(), Some("M104 S200"));
    }

    #[test]
    fn test_motor_direction_selects_code() {
        let mut device = sim(1);
        DeviceCommand::SetMotorDirection(Direction::CounterClockwise).run(&mut device).unwrap();
        assert_eq!(DeviceCommand::EnableMotor.frame(&device).as_deref(), Some("M102"));
        DeviceCommand::EnableMotor.run(&mut device).unwrap();
        assert!(device.state().tool().motor.enabled);
    }

    #[test]
    fn test_wait_until_buffer_empty_retries_while_outstanding() {
        let mut device = DrainingDevice::new(2);
        let before = device.state().clone();

        assert!(matches!(DeviceCommand::WaitUntilBufferEmpty.run(&mut device), Err(CommandError::Retry)));
        assert_eq!(device.outstanding_commands(), 1);
        DeviceCommand::WaitUntilBufferEmpty.run(&mut device).unwrap();
        assert_eq!(device.outstanding_commands(), 0);

        assert_eq!(device.emitted, 0);
        assert_eq!(device.state(), &before);
        assert_eq!(DeviceCommand::WaitUntilBufferEmpty.frame(&device), None);
    }

    #[test]
    fn test_coolant_and_clamp_frames() {
        let mut device = sim(1);
        assert_eq!(DeviceCommand::EnableFloodCoolant.frame(&device).as_deref(), Some("M7"));
        assert_eq!(DeviceCommand::EnableMistCoolant.frame(&device).as_deref(), Some("M8"));
        DeviceCommand::EnableFloodCoolant.run(&mut device).unwrap();
        assert!(device.state().tool().flood_coolant);
        assert!(!device.state().tool().mist_coolant);

        assert_eq!(DeviceCommand::CloseClamp(2).frame(&device).as_deref(), Some("M10 Q2"));
        DeviceCommand::OpenClamp(2).run(&mut device).unwrap();
        assert!(device.state().clamp_open);
    }

    #[test]
    fn test_home_zeroes_named_axes() {
        let mut device = sim(1);
        DeviceCommand::SetCurrentPosition(Position::new(5.0, 6.0, 7.0)).run(&mut device).unwrap();
        let home = DeviceCommand::Home { axes: vec![Axis::X, Axis::Y], direction: Direction::CounterClockwise };
        assert_eq!(home.frame(&device).as_deref(), Some("G28 X0 Y0"));
        home.run(&mut device).unwrap();
        assert_eq!(device.state().position, Position::new(0.0, 0.0, 7.0));
    }
}
