//! Instruction translation
//!
//! `CommandDispatcher` turns one instruction line into zero or more
//! [`DeviceCommand`]s. It keeps the modal state a line-oriented command stream
//! relies on: absolute or relative coordinates, units, the last motion code, the
//! feedrate and the position the stream believes the machine is at.
//!
//! Unrecognised codes are ignored. Only requests the machine can never satisfy
//! (a tool it does not have, a tool change with no tool) are errors.

use crate::commands::{DeviceCommand, StopKind, StopSignal};
use crate::config::MachineConfig;
use crate::machine::{Axis, Direction, Position};
use crate::{FabError, Result};
use std::collections::VecDeque;
use std::f64::consts::PI;
use tracing::debug;

const MM_PER_INCH: f64 = 25.4;

/// Longest chord used to approximate an arc, mm
const ARC_SEGMENT_MM: f64 = 1.0;

/// One parsed line: letter/value words plus any comment text
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Instruction {
    pub words: Vec<(char, f64)>,
    pub comment: Option<String>,
}

impl Instruction {
    pub fn parse(line: &str) -> Self {
        let mut words = Vec::new();
        let mut comments: Vec<String> = Vec::new();
        let mut chars = line.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '(' => {
                    let text: String = chars.by_ref().take_while(|c| *c != ')').collect();
                    comments.push(text.trim().to_string());
                }
                ';' => {
                    let text: String = chars.by_ref().collect();
                    comments.push(text.trim().to_string());
                }
                c if c.is_ascii_alphabetic() => {
                    if chars.peek().map_or(false, |n| n.is_ascii_alphabetic()) {
                        // a word, not a code
                        while chars.peek().map_or(false, |n| n.is_ascii_alphabetic()) {
                            chars.next();
                        }
                        continue;
                    }
                    let letter = c.to_ascii_uppercase();
                    let mut number = String::new();
                    while let Some(&next) = chars.peek() {
                        if next.is_ascii_digit() || next == '.' || next == '-' || next == '+' {
                            number.push(next);
                            chars.next();
                        } else if next == ' ' && number.is_empty() {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if let Ok(value) = number.parse::<f64>() {
                        words.push((letter, value));
                    } else if number.is_empty() && Axis::from_letter(letter).is_some() {
                        // bare axis letter, as in `G28 X Y`
                        words.push((letter, 0.0));
                    }
                }
                _ => {}
            }
        }

        comments.retain(|c| !c.is_empty());
        let comment = if comments.is_empty() { None } else { Some(comments.join(" ")) };
        Self { words, comment }
    }

    pub fn get(&self, letter: char) -> Option<f64> {
        self.words.iter().find(|(l, _)| *l == letter).map(|(_, v)| *v)
    }

    pub fn has(&self, letter: char) -> bool {
        self.get(letter).is_some()
    }

    /// Every code for `letter`, in order (a line may carry several G or M codes)
    pub fn codes(&self, letter: char) -> Vec<u32> {
        self.words
            .iter()
            .filter(|(l, v)| *l == letter && *v >= 0.0)
            .map(|(_, v)| v.round() as u32)
            .collect()
    }

    fn has_axis(&self) -> bool {
        Axis::ALL.iter().any(|a| self.has(a.letter()))
    }
}

pub struct CommandDispatcher {
    tool_count: usize,
    max_feedrate: f64,
    optional_stops: bool,
    absolute: bool,
    inches: bool,
    last_motion: Option<u32>,
    feedrate: f64,
    position: Position,
    tool: Option<usize>,
}

impl CommandDispatcher {
    pub fn new(config: &MachineConfig) -> Self {
        Self {
            tool_count: config.tool_count(),
            max_feedrate: config.max_feedrate(),
            optional_stops: config.optional_stops(),
            absolute: true,
            inches: false,
            last_motion: None,
            feedrate: 0.0,
            position: Position::default(),
            tool: None,
        }
    }

    /// Where the stream has commanded the machine to be
    pub fn position(&self) -> Position {
        self.position
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    /// Translate `line`, appending its commands to `queue`
    pub fn parse(&mut self, line: &str, queue: &mut VecDeque<DeviceCommand>) -> Result<()> {
        let instruction = Instruction::parse(line);
        if instruction.words.is_empty() {
            return Ok(());
        }

        if let Some(rate) = instruction.get('F') {
            self.feedrate = self.to_mm(rate);
            queue.push_back(DeviceCommand::SetFeedrate(self.feedrate));
        }

        let m_codes = instruction.codes('M');
        if let Some(tool) = instruction.get('T') {
            let tool = self.checked_tool(tool)?;
            self.tool = Some(tool);
            if !m_codes.contains(&6) {
                queue.push_back(DeviceCommand::SelectTool(tool));
            }
        }

        if m_codes.is_empty() {
            if let Some(rpm) = instruction.get('S') {
                if instruction.codes('G').is_empty() {
                    queue.push_back(DeviceCommand::SetSpindleRpm(rpm));
                }
            }
        }

        for code in m_codes {
            self.m_code(code, &instruction, queue)?;
        }

        let g_codes = instruction.codes('G');
        let uses_axes = g_codes.iter().any(|g| matches!(*g, 0..=3 | 28 | 92));
        for code in g_codes {
            self.g_code(code, &instruction, queue);
        }
        if !uses_axes && instruction.has_axis() {
            if let Some(code) = self.last_motion {
                self.g_code(code, &instruction, queue);
            }
        }
        Ok(())
    }

    fn checked_tool(&self, value: f64) -> Result<usize> {
        if value < 0.0 || value.fract() != 0.0 || value as usize >= self.tool_count {
            return Err(FabError::Configuration(format!(
                "tool {} requested but machine has {} tool(s)",
                value, self.tool_count
            )));
        }
        Ok(value as usize)
    }

    fn to_mm(&self, value: f64) -> f64 {
        if self.inches {
            value * MM_PER_INCH
        } else {
            value
        }
    }

    fn target(&self, instruction: &Instruction) -> Position {
        let mut target = self.position;
        for axis in Axis::ALL {
            if let Some(value) = instruction.get(axis.letter()) {
                let value = self.to_mm(value);
                if self.absolute {
                    target.set(axis, value);
                } else {
                    target.set(axis, self.position.get(axis) + value);
                }
            }
        }
        target
    }

    fn stop(&self, kind: StopKind, instruction: &Instruction, queue: &mut VecDeque<DeviceCommand>) {
        queue.push_back(DeviceCommand::WaitUntilBufferEmpty);
        queue.push_back(DeviceCommand::Halt(StopSignal::with_comment(kind, instruction.comment.as_deref())));
    }

    fn m_code(&mut self, code: u32, instruction: &Instruction, queue: &mut VecDeque<DeviceCommand>) -> Result<()> {
        use DeviceCommand::*;

        match code {
            0 => self.stop(StopKind::UnconditionalHalt, instruction, queue),
            1 => {
                if self.optional_stops {
                    self.stop(StopKind::OptionalHalt, instruction, queue)
                }
            }
            2 => self.stop(StopKind::ProgramEnd, instruction, queue),
            30 => self.stop(StopKind::ProgramRewind, instruction, queue),
            3 | 4 | 13 | 14 => {
                if let Some(rpm) = instruction.get('S') {
                    queue.push_back(SetSpindleRpm(rpm));
                }
                let direction = if code == 3 || code == 13 {
                    Direction::Clockwise
                } else {
                    Direction::CounterClockwise
                };
                queue.push_back(SetSpindleDirection(direction));
                queue.push_back(EnableSpindle);
                if code >= 13 {
                    queue.push_back(EnableFloodCoolant);
                }
            }
            5 => queue.push_back(DisableSpindle),
            6 => {
                let tool = self.tool.ok_or_else(|| {
                    FabError::Configuration("tool change (M6) without a tool number".to_string())
                })?;
                queue.push_back(RequestToolChange(tool));
            }
            7 => queue.push_back(EnableFloodCoolant),
            8 => queue.push_back(EnableMistCoolant),
            9 => queue.push_back(DisableCoolant),
            10 | 11 => {
                let index = instruction.get('Q').ok_or_else(|| {
                    FabError::Configuration(format!("clamp operation (M{}) without a Q clamp index", code))
                })? as u8;
                queue.push_back(if code == 10 { CloseClamp(index) } else { OpenClamp(index) });
            }
            17 => queue.push_back(EnableDrives),
            18 => queue.push_back(DisableDrives),
            21 => queue.push_back(OpenCollet),
            22 => queue.push_back(CloseCollet),
            40..=46 => queue.push_back(ChangeGearRatio((code - 40) as u8)),
            101 => {
                queue.push_back(SetMotorDirection(Direction::Clockwise));
                queue.push_back(EnableMotor);
            }
            102 => {
                queue.push_back(SetMotorDirection(Direction::CounterClockwise));
                queue.push_back(EnableMotor);
            }
            103 => queue.push_back(DisableMotor),
            104 => {
                if let Some(t) = instruction.get('S') {
                    queue.push_back(SetTemperature(t));
                }
            }
            105 => queue.push_back(ReadTemperature),
            106 => queue.push_back(EnableFan),
            107 => queue.push_back(DisableFan),
            108 => {
                if let Some(rpm) = instruction.get('R') {
                    queue.push_back(SetMotorRpm(rpm));
                }
                if let Some(pwm) = instruction.get('S') {
                    queue.push_back(SetMotorPwm(pwm.clamp(0.0, 255.0) as u8));
                }
            }
            126 => queue.push_back(OpenValve),
            127 => queue.push_back(CloseValve),
            140 => {
                if let Some(t) = instruction.get('S') {
                    queue.push_back(SetPlatformTemperature(t));
                }
            }
            other => debug!("Ignoring unsupported M{}", other),
        }
        Ok(())
    }

    fn g_code(&mut self, code: u32, instruction: &Instruction, queue: &mut VecDeque<DeviceCommand>) {
        match code {
            0 => {
                self.last_motion = Some(0);
                if !instruction.has_axis() {
                    return;
                }
                let target = self.target(instruction);
                queue.push_back(DeviceCommand::SetFeedrate(self.max_feedrate));
                queue.push_back(DeviceCommand::QueuePoint(target));
                queue.push_back(DeviceCommand::SetFeedrate(self.feedrate));
                self.position = target;
            }
            1 => {
                self.last_motion = Some(1);
                if !instruction.has_axis() {
                    return;
                }
                let target = self.target(instruction);
                queue.push_back(DeviceCommand::QueuePoint(target));
                self.position = target;
            }
            2 | 3 => {
                self.last_motion = Some(code);
                if !instruction.has_axis() {
                    return;
                }
                let target = self.target(instruction);
                let center = Position::new(
                    self.position.get(Axis::X) + self.to_mm(instruction.get('I').unwrap_or(0.0)),
                    self.position.get(Axis::Y) + self.to_mm(instruction.get('J').unwrap_or(0.0)),
                    0.0,
                );
                for point in arc_points(&self.position, &target, &center, code == 2) {
                    queue.push_back(DeviceCommand::QueuePoint(point));
                }
                self.position = target;
            }
            4 => {
                let millis = instruction
                    .get('P')
                    .or_else(|| instruction.get('S').map(|s| s * 1000.0))
                    .unwrap_or(0.0);
                queue.push_back(DeviceCommand::Delay(millis));
            }
            20 => self.inches = true,
            21 => self.inches = false,
            28 => {
                let mut axes: Vec<Axis> = Axis::ALL.iter().copied().filter(|a| instruction.has(a.letter())).collect();
                if axes.is_empty() {
                    axes = vec![Axis::X, Axis::Y, Axis::Z];
                }
                for axis in &axes {
                    self.position.set(*axis, 0.0);
                }
                queue.push_back(DeviceCommand::Home { axes, direction: Direction::CounterClockwise });
            }
            90 => self.absolute = true,
            91 => self.absolute = false,
            92 => {
                let mut position = self.position;
                for axis in Axis::ALL {
                    if let Some(value) = instruction.get(axis.letter()) {
                        position.set(axis, self.to_mm(value));
                    }
                }
                self.position = position;
                queue.push_back(DeviceCommand::SetCurrentPosition(position));
            }
            other => debug!("Ignoring unsupported G{}", other),
        }
    }
}

/// Chord endpoints for an arc in the XY plane, ending exactly at `end`
fn arc_points(start: &Position, end: &Position, center: &Position, clockwise: bool) -> Vec<Position> {
    let (cx, cy) = (center.get(Axis::X), center.get(Axis::Y));
    let radius = ((start.get(Axis::X) - cx).powi(2) + (start.get(Axis::Y) - cy).powi(2)).sqrt();
    if radius <= f64::EPSILON {
        return vec![*end];
    }

    let start_angle = (start.get(Axis::Y) - cy).atan2(start.get(Axis::X) - cx);
    let end_angle = (end.get(Axis::Y) - cy).atan2(end.get(Axis::X) - cx);
    let mut sweep = end_angle - start_angle;
    if clockwise && sweep >= 0.0 {
        sweep -= 2.0 * PI;
    } else if !clockwise && sweep <= 0.0 {
        sweep += 2.0 * PI;
    }

    let steps = ((sweep.abs() * radius) / ARC_SEGMENT_MM).ceil().max(1.0) as usize;
    let mut points = Vec::with_capacity(steps);
    for step in 1..steps {
        let fraction = step as f64 / steps as f64;
        let angle = start_angle + sweep * fraction;
        let mut point = *start;
        for axis in [Axis::Z, Axis::A, Axis::B] {
            let from = start.get(axis);
            point.set(axis, from + (end.get(axis) - from) * fraction);
        }
        point.set(Axis::X, cx + radius * angle.cos());
        point.set(Axis::Y, cy + radius * angle.sin());
        points.push(point);
    }
    points.push(*end);
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> CommandDispatcher {
        let mut config = MachineConfig::named("test");
        config.tool_count = Some(2);
        CommandDispatcher::new(&config)
    }

    fn translate(dispatcher: &mut CommandDispatcher, line: &str) -> Vec<DeviceCommand> {
        let mut queue = VecDeque::new();
        dispatcher.parse(line, &mut queue).unwrap();
        queue.into_iter().collect()
    }

    #[test]
    fn test_instruction_words_and_comments() {
        let instruction = Instruction::parse("N10 G1 X1.5 Y-2 (perimeter) ; outer");
        assert_eq!(instruction.get('G'), Some(1.0));
        assert_eq!(instruction.get('X'), Some(1.5));
        assert_eq!(instruction.get('Y'), Some(-2.0));
        assert_eq!(instruction.comment.as_deref(), Some("perimeter outer"));
    }

    #[test]
    fn test_linear_move_with_feedrate() {
        let mut d = dispatcher();
        assert_eq!(
            translate(&mut d, "G1 X10 F1200"),
            vec![
                DeviceCommand::SetFeedrate(1200.0),
                DeviceCommand::QueuePoint(Position::new(10.0, 0.0, 0.0)),
            ]
        );
    }

    #[test]
    fn test_modal_motion_and_relative_mode() {
        let mut d = dispatcher();
        translate(&mut d, "G1 X10");
        assert_eq!(translate(&mut d, "Y5"), vec![DeviceCommand::QueuePoint(Position::new(10.0, 5.0, 0.0))]);

        translate(&mut d, "G91");
        assert!(!d.is_absolute());
        assert_eq!(translate(&mut d, "G1 X-2 Z1"), vec![DeviceCommand::QueuePoint(Position::new(8.0, 5.0, 1.0))]);
    }

    #[test]
    fn test_inches_are_converted() {
        let mut d = dispatcher();
        translate(&mut d, "G20");
        assert_eq!(translate(&mut d, "G1 X1"), vec![DeviceCommand::QueuePoint(Position::new(25.4, 0.0, 0.0))]);
    }

    #[test]
    fn test_rapid_restores_feedrate() {
        let mut d = dispatcher();
        translate(&mut d, "G1 F600");
        let commands = translate(&mut d, "G0 X5");
        assert_eq!(
            commands,
            vec![
                DeviceCommand::SetFeedrate(5000.0),
                DeviceCommand::QueuePoint(Position::new(5.0, 0.0, 0.0)),
                DeviceCommand::SetFeedrate(600.0),
            ]
        );
    }

    #[test]
    fn test_quarter_arc_ends_on_target() {
        let mut d = dispatcher();
        translate(&mut d, "G1 X10 Y0");
        let commands = translate(&mut d, "G3 X0 Y10 I-10 J0");
        // quarter circle of radius 10 is ~15.7mm
        assert_eq!(commands.len(), 16);
        assert_eq!(commands.last(), Some(&DeviceCommand::QueuePoint(Position::new(0.0, 10.0, 0.0))));
        if let DeviceCommand::QueuePoint(p) = &commands[7] {
            let r = (p.get(Axis::X).powi(2) + p.get(Axis::Y).powi(2)).sqrt();
            assert!((r - 10.0).abs() < 1e-9);
            assert!(p.get(Axis::X) > 0.0 && p.get(Axis::Y) > 0.0);
        } else {
            panic!("expected a point");
        }
    }

    #[test]
    fn test_stops_wait_for_empty_buffer() {
        let mut d = dispatcher();
        assert_eq!(
            translate(&mut d, "M0 (check first layer)"),
            vec![
                DeviceCommand::WaitUntilBufferEmpty,
                DeviceCommand::Halt(StopSignal::new(StopKind::UnconditionalHalt, "Automatic Halt: check first layer")),
            ]
        );
        let rewind = translate(&mut d, "M30");
        assert_eq!(rewind[1], DeviceCommand::Halt(StopSignal::new(StopKind::ProgramRewind, "Program Rewind")));
    }

    #[test]
    fn test_optional_stop_can_be_disabled() {
        let mut config = MachineConfig::named("test");
        config.optional_stops = Some(false);
        let mut d = CommandDispatcher::new(&config);
        assert!(translate(&mut d, "M1").is_empty());
        assert_eq!(translate(&mut dispatcher(), "M1").len(), 2);
    }

    #[test]
    fn test_unknown_codes_are_ignored() {
        let mut d = dispatcher();
        assert!(translate(&mut d, "M999").is_empty());
        assert!(translate(&mut d, "G64 P0.01").is_empty());
        assert!(translate(&mut d, "garbage line").is_empty());
        assert!(translate(&mut d, "").is_empty());
    }

    #[test]
    fn test_tool_codes() {
        let mut d = dispatcher();
        assert_eq!(translate(&mut d, "T1"), vec![DeviceCommand::SelectTool(1)]);
        assert_eq!(translate(&mut d, "M6 T0"), vec![DeviceCommand::RequestToolChange(0)]);

        let mut queue = VecDeque::new();
        let err = d.parse("T5", &mut queue).unwrap_err();
        assert!(matches!(err, FabError::Configuration(_)));

        let mut fresh = dispatcher();
        assert!(matches!(fresh.parse("M6", &mut queue), Err(FabError::Configuration(_))));
    }

    #[test]
    fn test_coolant_codes() {
        let mut d = dispatcher();
        assert_eq!(translate(&mut d, "M7"), vec![DeviceCommand::EnableFloodCoolant]);
        assert_eq!(translate(&mut d, "M8"), vec![DeviceCommand::EnableMistCoolant]);
        assert_eq!(translate(&mut d, "M9"), vec![DeviceCommand::DisableCoolant]);
    }

    #[test]
    fn test_clamp_needs_index() {
        let mut d = dispatcher();
        assert_eq!(translate(&mut d, "M10 Q1"), vec![DeviceCommand::CloseClamp(1)]);
        assert_eq!(translate(&mut d, "M11 Q0"), vec![DeviceCommand::OpenClamp(0)]);

        let mut queue = VecDeque::new();
        assert!(matches!(d.parse("M10", &mut queue), Err(FabError::Configuration(_))));
        assert!(matches!(d.parse("M11", &mut queue), Err(FabError::Configuration(_))));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_temperature_and_motor_codes() {
        let mut d = dispatcher();
        assert_eq!(translate(&mut d, "M104 S200"), vec![DeviceCommand::SetTemperature(200.0)]);
        assert_eq!(translate(&mut d, "M140 S60"), vec![DeviceCommand::SetPlatformTemperature(60.0)]);
        assert_eq!(
            translate(&mut d, "M101"),
            vec![DeviceCommand::SetMotorDirection(Direction::Clockwise), DeviceCommand::EnableMotor]
        );
        assert_eq!(translate(&mut d, "M108 R1.5"), vec![DeviceCommand::SetMotorRpm(1.5)]);
    }

    #[test]
    fn test_home_and_set_position() {
        let mut d = dispatcher();
        translate(&mut d, "G1 X5 Y5 Z5");
        assert_eq!(
            translate(&mut d, "G28 X Y"),
            vec![DeviceCommand::Home { axes: vec![Axis::X, Axis::Y], direction: Direction::CounterClockwise }]
        );
        assert_eq!(d.position(), Position::new(0.0, 0.0, 5.0));
        assert_eq!(
            translate(&mut d, "G92 Z0"),
            vec![DeviceCommand::SetCurrentPosition(Position::new(0.0, 0.0, 0.0))]
        );
    }

    #[test]
    fn test_dwell_in_milliseconds() {
        let mut d = dispatcher();
        assert_eq!(translate(&mut d, "G4 P250"), vec![DeviceCommand::Delay(250.0)]);
        assert_eq!(translate(&mut d, "G4 S2"), vec![DeviceCommand::Delay(2000.0)]);
    }
}
