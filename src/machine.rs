//! Logical machine state: position, feedrate, tools and travel telemetry

use serde::{Deserialize, Serialize};
use std::fmt;

/// The controlled axes, in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
    A,
    B,
}

impl Axis {
    pub const ALL: [Axis; 5] = [Axis::X, Axis::Y, Axis::Z, Axis::A, Axis::B];

    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
            Axis::A => 3,
            Axis::B => 4,
        }
    }

    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
            Axis::A => 'A',
            Axis::B => 'B',
        }
    }

    pub fn from_letter(letter: char) -> Option<Axis> {
        match letter.to_ascii_uppercase() {
            'X' => Some(Axis::X),
            'Y' => Some(Axis::Y),
            'Z' => Some(Axis::Z),
            'A' => Some(Axis::A),
            'B' => Some(Axis::B),
            _ => None,
        }
    }
}

/// A point in machine space, millimetres on every axis
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position(pub [f64; 5]);

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Position([x, y, z, 0.0, 0.0])
    }

    pub fn get(&self, axis: Axis) -> f64 {
        self.0[axis.index()]
    }

    pub fn set(&mut self, axis: Axis, value: f64) {
        self.0[axis.index()] = value;
    }

    pub fn with(mut self, axis: Axis, value: f64) -> Self {
        self.set(axis, value);
        self
    }

    /// Euclidean distance across all axes
    pub fn distance(&self, other: &Position) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt()
    }

    /// Per-axis absolute deltas
    pub fn deltas(&self, other: &Position) -> [f64; 5] {
        let mut deltas = [0.0; 5];
        for (i, d) in deltas.iter_mut().enumerate() {
            *d = (self.0[i] - other.0[i]).abs();
        }
        deltas
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X{:.3} Y{:.3} Z{:.3}", self.0[0], self.0[1], self.0[2])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Clockwise,
    CounterClockwise,
}

/// Motor or spindle drive state
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DriveState {
    pub enabled: bool,
    pub direction: Direction,
    pub rpm: f64,
    pub pwm: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolState {
    pub motor: DriveState,
    pub spindle: DriveState,
    pub target_temperature: f64,
    pub current_temperature: f64,
    pub platform_target_temperature: f64,
    pub platform_temperature: f64,
    pub flood_coolant: bool,
    pub mist_coolant: bool,
    pub fan: bool,
    pub valve_open: bool,
    pub collet_open: bool,
}

/// Snapshot of the machine as the dispatch thread sees it.
///
/// `position` is the intended position, updated as soon as a move is accepted
/// for sending. `confirmed_position` only advances when the device acknowledges
/// the frame that carried the move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    pub position: Position,
    pub confirmed_position: Position,
    pub feedrate: f64,
    pub current_tool: usize,
    pub tools: Vec<ToolState>,
    pub drives_enabled: bool,
    pub clamp_open: bool,
    pub gear_ratio: u8,
    /// Total commanded travel, mm
    pub travel_distance: f64,
    /// Estimated machine time, minutes
    pub estimated_minutes: f64,
    pub ready: bool,
}

impl MachineState {
    pub fn new(tool_count: usize) -> Self {
        Self {
            position: Position::default(),
            confirmed_position: Position::default(),
            feedrate: 0.0,
            current_tool: 0,
            tools: vec![ToolState::default(); tool_count.max(1)],
            drives_enabled: false,
            clamp_open: false,
            gear_ratio: 0,
            travel_distance: 0.0,
            estimated_minutes: 0.0,
            ready: false,
        }
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    pub fn tool(&self) -> &ToolState {
        &self.tools[self.current_tool]
    }

    pub fn tool_mut(&mut self) -> &mut ToolState {
        &mut self.tools[self.current_tool]
    }

    /// Account for a move to `target` at the current feedrate.
    ///
    /// The feedrate is clamped so that no axis exceeds its own limit; a zero
    /// feedrate falls back to the fastest axis.
    pub fn record_move(&mut self, target: &Position, limits: &[f64; 5]) {
        let distance = self.position.distance(target);
        if distance <= 0.0 {
            return;
        }
        let rate = safe_feedrate(&self.position, target, self.feedrate, limits);
        self.travel_distance += distance;
        self.estimated_minutes += distance / rate;
    }

    pub fn record_dwell(&mut self, millis: f64) {
        self.estimated_minutes += millis.max(0.0) / 60_000.0;
    }
}

/// Fastest feedrate at which the move keeps every axis under its limit, mm/min
pub fn safe_feedrate(from: &Position, to: &Position, feedrate: f64, limits: &[f64; 5]) -> f64 {
    let fastest = limits.iter().cloned().fold(0.0, f64::max);
    let mut rate = if feedrate > 0.0 { feedrate } else { fastest };

    let distance = from.distance(to);
    if distance > 0.0 {
        for (delta, limit) in from.deltas(to).iter().zip(limits.iter()) {
            if *delta > 0.0 && *limit > 0.0 {
                // axis speed = rate * delta / distance
                let axis_cap = limit * distance / delta;
                rate = rate.min(axis_cap);
            }
        }
    }
    rate.max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: [f64; 5] = [5000.0, 5000.0, 200.0, 5000.0, 5000.0];

    #[test]
    fn test_distance() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(3.0, 4.0, 0.0);
        assert!((a.distance(&b) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_axis_letters_round_trip() {
        for axis in Axis::ALL {
            assert_eq!(Axis::from_letter(axis.letter()), Some(axis));
        }
        assert_eq!(Axis::from_letter('e'), None);
    }

    #[test]
    fn test_safe_feedrate_clamps_slow_axis() {
        let from = Position::new(0.0, 0.0, 0.0);
        let to = Position::new(0.0, 0.0, 10.0);
        assert_eq!(safe_feedrate(&from, &to, 3000.0, &LIMITS), 200.0);

        let flat = Position::new(10.0, 0.0, 0.0);
        assert_eq!(safe_feedrate(&from, &flat, 3000.0, &LIMITS), 3000.0);
    }

    #[test]
    fn test_zero_feedrate_uses_fastest_axis() {
        let from = Position::new(0.0, 0.0, 0.0);
        let to = Position::new(10.0, 0.0, 0.0);
        assert_eq!(safe_feedrate(&from, &to, 0.0, &LIMITS), 5000.0);
    }

    #[test]
    fn test_record_move_accumulates_time() {
        let mut state = MachineState::new(1);
        state.feedrate = 600.0;
        state.record_move(&Position::new(60.0, 0.0, 0.0), &LIMITS);
        assert!((state.travel_distance - 60.0).abs() < 1e-9);
        assert!((state.estimated_minutes - 0.1).abs() < 1e-9);

        state.record_dwell(6000.0);
        assert!((state.estimated_minutes - 0.2).abs() < 1e-9);
    }
}
