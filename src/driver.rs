//! Line-protocol device driver
//!
//! Handles the connection sequence (optional reset pulse, `start` handshake,
//! absolute positioning), command buffer accounting against the controller's
//! finite receive buffer, and file capture to local or device storage.

use crate::config::MachineConfig;
use crate::device::{Device, FileCapture, PlaybackProgress, RemoteStorage, SdResponse};
use crate::error::{CommandError, CommandResult};
use crate::link::SerialLink;
use crate::machine::{MachineState, Position};
use crate::protocol::{self, Reply, ReplyParser};
use crate::{FabError, Result};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const HISTORY_LINES: usize = 32;

#[derive(Debug, Clone, PartialEq)]
struct InFlight {
    /// Bytes on the wire, numbering included
    bytes: usize,
    target: Option<Position>,
    /// Frame text before numbering, kept for resends
    frame: String,
    line_number: Option<u64>,
}

/// Bytes and frames sent but not yet acknowledged
#[derive(Debug)]
pub struct CommandBuffer {
    in_flight: VecDeque<InFlight>,
    bytes: usize,
    max_bytes: usize,
    max_commands: Option<usize>,
}

impl CommandBuffer {
    pub fn new(max_bytes: usize, max_commands: Option<usize>) -> Self {
        Self { in_flight: VecDeque::new(), bytes: 0, max_bytes, max_commands }
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    fn fits(&self, frame_bytes: usize) -> bool {
        let count_ok = self.max_commands.map_or(true, |max| self.in_flight.len() < max);
        count_ok && self.bytes + frame_bytes <= self.max_bytes
    }

    fn push(&mut self, entry: InFlight) {
        self.bytes += entry.bytes;
        self.in_flight.push_back(entry);
    }

    /// Retire the oldest frame. `None` if nothing was in flight.
    fn acknowledge(&mut self) -> Option<InFlight> {
        let entry = self.in_flight.pop_front()?;
        self.bytes = self.bytes.saturating_sub(entry.bytes);
        Some(entry)
    }

    fn clear(&mut self) {
        self.in_flight.clear();
        self.bytes = 0;
    }
}

struct LocalCapture {
    path: PathBuf,
    writer: BufWriter<File>,
    bytes: u64,
}

struct RemoteCapture {
    name: String,
    bytes: u64,
}

pub struct SerialDevice {
    config: MachineConfig,
    state: MachineState,
    link: Option<SerialLink>,
    parser: ReplyParser,
    buffer: CommandBuffer,
    capture: Option<LocalCapture>,
    remote_capture: Option<RemoteCapture>,
    fault: Option<String>,
    history: VecDeque<String>,
    /// Last line number sent
    line_number: u64,
}

impl SerialDevice {
    fn build(config: MachineConfig, link: Option<SerialLink>) -> Result<Self> {
        let buffer = CommandBuffer::new(config.buffer_bytes(), config.max_outstanding_commands);
        Ok(Self {
            state: MachineState::new(config.tool_count()),
            parser: ReplyParser::new()?,
            config,
            link,
            buffer,
            capture: None,
            remote_capture: None,
            fault: None,
            history: VecDeque::with_capacity(HISTORY_LINES),
            line_number: 0,
        })
    }

    /// Take over an open link and run the connection sequence
    pub fn connect(config: MachineConfig, link: SerialLink) -> Result<Self> {
        let mut device = Self::build(config, Some(link))?;
        device.initialize()?;
        Ok(device)
    }

    /// Device without a link; only file capture works
    pub fn offline(config: MachineConfig) -> Result<Self> {
        let mut device = Self::build(config, None)?;
        device.state.ready = true;
        Ok(device)
    }

    fn initialize(&mut self) -> Result<()> {
        info!("Initializing {} on {}", self.config.name, self.link()?.name());

        if self.config.reset_on_connect() {
            self.link()?.pulse_reset()?;
            self.link()?.purge()?;
        }

        if self.config.wait_for_start() {
            self.wait_for_start()?;
        } else {
            self.state.ready = true;
        }

        self.emit_now("G90")?;
        self.drain_within(self.config.start_timeout())?;
        info!("{} ready", self.config.name);
        Ok(())
    }

    fn wait_for_start(&mut self) -> Result<()> {
        let timeout = self.config.start_timeout();
        let deadline = Instant::now() + timeout;
        while !self.state.ready {
            let now = Instant::now();
            if now >= deadline {
                return Err(FabError::Connection(format!(
                    "{} did not report start within {:?}",
                    self.config.name, timeout
                )));
            }
            let line = self.link()?.read_line(deadline - now)?;
            match line.as_deref().map(|l| self.parser.parse(l)) {
                Some(Reply::Start) => {
                    info!("{} reports start", self.config.name);
                    self.state.ready = true;
                }
                Some(other) => debug!("Ignoring {:?} before start", other),
                None => {}
            }
        }
        Ok(())
    }

    pub fn link(&self) -> Result<&SerialLink> {
        self.link
            .as_ref()
            .ok_or_else(|| FabError::NotConnected(self.config.name.clone()))
    }

    pub fn buffer(&self) -> &CommandBuffer {
        &self.buffer
    }

    /// Recent informational lines from the device, oldest first
    pub fn history(&self) -> impl Iterator<Item = &str> {
        self.history.iter().map(String::as_str)
    }

    fn clean(&self, frame: &str) -> String {
        let frame = frame.trim();
        if self.config.strip_spaces() {
            frame.chars().filter(|c| *c != ' ').collect()
        } else {
            frame.to_string()
        }
    }

    /// Wire text for `line` and the line number it carries
    fn wire(&self, line: &str) -> (Option<u64>, String) {
        if self.config.line_numbers() {
            let (number, wire) = protocol::number_frame(self.line_number, line);
            (Some(number), wire)
        } else {
            (None, line.to_string())
        }
    }

    /// Write a frame and account for it, without the buffer-space check
    fn emit_now(&mut self, line: &str) -> Result<()> {
        let (number, wire) = self.wire(line);
        self.transmit(line, number, &wire, None)
    }

    fn transmit(&mut self, line: &str, number: Option<u64>, wire: &str, target: Option<Position>) -> Result<()> {
        self.link()?.write_line(wire)?;
        if let Some(number) = number {
            self.line_number = number;
        }
        self.buffer.push(InFlight { bytes: wire.len() + 1, target, frame: line.to_string(), line_number: number });
        Ok(())
    }

    fn desync(&mut self, line: &str) -> FabError {
        let err = FabError::ProtocolDesync(format!("{:?} from {} with nothing in flight", line, self.config.name));
        self.disconnect();
        err
    }

    /// Send the oldest in-flight frame again, resetting the device's line
    /// counter first when it asked for a different line
    fn resend(&mut self, requested: Option<u64>, line: &str) -> Result<()> {
        warn!("{}: {}", self.config.name, line);
        let entry = match self.buffer.acknowledge() {
            Some(entry) => entry,
            None => return Err(self.desync(line)),
        };
        let number = match entry.line_number {
            Some(number) => number,
            None => return self.transmit(&entry.frame, None, &entry.frame, entry.target),
        };
        if requested != Some(number) {
            warn!(
                "{} asked for line {:?} but the oldest frame in flight is {}, resetting line number",
                self.config.name, requested, number
            );
            let sync = format!("N{} M110", number.saturating_sub(1));
            let (sync_number, wire) = protocol::number_frame(self.line_number, &sync);
            self.transmit(&sync, Some(sync_number), &wire, None)?;
        }
        let wire = protocol::numbered(number, &entry.frame);
        self.transmit(&entry.frame, Some(number), &wire, entry.target)
    }

    fn handle_reply(&mut self, line: &str) -> Result<()> {
        match self.parser.parse(line) {
            Reply::Ok { temperature, platform_temperature } => {
                let acked = match self.buffer.acknowledge() {
                    Some(acked) => acked,
                    None => return Err(self.desync(line)),
                };
                if let Some(target) = acked.target {
                    self.state.confirmed_position = target;
                }
                if let Some(t) = temperature {
                    self.state.tool_mut().current_temperature = t;
                }
                if let Some(t) = platform_temperature {
                    self.state.tool_mut().platform_temperature = t;
                }
            }
            Reply::Start => {
                if !self.buffer.is_empty() {
                    warn!(
                        "{} restarted with {} command(s) in flight",
                        self.config.name,
                        self.buffer.len()
                    );
                    self.buffer.clear();
                }
                self.line_number = 0;
                self.state.ready = true;
            }
            Reply::Resend(requested) => self.resend(requested, line)?,
            Reply::Fault(message) => {
                error!("{}: {}", self.config.name, message);
                self.fault = Some(message);
            }
            Reply::Info(message) => {
                info!("{}: {}", self.config.name, message);
                if self.history.len() == HISTORY_LINES {
                    self.history.pop_front();
                }
                self.history.push_back(message);
            }
        }
        Ok(())
    }

    /// Block until everything in flight is acknowledged
    fn drain_within(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            self.process_responses()?;
            if self.buffer.is_empty() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(FabError::Connection(format!(
                    "{}: {} command(s) unacknowledged after {:?}",
                    self.config.name,
                    self.buffer.len(),
                    timeout
                )));
            }
            if let Some(line) = self.link()?.read_line(deadline - now)? {
                self.handle_reply(&line)?;
            }
        }
    }

    /// Send a storage request and collect the informational lines it produced
    fn request(&mut self, line: &str) -> Result<Vec<String>> {
        let timeout = self.config.sd_timeout();
        self.drain_within(timeout)?;
        self.history.clear();
        self.emit_now(line)?;
        self.drain_within(timeout)?;
        Ok(self.history.drain(..).collect())
    }
}

impl Device for SerialDevice {
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
        let line = self.clean(frame);
        if line.is_empty() {
            return Ok(());
        }

        if let Some(capture) = self.capture.as_mut() {
            writeln!(capture.writer, "{}", line)?;
            capture.bytes += line.len() as u64 + 1;
            if let Some(target) = target {
                self.state.confirmed_position = target;
            }
            return Ok(());
        }

        self.process_responses()?;
        let (number, wire) = self.wire(&line);
        let frame_bytes = wire.len() + 1;
        if frame_bytes > self.buffer.max_bytes() {
            return Err(FabError::Configuration(format!(
                "{}-byte frame {:?} can never fit the {}-byte device buffer",
                frame_bytes,
                wire,
                self.buffer.max_bytes()
            ))
            .into());
        }
        if !self.buffer.fits(frame_bytes) {
            return Err(CommandError::Retry);
        }

        self.transmit(&line, number, &wire, target)?;
        if let Some(remote) = self.remote_capture.as_mut() {
            remote.bytes += line.len() as u64 + 1;
        }
        Ok(())
    }

    fn outstanding_commands(&self) -> usize {
        self.buffer.len()
    }

    fn process_responses(&mut self) -> Result<()> {
        let link = match self.link.as_ref() {
            Some(link) => link,
            None => return Ok(()),
        };
        let connected = link.is_connected();
        while let Some(line) = self.link()?.try_read_line()? {
            self.handle_reply(&line)?;
        }
        if !connected {
            return Err(FabError::Disconnected(format!(
                "{}: {}",
                self.config.name,
                self.link
                    .as_ref()
                    .and_then(|l| l.fault())
                    .unwrap_or_else(|| "link closed".to_string())
            )));
        }
        Ok(())
    }

    fn check_errors(&mut self) -> Result<()> {
        if let Some(fault) = self.fault.take() {
            return Err(FabError::DeviceFault(fault));
        }
        Ok(())
    }

    fn is_interactive(&self) -> bool {
        self.capture.is_none()
    }

    fn stop(&mut self) -> Result<()> {
        warn!("Stopping {}", self.config.name);
        self.buffer.clear();
        match self.link.as_ref() {
            Some(link) if link.is_connected() => link.write_line("M112"),
            _ => Ok(()),
        }
    }

    fn idle(&mut self, timeout: Duration) -> Result<()> {
        let line = match self.link.as_ref() {
            Some(link) => link.read_line(timeout)?,
            None => return Ok(()),
        };
        if let Some(line) = line {
            self.handle_reply(&line)?;
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.buffer.clear();
    }

    fn file_capture(&mut self) -> Option<&mut dyn FileCapture> {
        Some(self as &mut dyn FileCapture)
    }

    fn remote_storage(&mut self) -> Option<&mut dyn RemoteStorage> {
        if self.link.is_some() {
            Some(self as &mut dyn RemoteStorage)
        } else {
            None
        }
    }
}

impl FileCapture for SerialDevice {
    fn begin_capture(&mut self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .map_err(|e| FabError::Connection(format!("Failed to create {}: {}", path.display(), e)))?;
        info!("Capturing {} to {}", self.config.name, path.display());
        self.capture = Some(LocalCapture { path: path.to_path_buf(), writer: BufWriter::new(file), bytes: 0 });
        Ok(())
    }

    fn end_capture(&mut self) -> Result<u64> {
        let mut capture = self
            .capture
            .take()
            .ok_or_else(|| FabError::Configuration("no local capture in progress".to_string()))?;
        capture.writer.flush()?;
        info!("Wrote {} bytes to {}", capture.bytes, capture.path.display());
        Ok(capture.bytes)
    }

    fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }
}

impl RemoteStorage for SerialDevice {
    fn begin_remote_capture(&mut self, name: &str) -> Result<SdResponse> {
        let replies = self.request(&format!("M28 {}", name))?;
        let response = replies
            .iter()
            .find_map(|l| protocol::sd_response(l))
            .unwrap_or(SdResponse::Generic);
        if response == SdResponse::Success {
            self.remote_capture = Some(RemoteCapture { name: name.to_string(), bytes: 0 });
        }
        Ok(response)
    }

    fn end_remote_capture(&mut self) -> Result<u64> {
        let timeout = self.config.sd_timeout();
        self.drain_within(timeout)?;
        let capture = self
            .remote_capture
            .take()
            .ok_or_else(|| FabError::RemoteStorage("no remote capture in progress".to_string()))?;
        self.request("M29")?;
        info!("Saved {} bytes to {} on {}", capture.bytes, capture.name, self.config.name);
        Ok(capture.bytes)
    }

    fn begin_remote_playback(&mut self, name: &str) -> Result<SdResponse> {
        let replies = self.request(&format!("M23 {}", name))?;
        let response = replies
            .iter()
            .find_map(|l| protocol::sd_response(l))
            .unwrap_or(SdResponse::Generic);
        if response == SdResponse::Success {
            self.request("M24")?;
        }
        Ok(response)
    }

    fn playback_progress(&mut self) -> Result<Option<PlaybackProgress>> {
        let replies = self.request("M27")?;
        replies
            .iter()
            .find_map(|l| self.parser.sd_progress(l))
            .ok_or_else(|| FabError::RemoteStorage(format!("{} sent no progress report", self.config.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::link::{LinkRegistry, PortIo};
    use crate::loopback::{self, LoopbackPort};
    use std::thread;

    fn machine(buffer_bytes: usize) -> MachineConfig {
        let mut config = MachineConfig::named("bench");
        config.buffer_bytes = Some(buffer_bytes);
        config.start_timeout_ms = Some(2000);
        config
    }

    fn link_pair(registry: &LinkRegistry) -> (SerialLink, LoopbackPort) {
        let (host, far) = loopback::pair(Duration::from_millis(10));
        let mut config = LinkConfig::offline();
        config.read_timeout_ms = Some(200);
        let link = SerialLink::attach("bench0", Box::new(host.try_clone()), Box::new(host), &config, registry).unwrap();
        (link, far)
    }

    fn read_frame(far: &mut LoopbackPort) -> String {
        let mut buf = [0u8; 128];
        let mut line = Vec::new();
        while !line.ends_with(b"\n") {
            match far.read_available(&mut buf) {
                Ok(n) => line.extend_from_slice(&buf[..n]),
                Err(_) => continue,
            }
        }
        String::from_utf8(line).unwrap()
    }

    /// Far side that announces start then acknowledges G90
    fn handshake(mut far: LoopbackPort) -> thread::JoinHandle<LoopbackPort> {
        thread::spawn(move || {
            far.write_frame(b"start\n").unwrap();
            assert_eq!(read_frame(&mut far), "G90\n");
            far.write_frame(b"ok\n").unwrap();
            far
        })
    }

    fn numbered_machine() -> MachineConfig {
        let mut config = machine(128);
        config.line_numbers = Some(true);
        config
    }

    /// Far side of a numbered handshake; G90 goes out as line 1
    fn numbered_handshake(mut far: LoopbackPort) -> thread::JoinHandle<LoopbackPort> {
        thread::spawn(move || {
            far.write_frame(b"start\n").unwrap();
            assert_eq!(read_frame(&mut far), "N1 G90 *49\n");
            far.write_frame(b"ok\n").unwrap();
            far
        })
    }

    #[test]
    fn test_numbered_frames_carry_checksum() {
        let registry = LinkRegistry::new();
        let (link, far) = link_pair(&registry);
        let far_side = numbered_handshake(far);
        let mut device = SerialDevice::connect(numbered_machine(), link).unwrap();
        let mut far = far_side.join().unwrap();

        device.emit("G1 X10", None).unwrap();
        assert_eq!(read_frame(&mut far), "N2 G1X10 *83\n");
        assert_eq!(device.buffer().bytes(), 13);
        device.emit("M105", None).unwrap();
        assert_eq!(read_frame(&mut far), "N3 M105 *4\n");
    }

    #[test]
    fn test_resend_repeats_oldest_frame() {
        let registry = LinkRegistry::new();
        let (link, far) = link_pair(&registry);
        let far_side = numbered_handshake(far);
        let mut device = SerialDevice::connect(numbered_machine(), link).unwrap();
        let mut far = far_side.join().unwrap();

        let target = Position::new(10.0, 0.0, 0.0);
        device.emit("G1 X10", Some(target)).unwrap();
        device.emit("M105", None).unwrap();
        assert_eq!(read_frame(&mut far), "N2 G1X10 *83\n");
        assert_eq!(read_frame(&mut far), "N3 M105 *4\n");

        far.write_frame(b"Resend: 2\n").unwrap();
        device.idle(Duration::from_secs(2)).unwrap();
        assert_eq!(read_frame(&mut far), "N2 G1X10 *83\n");
        assert_eq!(device.outstanding_commands(), 2);

        far.write_frame(b"ok\n").unwrap();
        device.idle(Duration::from_secs(2)).unwrap();
        far.write_frame(b"ok\n").unwrap();
        device.idle(Duration::from_secs(2)).unwrap();
        assert_eq!(device.outstanding_commands(), 0);
        assert_eq!(device.state().confirmed_position, target);
    }

    #[test]
    fn test_resend_of_unknown_line_resets_numbering() {
        let registry = LinkRegistry::new();
        let (link, far) = link_pair(&registry);
        let far_side = numbered_handshake(far);
        let mut device = SerialDevice::connect(numbered_machine(), link).unwrap();
        let mut far = far_side.join().unwrap();

        device.emit("G1 X10", None).unwrap();
        assert_eq!(read_frame(&mut far), "N2 G1X10 *83\n");

        far.write_frame(b"rs 7\n").unwrap();
        device.idle(Duration::from_secs(2)).unwrap();
        assert_eq!(read_frame(&mut far), "N1 M110*34\n");
        assert_eq!(read_frame(&mut far), "N2 G1X10 *83\n");
        assert_eq!(device.outstanding_commands(), 2);

        device.emit("M105", None).unwrap();
        assert_eq!(read_frame(&mut far), "N3 M105 *4\n");
    }

    #[test]
    fn test_start_restarts_numbering() {
        let registry = LinkRegistry::new();
        let (link, far) = link_pair(&registry);
        let far_side = numbered_handshake(far);
        let mut device = SerialDevice::connect(numbered_machine(), link).unwrap();
        let mut far = far_side.join().unwrap();

        device.emit("G1 X10", None).unwrap();
        assert_eq!(read_frame(&mut far), "N2 G1X10 *83\n");
        far.write_frame(b"start\n").unwrap();
        device.idle(Duration::from_secs(2)).unwrap();
        assert_eq!(device.outstanding_commands(), 0);

        device.emit("G90", None).unwrap();
        assert_eq!(read_frame(&mut far), "N1 G90 *49\n");
    }

    #[test]
    fn test_connect_waits_for_start_then_sets_absolute() {
        let registry = LinkRegistry::new();
        let (link, far) = link_pair(&registry);
        let far_side = handshake(far);

        let device = SerialDevice::connect(machine(128), link).unwrap();
        far_side.join().unwrap();
        assert!(device.state().ready);
        assert_eq!(device.outstanding_commands(), 0);
    }

    #[test]
    fn test_connect_times_out_without_start() {
        let registry = LinkRegistry::new();
        let (link, _far) = link_pair(&registry);
        let mut config = machine(128);
        config.start_timeout_ms = Some(50);
        assert!(matches!(SerialDevice::connect(config, link), Err(FabError::Connection(_))));
    }

    #[test]
    fn test_full_buffer_refuses_with_retry() {
        let registry = LinkRegistry::new();
        let (link, far) = link_pair(&registry);
        let far_side = handshake(far);
        let mut device = SerialDevice::connect(machine(12), link).unwrap();
        let mut far = far_side.join().unwrap();

        device.emit("G1 X10", None).unwrap();
        assert_eq!(read_frame(&mut far), "G1X10\n");
        assert_eq!(device.buffer().bytes(), 6);

        assert!(matches!(device.emit("M104 S200", None), Err(CommandError::Retry)));
        assert_eq!(device.outstanding_commands(), 1);

        far.write_frame(b"ok\n").unwrap();
        device.idle(Duration::from_secs(2)).unwrap();
        assert_eq!(device.outstanding_commands(), 0);
        device.emit("M104 S200", None).unwrap();
    }

    #[test]
    fn test_oversize_frame_is_configuration_error() {
        let mut device = SerialDevice::offline(machine(8)).unwrap();
        let err = device.emit("G1 X100 Y100", None).unwrap_err();
        assert!(matches!(err, CommandError::Fatal(FabError::Configuration(_))));
    }

    #[test]
    fn test_unexpected_ok_is_desync() {
        let registry = LinkRegistry::new();
        let (link, far) = link_pair(&registry);
        let far_side = handshake(far);
        let mut device = SerialDevice::connect(machine(128), link).unwrap();
        let mut far = far_side.join().unwrap();

        far.write_frame(b"ok\n").unwrap();
        let err = device.idle(Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, FabError::ProtocolDesync(_)));
        assert!(err.is_transport());
        assert_eq!(device.buffer().bytes(), 0);
        assert!(!registry.in_use("bench0"));
    }

    #[test]
    fn test_ok_confirms_target_and_reads_temperature() {
        let registry = LinkRegistry::new();
        let (link, far) = link_pair(&registry);
        let far_side = handshake(far);
        let mut device = SerialDevice::connect(machine(128), link).unwrap();
        let mut far = far_side.join().unwrap();

        let target = Position::new(10.0, 0.0, 0.0);
        device.emit("G1 X10 Y0 Z0", Some(target)).unwrap();
        assert_eq!(device.state().confirmed_position, Position::default());

        far.write_frame(b"ok T:187.5\n").unwrap();
        device.idle(Duration::from_secs(2)).unwrap();
        assert_eq!(device.state().confirmed_position, target);
        assert_eq!(device.state().tool().current_temperature, 187.5);
    }

    #[test]
    fn test_extruder_fail_surfaces_on_check() {
        let registry = LinkRegistry::new();
        let (link, far) = link_pair(&registry);
        let far_side = handshake(far);
        let mut device = SerialDevice::connect(machine(128), link).unwrap();
        let mut far = far_side.join().unwrap();

        far.write_frame(b"Extruder Fail\n").unwrap();
        device.idle(Duration::from_secs(2)).unwrap();
        assert!(matches!(device.check_errors(), Err(FabError::DeviceFault(_))));
        assert!(device.check_errors().is_ok());
    }

    #[test]
    fn test_local_capture_writes_frames() {
        let path = std::env::temp_dir().join(format!("fabd-capture-{}.gcode", uuid::Uuid::new_v4()));
        let mut device = SerialDevice::offline(machine(128)).unwrap();

        device.begin_capture(&path).unwrap();
        assert!(!device.is_interactive());
        device.emit("G1 X1", Some(Position::new(1.0, 0.0, 0.0))).unwrap();
        device.emit("M104 S200", None).unwrap();
        assert_eq!(device.end_capture().unwrap(), 14);
        assert!(device.is_interactive());
        assert!(device.end_capture().is_err());

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "G1X1\nM104S200\n");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_offline_emit_without_capture_fails() {
        let mut device = SerialDevice::offline(machine(128)).unwrap();
        assert!(matches!(
            device.emit("G1 X1", None),
            Err(CommandError::Fatal(FabError::NotConnected(_)))
        ));
        assert!(device.remote_storage().is_none());
    }
}
