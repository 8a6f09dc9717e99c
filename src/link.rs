//! Serial link: port lifecycle, background reader and line-level I/O
//!
//! A background thread owns the read half of the port and appends everything it
//! receives to the link's [`SharedRing`]. The dispatch thread owns the write half
//! and drains the ring. Any read or write failure tears the link down exactly
//! once: the handle is dropped, the ring is closed and the port name is released
//! from the [`LinkRegistry`].

use crate::byte_ring::{RingError, SharedRing, MAX_UNTERMINATED};
use crate::config::{LinkConfig, ParityConfig};
use crate::{FabError, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Hold time for the control-line reset pulse
pub const RESET_PULSE: Duration = Duration::from_millis(100);

const BY_ID_DIR: &str = "/dev/serial/by-id";
const ALIAS_PATTERN: &str = r"(FTDI_TTL232R_|usb-Arduino__www\.arduino\.cc__Arduino_Uno_)([^-]*)";

/// The byte-level operations a link needs from a port
pub trait PortIo: Send {
    /// Read whatever is available. Timeouts surface as `TimedOut`/`WouldBlock`.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write and flush one frame
    fn write_frame(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Drive DTR and RTS together
    fn set_control_lines(&mut self, level: bool) -> io::Result<()>;
}

impl PortIo for Box<dyn serialport::SerialPort> {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write_frame(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write_all(bytes)?;
        (**self).flush()
    }

    fn set_control_lines(&mut self, level: bool) -> io::Result<()> {
        self.write_data_terminal_ready(level)?;
        self.write_request_to_send(level)?;
        Ok(())
    }
}

/// Ports currently held open by this process
#[derive(Debug, Clone, Default)]
pub struct LinkRegistry {
    ports: Arc<Mutex<HashSet<String>>>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn claim(&self, name: &str) -> Result<()> {
        if !self.lock().insert(name.to_string()) {
            return Err(FabError::Connection(format!("{} is already in use", name)));
        }
        Ok(())
    }

    /// Returns false if the name was not held
    pub fn release(&self, name: &str) -> bool {
        self.lock().remove(name)
    }

    pub fn in_use(&self, name: &str) -> bool {
        self.lock().contains(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().iter().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Opening,
    Open,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LinkState::Opening,
            2 => LinkState::Open,
            _ => LinkState::Closed,
        }
    }
}

struct LinkShared {
    name: String,
    state: AtomicU8,
    connected: AtomicBool,
    stop: AtomicBool,
    torn_down: AtomicBool,
    writer: Mutex<Option<Box<dyn PortIo>>>,
    ring: SharedRing,
    fault: Mutex<Option<String>>,
    registry: LinkRegistry,
}

impl LinkShared {
    fn set_state(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn writer(&self) -> MutexGuard<'_, Option<Box<dyn PortIo>>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Idempotent; only the first call has any effect
    fn teardown(&self, reason: &str, fault: bool) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connected.store(false, Ordering::Release);
        self.set_state(LinkState::Closed);
        if fault {
            error!("Serial link {} lost: {}", self.name, reason);
            *self.fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.to_string());
        } else {
            info!("Serial link {} closed", self.name);
        }
        self.writer().take();
        self.ring.close();
        self.registry.release(&self.name);
    }

    fn fault(&self) -> Option<String> {
        self.fault.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

pub struct SerialLink {
    shared: Arc<LinkShared>,
    reader: Option<JoinHandle<()>>,
}

impl SerialLink {
    /// Open the configured OS serial port and start its reader
    pub fn open(config: &LinkConfig, registry: &LinkRegistry) -> Result<Self> {
        let name = config
            .port
            .clone()
            .ok_or_else(|| FabError::Configuration("no serial port configured".to_string()))?;
        registry.claim(&name)?;

        info!("Opening serial link {} at {} baud", name, config.baud_rate());
        let ports = open_os_port(&name, config);
        match ports {
            Ok((writer, reader)) => Self::start(&name, writer, reader, config, registry),
            Err(e) => {
                registry.release(&name);
                Err(e)
            }
        }
    }

    /// Build a link over already-open port halves, claiming `name`
    pub fn attach(
        name: &str,
        writer: Box<dyn PortIo>,
        reader: Box<dyn PortIo>,
        config: &LinkConfig,
        registry: &LinkRegistry,
    ) -> Result<Self> {
        registry.claim(name)?;
        Self::start(name, writer, reader, config, registry)
    }

    /// Opening until the reader runs, then Open unless the reader already failed
    fn start(
        name: &str,
        writer: Box<dyn PortIo>,
        reader: Box<dyn PortIo>,
        config: &LinkConfig,
        registry: &LinkRegistry,
    ) -> Result<Self> {
        let shared = Arc::new(LinkShared {
            name: name.to_string(),
            state: AtomicU8::new(LinkState::Opening as u8),
            connected: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            writer: Mutex::new(Some(writer)),
            ring: SharedRing::new(config.ring_capacity(), config.read_timeout()),
            fault: Mutex::new(None),
            registry: registry.clone(),
        });

        shared.connected.store(true, Ordering::Release);

        let reader_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("link-{}", name))
            .spawn(move || reader_loop(reader_shared, reader));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                let reason = format!("failed to start reader: {}", e);
                shared.teardown(&reason, true);
                return Err(FabError::Connection(format!("{}: {}", name, reason)));
            }
        };

        let _ = shared.state.compare_exchange(
            LinkState::Opening as u8,
            LinkState::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        Ok(Self { shared, reader: Some(handle) })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Reason the link went down, if it failed rather than being closed
    pub fn fault(&self) -> Option<String> {
        self.shared.fault()
    }

    pub fn read_timeout(&self) -> Duration {
        self.shared.ring.timeout()
    }

    /// Bytes received but not yet consumed
    pub fn pending_bytes(&self) -> usize {
        self.shared.ring.len()
    }

    /// Send one line, appending the terminator if missing
    pub fn write_line(&self, line: &str) -> Result<()> {
        if self.state() != LinkState::Open || !self.is_connected() {
            error!("Serial link {} is not open; dropping write of {:?}", self.shared.name, line);
            return Err(FabError::NotConnected(self.shared.name.clone()));
        }

        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        if !line.ends_with('\n') {
            frame.push(b'\n');
        }

        let result = {
            let mut writer = self.shared.writer();
            match writer.as_mut() {
                Some(port) => port.write_frame(&frame),
                None => return Err(FabError::NotConnected(self.shared.name.clone())),
            }
        };

        if let Err(e) = result {
            let reason = format!("write failed: {}", e);
            self.shared.teardown(&reason, true);
            return Err(FabError::Disconnected(format!("{}: {}", self.shared.name, reason)));
        }
        debug!("{} <- {}", self.shared.name, line.trim_end());
        Ok(())
    }

    /// Block up to the configured timeout for one byte
    pub fn read_byte(&self) -> Result<Option<u8>> {
        let result = self.shared.ring.drain_one();
        self.map_ring(result)
    }

    /// Block up to `timeout` for a whole line. `Ok(None)` is a timeout.
    pub fn read_line(&self, timeout: Duration) -> Result<Option<String>> {
        let result = self.shared.ring.wait_line(timeout);
        self.map_ring(result).map(|line| line.map(decode_line))
    }

    /// Next whole line if one has already arrived
    pub fn try_read_line(&self) -> Result<Option<String>> {
        let result = self.shared.ring.drain_line();
        self.map_ring(result).map(|line| line.map(decode_line))
    }

    fn map_ring<T>(&self, result: std::result::Result<Option<T>, RingError>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(value),
            Err(RingError::Closed) => Err(FabError::Disconnected(format!(
                "{}: {}",
                self.shared.name,
                self.fault().unwrap_or_else(|| "link closed".to_string())
            ))),
            Err(e) => {
                self.shared.teardown(&e.to_string(), true);
                Err(e.into())
            }
        }
    }

    /// Hardware reset of the downstream board by pulsing DTR/RTS low
    pub fn pulse_reset(&self) -> Result<()> {
        let mut writer = self.shared.writer();
        let port = writer
            .as_mut()
            .ok_or_else(|| FabError::NotConnected(self.shared.name.clone()))?;
        info!("Pulsing reset on {}", self.shared.name);
        port.set_control_lines(false)?;
        thread::sleep(RESET_PULSE);
        port.set_control_lines(true)?;
        Ok(())
    }

    /// Discard everything buffered. Returns how many bytes were dropped.
    pub fn purge(&self) -> Result<usize> {
        let discarded = self.shared.ring.clear();
        if discarded > MAX_UNTERMINATED {
            warn!("Much more data than expected on {}: {} bytes purged", self.shared.name, discarded);
            return Err(RingError::Flood { pending: discarded, limit: MAX_UNTERMINATED }.into());
        }
        if discarded > 0 {
            debug!("Purged {} bytes from {}", discarded, self.shared.name);
        }
        Ok(discarded)
    }

    /// Stop the reader, drop the port and release the name
    pub fn close(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.teardown("closed", false);
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                error!("Reader thread for {} panicked", self.shared.name);
            }
        }
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.close();
    }
}

fn reader_loop(shared: Arc<LinkShared>, mut port: Box<dyn PortIo>) {
    let mut buf = [0u8; 256];
    debug!("Reader for {} started", shared.name);

    while !shared.stop.load(Ordering::Acquire) && shared.connected.load(Ordering::Acquire) {
        match port.read_available(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                if let Err(e) = shared.ring.append(&buf[..n]) {
                    shared.teardown(&e.to_string(), e != RingError::Closed);
                    break;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                shared.teardown(&format!("read failed: {}", e), true);
                break;
            }
        }
    }

    debug!("Reader for {} stopped", shared.name);
}

fn decode_line(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).trim_end_matches(['\r', '\n']).to_string()
}

type PortPair = (Box<dyn PortIo>, Box<dyn PortIo>);

fn open_os_port(name: &str, config: &LinkConfig) -> Result<PortPair> {
    let parity = match config.parity() {
        ParityConfig::None => serialport::Parity::None,
        ParityConfig::Even => serialport::Parity::Even,
        ParityConfig::Odd => serialport::Parity::Odd,
    };
    let data_bits = match config.data_bits() {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        _ => serialport::DataBits::Eight,
    };
    let stop_bits = match config.stop_bits() {
        2 => serialport::StopBits::Two,
        _ => serialport::StopBits::One,
    };

    let port = serialport::new(name, config.baud_rate())
        .parity(parity)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .timeout(config.reader_poll())
        .open()
        .map_err(|e| FabError::Connection(format!("Failed to open {}: {}", name, e)))?;
    let reader: Box<dyn PortIo> = Box::new(port.try_clone()?);
    let writer: Box<dyn PortIo> = Box::new(port);

    Ok((writer, reader))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub name: String,
    pub available: bool,
    pub alias: Option<String>,
    pub description: Option<String>,
}

/// Serial ports on this host, with ports held by `registry` marked unavailable
pub fn scan_ports(registry: &LinkRegistry) -> Result<Vec<PortInfo>> {
    let aliases = by_id_aliases(Path::new(BY_ID_DIR));
    let mut ports: Vec<PortInfo> = serialport::available_ports()?
        .into_iter()
        .map(|info| {
            let description = match &info.port_type {
                serialport::SerialPortType::UsbPort(usb) => usb
                    .product
                    .clone()
                    .or_else(|| Some(format!("USB {:04x}:{:04x}", usb.vid, usb.pid))),
                serialport::SerialPortType::BluetoothPort => Some("Bluetooth".to_string()),
                _ => None,
            };
            PortInfo {
                available: !registry.in_use(&info.port_name),
                alias: aliases.get(&PathBuf::from(&info.port_name)).cloned(),
                name: info.port_name,
                description,
            }
        })
        .collect();

    for held in registry.names() {
        if !ports.iter().any(|p| p.name == held) {
            ports.push(PortInfo {
                alias: aliases.get(&PathBuf::from(&held)).cloned(),
                name: held,
                available: false,
                description: None,
            });
        }
    }

    ports.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(ports)
}

/// Friendly name for a `/dev/serial/by-id` entry of a known cable
pub fn alias_for(link_name: &str) -> Option<String> {
    let pattern = Regex::new(ALIAS_PATTERN).ok()?;
    pattern
        .captures(link_name)
        .and_then(|caps| caps.get(2))
        .map(|serial| serial.as_str().to_string())
        .filter(|serial| !serial.is_empty())
}

fn by_id_aliases(dir: &Path) -> HashMap<PathBuf, String> {
    let mut aliases = HashMap::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return aliases,
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name().to_string_lossy().to_string();
        if let (Some(alias), Ok(target)) = (alias_for(&file_name), fs::canonicalize(entry.path())) {
            aliases.insert(target, alias);
        }
    }
    aliases
}
