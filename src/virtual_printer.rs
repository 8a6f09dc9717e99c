//! Fake controller firmware on the far end of a loopback link
//!
//! Announces `start` on boot and after every reset pulse, acknowledges each
//! line, reports temperatures and emulates SD card storage.

use crate::link::PortIo;
use crate::loopback::LoopbackPort;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

/// Bytes of a stored file played per progress poll
const PLAYBACK_STEP: u64 = 64;

type Files = Arc<Mutex<HashMap<String, Vec<String>>>>;

#[derive(Debug, Clone, Default)]
pub struct PrinterOptions {
    /// Delay before each acknowledgement
    pub ack_delay: Duration,
    /// Files present on the emulated card at boot
    pub files: HashMap<String, Vec<String>>,
    /// Emulates a machine with no card inserted
    pub no_card: bool,
}

pub struct VirtualPrinter {
    stop: Arc<AtomicBool>,
    files: Files,
    received: Arc<Mutex<Vec<String>>>,
    handle: Option<JoinHandle<()>>,
}

struct Firmware {
    port: LoopbackPort,
    options: PrinterOptions,
    files: Files,
    received: Arc<Mutex<Vec<String>>>,
    temperature: f64,
    platform_temperature: f64,
    writing: Option<(String, Vec<String>)>,
    selected: Option<(String, u64)>,
    playing: Option<u64>,
    resets_seen: usize,
}

impl VirtualPrinter {
    pub fn spawn(port: LoopbackPort, options: PrinterOptions) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let files: Files = Arc::new(Mutex::new(options.files.clone()));
        let received = Arc::new(Mutex::new(Vec::new()));

        let mut firmware = Firmware {
            resets_seen: port.reset_count(),
            port,
            options,
            files: Arc::clone(&files),
            received: Arc::clone(&received),
            temperature: 20.0,
            platform_temperature: 20.0,
            writing: None,
            selected: None,
            playing: None,
        };
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("virtual-printer".to_string())
            .spawn(move || firmware.run(&thread_stop))?;

        Ok(Self { stop, files, received, handle: Some(handle) })
    }

    /// Every line received so far, in order
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn file(&self, name: &str) -> Option<Vec<String>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for VirtualPrinter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Firmware {
    fn run(&mut self, stop: &AtomicBool) {
        if self.send("start").is_err() {
            return;
        }
        let mut buf = [0u8; 128];
        let mut line = Vec::new();

        while !stop.load(Ordering::Acquire) {
            let resets = self.port.reset_count();
            if resets != self.resets_seen {
                self.resets_seen = resets;
                line.clear();
                debug!("virtual printer reset");
                if self.send("start").is_err() {
                    return;
                }
            }

            let n = match self.port.read_available(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(_) => return,
            };
            for &byte in &buf[..n] {
                if byte != b'\n' {
                    line.push(byte);
                    continue;
                }
                let text = String::from_utf8_lossy(&line).trim().to_string();
                line.clear();
                if text.is_empty() {
                    continue;
                }
                if self.handle(&text).is_err() {
                    return;
                }
            }
        }
    }

    fn send(&mut self, reply: &str) -> io::Result<()> {
        trace!("virtual printer -> {}", reply);
        self.port.write_frame(format!("{}\n", reply).as_bytes())
    }

    fn handle(&mut self, line: &str) -> io::Result<()> {
        self.received.lock().unwrap_or_else(PoisonError::into_inner).push(line.to_string());
        let line = strip_numbering(line);
        if !self.options.ack_delay.is_zero() {
            thread::sleep(self.options.ack_delay);
        }

        if let Some((name, mut contents)) = self.writing.take() {
            if line == "M29" {
                self.files.lock().unwrap_or_else(PoisonError::into_inner).insert(name, contents);
                self.send("Done saving file.")?;
            } else {
                contents.push(line.to_string());
                self.writing = Some((name, contents));
            }
            return self.send("ok");
        }

        let code = strip_tool(line);
        if code.starts_with("M112") {
            self.playing = None;
            return Ok(());
        }
        if code.starts_with("M105") {
            let report = format!("ok T:{:.1} B:{:.1}", self.temperature, self.platform_temperature);
            return self.send(&report);
        }
        if code.starts_with("M104") {
            if let Some(t) = word(code, 'S') {
                self.temperature = t;
            }
        } else if code.starts_with("M140") {
            if let Some(t) = word(code, 'S') {
                self.platform_temperature = t;
            }
        } else if let Some(name) = code.strip_prefix("M28") {
            let name = name.trim().to_string();
            if self.options.no_card {
                self.send("No SD card")?;
            } else {
                self.send(&format!("Writing to file: {}", name))?;
                self.writing = Some((name, Vec::new()));
            }
        } else if let Some(name) = code.strip_prefix("M23") {
            self.select(name.trim())?;
        } else if code.starts_with("M24") {
            if self.selected.is_some() {
                self.playing = Some(0);
            }
        } else if code.starts_with("M27") {
            self.report_progress()?;
        }
        self.send("ok")
    }

    fn select(&mut self, name: &str) -> io::Result<()> {
        if self.options.no_card {
            return self.send("No SD card");
        }
        let size = self
            .files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|lines| lines.iter().map(|l| l.len() as u64 + 1).sum::<u64>());
        match size {
            Some(size) => {
                self.selected = Some((name.to_string(), size));
                self.send(&format!("File opened: {} Size: {}", name, size))?;
                self.send("File selected")
            }
            None => self.send(&format!("open failed, File: {}.", name)),
        }
    }

    fn report_progress(&mut self) -> io::Result<()> {
        let total = self.selected.as_ref().map(|(_, size)| *size).unwrap_or(0);
        match self.playing {
            Some(done) if done < total => {
                let next = (done + PLAYBACK_STEP).min(total);
                self.playing = Some(next);
                self.send(&format!("SD printing byte {}/{}", next, total))
            }
            _ => {
                self.playing = None;
                self.send("Not SD printing")
            }
        }
    }
}

/// Drop a leading `T<n>` tool selector
/// Frame text without its `N<n>` prefix and `*<checksum>` suffix
fn strip_numbering(line: &str) -> &str {
    let line = match line.rfind('*') {
        Some(at) => &line[..at],
        None => line,
    };
    match line.strip_prefix('N') {
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => {
            rest.trim_start_matches(|c: char| c.is_ascii_digit()).trim()
        }
        _ => line.trim(),
    }
}

fn strip_tool(line: &str) -> &str {
    match line.strip_prefix('T') {
        Some(rest) => rest.trim_start_matches(|c: char| c.is_ascii_digit()).trim_start(),
        None => line,
    }
}

fn word(code: &str, letter: char) -> Option<f64> {
    let start = code.find(letter)? + 1;
    let digits: String = code[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    digits.parse().ok()
}
