//! Configuration loading for the link, the machine and builds

use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use crate::{Result, FabError};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    pub link: LinkConfig,
    pub machine: MachineConfig,
    #[serde(default)]
    pub build: Option<BuildConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParityConfig {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LinkConfig {
    pub port: Option<String>,
    pub baud_rate: Option<u32>,
    pub parity: Option<ParityConfig>,
    pub data_bits: Option<u8>,
    pub stop_bits: Option<u8>,
    pub read_timeout_ms: Option<u64>,
    pub ring_capacity: Option<usize>,
    pub reader_poll_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MachineConfig {
    pub name: String,
    pub tool_count: Option<usize>,
    pub buffer_bytes: Option<usize>,
    pub max_outstanding_commands: Option<usize>,
    /// mm/min for X, Y, Z, A, B
    pub max_feedrates: Option<[f64; 5]>,
    pub wait_for_start: Option<bool>,
    pub start_timeout_ms: Option<u64>,
    pub reset_on_connect: Option<bool>,
    pub strip_spaces: Option<bool>,
    pub optional_stops: Option<bool>,
    pub sd_timeout_ms: Option<u64>,
    /// Send `N<n> ... *<checksum>` frames and honour resend requests
    pub line_numbers: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BuildConfig {
    pub tick_interval_ms: Option<u64>,
    pub simulate: Option<bool>,
    #[serde(default)]
    pub warmup: Vec<String>,
    #[serde(default)]
    pub cooldown: Vec<String>,
}

impl DaemonConfig {
    pub fn load_from_path(config_path: &str) -> Result<Self> {
        let contents = fs::read_to_string(config_path)
            .map_err(|e| FabError::ConfigFile(format!("Failed to read {}: {}", config_path, e)))?;

        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: DaemonConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.link.ring_capacity() < 256 {
            return Err(FabError::ConfigFile(format!(
                "ring_capacity {} is smaller than one protocol frame budget (256)",
                self.link.ring_capacity()
            )));
        }
        if self.machine.buffer_bytes() == 0 {
            return Err(FabError::ConfigFile("buffer_bytes must be positive".to_string()));
        }
        if let Some(bits) = self.link.stop_bits {
            if bits != 1 && bits != 2 {
                return Err(FabError::ConfigFile(format!("stop_bits must be 1 or 2, got {}", bits)));
            }
        }
        Ok(())
    }

    /// Get build configuration with defaults
    pub fn build(&self) -> BuildConfig {
        self.build.clone().unwrap_or_default()
    }
}

impl LinkConfig {
    /// Offline link configuration, used for file-only jobs and tests
    pub fn offline() -> Self {
        Self {
            port: None,
            baud_rate: None,
            parity: None,
            data_bits: None,
            stop_bits: None,
            read_timeout_ms: None,
            ring_capacity: None,
            reader_poll_ms: None,
        }
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate.unwrap_or(38400)
    }

    pub fn parity(&self) -> ParityConfig {
        self.parity.unwrap_or(ParityConfig::None)
    }

    pub fn data_bits(&self) -> u8 {
        self.data_bits.unwrap_or(8)
    }

    pub fn stop_bits(&self) -> u8 {
        self.stop_bits.unwrap_or(1)
    }

    /// How long a blocked read waits before reporting a timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.unwrap_or(500))
    }

    pub fn ring_capacity(&self) -> usize {
        self.ring_capacity.unwrap_or(crate::byte_ring::DEFAULT_CAPACITY)
    }

    /// OS-level read timeout for the reader thread; bounds how long shutdown waits
    pub fn reader_poll(&self) -> Duration {
        Duration::from_millis(self.reader_poll_ms.unwrap_or(50))
    }
}

impl MachineConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tool_count: None,
            buffer_bytes: None,
            max_outstanding_commands: None,
            max_feedrates: None,
            wait_for_start: None,
            start_timeout_ms: None,
            reset_on_connect: None,
            strip_spaces: None,
            optional_stops: None,
            sd_timeout_ms: None,
            line_numbers: None,
        }
    }

    pub fn tool_count(&self) -> usize {
        self.tool_count.unwrap_or(1)
    }

    /// Size of the command buffer on the device
    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes.unwrap_or(128)
    }

    pub fn max_feedrates(&self) -> [f64; 5] {
        self.max_feedrates.unwrap_or([5000.0, 5000.0, 200.0, 5000.0, 5000.0])
    }

    /// Fastest axis feedrate, used for G0 rapids
    pub fn max_feedrate(&self) -> f64 {
        self.max_feedrates().iter().cloned().fold(0.0, f64::max)
    }

    pub fn wait_for_start(&self) -> bool {
        self.wait_for_start.unwrap_or(true)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms.unwrap_or(10_000))
    }

    pub fn reset_on_connect(&self) -> bool {
        self.reset_on_connect.unwrap_or(false)
    }

    pub fn strip_spaces(&self) -> bool {
        self.strip_spaces.unwrap_or(true)
    }

    pub fn optional_stops(&self) -> bool {
        self.optional_stops.unwrap_or(true)
    }

    pub fn sd_timeout(&self) -> Duration {
        Duration::from_millis(self.sd_timeout_ms.unwrap_or(5_000))
    }

    pub fn line_numbers(&self) -> bool {
        self.line_numbers.unwrap_or(false)
    }
}

impl BuildConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.unwrap_or(20))
    }

    pub fn simulate(&self) -> bool {
        self.simulate.unwrap_or(false)
    }
}
