//! Error types for link, device and build operations

use crate::byte_ring::RingError;
use crate::commands::StopSignal;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FabError>;

#[derive(Error, Debug)]
pub enum FabError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Configuration file error: {0}")]
    ConfigFile(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Build file error: {0}")]
    BuildFile(String),

    #[error("Link not open: {0}")]
    NotConnected(String),

    #[error("Link lost: {0}")]
    Disconnected(String),

    #[error("Protocol desync: {0}")]
    ProtocolDesync(String),

    #[error("Device fault: {0}")]
    DeviceFault(String),

    #[error("Remote storage error: {0}")]
    RemoteStorage(String),

    #[error("Receive buffer error: {0}")]
    Ring(#[from] RingError),

    #[error("Build cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl FabError {
    /// True for the failures that end a job and take the link down with it
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FabError::NotConnected(_)
                | FabError::Disconnected(_)
                | FabError::ProtocolDesync(_)
                | FabError::Ring(_)
                | FabError::Io(_)
                | FabError::Serial(_)
        )
    }
}

/// Failure of a single device command.
///
/// `Retry` never leaves the build runner; `Stop` and `Fatal` always reach the job owner.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("device busy, command must be retried")]
    Retry,

    #[error("{0}")]
    Stop(StopSignal),

    #[error(transparent)]
    Fatal(#[from] FabError),
}

impl From<std::io::Error> for CommandError {
    fn from(e: std::io::Error) -> Self {
        CommandError::Fatal(FabError::Io(e))
    }
}

impl From<RingError> for CommandError {
    fn from(e: RingError) -> Self {
        CommandError::Fatal(FabError::Ring(e))
    }
}

pub type CommandResult = std::result::Result<(), CommandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(FabError::Disconnected("ttyUSB0".to_string()).is_transport());
        assert!(FabError::ProtocolDesync("ok with nothing in flight".to_string()).is_transport());
        assert!(FabError::Ring(RingError::Overflow { capacity: 16 }).is_transport());
        assert!(!FabError::Configuration("tool 4".to_string()).is_transport());
        assert!(!FabError::Cancelled.is_transport());
    }

    #[test]
    fn test_io_error_becomes_fatal_command_error() {
        let err: CommandError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, CommandError::Fatal(FabError::Io(_))));
    }
}
