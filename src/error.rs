//! Error types shared by the bridge, the registry and the mailboxes

use crate::capture::Stream;
use crate::driver::DriverError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of the capture bridge
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Opening a device or enabling one of its streams failed
    #[error("device {index}: {source}")]
    Device {
        index: u32,
        #[source]
        source: DriverError,
    },

    /// The driver context itself failed
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Raw buffer did not match the byte count of its stream format
    #[error("{stream} buffer is {actual} bytes, expected {expected}")]
    Decode {
        stream: Stream,
        expected: usize,
        actual: usize,
    },

    /// The worker thread died on a fatal driver error
    #[error("capture worker faulted: {0}")]
    Faulted(String),

    /// The bridge is stopped or the session was closed
    #[error("capture bridge is closed")]
    Closed,

    /// A caller-supplied deadline elapsed before a frame arrived
    #[error("timed out waiting for a {0} frame")]
    Timeout(Stream),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("failed to spawn capture worker: {0}")]
    Spawn(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn device(index: u32, source: DriverError) -> Self {
        Self::Device { index, source }
    }

    /// True for the terminal errors that end a `get_frame` wait
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Faulted(_) | Self::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_shutdown_and_faults_are_terminal() {
        assert!(Error::Closed.is_terminal());
        assert!(Error::Faulted("usb reset".into()).is_terminal());
        assert!(!Error::Timeout(Stream::Depth).is_terminal());
        assert!(!Error::device(0, DriverError::DeviceBusy(0)).is_terminal());
    }
}
