// Error taxonomy for the capture pipeline

use thiserror::Error;

/// Errors surfaced by pipeline construction and socket snapshots.
///
/// Construction failures are fatal to the caller. Snapshot failures during a
/// tick are logged by the driver and never stop the pipeline.
#[derive(Debug, Error)]
pub enum SnifferError {
    #[error("invalid capture filter: {0}")]
    InvalidFilter(String),

    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unsupported on this platform: {0}")]
    Unsupported(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a single captured frame could not be turned into a connection.
///
/// This never leaves the capture thread: the frame is either counted as
/// unattributed traffic or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeSkip {
    #[error("frame too short for {0} header")]
    Truncated(&'static str),

    #[error("unsupported ethertype 0x{0:04x}")]
    UnsupportedEtherType(u16),

    #[error("unsupported IP version {0}")]
    UnsupportedIpVersion(u8),

    #[error("malformed {0} header")]
    Malformed(&'static str),
}
