use std::fmt;
use thiserror::Error;

/// A single entry drained from the instrument's own error queue or status.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceErrorRecord {
    pub code: i64,
    pub message: String,
    pub severity: Option<i64>,
    pub node: Option<i64>,
}

impl fmt::Display for DeviceErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Errors raised by the byte-stream layer underneath a session.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Resource not present: {resource} ({message})")]
    NotPresent { resource: String, message: String },
    #[error("IO error ({context}): {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Transport timed out after {0} ms")]
    Timeout(u128),
    #[error("Transport is closed")]
    Closed,
    #[error("Unsupported resource: {0}")]
    Unsupported(String),
    #[error("Error opening resource {resource}: {message}")]
    Open { resource: String, message: String },
    #[error(
        "Could not open GPIB resource. Tried: {tried}. Last error: {last_error}. \
         Check instrument GPIB address and whether adapter is GPIB0 or GPIB1."
    )]
    Exhausted { tried: String, last_error: String },
}

impl TransportError {
    /// True for the "address not present" class that justifies trying a
    /// sibling bus index.
    pub fn is_not_present(&self) -> bool {
        matches!(self, TransportError::NotPresent { .. })
    }
}

impl From<std::io::Error> for TransportError {
    fn from(source: std::io::Error) -> Self {
        if matches!(
            source.kind(),
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
        ) {
            return TransportError::Timeout(0);
        }
        TransportError::Io {
            source,
            context: "transport I/O".to_string(),
        }
    }
}

/// Coarse classification callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Transport,
    UnrecognizedInstrument,
    Device,
    UnexpectedResponse,
    OverrangeReading,
    EmptyFastSweepResult,
    NotConnected,
    FastModeUnavailable,
    Config,
    Io,
}

#[derive(Error, Debug)]
pub enum SmuError {
    #[error("Out of range: {0}")]
    OutOfRange(String),
    #[error("Sweep plan contains no points")]
    EmptyPlan,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Connected device does not look like a supported Keithley SMU: {0}")]
    UnrecognizedInstrument(String),
    #[error("Instrument error(s): {}", join_records(.0))]
    DeviceError(Vec<DeviceErrorRecord>),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error(
        "Current reading is overrange/compliance (instrument returned {0:e}). \
         Reduce voltage or increase current compliance/range."
    )]
    OverrangeReading(f64),
    #[error("Instrument fast sweep returned no parseable data")]
    EmptyFastSweepResult,
    #[error("Not connected")]
    NotConnected,
    #[error("Fast instrument sweep is available only in script (TSP) mode")]
    FastModeUnavailable,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error ({context}): {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SmuError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SmuError::OutOfRange(_) | SmuError::EmptyPlan => {
                ErrorKind::Validation
            }
            SmuError::Transport(_) => ErrorKind::Transport,
            SmuError::UnrecognizedInstrument(_) => ErrorKind::UnrecognizedInstrument,
            SmuError::DeviceError(_) => ErrorKind::Device,
            SmuError::UnexpectedResponse(_) => ErrorKind::UnexpectedResponse,
            SmuError::OverrangeReading(_) => ErrorKind::OverrangeReading,
            SmuError::EmptyFastSweepResult => ErrorKind::EmptyFastSweepResult,
            SmuError::NotConnected => ErrorKind::NotConnected,
            SmuError::FastModeUnavailable => ErrorKind::FastModeUnavailable,
            SmuError::Config(_) => ErrorKind::Config,
            SmuError::Io { .. } | SmuError::Serialization(_) => ErrorKind::Io,
        }
    }

    /// Validation errors are raised before any I/O and never trigger teardown.
    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }
}

impl From<std::io::Error> for SmuError {
    fn from(source: std::io::Error) -> Self {
        SmuError::Io {
            source,
            context: "I/O".to_string(),
        }
    }
}

fn join_records(records: &[DeviceErrorRecord]) -> String {
    records
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
