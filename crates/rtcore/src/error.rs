use std::path::PathBuf;
use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced by the ray-tracing runtime.
///
/// Setup-time variants (`DeviceInit`, `Compile`, `ProgramGroup`, `Link`) are
/// configuration failures with no transient cause and are never retried.
/// `Sync` is the only variant raised by work that already ran on the device.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("device initialisation failed: {0}")]
    DeviceInit(String),
    #[error("module compilation failed:\n{log}")]
    Compile { log: String },
    #[error("program group for '{entry}' could not be created: {reason}")]
    ProgramGroup {
        entry: String,
        reason: String,
        log: String,
    },
    #[error("pipeline link failed: {reason}")]
    Link { reason: String, log: String },
    #[error("invalid pipeline state: {0}")]
    PipelineState(String),
    #[error("invalid shader binding table: {0}")]
    Sbt(String),
    #[error("launch rejected: {0}")]
    Launch(String),
    #[error("device fault surfaced at synchronization: {0}")]
    Sync(#[from] DeviceFault),
    #[error("synchronization did not complete within {0:?}; the frame is still in flight")]
    SyncTimeout(Duration),
    #[error("device buffer: {0}")]
    Buffer(String),
    #[error("failed to write image to {}: {reason}", .path.display())]
    Output { path: PathBuf, reason: String },
}

impl Error {
    /// Diagnostic log attached to compile, program-group, and link failures.
    pub fn log(&self) -> Option<&str> {
        match self {
            Error::Compile { log } | Error::ProgramGroup { log, .. } | Error::Link { log, .. } => {
                Some(log.as_str())
            }
            _ => None,
        }
    }

    /// True when the error was raised by device execution rather than setup.
    pub fn is_frame_fault(&self) -> bool {
        matches!(self, Error::Sync(_) | Error::SyncTimeout(_))
    }
}

/// Faults raised while device programs execute.
///
/// They are recorded by the stream and only become visible to the host at
/// the next synchronization barrier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceFault {
    #[error("out-of-bounds {access} of {len} bytes at device address {address:#x}")]
    OutOfBounds {
        access: &'static str,
        address: u64,
        len: usize,
    },
    #[error("record at {address:#x} carries an unresolved dispatch header")]
    InvalidHeader { address: u64 },
    #[error("{table} record index {index} is outside the table (count {count})")]
    MissingRecord {
        table: &'static str,
        index: u32,
        count: u32,
    },
    #[error("trace depth {depth} exceeds the pipeline max trace depth {max}")]
    TraceDepthExceeded { depth: u32, max: u32 },
    #[error("trace passed {used} payload values but the pipeline declares {declared}")]
    PayloadOverflow { used: usize, declared: u32 },
    #[error("program '{entry}' aborted: {message}")]
    ProgramAbort { entry: String, message: String },
    #[error("execution stream is no longer running")]
    StreamLost,
}
