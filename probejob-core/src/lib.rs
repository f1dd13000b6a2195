//! Probejob Core - serialized job dispatch for hardware debug probes.
//!
//! This crate turns requests against a debug probe (memory access, flash
//! programming, target reset, RTT) into jobs that run on background workers
//! while guaranteeing that no two of them ever touch the probe at once.

pub mod dispatch;
pub mod driver;
pub mod error;
pub mod flash;
pub mod job;
pub mod lock;
pub mod probe;
pub mod rtt;

// Re-export commonly used types
pub use dispatch::{Dispatcher, DispatcherConfig, JobEvent};
pub use driver::{CallLog, CallRecord, Driver, DriverResult, MockDriver};
#[cfg(feature = "hardware")]
pub use driver::{ProbeRsConfig, ProbeRsDriver};
pub use error::{JobError, LowLevelError, ResetOutcome, ResultCode};
pub use flash::{
    EraseMode, FirmwareImage, ImageSource, InputFormat, Progress, ProgramOptions, ProgressUpdate, ReadOptions,
    Segment, UartDfu,
};
pub use job::{ExecutedJob, ExecutionState, Job, JobId, JobResponse, Operation, OutputValue};
pub use lock::{ExecutionMutex, LockTimeout, ProbeGuard, DEFAULT_LOCK_TIMEOUT};
pub use probe::{
    Coprocessor, DeviceFamily, DeviceInfo, LibraryInfo, LibraryVersion, ProbeDetails, ProbeHandle, ProbeInfo,
    ProbeKind, ProbeTarget, SerialNumber,
};
pub use rtt::{ChannelDirection, ChannelInfo, RttChannels, RttConnection};
