//! Job descriptors.
//!
//! A [`Job`] is one requested hardware operation: immutable identity fixed
//! at construction, mutable execution state written only by the execute phase,
//! and an [`Operation`] payload with the operation's own inputs and outputs.
//!
//! The two phases are separate types. [`Job::execute`] consumes the job and
//! runs on a worker thread; [`ExecutedJob::complete`] consumes the result and
//! runs on the calling thread. Neither can be invoked twice.

pub mod operation;
pub mod output;

pub use operation::Operation;
pub use output::OutputValue;

use crate::driver::Driver;
use crate::error::{JobError, LowLevelError, ResetOutcome, ResultCode};
use crate::flash::{EraseMode, FirmwareImage, ImageSource, InputFormat, Progress, ProgramOptions, ReadOptions, UartDfu};
use crate::lock::ExecutionMutex;
use crate::probe::{Coprocessor, ProbeHandle, ProbeKind, ProbeTarget, SerialNumber};
use crate::rtt::{RttConnection, RttRead, RttStart, RttStop, RttWrite};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Identifier assigned to a job on submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A failed driver call, as recorded by the execute phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Failure {
    pub result: ResultCode,
    pub lowlevel: Option<LowLevelError>,
}

impl Failure {
    pub(crate) const fn new(result: ResultCode, lowlevel: LowLevelError) -> Self {
        Self { result: result.refine(lowlevel), lowlevel: Some(lowlevel) }
    }

    pub(crate) const fn without_code(result: ResultCode) -> Self {
        Self { result, lowlevel: None }
    }
}

/// State written by the execute phase.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionState {
    pub serial_number: Option<SerialNumber>,
    pub coprocessor: Coprocessor,
    pub result: ResultCode,
    /// Low-level code of the primary operation, or of the reset when only
    /// the reset failed.
    pub lowlevel_error: Option<LowLevelError>,
    pub reset: ResetOutcome,
    /// Set when the execution mutex could not be acquired.
    pub lock_timeout: Option<Duration>,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

/// One requested hardware operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    name: &'static str,
    return_parameter_count: usize,
    may_have_progress: bool,
    probe_kind: ProbeKind,
    probe: Option<ProbeHandle>,
    cpu_needs_reset: bool,
    state: ExecutionState,
    operation: Operation,
}

impl Job {
    pub fn new(operation: Operation) -> Self {
        Self {
            name: operation.name(),
            return_parameter_count: operation.return_parameter_count(),
            may_have_progress: operation.may_have_progress(),
            probe_kind: operation.probe_kind(),
            probe: None,
            cpu_needs_reset: operation.needs_reset(),
            state: ExecutionState::default(),
            operation,
        }
    }

    pub fn library_version() -> Self {
        Self::new(Operation::LibraryVersion { version: None })
    }

    pub fn connected_devices() -> Self {
        Self::new(Operation::ConnectedDevices { probes: Vec::new() })
    }

    pub fn serial_numbers() -> Self {
        Self::new(Operation::SerialNumbers { serial_numbers: Vec::new() })
    }

    pub fn device_info() -> Self {
        Self::new(Operation::DeviceInfo { info: None })
    }

    pub fn probe_info() -> Self {
        Self::new(Operation::ProbeInfo { info: None })
    }

    pub fn library_info() -> Self {
        Self::new(Operation::LibraryInfo { info: None })
    }

    pub fn device_version() -> Self {
        Self::new(Operation::DeviceVersion { version: None })
    }

    pub fn read(address: u32, length: u32) -> Result<Self, JobError> {
        if length == 0 {
            return Err(invalid("read", "length must be at least one byte"));
        }
        check_range("read", address, length)?;
        Ok(Self::new(Operation::Read { address, length, data: Vec::new() }))
    }

    pub fn read_u32(address: u32) -> Result<Self, JobError> {
        check_word_aligned("read u32", address)?;
        Ok(Self::new(Operation::ReadU32 { address, data: 0 }))
    }

    pub fn write(address: u32, data: Vec<u8>) -> Result<Self, JobError> {
        if data.is_empty() {
            return Err(invalid("write", "no data to write"));
        }
        let length = u32::try_from(data.len()).map_err(|_| invalid("write", "data exceeds the address space"))?;
        check_range("write", address, length)?;
        Ok(Self::new(Operation::Write { address, data }))
    }

    pub fn write_u32(address: u32, data: u32) -> Result<Self, JobError> {
        check_word_aligned("write u32", address)?;
        Ok(Self::new(Operation::WriteU32 { address, data }))
    }

    pub fn program_file(filename: impl Into<PathBuf>, format: InputFormat, options: ProgramOptions) -> Self {
        Self::new(Operation::Program {
            source: ImageSource::File { filename: filename.into(), format },
            options,
        })
    }

    /// Program an image the caller has already decoded.
    pub fn program_image(
        filename: impl Into<String>,
        image: FirmwareImage,
        options: ProgramOptions,
    ) -> Result<Self, JobError> {
        if image.is_empty() {
            return Err(invalid("program", "image has no data"));
        }
        Ok(Self::new(Operation::Program {
            source: ImageSource::Content { filename: filename.into(), image },
            options,
        }))
    }

    pub fn program_dfu(filename: impl Into<PathBuf>) -> Self {
        Self::new(Operation::ProgramDfu { filename: filename.into() })
    }

    pub fn program_mcuboot_dfu(request: UartDfu) -> Result<Self, JobError> {
        check_uart("program", &request)?;
        Ok(Self::new(Operation::ProgramMcuBootDfu(request)))
    }

    pub fn program_modem_uart_dfu(request: UartDfu) -> Result<Self, JobError> {
        check_uart("program", &request)?;
        Ok(Self::new(Operation::ProgramModemUartDfu(request)))
    }

    pub fn verify(filename: impl Into<PathBuf>) -> Self {
        Self::new(Operation::Verify { filename: filename.into() })
    }

    pub fn read_to_file(filename: impl Into<PathBuf>, options: ReadOptions) -> Result<Self, JobError> {
        if !(options.ram || options.code || options.uicr || options.qspi) {
            return Err(invalid("read to file", "no memory area selected"));
        }
        Ok(Self::new(Operation::ReadToFile { filename: filename.into(), options }))
    }

    pub fn erase(mode: EraseMode, start_address: u32, end_address: u32) -> Result<Self, JobError> {
        if mode.uses_range() && start_address > end_address {
            return Err(invalid(
                "erase",
                format!("start address {start_address:#010x} is past end address {end_address:#010x}"),
            ));
        }
        Ok(Self::new(Operation::Erase { mode, start_address, end_address }))
    }

    pub fn recover() -> Self {
        Self::new(Operation::Recover)
    }

    pub fn reset() -> Self {
        Self::new(Operation::Reset)
    }

    pub fn open() -> Self {
        Self::new(Operation::Open)
    }

    pub fn close() -> Self {
        Self::new(Operation::Close)
    }

    pub fn rtt_start(control_block_location: Option<u32>, connection: RttConnection) -> Self {
        Self::new(Operation::RttStart(RttStart::new(control_block_location, connection)))
    }

    pub fn rtt_stop() -> Self {
        Self::new(Operation::RttStop(RttStop::default()))
    }

    pub fn rtt_read(channel_index: u32, length: u32) -> Result<Self, JobError> {
        if length == 0 {
            return Err(invalid("rtt read", "length must be at least one byte"));
        }
        Ok(Self::new(Operation::RttRead(RttRead::new(channel_index, length))))
    }

    pub fn rtt_write(channel_index: u32, data: Vec<u8>) -> Result<Self, JobError> {
        if data.is_empty() {
            return Err(invalid("rtt write", "no data to write"));
        }
        Ok(Self::new(Operation::RttWrite(RttWrite::new(channel_index, data))))
    }

    #[must_use]
    pub fn with_serial_number(mut self, serial_number: impl Into<SerialNumber>) -> Self {
        self.state.serial_number = Some(serial_number.into());
        self
    }

    #[must_use]
    pub const fn with_coprocessor(mut self, coprocessor: Coprocessor) -> Self {
        self.state.coprocessor = coprocessor;
        self
    }

    /// Bind the job to a probe from a previous enumeration.
    #[must_use]
    pub const fn with_probe(mut self, probe: ProbeHandle) -> Self {
        self.probe = Some(probe);
        self
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn return_parameter_count(&self) -> usize {
        self.return_parameter_count
    }

    pub const fn may_have_progress(&self) -> bool {
        self.may_have_progress
    }

    pub const fn probe_kind(&self) -> ProbeKind {
        self.probe_kind
    }

    pub const fn probe(&self) -> Option<ProbeHandle> {
        self.probe
    }

    pub const fn cpu_needs_reset(&self) -> bool {
        self.cpu_needs_reset
    }

    pub const fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub const fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Diagnostic dump of the job's parameters, for RTT operations.
    pub fn parameters(&self) -> Option<String> {
        self.operation.parameters(self.state.serial_number.as_ref())
    }

    fn target(&self) -> ProbeTarget {
        ProbeTarget {
            serial_number: self.state.serial_number.clone(),
            kind: self.probe_kind,
            coprocessor: self.state.coprocessor,
            handle: self.probe,
        }
    }

    /// Execute phase.
    ///
    /// Acquires the execution mutex with its configured timeout, performs the
    /// driver calls, resets the target if the operation requires it and
    /// releases the mutex. Failures are recorded on the job, never returned.
    /// A panicking driver call counts as a failed call of this job only.
    pub fn execute<D: Driver>(mut self, mutex: &ExecutionMutex<D>, progress: &Progress) -> ExecutedJob {
        self.state.started_at = Some(Instant::now());
        log::debug!("Starting {}", self.name);
        if let Some(parameters) = self.parameters() {
            log::trace!("{parameters}");
        }

        let mut driver = match mutex.lock() {
            Ok(guard) => guard,
            Err(timeout) => {
                log::warn!("Could not execute {}: {timeout}", self.name);
                self.state.result = ResultCode::CouldNotExecuteDueToLoad;
                self.state.lock_timeout = Some(timeout.timeout);
                self.state.finished_at = Some(Instant::now());
                return ExecutedJob(self);
            }
        };

        let target = self.target();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.operation.execute(&mut *driver, &target, progress)))
            .unwrap_or_else(|payload| {
                log::error!("Driver panicked during {}: {}", self.name, panic_message(&*payload));
                Err(Failure::new(ResultCode::CouldNotCallFunction, LowLevelError::InternalError))
            });
        if let Err(failure) = outcome {
            self.state.result = failure.result;
            self.state.lowlevel_error = failure.lowlevel;
        }

        if self.cpu_needs_reset {
            let reset = panic::catch_unwind(AssertUnwindSafe(|| driver.reset(&target))).unwrap_or_else(|payload| {
                log::error!("Driver panicked resetting after {}: {}", self.name, panic_message(&*payload));
                Err(LowLevelError::InternalError)
            });
            self.state.reset = match reset {
                Ok(()) => ResetOutcome::Done,
                Err(code) => {
                    log::warn!("Reset after {} failed: {code}", self.name);
                    if self.state.result.is_success() {
                        self.state.lowlevel_error = Some(code);
                    }
                    ResetOutcome::Failed(code)
                }
            };
        }
        drop(driver);

        self.state.finished_at = Some(Instant::now());
        ExecutedJob(self)
    }
}

/// A job whose execute phase has run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedJob(Job);

impl ExecutedJob {
    pub const fn job(&self) -> &Job {
        &self.0
    }

    pub fn elapsed(&self) -> Duration {
        match (self.0.state.started_at, self.0.state.finished_at) {
            (Some(start), Some(end)) => end.duration_since(start),
            _ => Duration::ZERO,
        }
    }

    /// Complete phase: convert the recorded state into the caller's result.
    pub fn complete(self) -> Result<JobResponse, JobError> {
        let elapsed = self.elapsed();
        let job = self.0;
        log::debug!("{} finished in {:?} with {}", job.name, elapsed, job.state.result);

        if let Some(timeout) = job.state.lock_timeout {
            return Err(JobError::Busy { operation: job.name, timeout });
        }
        if !job.state.result.is_success() {
            return Err(JobError::Failed {
                operation: job.name,
                result: job.state.result,
                lowlevel: job.state.lowlevel_error,
                reset: job.state.reset,
            });
        }

        let rtt_not_started = job.operation.rtt_not_started();
        let values = job.operation.into_outputs();
        assert_eq!(
            values.len(),
            job.return_parameter_count,
            "{} produced {} output values, expected {}",
            job.name,
            values.len(),
            job.return_parameter_count
        );

        Ok(JobResponse {
            operation: job.name,
            values,
            lowlevel_error: job.state.lowlevel_error,
            reset: job.state.reset,
            rtt_not_started,
            elapsed,
        })
    }
}

/// Caller-visible result of a successful job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResponse {
    pub operation: &'static str,
    /// Exactly as many values as the operation's output count.
    pub values: Vec<OutputValue>,
    /// Set when the primary operation succeeded but the reset did not.
    pub lowlevel_error: Option<LowLevelError>,
    pub reset: ResetOutcome,
    /// The RTT operation found no running session and did nothing.
    pub rtt_not_started: bool,
    pub elapsed: Duration,
}

fn invalid(operation: &'static str, reason: impl Into<String>) -> JobError {
    JobError::InvalidParameter { operation, reason: reason.into() }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn check_range(operation: &'static str, address: u32, length: u32) -> Result<(), JobError> {
    if length == 0 {
        return Err(invalid(operation, "length must be non-zero"));
    }
    address
        .checked_add(length - 1)
        .map(|_| ())
        .ok_or_else(|| invalid(operation, format!("{length} bytes at {address:#010x} wrap the address space")))
}

fn check_word_aligned(operation: &'static str, address: u32) -> Result<(), JobError> {
    if address % 4 == 0 {
        Ok(())
    } else {
        Err(invalid(operation, format!("address {address:#010x} is not word aligned")))
    }
}

fn check_uart(operation: &'static str, request: &UartDfu) -> Result<(), JobError> {
    if request.uart.is_empty() {
        return Err(invalid(operation, "no serial port given"));
    }
    if request.baud_rate == 0 {
        return Err(invalid(operation, "baud rate must be non-zero"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;

    fn mutex() -> ExecutionMutex<MockDriver> {
        ExecutionMutex::new(MockDriver::new(), Duration::from_millis(50))
    }

    #[test]
    fn test_identity_fixed_at_construction() {
        let job = Job::erase(EraseMode::All, 0, 0).unwrap();
        assert_eq!(job.name(), "erase");
        assert_eq!(job.return_parameter_count(), 0);
        assert!(job.may_have_progress());
        assert!(job.cpu_needs_reset());
        assert_eq!(job.probe_kind(), ProbeKind::Debug);
        assert_eq!(job.state().result, ResultCode::Success);
        assert_eq!(job.state().lowlevel_error, None);
    }

    #[test]
    fn test_parameter_validation() {
        assert!(Job::read(0x1000, 0).is_err());
        assert!(Job::read(u32::MAX, 2).is_err());
        assert!(Job::read_u32(0x1002).is_err());
        assert!(Job::write(0, Vec::new()).is_err());
        assert!(Job::erase(EraseMode::Pages, 0x2000, 0x1000).is_err());
        assert!(Job::erase(EraseMode::All, 0x2000, 0x1000).is_ok());
        assert!(Job::rtt_write(0, Vec::new()).is_err());
        assert!(Job::read_to_file("dump.bin", ReadOptions { code: false, ..ReadOptions::default() }).is_err());

        let err = Job::read(0x1000, 0).unwrap_err();
        assert!(matches!(err, JobError::InvalidParameter { operation: "read", .. }));
    }

    #[test]
    fn test_execute_and_complete_read() {
        let mutex = mutex();
        mutex.lock().unwrap().poke(0x1000, &[1, 2, 3, 4]);

        let job = Job::read(0x1000, 4).unwrap();
        let executed = job.execute(&mutex, &Progress::disabled("read"));
        assert_eq!(executed.job().state().reset, ResetOutcome::Done);

        let response = executed.complete().unwrap();
        assert_eq!(response.values, vec![OutputValue::Bytes(vec![1, 2, 3, 4])]);
        assert!(!response.rtt_not_started);
    }

    #[test]
    fn test_busy_mutex_skips_driver() {
        let mutex = mutex();
        let log = mutex.lock().unwrap().log();
        let held = mutex.lock().unwrap();

        let executed = Job::reset().execute(&mutex, &Progress::disabled("reset"));
        drop(held);

        assert!(log.records().is_empty());
        let err = executed.complete().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.result(), ResultCode::CouldNotExecuteDueToLoad);
    }

    #[test]
    fn test_reset_failure_keeps_primary_success() {
        let mutex = mutex();
        mutex.lock().unwrap().fail_on("reset", LowLevelError::CannotConnect);

        let job = Job::write_u32(0x2000_0000, 0xDEAD_BEEF).unwrap();
        let response = job.execute(&mutex, &Progress::disabled("write u32")).complete().unwrap();

        assert_eq!(response.reset, ResetOutcome::Failed(LowLevelError::CannotConnect));
        assert_eq!(response.lowlevel_error, Some(LowLevelError::CannotConnect));
    }

    #[test]
    fn test_primary_failure_reported_with_reset_outcome() {
        let mutex = mutex();
        mutex.lock().unwrap().fail_on("erase", LowLevelError::NvmcError);

        let job = Job::erase(EraseMode::All, 0, 0).unwrap();
        let err = job.execute(&mutex, &Progress::disabled("erase")).complete().unwrap_err();

        match err {
            JobError::Failed { result, lowlevel, reset, .. } => {
                assert_eq!(result, ResultCode::CouldNotErase);
                assert_eq!(lowlevel, Some(LowLevelError::NvmcError));
                assert_eq!(reset, ResetOutcome::Done);
            }
            other => panic!("Expected driver failure, got {other:?}"),
        }
    }

    #[test]
    fn test_driver_panic_recorded_as_failure() {
        let mutex = mutex();
        mutex.lock().unwrap().panic_on("read");

        let executed = Job::read(0x1000, 4).unwrap().execute(&mutex, &Progress::disabled("read"));
        assert_eq!(executed.job().state().result, ResultCode::CouldNotCallFunction);
        assert_eq!(executed.job().state().lowlevel_error, Some(LowLevelError::InternalError));
        assert_eq!(executed.job().state().reset, ResetOutcome::Done);

        let err = executed.complete().unwrap_err();
        assert_eq!(err.lowlevel(), Some(LowLevelError::InternalError));

        // The guard was released and the driver still works.
        assert!(Job::reset().execute(&mutex, &Progress::disabled("reset")).complete().is_ok());
    }

    #[test]
    fn test_check_range_rejects_empty_and_wrapping() {
        assert!(check_range("read", 0x1000, 0).is_err());
        assert!(check_range("read", u32::MAX, 0).is_err());
        assert!(check_range("read", u32::MAX, 1).is_ok());
        assert!(check_range("read", u32::MAX - 3, 5).is_err());
    }

    #[test]
    fn test_builders_set_execution_state() {
        let job = Job::device_info()
            .with_serial_number(682_000_001u32)
            .with_coprocessor(Coprocessor::Network)
            .with_probe(ProbeHandle(0));
        assert_eq!(job.state().serial_number, Some(SerialNumber::from(682_000_001u32)));
        assert_eq!(job.state().coprocessor, Coprocessor::Network);
        assert_eq!(job.probe(), Some(ProbeHandle(0)));
        assert_eq!(job.target().coprocessor, Coprocessor::Network);
    }
}
