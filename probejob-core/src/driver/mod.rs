//! Driver call surface.
//!
//! One method per hardware operation. Implementations perform a single call
//! and report a [`LowLevelError`] on failure; they never see the job
//! machinery. Every method that touches hardware is only ever reached through
//! an [`ExecutionMutex`](crate::lock::ExecutionMutex) guard.

pub mod mock;
#[cfg(feature = "hardware")]
pub mod hardware;

use crate::error::{LowLevelError, ResultCode};
use crate::flash::{DfuRequest, EraseMode, ImageSource, Progress, ProgramOptions, ReadOptions};
use crate::job::Failure;
use crate::probe::{
    DeviceInfo, LibraryInfo, LibraryVersion, ProbeDetails, ProbeInfo, ProbeTarget, SerialNumber,
};
use crate::rtt::{RttChannels, RttConnection};
use std::path::Path;
use std::time::Duration;

pub use mock::{CallLog, CallRecord, MockDriver};
#[cfg(feature = "hardware")]
pub use hardware::{ProbeRsConfig, ProbeRsDriver};

pub type DriverResult<T> = Result<T, LowLevelError>;

/// The hardware operations a job can perform.
pub trait Driver: Send + 'static {
    fn library_version(&mut self) -> DriverResult<LibraryVersion>;

    fn library_info(&mut self) -> DriverResult<LibraryInfo>;

    /// Enumerate attached probes, in handle order.
    fn connected_probes(&mut self) -> DriverResult<Vec<ProbeDetails>>;

    fn serial_numbers(&mut self) -> DriverResult<Vec<SerialNumber>> {
        Ok(self.connected_probes()?.into_iter().map(|p| p.serial_number).collect())
    }

    fn probe_info(&mut self, target: &ProbeTarget) -> DriverResult<ProbeInfo>;

    fn device_info(&mut self, target: &ProbeTarget) -> DriverResult<DeviceInfo>;

    fn device_version(&mut self, target: &ProbeTarget) -> DriverResult<String>;

    fn read(&mut self, target: &ProbeTarget, address: u32, length: u32) -> DriverResult<Vec<u8>>;

    fn read_u32(&mut self, target: &ProbeTarget, address: u32) -> DriverResult<u32>;

    fn write(&mut self, target: &ProbeTarget, address: u32, data: &[u8]) -> DriverResult<()>;

    fn write_u32(&mut self, target: &ProbeTarget, address: u32, value: u32) -> DriverResult<()>;

    fn program(
        &mut self,
        target: &ProbeTarget,
        source: &ImageSource,
        options: &ProgramOptions,
        progress: &Progress,
    ) -> DriverResult<()>;

    fn program_dfu(
        &mut self,
        target: &ProbeTarget,
        request: DfuRequest<'_>,
        progress: &Progress,
    ) -> DriverResult<()>;

    /// Compare flash contents against a firmware file.
    fn verify(&mut self, target: &ProbeTarget, filename: &Path, progress: &Progress) -> DriverResult<()>;

    fn read_to_file(
        &mut self,
        target: &ProbeTarget,
        filename: &Path,
        options: &ReadOptions,
        progress: &Progress,
    ) -> DriverResult<()>;

    fn erase(
        &mut self,
        target: &ProbeTarget,
        mode: EraseMode,
        start_address: u32,
        end_address: u32,
        progress: &Progress,
    ) -> DriverResult<()>;

    /// Erase everything, including protection settings, to regain access.
    fn recover(&mut self, target: &ProbeTarget, progress: &Progress) -> DriverResult<()>;

    /// Reset the target CPU and let it run.
    fn reset(&mut self, target: &ProbeTarget) -> DriverResult<()>;

    /// Keep the connection to the probe open across jobs.
    fn open(&mut self, target: &ProbeTarget) -> DriverResult<()>;

    fn close(&mut self, target: &ProbeTarget) -> DriverResult<()>;

    /// Whether an RTT session is running. Answered from driver state, without
    /// touching the probe.
    fn rtt_is_started(&self, target: &ProbeTarget) -> bool;

    /// Scan target RAM for the RTT control block signature.
    fn rtt_find_control_block(
        &mut self,
        target: &ProbeTarget,
        connection: &RttConnection,
    ) -> DriverResult<Option<u32>>;

    fn rtt_start(
        &mut self,
        target: &ProbeTarget,
        control_block: u32,
        connection: &RttConnection,
    ) -> DriverResult<()>;

    fn rtt_channels(&mut self, target: &ProbeTarget) -> DriverResult<RttChannels>;

    fn rtt_stop(&mut self, target: &ProbeTarget) -> DriverResult<()>;

    fn rtt_read(&mut self, target: &ProbeTarget, channel: u32, length: u32) -> DriverResult<Vec<u8>>;

    /// Returns the number of bytes the target accepted.
    fn rtt_write(&mut self, target: &ProbeTarget, channel: u32, data: &[u8]) -> DriverResult<u32>;

    /// Time since the running RTT session was started.
    fn rtt_elapsed(&self, target: &ProbeTarget) -> Duration;
}

/// Attach a result code to a failed driver call.
pub(crate) trait DriverResultExt<T> {
    fn or_fail(self, result: ResultCode) -> Result<T, Failure>;
}

impl<T> DriverResultExt<T> for DriverResult<T> {
    fn or_fail(self, result: ResultCode) -> Result<T, Failure> {
        self.map_err(|code| Failure::new(result, code))
    }
}
