//! Operation payloads.
//!
//! Each variant carries the inputs of one kind of request and, after the
//! execute phase, its outputs. The variant also fixes the job's identity:
//! display name, output count, whether progress may be reported, the probe
//! transport and whether the target is reset afterwards.

use super::output::OutputValue;
use super::Failure;
use crate::driver::{Driver, DriverResultExt};
use crate::error::ResultCode;
use crate::flash::{DfuRequest, EraseMode, ImageSource, Progress, ProgramOptions, ReadOptions, UartDfu};
use crate::probe::{
    DeviceInfo, LibraryInfo, LibraryVersion, ProbeDetails, ProbeInfo, ProbeKind, ProbeTarget, SerialNumber,
};
use crate::rtt::{RttRead, RttStart, RttStop, RttWrite};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    LibraryVersion { version: Option<LibraryVersion> },
    ConnectedDevices { probes: Vec<ProbeDetails> },
    SerialNumbers { serial_numbers: Vec<SerialNumber> },
    DeviceInfo { info: Option<DeviceInfo> },
    ProbeInfo { info: Option<ProbeInfo> },
    LibraryInfo { info: Option<LibraryInfo> },
    DeviceVersion { version: Option<String> },
    Read { address: u32, length: u32, data: Vec<u8> },
    ReadU32 { address: u32, data: u32 },
    Write { address: u32, data: Vec<u8> },
    WriteU32 { address: u32, data: u32 },
    Program { source: ImageSource, options: ProgramOptions },
    ProgramDfu { filename: PathBuf },
    ProgramMcuBootDfu(UartDfu),
    ProgramModemUartDfu(UartDfu),
    Verify { filename: PathBuf },
    ReadToFile { filename: PathBuf, options: ReadOptions },
    Erase { mode: EraseMode, start_address: u32, end_address: u32 },
    Recover,
    Reset,
    Open,
    Close,
    RttStart(RttStart),
    RttStop(RttStop),
    RttRead(RttRead),
    RttWrite(RttWrite),
}

impl Operation {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::LibraryVersion { .. } => "get library version",
            Self::ConnectedDevices { .. } => "get connected devices",
            Self::SerialNumbers { .. } => "get serial numbers",
            Self::DeviceInfo { .. } => "get device info",
            Self::ProbeInfo { .. } => "get probe info",
            Self::LibraryInfo { .. } => "get library info",
            Self::DeviceVersion { .. } => "get device version",
            Self::Read { .. } => "read",
            Self::ReadU32 { .. } => "read u32",
            Self::Write { .. } => "write",
            Self::WriteU32 { .. } => "write u32",
            Self::Program { .. }
            | Self::ProgramDfu { .. }
            | Self::ProgramMcuBootDfu(_)
            | Self::ProgramModemUartDfu(_) => "program",
            Self::Verify { .. } => "verify",
            Self::ReadToFile { .. } => "read to file",
            Self::Erase { .. } => "erase",
            Self::Recover => "recover",
            Self::Reset => "reset",
            Self::Open => "open device long term",
            Self::Close => "close opened device",
            Self::RttStart(_) => "start rtt",
            Self::RttStop(_) => "stop rtt",
            Self::RttRead(_) => "rtt read",
            Self::RttWrite(_) => "rtt write",
        }
    }

    /// Number of values the complete phase hands to the caller on success.
    pub const fn return_parameter_count(&self) -> usize {
        match self {
            Self::LibraryVersion { .. }
            | Self::ConnectedDevices { .. }
            | Self::SerialNumbers { .. }
            | Self::DeviceInfo { .. }
            | Self::ProbeInfo { .. }
            | Self::LibraryInfo { .. }
            | Self::DeviceVersion { .. }
            | Self::Read { .. }
            | Self::ReadU32 { .. } => 1,
            Self::RttStart(_) | Self::RttWrite(_) => 2,
            Self::RttRead(_) => 3,
            _ => 0,
        }
    }

    pub const fn may_have_progress(&self) -> bool {
        matches!(
            self,
            Self::Program { .. }
                | Self::ProgramDfu { .. }
                | Self::ProgramMcuBootDfu(_)
                | Self::ProgramModemUartDfu(_)
                | Self::Verify { .. }
                | Self::ReadToFile { .. }
                | Self::Erase { .. }
                | Self::Recover
        )
    }

    /// Whether the target CPU is reset once the operation has run.
    pub const fn needs_reset(&self) -> bool {
        matches!(
            self,
            Self::Read { .. }
                | Self::ReadU32 { .. }
                | Self::Write { .. }
                | Self::WriteU32 { .. }
                | Self::Program { .. }
                | Self::ProgramDfu { .. }
                | Self::Verify { .. }
                | Self::ReadToFile { .. }
                | Self::Erase { .. }
                | Self::Recover
                | Self::Close
        )
    }

    pub const fn probe_kind(&self) -> ProbeKind {
        match self {
            Self::ProgramDfu { .. } => ProbeKind::Dfu,
            Self::ProgramMcuBootDfu(_) => ProbeKind::McuBoot,
            Self::ProgramModemUartDfu(_) => ProbeKind::ModemUartDfu,
            _ => ProbeKind::Debug,
        }
    }

    /// Whether an RTT operation found no running session.
    pub const fn rtt_not_started(&self) -> bool {
        match self {
            Self::RttStop(stop) => stop.rtt_not_started,
            Self::RttRead(read) => read.rtt_not_started,
            Self::RttWrite(write) => write.rtt_not_started,
            _ => false,
        }
    }

    /// Human-readable parameter dump for RTT operations.
    pub fn parameters(&self, serial_number: Option<&SerialNumber>) -> Option<String> {
        match self {
            Self::RttStart(start) => Some(start.dump(serial_number)),
            Self::RttStop(stop) => Some(stop.dump()),
            Self::RttRead(read) => Some(read.dump()),
            Self::RttWrite(write) => Some(write.dump()),
            _ => None,
        }
    }

    /// Perform the driver calls for this operation and record the outputs.
    pub(crate) fn execute<D: Driver + ?Sized>(
        &mut self,
        driver: &mut D,
        target: &ProbeTarget,
        progress: &Progress,
    ) -> Result<(), Failure> {
        match self {
            Self::LibraryVersion { version } => {
                *version = Some(driver.library_version().or_fail(ResultCode::CouldNotOpenDll)?);
            }
            Self::ConnectedDevices { probes } => {
                *probes = driver.connected_probes().or_fail(ResultCode::CouldNotCallFunction)?;
            }
            Self::SerialNumbers { serial_numbers } => {
                *serial_numbers = driver.serial_numbers().or_fail(ResultCode::CouldNotCallFunction)?;
            }
            Self::DeviceInfo { info } => {
                *info = Some(driver.device_info(target).or_fail(ResultCode::CouldNotCallFunction)?);
            }
            Self::ProbeInfo { info } => {
                *info = Some(driver.probe_info(target).or_fail(ResultCode::CouldNotCallFunction)?);
            }
            Self::LibraryInfo { info } => {
                *info = Some(driver.library_info().or_fail(ResultCode::CouldNotOpenDll)?);
            }
            Self::DeviceVersion { version } => {
                *version = Some(driver.device_version(target).or_fail(ResultCode::CouldNotCallFunction)?);
            }
            Self::Read { address, length, data } => {
                *data = driver.read(target, *address, *length).or_fail(ResultCode::CouldNotRead)?;
            }
            Self::ReadU32 { address, data } => {
                *data = driver.read_u32(target, *address).or_fail(ResultCode::CouldNotRead)?;
            }
            Self::Write { address, data } => {
                driver.write(target, *address, data).or_fail(ResultCode::CouldNotWrite)?;
            }
            Self::WriteU32 { address, data } => {
                driver.write_u32(target, *address, *data).or_fail(ResultCode::CouldNotWrite)?;
            }
            Self::Program { source, options } => {
                driver.program(target, source, options, progress).or_fail(ResultCode::CouldNotProgram)?;
            }
            Self::ProgramDfu { filename } => {
                driver
                    .program_dfu(target, DfuRequest::Usb { filename: filename.as_path() }, progress)
                    .or_fail(ResultCode::CouldNotProgram)?;
            }
            Self::ProgramMcuBootDfu(uart) => {
                driver
                    .program_dfu(target, DfuRequest::McuBoot(uart), progress)
                    .or_fail(ResultCode::CouldNotProgram)?;
            }
            Self::ProgramModemUartDfu(uart) => {
                driver
                    .program_dfu(target, DfuRequest::ModemUart(uart), progress)
                    .or_fail(ResultCode::CouldNotProgram)?;
            }
            Self::Verify { filename } => {
                driver.verify(target, filename, progress).or_fail(ResultCode::CouldNotVerify)?;
            }
            Self::ReadToFile { filename, options } => {
                driver
                    .read_to_file(target, filename, options, progress)
                    .or_fail(ResultCode::CouldNotRead)?;
            }
            Self::Erase { mode, start_address, end_address } => {
                driver
                    .erase(target, *mode, *start_address, *end_address, progress)
                    .or_fail(ResultCode::CouldNotErase)?;
            }
            Self::Recover => driver.recover(target, progress).or_fail(ResultCode::CouldNotRecover)?,
            Self::Reset => driver.reset(target).or_fail(ResultCode::CouldNotReset)?,
            Self::Open => driver.open(target).or_fail(ResultCode::CouldNotOpenDevice)?,
            Self::Close => driver.close(target).or_fail(ResultCode::CouldNotCallFunction)?,
            Self::RttStart(start) => start.execute(driver, target)?,
            Self::RttStop(stop) => stop.execute(driver, target)?,
            Self::RttRead(read) => read.execute(driver, target)?,
            Self::RttWrite(write) => write.execute(driver, target)?,
        }
        Ok(())
    }

    /// Convert the recorded outputs into caller-facing values.
    pub(crate) fn into_outputs(self) -> Vec<OutputValue> {
        match self {
            Self::LibraryVersion { version } => version.map(OutputValue::LibraryVersion).into_iter().collect(),
            Self::ConnectedDevices { probes } => vec![OutputValue::Probes(probes)],
            Self::SerialNumbers { serial_numbers } => vec![OutputValue::SerialNumbers(serial_numbers)],
            Self::DeviceInfo { info } => info.map(OutputValue::DeviceInfo).into_iter().collect(),
            Self::ProbeInfo { info } => info.map(OutputValue::ProbeInfo).into_iter().collect(),
            Self::LibraryInfo { info } => info.map(OutputValue::LibraryInfo).into_iter().collect(),
            Self::DeviceVersion { version } => version.map(OutputValue::DeviceVersion).into_iter().collect(),
            Self::Read { data, .. } => vec![OutputValue::Bytes(data)],
            Self::ReadU32 { data, .. } => vec![OutputValue::Word(data)],
            Self::RttStart(start) => vec![
                OutputValue::Channels(start.down_channels),
                OutputValue::Channels(start.up_channels),
            ],
            Self::RttRead(read) => vec![
                OutputValue::Text(String::from_utf8_lossy(&read.data).into_owned()),
                OutputValue::Bytes(read.data),
                OutputValue::Micros(micros(read.elapsed)),
            ],
            Self::RttWrite(write) => {
                vec![OutputValue::Count(write.written), OutputValue::Micros(micros(write.elapsed))]
            }
            _ => Vec::new(),
        }
    }
}

fn micros(elapsed: std::time::Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtt::RttConnection;

    #[test]
    fn test_reset_policy_by_operation() {
        let resetting = [
            Operation::Read { address: 0, length: 4, data: Vec::new() },
            Operation::Erase { mode: EraseMode::All, start_address: 0, end_address: 0 },
            Operation::Recover,
            Operation::Close,
        ];
        assert!(resetting.iter().all(Operation::needs_reset));

        let not_resetting = [
            Operation::Reset,
            Operation::Open,
            Operation::LibraryVersion { version: None },
            Operation::RttStop(RttStop::default()),
            Operation::ProgramMcuBootDfu(UartDfu {
                filename: "app.bin".into(),
                uart: "/dev/ttyACM0".into(),
                baud_rate: 115_200,
                response_timeout_ms: 5000,
            }),
        ];
        assert!(not_resetting.iter().all(|op| !op.needs_reset()));
    }

    #[test]
    fn test_output_counts_match_outputs() {
        let start = Operation::RttStart(RttStart::new(None, RttConnection::default()));
        assert_eq!(start.return_parameter_count(), 2);
        assert_eq!(start.into_outputs().len(), 2);

        let read = Operation::RttRead(RttRead::new(0, 16));
        assert_eq!(read.return_parameter_count(), 3);
        assert_eq!(read.into_outputs().len(), 3);

        let erase = Operation::Erase { mode: EraseMode::All, start_address: 0, end_address: 0 };
        assert_eq!(erase.return_parameter_count(), 0);
        assert!(erase.into_outputs().is_empty());
    }

    #[test]
    fn test_probe_kind_for_dfu_variants() {
        assert_eq!(Operation::ProgramDfu { filename: "fw.zip".into() }.probe_kind(), ProbeKind::Dfu);
        assert_eq!(Operation::Reset.probe_kind(), ProbeKind::Debug);
        assert_eq!(Operation::ProgramDfu { filename: "fw.zip".into() }.name(), "program");
    }

    #[test]
    fn test_progress_allowed_only_for_long_operations() {
        assert!(Operation::Recover.may_have_progress());
        assert!(!Operation::Write { address: 0, data: vec![1] }.may_have_progress());
    }
}
