//! Real-time transfer (RTT) job state.
//!
//! RTT jobs carry more state than the other operations: a start job records
//! whether a control block was found and which channels it describes, while
//! stop, read and write report the soft "RTT not started" condition instead
//! of failing when no session is running.

use crate::driver::{Driver, DriverResultExt};
use crate::error::ResultCode;
use crate::job::Failure;
use crate::probe::{DeviceFamily, ProbeTarget, SerialNumber};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

/// Direction of an RTT channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelDirection {
    /// Target to host.
    Up,
    /// Host to target.
    Down,
}

/// Description of a single RTT channel as found in the control block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub index: u32,
    pub direction: ChannelDirection,
    pub name: String,
    pub size: u32,
}

/// Channels enumerated from a control block.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RttChannels {
    pub up: Vec<ChannelInfo>,
    pub down: Vec<ChannelInfo>,
}

/// How to reach the target when starting RTT.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RttConnection {
    pub clock_speed_khz: u32,
    pub family: DeviceFamily,
    /// Location of an external debugger library, when the driver needs one.
    pub debugger_location: Option<PathBuf>,
}

/// State of an RTT start job.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RttStart {
    /// Control block address supplied by the caller. When absent the driver
    /// scans target RAM for it.
    pub control_block_location: Option<u32>,
    pub connection: RttConnection,
    pub found_control_block: bool,
    pub found_channel_information: bool,
    pub up_channels: Vec<ChannelInfo>,
    pub down_channels: Vec<ChannelInfo>,
}

impl RttStart {
    pub fn new(control_block_location: Option<u32>, connection: RttConnection) -> Self {
        Self { control_block_location, connection, ..Self::default() }
    }

    pub const fn has_control_block_location(&self) -> bool {
        self.control_block_location.is_some()
    }

    pub fn dump(&self, serial_number: Option<&SerialNumber>) -> String {
        let mut out = String::from("Parameters:\n");
        let _ = writeln!(out, "Serialnumber: {}", describe_serial(serial_number));
        let _ = writeln!(out, "Has Controlblock: {}", self.has_control_block_location());
        let _ = writeln!(out, "Controlblock location: {}", self.control_block_location.unwrap_or(0));
        out
    }

    pub(crate) fn execute<D: Driver + ?Sized>(
        &mut self,
        driver: &mut D,
        target: &ProbeTarget,
    ) -> Result<(), Failure> {
        if driver.rtt_is_started(target) {
            log::debug!("RTT already running, stopping it before a new start");
            driver.rtt_stop(target).or_fail(ResultCode::RttCouldNotCallFunction)?;
        }

        let location = match self.control_block_location {
            Some(address) => Some(address),
            None => driver
                .rtt_find_control_block(target, &self.connection)
                .or_fail(ResultCode::RttCouldNotFindControlBlock)?,
        };
        let Some(address) = location else {
            return Err(Failure::without_code(ResultCode::RttCouldNotFindControlBlock));
        };

        driver
            .rtt_start(target, address, &self.connection)
            .or_fail(ResultCode::RttCouldNotStartRtt)?;
        self.found_control_block = true;

        match driver.rtt_channels(target) {
            Ok(channels) => {
                self.up_channels = channels.up;
                self.down_channels = channels.down;
                self.found_channel_information = true;
                Ok(())
            }
            Err(code) => {
                if let Err(stop) = driver.rtt_stop(target) {
                    log::warn!("Failed to stop RTT after channel enumeration failed: {stop}");
                }
                Err(Failure::new(ResultCode::RttCouldNotGetChannelInformation, code))
            }
        }
    }
}

/// State of an RTT stop job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RttStop {
    pub rtt_not_started: bool,
}

impl RttStop {
    pub fn dump(&self) -> String {
        "No parameters".to_string()
    }

    pub(crate) fn execute<D: Driver + ?Sized>(
        &mut self,
        driver: &mut D,
        target: &ProbeTarget,
    ) -> Result<(), Failure> {
        if !driver.rtt_is_started(target) {
            self.rtt_not_started = true;
            return Ok(());
        }
        driver.rtt_stop(target).or_fail(ResultCode::RttCouldNotCallFunction)
    }
}

/// State of an RTT read job.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RttRead {
    pub channel_index: u32,
    /// Maximum number of bytes wanted.
    pub length: u32,
    pub data: Vec<u8>,
    pub rtt_not_started: bool,
    /// Time since RTT was started, at the moment of the read.
    pub elapsed: Duration,
}

impl RttRead {
    pub fn new(channel_index: u32, length: u32) -> Self {
        Self { channel_index, length, ..Self::default() }
    }

    pub fn dump(&self) -> String {
        format!(
            "Parameters:\nChannelIndex: {}\nLength wanted: {}\nRTT not started: {}",
            self.channel_index, self.length, self.rtt_not_started
        )
    }

    pub(crate) fn execute<D: Driver + ?Sized>(
        &mut self,
        driver: &mut D,
        target: &ProbeTarget,
    ) -> Result<(), Failure> {
        if !driver.rtt_is_started(target) {
            self.rtt_not_started = true;
            return Ok(());
        }
        self.data = driver
            .rtt_read(target, self.channel_index, self.length)
            .or_fail(ResultCode::RttCouldNotCallFunction)?;
        self.elapsed = driver.rtt_elapsed(target);
        Ok(())
    }
}

/// State of an RTT write job.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RttWrite {
    pub channel_index: u32,
    pub data: Vec<u8>,
    /// Number of bytes the target accepted.
    pub written: u32,
    pub rtt_not_started: bool,
    pub elapsed: Duration,
}

impl RttWrite {
    pub fn new(channel_index: u32, data: Vec<u8>) -> Self {
        Self { channel_index, data, ..Self::default() }
    }

    pub fn length(&self) -> usize {
        self.data.len()
    }

    pub fn dump(&self) -> String {
        format!(
            "Parameters:\nChannelIndex: {}\nLength wanted: {}\nData: {}",
            self.channel_index,
            self.length(),
            String::from_utf8_lossy(&self.data)
        )
    }

    pub(crate) fn execute<D: Driver + ?Sized>(
        &mut self,
        driver: &mut D,
        target: &ProbeTarget,
    ) -> Result<(), Failure> {
        if !driver.rtt_is_started(target) {
            self.rtt_not_started = true;
            return Ok(());
        }
        self.written = driver
            .rtt_write(target, self.channel_index, &self.data)
            .or_fail(ResultCode::RttCouldNotCallFunction)?;
        self.elapsed = driver.rtt_elapsed(target);
        Ok(())
    }
}

fn describe_serial(serial_number: Option<&SerialNumber>) -> String {
    serial_number.map_or_else(|| "first available".to_string(), ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_dump() {
        let start = RttStart::new(Some(0x2000_0400), RttConnection::default());
        let dump = start.dump(Some(&SerialNumber::from(682_000_001)));
        assert!(dump.contains("Serialnumber: 682000001"));
        assert!(dump.contains("Has Controlblock: true"));
        assert!(dump.contains(&format!("Controlblock location: {}", 0x2000_0400)));
    }

    #[test]
    fn test_start_initial_state() {
        let start = RttStart::new(None, RttConnection::default());
        assert!(!start.has_control_block_location());
        assert!(!start.found_control_block);
        assert!(!start.found_channel_information);
        assert!(start.up_channels.is_empty());
        assert!(start.down_channels.is_empty());
    }

    #[test]
    fn test_read_and_write_dumps() {
        let read = RttRead::new(1, 64);
        assert!(read.dump().contains("ChannelIndex: 1"));
        assert!(read.dump().contains("Length wanted: 64"));

        let write = RttWrite::new(0, b"ping".to_vec());
        assert_eq!(write.length(), 4);
        assert!(write.dump().contains("Data: ping"));
        assert_eq!(RttStop::default().dump(), "No parameters");
    }
}
