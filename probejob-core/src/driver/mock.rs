//! In-memory driver for tests and `--mock` runs.
//!
//! Simulates an nRF52840 behind one or more J-Link probes: sparse flash, UICR
//! and RAM, an RTT control block that can be found by scanning RAM, and a
//! call log that records when every hardware call started and finished.

use super::{Driver, DriverResult};
use crate::error::LowLevelError;
use crate::flash::{DfuRequest, EraseMode, FirmwareImage, ImageSource, Progress, ProgramOptions, ProgressUpdate, ReadOptions};
use crate::probe::{
    DeviceFamily, DeviceInfo, LibraryInfo, LibraryVersion, ProbeDetails, ProbeInfo, ProbeTarget, SerialNumber,
};
use crate::rtt::{ChannelDirection, ChannelInfo, RttChannels, RttConnection};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

pub const FLASH: std::ops::Range<u32> = 0..0x10_0000;
pub const UICR: std::ops::Range<u32> = 0x1000_1000..0x1000_2000;
pub const RAM: std::ops::Range<u32> = 0x2000_0000..0x2004_0000;
pub const PAGE_SIZE: u32 = 4096;

const RTT_ID: &[u8; 16] = b"SEGGER RTT\0\0\0\0\0\0";
const RTT_HEADER_SIZE: u32 = 24;
const RTT_DESCRIPTOR_SIZE: u32 = 24;
const RTT_MAX_NAME: u32 = 32;

/// One recorded hardware call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub operation: &'static str,
    pub serial_number: Option<SerialNumber>,
    pub started: Instant,
    pub finished: Instant,
    pub success: bool,
}

impl CallRecord {
    pub fn overlaps(&self, other: &Self) -> bool {
        self.started < other.finished && other.started < self.finished
    }
}

/// Shared, append-only record of the calls a [`MockDriver`] served.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<CallRecord>>>);

impl CallLog {
    fn push(&self, record: CallRecord) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(record);
    }

    pub fn records(&self) -> Vec<CallRecord> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn operations(&self) -> Vec<&'static str> {
        self.records().into_iter().map(|r| r.operation).collect()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.records().iter().filter(|r| r.operation == operation).count()
    }

    /// Whether any two recorded calls were in flight at the same time.
    pub fn has_overlap(&self) -> bool {
        let records = self.records();
        records
            .iter()
            .enumerate()
            .any(|(i, a)| records[i + 1..].iter().any(|b| a.overlaps(b)))
    }

    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[derive(Debug, Clone)]
struct RttSession {
    control_block: u32,
    started_at: Instant,
}

/// Simulated probe and target.
#[derive(Debug)]
pub struct MockDriver {
    probes: Vec<ProbeDetails>,
    device: DeviceInfo,
    memory: BTreeMap<u32, u8>,
    images: HashMap<PathBuf, FirmwareImage>,
    dumps: HashMap<PathBuf, Vec<u8>>,
    faults: HashMap<&'static str, LowLevelError>,
    panics: HashSet<&'static str>,
    latency: Duration,
    opened: HashSet<SerialNumber>,
    rtt: HashMap<SerialNumber, RttSession>,
    rtt_up: HashMap<u32, VecDeque<u8>>,
    rtt_down: HashMap<u32, Vec<u8>>,
    log: CallLog,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// One J-Link with serial number 682000001 attached to an nRF52840.
    pub fn new() -> Self {
        Self {
            probes: vec![ProbeDetails::new(SerialNumber::from(682_000_001u32), 0x1366, 0x1015)],
            device: DeviceInfo {
                name: "nRF52840_xxAA".to_string(),
                family: DeviceFamily::Nrf52,
                architecture: "Armv7em".to_string(),
                code_address: u64::from(FLASH.start),
                code_size: u64::from(FLASH.end - FLASH.start),
                code_page_size: u64::from(PAGE_SIZE),
                ram_address: u64::from(RAM.start),
                ram_size: u64::from(RAM.end - RAM.start),
            },
            memory: BTreeMap::new(),
            images: HashMap::new(),
            dumps: HashMap::new(),
            faults: HashMap::new(),
            panics: HashSet::new(),
            latency: Duration::ZERO,
            opened: HashSet::new(),
            rtt: HashMap::new(),
            rtt_up: HashMap::new(),
            rtt_down: HashMap::new(),
            log: CallLog::default(),
        }
    }

    #[must_use]
    pub fn with_probes(mut self, probes: Vec<ProbeDetails>) -> Self {
        self.probes = probes;
        self
    }

    /// Sleep this long inside every hardware call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Register a firmware file that program, DFU and verify jobs can refer to.
    #[must_use]
    pub fn with_image(mut self, filename: impl Into<PathBuf>, image: FirmwareImage) -> Self {
        self.images.insert(filename.into(), image);
        self
    }

    /// Place an RTT control block in target memory.
    ///
    /// Channels are given as `(name, buffer size)`. Names are stored after the
    /// descriptors, the way target firmware lays them out.
    #[must_use]
    pub fn with_rtt_control_block(mut self, address: u32, up: &[(&str, u32)], down: &[(&str, u32)]) -> Self {
        let count = |n: usize| u32::try_from(n).unwrap_or(u32::MAX);
        let mut block = RTT_ID.to_vec();
        block.extend_from_slice(&count(up.len()).to_le_bytes());
        block.extend_from_slice(&count(down.len()).to_le_bytes());

        let mut name_at = address + RTT_HEADER_SIZE + count(up.len() + down.len()) * RTT_DESCRIPTOR_SIZE;
        let mut names = Vec::new();
        for (name, size) in up.iter().chain(down) {
            for word in [name_at, 0, *size, 0, 0, 0] {
                block.extend_from_slice(&word.to_le_bytes());
            }
            names.extend_from_slice(name.as_bytes());
            names.push(0);
            name_at += count(name.len() + 1);
        }
        block.extend_from_slice(&names);
        self.poke(address, &block);
        self
    }

    /// Make every call of `operation` fail with `code` until cleared.
    pub fn fail_on(&mut self, operation: &'static str, code: LowLevelError) {
        self.faults.insert(operation, code);
    }

    pub fn clear_faults(&mut self) {
        self.faults.clear();
        self.panics.clear();
    }

    /// Make the next call of `operation` panic, as a driver bug would.
    pub fn panic_on(&mut self, operation: &'static str) {
        self.panics.insert(operation);
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    /// Read memory without going through the call log. Unwritten flash reads
    /// as erased.
    pub fn peek(&self, address: u32, length: u32) -> Vec<u8> {
        (address..address.saturating_add(length)).map(|a| self.byte_at(a)).collect()
    }

    pub fn poke(&mut self, address: u32, data: &[u8]) {
        for (a, byte) in (address..).zip(data) {
            self.memory.insert(a, *byte);
        }
    }

    /// Queue bytes the target sends on an up channel.
    pub fn push_rtt_up(&mut self, channel: u32, data: &[u8]) {
        self.rtt_up.entry(channel).or_default().extend(data);
    }

    /// Bytes the host has written to a down channel so far.
    pub fn rtt_down_data(&self, channel: u32) -> &[u8] {
        self.rtt_down.get(&channel).map_or(&[], Vec::as_slice)
    }

    /// Contents of a file written by a read-to-file job.
    pub fn dump(&self, filename: &Path) -> Option<&[u8]> {
        self.dumps.get(filename).map(Vec::as_slice)
    }

    pub fn is_open(&self, serial_number: &SerialNumber) -> bool {
        self.opened.contains(serial_number)
    }

    fn byte_at(&self, address: u32) -> u8 {
        self.memory.get(&address).copied().unwrap_or_else(|| {
            if FLASH.contains(&address) || UICR.contains(&address) {
                0xFF
            } else {
                0
            }
        })
    }

    fn check_range(address: u32, length: u32) -> DriverResult<()> {
        let end = address.checked_add(length).ok_or(LowLevelError::InvalidParameter)?;
        let inside = |r: &std::ops::Range<u32>| r.start <= address && end <= r.end;
        if [FLASH, UICR, RAM].iter().any(inside) {
            Ok(())
        } else {
            Err(LowLevelError::InvalidParameter)
        }
    }

    fn erase_range(&mut self, range: std::ops::Range<u32>) {
        let keys: Vec<u32> = self.memory.range(range).map(|(a, _)| *a).collect();
        for key in keys {
            self.memory.remove(&key);
        }
    }

    fn write_image(&mut self, image: &FirmwareImage, progress: &Progress) -> DriverResult<()> {
        progress.report(ProgressUpdate::Programming { total: image.len() as u64 });
        for segment in &image.segments {
            let length = u32::try_from(segment.data.len()).map_err(|_| LowLevelError::InvalidParameter)?;
            Self::check_range(segment.address, length)?;
            self.poke(segment.address, &segment.data);
            progress.report(ProgressUpdate::Progress { bytes: length });
        }
        Ok(())
    }

    fn image(&self, filename: &Path) -> DriverResult<FirmwareImage> {
        self.images.get(filename).cloned().ok_or(LowLevelError::FileOperationFailed)
    }

    fn matches_memory(&self, image: &FirmwareImage) -> bool {
        image.segments.iter().all(|s| {
            let length = u32::try_from(s.data.len()).unwrap_or(u32::MAX);
            self.peek(s.address, length) == s.data
        })
    }

    /// Pick the probe a call acts on: pre-bound handle, then serial number,
    /// then the first attached probe.
    fn resolve(&self, target: &ProbeTarget) -> DriverResult<SerialNumber> {
        if let Some(handle) = target.handle {
            return self
                .probes
                .get(handle.0)
                .map(|p| p.serial_number.clone())
                .ok_or(LowLevelError::InvalidParameter);
        }
        match &target.serial_number {
            Some(serial) if self.probes.iter().any(|p| &p.serial_number == serial) => Ok(serial.clone()),
            Some(_) => Err(LowLevelError::EmulatorNotConnected),
            None => self
                .probes
                .first()
                .map(|p| p.serial_number.clone())
                .ok_or(LowLevelError::NoEmulatorConnected),
        }
    }

    /// Run one simulated hardware call and record it.
    fn call<T>(
        &mut self,
        operation: &'static str,
        target: Option<&ProbeTarget>,
        body: impl FnOnce(&mut Self, Option<&SerialNumber>) -> DriverResult<T>,
    ) -> DriverResult<T> {
        let started = Instant::now();
        if self.panics.remove(operation) {
            panic!("injected panic in {operation}");
        }
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        let serial = target.map(|t| self.resolve(t)).transpose();
        let fault = self.faults.get(operation).copied();
        let result = match (fault, serial) {
            (Some(code), _) => Err(code),
            (None, Err(code)) => Err(code),
            (None, Ok(serial)) => body(self, serial.as_ref()),
        };
        let serial_number = target.and_then(|t| self.resolve(t).ok());
        self.log.push(CallRecord {
            operation,
            serial_number,
            started,
            finished: Instant::now(),
            success: result.is_ok(),
        });
        result
    }

    fn session(&self, serial: Option<&SerialNumber>) -> DriverResult<&RttSession> {
        serial.and_then(|s| self.rtt.get(s)).ok_or(LowLevelError::InvalidOperation)
    }

    fn read_name(&self, address: u32) -> String {
        let bytes: Vec<u8> = self.peek(address, RTT_MAX_NAME).into_iter().take_while(|b| *b != 0).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn read_word(&self, address: u32) -> u32 {
        let bytes = self.peek(address, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn parse_control_block(&self, address: u32) -> DriverResult<RttChannels> {
        if self.peek(address, 16) != RTT_ID {
            return Err(LowLevelError::InvalidOperation);
        }
        let max_up = self.read_word(address + 16);
        let max_down = self.read_word(address + 20);
        let descriptor = |slot: u32, index: u32, direction| {
            let at = address + RTT_HEADER_SIZE + slot * RTT_DESCRIPTOR_SIZE;
            ChannelInfo {
                index,
                direction,
                name: self.read_name(self.read_word(at)),
                size: self.read_word(at + 8),
            }
        };
        Ok(RttChannels {
            up: (0..max_up).map(|i| descriptor(i, i, ChannelDirection::Up)).collect(),
            down: (0..max_down).map(|i| descriptor(max_up + i, i, ChannelDirection::Down)).collect(),
        })
    }
}

impl Driver for MockDriver {
    fn library_version(&mut self) -> DriverResult<LibraryVersion> {
        self.call("library_version", None, |_, _| Ok(LibraryVersion { major: 10, minor: 24, revision: 0 }))
    }

    fn library_info(&mut self) -> DriverResult<LibraryInfo> {
        self.call("library_info", None, |_, _| {
            Ok(LibraryInfo {
                name: "mock".to_string(),
                version: LibraryVersion { major: 10, minor: 24, revision: 0 },
            })
        })
    }

    fn connected_probes(&mut self) -> DriverResult<Vec<ProbeDetails>> {
        self.call("connected_probes", None, |driver, _| Ok(driver.probes.clone()))
    }

    fn probe_info(&mut self, target: &ProbeTarget) -> DriverResult<ProbeInfo> {
        self.call("probe_info", Some(target), |driver, serial| {
            let details = driver
                .probes
                .iter()
                .find(|p| Some(&p.serial_number) == serial)
                .ok_or(LowLevelError::NoEmulatorConnected)?;
            Ok(ProbeInfo {
                serial_number: details.serial_number.clone(),
                name: details.name(),
                clock_speed_khz: 2000,
            })
        })
    }

    fn device_info(&mut self, target: &ProbeTarget) -> DriverResult<DeviceInfo> {
        self.call("device_info", Some(target), |driver, _| Ok(driver.device.clone()))
    }

    fn device_version(&mut self, target: &ProbeTarget) -> DriverResult<String> {
        self.call("device_version", Some(target), |driver, _| {
            Ok(format!("{}_REV2", driver.device.name.to_ascii_uppercase()))
        })
    }

    fn read(&mut self, target: &ProbeTarget, address: u32, length: u32) -> DriverResult<Vec<u8>> {
        self.call("read", Some(target), |driver, _| {
            Self::check_range(address, length)?;
            Ok(driver.peek(address, length))
        })
    }

    fn read_u32(&mut self, target: &ProbeTarget, address: u32) -> DriverResult<u32> {
        self.call("read_u32", Some(target), |driver, _| {
            Self::check_range(address, 4)?;
            Ok(driver.read_word(address))
        })
    }

    fn write(&mut self, target: &ProbeTarget, address: u32, data: &[u8]) -> DriverResult<()> {
        self.call("write", Some(target), |driver, _| {
            let length = u32::try_from(data.len()).map_err(|_| LowLevelError::InvalidParameter)?;
            Self::check_range(address, length)?;
            driver.poke(address, data);
            Ok(())
        })
    }

    fn write_u32(&mut self, target: &ProbeTarget, address: u32, value: u32) -> DriverResult<()> {
        self.call("write_u32", Some(target), |driver, _| {
            Self::check_range(address, 4)?;
            driver.poke(address, &value.to_le_bytes());
            Ok(())
        })
    }

    fn program(
        &mut self,
        target: &ProbeTarget,
        source: &ImageSource,
        options: &ProgramOptions,
        progress: &Progress,
    ) -> DriverResult<()> {
        self.call("program", Some(target), |driver, _| {
            let image = match source {
                ImageSource::File { filename, .. } => driver.image(filename)?,
                ImageSource::Content { image, .. } => image.clone(),
            };
            progress.report(ProgressUpdate::Started);
            if options.chip_erase_mode == EraseMode::All {
                progress.report(ProgressUpdate::Erasing);
                driver.erase_range(FLASH);
            }
            driver.write_image(&image, progress)?;
            if options.verify {
                progress.report(ProgressUpdate::Verifying);
                if !driver.matches_memory(&image) {
                    return Err(LowLevelError::VerifyError);
                }
            }
            progress.report(ProgressUpdate::Finished);
            Ok(())
        })
    }

    fn program_dfu(&mut self, target: &ProbeTarget, request: DfuRequest<'_>, progress: &Progress) -> DriverResult<()> {
        self.call("program_dfu", Some(target), |driver, _| {
            if let DfuRequest::McuBoot(uart) | DfuRequest::ModemUart(uart) = request {
                progress.report(ProgressUpdate::Message(format!("Connecting to {} at {} baud", uart.uart, uart.baud_rate)));
            }
            let image = driver.image(request.filename())?;
            progress.report(ProgressUpdate::Started);
            driver.write_image(&image, progress)?;
            progress.report(ProgressUpdate::Finished);
            Ok(())
        })
    }

    fn verify(&mut self, target: &ProbeTarget, filename: &Path, progress: &Progress) -> DriverResult<()> {
        self.call("verify", Some(target), |driver, _| {
            let image = driver.image(filename)?;
            progress.report(ProgressUpdate::Verifying);
            if driver.matches_memory(&image) {
                progress.report(ProgressUpdate::Finished);
                Ok(())
            } else {
                progress.report(ProgressUpdate::Failed);
                Err(LowLevelError::VerifyError)
            }
        })
    }

    fn read_to_file(
        &mut self,
        target: &ProbeTarget,
        filename: &Path,
        options: &ReadOptions,
        progress: &Progress,
    ) -> DriverResult<()> {
        self.call("read_to_file", Some(target), |driver, _| {
            if options.qspi {
                // The simulated target has no external flash.
                return Err(LowLevelError::InvalidParameter);
            }
            progress.report(ProgressUpdate::Started);
            let regions = [(options.code, FLASH), (options.uicr, UICR), (options.ram, RAM)];
            let mut out = Vec::new();
            for (_, region) in regions.into_iter().filter(|(selected, _)| *selected) {
                let chunk = driver.peek(region.start, region.end - region.start);
                progress.report(ProgressUpdate::Progress { bytes: u32::try_from(chunk.len()).unwrap_or(u32::MAX) });
                out.extend(chunk);
            }
            driver.dumps.insert(filename.to_path_buf(), out);
            progress.report(ProgressUpdate::Finished);
            Ok(())
        })
    }

    fn erase(
        &mut self,
        target: &ProbeTarget,
        mode: EraseMode,
        start_address: u32,
        end_address: u32,
        progress: &Progress,
    ) -> DriverResult<()> {
        self.call("erase", Some(target), |driver, _| {
            progress.report(ProgressUpdate::Erasing);
            match mode {
                EraseMode::None => {}
                EraseMode::All => driver.erase_range(FLASH),
                EraseMode::Pages | EraseMode::PagesIncludingUicr => {
                    let start = start_address - start_address % PAGE_SIZE;
                    let end = end_address.saturating_add(PAGE_SIZE - end_address % PAGE_SIZE);
                    Self::check_range(start, end - start)?;
                    driver.erase_range(start..end);
                    if mode == EraseMode::PagesIncludingUicr {
                        driver.erase_range(UICR);
                    }
                }
            }
            progress.report(ProgressUpdate::Finished);
            Ok(())
        })
    }

    fn recover(&mut self, target: &ProbeTarget, progress: &Progress) -> DriverResult<()> {
        self.call("recover", Some(target), |driver, _| {
            progress.report(ProgressUpdate::Erasing);
            driver.memory.clear();
            driver.rtt.clear();
            progress.report(ProgressUpdate::Finished);
            Ok(())
        })
    }

    fn reset(&mut self, target: &ProbeTarget) -> DriverResult<()> {
        self.call("reset", Some(target), |_, _| Ok(()))
    }

    fn open(&mut self, target: &ProbeTarget) -> DriverResult<()> {
        self.call("open", Some(target), |driver, serial| {
            driver.opened.extend(serial.cloned());
            Ok(())
        })
    }

    fn close(&mut self, target: &ProbeTarget) -> DriverResult<()> {
        self.call("close", Some(target), |driver, serial| {
            if let Some(serial) = serial {
                driver.opened.remove(serial);
                driver.rtt.remove(serial);
            }
            Ok(())
        })
    }

    fn rtt_is_started(&self, target: &ProbeTarget) -> bool {
        self.resolve(target).is_ok_and(|serial| self.rtt.contains_key(&serial))
    }

    fn rtt_find_control_block(
        &mut self,
        target: &ProbeTarget,
        _connection: &RttConnection,
    ) -> DriverResult<Option<u32>> {
        self.call("rtt_find_control_block", Some(target), |driver, _| {
            Ok(driver
                .memory
                .range(RAM)
                .filter(|(_, byte)| **byte == RTT_ID[0])
                .map(|(address, _)| *address)
                .find(|address| driver.peek(*address, 16) == RTT_ID))
        })
    }

    fn rtt_start(&mut self, target: &ProbeTarget, control_block: u32, _connection: &RttConnection) -> DriverResult<()> {
        self.call("rtt_start", Some(target), |driver, serial| {
            driver.parse_control_block(control_block)?;
            let serial = serial.cloned().ok_or(LowLevelError::NoEmulatorConnected)?;
            driver.rtt.insert(serial, RttSession { control_block, started_at: Instant::now() });
            Ok(())
        })
    }

    fn rtt_channels(&mut self, target: &ProbeTarget) -> DriverResult<RttChannels> {
        self.call("rtt_channels", Some(target), |driver, serial| {
            let address = driver.session(serial)?.control_block;
            driver.parse_control_block(address)
        })
    }

    fn rtt_stop(&mut self, target: &ProbeTarget) -> DriverResult<()> {
        self.call("rtt_stop", Some(target), |driver, serial| {
            if let Some(serial) = serial {
                driver.rtt.remove(serial);
            }
            Ok(())
        })
    }

    fn rtt_read(&mut self, target: &ProbeTarget, channel: u32, length: u32) -> DriverResult<Vec<u8>> {
        self.call("rtt_read", Some(target), |driver, serial| {
            let channels = driver.parse_control_block(driver.session(serial)?.control_block)?;
            if channel >= u32::try_from(channels.up.len()).unwrap_or(u32::MAX) {
                return Err(LowLevelError::InvalidParameter);
            }
            let queue = driver.rtt_up.entry(channel).or_default();
            let take = queue.len().min(length as usize);
            Ok(queue.drain(..take).collect())
        })
    }

    fn rtt_write(&mut self, target: &ProbeTarget, channel: u32, data: &[u8]) -> DriverResult<u32> {
        self.call("rtt_write", Some(target), |driver, serial| {
            let channels = driver.parse_control_block(driver.session(serial)?.control_block)?;
            let info = channels.down.get(channel as usize).ok_or(LowLevelError::InvalidParameter)?;
            let accepted = data.len().min(info.size as usize);
            driver.rtt_down.entry(channel).or_default().extend_from_slice(&data[..accepted]);
            Ok(u32::try_from(accepted).unwrap_or(u32::MAX))
        })
    }

    fn rtt_elapsed(&self, target: &ProbeTarget) -> Duration {
        self.resolve(target)
            .ok()
            .and_then(|serial| self.rtt.get(&serial))
            .map_or(Duration::ZERO, |session| session.started_at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeHandle;

    fn target() -> ProbeTarget {
        ProbeTarget::default()
    }

    #[test]
    fn test_unwritten_memory_defaults() {
        let mut driver = MockDriver::new();
        assert_eq!(driver.read(&target(), 0x1000, 2).unwrap(), vec![0xFF, 0xFF]);
        assert_eq!(driver.read(&target(), RAM.start, 2).unwrap(), vec![0, 0]);
        assert_eq!(driver.read(&target(), 0x5000_0000, 4), Err(LowLevelError::InvalidParameter));
    }

    #[test]
    fn test_probe_resolution_order() {
        let driver = MockDriver::new().with_probes(vec![
            ProbeDetails::new(SerialNumber::from(1u32), 0x1366, 0x1015),
            ProbeDetails::new(SerialNumber::from(2u32), 0x1366, 0x1015),
        ]);
        let by_handle = ProbeTarget {
            serial_number: Some(SerialNumber::from(1u32)),
            handle: Some(ProbeHandle(1)),
            ..ProbeTarget::default()
        };
        assert_eq!(driver.resolve(&by_handle), Ok(SerialNumber::from(2u32)));

        let by_serial = ProbeTarget { serial_number: Some(SerialNumber::from(2u32)), ..ProbeTarget::default() };
        assert_eq!(driver.resolve(&by_serial), Ok(SerialNumber::from(2u32)));
        assert_eq!(driver.resolve(&target()), Ok(SerialNumber::from(1u32)));

        let missing = ProbeTarget { serial_number: Some(SerialNumber::from(9u32)), ..ProbeTarget::default() };
        assert_eq!(driver.resolve(&missing), Err(LowLevelError::EmulatorNotConnected));
    }

    #[test]
    fn test_control_block_scan_and_parse() {
        let mut driver =
            MockDriver::new().with_rtt_control_block(0x2000_0400, &[("Terminal", 1024), ("Log", 512)], &[("Terminal", 16)]);
        let found = driver.rtt_find_control_block(&target(), &RttConnection::default()).unwrap();
        assert_eq!(found, Some(0x2000_0400));

        let channels = driver.parse_control_block(0x2000_0400).unwrap();
        assert_eq!(channels.up.len(), 2);
        assert_eq!(channels.up[1].name, "Log");
        assert_eq!(channels.up[1].size, 512);
        assert_eq!(channels.down[0].direction, ChannelDirection::Down);
        assert_eq!(channels.down[0].index, 0);
    }

    #[test]
    fn test_fault_injection_and_log() {
        let mut driver = MockDriver::new();
        let log = driver.log();
        driver.fail_on("write", LowLevelError::NvmcError);
        assert_eq!(driver.write(&target(), 0x1000, &[1]), Err(LowLevelError::NvmcError));
        driver.clear_faults();
        driver.write(&target(), 0x1000, &[1]).unwrap();

        let records = log.records();
        assert_eq!(records.len(), 2);
        assert!(!records[0].success);
        assert!(records[1].success);
        assert_eq!(records[1].serial_number, Some(SerialNumber::from(682_000_001u32)));
        assert!(!log.has_overlap());
    }

    #[test]
    fn test_page_erase_rounds_to_pages() {
        let mut driver = MockDriver::new();
        driver.poke(0x1000, &[0; 4]);
        driver.poke(0x2FFC, &[0; 4]);
        driver.poke(0x3000, &[0; 4]);
        driver
            .erase(&target(), EraseMode::Pages, 0x1004, 0x2004, &Progress::disabled("erase"))
            .unwrap();
        assert_eq!(driver.peek(0x1000, 4), vec![0xFF; 4]);
        assert_eq!(driver.peek(0x2FFC, 4), vec![0xFF; 4]);
        assert_eq!(driver.peek(0x3000, 4), vec![0; 4]);
    }

    #[test]
    fn test_rtt_write_truncates_to_buffer_size() {
        let mut driver = MockDriver::new().with_rtt_control_block(0x2000_0000, &[("Terminal", 64)], &[("Terminal", 4)]);
        driver.rtt_start(&target(), 0x2000_0000, &RttConnection::default()).unwrap();
        assert_eq!(driver.rtt_write(&target(), 0, b"hello").unwrap(), 4);
        assert_eq!(driver.rtt_down_data(0), b"hell");
    }
}
