//! Driver backed by probe-rs.
//!
//! Sessions are attached on demand and cached per probe serial number. A
//! cached session is kept while the probe is held open or an RTT session is
//! running on it; otherwise it is dropped once the call finishes.

mod flash;
mod rtt;

use super::{Driver, DriverResult};
use crate::error::LowLevelError;
use crate::flash::{DfuRequest, EraseMode, ImageSource, Progress, ProgramOptions, ReadOptions};
use crate::probe::{
    DeviceFamily, DeviceInfo, LibraryInfo, LibraryVersion, ProbeDetails, ProbeInfo, ProbeTarget, SerialNumber,
};
use crate::rtt::{RttChannels, RttConnection};
use anyhow::{Context as _, Result};
use probe_rs::config::{MemoryRegion, TargetSelector};
use probe_rs::probe::list::Lister;
use probe_rs::probe::DebugProbeInfo;
use probe_rs::{Core, MemoryInterface, Permissions, Session};
use rtt::RttLink;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// The probe-rs release this driver is built against.
const PROBE_RS_VERSION: LibraryVersion = LibraryVersion { major: 0, minor: 31, revision: 0 };

/// How the hardware backend attaches to targets.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeRsConfig {
    /// Target chip name. Auto-detected when absent.
    pub chip: Option<String>,
    pub speed_khz: Option<u32>,
    pub connect_under_reset: bool,
}

struct Attached {
    session: Session,
    rtt: Option<RttLink>,
    held_open: bool,
}

impl Attached {
    fn idle(&self) -> bool {
        !self.held_open && self.rtt.is_none()
    }
}

/// Driver talking to real probes.
pub struct ProbeRsDriver {
    config: ProbeRsConfig,
    sessions: BTreeMap<SerialNumber, Attached>,
    /// Serial numbers in handle order, from the last enumeration.
    handles: Vec<SerialNumber>,
}

impl std::fmt::Debug for ProbeRsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeRsDriver")
            .field("config", &self.config)
            .field("sessions", &self.sessions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Log a backend failure and report it as a driver code.
trait Lower<T> {
    fn lower(self, code: LowLevelError) -> DriverResult<T>;
}

impl<T> Lower<T> for Result<T> {
    fn lower(self, code: LowLevelError) -> DriverResult<T> {
        self.map_err(|e| {
            log::error!("{e:#}");
            code
        })
    }
}

fn core_of(session: &mut Session, core_index: usize) -> DriverResult<Core<'_>> {
    session.core(core_index).context("Failed to attach to core").lower(LowLevelError::CannotConnect)
}

fn serial_of(info: &DebugProbeInfo) -> SerialNumber {
    SerialNumber::new(info.serial_number.clone().unwrap_or_default())
}

impl ProbeRsDriver {
    pub fn new(config: ProbeRsConfig) -> Self {
        Self { config, sessions: BTreeMap::new(), handles: Vec::new() }
    }

    fn list(&mut self) -> Vec<DebugProbeInfo> {
        let probes = Lister::new().list_all();
        self.handles = probes.iter().map(serial_of).collect();
        probes
    }

    /// Pre-bound handle, then serial number, then the first attached probe.
    fn select(&mut self, target: &ProbeTarget) -> DriverResult<DebugProbeInfo> {
        let mut probes = self.list();
        let index = match (target.handle, &target.serial_number) {
            (Some(handle), _) => Some(handle.0).filter(|i| *i < probes.len()),
            (None, Some(serial)) => probes.iter().position(|p| &serial_of(p) == serial),
            (None, None) => Some(0).filter(|_| !probes.is_empty()),
        };
        match index {
            Some(i) => Ok(probes.swap_remove(i)),
            None if probes.is_empty() => Err(LowLevelError::NoEmulatorConnected),
            None => Err(LowLevelError::EmulatorNotConnected),
        }
    }

    /// Serial number of an already cached session, without enumerating.
    fn cached_key(&self, target: &ProbeTarget) -> Option<&SerialNumber> {
        let serial = match (target.handle, &target.serial_number) {
            (Some(handle), _) => self.handles.get(handle.0),
            (None, Some(serial)) => self.sessions.get_key_value(serial).map(|(k, _)| k),
            (None, None) => self.sessions.keys().next(),
        };
        serial.filter(|serial| self.sessions.contains_key(*serial))
    }

    fn attach(&self, info: &DebugProbeInfo, permissions: Permissions) -> Result<Session> {
        let mut probe = info.open().context("Failed to open probe")?;
        if let Some(speed) = self.config.speed_khz {
            probe.set_speed(speed).context("Failed to set probe speed")?;
        }
        let selector: TargetSelector = match &self.config.chip {
            Some(chip) => chip.as_str().into(),
            None => TargetSelector::Auto,
        };
        let session = if self.config.connect_under_reset {
            probe.attach_under_reset(selector, permissions)
        } else {
            probe.attach(selector, permissions)
        };
        session.context("Failed to attach to target")
    }

    /// Get or create the session for the targeted probe.
    fn session(&mut self, target: &ProbeTarget) -> DriverResult<(SerialNumber, &mut Attached)> {
        let info = self.select(target)?;
        let serial = serial_of(&info);
        if !self.sessions.contains_key(&serial) {
            let session = self.attach(&info, Permissions::default()).lower(LowLevelError::CannotConnect)?;
            log::debug!("Attached to {} through probe {serial}", session.target().name);
            self.sessions.insert(serial.clone(), Attached { session, rtt: None, held_open: false });
        }
        let attached = self.sessions.get_mut(&serial).ok_or(LowLevelError::InternalError)?;
        Ok((serial, attached))
    }

    /// Run `f` on the session and drop the session afterwards unless it is
    /// held open or running RTT.
    fn with_session<T>(
        &mut self,
        target: &ProbeTarget,
        f: impl FnOnce(&mut Attached) -> DriverResult<T>,
    ) -> DriverResult<T> {
        let (serial, attached) = self.session(target)?;
        let result = f(attached);
        if self.sessions.get(&serial).is_some_and(Attached::idle) {
            self.sessions.remove(&serial);
        }
        result
    }

    fn with_core<T>(
        &mut self,
        target: &ProbeTarget,
        code: LowLevelError,
        f: impl FnOnce(&mut Core) -> Result<T>,
    ) -> DriverResult<T> {
        let core_index = target.coprocessor.core_index();
        self.with_session(target, |attached| {
            let mut core = attached.session.core(core_index).context("Failed to attach to core").lower(code)?;
            f(&mut core).lower(code)
        })
    }
}

impl Driver for ProbeRsDriver {
    fn library_version(&mut self) -> DriverResult<LibraryVersion> {
        Ok(PROBE_RS_VERSION)
    }

    fn library_info(&mut self) -> DriverResult<LibraryInfo> {
        Ok(LibraryInfo { name: "probe-rs".to_string(), version: PROBE_RS_VERSION })
    }

    fn connected_probes(&mut self) -> DriverResult<Vec<ProbeDetails>> {
        Ok(self
            .list()
            .iter()
            .map(|p| ProbeDetails::new(serial_of(p), p.vendor_id, p.product_id))
            .collect())
    }

    fn probe_info(&mut self, target: &ProbeTarget) -> DriverResult<ProbeInfo> {
        let info = self.select(target)?;
        Ok(ProbeInfo {
            serial_number: serial_of(&info),
            name: ProbeDetails::new(serial_of(&info), info.vendor_id, info.product_id).name(),
            clock_speed_khz: self.config.speed_khz.unwrap_or_default(),
        })
    }

    fn device_info(&mut self, target: &ProbeTarget) -> DriverResult<DeviceInfo> {
        self.with_session(target, |attached| {
            let target = attached.session.target();
            let family = DeviceFamily::from_target_name(&target.name);
            let nvm = target.memory_map.iter().find_map(|r| match r {
                MemoryRegion::Nvm(r) => Some(r.range.clone()),
                _ => None,
            });
            let ram = target.memory_map.iter().find_map(|r| match r {
                MemoryRegion::Ram(r) => Some(r.range.clone()),
                _ => None,
            });
            Ok(DeviceInfo {
                name: target.name.clone(),
                family,
                architecture: format!("{:?}", target.architecture()),
                code_address: nvm.as_ref().map_or(0, |r| r.start),
                code_size: nvm.as_ref().map_or(0, |r| r.end - r.start),
                code_page_size: family.page_size(),
                ram_address: ram.as_ref().map_or(0, |r| r.start),
                ram_size: ram.as_ref().map_or(0, |r| r.end - r.start),
            })
        })
    }

    fn device_version(&mut self, target: &ProbeTarget) -> DriverResult<String> {
        self.with_session(target, |attached| Ok(attached.session.target().name.clone()))
    }

    fn read(&mut self, target: &ProbeTarget, address: u32, length: u32) -> DriverResult<Vec<u8>> {
        self.with_core(target, LowLevelError::InvalidOperation, |core| {
            let mut data = vec![0u8; length as usize];
            core.read_8(u64::from(address), &mut data).context("Failed to read memory block")?;
            Ok(data)
        })
    }

    fn read_u32(&mut self, target: &ProbeTarget, address: u32) -> DriverResult<u32> {
        self.with_core(target, LowLevelError::InvalidOperation, |core| {
            core.read_word_32(u64::from(address)).context("Failed to read 32-bit word")
        })
    }

    fn write(&mut self, target: &ProbeTarget, address: u32, data: &[u8]) -> DriverResult<()> {
        self.with_core(target, LowLevelError::InvalidOperation, |core| {
            core.write_8(u64::from(address), data).context("Failed to write memory block")
        })
    }

    fn write_u32(&mut self, target: &ProbeTarget, address: u32, value: u32) -> DriverResult<()> {
        self.with_core(target, LowLevelError::InvalidOperation, |core| {
            core.write_word_32(u64::from(address), value).context("Failed to write 32-bit word")
        })
    }

    fn program(
        &mut self,
        target: &ProbeTarget,
        source: &ImageSource,
        options: &ProgramOptions,
        progress: &Progress,
    ) -> DriverResult<()> {
        self.with_session(target, |attached| {
            let session = &mut attached.session;
            let programmed = match source {
                ImageSource::File { filename, format } => {
                    flash::program_file(session, filename, *format, options, progress)
                }
                ImageSource::Content { image, .. } => flash::program_image(session, image, options, progress),
            };
            programmed.lower(LowLevelError::NvmcError)
        })
    }

    fn program_dfu(&mut self, _target: &ProbeTarget, request: DfuRequest<'_>, _progress: &Progress) -> DriverResult<()> {
        log::error!("Bootloader updates are not supported by probe-rs ({})", request.filename().display());
        Err(LowLevelError::NotImplemented)
    }

    fn verify(&mut self, target: &ProbeTarget, filename: &Path, progress: &Progress) -> DriverResult<()> {
        self.with_session(target, |attached| {
            flash::verify_file(&mut attached.session, filename, progress).lower(LowLevelError::VerifyError)
        })
    }

    fn read_to_file(
        &mut self,
        target: &ProbeTarget,
        filename: &Path,
        options: &ReadOptions,
        progress: &Progress,
    ) -> DriverResult<()> {
        let core_index = target.coprocessor.core_index();
        self.with_session(target, |attached| {
            flash::read_to_file(&mut attached.session, core_index, filename, options, progress)
                .lower(LowLevelError::FileOperationFailed)
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
        self.with_session(target, |attached| {
            flash::erase(&mut attached.session, mode, start_address, end_address, progress)
                .lower(LowLevelError::NvmcError)
        })
    }

    fn recover(&mut self, target: &ProbeTarget, progress: &Progress) -> DriverResult<()> {
        let info = self.select(target)?;
        self.sessions.remove(&serial_of(&info));

        // Attaching with erase-all permission unlocks protected devices.
        let mut session = self
            .attach(&info, Permissions::new().allow_erase_all())
            .lower(LowLevelError::RecoverFailed)?;
        probe_rs::flashing::erase_all(&mut session, &mut progress.to_flash_progress(), false)
            .context("Failed to erase device")
            .lower(LowLevelError::RecoverFailed)
    }

    fn reset(&mut self, target: &ProbeTarget) -> DriverResult<()> {
        self.with_core(target, LowLevelError::CannotConnect, |core| core.reset().context("Failed to reset core"))
    }

    fn open(&mut self, target: &ProbeTarget) -> DriverResult<()> {
        let (serial, attached) = self.session(target)?;
        attached.held_open = true;
        log::info!("Holding probe {serial} open");
        Ok(())
    }

    fn close(&mut self, target: &ProbeTarget) -> DriverResult<()> {
        match self.cached_key(target).cloned() {
            Some(serial) => {
                self.sessions.remove(&serial);
                log::info!("Closed probe {serial}");
            }
            None => log::debug!("No open session to close"),
        }
        Ok(())
    }

    fn rtt_is_started(&self, target: &ProbeTarget) -> bool {
        self.cached_key(target)
            .and_then(|serial| self.sessions.get(serial))
            .is_some_and(|attached| attached.rtt.is_some())
    }

    fn rtt_find_control_block(
        &mut self,
        target: &ProbeTarget,
        _connection: &RttConnection,
    ) -> DriverResult<Option<u32>> {
        let core_index = target.coprocessor.core_index();
        self.with_session(target, |attached| {
            rtt::find_control_block(&mut attached.session, core_index).lower(LowLevelError::InvalidOperation)
        })
    }

    fn rtt_start(&mut self, target: &ProbeTarget, control_block: u32, _connection: &RttConnection) -> DriverResult<()> {
        let core_index = target.coprocessor.core_index();
        self.with_session(target, |attached| {
            let mut core = core_of(&mut attached.session, core_index)?;
            let link = RttLink::attach(&mut core, control_block).lower(LowLevelError::InvalidOperation)?;
            attached.rtt = Some(link);
            Ok(())
        })
    }

    fn rtt_channels(&mut self, target: &ProbeTarget) -> DriverResult<RttChannels> {
        self.with_session(target, |attached| {
            attached.rtt.as_mut().map(RttLink::channels).ok_or(LowLevelError::InvalidOperation)
        })
    }

    fn rtt_stop(&mut self, target: &ProbeTarget) -> DriverResult<()> {
        self.with_session(target, |attached| {
            attached.rtt = None;
            Ok(())
        })
    }

    fn rtt_read(&mut self, target: &ProbeTarget, channel: u32, length: u32) -> DriverResult<Vec<u8>> {
        let core_index = target.coprocessor.core_index();
        self.with_session(target, |attached| {
            let link = attached.rtt.as_mut().ok_or(LowLevelError::InvalidOperation)?;
            let mut core = core_of(&mut attached.session, core_index)?;
            link.read(&mut core, channel, length).lower(LowLevelError::InvalidOperation)
        })
    }

    fn rtt_write(&mut self, target: &ProbeTarget, channel: u32, data: &[u8]) -> DriverResult<u32> {
        let core_index = target.coprocessor.core_index();
        self.with_session(target, |attached| {
            let link = attached.rtt.as_mut().ok_or(LowLevelError::InvalidOperation)?;
            let mut core = core_of(&mut attached.session, core_index)?;
            link.write(&mut core, channel, data).lower(LowLevelError::InvalidOperation)
        })
    }

    fn rtt_elapsed(&self, target: &ProbeTarget) -> Duration {
        self.cached_key(target)
            .and_then(|serial| self.sessions.get(serial))
            .and_then(|attached| attached.rtt.as_ref())
            .map_or(Duration::ZERO, |link| link.started_at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: ProbeRsConfig = serde_json::from_str(r#"{"chip": "nRF52840_xxAA"}"#).unwrap();
        assert_eq!(config.chip.as_deref(), Some("nRF52840_xxAA"));
        assert_eq!(config.speed_khz, None);
        assert!(!config.connect_under_reset);
    }

    #[test]
    fn test_no_rtt_without_sessions() {
        let driver = ProbeRsDriver::new(ProbeRsConfig::default());
        assert!(!driver.rtt_is_started(&ProbeTarget::default()));
        assert_eq!(driver.rtt_elapsed(&ProbeTarget::default()), Duration::ZERO);
    }
}
