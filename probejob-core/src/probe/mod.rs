//! Probe and target metadata.
//!
//! Describes which probe a job talks to and the information the driver
//! reports back about probes, devices and the driver library itself.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Serial number of an attached debug probe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SerialNumber(pub String);

impl SerialNumber {
    pub fn new(serial: impl Into<String>) -> Self {
        Self(serial.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SerialNumber {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SerialNumber {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u32> for SerialNumber {
    fn from(serial: u32) -> Self {
        Self(serial.to_string())
    }
}

/// A probe that was bound before the job was built.
///
/// The handle is the probe's position in the driver's enumeration order, as
/// returned by the connected-devices query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProbeHandle(pub usize);

/// Transport the operation goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProbeKind {
    /// SWD debug probe.
    #[default]
    Debug,
    /// USB DFU bootloader.
    Dfu,
    /// MCUboot serial recovery over a UART.
    McuBoot,
    /// Modem firmware update over a UART.
    ModemUartDfu,
}

/// Which core of a multi-core device an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Coprocessor {
    #[default]
    Application,
    Network,
    Modem,
}

impl Coprocessor {
    /// Core index as used by the debug port.
    pub const fn core_index(self) -> usize {
        match self {
            Self::Application => 0,
            Self::Network => 1,
            Self::Modem => 2,
        }
    }
}

/// Everything a driver call needs to pick the probe and core it acts on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProbeTarget {
    pub serial_number: Option<SerialNumber>,
    pub kind: ProbeKind,
    pub coprocessor: Coprocessor,
    pub handle: Option<ProbeHandle>,
}

/// USB vendor of a debug probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeVendor {
    StLink,
    JLink,
    CmsisDap,
    Other,
}

impl ProbeVendor {
    pub const fn from_usb_ids(vendor_id: u16, _product_id: u16) -> Self {
        match vendor_id {
            0x0483 => Self::StLink,
            0x1366 => Self::JLink,
            0x0D28 => Self::CmsisDap,
            _ => Self::Other,
        }
    }
}

/// A probe found during enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeDetails {
    pub serial_number: SerialNumber,
    pub vendor_id: u16,
    pub product_id: u16,
    pub vendor: ProbeVendor,
}

impl ProbeDetails {
    pub fn new(serial_number: SerialNumber, vendor_id: u16, product_id: u16) -> Self {
        Self {
            serial_number,
            vendor_id,
            product_id,
            vendor: ProbeVendor::from_usb_ids(vendor_id, product_id),
        }
    }

    /// Get a human-readable name for this probe.
    pub fn name(&self) -> String {
        let ids = format!("{:04X}:{:04X}", self.vendor_id, self.product_id);
        match self.vendor {
            ProbeVendor::StLink => format!("ST-Link ({ids})"),
            ProbeVendor::JLink => format!("J-Link ({ids})"),
            ProbeVendor::CmsisDap => format!("CMSIS-DAP ({ids})"),
            ProbeVendor::Other => format!("Unknown ({ids})"),
        }
    }
}

/// Device family, used to pick flash algorithms and RTT scan ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeviceFamily {
    Nrf51,
    Nrf52,
    Nrf53,
    Nrf91,
    #[default]
    Unknown,
}

impl DeviceFamily {
    /// Guess the family from a target name such as `nRF52840_xxAA`.
    pub fn from_target_name(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.starts_with("nrf51") {
            Self::Nrf51
        } else if name.starts_with("nrf52") {
            Self::Nrf52
        } else if name.starts_with("nrf53") {
            Self::Nrf53
        } else if name.starts_with("nrf91") {
            Self::Nrf91
        } else {
            Self::Unknown
        }
    }

    /// A representative chip name to attach with when none is configured.
    pub const fn default_chip(self) -> Option<&'static str> {
        match self {
            Self::Nrf51 => Some("nRF51822_xxAA"),
            Self::Nrf52 => Some("nRF52832_xxAA"),
            Self::Nrf53 => Some("nRF5340_xxAA"),
            Self::Nrf91 => Some("nRF9160_xxAA"),
            Self::Unknown => None,
        }
    }

    /// Flash page size.
    pub const fn page_size(self) -> u64 {
        match self {
            Self::Nrf51 => 1024,
            _ => 4096,
        }
    }
}

/// Information about the connected target device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub family: DeviceFamily,
    pub architecture: String,
    pub code_address: u64,
    pub code_size: u64,
    pub code_page_size: u64,
    pub ram_address: u64,
    pub ram_size: u64,
}

/// Information about the probe itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeInfo {
    pub serial_number: SerialNumber,
    pub name: String,
    pub clock_speed_khz: u32,
}

/// Version triple of the driver library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryVersion {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
}

impl fmt::Display for LibraryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

/// Information about the driver library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryInfo {
    pub name: String,
    pub version: LibraryVersion,
}
