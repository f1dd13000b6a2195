//! Flash operation parameters and progress reporting.
//!
//! Option types for program, erase and read-to-file jobs, the image sources a
//! program job accepts, and the progress channel long-running operations use.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Erase strategy for erase jobs and for the pre-program erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EraseMode {
    #[default]
    None,
    /// Erase the whole flash.
    All,
    /// Erase the pages covering `start..=end`.
    Pages,
    /// As [`EraseMode::Pages`], also erasing the user configuration registers.
    PagesIncludingUicr,
}

impl EraseMode {
    pub const fn uses_range(self) -> bool {
        matches!(self, Self::Pages | Self::PagesIncludingUicr)
    }
}

/// Options applied by program jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramOptions {
    pub verify: bool,
    pub chip_erase_mode: EraseMode,
    pub qspi_erase_mode: EraseMode,
}

impl Default for ProgramOptions {
    fn default() -> Self {
        Self { verify: true, chip_erase_mode: EraseMode::All, qspi_erase_mode: EraseMode::None }
    }
}

/// Memory areas dumped by read-to-file jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOptions {
    pub ram: bool,
    pub code: bool,
    pub uicr: bool,
    pub qspi: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self { ram: false, code: true, uicr: false, qspi: false }
    }
}

/// On-disk format of a firmware file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputFormat {
    Hex,
    Elf,
    Bin { base_address: u64 },
}

/// A contiguous block of an already-decoded image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub address: u32,
    pub data: Vec<u8>,
}

/// A firmware image that has already been decoded into segments.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FirmwareImage {
    pub segments: Vec<Segment>,
}

impl FirmwareImage {
    pub fn single(address: u32, data: Vec<u8>) -> Self {
        Self { segments: vec![Segment { address, data }] }
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.data.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a program job takes its firmware from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// A file the driver reads itself.
    File { filename: PathBuf, format: InputFormat },
    /// Content decoded by the caller. `filename` is only used for diagnostics.
    Content { filename: String, image: FirmwareImage },
}

impl ImageSource {
    pub fn filename(&self) -> String {
        match self {
            Self::File { filename, .. } => filename.display().to_string(),
            Self::Content { filename, .. } => filename.clone(),
        }
    }
}

/// Serial transport parameters for MCUboot and modem firmware updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UartDfu {
    pub filename: PathBuf,
    /// Serial port, e.g. `/dev/ttyACM0`.
    pub uart: String,
    pub baud_rate: u32,
    pub response_timeout_ms: u32,
}

/// A firmware update that goes through a bootloader instead of the debug port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuRequest<'a> {
    Usb { filename: &'a std::path::Path },
    McuBoot(&'a UartDfu),
    ModemUart(&'a UartDfu),
}

impl DfuRequest<'_> {
    pub fn filename(&self) -> &std::path::Path {
        match self {
            Self::Usb { filename } => filename,
            Self::McuBoot(uart) | Self::ModemUart(uart) => &uart.filename,
        }
    }
}

/// Progress information for long-running operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressUpdate {
    Started,
    Erasing,
    Programming { total: u64 },
    Progress { bytes: u32 },
    Verifying,
    Finished,
    Failed,
    Message(String),
}

impl fmt::Display for ProgressUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => f.write_str("started"),
            Self::Erasing => f.write_str("erasing"),
            Self::Programming { total } => write!(f, "programming {total} bytes"),
            Self::Progress { bytes } => write!(f, "{bytes} bytes done"),
            Self::Verifying => f.write_str("verifying"),
            Self::Finished => f.write_str("finished"),
            Self::Failed => f.write_str("failed"),
            Self::Message(message) => f.write_str(message),
        }
    }
}

type ProgressSink = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Progress channel handed to the driver during an execute phase.
///
/// Jobs that may not report progress get a disabled reporter; updates sent
/// to it are dropped.
#[derive(Clone)]
pub struct Progress {
    operation: &'static str,
    sink: Option<ProgressSink>,
}

impl Progress {
    pub fn new(operation: &'static str, sink: impl Fn(ProgressUpdate) + Send + Sync + 'static) -> Self {
        Self { operation, sink: Some(Arc::new(sink)) }
    }

    pub const fn disabled(operation: &'static str) -> Self {
        Self { operation, sink: None }
    }

    pub const fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn report(&self, update: ProgressUpdate) {
        match &self.sink {
            Some(sink) => sink(update),
            None => log::warn!("Dropping progress '{}' from {}: operation reports no progress", update, self.operation),
        }
    }

    /// Convert this to a `probe_rs::flashing::FlashProgress`.
    #[cfg(feature = "hardware")]
    pub fn to_flash_progress(&self) -> probe_rs::flashing::FlashProgress<'static> {
        use probe_rs::flashing::ProgressEvent;

        let progress = self.clone();
        probe_rs::flashing::FlashProgress::new(move |event| {
            let update = match event {
                ProgressEvent::Started(_) => ProgressUpdate::Started,
                ProgressEvent::Progress { size, .. } => ProgressUpdate::Progress {
                    bytes: u32::try_from(size).unwrap_or(u32::MAX),
                },
                ProgressEvent::Finished(_) => ProgressUpdate::Finished,
                ProgressEvent::Failed(_) => ProgressUpdate::Failed,
                ProgressEvent::DiagnosticMessage { message } => ProgressUpdate::Message(message),
                _ => return,
            };
            if progress.is_enabled() {
                progress.report(update);
            }
        })
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("operation", &self.operation)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_progress_reporting_in_order() {
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let progress = Progress::new("program", move |update| {
            let _ = tx.lock().unwrap().send(update);
        });

        progress.report(ProgressUpdate::Erasing);
        progress.report(ProgressUpdate::Programming { total: 4096 });
        progress.report(ProgressUpdate::Finished);

        let received: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            received,
            vec![
                ProgressUpdate::Erasing,
                ProgressUpdate::Programming { total: 4096 },
                ProgressUpdate::Finished
            ]
        );
    }

    #[test]
    fn test_disabled_progress_drops_updates() {
        let progress = Progress::disabled("write");
        assert!(!progress.is_enabled());
        progress.report(ProgressUpdate::Started);
    }

    #[test]
    fn test_erase_mode_range() {
        assert!(EraseMode::Pages.uses_range());
        assert!(!EraseMode::All.uses_range());
    }

    #[test]
    fn test_firmware_image_len() {
        let image = FirmwareImage {
            segments: vec![
                Segment { address: 0, data: vec![0; 16] },
                Segment { address: 0x1000, data: vec![0; 8] },
            ],
        };
        assert_eq!(image.len(), 24);
        assert!(FirmwareImage::default().is_empty());
    }

    #[test]
    fn test_default_program_options() {
        let options = ProgramOptions::default();
        assert!(options.verify);
        assert_eq!(options.chip_erase_mode, EraseMode::All);
    }
}
