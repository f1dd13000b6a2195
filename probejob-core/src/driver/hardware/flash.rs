//! Flash operations on an attached session.

use crate::flash::{EraseMode, FirmwareImage, InputFormat, Progress, ProgramOptions, ReadOptions};
use anyhow::{Context, Result};
use probe_rs::config::MemoryRegion;
use probe_rs::flashing::{BinOptions, DownloadOptions, Format};
use probe_rs::{MemoryInterface, Session};
use std::ops::Range;
use std::path::Path;

/// nRF user information configuration registers.
const UICR: Range<u64> = 0x1000_1000..0x1000_2000;
/// Start of the nRF QSPI execute-in-place window.
const QSPI_BASE: u64 = 0x1200_0000;

fn download_options<'a>(options: &ProgramOptions, progress: &Progress) -> DownloadOptions<'a> {
    let mut download = DownloadOptions::default();
    download.progress = progress.to_flash_progress();
    download.verify = options.verify;
    download.do_chip_erase = options.chip_erase_mode == EraseMode::All;
    download.keep_unwritten_bytes = options.chip_erase_mode == EraseMode::None;
    download
}

fn probe_rs_format(format: InputFormat) -> Format {
    match format {
        InputFormat::Hex => Format::Hex,
        InputFormat::Elf => Format::Elf(Default::default()),
        InputFormat::Bin { base_address } => Format::Bin(BinOptions { base_address: Some(base_address), skip: 0 }),
    }
}

/// Guess the format of a firmware file from its extension.
pub(super) fn format_for(path: &Path) -> InputFormat {
    match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
        Some("hex" | "ihex") => InputFormat::Hex,
        Some("bin") => InputFormat::Bin { base_address: 0 },
        _ => InputFormat::Elf,
    }
}

pub(super) fn program_file(
    session: &mut Session,
    path: &Path,
    format: InputFormat,
    options: &ProgramOptions,
    progress: &Progress,
) -> Result<()> {
    probe_rs::flashing::download_file_with_options(
        session,
        path,
        probe_rs_format(format),
        download_options(options, progress),
    )
    .with_context(|| format!("Failed to program {}", path.display()))
}

pub(super) fn program_image(
    session: &mut Session,
    image: &FirmwareImage,
    options: &ProgramOptions,
    progress: &Progress,
) -> Result<()> {
    let mut loader = session.target().flash_loader();
    for segment in &image.segments {
        loader
            .add_data(u64::from(segment.address), &segment.data)
            .with_context(|| format!("Segment at {:#010x} does not fit in flash", segment.address))?;
    }
    loader
        .commit(session, download_options(options, progress))
        .context("Failed to program image")
}

pub(super) fn verify_file(session: &mut Session, path: &Path, progress: &Progress) -> Result<()> {
    let loader = probe_rs::flashing::build_loader(session, path, probe_rs_format(format_for(path)), None)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    loader
        .verify(session, &mut progress.to_flash_progress())
        .context("Flash contents differ from file")
}

pub(super) fn erase(session: &mut Session, mode: EraseMode, start: u32, end: u32, progress: &Progress) -> Result<()> {
    match mode {
        EraseMode::None => Ok(()),
        EraseMode::All => probe_rs::flashing::erase_all(session, &mut progress.to_flash_progress(), false)
            .context("Failed to erase flash"),
        EraseMode::Pages | EraseMode::PagesIncludingUicr => {
            let range = u64::from(start)..u64::from(end) + 1;
            probe_rs::flashing::erase(session, &mut progress.to_flash_progress(), range.start, range.end, false)
                .with_context(|| format!("Failed to erase {range:#x?}"))?;
            if mode == EraseMode::PagesIncludingUicr {
                probe_rs::flashing::erase(session, &mut progress.to_flash_progress(), UICR.start, UICR.end, false)
                    .context("Failed to erase UICR")?;
            }
            Ok(())
        }
    }
}

/// Memory ranges selected by read options, in dump order.
pub(super) fn dump_regions(session: &Session, options: &ReadOptions) -> Vec<Range<u64>> {
    let map = &session.target().memory_map;
    let code = map.iter().find_map(|r| match r {
        MemoryRegion::Nvm(r) if r.range.start < QSPI_BASE && !UICR.contains(&r.range.start) => Some(r.range.clone()),
        _ => None,
    });
    let qspi = map.iter().find_map(|r| match r {
        MemoryRegion::Nvm(r) if r.range.start >= QSPI_BASE => Some(r.range.clone()),
        _ => None,
    });
    let ram = map.iter().find_map(|r| match r {
        MemoryRegion::Ram(r) => Some(r.range.clone()),
        _ => None,
    });

    let mut regions = Vec::new();
    regions.extend(code.filter(|_| options.code));
    regions.extend(Some(UICR).filter(|_| options.uicr));
    regions.extend(ram.filter(|_| options.ram));
    regions.extend(qspi.filter(|_| options.qspi));
    regions
}

pub(super) fn read_to_file(
    session: &mut Session,
    core_index: usize,
    path: &Path,
    options: &ReadOptions,
    progress: &Progress,
) -> Result<()> {
    let regions = dump_regions(session, options);
    let mut core = session.core(core_index).context("Failed to attach to core")?;
    let mut out = Vec::new();
    for region in regions {
        let size = usize::try_from(region.end - region.start).context("Region too large")?;
        let mut data = vec![0u8; size];
        core.read_8(region.start, &mut data)
            .with_context(|| format!("Failed to read {region:#x?}"))?;
        progress.report(crate::flash::ProgressUpdate::Progress { bytes: u32::try_from(size).unwrap_or(u32::MAX) });
        out.extend(data);
    }
    std::fs::write(path, out).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(format_for(Path::new("app.hex")), InputFormat::Hex);
        assert_eq!(format_for(Path::new("APP.HEX")), InputFormat::Hex);
        assert_eq!(format_for(Path::new("app.bin")), InputFormat::Bin { base_address: 0 });
        assert_eq!(format_for(Path::new("app.elf")), InputFormat::Elf);
        assert_eq!(format_for(Path::new("app")), InputFormat::Elf);
    }

    #[test]
    fn test_download_options_follow_erase_mode() {
        let options = ProgramOptions { verify: false, chip_erase_mode: EraseMode::All, qspi_erase_mode: EraseMode::None };
        let download = download_options(&options, &Progress::disabled("program"));
        assert!(download.do_chip_erase);
        assert!(!download.verify);
        assert!(!download.keep_unwritten_bytes);
    }
}
