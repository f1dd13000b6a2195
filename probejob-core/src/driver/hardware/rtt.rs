//! RTT over probe-rs.

use crate::rtt::{ChannelDirection, ChannelInfo, RttChannels};
use anyhow::{Context as _, Result};
use probe_rs::config::MemoryRegion;
use probe_rs::rtt::Rtt;
use probe_rs::{Core, MemoryInterface, Session};
use std::time::Instant;

const SIGNATURE: &[u8] = b"SEGGER RTT\0";
const SCAN_CHUNK: u64 = 4096;

/// A running RTT session.
pub(super) struct RttLink {
    rtt: Rtt,
    pub(super) started_at: Instant,
}

/// Offset of the control block signature in `haystack`.
pub(super) fn find_signature(haystack: &[u8]) -> Option<usize> {
    haystack.windows(SIGNATURE.len()).position(|w| w == SIGNATURE)
}

/// Scan every RAM region of the target for the control block signature.
pub(super) fn find_control_block(session: &mut Session, core_index: usize) -> Result<Option<u32>> {
    let ram: Vec<_> = session
        .target()
        .memory_map
        .iter()
        .filter_map(|r| match r {
            MemoryRegion::Ram(r) => Some(r.range.clone()),
            _ => None,
        })
        .collect();
    let mut core = session.core(core_index).context("Failed to attach to core")?;

    for region in ram {
        let mut at = region.start;
        while at < region.end {
            // Overlap chunks so a signature straddling a boundary is still seen.
            let len = SCAN_CHUNK.min(region.end - at);
            let mut chunk = vec![0u8; usize::try_from(len)?];
            core.read_8(at, &mut chunk)
                .with_context(|| format!("Failed to read RAM at {at:#010x}"))?;
            if let Some(offset) = find_signature(&chunk) {
                let address = at + offset as u64;
                log::debug!("Found RTT control block at {address:#010x}");
                return Ok(Some(u32::try_from(address)?));
            }
            at += len.saturating_sub(SIGNATURE.len() as u64).max(1);
            if len < SCAN_CHUNK {
                break;
            }
        }
    }
    Ok(None)
}

impl RttLink {
    pub(super) fn attach(core: &mut Core, address: u32) -> Result<Self> {
        let rtt = Rtt::attach_at(core, u64::from(address))
            .map_err(|e| anyhow::anyhow!("Failed to attach to RTT at {address:#010x}: {e}"))?;
        log::info!("Attached to RTT control block at {address:#010x}");
        Ok(Self { rtt, started_at: Instant::now() })
    }

    pub(super) fn channels(&mut self) -> RttChannels {
        let describe = |number: usize, name: Option<&str>, size: usize, direction| ChannelInfo {
            index: u32::try_from(number).unwrap_or(u32::MAX),
            direction,
            name: name.unwrap_or_default().to_string(),
            size: u32::try_from(size).unwrap_or(u32::MAX),
        };
        RttChannels {
            up: self
                .rtt
                .up_channels()
                .iter()
                .map(|c| describe(c.number(), c.name(), c.buffer_size(), ChannelDirection::Up))
                .collect(),
            down: self
                .rtt
                .down_channels()
                .iter()
                .map(|c| describe(c.number(), c.name(), c.buffer_size(), ChannelDirection::Down))
                .collect(),
        }
    }

    pub(super) fn read(&mut self, core: &mut Core, channel: u32, length: u32) -> Result<Vec<u8>> {
        let channel = self
            .rtt
            .up_channel(channel as usize)
            .with_context(|| format!("Up channel {channel} not found"))?;
        let mut buffer = vec![0u8; channel.buffer_size().min(length as usize)];
        let read = channel.read(core, &mut buffer).context("Failed to read from RTT up channel")?;
        buffer.truncate(read);
        Ok(buffer)
    }

    pub(super) fn write(&mut self, core: &mut Core, channel: u32, data: &[u8]) -> Result<u32> {
        let channel = self
            .rtt
            .down_channel(channel as usize)
            .with_context(|| format!("Down channel {channel} not found"))?;
        let written = channel.write(core, data).context("Failed to write to RTT down channel")?;
        Ok(u32::try_from(written)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_signature() {
        let mut ram = vec![0u8; 64];
        ram[20..31].copy_from_slice(SIGNATURE);
        assert_eq!(find_signature(&ram), Some(20));
        assert_eq!(find_signature(&[0u8; 64]), None);
        assert_eq!(find_signature(b"SEGGER RT"), None);
    }
}
