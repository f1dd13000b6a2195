//! Typed output values handed to the caller by the complete phase.

use crate::probe::{DeviceInfo, LibraryInfo, LibraryVersion, ProbeDetails, ProbeInfo, SerialNumber};
use crate::rtt::ChannelInfo;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum OutputValue {
    LibraryVersion(LibraryVersion),
    LibraryInfo(LibraryInfo),
    Probes(Vec<ProbeDetails>),
    SerialNumbers(Vec<SerialNumber>),
    DeviceInfo(DeviceInfo),
    DeviceVersion(String),
    ProbeInfo(ProbeInfo),
    Bytes(Vec<u8>),
    Word(u32),
    Text(String),
    Count(u32),
    Channels(Vec<ChannelInfo>),
    /// Microseconds since RTT was started.
    Micros(u64),
}

impl OutputValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub const fn as_word(&self) -> Option<u32> {
        match self {
            Self::Word(word) => Some(*word),
            _ => None,
        }
    }

    pub fn as_channels(&self) -> Option<&[ChannelInfo]> {
        match self {
            Self::Channels(channels) => Some(channels),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}
