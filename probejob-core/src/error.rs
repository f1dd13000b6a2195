//! Error types.
//!
//! Three layers of status travel with every job:
//! - [`LowLevelError`]: the raw code returned by the driver call surface.
//! - [`ResultCode`]: the generic status of the whole operation.
//! - [`JobError`]: what the caller finally sees when a job did not succeed.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Low-level error code reported by the driver call surface.
///
/// The numeric values follow the vendor programming library so that codes
/// can be logged and compared against its documentation verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[repr(i32)]
pub enum LowLevelError {
    #[error("out of memory")]
    OutOfMemory = -1,
    #[error("invalid operation")]
    InvalidOperation = -2,
    #[error("invalid parameter")]
    InvalidParameter = -3,
    #[error("invalid device for operation")]
    InvalidDeviceForOperation = -4,
    #[error("wrong family for device")]
    WrongFamilyForDevice = -5,
    #[error("unknown device")]
    UnknownDevice = -6,
    #[error("emulator not connected")]
    EmulatorNotConnected = -10,
    #[error("cannot connect")]
    CannotConnect = -11,
    #[error("low voltage")]
    LowVoltage = -12,
    #[error("no emulator connected")]
    NoEmulatorConnected = -13,
    #[error("NVMC error")]
    NvmcError = -20,
    #[error("recover failed")]
    RecoverFailed = -21,
    #[error("not available because of readback protection")]
    NotAvailableBecauseProtection = -90,
    #[error("J-Link ARM library not found")]
    JlinkarmDllNotFound = -100,
    #[error("J-Link ARM library could not be opened")]
    JlinkarmDllCouldNotBeOpened = -101,
    #[error("J-Link ARM library error")]
    JlinkarmDllError = -102,
    #[error("file operation failed")]
    FileOperationFailed = -156,
    #[error("verify failed")]
    VerifyError = -160,
    #[error("time out")]
    Timeout = -220,
    #[error("internal error")]
    InternalError = -254,
    #[error("not implemented")]
    NotImplemented = -255,
}

impl LowLevelError {
    /// The numeric code as reported by the vendor library.
    pub const fn code(self) -> i32 {
        self as i32
    }
}

/// Generic status of an operation, independent of the driver's own codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum ResultCode {
    #[default]
    Success = 0,
    CouldNotFindJlinkDll = 1,
    CouldNotFindJprogDll = 2,
    CouldNotLoadDll = 3,
    CouldNotOpenDevice = 4,
    CouldNotConnectToDevice = 5,
    CouldNotCallFunction = 6,
    CouldNotOpenDll = 7,
    CouldNotErase = 8,
    CouldNotProgram = 9,
    CouldNotRead = 10,
    CouldNotWrite = 11,
    CouldNotOpenFile = 12,
    CouldNotVerify = 13,
    CouldNotRecover = 14,
    CouldNotReset = 15,
    RttCouldNotStartRtt = 16,
    RttCouldNotFindControlBlock = 17,
    RttCouldNotGetChannelInformation = 18,
    RttCouldNotCallFunction = 19,
    CouldNotExecuteDueToLoad = 20,
}

impl ResultCode {
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    pub const fn errno(self) -> u32 {
        self as u32
    }

    /// Refine an operation's failure code using the low-level code that
    /// caused it. Library-loading problems are reported as such no matter
    /// which operation hit them.
    pub const fn refine(self, lowlevel: LowLevelError) -> Self {
        match lowlevel {
            LowLevelError::JlinkarmDllNotFound | LowLevelError::JlinkarmDllCouldNotBeOpened => {
                Self::CouldNotOpenDll
            }
            LowLevelError::NoEmulatorConnected | LowLevelError::EmulatorNotConnected => {
                Self::CouldNotOpenDevice
            }
            LowLevelError::CannotConnect => Self::CouldNotConnectToDevice,
            _ => self,
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Outcome of the post-operation CPU reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResetOutcome {
    /// The operation does not reset the target.
    #[default]
    NotRequired,
    /// The reset was issued and succeeded.
    Done,
    /// The reset was issued and the driver reported an error.
    Failed(LowLevelError),
}

/// Error delivered to the caller by the complete phase.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The execution mutex could not be acquired in time. No driver call was
    /// made, so the operation can be retried.
    #[error("Error occured when {operation}: probe busy, exclusive access not obtained within {timeout:?}")]
    Busy { operation: &'static str, timeout: Duration },

    /// The driver reported an error for the primary operation.
    #[error("Error occured when {operation}: {result} ({})", describe_lowlevel(.lowlevel))]
    Failed {
        operation: &'static str,
        result: ResultCode,
        lowlevel: Option<LowLevelError>,
        reset: ResetOutcome,
    },

    /// The job was rejected at construction.
    #[error("Invalid parameter for {operation}: {reason}")]
    InvalidParameter { operation: &'static str, reason: String },
}

fn describe_lowlevel(lowlevel: &Option<LowLevelError>) -> String {
    lowlevel.map_or_else(
        || "no low-level error".to_string(),
        |e| format!("{e}, code {}", e.code()),
    )
}

impl JobError {
    /// Generic result code of the failure.
    pub const fn result(&self) -> ResultCode {
        match self {
            Self::Busy { .. } => ResultCode::CouldNotExecuteDueToLoad,
            Self::Failed { result, .. } => *result,
            Self::InvalidParameter { .. } => ResultCode::CouldNotCallFunction,
        }
    }

    pub const fn errno(&self) -> u32 {
        self.result().errno()
    }

    /// Low-level driver code, surfaced verbatim.
    pub const fn lowlevel(&self) -> Option<LowLevelError> {
        match self {
            Self::Failed { lowlevel, .. } => *lowlevel,
            _ => None,
        }
    }

    /// Whether retrying the same job may succeed without caller intervention.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    /// Installation advice for failures caused by a missing debugger library.
    pub const fn hint(&self) -> Option<&'static str> {
        match self.lowlevel() {
            Some(LowLevelError::JlinkarmDllNotFound) => Some(
                "The J-Link libraries were not found on this system. Install the \
                 \"J-Link Software and Documentation Pack\" from https://www.segger.com/downloads/jlink/",
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowlevel_codes_match_vendor_values() {
        assert_eq!(LowLevelError::InvalidOperation.code(), -2);
        assert_eq!(LowLevelError::JlinkarmDllNotFound.code(), -100);
        assert_eq!(LowLevelError::NotImplemented.code(), -255);
    }

    #[test]
    fn test_result_code_refine() {
        assert_eq!(
            ResultCode::CouldNotRead.refine(LowLevelError::JlinkarmDllNotFound),
            ResultCode::CouldNotOpenDll
        );
        assert_eq!(ResultCode::CouldNotOpenDll.errno(), 7);
        assert_eq!(
            ResultCode::CouldNotErase.refine(LowLevelError::NvmcError),
            ResultCode::CouldNotErase
        );
    }

    #[test]
    fn test_busy_is_distinct_from_driver_error() {
        let busy = JobError::Busy { operation: "read", timeout: Duration::from_millis(5) };
        assert!(busy.is_retryable());
        assert_eq!(busy.result(), ResultCode::CouldNotExecuteDueToLoad);
        assert_eq!(busy.lowlevel(), None);

        let failed = JobError::Failed {
            operation: "read",
            result: ResultCode::CouldNotRead,
            lowlevel: Some(LowLevelError::CannotConnect),
            reset: ResetOutcome::Done,
        };
        assert!(!failed.is_retryable());
        assert_eq!(failed.lowlevel(), Some(LowLevelError::CannotConnect));
        assert!(failed.to_string().contains("Error occured when read"));
        assert!(failed.to_string().contains("-11"));
    }

    #[test]
    fn test_dll_hint() {
        let err = JobError::Failed {
            operation: "get library version",
            result: ResultCode::CouldNotOpenDll,
            lowlevel: Some(LowLevelError::JlinkarmDllNotFound),
            reset: ResetOutcome::NotRequired,
        };
        assert!(err.hint().is_some_and(|h| h.contains("segger.com")));
    }
}
