//! Error types for AMC525 driver operations

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for AMC525 operations
pub type Result<T> = std::result::Result<T, AmcError>;

/// Errors that can occur during AMC525 operations
#[derive(Debug, Error)]
pub enum AmcError {
    /// Device not found at the expected path
    #[error("Device not found: {path}")]
    DeviceNotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// No AMC525 cards detected on the system
    #[error("No AMC525 cards detected")]
    NoDevicesFound,

    /// Index out of range
    #[error("Index {index} out of range (have {count})")]
    InvalidIndex {
        /// Requested index
        index: usize,
        /// Number of available items
        count: usize,
    },

    /// I/O error during device communication
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Device table version is not the supported one
    #[error("Device table version {found} is not supported (expected {expected})")]
    UnsupportedVersion {
        /// Version byte found in the table
        found: u8,
        /// Supported version
        expected: u8,
    },

    /// Device table structure runs past its bounds or lacks an end marker
    #[error("Truncated device table at offset {offset}: {reason}")]
    TruncatedTable {
        /// Offset of the offending entry
        offset: usize,
        /// Reason for failure
        reason: String,
    },

    /// Device table checksum does not sum to zero
    #[error("Device table checksum mismatch: residual {residual:#06x} over {length} bytes")]
    ChecksumMismatch {
        /// Checksum computed over the consumed span (zero when valid)
        residual: u16,
        /// Length of the consumed span
        length: usize,
    },

    /// An entry payload is shorter than its variant requires
    #[error("Malformed device table entry (tag {tag}) at offset {offset}: {reason}")]
    MalformedEntry {
        /// Offset of the entry header
        offset: usize,
        /// Entry tag
        tag: u8,
        /// Reason for failure
        reason: String,
    },

    /// Device table is structurally valid but unusable for node construction
    #[error("Invalid device table: {reason}")]
    InvalidTable {
        /// Reason for failure
        reason: String,
    },

    /// DMA controller did not come out of reset in time
    #[error("DMA controller reset timed out after {duration_us}us")]
    ResetTimeout {
        /// Deadline in microseconds
        duration_us: u64,
    },

    /// Transfer parameters violate the engine's alignment rule
    #[error(
        "Misaligned DMA transfer: address {address:#x}, buffer {buffer_address:#x}, \
         count {count:#x} (alignment {alignment})"
    )]
    MisalignedTransfer {
        /// Card address
        address: u64,
        /// Device-visible address of the host buffer
        buffer_address: u64,
        /// Byte count after clamping
        count: usize,
        /// Required alignment in bytes
        alignment: usize,
    },

    /// Controller reported error bits after a transfer
    #[error("DMA transfer fault, status {status:#010x}")]
    TransferFault {
        /// CDMA status register value
        status: u32,
    },

    /// Completion wait was forcefully terminated
    #[error("DMA transfer killed")]
    TransferKilled,

    /// Register interface cannot be locked right now
    #[error("Register interface busy: {reason}")]
    Busy {
        /// Reason for failure
        reason: String,
    },

    /// Lock release attempted by an opener that does not hold it
    #[error("Register interface not locked by caller")]
    NotHolder,

    /// Access outside the valid range
    #[error("Offset {offset:#x} out of range (limit {limit:#x})")]
    OutOfRange {
        /// Requested offset
        offset: u64,
        /// Valid limit
        limit: u64,
    },

    /// Caller supplied an unusable argument
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Reason for failure
        reason: String,
    },

    /// Region permissions forbid the requested access
    #[error("Region {region} does not permit {access}")]
    PermissionDenied {
        /// Region name
        region: String,
        /// Attempted access
        access: &'static str,
    },

    /// Driver configuration is inconsistent
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Reason for failure
        reason: String,
    },

    /// Card is being detached and admits no new operations
    #[error("Card detached")]
    Detached,

    /// VFIO container, group or device setup failed
    #[error("VFIO setup failed: {reason}")]
    VfioSetup {
        /// Reason for failure
        reason: String,
    },

    /// Hardware-level error from device
    #[error("Hardware error: {reason}")]
    HardwareError {
        /// Reason for failure
        reason: String,
    },
}

impl AmcError {
    /// Create a device not found error
    pub fn device_not_found(path: impl Into<PathBuf>) -> Self {
        Self::DeviceNotFound { path: path.into() }
    }

    /// Create a truncated table error
    pub fn truncated(offset: usize, reason: impl Into<String>) -> Self {
        Self::TruncatedTable {
            offset,
            reason: reason.into(),
        }
    }

    /// Create a malformed entry error
    pub fn malformed(offset: usize, tag: u8, reason: impl Into<String>) -> Self {
        Self::MalformedEntry {
            offset,
            tag,
            reason: reason.into(),
        }
    }

    /// Create an invalid table error
    pub fn invalid_table(reason: impl Into<String>) -> Self {
        Self::InvalidTable {
            reason: reason.into(),
        }
    }

    /// Create a busy error
    pub fn busy(reason: impl Into<String>) -> Self {
        Self::Busy {
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a VFIO setup error
    pub fn vfio(reason: impl Into<String>) -> Self {
        Self::VfioSetup {
            reason: reason.into(),
        }
    }

    /// Create a hardware error
    pub fn hardware_error(reason: impl Into<String>) -> Self {
        Self::HardwareError {
            reason: reason.into(),
        }
    }

    /// Whether this error came from device table validation.
    ///
    /// Validation failures are fatal to attach: no endpoint may be created.
    pub const fn is_table_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedVersion { .. }
                | Self::TruncatedTable { .. }
                | Self::ChecksumMismatch { .. }
                | Self::MalformedEntry { .. }
                | Self::InvalidTable { .. }
        )
    }
}
