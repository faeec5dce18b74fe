use std::io;
use std::path::PathBuf;

/// Errors produced while configuring, attaching to, or servicing a
/// user-backed LUN.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A configfs attribute store failed. Attribute writes are never
    /// retried; the first failure aborts the current operation.
    #[error("failed to write sysfs attribute {attr}: {source}")]
    SysfsWrite {
        attr: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A stale device node was found but the kernel does not expose the
    /// `block_dev`/`reset_ring` attributes needed to recover it in place.
    #[error("kernel lacks ring recovery attribute {missing}")]
    RecoveryUnsupported { missing: PathBuf },

    /// No UIO device advertises this LUN's dev_config string.
    #[error("no uio device matching {dev_config:?}")]
    UioNotFound { dev_config: String },

    /// Reading the map size or mapping the shared region failed.
    #[error("failed to map uio region: {0}")]
    Map(#[source] io::Error),

    /// A block-device node already exists where a fresh one would be
    /// created.
    #[error("device node {0} already exists")]
    DeviceNodeConflict(PathBuf),

    /// The kernel never exposed a `block/*/dev` entry for the LUN's SCSI
    /// address within the wait window.
    #[error("timed out waiting for SCSI device at {pattern}")]
    ScsiAddressTimeout { pattern: String },

    /// A malformed ring entry. The poll worker treats this as fatal and
    /// stops servicing the ring.
    #[error("command ring corrupted at {offset:#x}: {reason}")]
    RingCorruption { offset: u32, reason: &'static str },

    /// A single teardown removal took longer than its timeout.
    #[error("timed out removing {0}")]
    TeardownTimeout(PathBuf),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
