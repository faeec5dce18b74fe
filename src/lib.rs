//! Userspace backend for the Linux TCM-User ("target in userspace")
//! subsystem, part of the LIO stack.
//!
//! The kernel exposes a virtual SCSI logical unit whose commands are handed
//! to this process over a shared-memory command ring. [`Device::open`]
//! drives the configfs lifecycle to create (or recover) the LUN, attaches
//! to its UIO region, and starts a poll worker that turns ring entries into
//! [`ScsiCmd`] values on a bounded channel. The application consumes them,
//! answers with [`ScsiResponse`]s, and the worker completes the originating
//! SCSI commands.
//!
//! Only Linux hosts with the `target_core_user` module are supported.

mod device;
mod error;
mod poll;
mod ring;
mod scsi;
mod sysfs;
mod uio;

pub use device::{DataSizes, Device, NaaWwn, ScsiHandler, Wwn};
pub use error::{Error, Result};
pub use poll::{CmdReceiver, ResponseSender};
pub use ring::MailboxFlags;
pub use scsi::{sense_key, status, ScsiCmd, ScsiResponse};

#[cfg(not(target_os = "linux"))]
compile_error!("only Linux is supported because of the target_core_user driver");
