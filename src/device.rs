//! The `Device` aggregate: one attached userspace LUN and its lifecycle.

use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::{fmt, io, thread};

use rustix::event::{eventfd, EventfdFlags};
use rustix::fd::OwnedFd;

use crate::error::{Error, Result};
use crate::poll::{CmdReceiver, PollWorker, ResponseSender, CHANNEL_DEPTH};
use crate::ring::{Mailbox, MAILBOX_VERSION};
use crate::sysfs::{devfs_root, sysfs_root, SysfsController};
use crate::uio;

/// Geometry of the emulated volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSizes {
    /// Total volume size in bytes.
    pub volume_size: u64,
    /// Block size in bytes.
    pub block_size: u32,
    /// Maximum length of one transfer, in blocks.
    pub block_xfer_max: u32,
}

/// World-wide names for the device and the loopback nexus created for it.
pub trait Wwn {
    fn device_id(&self) -> String;
    fn nexus_id(&self) -> String;
}

/// A plain pair of WWN strings, typically in NAA form.
#[derive(Debug, Clone)]
pub struct NaaWwn {
    pub device_id: String,
    pub nexus_id: String,
}

impl Wwn for NaaWwn {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    fn nexus_id(&self) -> String {
        self.nexus_id.clone()
    }
}

/// The capability a SCSI emulator hands to [`Device::open`].
///
/// The configuration accessors are read during `open`; [`ready`] is invoked
/// exactly once, after the ring is live, with the two channel endpoints the
/// emulator drives from then on.
///
/// [`ready`]: ScsiHandler::ready
pub trait ScsiHandler: Send {
    fn volume_name(&self) -> &str;

    /// Index of the synthetic HBA hosting the backstore.
    fn hba(&self) -> u32;

    fn lun(&self) -> u32;

    fn data_sizes(&self) -> DataSizes;

    fn wwn(&self) -> &dyn Wwn;

    /// Take ownership of the command/response endpoints. Commands arrive in
    /// ring order; responses may be sent back in any order. An error here
    /// aborts `open` and tears the device down again.
    fn ready(&mut self, cmds: CmdReceiver, responses: ResponseSender) -> io::Result<()>;
}

/// One attached userspace LUN.
///
/// Created by [`Device::open`]; the kernel side keeps forwarding SCSI
/// commands until [`Device::close`] (or drop) dismantles it.
pub struct Device {
    handler: Box<dyn ScsiHandler>,
    ctl: SysfsController,
    dev_path: PathBuf,
    volume: String,
    dev_config: String,
    uio_name: String,
    exit: Arc<OwnedFd>,
    worker: Option<thread::JoinHandle<()>>,
    closed: bool,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("volume", &self.volume)
            .field("uio", &self.uio_name)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

fn new_eventfd() -> Result<Arc<OwnedFd>> {
    let fd = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)
        .map_err(|errno| Error::Io(errno.into()))?;
    Ok(Arc::new(fd))
}

impl Device {
    /// Create (or recover) the kernel LUN described by `handler` and attach
    /// to its command ring. A block-device node for the LUN appears at
    /// `dev_path/<volume_name>`.
    pub fn open(dev_path: impl AsRef<Path>, handler: impl ScsiHandler + 'static) -> Result<Self> {
        Self::open_at(
            sysfs_root(),
            devfs_root(),
            dev_path.as_ref(),
            Box::new(handler),
        )
    }

    pub(crate) fn open_at(
        sysfs: &Path,
        devfs: &Path,
        dev_path: &Path,
        handler: Box<dyn ScsiHandler>,
    ) -> Result<Self> {
        let volume = handler.volume_name().to_owned();
        let dev_config = format!("go-tcmu//{volume}");
        let wwn = handler.wwn();
        let ctl = SysfsController::new(
            sysfs,
            handler.hba(),
            &volume,
            &wwn.device_id(),
            &wwn.nexus_id(),
            handler.lun(),
        );

        let node = dev_path.join(&volume);
        let created = node.symlink_metadata().is_err();

        // Unwind a partially created LUN when any later step fails. A
        // recovered device is left as found.
        let guard = scopeguard::guard(created, |created| {
            if !created {
                return;
            }
            if let Err(err) = ctl.teardown() {
                log::warn!("cleanup teardown failed: {err}");
            }
            if let Err(err) = ctl.remove_dev_node(dev_path) {
                log::warn!("cleanup node removal failed: {err}");
            }
        });

        if created {
            // Stale configfs state from a crashed run goes first; absence of
            // every path is the common case.
            if let Err(err) = ctl.teardown() {
                log::debug!("pre-create teardown: {err}");
            }
            ctl.configure(&handler.data_sizes(), &dev_config)?;
            ctl.attach_lun()?;
            ctl.create_dev_node(dev_path)?;
        } else {
            log::debug!(
                "device node {} exists, attempting ring recovery",
                node.display(),
            );
            ctl.check_recovery_supported()?;
            ctl.recover()?;
        }

        let attachment = uio::attach(sysfs, devfs, &dev_config)?;
        let mailbox = Mailbox::new(Arc::clone(&attachment.region))?;
        if mailbox.version() != MAILBOX_VERSION {
            log::warn!("unexpected mailbox version {}", mailbox.version());
        }
        log::debug!(
            "attached {volume} to {} ({} bytes mapped)",
            attachment.name,
            attachment.region.len(),
        );
        log::debug!(
            "mailbox: flags {:?}, cmdr_off {}, cmdr_size {}, head {}, tail {}",
            mailbox.flags(),
            mailbox.cmdr_off(),
            mailbox.cmdr_size(),
            mailbox.cmd_head(),
            mailbox.cmd_tail(),
        );

        let exit = new_eventfd()?;
        let doorbell = new_eventfd()?;
        let (cmd_tx, cmd_rx) = mpsc::sync_channel(CHANNEL_DEPTH);
        let (resp_tx, resp_rx) = mpsc::sync_channel(CHANNEL_DEPTH);
        let responder = ResponseSender::new(resp_tx, Arc::clone(&doorbell));
        let worker = PollWorker::new(
            mailbox,
            Arc::clone(&attachment.fd),
            Arc::clone(&exit),
            doorbell,
            cmd_tx,
            resp_rx,
        );
        let worker = thread::Builder::new()
            .name(format!("tcmu-poll-{volume}"))
            .spawn(move || worker.run())
            .map_err(Error::Io)?;

        scopeguard::ScopeGuard::into_inner(guard);
        let mut device = Self {
            handler,
            ctl,
            dev_path: dev_path.to_owned(),
            volume,
            dev_config,
            uio_name: attachment.name,
            exit,
            worker: Some(worker),
            closed: false,
        };
        if let Err(err) = device.handler.ready(cmd_rx, responder) {
            let _ = device.close();
            return Err(Error::Io(err));
        }
        Ok(device)
    }

    #[must_use]
    pub fn volume_name(&self) -> &str {
        &self.volume
    }

    /// The string identifying this LUN in the UIO registry.
    #[must_use]
    pub fn dev_config(&self) -> &str {
        &self.dev_config
    }

    /// Dismantle the LUN: remove its configfs tree, stop the poll worker,
    /// and delete the device node. Removal keeps going past individual
    /// failures; the first error is what gets reported. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        log::debug!("closing device {}", self.volume);

        let mut first_err = self.ctl.teardown().err();

        // Stop the poll worker; the UIO handle and the mapping are released
        // when it exits.
        let _ = rustix::io::write(&self.exit, &1u64.to_ne_bytes());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("poll worker panicked");
            }
        }

        if let Err(err) = self.ctl.remove_dev_node(&self.dev_path) {
            log::warn!("unable to remove device node: {err}");
            first_err.get_or_insert(err);
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("failed to tear down device {}: {err}", self.volume);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    struct FixtureHandler {
        wwn: NaaWwn,
    }

    impl FixtureHandler {
        fn boxed() -> Box<dyn ScsiHandler> {
            Box::new(Self {
                wwn: NaaWwn {
                    device_id: "naa.1".into(),
                    nexus_id: "naa.2".into(),
                },
            })
        }
    }

    impl ScsiHandler for FixtureHandler {
        fn volume_name(&self) -> &str {
            "vol0"
        }

        fn hba(&self) -> u32 {
            42
        }

        fn lun(&self) -> u32 {
            0
        }

        fn data_sizes(&self) -> DataSizes {
            DataSizes {
                volume_size: 1 << 30,
                block_size: 512,
                block_xfer_max: 256,
            }
        }

        fn wwn(&self) -> &dyn Wwn {
            &self.wwn
        }

        fn ready(&mut self, _cmds: CmdReceiver, _responses: ResponseSender) -> io::Result<()> {
            Ok(())
        }
    }

    struct Roots {
        _tmp: TempDir,
        sysfs: PathBuf,
        devfs: PathBuf,
        dev_path: PathBuf,
    }

    fn roots() -> Roots {
        let tmp = TempDir::new().unwrap();
        let sysfs = tmp.path().join("sys");
        let devfs = tmp.path().join("dev");
        let dev_path = tmp.path().join("dev/x");
        fs::create_dir_all(&devfs).unwrap();
        fs::create_dir_all(&dev_path).unwrap();
        Roots {
            _tmp: tmp,
            sysfs,
            devfs,
            dev_path,
        }
    }

    #[test]
    fn recovery_needs_kernel_support() {
        let r = roots();
        // A node from a previous run, but no recovery attributes.
        fs::write(r.dev_path.join("vol0"), "").unwrap();

        match Device::open_at(&r.sysfs, &r.devfs, &r.dev_path, FixtureHandler::boxed()) {
            Err(Error::RecoveryUnsupported { missing }) => {
                assert!(missing.ends_with("attrib/block_dev"));
            }
            other => panic!("expected RecoveryUnsupported, got {:?}", other.err()),
        }
        // No sysfs state may have been touched.
        assert!(!r.sysfs.join("kernel/config/target/core/user_42/vol0").exists());
    }

    #[test]
    fn recovery_resets_the_ring_without_reconfiguring() {
        let r = roots();
        fs::write(r.dev_path.join("vol0"), "").unwrap();
        let attrib = r
            .sysfs
            .join("kernel/config/target/core/user_42/vol0/attrib");
        fs::create_dir_all(&attrib).unwrap();
        fs::write(attrib.join("block_dev"), "").unwrap();
        fs::write(attrib.join("reset_ring"), "").unwrap();

        // With no uio device in the fake devfs, open fails after recovery.
        match Device::open_at(&r.sysfs, &r.devfs, &r.dev_path, FixtureHandler::boxed()) {
            Err(Error::UioNotFound { dev_config }) => {
                assert_eq!(dev_config, "go-tcmu//vol0");
            }
            other => panic!("expected UioNotFound, got {:?}", other.err()),
        }

        // The freeze/reset/resume sequence ran, and `control` was not
        // rewritten.
        assert_eq!(fs::read_to_string(attrib.join("block_dev")).unwrap(), "1\n0\n");
        assert_eq!(fs::read_to_string(attrib.join("reset_ring")).unwrap(), "1\n");
        assert!(!attrib.parent().unwrap().join("control").exists());
        // Recovery failures leave the live state alone.
        assert!(r.dev_path.join("vol0").exists());
    }
}
