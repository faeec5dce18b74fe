//! The configfs side of the lifecycle: creating, enabling, recovering and
//! dismantling a user-backed LUN.
//!
//! The kernel watches a tree of small attribute files; every operation here
//! is a sequence of short text stores. Roots are injected so tests can run
//! against a plain directory tree.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, OnceLock};
use std::time::Duration;
use std::{env, fs, io, thread};

use crate::device::DataSizes;
use crate::error::{Error, Result};

const CONFIG_DIR: &str = "kernel/config/target";
const MAX_DATA_AREA_MB: u32 = 2048;
const SCSI_WAIT_ATTEMPTS: u32 = 30;
const SCSI_WAIT_DELAY: Duration = Duration::from_secs(1);
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// The system-filesystem root, `$SYSFS` or `/sys`. Read once.
pub(crate) fn sysfs_root() -> &'static Path {
    static ROOT: OnceLock<PathBuf> = OnceLock::new();
    ROOT.get_or_init(|| env::var_os("SYSFS").map_or_else(|| "/sys".into(), PathBuf::from))
}

/// The device-filesystem root, `$DEVFS` or `/dev`. Read once.
pub(crate) fn devfs_root() -> &'static Path {
    static ROOT: OnceLock<PathBuf> = OnceLock::new();
    ROOT.get_or_init(|| env::var_os("DEVFS").map_or_else(|| "/dev".into(), PathBuf::from))
}

/// Drives the configfs tree for one `(hba, volume)` LUN.
pub(crate) struct SysfsController {
    sysfs: PathBuf,
    hba: u32,
    volume: String,
    device_wwn: String,
    nexus: String,
    lun: u32,
}

impl SysfsController {
    pub fn new(
        sysfs: &Path,
        hba: u32,
        volume: &str,
        device_wwn: &str,
        nexus: &str,
        lun: u32,
    ) -> Self {
        Self {
            sysfs: sysfs.to_owned(),
            hba,
            volume: volume.to_owned(),
            device_wwn: device_wwn.to_owned(),
            nexus: nexus.to_owned(),
            lun,
        }
    }

    /// `core/user_<hba>/<volume>` under the target config tree.
    fn core_dir(&self) -> PathBuf {
        self.sysfs
            .join(CONFIG_DIR)
            .join(format!("core/user_{}", self.hba))
            .join(&self.volume)
    }

    fn wwn_dir(&self) -> PathBuf {
        self.sysfs
            .join(CONFIG_DIR)
            .join("loopback")
            .join(&self.device_wwn)
    }

    fn tpgt_dir(&self) -> PathBuf {
        self.wwn_dir().join("tpgt_1")
    }

    fn lun_dir(&self) -> PathBuf {
        self.tpgt_dir().join(format!("lun/lun_{}", self.lun))
    }

    fn lun_link(&self) -> PathBuf {
        self.lun_dir().join(&self.volume)
    }

    fn attrib(&self, name: &str) -> PathBuf {
        self.core_dir().join("attrib").join(name)
    }

    /// One configfs store. Every write is a discrete transaction for the
    /// kernel, so append mode keeps a plain-file double observing the same
    /// sequence of values.
    fn write_attr(&self, attr: &Path, value: &str) -> Result<()> {
        let store = || -> io::Result<()> {
            let dir = attr.parent().expect("attribute path has a parent");
            if !dir.is_dir() {
                log::debug!("creating directory {}", dir.display());
                fs::create_dir_all(dir)?;
            }
            log::debug!("setting {}: {value}", attr.display());
            let mut f = fs::OpenOptions::new().create(true).append(true).open(attr)?;
            f.write_all(value.as_bytes())?;
            f.write_all(b"\n")
        };
        store().map_err(|source| Error::SysfsWrite {
            attr: attr.to_owned(),
            source,
        })
    }

    /// Write the backstore control attributes and enable the LUN.
    pub fn configure(&self, sizes: &DataSizes, dev_config: &str) -> Result<()> {
        let control = self.core_dir().join("control");
        let hw_max_sectors = sizes.block_xfer_max * sizes.block_size / 1024;
        for line in [
            format!("dev_size={}", sizes.volume_size),
            format!("dev_config={dev_config}"),
            format!("hw_block_size={}", sizes.block_size),
            format!("hw_max_sectors={hw_max_sectors}"),
            format!("max_data_area_mb={MAX_DATA_AREA_MB}"),
            "async=1".to_owned(),
        ] {
            self.write_attr(&control, &line)?;
        }
        self.write_attr(&self.core_dir().join("enable"), "1")
    }

    /// Wire the LUN into the loopback HBA: nexus id, LUN directory, and the
    /// symlink that binds the backstore to it.
    pub fn attach_lun(&self) -> Result<()> {
        self.write_attr(&self.tpgt_dir().join("nexus"), &self.nexus)?;

        let lun_dir = self.lun_dir();
        log::debug!("creating directory {}", lun_dir.display());
        fs::create_dir_all(&lun_dir).map_err(Error::Io)?;

        let link = self.lun_link();
        log::debug!(
            "linking {} => {}",
            link.display(),
            self.core_dir().display(),
        );
        std::os::unix::fs::symlink(self.core_dir(), &link).map_err(Error::Io)
    }

    /// Recovery needs the `block_dev` and `reset_ring` attributes; older
    /// kernels do not have them.
    pub fn check_recovery_supported(&self) -> Result<()> {
        for name in ["block_dev", "reset_ring"] {
            let attr = self.attrib(name);
            if !attr.exists() {
                return Err(Error::RecoveryUnsupported { missing: attr });
            }
        }
        Ok(())
    }

    /// Freeze traffic, reset the command ring to empty, resume. Used when a
    /// prior process crashed with the kernel holding outstanding commands.
    pub fn recover(&self) -> Result<()> {
        log::debug!("recovering live LUN {}", self.volume);
        self.write_attr(&self.attrib("block_dev"), "1")?;
        self.write_attr(&self.attrib("reset_ring"), "1")?;
        self.write_attr(&self.attrib("block_dev"), "0")
    }

    /// Create the block-device node for the LUN under `dev_path`, waiting
    /// for the kernel to surface its SCSI address on the bus.
    pub fn create_dev_node(&self, dev_path: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dev_path).map_err(Error::Io)?;
        let node = dev_path.join(&self.volume);
        if node.symlink_metadata().is_ok() {
            return Err(Error::DeviceNodeConflict(node));
        }

        let address_file = self.tpgt_dir().join("address");
        let address = fs::read_to_string(&address_file).map_err(Error::Io)?;
        let (major, minor) =
            self.wait_for_block_dev(address.trim(), SCSI_WAIT_ATTEMPTS, SCSI_WAIT_DELAY)?;

        log::debug!("creating device node {} {major}:{minor}", node.display());
        rustix::fs::mknodat(
            rustix::fs::CWD,
            &node,
            rustix::fs::FileType::BlockDevice,
            rustix::fs::Mode::from_raw_mode(0o600),
            rustix::fs::makedev(major, minor),
        )
        .map_err(|errno| Error::Io(errno.into()))?;
        Ok(node)
    }

    /// Poll `bus/scsi/devices/<address>*/block/*/dev` for the LUN's
    /// `major:minor` numbers.
    fn wait_for_block_dev(
        &self,
        address: &str,
        attempts: u32,
        delay: Duration,
    ) -> Result<(u32, u32)> {
        let pattern = format!(
            "{}/bus/scsi/devices/{address}*/block/*/dev",
            self.sysfs.display(),
        );
        for attempt in 0..attempts {
            if attempt > 0 {
                thread::sleep(delay);
            }
            let matches = self.glob_block_dev(address);
            match matches.len() {
                0 => log::debug!("waiting for {pattern}"),
                1 => {
                    let text = fs::read_to_string(&matches[0]).map_err(Error::Io)?;
                    return parse_major_minor(text.trim())
                        .ok_or_else(|| Error::Io(io::Error::other(
                            format!("invalid major:minor string {text:?}"),
                        )));
                }
                n => {
                    return Err(Error::Io(io::Error::other(format!(
                        "too many matches for {pattern}, found {n}",
                    ))));
                }
            }
        }
        Err(Error::ScsiAddressTimeout { pattern })
    }

    fn glob_block_dev(&self, address: &str) -> Vec<PathBuf> {
        let devices = self.sysfs.join("bus/scsi/devices");
        let mut matches = Vec::new();
        for dev in read_dir_sorted(&devices) {
            if !dev
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with(address))
            {
                continue;
            }
            for blk in read_dir_sorted(&dev.join("block")) {
                let dev_file = blk.join("dev");
                if dev_file.is_file() {
                    matches.push(dev_file);
                }
            }
        }
        matches
    }

    /// Dismantle the configfs tree, leaf first. Every removal is attempted;
    /// the first failure other than NotFound is what gets reported.
    pub fn teardown(&self) -> Result<()> {
        let mut first_err = None;
        for path in [
            self.lun_link(),
            self.lun_dir(),
            self.tpgt_dir(),
            self.wwn_dir(),
            self.core_dir(),
        ] {
            if let Err(err) = remove_with_timeout(&path) {
                log::warn!("unable to remove {}: {err}", path.display());
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Remove a leftover device node, tolerating its absence.
    pub fn remove_dev_node(&self, dev_path: &Path) -> Result<()> {
        remove_with_timeout(&dev_path.join(&self.volume))
    }
}

fn parse_major_minor(s: &str) -> Option<(u32, u32)> {
    let (major, minor) = s.split_once(':')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn read_dir_sorted(dir: &Path) -> Vec<PathBuf> {
    let mut entries: Vec<_> = match fs::read_dir(dir) {
        Ok(iter) => iter.filter_map(|ent| Some(ent.ok()?.path())).collect(),
        Err(_) => Vec::new(),
    };
    entries.sort();
    entries
}

/// Remove one path on a helper thread, giving up (but leaving the thread to
/// finish) if the kernel takes too long. Absence counts as success.
fn remove_with_timeout(path: &Path) -> Result<()> {
    log::debug!("removing {}", path.display());
    let (done_tx, done_rx) = mpsc::channel();
    let target = path.to_owned();
    thread::Builder::new()
        .name("tcmu-teardown".into())
        .spawn(move || {
            let _ = done_tx.send(remove_path(&target));
        })
        .map_err(Error::Io)?;
    match done_rx.recv_timeout(TEARDOWN_TIMEOUT) {
        Ok(res) => res.map_err(Error::Io),
        Err(_) => Err(Error::TeardownTimeout(path.to_owned())),
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match path.symlink_metadata() {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    let res = if meta.is_dir() {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    };
    match res {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
