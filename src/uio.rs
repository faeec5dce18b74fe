//! Discovery of the UIO character device the kernel created for a LUN, and
//! the mapping of its shared region.

use std::path::Path;
use std::sync::Arc;
use std::{fs, io};

use rustix::fd::{AsFd, OwnedFd};
use rustix::fs::{Mode, OFlags};

use crate::error::{Error, Result};
use crate::ring::Region;

pub(crate) struct UioAttachment {
    pub name: String,
    pub fd: Arc<OwnedFd>,
    pub region: Arc<Region>,
}

/// Scan the device filesystem for the `uio*` node whose registry entry
/// matches `dev_config`, open it and map its shared region.
///
/// The registry line under `class/uio/<name>/name` has four `/`-separated
/// fields: transport family, HBA index, volume name, and the dev_config
/// string (which itself contains slashes, hence the bounded split).
pub(crate) fn attach(sysfs: &Path, devfs: &Path, dev_config: &str) -> Result<UioAttachment> {
    let mut names: Vec<_> = fs::read_dir(devfs)
        .map_err(Error::Io)?
        .filter_map(|ent| ent.ok()?.file_name().into_string().ok())
        .filter(|name| name.starts_with("uio"))
        .collect();
    names.sort();

    for name in names {
        let registry = sysfs.join("class/uio").join(&name).join("name");
        let text = fs::read_to_string(&registry).map_err(Error::Io)?;
        let fields: Vec<_> = text.trim_end_matches('\n').splitn(4, '/').collect();
        if fields.len() != 4 || fields[0] != "tcm-user" {
            log::debug!("{name} is not a tcm-user device");
            continue;
        }
        if fields[3] != dev_config {
            log::debug!("{name} belongs to another backend ({})", fields[3]);
            continue;
        }
        log::debug!(
            "attaching to {name} (hba {}, volume {})",
            fields[1],
            fields[2],
        );
        return open_and_map(sysfs, devfs, &name);
    }
    Err(Error::UioNotFound {
        dev_config: dev_config.to_owned(),
    })
}

fn open_and_map(sysfs: &Path, devfs: &Path, name: &str) -> Result<UioAttachment> {
    let fd = rustix::fs::open(
        devfs.join(name),
        OFlags::RDWR | OFlags::NONBLOCK | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(|errno| Error::Io(errno.into()))?;

    let size_file = sysfs.join("class/uio").join(name).join("maps/map0/size");
    let text = fs::read_to_string(size_file).map_err(Error::Map)?;
    let len = parse_map_size(text.trim()).ok_or_else(|| {
        Error::Map(io::Error::other(format!("invalid map size {text:?}")))
    })?;

    let region = Region::map(fd.as_fd(), len).map_err(Error::Map)?;
    Ok(UioAttachment {
        name: name.to_owned(),
        fd: Arc::new(fd),
        region: Arc::new(region),
    })
}

/// Sysfs prints map sizes as `0x…`; accept plain decimal too.
fn parse_map_size(s: &str) -> Option<usize> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn add_uio(root: &Path, name: &str, registry: &str, size: usize) {
        let class = root.join("sys/class/uio").join(name);
        fs::create_dir_all(class.join("maps/map0")).unwrap();
        fs::write(class.join("name"), format!("{registry}\n")).unwrap();
        fs::write(class.join("maps/map0/size"), format!("{size:#x}\n")).unwrap();
        fs::write(root.join("dev").join(name), vec![0u8; size]).unwrap();
    }

    #[test]
    fn attaches_to_matching_device() {
        let root = TempDir::new().unwrap();
        let (sysfs, devfs) = (root.path().join("sys"), root.path().join("dev"));
        fs::create_dir_all(&devfs).unwrap();
        fs::write(devfs.join("null"), "").unwrap();
        add_uio(root.path(), "uio0", "tcm-user/1/other/go-tcmu//other", 4096);
        add_uio(root.path(), "uio7", "tcm-user/42/vol0/go-tcmu//vol0", 8192);

        let got = attach(&sysfs, &devfs, "go-tcmu//vol0").unwrap();
        assert_eq!(got.name, "uio7");
        assert_eq!(got.region.len(), 8192);
    }

    #[test]
    fn reports_missing_device() {
        let root = TempDir::new().unwrap();
        let (sysfs, devfs) = (root.path().join("sys"), root.path().join("dev"));
        fs::create_dir_all(&devfs).unwrap();
        add_uio(root.path(), "uio0", "tcm-user/1/other/go-tcmu//other", 4096);

        match attach(&sysfs, &devfs, "go-tcmu//vol0") {
            Err(Error::UioNotFound { dev_config }) => {
                assert_eq!(dev_config, "go-tcmu//vol0");
            }
            Err(other) => panic!("expected UioNotFound, got {other:?}"),
            Ok(_) => panic!("expected UioNotFound, got a match"),
        }
    }

    #[test]
    fn parses_map_sizes() {
        assert_eq!(parse_map_size("0x2000"), Some(0x2000));
        assert_eq!(parse_map_size("8192"), Some(8192));
        assert_eq!(parse_map_size("zizes"), None);
    }
}
