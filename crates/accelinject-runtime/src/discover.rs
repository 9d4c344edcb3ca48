//! Host device discovery.
//!
//! Read-only inspection of the device tree and sysfs: which accelerator character
//! devices exist, which InfiniBand verbs devices hang off the same PCI function, and
//! which network interfaces belong to those verbs devices.

use crate::InjectError;
use serde::Serialize;
use std::collections::HashSet;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

/// Device name prefixes, relative to the device root: primary nodes and their
/// paired control nodes.
pub const DEFAULT_DEVICE_PREFIXES: &[&str] = &["accel/accel", "accel/accel_controlD"];

/// Name prefix of the verbs devices registered by the accelerator's NIC driver
/// under `<sys>/class/infiniband`.
pub const DEFAULT_VERBS_CLASS_PREFIX: &str = "hlib_";

/// Kernel encoding of a device number that cannot be turned back into a node.
const INVALID_DEVICE_NUMBER: u32 = 0xFFFF_FFFF;

/// One accelerator (or verbs) special file as seen on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcceleratorDevice {
    pub path: PathBuf,
    pub id: String,
    pub major: u32,
    pub minor: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Roots and naming conventions used to locate devices.
///
/// Production uses `/dev` and `/sys`; tests point both at a temporary tree.
#[derive(Debug, Clone)]
pub struct DeviceDirectory {
    dev_root: PathBuf,
    sys_root: PathBuf,
    prefixes: Vec<String>,
    verbs_class_prefix: String,
}

impl Default for DeviceDirectory {
    fn default() -> Self {
        Self::with_roots("/dev", "/sys")
    }
}

impl DeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_roots(dev_root: impl Into<PathBuf>, sys_root: impl Into<PathBuf>) -> Self {
        Self {
            dev_root: dev_root.into(),
            sys_root: sys_root.into(),
            prefixes: DEFAULT_DEVICE_PREFIXES
                .iter()
                .map(|p| (*p).to_owned())
                .collect(),
            verbs_class_prefix: DEFAULT_VERBS_CLASS_PREFIX.to_owned(),
        }
    }

    #[inline]
    pub fn dev_root(&self) -> &Path {
        &self.dev_root
    }

    /// `<sys>/class/accel/accel<id>`, the sysfs class entry of one accelerator.
    #[inline]
    pub fn accel_class_dir(&self, id: &str) -> PathBuf {
        self.sys_root.join("class/accel").join(format!("accel{id}"))
    }

    #[inline]
    pub fn pci_device_dir(&self, pci_addr: &str) -> PathBuf {
        self.sys_root.join("bus/pci/devices").join(pci_addr)
    }

    /// Every device node matching `<dev>/<prefix><digits>`, grouped by prefix in
    /// declaration order and sorted by name within a prefix.
    pub fn list_accelerator_devices(&self) -> Result<Vec<PathBuf>, InjectError> {
        let mut devices = Vec::new();
        for prefix in &self.prefixes {
            let pattern = self.dev_root.join(prefix);
            let (dir, stem) = match (pattern.parent(), pattern.file_name()) {
                (Some(dir), Some(stem)) => (dir.to_path_buf(), stem.to_string_lossy().into_owned()),
                _ => continue,
            };
            devices.extend(glob_numbered(&dir, &stem)?);
        }

        if devices.is_empty() {
            return Err(InjectError::NoDevicesFound);
        }
        Ok(devices)
    }

    /// Verbs character devices (`<dev>/infiniband/uverbsN`) attached to the PCI
    /// function of each accelerator id. Ids without a verbs device are skipped.
    pub fn associated_verbs_devices(&self, ids: &[String]) -> Result<Vec<PathBuf>, InjectError> {
        let mut verbs = Vec::new();
        for id in ids {
            let Some(pci_addr) = self.pci_address(id)? else {
                tracing::debug!(id = %id, "accelerator has no pci address, skipping verbs lookup");
                continue;
            };

            let verbs_dir = self.pci_device_dir(&pci_addr).join("infiniband_verbs");
            let mut entries = match sorted_dir_names(&verbs_dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(InjectError::Sysfs {
                        path: verbs_dir,
                        source,
                    })
                }
            };
            if entries.is_empty() {
                continue;
            }
            let name = entries.swap_remove(0);
            verbs.push(self.dev_root.join("infiniband").join(name));
        }
        Ok(verbs)
    }

    /// Sysfs entries of the verbs devices (`<sys>/class/infiniband/hlib_N`) whose
    /// trailing id is one of `ids`. An empty id list selects all of them.
    pub fn verbs_sysfs_paths(&self, ids: &[String]) -> Result<Vec<PathBuf>, InjectError> {
        let class_dir = self.sys_root.join("class/infiniband");
        let names = match sorted_dir_names(&class_dir) {
            Ok(names) => names,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(InjectError::Sysfs {
                    path: class_dir,
                    source,
                })
            }
        };

        Ok(names
            .into_iter()
            .filter(|name| name.starts_with(&self.verbs_class_prefix))
            .filter(|name| ids.is_empty() || trailing_id(name).is_some_and(|id| ids.iter().any(|i| *i == id)))
            .map(|name| class_dir.join(name))
            .collect())
    }

    /// PCI address of accelerator `id`, or `None` when sysfs has no such entry.
    pub fn pci_address(&self, id: &str) -> Result<Option<String>, InjectError> {
        read_trimmed_optional(&self.accel_class_dir(id).join("device/pci_addr"))
    }

    /// OAM module id of accelerator `id`, if the driver exposes one.
    pub fn module_id(&self, id: &str) -> Result<Option<String>, InjectError> {
        read_trimmed_optional(&self.accel_class_dir(id).join("device/module_id"))
    }

    /// First word of the driver-reported device type, lowercased (`gaudi2`, ...).
    pub fn device_type(&self, id: &str) -> Result<Option<String>, InjectError> {
        let raw = read_trimmed_optional(&self.accel_class_dir(id).join("device/device_type"))?;
        Ok(raw.and_then(|s| s.split_whitespace().next().map(str::to_lowercase)))
    }
}

/// Network interface names registered under each verbs device's `device/net` dir.
pub fn associated_network_interfaces(verbs_sysfs_paths: &[PathBuf]) -> Result<Vec<String>, InjectError> {
    let mut interfaces = Vec::new();
    for verbs in verbs_sysfs_paths {
        if !verbs.is_absolute() {
            return Err(InjectError::InterfaceDiscoveryFailed(format!(
                "path provided is not absolute: {}",
                verbs.display()
            )));
        }
        let net_dir = verbs.join("device/net");
        let names = sorted_dir_names(&net_dir).map_err(|e| {
            InjectError::InterfaceDiscoveryFailed(format!("{}: {e}", net_dir.display()))
        })?;
        interfaces.extend(names);
    }
    Ok(interfaces)
}

/// Stat `path` (following symlinks) and describe it as a device node.
pub fn resolve_device_identity(path: &Path) -> Result<AcceleratorDevice, InjectError> {
    let meta = std::fs::metadata(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            InjectError::DeviceNotFound(path.to_path_buf())
        } else {
            InjectError::Sysfs {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    let file_type = meta.file_type();
    if !(file_type.is_char_device() || file_type.is_block_device() || file_type.is_fifo()) {
        return Err(InjectError::NotADevice(path.to_path_buf()));
    }

    let rdev = meta.rdev();
    let (major, minor) = (dev_major(rdev), dev_minor(rdev));
    if major == INVALID_DEVICE_NUMBER || minor == INVALID_DEVICE_NUMBER {
        return Err(InjectError::InvalidDeviceState {
            path: path.to_path_buf(),
            major,
            minor,
        });
    }

    Ok(AcceleratorDevice {
        path: path.to_path_buf(),
        id: device_id(path).unwrap_or_default(),
        major,
        minor,
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
    })
}

/// Distinct numeric ids in first-seen order. A device and its control node
/// (`accel0`, `accel_controlD0`) collapse into one id.
pub fn unique_device_ids<P: AsRef<Path>>(paths: &[P]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for path in paths {
        let Some(id) = device_id(path.as_ref()) else {
            tracing::debug!(path = %path.as_ref().display(), "device path has no numeric id");
            continue;
        };
        if seen.insert(id.clone()) {
            ids.push(id);
        }
    }
    ids
}

/// Trailing decimal digits of the path's file name.
pub fn device_id(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| trailing_id(&n.to_string_lossy()))
}

fn trailing_id(name: &str) -> Option<String> {
    let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    (digits > 0).then(|| name[name.len() - digits..].to_owned())
}

/// Linux `dev_t` major number (glibc encoding).
pub fn dev_major(rdev: u64) -> u32 {
    (((rdev >> 32) & 0xffff_f000) | ((rdev >> 8) & 0x0000_0fff)) as u32
}

/// Linux `dev_t` minor number (glibc encoding).
pub fn dev_minor(rdev: u64) -> u32 {
    (((rdev >> 12) & 0xffff_ff00) | (rdev & 0x0000_00ff)) as u32
}

/// Entries of `dir` named `<stem><digits>`. A missing directory matches nothing.
fn glob_numbered(dir: &Path, stem: &str) -> Result<Vec<PathBuf>, InjectError> {
    let names = match sorted_dir_names(dir) {
        Ok(names) => names,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(InjectError::Sysfs {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    Ok(names
        .into_iter()
        .filter(|name| {
            name.strip_prefix(stem)
                .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        })
        .map(|name| dir.join(name))
        .collect())
}

fn sorted_dir_names(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<io::Result<Vec<_>>>()?;
    names.sort();
    Ok(names)
}

fn read_trimmed_optional(path: &Path) -> Result<Option<String>, InjectError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content.trim().to_owned())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(InjectError::Sysfs {
            path: path.to_path_buf(),
            source,
        }),
    }
}
