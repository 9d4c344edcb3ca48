//! Device node materialization inside the container.
//!
//! A device is materialized by creating an empty placeholder at the matching
//! path under the container rootfs and bind-mounting the host node onto it, all
//! from within the container's mount namespace. Authorization is written to the
//! container cgroup afterwards, once per batch.

use crate::cgroup::{CgroupBackend, DeviceRule};
use crate::discover::{resolve_device_identity, AcceleratorDevice};
use crate::namespace::{run_in_namespace, NamespaceKind};
use crate::InjectError;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// The namespace-scoped filesystem mutations needed to materialize one node.
///
/// Each call is independent; callers check each result before the next step.
pub trait NodeInstaller {
    fn ensure_parent_dir(&self, dir: &Path) -> Result<(), InjectError>;

    fn create_placeholder(&self, path: &Path) -> Result<(), InjectError>;

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<(), InjectError>;

    fn remove_placeholder(&self, path: &Path) -> Result<(), InjectError>;
}

/// Performs each step inside the mount namespace of the container process.
#[derive(Debug, Clone, Copy)]
pub struct NamespaceInstaller {
    pid: u32,
}

impl NamespaceInstaller {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

impl NodeInstaller for NamespaceInstaller {
    fn ensure_parent_dir(&self, dir: &Path) -> Result<(), InjectError> {
        run_in_namespace(self.pid, NamespaceKind::Mount, || {
            std::fs::create_dir_all(dir).map_err(InjectError::from)
        })
    }

    fn create_placeholder(&self, path: &Path) -> Result<(), InjectError> {
        run_in_namespace(self.pid, NamespaceKind::Mount, || {
            open_placeholder(path)?;
            Ok(())
        })
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<(), InjectError> {
        run_in_namespace(self.pid, NamespaceKind::Mount, || {
            mount_bind(source, target).map_err(|e| InjectError::MountFailed {
                source_path: source.to_path_buf(),
                target: target.to_path_buf(),
                reason: e.to_string(),
            })
        })
    }

    fn remove_placeholder(&self, path: &Path) -> Result<(), InjectError> {
        run_in_namespace(self.pid, NamespaceKind::Mount, || {
            std::fs::remove_file(path).map_err(InjectError::from)
        })
    }
}

/// Create `path` as a new empty file, never following a symlink at that name.
pub fn open_placeholder(path: &Path) -> io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
}

#[allow(unsafe_code)]
fn mount_bind(source: &Path, target: &Path) -> io::Result<()> {
    let to_c = |p: &Path| {
        CString::new(p.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    };
    let src = to_c(source)?;
    let dst = to_c(target)?;
    // SAFETY: both strings are valid NUL-terminated paths that outlive the call;
    // a bind mount ignores the fstype and data arguments.
    let rc = unsafe {
        libc::mount(
            src.as_ptr(),
            dst.as_ptr(),
            std::ptr::null(),
            libc::MS_BIND,
            std::ptr::null(),
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Resolve `.` and `..` components of an absolute path without touching the
/// filesystem, so the host path cannot climb out of the container rootfs.
/// Symlinks inside the rootfs are checked separately by [`reject_symlinks`].
pub fn clean_path(path: &Path) -> PathBuf {
    let mut parts: Vec<&str> = Vec::new();
    let raw = path.to_string_lossy();
    for component in raw.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    PathBuf::from(format!("/{}", parts.join("/")))
}

/// Container-side location of a host device: rootfs joined with the cleaned host path.
pub fn container_path(rootfs: &Path, host_path: &Path) -> PathBuf {
    let cleaned = clean_path(host_path);
    rootfs.join(cleaned.strip_prefix("/").unwrap_or(&cleaned))
}

/// Fail if any existing component of `target` below `rootfs` is a symlink.
///
/// The rootfs belongs to the container image, so a link there could point the
/// placeholder and the bind mount at a host path.
pub fn reject_symlinks(rootfs: &Path, target: &Path) -> Result<(), InjectError> {
    let Ok(relative) = target.strip_prefix(rootfs) else {
        return Err(InjectError::SymlinkInRootfs(target.to_path_buf()));
    };
    let mut current = rootfs.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(InjectError::SymlinkInRootfs(current));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

pub struct DeviceMaterializer<'a> {
    installer: &'a dyn NodeInstaller,
}

impl<'a> DeviceMaterializer<'a> {
    pub fn new(installer: &'a dyn NodeInstaller) -> Self {
        Self { installer }
    }

    /// Make `host_path` available at the same path inside the container.
    ///
    /// Skips creation when the container path already exists, so re-running the
    /// hook does not stack mounts.
    pub fn materialize(
        &self,
        host_path: &Path,
        rootfs: &Path,
    ) -> Result<AcceleratorDevice, InjectError> {
        if !host_path.exists() {
            return Err(InjectError::DeviceNotFound(host_path.to_path_buf()));
        }

        let host_path = clean_path(host_path);
        let target = container_path(rootfs, &host_path);
        tracing::info!(
            host_path = %host_path.display(),
            container_path = %target.display(),
            "materializing device"
        );

        let device = resolve_device_identity(&host_path)?;

        reject_symlinks(rootfs, &target)?;
        if target.exists() {
            tracing::debug!(path = %target.display(), "device already present in container");
            return Ok(device);
        }

        if let Some(parent) = target.parent() {
            if !parent.exists() {
                self.installer.ensure_parent_dir(parent)?;
            }
        }
        self.installer.create_placeholder(&target)?;

        if let Err(e) = self.installer.bind_mount(&host_path, &target) {
            if let Err(cleanup) = self.installer.remove_placeholder(&target) {
                tracing::warn!(
                    path = %target.display(),
                    error = %cleanup,
                    "failed to remove placeholder after mount failure"
                );
            }
            return Err(e);
        }

        tracing::info!(path = %target.display(), "created container device");
        Ok(device)
    }

    /// Materialize every path in order, stopping at the first failure.
    pub fn materialize_all(
        &self,
        host_paths: &[PathBuf],
        rootfs: &Path,
    ) -> Result<Vec<AcceleratorDevice>, InjectError> {
        host_paths
            .iter()
            .map(|path| self.materialize(path, rootfs))
            .collect()
    }
}

/// Authorize every device in the container cgroup with a single batch of rules.
pub fn authorize_all(
    backend: CgroupBackend,
    devices: &[AcceleratorDevice],
    cgroup_path: &Path,
) -> Result<usize, InjectError> {
    let rules: Vec<DeviceRule> = devices.iter().map(DeviceRule::from).collect();
    let written = backend.add_device_rules(cgroup_path, &rules)?;
    tracing::info!(
        cgroup_path = %cgroup_path.display(),
        requested = rules.len(),
        written,
        "created device rules in cgroup"
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockNodeInstaller;
    use std::fs;

    #[test]
    fn clean_path_resolves_dotdot() {
        assert_eq!(clean_path(Path::new("/dev/../dev/accel/./accel0")), PathBuf::from("/dev/accel/accel0"));
        assert_eq!(clean_path(Path::new("/../../etc")), PathBuf::from("/etc"));
        assert_eq!(clean_path(Path::new("/")), PathBuf::from("/"));
    }

    #[test]
    fn container_path_stays_under_rootfs() {
        let rootfs = Path::new("/run/ctr/rootfs");
        assert_eq!(
            container_path(rootfs, Path::new("/dev/accel/accel0")),
            PathBuf::from("/run/ctr/rootfs/dev/accel/accel0")
        );
        assert_eq!(
            container_path(rootfs, Path::new("/dev/../../etc/shadow")),
            PathBuf::from("/run/ctr/rootfs/etc/shadow")
        );
    }

    #[test]
    fn missing_host_device_is_not_found_without_mutation() {
        let rootfs = tempfile::tempdir().unwrap();
        let installer = MockNodeInstaller::new();
        let materializer = DeviceMaterializer::new(&installer);

        let err = materializer
            .materialize(Path::new("/dev/accel/accel-does-not-exist9"), rootfs.path())
            .unwrap_err();
        assert!(matches!(err, InjectError::DeviceNotFound(_)));
        assert!(installer.operations().is_empty());
        assert_eq!(fs::read_dir(rootfs.path()).unwrap().count(), 0);
    }

    #[test]
    fn materialize_creates_parent_placeholder_and_mount() {
        let host = tempfile::tempdir().unwrap();
        let rootfs = tempfile::tempdir().unwrap();
        let dev = host.path().join("accel/accel0");
        fs::create_dir_all(dev.parent().unwrap()).unwrap();
        std::os::unix::fs::symlink("/dev/null", &dev).unwrap();

        let installer = MockNodeInstaller::new();
        let device = DeviceMaterializer::new(&installer)
            .materialize(&dev, rootfs.path())
            .unwrap();
        assert_eq!(device.id, "0");

        let target = container_path(rootfs.path(), &dev);
        assert!(target.exists());
        assert_eq!(installer.mounts(), vec![(dev.clone(), target)]);
        assert_eq!(installer.operations().len(), 3);
    }

    #[test]
    fn existing_container_node_is_skipped() {
        let host = tempfile::tempdir().unwrap();
        let rootfs = tempfile::tempdir().unwrap();
        let dev = host.path().join("accel1");
        std::os::unix::fs::symlink("/dev/zero", &dev).unwrap();
        let target = container_path(rootfs.path(), &dev);
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, "").unwrap();

        let installer = MockNodeInstaller::new();
        DeviceMaterializer::new(&installer)
            .materialize(&dev, rootfs.path())
            .unwrap();
        assert!(installer.operations().is_empty());
    }

    #[test]
    fn failed_mount_removes_placeholder() {
        let host = tempfile::tempdir().unwrap();
        let rootfs = tempfile::tempdir().unwrap();
        let dev = host.path().join("accel2");
        std::os::unix::fs::symlink("/dev/null", &dev).unwrap();

        let installer = MockNodeInstaller::failing_mounts();
        let err = DeviceMaterializer::new(&installer)
            .materialize(&dev, rootfs.path())
            .unwrap_err();
        assert!(matches!(err, InjectError::MountFailed { .. }));
        assert!(!container_path(rootfs.path(), &dev).exists());
    }

    #[test]
    fn failed_parent_dir_aborts_before_mount() {
        let host = tempfile::tempdir().unwrap();
        let rootfs = tempfile::tempdir().unwrap();
        let dev = host.path().join("accel3");
        std::os::unix::fs::symlink("/dev/null", &dev).unwrap();

        let installer = MockNodeInstaller::failing_mkdir();
        let err = DeviceMaterializer::new(&installer)
            .materialize(&dev, rootfs.path())
            .unwrap_err();
        assert!(matches!(err, InjectError::Io(_)));
        let ops = installer.operations();
        assert_eq!(ops.len(), 1);
        assert!(ops[0].starts_with("mkdir "));
        assert!(installer.mounts().is_empty());
    }

    #[test]
    fn failed_placeholder_aborts_before_mount() {
        let host = tempfile::tempdir().unwrap();
        let rootfs = tempfile::tempdir().unwrap();
        let dev = host.path().join("accel3");
        std::os::unix::fs::symlink("/dev/null", &dev).unwrap();

        let installer = MockNodeInstaller::failing_placeholder();
        assert!(DeviceMaterializer::new(&installer)
            .materialize(&dev, rootfs.path())
            .is_err());
        let ops = installer.operations();
        assert!(ops.iter().any(|op| op.starts_with("create ")));
        assert!(!ops.iter().any(|op| op.starts_with("mount ")));
        assert!(!container_path(rootfs.path(), &dev).exists());
    }

    #[test]
    fn dangling_symlink_in_rootfs_is_refused() {
        let host = tempfile::tempdir().unwrap();
        let rootfs = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let dev = host.path().join("accel0");
        std::os::unix::fs::symlink("/dev/null", &dev).unwrap();

        let target = container_path(rootfs.path(), &dev);
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        let escape = outside.path().join("planted");
        std::os::unix::fs::symlink(&escape, &target).unwrap();

        let installer = MockNodeInstaller::new();
        let err = DeviceMaterializer::new(&installer)
            .materialize(&dev, rootfs.path())
            .unwrap_err();
        assert!(matches!(err, InjectError::SymlinkInRootfs(p) if p == target));
        assert!(!escape.exists());
        assert!(installer.mounts().is_empty());
        assert!(installer.operations().is_empty());
    }

    #[test]
    fn symlinked_parent_in_rootfs_is_refused() {
        let host = tempfile::tempdir().unwrap();
        let rootfs = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let dev = host.path().join("accel0");
        std::os::unix::fs::symlink("/dev/null", &dev).unwrap();

        let first = dev.components().nth(1).unwrap();
        let link = rootfs.path().join(first);
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();

        let installer = MockNodeInstaller::new();
        let err = DeviceMaterializer::new(&installer)
            .materialize(&dev, rootfs.path())
            .unwrap_err();
        assert!(matches!(err, InjectError::SymlinkInRootfs(p) if p == link));
        assert_eq!(fs::read_dir(outside.path()).unwrap().count(), 0);
    }

    #[test]
    fn placeholder_never_follows_a_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let escape = dir.path().join("escape");
        let link = dir.path().join("accel0");
        std::os::unix::fs::symlink(&escape, &link).unwrap();

        assert!(open_placeholder(&link).is_err());
        assert!(!escape.exists());
    }

    #[test]
    fn batch_stops_at_first_failure() {
        let host = tempfile::tempdir().unwrap();
        let rootfs = tempfile::tempdir().unwrap();
        let good = host.path().join("accel0");
        std::os::unix::fs::symlink("/dev/null", &good).unwrap();
        let missing = host.path().join("accel1");
        let after = host.path().join("accel2");
        std::os::unix::fs::symlink("/dev/zero", &after).unwrap();

        let installer = MockNodeInstaller::new();
        let err = DeviceMaterializer::new(&installer)
            .materialize_all(&[good, missing.clone(), after.clone()], rootfs.path())
            .unwrap_err();
        assert!(matches!(err, InjectError::DeviceNotFound(p) if p == missing));
        assert!(!container_path(rootfs.path(), &after).exists());
    }

    #[test]
    fn authorize_writes_one_rule_per_device() {
        let cgroup = tempfile::tempdir().unwrap();
        fs::write(cgroup.path().join("devices.allow"), "").unwrap();
        let devices = [
            resolve_device_identity(Path::new("/dev/null")).unwrap(),
            resolve_device_identity(Path::new("/dev/zero")).unwrap(),
        ];
        let written = authorize_all(CgroupBackend::V2, &devices, cgroup.path()).unwrap();
        assert_eq!(written, 2);
        let content = fs::read_to_string(cgroup.path().join("devices.allow")).unwrap();
        assert_eq!(content, "c 1:3 rwm\nc 1:5 rwm\n");
    }
}
