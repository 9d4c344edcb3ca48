//! Device injection layer for OCI container hooks.
//!
//! This crate performs the kernel-facing work of exposing accelerator hardware to a
//! container that is being created: device discovery under `/dev` and `/sys`, cgroup
//! v1/v2 device authorization, device-node materialization inside the container's
//! mount namespace, and macvlan passthrough bridging of fabric network interfaces into
//! the container's network namespace. `InjectionPipeline` sequences these stages for a
//! single validated `HookRequest`.

pub mod cgroup;
pub mod discover;
pub mod materialize;
pub mod mock;
pub mod namespace;
pub mod netinfo;
pub mod network;
pub mod pipeline;
pub mod prereq;

pub use cgroup::{detect_version, CgroupBackend, CgroupTarget, CgroupVersion, DeviceRule};
pub use discover::{resolve_device_identity, unique_device_ids, AcceleratorDevice, DeviceDirectory};
pub use materialize::{DeviceMaterializer, NamespaceInstaller, NodeInstaller};
pub use namespace::{NamespaceGuard, NamespaceKind};
pub use network::{IpRoute, LinkControl, NetNamespace, NetworkBridge};
pub use pipeline::{DeviceSelector, HookKind, HookRequest, InjectionPipeline, PipelineReport};
pub use prereq::{check_prereqs, format_missing, MissingPrereq};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("no accelerator devices found, driver might not be loaded")]
    NoDevicesFound,
    #[error("not a device: {0}")]
    NotADevice(PathBuf),
    #[error("device {path} in invalid state: {major},{minor}")]
    InvalidDeviceState {
        path: PathBuf,
        major: u32,
        minor: u32,
    },
    #[error("requested device does not exist: {0}")]
    DeviceNotFound(PathBuf),
    #[error("discovering external interfaces: {0}")]
    InterfaceDiscoveryFailed(String),
    #[error("malformed cgroup entry: {0}")]
    MalformedCgroupEntry(String),
    #[error("no devices or unified cgroup entries found for pid {0}")]
    NoCgroupEntries(u32),
    #[error("no cgroup filesystem mounted for the devices controller (pid {0})")]
    CgroupMountNotFound(u32),
    #[error("writing cgroup rules to {path}: {source}")]
    CgroupWrite {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("reading {path}: {source}")]
    Sysfs {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("namespace entry failed: {0}")]
    Namespace(String),
    #[error("mounting {source_path} on {target}: {reason}")]
    MountFailed {
        source_path: PathBuf,
        target: PathBuf,
        reason: String,
    },
    #[error("refusing to follow symlink inside container rootfs: {0}")]
    SymlinkInRootfs(PathBuf),
    #[error("link operation failed: {0}")]
    LinkOperation(String),
    #[error("invalid hook request: {0}")]
    InvalidRequest(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl InjectError {
    /// Environment errors mean "nothing to do here" rather than a broken container:
    /// the orchestration layer may treat them as a no-op.
    pub fn is_environment(&self) -> bool {
        matches!(self, Self::NoDevicesFound | Self::NoCgroupEntries(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_errors_are_classified() {
        assert!(InjectError::NoDevicesFound.is_environment());
        assert!(InjectError::NoCgroupEntries(42).is_environment());
        assert!(!InjectError::MalformedCgroupEntry("x".to_owned()).is_environment());
        assert!(!InjectError::DeviceNotFound(PathBuf::from("/dev/accel/accel0")).is_environment());
    }

    #[test]
    fn errors_carry_context() {
        let err = InjectError::InvalidDeviceState {
            path: PathBuf::from("/dev/accel/accel3"),
            major: u32::MAX,
            minor: 0,
        };
        let msg = err.to_string();
        assert!(msg.contains("/dev/accel/accel3"));
        assert!(msg.contains("4294967295"));
    }
}
