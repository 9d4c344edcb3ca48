//! One container-creation event, end to end.

use crate::cgroup::{CgroupBackend, CgroupTarget};
use crate::discover::{associated_network_interfaces, unique_device_ids, AcceleratorDevice, DeviceDirectory};
use crate::materialize::{authorize_all, DeviceMaterializer, NodeInstaller};
use crate::netinfo;
use crate::network::{BridgeReport, LinkControl, NetNamespace, NetworkBridge};
use crate::InjectError;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// OCI lifecycle point the hook was invoked at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum HookKind {
    /// Legacy hook: the hook creates and authorizes device nodes itself.
    Prestart,
    /// Device nodes come from the runtime spec; only networking is handled here.
    #[default]
    CreateRuntime,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Prestart => "prestart",
            Self::CreateRuntime => "createRuntime",
        })
    }
}

impl FromStr for HookKind {
    type Err = InjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "prestart" => Ok(Self::Prestart),
            "createRuntime" | "create-runtime" => Ok(Self::CreateRuntime),
            other => Err(InjectError::InvalidRequest(format!(
                "unknown hook '{other}', expected prestart or createRuntime"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub enum DeviceSelector {
    #[default]
    All,
    /// Decimal accelerator ids, deduplicated, in the order requested.
    Ids(Vec<String>),
}

impl FromStr for DeviceSelector {
    type Err = InjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        let mut ids: Vec<String> = Vec::new();
        for raw in s.split(',').map(str::trim) {
            let id: u32 = raw.parse().map_err(|_| {
                InjectError::InvalidRequest(format!("invalid device id '{raw}' in '{s}'"))
            })?;
            let id = id.to_string();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok(Self::Ids(ids))
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Ids(ids) => f.write_str(&ids.join(",")),
        }
    }
}

impl DeviceSelector {
    /// Keep the discovered paths whose id is selected, in discovery order.
    pub fn select(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        match self {
            Self::All => paths.to_vec(),
            Self::Ids(ids) => paths
                .iter()
                .filter(|p| {
                    crate::discover::device_id(p).is_some_and(|id| ids.contains(&id))
                })
                .cloned()
                .collect(),
        }
    }
}

/// Validated input for one hook invocation.
#[derive(Debug, Clone, Serialize)]
pub struct HookRequest {
    pub pid: u32,
    pub rootfs: PathBuf,
    pub selector: DeviceSelector,
    pub hook: HookKind,
    pub mount_accelerators: bool,
    pub mount_uverbs: bool,
    pub routes_file: Option<PathBuf>,
}

impl HookRequest {
    pub fn new(pid: u32, rootfs: impl Into<PathBuf>) -> Self {
        Self {
            pid,
            rootfs: rootfs.into(),
            selector: DeviceSelector::All,
            hook: HookKind::default(),
            mount_accelerators: true,
            mount_uverbs: true,
            routes_file: Some(PathBuf::from(netinfo::DEFAULT_ROUTES_SOURCE)),
        }
    }

    pub fn validate(&self) -> Result<(), InjectError> {
        if self.pid == 0 {
            return Err(InjectError::InvalidRequest("pid must be positive".to_owned()));
        }
        if !self.rootfs.is_absolute() {
            return Err(InjectError::InvalidRequest(format!(
                "rootfs must be absolute: {}",
                self.rootfs.display()
            )));
        }
        if matches!(&self.selector, DeviceSelector::Ids(ids) if ids.is_empty()) {
            return Err(InjectError::InvalidRequest("empty device list".to_owned()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub device_ids: Vec<String>,
    pub devices: Vec<AcceleratorDevice>,
    pub cgroup: Option<CgroupTarget>,
    pub rules_written: usize,
    pub interfaces: Vec<String>,
    pub bridge: BridgeReport,
}

pub struct InjectionPipeline<'a> {
    directory: &'a DeviceDirectory,
    proc_root: PathBuf,
    installer: &'a dyn NodeInstaller,
    host_links: &'a dyn LinkControl,
    container_links: &'a dyn LinkControl,
}

impl<'a> InjectionPipeline<'a> {
    pub fn new(
        directory: &'a DeviceDirectory,
        installer: &'a dyn NodeInstaller,
        host_links: &'a dyn LinkControl,
        container_links: &'a dyn LinkControl,
    ) -> Self {
        Self {
            directory,
            proc_root: PathBuf::from("/"),
            installer,
            host_links,
            container_links,
        }
    }

    #[must_use]
    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }

    pub fn run(&self, request: &HookRequest) -> Result<PipelineReport, InjectError> {
        request.validate()?;
        tracing::info!(
            pid = request.pid,
            rootfs = %request.rootfs.display(),
            hook = %request.hook,
            devices = %request.selector,
            "running device injection"
        );

        let discovered = self.directory.list_accelerator_devices()?;
        let selected = request.selector.select(&discovered);
        let device_ids = unique_device_ids(&selected);
        if let DeviceSelector::Ids(requested) = &request.selector {
            if let Some(missing) = requested.iter().find(|id| !device_ids.contains(id)) {
                return Err(InjectError::DeviceNotFound(
                    self.directory.dev_root().join(format!("accel/accel{missing}")),
                ));
            }
        }

        let mut report = PipelineReport {
            device_ids,
            ..PipelineReport::default()
        };

        if request.hook == HookKind::Prestart {
            self.inject_devices(request, &selected, &mut report)?;
            self.publish_fabric_config(request, &report.device_ids);
        }

        let net_ids: &[String] = match request.selector {
            DeviceSelector::All => &[],
            DeviceSelector::Ids(_) => &report.device_ids,
        };
        let verbs = self.directory.verbs_sysfs_paths(net_ids)?;
        report.interfaces = associated_network_interfaces(&verbs)?;
        report.bridge = NetworkBridge::new(
            self.host_links,
            self.container_links,
            NetNamespace::of_pid(request.pid),
        )
        .expose_interfaces(&report.interfaces)?;

        tracing::info!(
            devices = report.devices.len(),
            rules = report.rules_written,
            interfaces = report.interfaces.len(),
            "device injection complete"
        );
        Ok(report)
    }

    fn inject_devices(
        &self,
        request: &HookRequest,
        selected: &[PathBuf],
        report: &mut PipelineReport,
    ) -> Result<(), InjectError> {
        let backend = CgroupBackend::detect(&self.proc_root, request.pid)?;
        let target = backend.resolve_target(&self.proc_root, request.pid)?;
        tracing::info!(
            version = %target.version,
            path = %target.container_path.display(),
            "resolved container cgroup"
        );

        let materializer = DeviceMaterializer::new(self.installer);
        if request.mount_accelerators {
            let devices = materializer.materialize_all(selected, &request.rootfs)?;
            report.devices.extend(devices);
        }
        if request.mount_uverbs {
            let verbs = self.directory.associated_verbs_devices(&report.device_ids)?;
            let devices = materializer.materialize_all(&verbs, &request.rootfs)?;
            report.devices.extend(devices);
        }

        if !report.devices.is_empty() {
            report.rules_written = authorize_all(backend, &report.devices, &target.container_path)?;
        }
        report.cgroup = Some(target);
        Ok(())
    }

    /// Auxiliary files consumed by the accelerator user-space stack. Failures
    /// are logged only.
    fn publish_fabric_config(&self, request: &HookRequest, ids: &[String]) {
        for id in ids {
            match self.directory.module_id(id) {
                Ok(Some(module)) => tracing::info!(id = %id, module_id = %module, "accelerator module"),
                Ok(None) => {}
                Err(e) => tracing::warn!(id = %id, error = %e, "reading module id"),
            }
        }

        if let Err(e) = netinfo::write_mac_address_info(self.directory, ids, &request.rootfs) {
            tracing::warn!(error = %e, "failed writing mac address info");
        }
        if let Some(source) = &request.routes_file {
            copy_routes_best_effort(source, &request.rootfs);
        }
    }
}

fn copy_routes_best_effort(source: &Path, rootfs: &Path) {
    if let Err(e) = netinfo::copy_routes_file(source, rootfs) {
        tracing::warn!(source = %source.display(), error = %e, "failed copying routes file");
    }
}
