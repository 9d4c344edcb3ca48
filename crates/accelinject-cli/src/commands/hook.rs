use super::{EXIT_SUCCESS, EXIT_USAGE};
use crate::config::HookConfig;
use accelinject_runtime::{
    check_prereqs, format_missing, DeviceDirectory, DeviceSelector, HookKind, HookRequest,
    InjectError, InjectionPipeline, IpRoute, NamespaceInstaller,
};
use std::path::PathBuf;

/// Hook inputs after flag parsing; unset options fall back to the config.
#[derive(Debug)]
pub struct HookArgs {
    pub pid: u32,
    pub rootfs: PathBuf,
    pub selector: DeviceSelector,
    pub hook: HookKind,
    pub mount_accelerators: Option<bool>,
    pub mount_uverbs: Option<bool>,
    pub routes_file: Option<PathBuf>,
}

impl HookArgs {
    fn into_request(self, config: &HookConfig) -> Result<HookRequest, String> {
        let rootfs = if self.rootfs.is_absolute() {
            self.rootfs
        } else {
            std::env::current_dir()
                .map_err(|e| format!("resolving rootfs: {e}"))?
                .join(self.rootfs)
        };
        Ok(HookRequest {
            pid: self.pid,
            rootfs,
            selector: self.selector,
            hook: self.hook,
            mount_accelerators: self.mount_accelerators.unwrap_or(config.mount_accelerators),
            mount_uverbs: self.mount_uverbs.unwrap_or(config.mount_uverbs),
            routes_file: Some(self.routes_file.unwrap_or_else(|| config.routes_file.clone())),
        })
    }
}

pub fn run(config: &HookConfig, args: HookArgs) -> Result<u8, String> {
    let missing = check_prereqs();
    if !missing.is_empty() {
        tracing::warn!("{}", format_missing(&missing));
    }

    let request = args.into_request(config)?;
    if let Err(e) = request.validate() {
        eprintln!("error: {e}");
        return Ok(EXIT_USAGE);
    }

    let directory = DeviceDirectory::with_roots(&config.dev_root, &config.sys_root);
    let installer = NamespaceInstaller::new(request.pid);
    let host = IpRoute::host();
    let container = IpRoute::in_namespace(request.pid);
    let pipeline = InjectionPipeline::new(&directory, &installer, &host, &container)
        .with_proc_root(&config.proc_root);

    match pipeline.run(&request) {
        Ok(report) => {
            tracing::debug!(report = ?report, "hook finished");
            Ok(EXIT_SUCCESS)
        }
        Err(e) if e.is_environment() => {
            tracing::warn!(error = %e, pid = request.pid, "nothing to inject");
            Ok(EXIT_SUCCESS)
        }
        Err(e @ InjectError::InvalidRequest(_)) => {
            eprintln!("error: {e}");
            Ok(EXIT_USAGE)
        }
        Err(e) => {
            tracing::error!(error = %e, pid = request.pid, "device injection failed");
            Err(e.to_string())
        }
    }
}
