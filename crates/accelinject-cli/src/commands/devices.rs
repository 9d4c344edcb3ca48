use super::{json_pretty, EXIT_SUCCESS};
use crate::config::HookConfig;
use accelinject_runtime::{resolve_device_identity, AcceleratorDevice, DeviceDirectory, InjectError};
use std::path::PathBuf;

pub fn run(config: &HookConfig, json: bool) -> Result<u8, String> {
    let directory = DeviceDirectory::with_roots(&config.dev_root, &config.sys_root);
    let paths = match directory.list_accelerator_devices() {
        Ok(paths) => paths,
        Err(InjectError::NoDevicesFound) => Vec::new(),
        Err(e) => return Err(e.to_string()),
    };
    let devices = paths
        .iter()
        .map(PathBuf::as_path)
        .map(resolve_device_identity)
        .collect::<Result<Vec<AcceleratorDevice>, _>>()
        .map_err(|e| e.to_string())?;

    if json {
        println!("{}", json_pretty(&devices)?);
    } else if devices.is_empty() {
        println!("no accelerator devices found");
    } else {
        println!("{:<4} {:<12} PATH", "ID", "MAJOR:MINOR");
        for dev in &devices {
            println!(
                "{:<4} {:<12} {}",
                dev.id,
                format!("{}:{}", dev.major, dev.minor),
                dev.path.display()
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
