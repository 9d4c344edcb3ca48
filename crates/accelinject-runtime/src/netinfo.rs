//! Fabric configuration files published into the container rootfs.
//!
//! The accelerator user-space stack reads per-port MAC addresses from
//! `/etc/habanalabs/macAddrInfo.json` and the scale-out routing table from
//! `/etc/habanalabs/gaudinet.json`. Both are written from the host side before
//! the container starts.

use crate::discover::DeviceDirectory;
use crate::InjectError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

pub const CONFIG_DIR: &str = "etc/habanalabs";
pub const MAC_INFO_FILE: &str = "macAddrInfo.json";
pub const ROUTES_FILE: &str = "gaudinet.json";
pub const DEFAULT_ROUTES_SOURCE: &str = "/etc/habanalabs/gaudinet.json";

/// Placeholder MAC for ports wired to other accelerators in the same node.
pub const INTERNAL_PORT_MAC: &str = "ff:ff:ff:ff:ff:ff";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacInfo {
    #[serde(rename = "PCI_ID")]
    pub pci_id: String,
    #[serde(rename = "MAC_ADDR_LIST")]
    pub mac_addr_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacAddrInfo {
    #[serde(rename = "MAC_ADDR_INFO")]
    pub devices: Vec<MacInfo>,
}

/// Total network ports (internal and external) per accelerator generation.
pub fn port_count(device_type: &str) -> usize {
    match device_type {
        "gaudi" => 10,
        "gaudi2" => 24,
        _ => 0,
    }
}

fn sysfs_err(path: &Path) -> impl FnOnce(io::Error) -> InjectError + '_ {
    move |source| InjectError::Sysfs {
        path: path.to_path_buf(),
        source,
    }
}

/// MAC address of every external port of the PCI function, keyed by `dev_port`.
pub fn external_ports(
    dir: &DeviceDirectory,
    pci_addr: &str,
) -> Result<BTreeMap<usize, String>, InjectError> {
    let net_dir = dir.pci_device_dir(pci_addr).join("net");
    let entries = match std::fs::read_dir(&net_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(sysfs_err(&net_dir)(e)),
    };

    let mut ports = BTreeMap::new();
    for entry in entries {
        let iface = entry.map_err(sysfs_err(&net_dir))?.path();
        let address_file = iface.join("address");
        let port_file = iface.join("dev_port");
        let mac = std::fs::read_to_string(&address_file).map_err(sysfs_err(&address_file))?;
        let port = std::fs::read_to_string(&port_file).map_err(sysfs_err(&port_file))?;
        let port: usize = port.trim().parse().map_err(|e| InjectError::Sysfs {
            path: port_file.clone(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;
        ports.insert(port, mac.trim().to_owned());
    }
    Ok(ports)
}

/// Per-port MAC table for the given accelerator ids, ordered by id. `None` when
/// there is nothing to describe.
pub fn mac_address_info(
    dir: &DeviceDirectory,
    ids: &[String],
) -> Result<Option<MacAddrInfo>, InjectError> {
    let Some(first) = ids.first() else {
        return Ok(None);
    };
    let ports = dir
        .device_type(first)?
        .map(|t| port_count(&t))
        .unwrap_or_default();

    let mut ordered: Vec<&String> = ids.iter().collect();
    ordered.sort_by_key(|id| (id.parse::<u64>().unwrap_or(u64::MAX), (*id).clone()));

    let mut devices = Vec::with_capacity(ordered.len());
    for id in ordered {
        let Some(pci_id) = dir.pci_address(id)? else {
            tracing::debug!(id = %id, "no pci address, omitting from mac table");
            continue;
        };
        let external = external_ports(dir, &pci_id)?;
        let mac_addr_list = (0..ports)
            .map(|port| {
                external
                    .get(&port)
                    .cloned()
                    .unwrap_or_else(|| INTERNAL_PORT_MAC.to_owned())
            })
            .collect();
        devices.push(MacInfo {
            pci_id,
            mac_addr_list,
        });
    }

    if devices.is_empty() {
        return Ok(None);
    }
    Ok(Some(MacAddrInfo { devices }))
}

fn config_dir(rootfs: &Path) -> Result<PathBuf, InjectError> {
    let dir = rootfs.join(CONFIG_DIR);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Write `macAddrInfo.json` into the container rootfs. Returns the written path,
/// or `None` when the driver exposed no MAC data.
pub fn write_mac_address_info(
    dir: &DeviceDirectory,
    ids: &[String],
    rootfs: &Path,
) -> Result<Option<PathBuf>, InjectError> {
    let Some(info) = mac_address_info(dir, ids)? else {
        return Ok(None);
    };
    let json = serde_json::to_string_pretty(&info)
        .map_err(|e| InjectError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;

    let path = config_dir(rootfs)?.join(MAC_INFO_FILE);
    std::fs::write(&path, json)?;
    tracing::info!(path = %path.display(), devices = info.devices.len(), "wrote mac address info");
    Ok(Some(path))
}

/// Copy the host routing table into the container. A missing or empty source is
/// not an error.
pub fn copy_routes_file(source: &Path, rootfs: &Path) -> Result<Option<PathBuf>, InjectError> {
    let meta = match std::fs::metadata(source) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::info!(path = %source.display(), "routes file does not exist on host");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if meta.len() == 0 {
        tracing::info!(path = %source.display(), "routes file is empty, skipping");
        return Ok(None);
    }

    let dest = config_dir(rootfs)?.join(ROUTES_FILE);
    std::fs::copy(source, &dest)?;
    tracing::info!(source = %source.display(), dest = %dest.display(), "copied routes file");
    Ok(Some(dest))
}
