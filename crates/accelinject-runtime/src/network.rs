//! Fabric network interface bridging into the container network namespace.
//!
//! Each host interface attached to an assigned accelerator is exposed as a
//! macvlan link in passthrough mode (which keeps the parent's MAC address),
//! created directly inside the container namespace under a temporary name, then
//! renamed to the host name and given the host's address and gateway route.

use crate::namespace::{namespace_path, NamespaceGuard, NamespaceKind};
use crate::InjectError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Kernel interface-name buffer size, including the trailing NUL.
pub const IFNAMSIZ: usize = 16;
const TEMP_LINK_PREFIX: &str = "ai";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkInfo {
    pub name: String,
    pub index: u32,
    pub mtu: u32,
    pub up: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IpConfig {
    pub address: IpAddr,
    pub prefix_len: u8,
}

impl fmt::Display for IpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// A route as read from the host: `destination` is `default` or a CIDR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    pub destination: String,
    pub gateway: Option<IpAddr>,
    pub device: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameOutcome {
    Renamed,
    /// A link with the requested name already exists in that namespace.
    NameTaken,
}

/// Handle on a container's network namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetNamespace {
    pub pid: u32,
    pub path: PathBuf,
}

impl NetNamespace {
    pub fn of_pid(pid: u32) -> Self {
        Self {
            pid,
            path: namespace_path(pid, NamespaceKind::Network),
        }
    }
}

/// Link, address and route operations within one network namespace.
pub trait LinkControl {
    fn link(&self, name: &str) -> Result<LinkInfo, InjectError>;

    fn addresses(&self, name: &str) -> Result<Vec<IpConfig>, InjectError>;

    fn routes(&self, name: &str) -> Result<Vec<RouteInfo>, InjectError>;

    /// Create a passthrough macvlan on `parent`, placed directly in `target`.
    fn create_macvlan_passthru(
        &self,
        parent: &LinkInfo,
        name: &str,
        target: &NetNamespace,
    ) -> Result<(), InjectError>;

    fn delete_link(&self, name: &str) -> Result<(), InjectError>;

    fn rename_link(&self, current: &str, new_name: &str) -> Result<RenameOutcome, InjectError>;

    fn add_address(&self, name: &str, addr: &IpConfig) -> Result<(), InjectError>;

    fn set_link_up(&self, name: &str) -> Result<(), InjectError>;

    fn append_route(&self, route: &RouteInfo, device: &str) -> Result<(), InjectError>;
}

/// iproute2-backed [`LinkControl`]. A namespaced instance enters the target
/// network namespace around every single `ip` invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpRoute {
    namespace: Option<u32>,
}

impl IpRoute {
    pub fn host() -> Self {
        Self { namespace: None }
    }

    pub fn in_namespace(pid: u32) -> Self {
        Self {
            namespace: Some(pid),
        }
    }

    fn run(&self, args: &[&str]) -> Result<Output, InjectError> {
        let _guard = match self.namespace {
            Some(pid) => Some(NamespaceGuard::enter(pid, NamespaceKind::Network)?),
            None => None,
        };
        tracing::debug!(command = %args.join(" "), netns_pid = ?self.namespace, "running ip");
        Command::new("ip").args(args).output().map_err(|e| {
            InjectError::LinkOperation(format!("failed to run ip {}: {e}", args.join(" ")))
        })
    }

    fn checked(&self, args: &[&str]) -> Result<Output, InjectError> {
        let output = self.run(args)?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(command_error(args, &output))
        }
    }

    fn json(&self, args: &[&str]) -> Result<String, InjectError> {
        let mut full = vec!["-json"];
        full.extend_from_slice(args);
        let output = self.checked(&full)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn command_error(args: &[&str], output: &Output) -> InjectError {
    InjectError::LinkOperation(format!(
        "ip {}: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr).trim()
    ))
}

impl LinkControl for IpRoute {
    fn link(&self, name: &str) -> Result<LinkInfo, InjectError> {
        parse_links(&self.json(&["link", "show", "dev", name])?)?
            .into_iter()
            .next()
            .ok_or_else(|| InjectError::LinkOperation(format!("link not found: {name}")))
    }

    fn addresses(&self, name: &str) -> Result<Vec<IpConfig>, InjectError> {
        parse_addresses(&self.json(&["addr", "show", "dev", name])?)
    }

    fn routes(&self, name: &str) -> Result<Vec<RouteInfo>, InjectError> {
        parse_routes(&self.json(&["route", "show", "dev", name])?, name)
    }

    fn create_macvlan_passthru(
        &self,
        parent: &LinkInfo,
        name: &str,
        target: &NetNamespace,
    ) -> Result<(), InjectError> {
        let mtu = parent.mtu.to_string();
        let pid = target.pid.to_string();
        self.checked(&[
            "link", "add", "link", &parent.name, "name", name, "mtu", &mtu, "netns", &pid,
            "type", "macvlan", "mode", "passthru",
        ])?;
        Ok(())
    }

    fn delete_link(&self, name: &str) -> Result<(), InjectError> {
        self.checked(&["link", "delete", "dev", name])?;
        Ok(())
    }

    fn rename_link(&self, current: &str, new_name: &str) -> Result<RenameOutcome, InjectError> {
        let args = ["link", "set", "dev", current, "name", new_name];
        let output = self.run(&args)?;
        if output.status.success() {
            return Ok(RenameOutcome::Renamed);
        }
        if String::from_utf8_lossy(&output.stderr).contains("File exists") {
            return Ok(RenameOutcome::NameTaken);
        }
        Err(command_error(&args, &output))
    }

    fn add_address(&self, name: &str, addr: &IpConfig) -> Result<(), InjectError> {
        self.checked(&["addr", "add", &addr.to_string(), "dev", name])?;
        Ok(())
    }

    fn set_link_up(&self, name: &str) -> Result<(), InjectError> {
        self.checked(&["link", "set", "dev", name, "up"])?;
        Ok(())
    }

    fn append_route(&self, route: &RouteInfo, device: &str) -> Result<(), InjectError> {
        let mut args = vec!["route", "append", route.destination.as_str()];
        let gateway = route.gateway.map(|gw| gw.to_string());
        if let Some(gw) = &gateway {
            args.extend(["via", gw.as_str()]);
        }
        args.extend(["dev", device]);
        self.checked(&args)?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct IpLinkJson {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    mtu: u32,
}

#[derive(Debug, Deserialize)]
struct IpAddrJson {
    #[serde(default)]
    addr_info: Vec<IpAddrInfoJson>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfoJson {
    #[serde(default)]
    local: Option<String>,
    #[serde(default)]
    prefixlen: u8,
}

#[derive(Debug, Deserialize)]
struct IpRouteJson {
    dst: String,
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    dev: Option<String>,
}

fn decode<'a, T: Deserialize<'a>>(json: &'a str) -> Result<T, InjectError> {
    if json.trim().is_empty() {
        return serde_json::from_str("[]").map_err(|e| InjectError::LinkOperation(e.to_string()));
    }
    serde_json::from_str(json)
        .map_err(|e| InjectError::LinkOperation(format!("unexpected ip output: {e}")))
}

fn parse_ip(s: &str) -> Result<IpAddr, InjectError> {
    s.parse()
        .map_err(|e| InjectError::LinkOperation(format!("invalid address {s}: {e}")))
}

pub fn parse_links(json: &str) -> Result<Vec<LinkInfo>, InjectError> {
    let links: Vec<IpLinkJson> = decode(json)?;
    Ok(links
        .into_iter()
        .map(|l| LinkInfo {
            up: l.flags.iter().any(|f| f == "UP"),
            name: l.ifname,
            index: l.ifindex,
            mtu: l.mtu,
        })
        .collect())
}

/// Addresses in the order iproute2 lists them.
pub fn parse_addresses(json: &str) -> Result<Vec<IpConfig>, InjectError> {
    let entries: Vec<IpAddrJson> = decode(json)?;
    entries
        .into_iter()
        .flat_map(|e| e.addr_info)
        .filter_map(|info| info.local.map(|local| (local, info.prefixlen)))
        .map(|(local, prefix_len)| {
            Ok(IpConfig {
                address: parse_ip(&local)?,
                prefix_len,
            })
        })
        .collect()
}

pub fn parse_routes(json: &str, device: &str) -> Result<Vec<RouteInfo>, InjectError> {
    let routes: Vec<IpRouteJson> = decode(json)?;
    routes
        .into_iter()
        .map(|r| {
            Ok(RouteInfo {
                destination: r.dst,
                gateway: r.gateway.as_deref().map(parse_ip).transpose()?,
                device: r.dev.unwrap_or_else(|| device.to_owned()),
            })
        })
        .collect()
}

static LINK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Collision-resistant temporary link name that fits the kernel name limit.
pub fn temporary_link_name(seed: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();

    let mut hasher = blake3::Hasher::new();
    hasher.update(&std::process::id().to_le_bytes());
    hasher.update(&LINK_COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    hasher.update(&nanos.to_le_bytes());
    hasher.update(seed.as_bytes());
    let hex = hasher.finalize().to_hex();

    let mut name = format!("{TEMP_LINK_PREFIX}{}", &hex[..8]);
    name.truncate(IFNAMSIZ - 1);
    name
}

/// Transient state of one interface while it crosses into the container.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterfaceBridge {
    pub host_interface: String,
    pub temporary_link: String,
    pub addresses: Vec<IpConfig>,
    pub gateway_route: Option<RouteInfo>,
    pub netns: PathBuf,
}

/// Deletes the temporary link from the host side when dropped.
///
/// The link is created inside the container namespace, so on success there is
/// nothing to delete and the error is expected.
struct HostLinkCleanup<'a> {
    control: &'a dyn LinkControl,
    name: String,
}

impl Drop for HostLinkCleanup<'_> {
    fn drop(&mut self) {
        match self.control.delete_link(&self.name) {
            Ok(()) => tracing::info!(link = %self.name, "removed temporary link from host"),
            Err(e) => tracing::trace!(link = %self.name, error = %e, "no temporary link left on host"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BridgeOutcome {
    Exposed,
    SkippedDown,
    AlreadyPresent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BridgeReport {
    pub exposed: Vec<String>,
    pub skipped_down: Vec<String>,
    pub already_present: Vec<String>,
}

pub struct NetworkBridge<'a> {
    host: &'a dyn LinkControl,
    container: &'a dyn LinkControl,
    netns: NetNamespace,
}

impl<'a> NetworkBridge<'a> {
    pub fn new(
        host: &'a dyn LinkControl,
        container: &'a dyn LinkControl,
        netns: NetNamespace,
    ) -> Self {
        Self {
            host,
            container,
            netns,
        }
    }

    /// Expose every interface in order. The first failure aborts the batch;
    /// interfaces handled before it stay exposed.
    pub fn expose_interfaces(&self, interfaces: &[String]) -> Result<BridgeReport, InjectError> {
        let mut report = BridgeReport::default();
        if interfaces.is_empty() {
            tracing::warn!("external network is not available");
            return Ok(report);
        }
        tracing::info!(interfaces = ?interfaces, netns = %self.netns.path.display(), "exposing interfaces");

        for name in interfaces {
            let outcome = self.expose_interface(name).map_err(|e| {
                InjectError::LinkOperation(format!("exposing interface {name}: {e}"))
            })?;
            let bucket = match outcome {
                BridgeOutcome::Exposed => &mut report.exposed,
                BridgeOutcome::SkippedDown => &mut report.skipped_down,
                BridgeOutcome::AlreadyPresent => &mut report.already_present,
            };
            bucket.push(name.clone());
        }
        Ok(report)
    }

    pub fn expose_interface(&self, name: &str) -> Result<BridgeOutcome, InjectError> {
        let host_link = self.host.link(name)?;
        if !host_link.up {
            tracing::warn!(interface = %name, "device is down, skipping");
            return Ok(BridgeOutcome::SkippedDown);
        }

        let temporary_link = temporary_link_name(name);
        self.host
            .create_macvlan_passthru(&host_link, &temporary_link, &self.netns)?;
        let _cleanup = HostLinkCleanup {
            control: self.host,
            name: temporary_link.clone(),
        };

        let addresses = self.host.addresses(name)?;
        tracing::info!(interface = %name, addrs = ?addresses, "found ip addresses for interface");
        let gateway_route = self
            .host
            .routes(name)?
            .into_iter()
            .find(|r| r.gateway.is_some());
        if let Some(route) = &gateway_route {
            tracing::info!(interface = %name, route = ?route, "found gateway route");
        }

        let bridge = NetworkInterfaceBridge {
            host_interface: name.to_owned(),
            temporary_link,
            addresses,
            gateway_route,
            netns: self.netns.path.clone(),
        };
        self.configure_in_container(&bridge)
    }

    fn configure_in_container(
        &self,
        bridge: &NetworkInterfaceBridge,
    ) -> Result<BridgeOutcome, InjectError> {
        let name = bridge.host_interface.as_str();
        tracing::info!(
            current_name = %bridge.temporary_link,
            new_name = %name,
            "setting link name inside namespace"
        );
        if self.container.rename_link(&bridge.temporary_link, name)? == RenameOutcome::NameTaken {
            tracing::info!(interface = %name, "device already exists in namespace, host network used?");
            if let Err(e) = self.container.delete_link(&bridge.temporary_link) {
                tracing::warn!(link = %bridge.temporary_link, error = %e, "failed to remove unused temporary link");
            }
            return Ok(BridgeOutcome::AlreadyPresent);
        }

        let link = self.container.link(name)?;

        if bridge.gateway_route.is_some() {
            match bridge.addresses.first() {
                Some(addr) => {
                    tracing::info!(interface = %name, addr = %addr, "adding address to interface");
                    self.container.add_address(&link.name, addr)?;
                }
                None => tracing::warn!(interface = %name, "gateway route found but interface has no address"),
            }
        }

        self.container.set_link_up(&link.name)?;

        if let Some(route) = &bridge.gateway_route {
            tracing::info!(interface = %name, route = ?route, "adding route for device");
            self.container.append_route(route, &link.name)?;
        }
        Ok(BridgeOutcome::Exposed)
    }
}
