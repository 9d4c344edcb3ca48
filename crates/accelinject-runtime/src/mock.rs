use crate::materialize::{open_placeholder, NodeInstaller};
use crate::network::{IpConfig, LinkControl, LinkInfo, NetNamespace, RenameOutcome, RouteInfo};
use crate::InjectError;
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum FailAt {
    #[default]
    Nothing,
    Mkdir,
    Placeholder,
    Mount,
}

/// In-process [`NodeInstaller`] that works on the plain filesystem and
/// records mounts instead of performing them.
#[derive(Default)]
pub struct MockNodeInstaller {
    fail_at: FailAt,
    operations: Mutex<Vec<String>>,
    mounts: Mutex<Vec<(PathBuf, PathBuf)>>,
}

impl MockNodeInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    fn failing(fail_at: FailAt) -> Self {
        Self {
            fail_at,
            ..Self::default()
        }
    }

    pub fn failing_mkdir() -> Self {
        Self::failing(FailAt::Mkdir)
    }

    pub fn failing_placeholder() -> Self {
        Self::failing(FailAt::Placeholder)
    }

    pub fn failing_mounts() -> Self {
        Self::failing(FailAt::Mount)
    }

    pub fn operations(&self) -> Vec<String> {
        self.operations
            .lock()
            .map(|ops| ops.clone())
            .unwrap_or_default()
    }

    pub fn mounts(&self) -> Vec<(PathBuf, PathBuf)> {
        self.mounts.lock().map(|m| m.clone()).unwrap_or_default()
    }

    fn record(&self, op: &str, path: &Path) -> Result<(), InjectError> {
        self.operations
            .lock()
            .map_err(|e| InjectError::Namespace(format!("mutex poisoned: {e}")))?
            .push(format!("{op} {}", path.display()));
        Ok(())
    }

    fn injected_failure(&self, at: FailAt, what: &str) -> Result<(), InjectError> {
        if self.fail_at == at {
            return Err(InjectError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("mock {what} failure"),
            )));
        }
        Ok(())
    }
}

impl NodeInstaller for MockNodeInstaller {
    fn ensure_parent_dir(&self, dir: &Path) -> Result<(), InjectError> {
        self.record("mkdir", dir)?;
        self.injected_failure(FailAt::Mkdir, "mkdir")?;
        std::fs::create_dir_all(dir)?;
        Ok(())
    }

    fn create_placeholder(&self, path: &Path) -> Result<(), InjectError> {
        self.record("create", path)?;
        self.injected_failure(FailAt::Placeholder, "create")?;
        open_placeholder(path)?;
        Ok(())
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<(), InjectError> {
        self.record("mount", target)?;
        if self.fail_at == FailAt::Mount {
            return Err(InjectError::MountFailed {
                source_path: source.to_path_buf(),
                target: target.to_path_buf(),
                reason: "mock mount failure".to_owned(),
            });
        }
        self.mounts
            .lock()
            .map_err(|e| InjectError::Namespace(format!("mutex poisoned: {e}")))?
            .push((source.to_path_buf(), target.to_path_buf()));
        Ok(())
    }

    fn remove_placeholder(&self, path: &Path) -> Result<(), InjectError> {
        self.record("remove", path)?;
        std::fs::remove_file(path)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockLink {
    pub info: LinkInfo,
    pub addresses: Vec<IpConfig>,
    pub routes: Vec<RouteInfo>,
}

#[derive(Default)]
struct NetState {
    host: BTreeMap<String, MockLink>,
    container: BTreeMap<String, MockLink>,
    next_index: u32,
    failing: HashSet<String>,
    links_on_host: bool,
    host_deletes: usize,
}

impl NetState {
    fn side(&mut self, side: Side) -> &mut BTreeMap<String, MockLink> {
        match side {
            Side::Host => &mut self.host,
            Side::Container => &mut self.container,
        }
    }

    fn insert(&mut self, side: Side, name: &str, mtu: u32, up: bool) {
        self.next_index += 1;
        let index = self.next_index;
        self.side(side).insert(
            name.to_owned(),
            MockLink {
                info: LinkInfo {
                    name: name.to_owned(),
                    index,
                    mtu,
                    up,
                },
                addresses: Vec::new(),
                routes: Vec::new(),
            },
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Host,
    Container,
}

/// Two fake network namespaces sharing one state, for bridge tests.
#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<NetState>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(&self) -> MockLinkControl {
        MockLinkControl {
            state: Arc::clone(&self.state),
            side: Side::Host,
        }
    }

    pub fn container(&self) -> MockLinkControl {
        MockLinkControl {
            state: Arc::clone(&self.state),
            side: Side::Container,
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut NetState) -> T) -> T {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut state)
    }

    pub fn add_host_link(&self, name: &str, mtu: u32, up: bool) {
        self.with(|s| s.insert(Side::Host, name, mtu, up));
    }

    pub fn add_container_link(&self, name: &str, mtu: u32, up: bool) {
        self.with(|s| s.insert(Side::Container, name, mtu, up));
    }

    pub fn add_host_address(&self, name: &str, addr: IpConfig) {
        self.with(|s| {
            if let Some(link) = s.host.get_mut(name) {
                link.addresses.push(addr);
            }
        });
    }

    pub fn add_host_route(&self, name: &str, route: RouteInfo) {
        self.with(|s| {
            if let Some(link) = s.host.get_mut(name) {
                link.routes.push(route);
            }
        });
    }

    /// Make the named operation fail on either side.
    pub fn fail_operation(&self, op: &str) {
        self.with(|s| s.failing.insert(op.to_owned()));
    }

    /// Simulate a kernel that ignores the target namespace on link creation.
    pub fn create_links_on_host(&self) {
        self.with(|s| s.links_on_host = true);
    }

    pub fn container_link(&self, name: &str) -> Option<MockLink> {
        self.with(|s| s.container.get(name).cloned())
    }

    pub fn container_link_names(&self) -> Vec<String> {
        self.with(|s| s.container.keys().cloned().collect())
    }

    pub fn host_link_names(&self) -> Vec<String> {
        self.with(|s| s.host.keys().cloned().collect())
    }

    pub fn host_deletes_attempted(&self) -> usize {
        self.with(|s| s.host_deletes)
    }
}

pub struct MockLinkControl {
    state: Arc<Mutex<NetState>>,
    side: Side,
}

impl MockLinkControl {
    fn lock(&self, op: &str) -> Result<MutexGuard<'_, NetState>, InjectError> {
        let state = self
            .state
            .lock()
            .map_err(|e| InjectError::LinkOperation(format!("mutex poisoned: {e}")))?;
        if state.failing.contains(op) {
            return Err(InjectError::LinkOperation(format!("mock {op} failure")));
        }
        Ok(state)
    }

    fn missing(name: &str) -> InjectError {
        InjectError::LinkOperation(format!("link not found: {name}"))
    }
}

impl LinkControl for MockLinkControl {
    fn link(&self, name: &str) -> Result<LinkInfo, InjectError> {
        let mut state = self.lock("link")?;
        state
            .side(self.side)
            .get(name)
            .map(|l| l.info.clone())
            .ok_or_else(|| Self::missing(name))
    }

    fn addresses(&self, name: &str) -> Result<Vec<IpConfig>, InjectError> {
        let mut state = self.lock("addresses")?;
        state
            .side(self.side)
            .get(name)
            .map(|l| l.addresses.clone())
            .ok_or_else(|| Self::missing(name))
    }

    fn routes(&self, name: &str) -> Result<Vec<RouteInfo>, InjectError> {
        let mut state = self.lock("routes")?;
        state
            .side(self.side)
            .get(name)
            .map(|l| l.routes.clone())
            .ok_or_else(|| Self::missing(name))
    }

    fn create_macvlan_passthru(
        &self,
        parent: &LinkInfo,
        name: &str,
        _target: &NetNamespace,
    ) -> Result<(), InjectError> {
        let mut state = self.lock("create_macvlan_passthru")?;
        let side = if state.links_on_host {
            Side::Host
        } else {
            Side::Container
        };
        if state.side(side).contains_key(name) {
            return Err(InjectError::LinkOperation(format!("link exists: {name}")));
        }
        state.insert(side, name, parent.mtu, false);
        Ok(())
    }

    fn delete_link(&self, name: &str) -> Result<(), InjectError> {
        let mut state = self.lock("delete_link")?;
        if self.side == Side::Host {
            state.host_deletes += 1;
        }
        state
            .side(self.side)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::missing(name))
    }

    fn rename_link(&self, current: &str, new_name: &str) -> Result<RenameOutcome, InjectError> {
        let mut state = self.lock("rename_link")?;
        let links = state.side(self.side);
        if links.contains_key(new_name) {
            return Ok(RenameOutcome::NameTaken);
        }
        let mut link = links.remove(current).ok_or_else(|| Self::missing(current))?;
        new_name.clone_into(&mut link.info.name);
        links.insert(new_name.to_owned(), link);
        Ok(RenameOutcome::Renamed)
    }

    fn add_address(&self, name: &str, addr: &IpConfig) -> Result<(), InjectError> {
        let mut state = self.lock("add_address")?;
        let link = state
            .side(self.side)
            .get_mut(name)
            .ok_or_else(|| Self::missing(name))?;
        link.addresses.push(*addr);
        Ok(())
    }

    fn set_link_up(&self, name: &str) -> Result<(), InjectError> {
        let mut state = self.lock("set_link_up")?;
        let link = state
            .side(self.side)
            .get_mut(name)
            .ok_or_else(|| Self::missing(name))?;
        link.info.up = true;
        Ok(())
    }

    fn append_route(&self, route: &RouteInfo, device: &str) -> Result<(), InjectError> {
        let mut state = self.lock("append_route")?;
        let link = state
            .side(self.side)
            .get_mut(device)
            .ok_or_else(|| Self::missing(device))?;
        link.routes.push(RouteInfo {
            device: device.to_owned(),
            ..route.clone()
        });
        Ok(())
    }
}
