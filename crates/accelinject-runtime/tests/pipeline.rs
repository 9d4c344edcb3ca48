//! End-to-end pipeline runs over a fabricated `/dev`, `/sys` and `/proc` tree.
//!
//! Device nodes are symlinks to host `/dev/null` (1:3) and `/dev/zero` (1:5) so
//! identity resolution sees real character devices without privileges.

use accelinject_runtime::mock::{MockNetwork, MockNodeInstaller};
use accelinject_runtime::network::IpConfig;
use accelinject_runtime::{
    CgroupVersion, DeviceDirectory, DeviceSelector, HookKind, HookRequest, InjectError,
    InjectionPipeline,
};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

const PID: u32 = 4242;

struct HostTree {
    root: tempfile::TempDir,
}

impl HostTree {
    fn new() -> Self {
        let tree = Self {
            root: tempfile::tempdir().unwrap(),
        };
        fs::create_dir_all(tree.dev().join("accel")).unwrap();
        fs::create_dir_all(tree.sys()).unwrap();
        fs::create_dir_all(tree.rootfs()).unwrap();
        tree
    }

    fn dev(&self) -> PathBuf {
        self.root.path().join("dev")
    }

    fn sys(&self) -> PathBuf {
        self.root.path().join("sys")
    }

    fn proc_root(&self) -> PathBuf {
        self.root.path().join("host")
    }

    fn rootfs(&self) -> PathBuf {
        self.root.path().join("rootfs")
    }

    fn cgroup_dir(&self) -> PathBuf {
        self.root.path().join("cgroup/ctr-1")
    }

    fn directory(&self) -> DeviceDirectory {
        DeviceDirectory::with_roots(self.dev(), self.sys())
    }

    fn accel(&self, name: &str, target: &str) {
        symlink(target, self.dev().join("accel").join(name)).unwrap();
    }

    /// Unified hierarchy mounted at `<root>/cgroup`, container in `/ctr-1`.
    fn cgroup_v2(&self) {
        let proc_dir = self.proc_root().join("proc").join(PID.to_string());
        fs::create_dir_all(&proc_dir).unwrap();
        fs::write(proc_dir.join("cgroup"), "0::/ctr-1\n").unwrap();
        fs::write(
            proc_dir.join("mountinfo"),
            format!(
                "22 1 0:21 / /proc rw,nosuid - proc proc rw\n\
                 30 23 0:26 / {} rw,nosuid,nodev,noexec - cgroup2 cgroup2 rw,nsdelegate\n",
                self.root.path().join("cgroup").display()
            ),
        )
        .unwrap();
        fs::create_dir_all(self.cgroup_dir()).unwrap();
        fs::write(self.cgroup_dir().join("devices.allow"), "").unwrap();
    }

    /// Accelerator `id` with a verbs device whose interface `iface` is registered.
    fn fabric(&self, id: &str, pci: &str, iface: &str) {
        let class = self.sys().join(format!("class/accel/accel{id}/device"));
        fs::create_dir_all(&class).unwrap();
        fs::write(class.join("pci_addr"), format!("{pci}\n")).unwrap();
        let verbs = self.sys().join(format!("class/infiniband/hlib_{id}/device/net/{iface}"));
        fs::create_dir_all(verbs).unwrap();
    }

    fn allow_list(&self) -> String {
        fs::read_to_string(self.cgroup_dir().join("devices.allow")).unwrap()
    }
}

fn prestart(tree: &HostTree) -> HookRequest {
    let mut request = HookRequest::new(PID, tree.rootfs());
    request.hook = HookKind::Prestart;
    request.routes_file = None;
    request
}

fn container_node(rootfs: &Path, host: &Path) -> PathBuf {
    rootfs.join(host.strip_prefix("/").unwrap())
}

#[test]
fn prestart_all_devices_without_fabric() {
    let tree = HostTree::new();
    tree.accel("accel0", "/dev/null");
    tree.accel("accel1", "/dev/zero");
    tree.cgroup_v2();

    let directory = tree.directory();
    let installer = MockNodeInstaller::new();
    let net = MockNetwork::new();
    let (host, container) = (net.host(), net.container());
    let report = InjectionPipeline::new(&directory, &installer, &host, &container)
        .with_proc_root(tree.proc_root())
        .run(&prestart(&tree))
        .unwrap();

    assert_eq!(report.device_ids, ["0", "1"]);
    assert_eq!(report.devices.len(), 2);
    assert_eq!(report.rules_written, 2);
    assert!(report.interfaces.is_empty());
    assert_eq!(report.cgroup.as_ref().unwrap().version, CgroupVersion::V2);
    assert_eq!(tree.allow_list(), "c 1:3 rwm\nc 1:5 rwm\n");
    for dev in &report.devices {
        assert!(container_node(&tree.rootfs(), &dev.path).exists());
    }
    assert_eq!(installer.mounts().len(), 2);
}

#[test]
fn rerunning_prestart_adds_nothing() {
    let tree = HostTree::new();
    tree.accel("accel0", "/dev/null");
    tree.cgroup_v2();

    let directory = tree.directory();
    let installer = MockNodeInstaller::new();
    let net = MockNetwork::new();
    let (host, container) = (net.host(), net.container());
    let pipeline = InjectionPipeline::new(&directory, &installer, &host, &container)
        .with_proc_root(tree.proc_root());

    pipeline.run(&prestart(&tree)).unwrap();
    let second = pipeline.run(&prestart(&tree)).unwrap();
    assert_eq!(second.rules_written, 0);
    assert_eq!(installer.mounts().len(), 1);
    assert_eq!(tree.allow_list(), "c 1:3 rwm\n");
}

#[test]
fn selected_ids_limit_devices_and_interfaces() {
    let tree = HostTree::new();
    tree.accel("accel0", "/dev/null");
    tree.accel("accel1", "/dev/zero");
    tree.accel("accel_controlD1", "/dev/zero");
    tree.cgroup_v2();
    tree.fabric("0", "0000:33:00.0", "ens0");
    tree.fabric("1", "0000:34:00.0", "ens1");

    let net = MockNetwork::new();
    net.add_host_link("ens0", 9000, true);
    net.add_host_link("ens1", 9000, true);
    net.add_host_address(
        "ens1",
        IpConfig {
            address: "10.0.0.5".parse().unwrap(),
            prefix_len: 24,
        },
    );

    let directory = tree.directory();
    let installer = MockNodeInstaller::new();
    let (host, container) = (net.host(), net.container());
    let mut request = prestart(&tree);
    request.selector = "1".parse::<DeviceSelector>().unwrap();
    request.mount_uverbs = false;

    let report = InjectionPipeline::new(&directory, &installer, &host, &container)
        .with_proc_root(tree.proc_root())
        .run(&request)
        .unwrap();

    assert_eq!(report.device_ids, ["1"]);
    assert_eq!(report.devices.len(), 2);
    // accel1 and its control node share 1:5.
    assert_eq!(report.rules_written, 1);
    assert_eq!(report.interfaces, ["ens1"]);
    assert_eq!(report.bridge.exposed, ["ens1"]);
    assert_eq!(net.container_link_names(), ["ens1"]);
}

#[test]
fn create_runtime_only_bridges_interfaces() {
    let tree = HostTree::new();
    tree.accel("accel0", "/dev/null");
    tree.fabric("0", "0000:33:00.0", "ens0");

    let net = MockNetwork::new();
    net.add_host_link("ens0", 1500, true);

    let directory = tree.directory();
    let installer = MockNodeInstaller::new();
    let (host, container) = (net.host(), net.container());
    let report = InjectionPipeline::new(&directory, &installer, &host, &container)
        .with_proc_root(tree.proc_root())
        .run(&HookRequest::new(PID, tree.rootfs()))
        .unwrap();

    assert!(report.devices.is_empty());
    assert!(installer.operations().is_empty());
    assert_eq!(report.bridge.exposed, ["ens0"]);
}

#[test]
fn missing_cgroup_information_aborts_prestart() {
    let tree = HostTree::new();
    tree.accel("accel0", "/dev/null");

    let directory = tree.directory();
    let installer = MockNodeInstaller::new();
    let net = MockNetwork::new();
    let (host, container) = (net.host(), net.container());
    let err = InjectionPipeline::new(&directory, &installer, &host, &container)
        .with_proc_root(tree.proc_root())
        .run(&prestart(&tree))
        .unwrap_err();

    assert!(matches!(err, InjectError::Sysfs { .. }));
    assert!(installer.operations().is_empty());
}

#[test]
fn prestart_publishes_routes_file() {
    let tree = HostTree::new();
    tree.accel("accel0", "/dev/null");
    tree.cgroup_v2();
    let routes = tree.root.path().join("gaudinet.json");
    fs::write(&routes, r#"{"NIC_NET_CONFIG":[]}"#).unwrap();

    let directory = tree.directory();
    let installer = MockNodeInstaller::new();
    let net = MockNetwork::new();
    let (host, container) = (net.host(), net.container());
    let mut request = prestart(&tree);
    request.routes_file = Some(routes);

    InjectionPipeline::new(&directory, &installer, &host, &container)
        .with_proc_root(tree.proc_root())
        .run(&request)
        .unwrap();

    assert!(tree.rootfs().join("etc/habanalabs/gaudinet.json").exists());
}
