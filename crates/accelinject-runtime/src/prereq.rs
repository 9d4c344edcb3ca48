use std::fmt;
use std::path::Path;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn ip_command_works() -> bool {
    Command::new("ip")
        .args(["-json", "link", "show", "dev", "lo"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[allow(unsafe_code)]
fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Check everything the hook needs to inject devices and bridge interfaces.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_prereqs() -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !ip_command_works() {
        missing.push(MissingPrereq {
            name: "ip",
            purpose: "macvlan creation and address/route replication",
            install_hint: "part of iproute2: zypper install iproute2 | apt install iproute2 | dnf install iproute | pacman -S iproute2",
        });
    }

    if !running_as_root() {
        missing.push(MissingPrereq {
            name: "root privileges",
            purpose: "setns, bind mounts and cgroup writes",
            install_hint: "run the hook from the container engine, or with sudo",
        });
    }

    let ns = Path::new("/proc/self/ns");
    if !(ns.join("mnt").exists() && ns.join("net").exists()) {
        missing.push(MissingPrereq {
            name: "namespace files",
            purpose: "entering container mount and network namespaces",
            install_hint: "mount procfs at /proc on a kernel with CONFIG_NAMESPACES=y",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\naccelinject needs these to expose accelerators to containers.");
    msg
}
