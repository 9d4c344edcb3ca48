//! Cgroup device authorization for cgroup v1 and v2 hosts.
//!
//! The version is detected once per container from `/proc/<pid>/cgroup`; the
//! resulting [`CgroupBackend`] is then passed by reference through the pipeline.
//! Resolution runs `Unresolved -> VersionDetected -> PathsResolved -> RulesWritten`
//! and any failing step aborts the chain.

use crate::discover::AcceleratorDevice;
use crate::InjectError;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

/// Control file receiving allow rules (v1 kernel interface; v2 unified allow list).
pub const DEVICES_ALLOW_FILE: &str = "devices.allow";
/// Read-back view of the effective v1 allow list.
pub const DEVICES_LIST_FILE: &str = "devices.list";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CgroupVersion {
    V1,
    V2,
}

impl fmt::Display for CgroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => f.write_str("1"),
            Self::V2 => f.write_str("2"),
        }
    }
}

/// A cgroup device allow directive. Rules are additive only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceRule {
    pub allow: bool,
    pub kind: char,
    pub major: u32,
    pub minor: u32,
    pub access: String,
}

impl DeviceRule {
    /// Full (`rwm`) access to character device `major:minor`.
    pub fn allow_char(major: u32, minor: u32) -> Self {
        Self {
            allow: true,
            kind: 'c',
            major,
            minor,
            access: "rwm".to_owned(),
        }
    }

    /// `type major:minor access`, the line format both hierarchies accept.
    pub fn control_line(&self) -> String {
        format!("{} {}:{} {}", self.kind, self.major, self.minor, self.access)
    }
}

impl From<&AcceleratorDevice> for DeviceRule {
    fn from(dev: &AcceleratorDevice) -> Self {
        Self::allow_char(dev.major, dev.minor)
    }
}

/// Where the devices controller hierarchy is mounted and which hierarchy path
/// that mount exposes as its root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceCgroupMount {
    pub mount_path: PathBuf,
    pub root_prefix: String,
}

/// Fully resolved cgroup location of a container process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CgroupTarget {
    pub version: CgroupVersion,
    pub mount_path: PathBuf,
    pub root_prefix: String,
    pub container_path: PathBuf,
}

/// Version-specific device-cgroup mechanics behind one capability set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupBackend {
    V1,
    V2,
}

impl CgroupBackend {
    pub fn new(version: CgroupVersion) -> Self {
        match version {
            CgroupVersion::V1 => Self::V1,
            CgroupVersion::V2 => Self::V2,
        }
    }

    pub fn detect(proc_root: &Path, pid: u32) -> Result<Self, InjectError> {
        detect_version(proc_root, pid).map(Self::new)
    }

    pub fn version(self) -> CgroupVersion {
        match self {
            Self::V1 => CgroupVersion::V1,
            Self::V2 => CgroupVersion::V2,
        }
    }

    /// Find the devices hierarchy mount in `/proc/<pid>/mountinfo`: a `cgroup`
    /// mount carrying the `devices` super option on v1, the `cgroup2` mount on v2.
    pub fn device_cgroup_mount_path(
        self,
        proc_root: &Path,
        pid: u32,
    ) -> Result<DeviceCgroupMount, InjectError> {
        let path = proc_file(proc_root, pid, "mountinfo");
        let content = std::fs::read_to_string(&path).map_err(|source| InjectError::Sysfs {
            path: path.clone(),
            source,
        })?;

        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let entry = MountInfoEntry::parse(line)?;
            let matches = match self {
                Self::V1 => {
                    entry.fs_type == "cgroup"
                        && entry.super_options.split(',').any(|o| o == "devices")
                }
                Self::V2 => entry.fs_type == "cgroup2",
            };
            if !matches {
                continue;
            }
            if entry.root.starts_with("/..") {
                return Err(InjectError::MalformedCgroupEntry(format!(
                    "relative path in mount prefix: {}",
                    entry.root
                )));
            }
            return Ok(DeviceCgroupMount {
                mount_path: PathBuf::from(entry.mount_point),
                root_prefix: entry.root.to_owned(),
            });
        }

        Err(InjectError::CgroupMountNotFound(pid))
    }

    /// The target process's cgroup path relative to the mount, i.e. with the
    /// mount's root prefix stripped. Only whole path components are stripped.
    pub fn device_cgroup_root_path(
        self,
        proc_root: &Path,
        prefix: &str,
        pid: u32,
    ) -> Result<String, InjectError> {
        for entry in read_cgroup_entries(proc_root, pid)? {
            let selected = match self {
                Self::V1 => entry.controllers.split(',').any(|c| c == "devices"),
                Self::V2 => entry.hierarchy == "0" && entry.controllers.is_empty(),
            };
            if selected {
                let path = Path::new(&entry.path).strip_prefix(prefix).map_or_else(
                    |_| entry.path.clone(),
                    |relative| format!("/{}", relative.display()),
                );
                return Ok(path);
            }
        }
        Err(InjectError::NoCgroupEntries(pid))
    }

    /// Resolve mount, root path and the joined container cgroup directory.
    pub fn resolve_target(self, proc_root: &Path, pid: u32) -> Result<CgroupTarget, InjectError> {
        let mount = self.device_cgroup_mount_path(proc_root, pid)?;
        let root_path = self.device_cgroup_root_path(proc_root, &mount.root_prefix, pid)?;
        let container_path = mount.mount_path.join(root_path.trim_start_matches('/'));
        Ok(CgroupTarget {
            version: self.version(),
            mount_path: mount.mount_path,
            root_prefix: mount.root_prefix,
            container_path,
        })
    }

    /// Append allow rules to the cgroup at `cgroup_path`, one write per rule.
    ///
    /// Rules already effective (per the existing allow list) and duplicates within
    /// the batch are skipped. Returns the number of rules actually written. A
    /// failing write leaves earlier rules in place.
    pub fn add_device_rules(
        self,
        cgroup_path: &Path,
        rules: &[DeviceRule],
    ) -> Result<usize, InjectError> {
        let allow_file = cgroup_path.join(DEVICES_ALLOW_FILE);
        let existing_file = match self {
            Self::V1 => cgroup_path.join(DEVICES_LIST_FILE),
            Self::V2 => allow_file.clone(),
        };
        let existing = read_existing_rules(&existing_file)?;

        let mut seen = HashSet::new();
        let pending: Vec<&DeviceRule> = rules
            .iter()
            .filter(|r| r.allow)
            .filter(|r| seen.insert((r.kind, r.major, r.minor)))
            .filter(|r| !existing.iter().any(|e| e.covers(r)))
            .collect();

        if pending.is_empty() {
            tracing::debug!(path = %cgroup_path.display(), "all device rules already present");
            return Ok(0);
        }

        let write_err = |source: io::Error| InjectError::CgroupWrite {
            path: allow_file.clone(),
            source,
        };
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&allow_file)
            .map_err(write_err)?;

        for rule in &pending {
            let line = rule.control_line();
            file.write_all(format!("{line}\n").as_bytes())
                .map_err(write_err)?;
            tracing::debug!(rule = %line, path = %allow_file.display(), "added device rule");
        }
        Ok(pending.len())
    }
}

/// Cgroup version in use for `pid`: `devices` controller present means v1, an
/// empty controller list (unified hierarchy) means v2.
pub fn detect_version(proc_root: &Path, pid: u32) -> Result<CgroupVersion, InjectError> {
    let entries = read_cgroup_entries(proc_root, pid)?;

    if entries
        .iter()
        .any(|e| e.controllers.split(',').any(|c| c == "devices"))
    {
        return Ok(CgroupVersion::V1);
    }
    if entries.iter().any(|e| e.controllers.is_empty()) {
        return Ok(CgroupVersion::V2);
    }
    Err(InjectError::NoCgroupEntries(pid))
}

fn proc_file(proc_root: &Path, pid: u32, name: &str) -> PathBuf {
    proc_root.join("proc").join(pid.to_string()).join(name)
}

#[derive(Debug)]
struct CgroupEntry {
    hierarchy: String,
    controllers: String,
    path: String,
}

fn read_cgroup_entries(proc_root: &Path, pid: u32) -> Result<Vec<CgroupEntry>, InjectError> {
    let path = proc_file(proc_root, pid, "cgroup");
    let content = std::fs::read_to_string(&path).map_err(|source| InjectError::Sysfs {
        path: path.clone(),
        source,
    })?;

    content
        .lines()
        .filter(|l| !l.is_empty())
        .map(|line| {
            let mut parts = line.splitn(3, ':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(hierarchy), Some(controllers), Some(path)) => Ok(CgroupEntry {
                    hierarchy: hierarchy.to_owned(),
                    controllers: controllers.to_owned(),
                    path: path.to_owned(),
                }),
                _ => Err(InjectError::MalformedCgroupEntry(line.to_owned())),
            }
        })
        .collect()
}

struct MountInfoEntry<'a> {
    root: &'a str,
    mount_point: &'a str,
    fs_type: &'a str,
    super_options: &'a str,
}

impl<'a> MountInfoEntry<'a> {
    /// `id parent maj:min root mount-point opts [optional...] - fstype source super-opts`
    fn parse(line: &'a str) -> Result<Self, InjectError> {
        let malformed = || InjectError::MalformedCgroupEntry(format!("mountinfo: {line}"));
        let (pre, post) = line.split_once(" - ").ok_or_else(malformed)?;
        let pre: Vec<&str> = pre.split(' ').collect();
        let post: Vec<&str> = post.split(' ').collect();
        if pre.len() < 6 || post.len() < 3 {
            return Err(malformed());
        }
        Ok(Self {
            root: pre[3],
            mount_point: pre[4],
            fs_type: post[0],
            super_options: post[2],
        })
    }
}

/// One line of an allow list: `a *:* rwm`, `c 1:3 rwm`, `c 234:* rw`.
#[derive(Debug)]
struct ExistingRule {
    kind: char,
    major: Option<u32>,
    minor: Option<u32>,
    access: String,
}

impl ExistingRule {
    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let kind = fields.next()?.chars().next()?;
        let (major, minor) = fields.next()?.split_once(':')?;
        let access = fields.next().unwrap_or("rwm").to_owned();
        let number = |s: &str| {
            if s == "*" {
                Ok(None)
            } else {
                s.parse::<u32>().map(Some)
            }
        };
        Some(Self {
            kind,
            major: number(major).ok()?,
            minor: number(minor).ok()?,
            access,
        })
    }

    fn covers(&self, rule: &DeviceRule) -> bool {
        (self.kind == 'a' || self.kind == rule.kind)
            && self.major.is_none_or(|m| m == rule.major)
            && self.minor.is_none_or(|m| m == rule.minor)
            && rule.access.chars().all(|c| self.access.contains(c))
    }
}

fn read_existing_rules(path: &Path) -> Result<Vec<ExistingRule>, InjectError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content.lines().filter_map(ExistingRule::parse).collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(source) => Err(InjectError::Sysfs {
            path: path.to_path_buf(),
            source,
        }),
    }
}
