//! Scoped entry into another process's namespaces.
//!
//! [`NamespaceGuard`] moves the calling thread into a target namespace with
//! `setns(2)` and moves it back when dropped, so every exit path (including `?`
//! early returns) restores the original namespace.

use crate::InjectError;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceKind {
    Mount,
    Network,
}

impl NamespaceKind {
    /// Entry name under `/proc/<pid>/ns/`.
    pub fn proc_name(self) -> &'static str {
        match self {
            Self::Mount => "mnt",
            Self::Network => "net",
        }
    }

    fn clone_flag(self) -> libc::c_int {
        match self {
            Self::Mount => libc::CLONE_NEWNS,
            Self::Network => libc::CLONE_NEWNET,
        }
    }
}

/// `/proc/<pid>/ns/<kind>`
pub fn namespace_path(pid: u32, kind: NamespaceKind) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/ns/{}", kind.proc_name()))
}

pub struct NamespaceGuard {
    kind: NamespaceKind,
    original: File,
    cwd: Option<File>,
}

impl NamespaceGuard {
    pub fn enter(pid: u32, kind: NamespaceKind) -> Result<Self, InjectError> {
        Self::enter_path(&namespace_path(pid, kind), kind)
    }

    pub fn enter_path(target: &Path, kind: NamespaceKind) -> Result<Self, InjectError> {
        let ns_err = |what: &str, e: io::Error| {
            InjectError::Namespace(format!(
                "{what} ({} namespace {}): {e}",
                kind.proc_name(),
                target.display()
            ))
        };

        let target_file = File::open(target).map_err(|e| ns_err("opening target", e))?;
        let original = File::open(format!("/proc/thread-self/ns/{}", kind.proc_name()))
            .map_err(|e| ns_err("opening current", e))?;

        // setns(CLONE_NEWNS) changes root and cwd, and refuses threads that share
        // filesystem attributes.
        let cwd = if kind == NamespaceKind::Mount {
            let cwd = File::open(".").map_err(|e| ns_err("saving working directory", e))?;
            unshare_fs().map_err(|e| ns_err("unshare(CLONE_FS)", e))?;
            Some(cwd)
        } else {
            None
        };

        setns(&target_file, kind.clone_flag()).map_err(|e| ns_err("setns", e))?;
        tracing::trace!(kind = kind.proc_name(), target = %target.display(), "entered namespace");

        Ok(Self {
            kind,
            original,
            cwd,
        })
    }
}

impl NamespaceGuard {
    /// Switch the thread back to the namespace it was in before `enter`.
    fn restore(&self) -> io::Result<()> {
        setns(&self.original, self.kind.clone_flag())?;
        if let Some(cwd) = &self.cwd {
            if let Err(e) = fchdir(cwd) {
                tracing::warn!(error = %e, "failed to restore working directory");
            }
        }
        Ok(())
    }
}

/// A thread left inside the container namespace would run every later host
/// operation there, so a failed restore aborts the process.
impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            tracing::error!(
                kind = self.kind.proc_name(),
                error = %e,
                "failed to restore original namespace, aborting"
            );
            std::process::abort();
        }
    }
}

/// Run `f` inside the namespace of `pid`, restoring the caller's namespace afterwards.
pub fn run_in_namespace<T>(
    pid: u32,
    kind: NamespaceKind,
    f: impl FnOnce() -> Result<T, InjectError>,
) -> Result<T, InjectError> {
    let _guard = NamespaceGuard::enter(pid, kind)?;
    f()
}

#[allow(unsafe_code)]
fn setns(ns: &File, flag: libc::c_int) -> io::Result<()> {
    // SAFETY: `ns` is an open namespace descriptor that outlives the call.
    let rc = unsafe { libc::setns(ns.as_raw_fd(), flag) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[allow(unsafe_code)]
fn unshare_fs() -> io::Result<()> {
    // SAFETY: unshare(CLONE_FS) only affects the calling thread's fs attributes.
    let rc = unsafe { libc::unshare(libc::CLONE_FS) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[allow(unsafe_code)]
fn fchdir(dir: &File) -> io::Result<()> {
    // SAFETY: `dir` is an open directory descriptor that outlives the call.
    let rc = unsafe { libc::fchdir(dir.as_raw_fd()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
