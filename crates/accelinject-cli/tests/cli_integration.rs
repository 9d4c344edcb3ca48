//! CLI subprocess integration tests.
//!
//! These tests invoke the `accelinject` binary as a subprocess and verify
//! exit codes, stdout content, and JSON output.

use std::path::{Path, PathBuf};
use std::process::Command;

fn accelinject_bin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_accelinject"));
    cmd.env_remove("ACCELINJECT_LOG");
    cmd.env("XDG_CONFIG_HOME", "/nonexistent-accelinject-config");
    cmd
}

/// Config pointing discovery at an isolated tree under `dir`.
fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("config.toml");
    std::fs::create_dir_all(dir.join("dev")).unwrap();
    std::fs::write(
        &path,
        format!(
            "dev_root = \"{}\"\nsys_root = \"{}\"\nproc_root = \"{}\"\n",
            dir.join("dev").display(),
            dir.join("sys").display(),
            dir.join("host").display()
        ),
    )
    .unwrap();
    path
}

#[test]
fn cli_version_exits_zero() {
    let output = accelinject_bin().arg("--version").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("accelinject"), "version output: {stdout}");
}

#[test]
fn cli_help_lists_commands() {
    let output = accelinject_bin().arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["hook", "devices", "doctor"] {
        assert!(stdout.contains(command), "help should list {command}: {stdout}");
    }
}

#[test]
fn cli_hook_rejects_zero_pid() {
    let output = accelinject_bin()
        .args(["hook", "--pid", "0", "/run/ctr/rootfs"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn cli_hook_rejects_bad_device_list() {
    let output = accelinject_bin()
        .args(["hook", "--pid", "10", "--device", "0,gpu", "/run/ctr/rootfs"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("gpu"), "stderr: {stderr}");
}

#[test]
fn cli_hook_rejects_unknown_hook_kind() {
    let output = accelinject_bin()
        .args(["hook", "--pid", "10", "--hook", "poststop", "/run/ctr/rootfs"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn cli_hook_without_devices_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let log = dir.path().join("hook.log");

    let output = accelinject_bin()
        .arg("--config")
        .arg(&config)
        .arg("--log-file")
        .arg(&log)
        .args(["hook", "--pid", "10", "--hook", "prestart"])
        .arg(dir.path().join("rootfs"))
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let log = std::fs::read_to_string(log).unwrap();
    assert!(log.contains("no accelerator devices found"), "log: {log}");
}

#[test]
fn cli_hook_without_cgroup_entries_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let accel = dir.path().join("dev/accel");
    std::fs::create_dir_all(&accel).unwrap();
    std::os::unix::fs::symlink("/dev/null", accel.join("accel0")).unwrap();
    let proc_dir = dir.path().join("host/proc/10");
    std::fs::create_dir_all(&proc_dir).unwrap();
    std::fs::write(proc_dir.join("cgroup"), "3:cpu:/a\n2:memory:/a\n").unwrap();
    let log = dir.path().join("hook.log");
    let rootfs = dir.path().join("rootfs");

    let output = accelinject_bin()
        .arg("--config")
        .arg(&config)
        .arg("--log-file")
        .arg(&log)
        .args(["hook", "--pid", "10", "--hook", "prestart"])
        .arg(&rootfs)
        .output()
        .unwrap();
    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let log = std::fs::read_to_string(log).unwrap();
    assert!(
        log.contains("no devices or unified cgroup entries found for pid 10"),
        "log: {log}"
    );
    assert!(!rootfs.exists());
}

#[test]
fn cli_hook_with_malformed_cgroup_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let accel = dir.path().join("dev/accel");
    std::fs::create_dir_all(&accel).unwrap();
    std::os::unix::fs::symlink("/dev/null", accel.join("accel0")).unwrap();
    let proc_dir = dir.path().join("host/proc/10");
    std::fs::create_dir_all(&proc_dir).unwrap();
    std::fs::write(proc_dir.join("cgroup"), "4:devices\n").unwrap();

    let output = accelinject_bin()
        .arg("--config")
        .arg(&config)
        .args(["hook", "--pid", "10", "--hook", "prestart"])
        .arg(dir.path().join("rootfs"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn cli_missing_explicit_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = accelinject_bin()
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg("devices")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn cli_devices_json_lists_identities() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let accel = dir.path().join("dev/accel");
    std::fs::create_dir_all(&accel).unwrap();
    std::os::unix::fs::symlink("/dev/null", accel.join("accel0")).unwrap();
    std::os::unix::fs::symlink("/dev/zero", accel.join("accel1")).unwrap();

    let output = accelinject_bin()
        .arg("--config")
        .arg(&config)
        .args(["devices", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let devices: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let devices = devices.as_array().unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0]["id"], "0");
    assert_eq!(devices[0]["major"], 1);
    assert_eq!(devices[0]["minor"], 3);
    assert_eq!(devices[1]["minor"], 5);
}

#[test]
fn cli_devices_empty_host() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let output = accelinject_bin()
        .arg("--config")
        .arg(&config)
        .arg("devices")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("no accelerator devices found"));
}

#[test]
fn cli_doctor_reports_status() {
    let output = accelinject_bin().arg("doctor").output().unwrap();
    let code = output.status.code();
    assert!(code == Some(0) || code == Some(1), "unexpected exit: {code:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("all prerequisites satisfied") || stdout.contains("missing prerequisites"),
        "stdout: {stdout}"
    );
}
