use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "accelinject/config.toml";
const SYSTEM_CONFIG: &str = "/etc/accelinject/config.toml";

/// Hook settings read from TOML. Command-line flags take precedence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HookConfig {
    /// Debug log destination; stderr when unset.
    pub log_file: Option<PathBuf>,
    pub log_level: String,
    pub mount_accelerators: bool,
    pub mount_uverbs: bool,
    pub routes_file: PathBuf,
    pub dev_root: PathBuf,
    pub sys_root: PathBuf,
    pub proc_root: PathBuf,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            log_file: None,
            log_level: "info".to_owned(),
            mount_accelerators: true,
            mount_uverbs: true,
            routes_file: PathBuf::from(accelinject_runtime::netinfo::DEFAULT_ROUTES_SOURCE),
            dev_root: PathBuf::from("/dev"),
            sys_root: PathBuf::from("/sys"),
            proc_root: PathBuf::from("/"),
        }
    }
}

impl HookConfig {
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("reading config {}: {e}", path.display()))?;
        Self::parse(&content).map_err(|e| format!("invalid config {}: {e}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// An explicit path must exist. Otherwise the first default location that
    /// exists is used, falling back to built-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, String> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        for path in default_paths() {
            if path.is_file() {
                return Self::load(&path);
            }
        }
        Ok(Self::default())
    }
}

/// `$XDG_CONFIG_HOME/accelinject/config.toml`, then the system-wide file.
pub fn default_paths() -> Vec<PathBuf> {
    let mut paths = Vec::with_capacity(2);
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        paths.push(PathBuf::from(xdg).join(CONFIG_FILE));
    }
    paths.push(PathBuf::from(SYSTEM_CONFIG));
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = HookConfig::parse("").unwrap();
        assert_eq!(config, HookConfig::default());
        assert!(config.mount_accelerators);
        assert!(config.mount_uverbs);
        assert_eq!(config.routes_file, PathBuf::from("/etc/habanalabs/gaudinet.json"));
    }

    #[test]
    fn partial_config_overrides_fields() {
        let config = HookConfig::parse(
            r#"
log_file = "/var/log/accelinject.log"
log_level = "debug"
mount_uverbs = false
sys_root = "/host/sys"
"#,
        )
        .unwrap();
        assert_eq!(config.log_file, Some(PathBuf::from("/var/log/accelinject.log")));
        assert_eq!(config.log_level, "debug");
        assert!(!config.mount_uverbs);
        assert!(config.mount_accelerators);
        assert_eq!(config.sys_root, PathBuf::from("/host/sys"));
        assert_eq!(config.dev_root, PathBuf::from("/dev"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(HookConfig::parse("mount_everything = true").is_err());
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = HookConfig::resolve(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.contains("nope.toml"));
    }

    #[test]
    fn explicit_config_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "mount_accelerators = false\n").unwrap();
        let config = HookConfig::resolve(Some(&path)).unwrap();
        assert!(!config.mount_accelerators);
    }
}
