use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Mount table consulted when none is configured.
pub const DEFAULT_MOUNT_TABLE: &str = "/proc/self/mounts";

/// Configuration as loaded from an optional TOML file, before CLI overrides.
///
/// Every field is optional at this layer; required values are enforced by
/// [`DaemonConfig::into_settings`] once the CLI has been merged in.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    pub mountpoint: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub unmount_command: Option<String>,
    pub match_cmdline: bool,
    pub mount_table: PathBuf,
    pub rescan_interval_secs: u64,
    pub state_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            mountpoint: None,
            timeout_secs: None,
            unmount_command: None,
            match_cmdline: false,
            mount_table: PathBuf::from(DEFAULT_MOUNT_TABLE),
            rescan_interval_secs: 60,
            state_dir: None,
            log_file: None,
        }
    }
}

/// Validated, immutable settings for one daemon instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub mountpoint: PathBuf,
    pub timeout: Duration,
    pub unmount_command: String,
    pub match_cmdline: bool,
    pub mount_table: PathBuf,
    pub rescan_interval: Duration,
    pub state_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

impl DaemonConfig {
    /// Load a config file. The caller decides whether a missing file is acceptable.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(path, &contents)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Check required fields and turn the merged config into [`Settings`].
    pub fn into_settings(self) -> Result<Settings, ConfigError> {
        let mountpoint = self
            .mountpoint
            .ok_or(ConfigError::Missing { field: "mountpoint" })?;
        if !mountpoint.is_absolute() {
            return Err(ConfigError::Invalid {
                field: "mountpoint",
                reason: format!("{} is not an absolute path", mountpoint.display()),
            });
        }

        let timeout_secs = self
            .timeout_secs
            .ok_or(ConfigError::Missing { field: "timeout" })?;
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "timeout",
                reason: "must be at least one second".to_string(),
            });
        }

        let unmount_command = self
            .unmount_command
            .map(|c| c.trim().to_string())
            .ok_or(ConfigError::Missing {
                field: "unmount_command",
            })?;
        if unmount_command.is_empty() {
            return Err(ConfigError::Invalid {
                field: "unmount_command",
                reason: "must not be empty".to_string(),
            });
        }

        if self.rescan_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "rescan_interval_secs",
                reason: "must be at least one second".to_string(),
            });
        }

        Ok(Settings {
            mountpoint: normalize(&mountpoint),
            timeout: Duration::from_secs(timeout_secs),
            unmount_command,
            match_cmdline: self.match_cmdline,
            mount_table: self.mount_table,
            rescan_interval: Duration::from_secs(self.rescan_interval_secs),
            state_dir: self.state_dir,
            log_file: self.log_file,
        })
    }
}

impl Settings {
    /// Anchor relative file paths at the current directory, so they survive
    /// the daemon changing into `/`.
    pub fn resolve_paths(&mut self) -> std::io::Result<()> {
        self.mount_table = std::path::absolute(&self.mount_table)?;
        for path in [&mut self.state_dir, &mut self.log_file].into_iter().flatten() {
            *path = std::path::absolute(&*path)?;
        }
        Ok(())
    }
}

/// Drop trailing separators and `.` components so prefix tests and mount-table
/// comparisons see one spelling of the mountpoint.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Missing {
        field: &'static str,
    },
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Missing { field } => write!(f, "missing required setting: {field}"),
            ConfigError::Invalid { field, reason } => write!(f, "invalid {field}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Missing { .. } | ConfigError::Invalid { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> DaemonConfig {
        DaemonConfig {
            mountpoint: Some(PathBuf::from("/mnt/data")),
            timeout_secs: Some(5),
            unmount_command: Some("umount".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.mount_table, PathBuf::from("/proc/self/mounts"));
        assert_eq!(config.rescan_interval_secs, 60);
        assert!(!config.match_cmdline);
        assert!(config.mountpoint.is_none());
    }

    #[test]
    fn test_parse_full_file() {
        let toml = r#"
mountpoint = "/mnt/data"
timeout_secs = 300
unmount_command = "fusermount -u"
match_cmdline = true
mount_table = "/etc/mtab"
rescan_interval_secs = 10
state_dir = "/run/idle-unmountd"
log_file = "/var/log/idle-unmountd.log"
"#;
        let config = DaemonConfig::parse(Path::new("test.toml"), toml).unwrap();
        assert_eq!(config.mountpoint, Some(PathBuf::from("/mnt/data")));
        assert_eq!(config.timeout_secs, Some(300));
        assert_eq!(config.unmount_command.as_deref(), Some("fusermount -u"));
        assert!(config.match_cmdline);
        assert_eq!(config.mount_table, PathBuf::from("/etc/mtab"));
        assert_eq!(config.rescan_interval_secs, 10);
        assert_eq!(config.state_dir, Some(PathBuf::from("/run/idle-unmountd")));
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let config = DaemonConfig::parse(Path::new("t.toml"), "timeout_secs = 7\n").unwrap();
        assert_eq!(config.timeout_secs, Some(7));
        assert_eq!(config.mount_table, PathBuf::from(DEFAULT_MOUNT_TABLE));
    }

    #[test]
    fn test_parse_rejects_unknown_types() {
        let err = DaemonConfig::parse(Path::new("bad.toml"), "timeout_secs = \"soon\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = DaemonConfig::load(Path::new("/nonexistent/idle-unmountd.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_into_settings() {
        let settings = complete().into_settings().unwrap();
        assert_eq!(settings.mountpoint, PathBuf::from("/mnt/data"));
        assert_eq!(settings.timeout, Duration::from_secs(5));
        assert_eq!(settings.unmount_command, "umount");
        assert_eq!(settings.rescan_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_mountpoint_trailing_slash_normalized() {
        let config = DaemonConfig {
            mountpoint: Some(PathBuf::from("/mnt/data/./")),
            ..complete()
        };
        let settings = config.into_settings().unwrap();
        assert_eq!(settings.mountpoint.as_os_str(), "/mnt/data");
    }

    #[test]
    fn test_resolve_paths_makes_relative_paths_absolute() {
        let mut settings = DaemonConfig {
            mount_table: PathBuf::from("mounts"),
            state_dir: Some(PathBuf::from("state")),
            log_file: Some(PathBuf::from("/var/log/idle.log")),
            ..complete()
        }
        .into_settings()
        .unwrap();
        settings.resolve_paths().unwrap();

        let cwd = std::env::current_dir().unwrap();
        assert_eq!(settings.mount_table, cwd.join("mounts"));
        assert_eq!(settings.state_dir, Some(cwd.join("state")));
        assert_eq!(settings.log_file, Some(PathBuf::from("/var/log/idle.log")));
    }

    #[test]
    fn test_missing_required_fields() {
        let err = DaemonConfig::default().into_settings().unwrap_err();
        assert!(matches!(err, ConfigError::Missing { field: "mountpoint" }));

        let err = DaemonConfig {
            timeout_secs: None,
            ..complete()
        }
        .into_settings()
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing { field: "timeout" }));

        let err = DaemonConfig {
            unmount_command: None,
            ..complete()
        }
        .into_settings()
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing { field: "unmount_command" }));
    }

    #[test]
    fn test_invalid_values() {
        let relative = DaemonConfig {
            mountpoint: Some(PathBuf::from("mnt/data")),
            ..complete()
        };
        assert!(matches!(
            relative.into_settings(),
            Err(ConfigError::Invalid { field: "mountpoint", .. })
        ));

        let zero = DaemonConfig {
            timeout_secs: Some(0),
            ..complete()
        };
        assert!(matches!(
            zero.into_settings(),
            Err(ConfigError::Invalid { field: "timeout", .. })
        ));

        let blank = DaemonConfig {
            unmount_command: Some("   ".to_string()),
            ..complete()
        };
        assert!(matches!(
            blank.into_settings(),
            Err(ConfigError::Invalid { field: "unmount_command", .. })
        ));

        let rescan = DaemonConfig {
            rescan_interval_secs: 0,
            ..complete()
        };
        assert!(matches!(
            rescan.into_settings(),
            Err(ConfigError::Invalid {
                field: "rescan_interval_secs",
                ..
            })
        ));
    }
}
