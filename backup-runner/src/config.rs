//! Configuration management for the backup runner.
//!
//! Loads the job configuration from a TOML file. The loaded [`JobConfig`] is
//! immutable for the rest of the run; the passphrase is resolved separately
//! into a [`Passphrase`] so it never sits in a serializable struct.

use crate::archive::builder::{Backoff, RetryPolicy};
use crate::crypto::Passphrase;
use crate::services::{ServiceGroup, StartOrder, StartPreset};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use zeroize::Zeroizing;

/// Environment variable consulted when no passphrase file is configured.
pub const PASSPHRASE_ENV: &str = "BACKUP_PASSPHRASE";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{0}")]
    Invalid(String),

    #[error("passphrase unavailable: {0}")]
    Passphrase(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub job: JobSection,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub services: ServicesConfig,

    #[serde(default)]
    pub permissions: PermissionsConfig,

    #[serde(default)]
    pub preflight: PreflightConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSection {
    /// Paths to include in the archive
    pub sources: Vec<PathBuf>,

    /// Paths (and everything below them) to leave out
    #[serde(default)]
    pub exclude: Vec<PathBuf>,

    /// Directory receiving the encrypted artifacts
    pub backup_dir: PathBuf,

    /// Directory receiving one log file per run
    pub log_dir: PathBuf,

    /// Single-instance lock file
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// File holding the archive passphrase (falls back to BACKUP_PASSPHRASE)
    #[serde(default)]
    pub passphrase_file: Option<PathBuf>,

    /// Walk every phase without touching the system
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Backup artifacts to keep, including the one this run creates
    #[serde(default = "default_keep_backups")]
    pub backups: usize,

    /// Run logs to keep, including the current one
    #[serde(default = "default_keep_logs")]
    pub logs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// zstd compression level (1-22)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Attempts before an archive failure becomes fatal
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay strategy between attempts
    #[serde(default)]
    pub backoff: BackoffConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffConfig {
    None,
    Fixed {
        delay_secs: u64,
    },
    Exponential {
        initial_secs: u64,
        #[serde(default = "default_backoff_factor")]
        factor: u32,
        max_secs: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Stop and restart service groups around the archive step
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bound on each group's graceful stop
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Grace period handed to the forced-stop sweep
    #[serde(default = "default_force_stop_timeout")]
    pub force_stop_timeout_secs: u64,

    /// Pause after the forced stop and after the kill, before re-listing
    #[serde(default = "default_sweep_settle")]
    pub sweep_settle_secs: u64,

    /// Forced stop and kill cycles before survivors are reported
    #[serde(default = "default_sweep_attempts")]
    pub sweep_attempts: u32,

    /// Bound on each group's start
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Settle delay between consecutive group starts
    #[serde(default = "default_start_delay")]
    pub start_delay_secs: u64,

    /// Restart order: "reverse", "stop-order", or an explicit list of group names
    #[serde(default)]
    pub start_order: StartOrder,

    /// Treat any stop warning as fatal (services are still restored)
    #[serde(default)]
    pub strict_stop: bool,

    /// Do not restart services after the run
    #[serde(default)]
    pub leave_down: bool,

    /// Container runtime binary used by the docker adapter
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    /// "down" removes containers, "stop" keeps them
    #[serde(default = "default_shutdown_method")]
    pub shutdown_method: String,

    /// Groups in stop order
    #[serde(default)]
    pub groups: Vec<ServiceGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsConfig {
    /// User owning the finished artifact
    #[serde(default)]
    pub owner: Option<String>,

    /// Group owning the finished artifact
    #[serde(default)]
    pub group: Option<String>,

    /// Mode bits for the finished artifact
    #[serde(default = "default_artifact_mode")]
    pub mode: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightConfig {
    /// Minimum free space on the backup filesystem, in GiB (0 disables)
    #[serde(default = "default_min_free_space_gb")]
    pub min_free_space_gb: u64,

    /// Minimum free space on the backup filesystem, in percent (0 disables)
    #[serde(default = "default_min_free_space_percent")]
    pub min_free_space_percent: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Program and arguments receiving the run summary JSON on stdin
    #[serde(default)]
    pub command: Option<Vec<String>>,

    /// Bound on the notification command
    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_lock_file() -> PathBuf {
    PathBuf::from("/tmp/backup-runner.lock")
}

fn default_keep_backups() -> usize {
    3
}

fn default_keep_logs() -> usize {
    7
}

fn default_compression_level() -> i32 {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_factor() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_stop_timeout() -> u64 {
    120
}

fn default_force_stop_timeout() -> u64 {
    30
}

fn default_sweep_settle() -> u64 {
    2
}

fn default_sweep_attempts() -> u32 {
    2
}

fn default_start_timeout() -> u64 {
    120
}

fn default_start_delay() -> u64 {
    30
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_shutdown_method() -> String {
    "down".to_string()
}

fn default_artifact_mode() -> u32 {
    0o600
}

fn default_min_free_space_gb() -> u64 {
    10
}

fn default_min_free_space_percent() -> u8 {
    5
}

fn default_notify_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            backups: default_keep_backups(),
            logs: default_keep_logs(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compression_level: default_compression_level(),
            max_attempts: default_max_attempts(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::Exponential {
            initial_secs: 10,
            factor: default_backoff_factor(),
            max_secs: 120,
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stop_timeout_secs: default_stop_timeout(),
            force_stop_timeout_secs: default_force_stop_timeout(),
            sweep_settle_secs: default_sweep_settle(),
            sweep_attempts: default_sweep_attempts(),
            start_timeout_secs: default_start_timeout(),
            start_delay_secs: default_start_delay(),
            start_order: StartOrder::default(),
            strict_stop: false,
            leave_down: false,
            docker_bin: default_docker_bin(),
            shutdown_method: default_shutdown_method(),
            groups: Vec::new(),
        }
    }
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            owner: None,
            group: None,
            mode: default_artifact_mode(),
        }
    }
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            min_free_space_gb: default_min_free_space_gb(),
            min_free_space_percent: default_min_free_space_percent(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_notify_timeout(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl BackoffConfig {
    pub fn to_backoff(&self) -> Backoff {
        match *self {
            BackoffConfig::None => Backoff::None,
            BackoffConfig::Fixed { delay_secs } => Backoff::Fixed(Duration::from_secs(delay_secs)),
            BackoffConfig::Exponential {
                initial_secs,
                factor,
                max_secs,
            } => Backoff::Exponential {
                initial: Duration::from_secs(initial_secs),
                factor,
                max: Duration::from_secs(max_secs),
            },
        }
    }
}

impl JobConfig {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: JobConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the run could not honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job.sources.is_empty() {
            return Err(ConfigError::Invalid("job.sources must not be empty".into()));
        }
        if self.retention.backups == 0 {
            return Err(ConfigError::Invalid(
                "retention.backups must keep at least one artifact".into(),
            ));
        }
        if self.retention.logs == 0 {
            return Err(ConfigError::Invalid(
                "retention.logs must keep at least one log".into(),
            ));
        }
        if !(1..=22).contains(&self.archive.compression_level) {
            return Err(ConfigError::Invalid(format!(
                "archive.compression_level must be within 1-22, got {}",
                self.archive.compression_level
            )));
        }
        if self.archive.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "archive.max_attempts must be at least 1".into(),
            ));
        }
        if let BackoffConfig::Exponential { factor: 0, .. } = self.archive.backoff {
            return Err(ConfigError::Invalid(
                "archive.backoff.factor must be at least 1".into(),
            ));
        }
        if self.services.sweep_attempts == 0 {
            return Err(ConfigError::Invalid(
                "services.sweep_attempts must be at least 1".into(),
            ));
        }
        if self.permissions.mode > 0o7777 {
            return Err(ConfigError::Invalid(format!(
                "permissions.mode {:o} is not a valid mode",
                self.permissions.mode
            )));
        }
        if self.preflight.min_free_space_percent > 100 {
            return Err(ConfigError::Invalid(
                "preflight.min_free_space_percent must be within 0-100".into(),
            ));
        }
        if !matches!(self.services.shutdown_method.as_str(), "down" | "stop") {
            return Err(ConfigError::Invalid(format!(
                "services.shutdown_method must be \"down\" or \"stop\", got {:?}",
                self.services.shutdown_method
            )));
        }
        if matches!(&self.notify.command, Some(cmd) if cmd.is_empty()) {
            return Err(ConfigError::Invalid(
                "notify.command must name a program".into(),
            ));
        }

        let mut names = HashSet::new();
        for group in &self.services.groups {
            if group.name.trim().is_empty() {
                return Err(ConfigError::Invalid("service group names must not be empty".into()));
            }
            if !names.insert(group.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "service group {:?} is declared twice",
                    group.name
                )));
            }
        }
        if let StartOrder::Explicit(order) = &self.services.start_order {
            for name in order {
                if !names.contains(name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "services.start_order names unknown group {:?}",
                        name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Groups in the order they are stopped
    pub fn stop_order(&self) -> Vec<ServiceGroup> {
        self.services.groups.clone()
    }

    /// Groups in the order they are restarted.
    ///
    /// An explicit order may name only the groups that need priority; the
    /// rest follow in stop order so no group is left down.
    pub fn start_order(&self) -> Vec<ServiceGroup> {
        let groups = &self.services.groups;
        match &self.services.start_order {
            StartOrder::Preset(StartPreset::Reverse) => groups.iter().rev().cloned().collect(),
            StartOrder::Preset(StartPreset::StopOrder) => groups.clone(),
            StartOrder::Explicit(order) => {
                let mut ordered: Vec<ServiceGroup> = order
                    .iter()
                    .filter_map(|name| groups.iter().find(|g| &g.name == name))
                    .cloned()
                    .collect();
                for group in groups {
                    if !order.contains(&group.name) {
                        ordered.push(group.clone());
                    }
                }
                ordered
            }
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.archive.max_attempts,
            backoff: self.archive.backoff.to_backoff(),
        }
    }

    /// Resolve the archive passphrase from the configured file or environment
    pub fn load_passphrase(&self) -> Result<Passphrase, ConfigError> {
        // Wiped on drop, along with the trailing newline trimmed off below
        let raw = Zeroizing::new(match &self.job.passphrase_file {
            Some(path) => {
                warn_if_exposed(path);
                std::fs::read_to_string(path).map_err(|e| {
                    ConfigError::Passphrase(format!("cannot read {}: {}", path.display(), e))
                })?
            }
            None => std::env::var(PASSPHRASE_ENV).map_err(|_| {
                ConfigError::Passphrase(format!(
                    "set job.passphrase_file or the {} environment variable",
                    PASSPHRASE_ENV
                ))
            })?,
        });

        let passphrase = Passphrase::new(raw.trim_end_matches(['\r', '\n']));
        if passphrase.is_empty() {
            return Err(ConfigError::Passphrase("passphrase is empty".into()));
        }
        Ok(passphrase)
    }
}

/// Passphrase files should not be readable by group or others
#[cfg(unix)]
fn warn_if_exposed(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(metadata) = std::fs::metadata(path) {
        let mode = metadata.permissions().mode();
        if mode & 0o077 != 0 {
            tracing::warn!(
                "Passphrase file {} has mode {:o}; restrict it with chmod 600",
                path.display(),
                mode & 0o777
            );
        }
    }
}

#[cfg(not(unix))]
fn warn_if_exposed(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
        [job]
        sources = ["/etc/ssh", "/opt/stacks"]
        backup_dir = "/backups"
        log_dir = "/var/log/backup-runner"
    "#;

    fn parse(toml_text: &str) -> JobConfig {
        toml::from_str(toml_text).unwrap()
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse(MINIMAL);
        config.validate().unwrap();

        assert_eq!(config.retention.backups, 3);
        assert_eq!(config.retention.logs, 7);
        assert_eq!(config.archive.compression_level, 3);
        assert_eq!(config.archive.max_attempts, 3);
        assert_eq!(config.permissions.mode, 0o600);
        assert_eq!(config.services.start_order, StartOrder::Preset(StartPreset::Reverse));
        assert!(config.services.enabled);
        assert!(!config.job.dry_run);
        assert_eq!(config.job.lock_file, PathBuf::from("/tmp/backup-runner.lock"));
    }

    #[test]
    fn test_full_config() {
        let config = parse(
            r#"
            [job]
            sources = ["/opt/docker"]
            exclude = ["/opt/docker/cache"]
            backup_dir = "/backups"
            log_dir = "/logs"
            dry_run = true

            [retention]
            backups = 5
            logs = 14

            [archive]
            compression_level = 9
            max_attempts = 4
            backoff = { kind = "fixed", delay_secs = 15 }

            [services]
            start_delay_secs = 10
            start_order = ["gateway"]
            strict_stop = true
            sweep_attempts = 3

            [[services.groups]]
            name = "media"
            targets = ["/stacks/media/compose.yaml"]

            [[services.groups]]
            name = "gateway"
            targets = ["/stacks/gateway/compose.yaml"]

            [permissions]
            owner = "backup"
            mode = 0o640
            "#,
        );
        config.validate().unwrap();

        assert!(config.job.dry_run);
        assert_eq!(config.job.exclude, vec![PathBuf::from("/opt/docker/cache")]);
        assert_eq!(config.retention.backups, 5);
        assert_eq!(config.archive.backoff, BackoffConfig::Fixed { delay_secs: 15 });
        assert_eq!(config.permissions.mode, 0o640);
        assert!(config.services.strict_stop);
        assert_eq!(config.services.sweep_attempts, 3);

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.backoff, Backoff::Fixed(Duration::from_secs(15)));
    }

    #[test]
    fn test_start_order_variants() {
        let mut config = parse(
            r#"
            [job]
            sources = ["/data"]
            backup_dir = "/backups"
            log_dir = "/logs"

            [[services.groups]]
            name = "db"
            targets = ["db.yaml"]

            [[services.groups]]
            name = "app"
            targets = ["app.yaml"]

            [[services.groups]]
            name = "gateway"
            targets = ["gateway.yaml"]
            "#,
        );
        let names = |groups: Vec<ServiceGroup>| -> Vec<String> {
            groups.into_iter().map(|g| g.name).collect()
        };

        assert_eq!(names(config.stop_order()), ["db", "app", "gateway"]);
        assert_eq!(names(config.start_order()), ["gateway", "app", "db"]);

        config.services.start_order = StartOrder::Preset(StartPreset::StopOrder);
        assert_eq!(names(config.start_order()), ["db", "app", "gateway"]);

        // Unlisted groups follow in stop order
        config.services.start_order = StartOrder::Explicit(vec!["gateway".into()]);
        assert_eq!(names(config.start_order()), ["gateway", "db", "app"]);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = parse(MINIMAL);
        config.retention.backups = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = parse(MINIMAL);
        config.archive.compression_level = 23;
        assert!(config.validate().is_err());

        let mut config = parse(MINIMAL);
        config.archive.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = parse(MINIMAL);
        config.job.sources.clear();
        assert!(config.validate().is_err());

        let mut config = parse(MINIMAL);
        config.services.sweep_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = parse(MINIMAL);
        config.services.start_order = StartOrder::Explicit(vec!["missing".into()]);
        assert!(config.validate().is_err());

        let mut config = parse(MINIMAL);
        config.services.groups = vec![
            ServiceGroup::new("web", ["a.yaml"]),
            ServiceGroup::new("web", ["b.yaml"]),
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_reports_parse_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job.toml");
        std::fs::write(&path, "[job]\nsources = 5\n").unwrap();

        let err = JobConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));

        let err = JobConfig::from_file(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_passphrase_from_file_strips_newline() {
        let dir = TempDir::new().unwrap();
        let secret = dir.path().join("secret");
        std::fs::write(&secret, "correct horse battery staple\n").unwrap();

        let mut config = parse(MINIMAL);
        config.job.passphrase_file = Some(secret.clone());
        let passphrase = config.load_passphrase().unwrap();
        assert_eq!(passphrase.expose(), "correct horse battery staple");

        std::fs::write(&secret, "windows line\r\n").unwrap();
        assert_eq!(config.load_passphrase().unwrap().expose(), "windows line");

        std::fs::write(&secret, "\n").unwrap();
        assert!(matches!(
            config.load_passphrase(),
            Err(ConfigError::Passphrase(_))
        ));
    }
}
