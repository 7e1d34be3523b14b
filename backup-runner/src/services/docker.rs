//! `docker compose` adapter.
//!
//! Each group target is a compose file. Graceful stop is `compose down` (or
//! `compose stop`), the sweep lists containers with `compose ps -q` and
//! escalates with `docker stop -t` and `docker kill` on container ids.

use super::{ServiceError, ServiceGroup, ServiceRuntime};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMethod {
    /// Stop and remove containers
    Down,
    /// Stop containers, keep them
    Stop,
}

impl ShutdownMethod {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "down" => Some(ShutdownMethod::Down),
            "stop" => Some(ShutdownMethod::Stop),
            _ => None,
        }
    }

    fn verb(self) -> &'static str {
        match self {
            ShutdownMethod::Down => "down",
            ShutdownMethod::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DockerComposeRuntime {
    docker_bin: String,
    method: ShutdownMethod,
}

impl DockerComposeRuntime {
    pub fn new(docker_bin: impl Into<String>, method: ShutdownMethod) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            method,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, ServiceError> {
        let rendered = format!("{} {}", self.docker_bin, args.join(" "));
        debug!("Running: {}", rendered);

        let output = Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ServiceError::new(format!("cannot run `{}`: {}", rendered, e)))?;

        if !output.status.success() {
            return Err(ServiceError::with_diagnostic(
                format!("`{}` failed with {}", rendered, output.status),
                String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run `compose -f <target> <verb...>` for every target of a group,
    /// attempting all targets even when one fails.
    async fn compose_each(&self, group: &ServiceGroup, verb: &[&str]) -> Result<(), ServiceError> {
        let mut failures = Vec::new();
        let mut diagnostics = Vec::new();

        for target in &group.targets {
            if !Path::new(target).exists() {
                failures.push(format!("compose file {} not found", target));
                continue;
            }
            let mut args = vec!["compose", "-f", target.as_str()];
            args.extend_from_slice(verb);
            if let Err(e) = self.run(&args).await {
                failures.push(e.message);
                diagnostics.extend(e.diagnostic);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::with_diagnostic(
                failures.join("; "),
                diagnostics.join("\n"),
            ))
        }
    }
}

impl ServiceRuntime for DockerComposeRuntime {
    async fn stop(&self, group: &ServiceGroup) -> Result<(), ServiceError> {
        self.compose_each(group, &[self.method.verb()]).await
    }

    async fn start(&self, group: &ServiceGroup) -> Result<(), ServiceError> {
        self.compose_each(group, &["up", "-d"]).await
    }

    async fn running(&self, groups: &[ServiceGroup]) -> Result<Vec<String>, ServiceError> {
        let mut ids: Vec<String> = Vec::new();
        for target in groups.iter().flat_map(|g| g.targets.iter()) {
            if !Path::new(target).exists() {
                continue;
            }
            let stdout = self.run(&["compose", "-f", target.as_str(), "ps", "-q"]).await?;
            for id in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
                if !ids.iter().any(|known| known == id) {
                    ids.push(id.to_string());
                }
            }
        }
        Ok(ids)
    }

    async fn force_stop(&self, ids: &[String], grace: Duration) -> Result<(), ServiceError> {
        if ids.is_empty() {
            return Ok(());
        }
        let grace = grace.as_secs().to_string();
        let mut args = vec!["stop", "-t", grace.as_str()];
        args.extend(ids.iter().map(String::as_str));
        self.run(&args).await.map(|_| ())
    }

    async fn kill(&self, ids: &[String]) -> Result<(), ServiceError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut args = vec!["kill"];
        args.extend(ids.iter().map(String::as_str));
        self.run(&args).await.map(|_| ())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Stand-in `docker` that records its arguments and answers `ps -q`.
    fn fake_docker(dir: &TempDir, exit_code: i32) -> (PathBuf, PathBuf) {
        let log = dir.path().join("calls.log");
        let script = dir.path().join("docker");
        fs::write(
            &script,
            format!(
                concat!(
                    "#!/bin/sh\n",
                    "echo \"$*\" >> '{log}'\n",
                    "case \"$*\" in *\"ps -q\"*) echo abc123; echo def456;; esac\n",
                    "[ {code} -ne 0 ] && echo 'daemon unreachable' >&2\n",
                    "exit {code}\n",
                ),
                log = log.display(),
                code = exit_code
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        (script, log)
    }

    fn compose_file(dir: &TempDir, name: &str) -> String {
        let path = dir.path().join(name);
        fs::write(&path, "services: {}\n").unwrap();
        path.to_string_lossy().into_owned()
    }

    fn calls(log: &Path) -> Vec<String> {
        fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    #[tokio::test]
    async fn test_compose_commands() {
        let dir = TempDir::new().unwrap();
        let (docker, log) = fake_docker(&dir, 0);
        let file = compose_file(&dir, "media.yaml");
        let group = ServiceGroup::new("media", [file.clone()]);
        let runtime = DockerComposeRuntime::new(docker.to_string_lossy(), ShutdownMethod::Down);

        runtime.stop(&group).await.unwrap();
        runtime.start(&group).await.unwrap();
        let running = runtime.running(std::slice::from_ref(&group)).await.unwrap();
        runtime
            .force_stop(&running, Duration::from_secs(30))
            .await
            .unwrap();
        runtime.kill(&running).await.unwrap();

        assert_eq!(running, ["abc123", "def456"]);
        assert_eq!(
            calls(&log),
            [
                format!("compose -f {} down", file),
                format!("compose -f {} up -d", file),
                format!("compose -f {} ps -q", file),
                "stop -t 30 abc123 def456".to_string(),
                "kill abc123 def456".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_carries_diagnostic() {
        let dir = TempDir::new().unwrap();
        let (docker, _log) = fake_docker(&dir, 1);
        let group = ServiceGroup::new("media", [compose_file(&dir, "media.yaml")]);
        let runtime = DockerComposeRuntime::new(docker.to_string_lossy(), ShutdownMethod::Stop);

        let err = runtime.stop(&group).await.unwrap_err();
        assert!(err.message.contains("stop"));
        assert_eq!(err.diagnostic.as_deref(), Some("daemon unreachable"));
    }

    #[tokio::test]
    async fn test_missing_compose_file_reported_other_targets_still_run() {
        let dir = TempDir::new().unwrap();
        let (docker, log) = fake_docker(&dir, 0);
        let present = compose_file(&dir, "present.yaml");
        let group = ServiceGroup::new(
            "mixed",
            ["/nonexistent/compose.yaml".to_string(), present.clone()],
        );
        let runtime = DockerComposeRuntime::new(docker.to_string_lossy(), ShutdownMethod::Down);

        let err = runtime.stop(&group).await.unwrap_err();
        assert!(err.message.contains("not found"));
        assert_eq!(calls(&log), [format!("compose -f {} down", present)]);
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let runtime = DockerComposeRuntime::new("/nonexistent/docker", ShutdownMethod::Down);
        let err = runtime.kill(&["abc".to_string()]).await.unwrap_err();
        assert!(err.message.contains("cannot run"));
    }

    #[test]
    fn test_shutdown_method_parse() {
        assert_eq!(ShutdownMethod::parse("down"), Some(ShutdownMethod::Down));
        assert_eq!(ShutdownMethod::parse("stop"), Some(ShutdownMethod::Stop));
        assert_eq!(ShutdownMethod::parse("halt"), None);
    }
}
