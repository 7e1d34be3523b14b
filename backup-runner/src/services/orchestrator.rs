//! Stopping and restarting service groups around a backup.
//!
//! Stopping is two phases. The graceful pass asks each group to stop, in
//! declared order, bounded per group. The forced-stop sweep then looks at
//! what is actually still running and escalates: forced stop, then kill,
//! repeated for a configured number of cycles. Neither phase aborts on
//! failure; problems come back as warnings.
//!
//! Starting checks the outcome too: if nothing is running once every group
//! was started, one more start pass is made over all groups.

use super::{ServiceError, ServiceGroup, ServiceRuntime};
use crate::config::ServicesConfig;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Extra time allowed for a runtime call beyond the grace it was given
const CALL_MARGIN: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Bound on each group's graceful stop
    pub stop_timeout: Duration,
    /// Grace handed to the forced stop
    pub force_stop_timeout: Duration,
    /// Pause after the forced stop and after the kill
    pub sweep_settle: Duration,
    /// Forced stop and kill cycles before giving up on survivors
    pub sweep_attempts: u32,
    /// Bound on each group's start
    pub start_timeout: Duration,
    /// Pause between consecutive group starts
    pub start_delay: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &ServicesConfig) -> Self {
        Self {
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
            force_stop_timeout: Duration::from_secs(config.force_stop_timeout_secs),
            sweep_settle: Duration::from_secs(config.sweep_settle_secs),
            sweep_attempts: config.sweep_attempts.max(1),
            start_timeout: Duration::from_secs(config.start_timeout_secs),
            start_delay: Duration::from_secs(config.start_delay_secs),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&ServicesConfig::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StopReport {
    /// Groups whose graceful stop succeeded
    pub stopped: Vec<String>,
    /// Services still running after the kill
    pub survivors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StartReport {
    pub started: Vec<String>,
    pub failed: Vec<String>,
    /// A second start pass was needed because nothing came up
    pub retried: bool,
    pub warnings: Vec<String>,
}

pub struct ServiceOrchestrator<R> {
    runtime: R,
    settings: OrchestratorSettings,
}

/// Run a bounded runtime call, folding a timeout into a `ServiceError`
async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::new(format!("timed out after {:?}", limit))),
    }
}

fn log_diagnostic(err: &ServiceError) {
    if let Some(diagnostic) = &err.diagnostic {
        debug!("Runtime output: {}", diagnostic);
    }
}

impl<R: ServiceRuntime> ServiceOrchestrator<R> {
    pub fn new(runtime: R, settings: OrchestratorSettings) -> Self {
        Self { runtime, settings }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Graceful pass followed by the forced-stop sweep
    pub async fn stop(&self, groups: &[ServiceGroup]) -> StopReport {
        let mut report = StopReport::default();
        self.graceful_stop(groups, &mut report).await;
        self.force_stop_sweep(groups, &mut report).await;
        report
    }

    pub async fn graceful_stop(&self, groups: &[ServiceGroup], report: &mut StopReport) {
        for group in groups {
            info!(group = %group.name, "Stopping service group");
            match bounded(self.settings.stop_timeout, self.runtime.stop(group)).await {
                Ok(()) => {
                    info!(group = %group.name, "Service group stopped");
                    report.stopped.push(group.name.clone());
                }
                Err(e) => {
                    warn!(group = %group.name, "Graceful stop failed: {}", e);
                    log_diagnostic(&e);
                    report
                        .warnings
                        .push(format!("stop of group {} failed: {}", group.name, e));
                }
            }
        }
    }

    async fn list_running(
        &self,
        groups: &[ServiceGroup],
        warnings: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        match bounded(CALL_MARGIN, self.runtime.running(groups)).await {
            Ok(ids) => Some(ids),
            Err(e) => {
                warn!("Cannot list running services: {}", e);
                log_diagnostic(&e);
                warnings.push(format!("cannot list running services: {}", e));
                None
            }
        }
    }

    /// Escalate against whatever is still running after the graceful pass
    pub async fn force_stop_sweep(&self, groups: &[ServiceGroup], report: &mut StopReport) {
        let Some(mut running) = self.list_running(groups, &mut report.warnings).await else {
            return;
        };

        for attempt in 1..=self.settings.sweep_attempts {
            if running.is_empty() {
                info!("All services stopped");
                return;
            }
            if attempt > 1 {
                warn!(attempt, "Services survived kill, repeating sweep");
            }

            warn!(count = running.len(), "Services still running, forcing stop");
            let grace = self.settings.force_stop_timeout;
            let forced = self.runtime.force_stop(&running, grace);
            if let Err(e) = bounded(grace + CALL_MARGIN, forced).await {
                warn!("Forced stop failed: {}", e);
                log_diagnostic(&e);
                report.warnings.push(format!("forced stop failed: {}", e));
            }
            sleep(self.settings.sweep_settle).await;

            running = match self.list_running(groups, &mut report.warnings).await {
                Some(ids) => ids,
                None => return,
            };
            if running.is_empty() {
                info!("All services stopped after forced stop");
                return;
            }

            warn!(count = running.len(), "Services survived forced stop, killing");
            if let Err(e) = bounded(CALL_MARGIN, self.runtime.kill(&running)).await {
                error!("Kill failed: {}", e);
                log_diagnostic(&e);
                report.warnings.push(format!("kill failed: {}", e));
            }
            sleep(self.settings.sweep_settle).await;

            running = match self.list_running(groups, &mut report.warnings).await {
                Some(ids) => ids,
                None => return,
            };
        }

        if running.is_empty() {
            info!("All services stopped after kill");
            return;
        }
        error!("Services still running after kill: {}", running.join(", "));
        report.warnings.push(format!(
            "services still running after kill: {}",
            running.join(", ")
        ));
        report.survivors = running;
    }

    /// Start groups in the given order, then make sure something came up.
    /// A failure never stops the remaining groups from being started.
    pub async fn start(&self, groups: &[ServiceGroup]) -> StartReport {
        let mut report = StartReport::default();
        self.start_pass(groups, &mut report).await;
        if groups.is_empty() || !self.nothing_running(groups, &mut report.warnings).await {
            return report;
        }

        error!("No services running after start, starting every group again");
        report
            .warnings
            .push("no services running after start, retried every group".to_string());
        report.retried = true;
        report.started.clear();
        report.failed.clear();
        self.start_pass(groups, &mut report).await;

        if self.nothing_running(groups, &mut report.warnings).await {
            error!("No services running after the second start pass");
            report
                .warnings
                .push("no services running after the second start pass".to_string());
        }
        report
    }

    /// True only when the runtime answers and lists nothing
    async fn nothing_running(&self, groups: &[ServiceGroup], warnings: &mut Vec<String>) -> bool {
        match self.list_running(groups, warnings).await {
            Some(running) => {
                debug!(count = running.len(), "Services running after start");
                running.is_empty()
            }
            None => false,
        }
    }

    async fn start_pass(&self, groups: &[ServiceGroup], report: &mut StartReport) {
        for (index, group) in groups.iter().enumerate() {
            if index > 0 && !self.settings.start_delay.is_zero() {
                debug!(
                    group = %group.name,
                    "Waiting {:?} before next service group",
                    self.settings.start_delay
                );
                sleep(self.settings.start_delay).await;
            }

            info!(group = %group.name, "Starting service group");
            match bounded(self.settings.start_timeout, self.runtime.start(group)).await {
                Ok(()) => {
                    info!(group = %group.name, "Service group started");
                    report.started.push(group.name.clone());
                }
                Err(e) => {
                    error!(group = %group.name, "Start failed: {}", e);
                    log_diagnostic(&e);
                    report
                        .warnings
                        .push(format!("start of group {} failed: {}", group.name, e));
                    report.failed.push(group.name.clone());
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeRuntime;
    use super::*;
    use tokio::time::Instant;

    fn groups() -> Vec<ServiceGroup> {
        vec![
            ServiceGroup::new("db", ["db.yaml"]),
            ServiceGroup::new("app", ["app.yaml"]),
            ServiceGroup::new("gateway", ["gateway.yaml"]),
        ]
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            stop_timeout: Duration::from_secs(5),
            force_stop_timeout: Duration::from_secs(3),
            sweep_settle: Duration::from_secs(1),
            sweep_attempts: 1,
            start_timeout: Duration::from_secs(5),
            start_delay: Duration::from_secs(30),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_in_declared_order_with_clean_sweep() {
        let runtime = FakeRuntime::default();
        let orchestrator = ServiceOrchestrator::new(runtime.clone(), settings());

        let report = orchestrator.stop(&groups()).await;

        assert_eq!(report.stopped, ["db", "app", "gateway"]);
        assert!(report.warnings.is_empty());
        assert_eq!(
            runtime.calls(),
            ["stop:db", "stop:app", "stop:gateway", "running"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_failure_does_not_halt_iteration() {
        let runtime = FakeRuntime::default();
        runtime.fail_stop("db");
        runtime.hang_stop("app");
        let orchestrator = ServiceOrchestrator::new(runtime.clone(), settings());

        let report = orchestrator.stop(&groups()).await;

        assert_eq!(report.stopped, ["gateway"]);
        assert_eq!(report.warnings.len(), 2);
        assert!(report.warnings[1].contains("timed out"));
        assert_eq!(
            runtime.calls_starting_with("stop:"),
            ["stop:db", "stop:app", "stop:gateway"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_escalates_to_kill() {
        let runtime = FakeRuntime::default();
        runtime.running_sequence(vec![vec!["c1", "c2"], vec!["c2"], vec!["c2"]]);
        let orchestrator = ServiceOrchestrator::new(runtime.clone(), settings());

        let mut report = StopReport::default();
        orchestrator.force_stop_sweep(&groups(), &mut report).await;

        assert_eq!(
            runtime.calls(),
            ["running", "force_stop:c1,c2", "running", "kill:c2", "running"]
        );
        assert_eq!(report.survivors, ["c2"]);
        assert_eq!(report.warnings.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_stops_after_forced_stop_succeeds() {
        let runtime = FakeRuntime::default();
        runtime.running_sequence(vec![vec!["c1"], vec![]]);
        let orchestrator = ServiceOrchestrator::new(runtime.clone(), settings());

        let mut report = StopReport::default();
        orchestrator.force_stop_sweep(&groups(), &mut report).await;

        assert_eq!(runtime.calls(), ["running", "force_stop:c1", "running"]);
        assert!(report.survivors.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_delays_between_groups_only() {
        let runtime = FakeRuntime::default();
        let orchestrator = ServiceOrchestrator::new(runtime.clone(), settings());

        let begin = Instant::now();
        let report = orchestrator.start(&groups()).await;

        assert_eq!(report.started, ["db", "app", "gateway"]);
        // Two gaps for three groups, none after the last
        assert_eq!(begin.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_continues() {
        let runtime = FakeRuntime::default();
        runtime.fail_start("app");
        let orchestrator = ServiceOrchestrator::new(runtime.clone(), settings());

        let report = orchestrator.start(&groups()).await;

        assert_eq!(report.started, ["db", "gateway"]);
        assert_eq!(report.failed, ["app"]);
        assert!(!report.retried);
        assert_eq!(
            runtime.calls(),
            ["start:db", "start:app", "start:gateway", "running"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_repeats_up_to_configured_attempts() {
        let runtime = FakeRuntime::default();
        runtime.running_sequence(vec![
            vec!["c1"],
            vec!["c1"],
            vec!["c1"],
            vec!["c1"],
            vec!["c1"],
        ]);
        let orchestrator = ServiceOrchestrator::new(
            runtime.clone(),
            OrchestratorSettings {
                sweep_attempts: 2,
                ..settings()
            },
        );

        let mut report = StopReport::default();
        orchestrator.force_stop_sweep(&groups(), &mut report).await;

        assert_eq!(runtime.calls_starting_with("force_stop:").len(), 2);
        assert_eq!(runtime.calls_starting_with("kill:").len(), 2);
        assert_eq!(runtime.calls_starting_with("running").len(), 5);
        assert_eq!(report.survivors, ["c1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_sweep_clears_survivor() {
        let runtime = FakeRuntime::default();
        runtime.running_sequence(vec![vec!["c1"], vec!["c1"], vec!["c1"], vec![]]);
        let orchestrator = ServiceOrchestrator::new(
            runtime.clone(),
            OrchestratorSettings {
                sweep_attempts: 3,
                ..settings()
            },
        );

        let mut report = StopReport::default();
        orchestrator.force_stop_sweep(&groups(), &mut report).await;

        assert_eq!(
            runtime.calls(),
            [
                "running",
                "force_stop:c1",
                "running",
                "kill:c1",
                "running",
                "force_stop:c1",
                "running"
            ]
        );
        assert!(report.survivors.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_retried_when_nothing_comes_up() {
        let runtime = FakeRuntime::default();
        runtime.running_sequence(vec![vec![]]);
        let orchestrator = ServiceOrchestrator::new(runtime.clone(), settings());

        let report = orchestrator.start(&groups()).await;

        assert!(report.retried);
        assert_eq!(report.started, ["db", "app", "gateway"]);
        assert_eq!(runtime.calls_starting_with("start:").len(), 6);
        assert_eq!(runtime.calls_starting_with("running").len(), 2);
        assert_eq!(report.warnings.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_reports_when_retry_also_fails() {
        let runtime = FakeRuntime::default();
        for group in ["db", "app", "gateway"] {
            runtime.fail_start(group);
        }
        let orchestrator = ServiceOrchestrator::new(runtime.clone(), settings());

        let report = orchestrator.start(&groups()).await;

        assert!(report.retried);
        assert_eq!(report.failed, ["db", "app", "gateway"]);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("second start pass")));
    }
}
