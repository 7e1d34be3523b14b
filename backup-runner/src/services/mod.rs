//! Service groups and the runtime that controls them.
//!
//! The orchestrator only sequences calls; everything that touches a real
//! service manager sits behind [`ServiceRuntime`].

pub mod docker;
pub mod orchestrator;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use docker::DockerComposeRuntime;
pub use orchestrator::{OrchestratorSettings, ServiceOrchestrator, StartReport, StopReport};

/// A named set of services stopped and started together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceGroup {
    pub name: String,

    /// Declarative targets understood by the runtime (compose files for
    /// the docker adapter)
    pub targets: Vec<String>,
}

impl ServiceGroup {
    pub fn new<I, S>(name: impl Into<String>, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            targets: targets.into_iter().map(Into::into).collect(),
        }
    }
}

/// Named restart orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartPreset {
    /// Reverse of the stop order
    Reverse,
    /// Same as the stop order
    StopOrder,
}

/// Restart order: a preset, or group names that start first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StartOrder {
    Preset(StartPreset),
    Explicit(Vec<String>),
}

impl Default for StartOrder {
    fn default() -> Self {
        StartOrder::Preset(StartPreset::Reverse)
    }
}

/// A failed runtime call, with the tool's own output when there is any.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ServiceError {
    pub message: String,
    pub diagnostic: Option<String>,
}

impl ServiceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            diagnostic: None,
        }
    }

    pub fn with_diagnostic(message: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        let diagnostic = diagnostic.into();
        Self {
            message: message.into(),
            diagnostic: (!diagnostic.trim().is_empty()).then(|| diagnostic.trim().to_string()),
        }
    }
}

/// Control surface of a service manager.
///
/// Calls report success or a [`ServiceError`]; the orchestrator decides what
/// a failure means. Running state is always observed through `running`,
/// never remembered.
#[allow(async_fn_in_trait)]
pub trait ServiceRuntime {
    /// Gracefully stop every service in the group
    async fn stop(&self, group: &ServiceGroup) -> Result<(), ServiceError>;

    async fn start(&self, group: &ServiceGroup) -> Result<(), ServiceError>;

    /// Identifiers of services in `groups` that are still running
    async fn running(&self, groups: &[ServiceGroup]) -> Result<Vec<String>, ServiceError>;

    /// Stop specific services, allowing `grace` before the runtime escalates
    async fn force_stop(&self, ids: &[String], grace: Duration) -> Result<(), ServiceError>;

    async fn kill(&self, ids: &[String]) -> Result<(), ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        order: StartOrder,
    }

    #[test]
    fn test_start_order_deserialize() {
        let w: Wrapper = toml::from_str(r#"order = "reverse""#).unwrap();
        assert_eq!(w.order, StartOrder::Preset(StartPreset::Reverse));

        let w: Wrapper = toml::from_str(r#"order = "stop-order""#).unwrap();
        assert_eq!(w.order, StartOrder::Preset(StartPreset::StopOrder));

        let w: Wrapper = toml::from_str(r#"order = ["gateway", "media"]"#).unwrap();
        assert_eq!(
            w.order,
            StartOrder::Explicit(vec!["gateway".into(), "media".into()])
        );

        assert!(toml::from_str::<Wrapper>(r#"order = "sideways""#).is_err());
    }

    #[test]
    fn test_blank_diagnostic_dropped() {
        let err = ServiceError::with_diagnostic("failed", "  \n");
        assert_eq!(err.diagnostic, None);
        let err = ServiceError::with_diagnostic("failed", "no such service\n");
        assert_eq!(err.diagnostic.as_deref(), Some("no such service"));
    }
}
