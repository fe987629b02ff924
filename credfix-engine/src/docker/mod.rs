//! Docker checker: daemon, configuration, registry, system, permissions, version
//!
//! Every section runs in its own task. A section that panics or fails to
//! complete is reported with its `error` set; the others are unaffected, so
//! the report always has every section populated.

pub mod configuration;
pub mod daemon;
pub mod permissions;
pub mod registry;
pub mod system;
pub mod version;

use serde::Serialize;
use std::future::Future;
use tracing::{error, info};

use crate::context::ProbeContext;
use crate::model::Issue;

pub use configuration::ConfigurationSection;
pub use daemon::DaemonSection;
pub use permissions::PermissionsSection;
pub use registry::RegistrySection;
pub use system::SystemSection;
pub use version::VersionSection;

/// Common shape of a report section
pub trait ReportSection: Default + Send + 'static {
    /// Record that the check itself could not complete
    fn fail(&mut self, error: String);
    fn issues(&self) -> &[Issue];
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DockerReport {
    pub daemon: DaemonSection,
    pub configuration: ConfigurationSection,
    pub registry: RegistrySection,
    pub system: SystemSection,
    pub permissions: PermissionsSection,
    pub version: VersionSection,
}

impl DockerReport {
    /// Issues of every section, in section order
    pub fn issues(&self) -> Vec<Issue> {
        [
            self.daemon.issues(),
            self.configuration.issues(),
            self.registry.issues(),
            self.system.issues(),
            self.permissions.issues(),
            self.version.issues(),
        ]
        .concat()
    }

    /// Sections whose check did not complete
    pub fn errors(&self) -> Vec<String> {
        [
            ("daemon", &self.daemon.error),
            ("configuration", &self.configuration.error),
            ("registry", &self.registry.error),
            ("system", &self.system.error),
            ("permissions", &self.permissions.error),
            ("version", &self.version.error),
        ]
        .into_iter()
        .filter_map(|(name, error)| error.as_ref().map(|e| format!("{name}: {e}")))
        .collect()
    }
}

pub struct DockerChecker {
    ctx: ProbeContext,
}

impl DockerChecker {
    pub fn new(ctx: ProbeContext) -> Self {
        Self { ctx }
    }

    pub async fn run_docker_checks(&self) -> DockerReport {
        info!("Running Docker checks...");
        let ctx = &self.ctx;

        let (daemon, configuration, registry, system, permissions, version) = tokio::join!(
            isolated("daemon", {
                let ctx = ctx.clone();
                async move { daemon::check(&ctx).await }
            }),
            isolated("configuration", {
                let ctx = ctx.clone();
                async move { configuration::check(&ctx).await }
            }),
            isolated("registry", {
                let ctx = ctx.clone();
                async move { registry::check(&ctx).await }
            }),
            isolated("system", {
                let ctx = ctx.clone();
                async move { system::check(&ctx).await }
            }),
            isolated("permissions", {
                let ctx = ctx.clone();
                async move { permissions::check(&ctx).await }
            }),
            isolated("version", {
                let ctx = ctx.clone();
                async move { version::check(&ctx).await }
            }),
        );

        let report = DockerReport {
            daemon,
            configuration,
            registry,
            system,
            permissions,
            version,
        };
        info!(
            "Docker checks complete: {} issues, {} failed sections",
            report.issues().len(),
            report.errors().len()
        );
        report
    }
}

/// Run a section check on its own task; a panic becomes a section error
async fn isolated<S, F>(name: &'static str, check: F) -> S
where
    S: ReportSection,
    F: Future<Output = S> + Send + 'static,
{
    match tokio::spawn(check).await {
        Ok(section) => section,
        Err(e) => {
            error!("Docker check '{}' did not complete: {}", name, e);
            let mut section = S::default();
            section.fail(format!("check did not complete: {e}"));
            section
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IssueType, Severity};

    #[derive(Default)]
    struct Probe {
        issues: Vec<Issue>,
        error: Option<String>,
    }

    impl ReportSection for Probe {
        fn fail(&mut self, error: String) {
            self.error = Some(error);
        }

        fn issues(&self) -> &[Issue] {
            &self.issues
        }
    }

    #[tokio::test]
    async fn test_panicking_section_is_captured() {
        let failed: Probe = isolated("boom", async {
            if true {
                panic!("probe exploded");
            }
            Probe::default()
        })
        .await;
        assert!(failed.error.unwrap().contains("did not complete"));

        let ok: Probe = isolated("fine", async {
            Probe {
                issues: vec![Issue::new("X", IssueType::Daemon, Severity::Low, "x", "x", "x")],
                error: None,
            }
        })
        .await;
        assert_eq!(ok.issues().len(), 1);
        assert!(ok.error.is_none());
    }
}
