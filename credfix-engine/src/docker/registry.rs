//! Registry connectivity: pull a minimal known-good image

use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info};

use super::ReportSection;
use crate::context::ProbeContext;
use crate::execution::ExecutionError;
use crate::model::{Issue, IssueType, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryFailure {
    Timeout,
    Authentication,
    CredentialHelper,
    RateLimited,
    Generic,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrySection {
    pub image: String,
    pub probed: bool,
    pub reachable: Option<bool>,
    pub duration_ms: Option<u128>,
    pub failure: Option<RegistryFailure>,
    pub warnings: Vec<String>,
    pub issues: Vec<Issue>,
    pub error: Option<String>,
}

impl ReportSection for RegistrySection {
    fn fail(&mut self, error: String) {
        self.error = Some(error);
    }

    fn issues(&self) -> &[Issue] {
        &self.issues
    }
}

pub async fn check(ctx: &ProbeContext) -> RegistrySection {
    let settings = &ctx.settings.registry;
    let mut section = RegistrySection {
        image: settings.image.clone(),
        ..Default::default()
    };
    if !settings.probe {
        section.warnings.push("registry probe disabled in settings".to_string());
        return section;
    }

    info!("Probing registry with `docker pull {}`", settings.image);
    let start = Instant::now();
    let result = ctx
        .runner
        .run("docker", &["pull", settings.image.as_str()], ctx.settings.timeouts.registry())
        .await;
    section.probed = true;
    section.duration_ms = Some(start.elapsed().as_millis());

    match result {
        Ok(_) => section.reachable = Some(true),
        Err(e) if e.is_not_found() => {
            section.probed = false;
            section.error = Some("docker CLI not found; registry probe skipped".to_string());
        }
        Err(e) if daemon_unreachable(e.stderr()) => {
            // Reported by the daemon section
            section.probed = false;
            section.error = Some("daemon unreachable; registry probe skipped".to_string());
        }
        Err(e) => {
            section.reachable = Some(false);
            let failure = classify(&e);
            debug!("Registry probe failed ({:?}): {}", failure, e);
            section.failure = Some(failure);
            section.issues.push(failure_issue(failure, &settings.image, e.evidence()));
        }
    }

    section
}

fn daemon_unreachable(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("cannot connect to the docker daemon") || stderr.contains("is the docker daemon running")
}

/// Tell timeouts, authentication and helper failures apart from the rest
pub fn classify(error: &ExecutionError) -> RegistryFailure {
    if matches!(error, ExecutionError::Timeout { .. }) {
        return RegistryFailure::Timeout;
    }
    let stderr = error.stderr().to_lowercase();
    if stderr.contains("error getting credentials") || stderr.contains("credential helper") {
        RegistryFailure::CredentialHelper
    } else if stderr.contains("toomanyrequests") || stderr.contains("rate limit") {
        RegistryFailure::RateLimited
    } else if stderr.contains("unauthorized")
        || stderr.contains("authentication required")
        || stderr.contains("denied")
    {
        RegistryFailure::Authentication
    } else if stderr.contains("timeout") || stderr.contains("i/o timeout") {
        RegistryFailure::Timeout
    } else {
        RegistryFailure::Generic
    }
}

fn failure_issue(failure: RegistryFailure, image: &str, evidence: String) -> Issue {
    match failure {
        RegistryFailure::Timeout => Issue::new(
            "REGISTRY_TIMEOUT",
            IssueType::Network,
            Severity::High,
            format!("Pulling {image} timed out"),
            evidence,
            "Check network connectivity, proxy settings (HTTP_PROXY/HTTPS_PROXY) and DNS",
        ),
        RegistryFailure::Authentication => Issue::new(
            "REGISTRY_AUTH_FAILED",
            IssueType::Network,
            Severity::High,
            format!("Registry rejected the credentials used to pull {image}"),
            evidence,
            "Log in again with `docker login`",
        ),
        RegistryFailure::CredentialHelper => Issue::new(
            "REGISTRY_CREDENTIALS_UNAVAILABLE",
            IssueType::CredentialHelper,
            Severity::High,
            "Docker could not get credentials from the credential helper",
            evidence,
            "Repair the credential helper issues reported above, then retry the pull",
        ),
        RegistryFailure::RateLimited => Issue::new(
            "REGISTRY_RATE_LIMITED",
            IssueType::Network,
            Severity::Medium,
            "Registry pull rate limit reached",
            evidence,
            "Wait for the limit to reset or log in to raise it",
        ),
        RegistryFailure::Generic => Issue::new(
            "REGISTRY_UNREACHABLE",
            IssueType::Network,
            Severity::Medium,
            format!("Could not pull {image}"),
            evidence,
            "Check network connectivity and that the registry is reachable from this host",
        ),
    }
}
