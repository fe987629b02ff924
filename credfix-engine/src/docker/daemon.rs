use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::ReportSection;
use crate::context::ProbeContext;
use crate::execution::ExecutionError;
use crate::model::{Issue, IssueType, Severity};
use crate::platform::OsFamily;
use crate::repair::FixAction;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DaemonSection {
    pub running: bool,
    pub version: Option<String>,
    pub api_version: Option<String>,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub issues: Vec<Issue>,
    pub error: Option<String>,
}

impl ReportSection for DaemonSection {
    fn fail(&mut self, error: String) {
        self.error = Some(error);
    }

    fn issues(&self) -> &[Issue] {
        &self.issues
    }
}

pub async fn check(ctx: &ProbeContext) -> DaemonSection {
    let mut section = DaemonSection::default();

    match ctx.run("docker", &["version", "--format", "{{json .}}"]).await {
        Ok(output) => {
            let server = serde_json::from_str::<Value>(output.stdout.trim())
                .ok()
                .and_then(|v| v.get("Server").cloned())
                .filter(|s| !s.is_null());
            match server {
                Some(server) => {
                    let field = |key: &str| server.get(key).and_then(Value::as_str).map(str::to_string);
                    section.running = true;
                    section.version = field("Version");
                    section.api_version = field("ApiVersion");
                    section.os = field("Os");
                    section.arch = field("Arch");
                    debug!("Docker daemon {:?} running", section.version);
                }
                None => {
                    section.issues.push(not_running(ctx, "docker version: no server section in output".to_string()));
                }
            }
        }
        Err(e) if e.is_not_found() => {
            section.issues.push(Issue::new(
                "DOCKER_NOT_INSTALLED",
                IssueType::Daemon,
                Severity::High,
                "Docker CLI is not installed or not on PATH",
                e.evidence(),
                "Install Docker Engine or Docker Desktop for this platform",
            ));
        }
        Err(e @ ExecutionError::Timeout { .. }) => {
            warn!("Docker daemon did not answer: {}", e);
            section.issues.push(Issue::new(
                "DAEMON_UNRESPONSIVE",
                IssueType::Daemon,
                Severity::High,
                "Docker daemon did not respond in time",
                e.evidence(),
                "The daemon may be starting or hung; wait a moment or restart it",
            ));
        }
        Err(e) => section.issues.push(not_running(ctx, e.evidence())),
    }

    section
}

fn not_running(ctx: &ProbeContext, evidence: String) -> Issue {
    Issue::new(
        "DAEMON_NOT_RUNNING",
        IssueType::Daemon,
        Severity::High,
        "Docker daemon is not running",
        evidence,
        start_suggestion(ctx.os),
    )
    .fixable_by(FixAction::StartDaemon)
}

pub fn start_suggestion(os: OsFamily) -> &'static str {
    match os {
        OsFamily::Linux => "Start the daemon with `sudo systemctl start docker`",
        OsFamily::MacOs => "Start Docker Desktop with `open -a Docker`",
        OsFamily::Windows => "Start Docker Desktop from the Start menu or `Start-Process 'Docker Desktop'`",
        OsFamily::Other => "Start the Docker daemon",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context, ScriptRunner};

    const VERSION_JSON: &str = r#"{"Client":{"Version":"27.1.1","ApiVersion":"1.46"},"Server":{"Version":"27.1.1","ApiVersion":"1.46","Os":"linux","Arch":"amd64"}}"#;

    #[tokio::test]
    async fn test_running_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::new().ok("docker version --format '{{json .}}'", VERSION_JSON);
        let section = check(&test_context(&dir, runner)).await;
        assert!(section.running);
        assert_eq!(section.api_version.as_deref(), Some("1.46"));
        assert_eq!(section.arch.as_deref(), Some("amd64"));
        assert!(section.issues.is_empty());
    }

    #[tokio::test]
    async fn test_stopped_daemon_is_fixable() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::new().exit(
            "docker version --format '{{json .}}'",
            1,
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?",
        );
        let section = check(&test_context(&dir, runner)).await;
        assert!(!section.running);
        assert_eq!(section.issues.len(), 1);
        assert_eq!(section.issues[0].code, "DAEMON_NOT_RUNNING");
        assert_eq!(section.issues[0].remedy, Some(FixAction::StartDaemon));
        assert!(section.issues[0].suggestion.contains("systemctl"));
    }

    #[tokio::test]
    async fn test_missing_cli_is_not_fixable() {
        let dir = tempfile::tempdir().unwrap();
        let section = check(&test_context(&dir, ScriptRunner::new())).await;
        assert_eq!(section.issues[0].code, "DOCKER_NOT_INSTALLED");
        assert!(!section.issues[0].auto_fixable);
    }
}
