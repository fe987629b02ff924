//! Quick scan: the three probe components run concurrently, and their
//! results are folded into one diagnostic session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{error, info};

use super::events::{EventSink, EventType, ProgressEvent};
use crate::context::ProbeContext;
use crate::docker::DockerChecker;
use crate::model::{Issue, Recommendation, SeverityCounts};
use crate::platform::PlatformDetector;
use crate::probes::{build_recommendations, ProbeSet};
use crate::repair::DiagnosticResults;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Scanning,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticSession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub results: DiagnosticResults,
    pub issues: Vec<Issue>,
    pub recommendations: Vec<Recommendation>,
    pub counts: SeverityCounts,
    /// Probes that did not complete
    pub errors: Vec<String>,
    /// Attached by the orchestrator once the session is acted upon
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl DiagnosticSession {
    pub fn start(id: &str) -> Self {
        Self {
            id: id.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            status: SessionStatus::Scanning,
            results: DiagnosticResults::default(),
            issues: Vec::new(),
            recommendations: Vec::new(),
            counts: SeverityCounts::default(),
            errors: Vec::new(),
            result: None,
        }
    }

    pub fn attach_result(&mut self, result: Value) {
        self.result = Some(result);
    }

    pub fn is_healthy(&self) -> bool {
        self.status == SessionStatus::Completed && self.issues.is_empty()
    }

    fn finish(&mut self, results: DiagnosticResults) {
        self.issues = results.issues();
        self.recommendations = build_recommendations(&results.facts(), &self.issues);
        self.counts = SeverityCounts::from_issues(&self.issues);
        self.errors.extend(results.errors());

        let nothing_ran = results.platform.is_none() && results.probes.is_none() && results.docker.is_none();
        self.status = if nothing_ran {
            SessionStatus::Failed
        } else {
            SessionStatus::Completed
        };
        self.results = results;
        self.completed_at = Some(Utc::now());
    }
}

pub struct Scanner {
    ctx: ProbeContext,
}

impl Scanner {
    pub fn new(ctx: ProbeContext) -> Self {
        Self { ctx }
    }

    /// Run detector, probe set and Docker checker concurrently and wait for all
    /// of them. A probe that panics becomes a session error entry.
    pub async fn quick_scan(&self, session_id: &str, sink: &dyn EventSink) -> DiagnosticSession {
        let mut session = DiagnosticSession::start(session_id);
        info!("Quick scan {} started", session_id);
        sink.emit(ProgressEvent::message(
            EventType::ScanStart,
            session_id,
            0,
            "Starting diagnostic scan",
        ));

        let platform_task = tokio::spawn({
            let ctx = self.ctx.clone();
            async move { PlatformDetector::new(ctx).detect().await }
        });
        let docker_task = tokio::spawn({
            let ctx = self.ctx.clone();
            async move { DockerChecker::new(ctx).run_docker_checks().await }
        });
        let probe_task = ProbeSet::for_os(self.ctx.os).map(|set| {
            let ctx = self.ctx.clone();
            tokio::spawn(async move { set.run_diagnostics(&ctx).await })
        });

        let finished = AtomicUsize::new(0);
        let step = |name: &str| {
            let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
            sink.emit(ProgressEvent::message(
                EventType::ScanProgress,
                session_id,
                (done * 30) as u8,
                format!("{name} finished"),
            ));
        };

        let (platform, docker, probes) = tokio::join!(
            async {
                let result = platform_task.await;
                step("Platform detection");
                result
            },
            async {
                let result = docker_task.await;
                step("Docker checks");
                result
            },
            async {
                let result = match probe_task {
                    Some(task) => task.await.map(Some),
                    None => Ok(None),
                };
                step("Platform probes");
                result
            },
        );

        let mut results = DiagnosticResults::default();
        match platform {
            Ok(info) => results.platform = Some(info),
            Err(e) => session.errors.push(probe_failed("platform detection", &e)),
        }
        match docker {
            Ok(report) => results.docker = Some(report),
            Err(e) => session.errors.push(probe_failed("docker checks", &e)),
        }
        match probes {
            Ok(Some(diagnostics)) => results.probes = Some(diagnostics),
            Ok(None) => session
                .errors
                .push(format!("platform probes: no probe set for {}", self.ctx.os)),
            Err(e) => session.errors.push(probe_failed("platform probes", &e)),
        }

        session.finish(results);
        info!(
            "Quick scan {} {:?}: {} issues ({} critical), {} errors",
            session_id,
            session.status,
            session.issues.len(),
            session.counts.critical,
            session.errors.len()
        );
        sink.emit(ProgressEvent::result(
            EventType::ScanComplete,
            session_id,
            json!({
                "status": session.status,
                "counts": session.counts,
                "issues": session.issues.len(),
                "errors": session.errors,
            }),
        ));
        session
    }
}

fn probe_failed(name: &str, e: &tokio::task::JoinError) -> String {
    error!("{} did not complete: {}", name, e);
    format!("{name}: did not complete: {e}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doctor::events::NullSink;
    use crate::model::{IssueType, Severity};
    use crate::testing::{test_context, ScriptRunner};

    #[tokio::test]
    async fn test_scan_collects_every_component() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir, ScriptRunner::new());
        let session = Scanner::new(ctx).quick_scan("s-1", &NullSink).await;

        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.results.platform.is_some());
        assert!(session.results.probes.is_some());
        assert!(session.results.docker.is_some());
        assert!(session.completed_at.is_some());
        // no docker binary at all
        assert!(session.issues.iter().any(|i| i.code == "DOCKER_NOT_INSTALLED"));
        assert!(session.issues.iter().any(|i| i.issue_type == IssueType::CredentialHelper
            && i.severity == Severity::Critical));
    }

    #[tokio::test]
    async fn test_scan_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir, ScriptRunner::new().exit("docker-credential-pass list", 1, "pass not initialized"));
        std::fs::create_dir_all(ctx.docker_dir()).unwrap();
        std::fs::write(&ctx.docker_config, r#"{"auths": {}, "credsStore": "pass"}"#).unwrap();

        let scanner = Scanner::new(ctx);
        let first = scanner.quick_scan("a", &NullSink).await;
        let second = scanner.quick_scan("b", &NullSink).await;
        assert_eq!(first.issues, second.issues);
        assert_eq!(first.recommendations, second.recommendations);
    }
}
