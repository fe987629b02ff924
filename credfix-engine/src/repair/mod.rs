//! Credential repairer
//!
//! Merges every diagnostic source into one ranked issue list, derives fixes
//! from the issues that carry a remedy, and executes those fixes one at a
//! time. Issues without a remedy only ever become recommendations.

pub mod actions;

pub use actions::{FixAction, Step};

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

use crate::context::ProbeContext;
use crate::docker::DockerReport;
use crate::model::{merge_issues, Issue, Recommendation, Severity};
use crate::platform::{advisories, PlatformInfo};
use crate::probes::{build_recommendations, Facts, PlatformDiagnostics};

/// Risk of executing a fix, ordered so that `Critical` is the greatest value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

/// An executable remedy for one or more issues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub id: String,
    pub target_issue_ids: Vec<String>,
    pub title: String,
    pub action: FixAction,
    pub risk_level: RiskLevel,
    pub requires_restart: bool,
    pub requires_reauth: bool,
    pub auto_fixable: bool,
    /// Highest severity among the targeted issues
    pub priority: Severity,
}

impl Fix {
    fn for_issue(action: FixAction, issue: &Issue) -> Self {
        Self {
            id: format!("fix-{}", action.slug()),
            target_issue_ids: vec![issue.id.clone()],
            title: action.to_string(),
            risk_level: action.risk(),
            requires_restart: action.requires_restart(),
            requires_reauth: action.requires_reauth(),
            auto_fixable: true,
            priority: issue.severity,
            action,
        }
    }
}

/// Everything one scan produced; missing parts are `None`
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiagnosticResults {
    pub platform: Option<PlatformInfo>,
    pub probes: Option<PlatformDiagnostics>,
    pub docker: Option<DockerReport>,
}

impl DiagnosticResults {
    /// Deduplicated issues of all sources, most severe first
    pub fn issues(&self) -> Vec<Issue> {
        merge_issues([
            self.platform.as_ref().map(advisories).unwrap_or_default(),
            self.probes.as_ref().map(|p| p.issues.clone()).unwrap_or_default(),
            self.docker.as_ref().map(DockerReport::issues).unwrap_or_default(),
        ])
    }

    pub fn facts(&self) -> Facts {
        self.probes
            .as_ref()
            .map(|p| p.platform_facts.clone())
            .unwrap_or_default()
    }

    /// Probe-level failures recorded while scanning
    pub fn errors(&self) -> Vec<String> {
        let mut errors: Vec<String> = self
            .platform
            .iter()
            .flat_map(|p| p.errors.iter().map(|e| format!("platform: {e}")))
            .collect();
        if let Some(docker) = &self.docker {
            errors.extend(docker.errors());
        }
        errors
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Analysis {
    pub issues: Vec<Issue>,
    pub fixes: Vec<Fix>,
    pub recommendations: Vec<Recommendation>,
}

impl Analysis {
    pub fn fixes_by_id(&self, ids: &[String]) -> Vec<Fix> {
        self.fixes
            .iter()
            .filter(|f| ids.contains(&f.id))
            .cloned()
            .collect()
    }

    /// Fixes that resolve at least one critical issue
    pub fn critical_fixes(&self) -> Vec<Fix> {
        self.fixes
            .iter()
            .filter(|f| f.priority == Severity::Critical)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteOptions {
    pub dry_run: bool,
    pub stop_on_failure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStatus {
    Applied,
    /// Dry run: computed, not performed
    Simulated,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixOutcome {
    pub fix_id: String,
    pub status: FixStatus,
    /// Commands and config diff; always present for simulated fixes
    pub diff: Option<String>,
    pub message: String,
    pub error: Option<String>,
    pub suggestion: Option<String>,
}

impl FixOutcome {
    fn skipped(fix: &Fix, message: &str) -> Self {
        Self {
            fix_id: fix.id.clone(),
            status: FixStatus::Skipped,
            diff: None,
            message: message.to_string(),
            error: None,
            suggestion: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.status, FixStatus::Applied | FixStatus::Simulated)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub executed: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub requires_restart: bool,
    pub requires_reauth: bool,
    pub dry_run: bool,
    pub outcomes: Vec<FixOutcome>,
    /// Instructions the caller must show; success is never implied
    pub next_steps: Vec<String>,
}

/// Notified around every fix; used for progress events
pub trait FixObserver: Send + Sync {
    fn fix_started(&self, _fix: &Fix, _index: usize, _total: usize) {}
    fn fix_finished(&self, _outcome: &FixOutcome, _index: usize, _total: usize) {}
}

impl FixObserver for () {}

pub struct CredentialRepairer {
    ctx: ProbeContext,
}

impl CredentialRepairer {
    pub fn new(ctx: ProbeContext) -> Self {
        Self { ctx }
    }

    /// Rank issues and derive fixes; one fix per distinct remedy
    pub fn analyze_and_repair(&self, results: &DiagnosticResults) -> Analysis {
        let issues = results.issues();

        let mut fixes: Vec<Fix> = Vec::new();
        for issue in &issues {
            let Some(action) = issue.remedy.as_ref().filter(|_| issue.auto_fixable) else {
                continue;
            };
            match fixes.iter_mut().find(|f| &f.action == action) {
                Some(fix) => fix.target_issue_ids.push(issue.id.clone()),
                None => fixes.push(Fix::for_issue(action.clone(), issue)),
            }
        }

        let recommendations = build_recommendations(&results.facts(), &issues);
        info!(
            "Analysis: {} issues, {} fixes, {} recommendations",
            issues.len(),
            fixes.len(),
            recommendations.len()
        );

        Analysis {
            issues,
            fixes,
            recommendations,
        }
    }

    /// Execute fixes sequentially, most urgent first
    pub async fn execute_fixes(
        &self,
        fixes: &[Fix],
        options: &ExecuteOptions,
        observer: &dyn FixObserver,
    ) -> ExecutionReport {
        let mut ordered: Vec<&Fix> = fixes.iter().collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut report = ExecutionReport {
            dry_run: options.dry_run,
            ..Default::default()
        };
        let total = ordered.len();
        let mut halted = false;

        for (index, fix) in ordered.into_iter().enumerate() {
            if !fix.auto_fixable {
                report.outcomes.push(FixOutcome::skipped(fix, "requires manual action"));
                continue;
            }
            if halted {
                report.outcomes.push(FixOutcome::skipped(fix, "not run: an earlier fix failed"));
                continue;
            }

            observer.fix_started(fix, index, total);
            let outcome = if options.dry_run {
                self.simulate(fix)
            } else {
                self.apply(fix).await
            };
            observer.fix_finished(&outcome, index, total);

            if outcome.succeeded() {
                report.requires_restart |= fix.requires_restart;
                report.requires_reauth |= fix.requires_reauth;
            } else if options.stop_on_failure {
                warn!("Stopping after failed fix {}", fix.id);
                halted = true;
            }
            report.outcomes.push(outcome);
        }

        for outcome in &report.outcomes {
            match outcome.status {
                FixStatus::Applied | FixStatus::Simulated => {
                    report.executed += 1;
                    report.successful += 1;
                }
                FixStatus::Failed => {
                    report.executed += 1;
                    report.failed += 1;
                }
                FixStatus::Skipped => report.skipped += 1,
            }
        }
        report.next_steps = next_steps(&report);

        info!(
            "Fix execution{}: {} executed, {} successful, {} failed, {} skipped",
            if options.dry_run { " (dry run)" } else { "" },
            report.executed,
            report.successful,
            report.failed,
            report.skipped
        );
        report
    }

    /// Describe every step without running a command or writing a file
    fn simulate(&self, fix: &Fix) -> FixOutcome {
        let file = self.ctx.config_file();
        let mut lines = Vec::new();
        let mut failure = None;

        for step in fix.action.steps(&self.ctx) {
            match &step {
                Step::Run { .. } => lines.push(format!("would run: {}", step.describe())),
                Step::Edit { edit } => match file.plan(edit) {
                    Ok(plan) if plan.changed => lines.push(plan.diff),
                    Ok(_) => lines.push(format!("{} is already up to date", file.path().display())),
                    Err(e) => {
                        failure = Some((e.to_string(), e.suggestion()));
                        break;
                    }
                },
            }
        }

        let diff = Some(lines.join("\n"));
        match failure {
            None => FixOutcome {
                fix_id: fix.id.clone(),
                status: FixStatus::Simulated,
                diff,
                message: format!("Dry run: {}", fix.title),
                error: None,
                suggestion: None,
            },
            Some((error, suggestion)) => FixOutcome {
                fix_id: fix.id.clone(),
                status: FixStatus::Failed,
                diff,
                message: format!("Dry run could not plan: {}", fix.title),
                error: Some(error),
                suggestion: Some(suggestion),
            },
        }
    }

    async fn apply(&self, fix: &Fix) -> FixOutcome {
        info!("Executing fix {}: {}", fix.id, fix.title);
        let file = self.ctx.config_file();
        let timeout = self.ctx.settings.timeouts.fix();
        let mut diffs = Vec::new();

        let failed = |error: String, suggestion: String, diffs: &[String]| FixOutcome {
            fix_id: fix.id.clone(),
            status: FixStatus::Failed,
            diff: (!diffs.is_empty()).then(|| diffs.join("\n")),
            message: format!("Failed: {}", fix.title),
            error: Some(error),
            suggestion: Some(suggestion),
        };

        for step in fix.action.steps(&self.ctx) {
            match &step {
                Step::Run { program, args } => {
                    let args: Vec<&str> = args.iter().map(String::as_str).collect();
                    debug!("Fix {} step: {}", fix.id, step.describe());
                    if let Err(e) = self.ctx.runner.run(program, &args, timeout).await {
                        warn!("Fix {} failed: {}", fix.id, e);
                        return failed(e.to_string(), e.suggestion(), &diffs);
                    }
                }
                Step::Edit { edit } => {
                    let plan = match file.plan(edit) {
                        Ok(plan) => plan,
                        Err(e) => return failed(e.to_string(), e.suggestion(), &diffs),
                    };
                    if let Err(e) = file.commit(&plan) {
                        warn!("Fix {} could not write {}: {}", fix.id, file.path().display(), e);
                        return failed(e.to_string(), e.suggestion(), &diffs);
                    }
                    if plan.changed {
                        diffs.push(plan.diff);
                    }
                }
            }
        }

        FixOutcome {
            fix_id: fix.id.clone(),
            status: FixStatus::Applied,
            diff: (!diffs.is_empty()).then(|| diffs.join("\n")),
            message: format!("Applied: {}", fix.title),
            error: None,
            suggestion: None,
        }
    }
}

fn next_steps(report: &ExecutionReport) -> Vec<String> {
    let mut steps = Vec::new();
    if report.dry_run {
        steps.push("This was a dry run; nothing was changed. Re-run without --dry-run to apply.".to_string());
    }
    if report.requires_restart {
        steps.push(
            "Restart Docker, and log out and back in if your group membership changed, before retrying".to_string(),
        );
    }
    if report.requires_reauth {
        steps.push("Run `docker login` again for every registry you use; stored credentials moved".to_string());
    }
    if report.failed > 0 {
        steps.push(format!(
            "{} fix(es) failed; see the suggestion on each failed fix",
            report.failed
        ));
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker_config::creds_store;
    use crate::model::IssueType;
    use crate::probes::ProbeSet;
    use crate::testing::{test_context, ScriptRunner};

    fn results_with(issues: Vec<Issue>) -> DiagnosticResults {
        DiagnosticResults {
            probes: Some(PlatformDiagnostics {
                probe_set: ProbeSet::Linux,
                platform_facts: Facts::new(),
                issues,
                recommendations: Vec::new(),
            }),
            ..Default::default()
        }
    }

    fn write_config(ctx: &ProbeContext, content: &str) {
        std::fs::create_dir_all(ctx.docker_dir()).unwrap();
        std::fs::write(&ctx.docker_config, content).unwrap();
    }

    #[test]
    fn test_issues_sharing_a_remedy_share_a_fix() {
        let dir = tempfile::tempdir().unwrap();
        let repairer = CredentialRepairer::new(test_context(&dir, ScriptRunner::new()));
        let results = results_with(vec![
            Issue::new("DAEMON_NOT_RUNNING", IssueType::Daemon, Severity::High, "down", "a", "start it")
                .fixable_by(FixAction::StartDaemon),
            Issue::new("OTHER", IssueType::Daemon, Severity::Medium, "down too", "b", "start it")
                .fixable_by(FixAction::StartDaemon),
            Issue::new("MIGRATE", IssueType::Configuration, Severity::Low, "legacy", "c", "migrate")
                .fixable_by(FixAction::MigrateAuths),
        ]);

        let analysis = repairer.analyze_and_repair(&results);
        assert_eq!(analysis.fixes.len(), 2);
        assert_eq!(analysis.fixes[0].id, "fix-start-daemon");
        assert_eq!(analysis.fixes[0].target_issue_ids.len(), 2);
        assert_eq!(analysis.fixes[0].priority, Severity::High);
        assert_eq!(analysis.fixes[1].risk_level, RiskLevel::Low);
        assert_eq!(analysis.recommendations.len(), 3);
    }

    #[test]
    fn test_manual_issues_never_get_a_fix() {
        let dir = tempfile::tempdir().unwrap();
        let repairer = CredentialRepairer::new(test_context(&dir, ScriptRunner::new()));
        let mut tampered = Issue::new("X", IssueType::Permissions, Severity::High, "x", "x", "x");
        tampered.remedy = Some(FixAction::StartDaemon);
        let results = results_with(vec![
            Issue::new("MANUAL", IssueType::Network, Severity::Critical, "no", "evidence", "do it by hand"),
            tampered,
        ]);

        let analysis = repairer.analyze_and_repair(&results);
        assert!(analysis.fixes.is_empty());
        assert_eq!(analysis.issues.len(), 2);
        assert_eq!(analysis.recommendations.len(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_leaves_config_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::new();
        let ctx = test_context(&dir, runner.clone());
        write_config(&ctx, "{\n\t\"auths\": {},\n\t\"credsStore\": \"secretservice\"\n}");
        let before = std::fs::read(&ctx.docker_config).unwrap();
        let modified = std::fs::metadata(&ctx.docker_config).unwrap().modified().unwrap();

        let repairer = CredentialRepairer::new(ctx.clone());
        let issue = Issue::new("HELPER_BROKEN", IssueType::CredentialHelper, Severity::Critical, "x", "y", "z")
            .fixable_by(FixAction::InstallHelper {
                helper: "pass".into(),
                manager: crate::probes::packages::PackageManager::Apt,
                package: "golang-docker-credential-helpers".into(),
            });
        let analysis = repairer.analyze_and_repair(&results_with(vec![issue]));
        let options = ExecuteOptions {
            dry_run: true,
            stop_on_failure: false,
        };
        let report = repairer.execute_fixes(&analysis.fixes, &options, &()).await;

        assert_eq!(report.successful, 1);
        assert!(report.requires_reauth);
        let diff = report.outcomes[0].diff.as_deref().unwrap();
        assert!(diff.contains("would run: sudo -n apt-get install -y golang-docker-credential-helpers"));
        assert!(diff.contains("+\t\"credsStore\": \"pass\""));
        assert!(runner.calls().is_empty());
        assert_eq!(std::fs::read(&ctx.docker_config).unwrap(), before);
        assert_eq!(std::fs::metadata(&ctx.docker_config).unwrap().modified().unwrap(), modified);
    }

    #[tokio::test]
    async fn test_stop_on_failure_skips_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir, ScriptRunner::new());
        write_config(&ctx, r#"{"auths": {"ghcr.io": "abc"}}"#);
        let repairer = CredentialRepairer::new(ctx.clone());
        let analysis = repairer.analyze_and_repair(&results_with(vec![
            Issue::new("DAEMON_NOT_RUNNING", IssueType::Daemon, Severity::High, "down", "a", "start")
                .fixable_by(FixAction::StartDaemon),
            Issue::new("DEPRECATED", IssueType::Configuration, Severity::Low, "legacy", "b", "migrate")
                .fixable_by(FixAction::MigrateAuths),
        ]));

        let halting = ExecuteOptions {
            dry_run: false,
            stop_on_failure: true,
        };
        let report = repairer.execute_fixes(&analysis.fixes, &halting, &()).await;
        assert_eq!((report.failed, report.skipped, report.successful), (1, 1, 0));
        assert!(report.outcomes[0].suggestion.is_some());
        assert!(!report.requires_restart);

        let report = repairer
            .execute_fixes(&analysis.fixes, &ExecuteOptions::default(), &())
            .await;
        assert_eq!((report.failed, report.skipped, report.successful), (1, 0, 1));
        assert_eq!(report.outcomes[1].status, FixStatus::Applied);
        let state = ctx.config_file().load();
        assert!(state.value().unwrap()["auths"]["ghcr.io"].is_object());
    }

    #[tokio::test]
    async fn test_install_then_configure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::new().ok("sudo -n apt-get install -y golang-docker-credential-helpers", "");
        let ctx = test_context(&dir, runner);
        let repairer = CredentialRepairer::new(ctx.clone());
        let fix = Fix::for_issue(
            FixAction::InstallHelper {
                helper: "pass".into(),
                manager: crate::probes::packages::PackageManager::Apt,
                package: "golang-docker-credential-helpers".into(),
            },
            &Issue::new("NO_CREDENTIAL_HELPER", IssueType::CredentialHelper, Severity::Critical, "x", "y", "z"),
        );

        let report = repairer.execute_fixes(&[fix], &ExecuteOptions::default(), &()).await;
        assert_eq!(report.successful, 1);
        assert!(report.next_steps.iter().any(|s| s.contains("docker login")));
        let state = ctx.config_file().load();
        assert_eq!(creds_store(state.value().unwrap()), Some("pass"));
    }
}
