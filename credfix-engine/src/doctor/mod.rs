//! Doctor: the guided diagnose-and-repair state machine
//!
//! ```text
//! Idle -> QuickScanning -> Summarized -> {Exit | DetailedAnalyzing}
//!      -> OptionsDisplayed -> {Exit | FixingSpecific | ApplyingRecommendation
//!                              | AutoFixingAll | ReportOnly}
//!      -> Verifying -> Done
//! ```
//!
//! Every user decision comes from a `DecisionProvider`, so the same flow runs
//! under a terminal, an automated run or a test script. Decisions are only
//! taken at state boundaries; nothing is executed before a proposal is
//! approved.

pub mod console;
pub mod events;
pub mod session;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::consent::backup::{BackupError, BackupRecord};
use crate::consent::{ConsentDecision, ConsentError, ConsentFlow, ConsentPrompt, FixProposal};
use crate::context::ProbeContext;
use crate::model::SeverityCounts;
use crate::repair::{Analysis, CredentialRepairer, ExecuteOptions, ExecutionReport, Fix};
use events::{EventSink, EventType, FixProgress, ProgressEvent};
use session::{DiagnosticSession, Scanner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoctorState {
    Idle,
    QuickScanning,
    Summarized,
    DetailedAnalyzing,
    OptionsDisplayed,
    FixingSpecific,
    ApplyingRecommendation,
    AutoFixingAll,
    ReportOnly,
    Verifying,
    Done,
    Exit,
}

impl DoctorState {
    pub fn can_transition_to(self, next: DoctorState) -> bool {
        use DoctorState::*;
        matches!(
            (self, next),
            (Idle, QuickScanning)
                | (QuickScanning, Summarized | Done)
                | (Summarized, Exit | DetailedAnalyzing)
                // "fix critical" and "full report" skip the options screen
                | (DetailedAnalyzing, OptionsDisplayed | FixingSpecific | ReportOnly)
                | (OptionsDisplayed, Exit | FixingSpecific | ApplyingRecommendation | AutoFixingAll | ReportOnly)
                | (FixingSpecific | ApplyingRecommendation | AutoFixingAll, Verifying | Done)
                | (ReportOnly, Done)
                | (Verifying, Done)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DoctorState::Done | DoctorState::Exit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryChoice {
    FixCritical,
    ReviewIndividually,
    ViewFullReport,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionChoice {
    FixSpecific(Vec<String>),
    /// Index into `Analysis::recommendations`
    ApplyRecommendation(usize),
    AutoFixAll,
    ReportOnly,
    Exit,
}

/// Source of every decision the doctor needs
#[async_trait]
pub trait DecisionProvider: ConsentPrompt {
    async fn on_summary(&self, session: &DiagnosticSession) -> SummaryChoice;

    async fn on_options(&self, analysis: &Analysis) -> OptionChoice;

    async fn on_report(&self, _session: &DiagnosticSession, _analysis: &Analysis) {}

    /// Some fixes failed after approval; `true` restores the backup
    async fn on_failed_fixes(&self, _report: &ExecutionReport, _backup: &BackupRecord) -> bool {
        false
    }
}

/// Fixes everything without asking; proposals go to `prompt` if given
pub struct AutomaticDecisions {
    prompt: Option<Box<dyn ConsentPrompt>>,
}

impl AutomaticDecisions {
    pub fn approving() -> Self {
        Self { prompt: None }
    }

    pub fn asking(prompt: impl ConsentPrompt + 'static) -> Self {
        Self {
            prompt: Some(Box::new(prompt)),
        }
    }
}

#[async_trait]
impl ConsentPrompt for AutomaticDecisions {
    async fn on_proposal(&self, proposal: &FixProposal) -> ConsentDecision {
        match &self.prompt {
            Some(prompt) => prompt.on_proposal(proposal).await,
            None => ConsentDecision::approve("approved by non-interactive run"),
        }
    }
}

#[async_trait]
impl DecisionProvider for AutomaticDecisions {
    async fn on_summary(&self, _session: &DiagnosticSession) -> SummaryChoice {
        SummaryChoice::ReviewIndividually
    }

    async fn on_options(&self, _analysis: &Analysis) -> OptionChoice {
        OptionChoice::AutoFixAll
    }
}

#[derive(Debug, Error)]
pub enum DoctorError {
    #[error("invalid doctor transition {from:?} -> {to:?}")]
    InvalidTransition { from: DoctorState, to: DoctorState },
    #[error(transparent)]
    Consent(#[from] ConsentError),
    #[error("rollback failed: {0}")]
    Backup(#[from] BackupError),
}

impl DoctorError {
    pub fn suggestion(&self) -> String {
        match self {
            DoctorError::InvalidTransition { .. } => "This is a bug in credfix; please report it".to_string(),
            DoctorError::Consent(e) => e.suggestion(),
            DoctorError::Backup(e) => e.suggestion(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum DoctorOutcome {
    Healthy,
    IssuesFound {
        counts: SeverityCounts,
        /// Set when the user declined the proposal
        #[serde(skip_serializing_if = "Option::is_none")]
        rejected: Option<String>,
    },
    FixesApplied {
        successful: usize,
        failed: usize,
        requires_restart: bool,
        requires_reauth: bool,
        dry_run: bool,
        before: SeverityCounts,
        remaining: SeverityCounts,
        resolved: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        rolled_back: Option<String>,
    },
    UserCancelled,
}

impl DoctorOutcome {
    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            DoctorOutcome::Healthy => 0,
            DoctorOutcome::FixesApplied { failed: 0, remaining, .. } if remaining.critical == 0 => 0,
            DoctorOutcome::FixesApplied { .. } | DoctorOutcome::IssuesFound { .. } => 1,
            DoctorOutcome::UserCancelled => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub session_id: String,
    pub outcome: DoctorOutcome,
    /// Latest scan; after fixes this is the verification scan
    pub session: DiagnosticSession,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Analysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionReport>,
    pub transitions: Vec<DoctorState>,
}

pub struct Doctor {
    ctx: ProbeContext,
    consent: ConsentFlow,
    sink: Arc<dyn EventSink>,
    options: ExecuteOptions,
    state: DoctorState,
    transitions: Vec<DoctorState>,
}

impl Doctor {
    pub fn new(ctx: ProbeContext, consent: ConsentFlow, sink: Arc<dyn EventSink>) -> Self {
        let options = ExecuteOptions {
            dry_run: ctx.settings.repair.dry_run,
            stop_on_failure: ctx.settings.repair.stop_on_failure,
        };
        Self {
            ctx,
            consent,
            sink,
            options,
            state: DoctorState::Idle,
            transitions: vec![DoctorState::Idle],
        }
    }

    pub fn with_options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }

    pub fn state(&self) -> DoctorState {
        self.state
    }

    fn transition(&mut self, next: DoctorState) -> Result<(), DoctorError> {
        if !self.state.can_transition_to(next) {
            return Err(DoctorError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        info!("Doctor: {:?} -> {:?}", self.state, next);
        self.state = next;
        self.transitions.push(next);
        Ok(())
    }

    fn finish(
        &mut self,
        session_id: &str,
        outcome: DoctorOutcome,
        mut session: DiagnosticSession,
        analysis: Option<Analysis>,
        execution: Option<ExecutionReport>,
    ) -> DoctorReport {
        if let Ok(result) = serde_json::to_value(&outcome) {
            session.attach_result(result);
        }
        DoctorReport {
            session_id: session_id.to_string(),
            outcome,
            session,
            analysis,
            execution,
            transitions: self.transitions.clone(),
        }
    }

    /// Drive one doctor run to a terminal state
    pub async fn run(&mut self, decisions: &dyn DecisionProvider) -> Result<DoctorReport, DoctorError> {
        let session_id = Uuid::new_v4().to_string();
        let scanner = Scanner::new(self.ctx.clone());

        self.transition(DoctorState::QuickScanning)?;
        let baseline = scanner.quick_scan(&session_id, self.sink.as_ref()).await;
        if baseline.issues.is_empty() {
            self.transition(DoctorState::Done)?;
            return Ok(self.finish(&session_id, DoctorOutcome::Healthy, baseline, None, None));
        }

        self.transition(DoctorState::Summarized)?;
        let choice = decisions.on_summary(&baseline).await;
        if choice == SummaryChoice::Exit {
            self.transition(DoctorState::Exit)?;
            return Ok(self.finish(&session_id, DoctorOutcome::UserCancelled, baseline, None, None));
        }

        // Separate pass; identical input gives identical issues
        self.transition(DoctorState::DetailedAnalyzing)?;
        let detailed = scanner.quick_scan(&session_id, self.sink.as_ref()).await;
        let analysis = CredentialRepairer::new(self.ctx.clone()).analyze_and_repair(&detailed.results);
        let issues_found = DoctorOutcome::IssuesFound {
            counts: detailed.counts,
            rejected: None,
        };

        let (mode, fixes) = match choice {
            SummaryChoice::FixCritical => (DoctorState::FixingSpecific, analysis.critical_fixes()),
            SummaryChoice::ViewFullReport => {
                self.transition(DoctorState::ReportOnly)?;
                decisions.on_report(&detailed, &analysis).await;
                self.transition(DoctorState::Done)?;
                return Ok(self.finish(&session_id, issues_found, detailed, Some(analysis), None));
            }
            _ => {
                self.transition(DoctorState::OptionsDisplayed)?;
                match decisions.on_options(&analysis).await {
                    OptionChoice::Exit => {
                        self.transition(DoctorState::Exit)?;
                        return Ok(self.finish(&session_id, DoctorOutcome::UserCancelled, detailed, Some(analysis), None));
                    }
                    OptionChoice::ReportOnly => {
                        self.transition(DoctorState::ReportOnly)?;
                        decisions.on_report(&detailed, &analysis).await;
                        self.transition(DoctorState::Done)?;
                        return Ok(self.finish(&session_id, issues_found, detailed, Some(analysis), None));
                    }
                    OptionChoice::FixSpecific(ids) => (DoctorState::FixingSpecific, analysis.fixes_by_id(&ids)),
                    OptionChoice::ApplyRecommendation(index) => {
                        (DoctorState::ApplyingRecommendation, recommendation_fixes(&analysis, index))
                    }
                    OptionChoice::AutoFixAll => (DoctorState::AutoFixingAll, analysis.fixes.clone()),
                }
            }
        };

        self.transition(mode)?;
        if fixes.is_empty() {
            info!("Nothing automatic to apply for this choice");
            self.transition(DoctorState::Done)?;
            return Ok(self.finish(&session_id, issues_found, detailed, Some(analysis), None));
        }

        let sink = self.sink.clone();
        let observer = FixProgress {
            sink: sink.as_ref(),
            session_id: &session_id,
        };
        let (execution, rolled_back) = if self.options.dry_run {
            // Nothing is mutated, so there is nothing to consent to
            let execution = CredentialRepairer::new(self.ctx.clone())
                .execute_fixes(&fixes, &self.options, &observer)
                .await;
            (execution, None)
        } else {
            let proposal = self.consent.propose(&fixes, &self.ctx)?;
            let decision = self.consent.get_consent(&proposal, decisions).await;
            if !decision.approved {
                self.transition(DoctorState::Done)?;
                let outcome = DoctorOutcome::IssuesFound {
                    counts: detailed.counts,
                    rejected: Some(decision.reason),
                };
                return Ok(self.finish(&session_id, outcome, detailed, Some(analysis), None));
            }

            let execution = CredentialRepairer::new(self.ctx.clone())
                .execute_fixes(&fixes, &self.options, &observer)
                .await;
            let mut rolled_back = None;
            if execution.failed > 0 && decisions.on_failed_fixes(&execution, &proposal.backup).await {
                warn!("Restoring backup {} after failed fixes", proposal.backup.id);
                self.consent.rollback(&proposal.backup)?;
                rolled_back = Some(proposal.backup.id.clone());
            }
            (execution, rolled_back)
        };
        self.sink.emit(ProgressEvent::result(
            EventType::FixComplete,
            &session_id,
            serde_json::to_value(&execution).unwrap_or_default(),
        ));

        self.transition(DoctorState::Verifying)?;
        let verification = scanner.quick_scan(&session_id, self.sink.as_ref()).await;
        let resolved = detailed
            .issues
            .iter()
            .filter(|before| !verification.issues.iter().any(|after| after.id == before.id))
            .count();
        info!(
            "Verification: {} resolved, {} remaining ({} critical)",
            resolved,
            verification.issues.len(),
            verification.counts.critical
        );

        self.transition(DoctorState::Done)?;
        let outcome = DoctorOutcome::FixesApplied {
            successful: execution.successful,
            failed: execution.failed,
            requires_restart: execution.requires_restart,
            requires_reauth: execution.requires_reauth,
            dry_run: execution.dry_run,
            before: detailed.counts,
            remaining: verification.counts,
            resolved,
            rolled_back,
        };
        Ok(self.finish(&session_id, outcome, verification, Some(analysis), Some(execution)))
    }
}

/// Fixes targeting the issue behind a recommendation; advisories have none
fn recommendation_fixes(analysis: &Analysis, index: usize) -> Vec<Fix> {
    let Some(issue_id) = analysis.recommendations.get(index).and_then(|r| r.issue_id.as_ref()) else {
        return Vec::new();
    };
    analysis
        .fixes
        .iter()
        .filter(|f| f.target_issue_ids.contains(issue_id))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::backup::FileBackupStore;
    use crate::consent::ConsentPolicy;
    use crate::doctor::events::NullSink;
    use crate::testing::{test_context, ScriptRunner};

    struct Scripted {
        summary: SummaryChoice,
        option: OptionChoice,
        approve: bool,
    }

    #[async_trait]
    impl ConsentPrompt for Scripted {
        async fn on_proposal(&self, _proposal: &FixProposal) -> ConsentDecision {
            if self.approve {
                ConsentDecision::approve("yes")
            } else {
                ConsentDecision::reject("no thanks")
            }
        }
    }

    #[async_trait]
    impl DecisionProvider for Scripted {
        async fn on_summary(&self, _session: &DiagnosticSession) -> SummaryChoice {
            self.summary
        }

        async fn on_options(&self, _analysis: &Analysis) -> OptionChoice {
            self.option.clone()
        }
    }

    fn doctor(dir: &tempfile::TempDir, runner: ScriptRunner) -> (Doctor, ProbeContext) {
        let ctx = test_context(dir, runner);
        let consent = ConsentFlow::new(
            Arc::new(FileBackupStore::new(dir.path().join("backups"))),
            ConsentPolicy::Interactive,
        );
        (Doctor::new(ctx.clone(), consent, Arc::new(NullSink)), ctx)
    }

    #[test]
    fn test_transition_table() {
        use DoctorState::*;
        assert!(Idle.can_transition_to(QuickScanning));
        assert!(QuickScanning.can_transition_to(Done));
        assert!(Summarized.can_transition_to(Exit));
        assert!(!Summarized.can_transition_to(AutoFixingAll));
        assert!(!Idle.can_transition_to(Verifying));
        assert!(!ReportOnly.can_transition_to(Verifying));
        assert!(Done.is_terminal());
    }

    #[tokio::test]
    async fn test_exit_at_summary_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let (mut doctor, ctx) = doctor(&dir, ScriptRunner::new());
        let decisions = Scripted {
            summary: SummaryChoice::Exit,
            option: OptionChoice::Exit,
            approve: true,
        };

        let report = doctor.run(&decisions).await.unwrap();
        assert_eq!(report.outcome, DoctorOutcome::UserCancelled);
        assert_eq!(doctor.state(), DoctorState::Exit);
        assert!(!ctx.docker_config.exists());
        assert!(!dir.path().join("backups").exists());
    }

    #[tokio::test]
    async fn test_rejection_leaves_config_identical() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::new().exit("docker-credential-pass list", 1, "pass store is empty");
        let (mut doctor, ctx) = doctor(&dir, runner);
        std::fs::create_dir_all(ctx.docker_dir()).unwrap();
        std::fs::write(&ctx.docker_config, r#"{"auths": {}, "credsStore": "pass"}"#).unwrap();
        let before = std::fs::read(&ctx.docker_config).unwrap();

        let decisions = Scripted {
            summary: SummaryChoice::ReviewIndividually,
            option: OptionChoice::AutoFixAll,
            approve: false,
        };
        let report = doctor.run(&decisions).await.unwrap();
        match report.outcome {
            DoctorOutcome::IssuesFound { rejected, .. } => assert_eq!(rejected.as_deref(), Some("no thanks")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(std::fs::read(&ctx.docker_config).unwrap(), before);
        assert_eq!(report.transitions.last(), Some(&DoctorState::Done));
        assert!(report.session.result.is_some());
    }

    #[tokio::test]
    async fn test_report_only_never_mutates() {
        let dir = tempfile::tempdir().unwrap();
        let (mut doctor, ctx) = doctor(&dir, ScriptRunner::new());
        let decisions = Scripted {
            summary: SummaryChoice::ViewFullReport,
            option: OptionChoice::Exit,
            approve: true,
        };

        let report = doctor.run(&decisions).await.unwrap();
        assert!(matches!(report.outcome, DoctorOutcome::IssuesFound { rejected: None, .. }));
        assert!(report.analysis.is_some());
        assert!(!ctx.docker_config.exists());
        assert!(report.transitions.contains(&DoctorState::ReportOnly));
    }
}
