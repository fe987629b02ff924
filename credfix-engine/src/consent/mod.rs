//! Consent flow: turns fixes into an approvable proposal
//!
//! A proposal is only issued after a backup of every file it may touch has
//! been confirmed. Approval follows the configured policy; critical-risk
//! proposals always go to a human unless the run is an explicit batch.

pub mod backup;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::ProbeContext;
use crate::repair::{Fix, FixAction, RiskLevel, Step};
use backup::{BackupError, BackupRecord, BackupStore, RestoreOutcome};

/// Who may approve a proposal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentPolicy {
    /// Every proposal is put to the user
    #[default]
    Interactive,
    /// Proposals strictly below `below` are approved without asking
    AutoApprove { below: RiskLevel },
    /// Non-interactive run; critical proposals are approved with a logged override
    Batch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixProposal {
    pub id: String,
    pub description: String,
    /// Highest risk of the included fixes
    pub risk: RiskLevel,
    pub affected_resources: Vec<String>,
    pub backup: BackupRecord,
    pub diff: Option<String>,
    pub fix_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentDecision {
    pub approved: bool,
    pub reason: String,
}

impl ConsentDecision {
    pub fn approve(reason: impl Into<String>) -> Self {
        Self {
            approved: true,
            reason: reason.into(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConsentError {
    #[error("backup failed, nothing was changed: {0}")]
    BackupFailure(#[from] BackupError),
    #[error("proposal rejected: {reason}")]
    Rejected { reason: String },
}

impl ConsentError {
    pub fn suggestion(&self) -> String {
        match self {
            ConsentError::BackupFailure(e) => e.suggestion(),
            ConsentError::Rejected { .. } => {
                "Nothing was changed. Re-run and pick individual fixes, or apply the suggestions by hand".to_string()
            }
        }
    }
}

/// Answers a proposal on behalf of a human
#[async_trait]
pub trait ConsentPrompt: Send + Sync {
    async fn on_proposal(&self, proposal: &FixProposal) -> ConsentDecision;
}

pub struct ConsentFlow {
    store: Arc<dyn BackupStore>,
    policy: ConsentPolicy,
}

impl ConsentFlow {
    pub fn new(store: Arc<dyn BackupStore>, policy: ConsentPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> ConsentPolicy {
        self.policy
    }

    /// Back up, then describe `fixes` as one proposal. Fails closed.
    pub fn propose(&self, fixes: &[Fix], ctx: &ProbeContext) -> Result<FixProposal, ConsentError> {
        let backup = self.store.create_backup(&[ctx.docker_config.clone()]).map_err(|e| {
            error!("Backup before proposal failed: {}", e);
            ConsentError::BackupFailure(e)
        })?;

        let risk = fixes
            .iter()
            .map(|f| f.risk_level)
            .max()
            .unwrap_or(RiskLevel::Low);

        let mut affected_resources: Vec<String> = Vec::new();
        for fix in fixes {
            for resource in affected(&fix.action, ctx) {
                if !affected_resources.contains(&resource) {
                    affected_resources.push(resource);
                }
            }
        }

        let description = match fixes {
            [single] => single.title.clone(),
            _ => format!(
                "Apply {} fixes: {}",
                fixes.len(),
                fixes.iter().map(|f| f.title.as_str()).collect::<Vec<_>>().join("; ")
            ),
        };

        let proposal = FixProposal {
            id: Uuid::new_v4().to_string(),
            description,
            risk,
            affected_resources,
            backup,
            diff: proposal_diff(fixes, ctx),
            fix_ids: fixes.iter().map(|f| f.id.clone()).collect(),
        };
        info!(
            "Proposal {}: {} fix(es), risk {}, backup {}",
            proposal.id,
            fixes.len(),
            proposal.risk,
            proposal.backup.id
        );
        Ok(proposal)
    }

    /// Put back the files saved before `backup`'s proposal
    pub fn rollback(&self, backup: &BackupRecord) -> Result<RestoreOutcome, BackupError> {
        info!("Rolling back to backup {}", backup.id);
        self.store.restore_backup(&backup.id)
    }

    /// Decide on `proposal` under the configured policy
    pub async fn get_consent<P>(&self, proposal: &FixProposal, prompt: &P) -> ConsentDecision
    where
        P: ConsentPrompt + ?Sized,
    {
        let decision = match self.policy {
            ConsentPolicy::Batch => {
                if proposal.risk == RiskLevel::Critical {
                    warn!(
                        "Batch mode override: approving critical-risk proposal {} without a human decision",
                        proposal.id
                    );
                }
                ConsentDecision::approve("approved by batch policy")
            }
            ConsentPolicy::AutoApprove { below } if proposal.risk < below => {
                ConsentDecision::approve(format!("auto-approved: risk {} is below {}", proposal.risk, below))
            }
            _ => prompt.on_proposal(proposal).await,
        };

        info!(
            "Consent for proposal {}: {} ({})",
            proposal.id,
            if decision.approved { "approved" } else { "rejected" },
            decision.reason
        );
        decision
    }
}

fn affected(action: &FixAction, ctx: &ProbeContext) -> Vec<String> {
    let mut resources = Vec::new();
    if action.edits_config() {
        resources.push(ctx.docker_config.display().to_string());
    }
    match action {
        FixAction::InstallHelper { manager, package, .. } => resources.push(format!("{manager} package {package}")),
        FixAction::FixDockerDirOwnership { .. } => resources.push(ctx.docker_dir().display().to_string()),
        FixAction::AddUserToGroup { user, group } => resources.push(format!("membership of {user} in group {group}")),
        FixAction::StartDaemon => resources.push("Docker daemon".to_string()),
        _ => {}
    }
    resources
}

/// Config diffs and commands of every fix; `None` when nothing is computable
fn proposal_diff(fixes: &[Fix], ctx: &ProbeContext) -> Option<String> {
    let file = ctx.config_file();
    let mut sections = Vec::new();
    for fix in fixes {
        let mut lines = Vec::new();
        for step in fix.action.steps(ctx) {
            match &step {
                Step::Run { .. } => lines.push(format!("$ {}", step.describe())),
                Step::Edit { edit } => {
                    if let Ok(plan) = file.plan(edit) {
                        if plan.changed {
                            lines.push(plan.diff);
                        }
                    }
                }
            }
        }
        if !lines.is_empty() {
            sections.push(format!("# {}\n{}", fix.title, lines.join("\n")));
        }
    }
    (!sections.is_empty()).then(|| sections.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Issue, IssueType, Severity};
    use crate::repair::{CredentialRepairer, DiagnosticResults};
    use crate::testing::{test_context, ScriptRunner};
    use backup::FileBackupStore;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Answer {
        approve: bool,
        asked: AtomicUsize,
    }

    impl Answer {
        fn new(approve: bool) -> Self {
            Self {
                approve,
                asked: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ConsentPrompt for Answer {
        async fn on_proposal(&self, _proposal: &FixProposal) -> ConsentDecision {
            self.asked.fetch_add(1, Ordering::SeqCst);
            if self.approve {
                ConsentDecision::approve("user said yes")
            } else {
                ConsentDecision::reject("user said no")
            }
        }
    }

    struct BrokenStore;

    impl BackupStore for BrokenStore {
        fn create_backup(&self, paths: &[PathBuf]) -> Result<BackupRecord, BackupError> {
            Err(BackupError::Write {
                path: paths[0].clone(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            })
        }
        fn list_backups(&self) -> Result<Vec<BackupRecord>, BackupError> {
            Ok(Vec::new())
        }
        fn restore_backup(&self, id: &str) -> Result<RestoreOutcome, BackupError> {
            Err(BackupError::NotFound { id: id.to_string() })
        }
        fn delete_backup(&self, id: &str) -> Result<(), BackupError> {
            Err(BackupError::NotFound { id: id.to_string() })
        }
    }

    fn fixes_for(ctx: &ProbeContext, actions: Vec<FixAction>) -> Vec<Fix> {
        let issues = actions
            .into_iter()
            .enumerate()
            .map(|(n, action)| {
                Issue::new("T", IssueType::Configuration, Severity::High, "t", format!("e{n}"), "s").fixable_by(action)
            })
            .collect();
        let results = DiagnosticResults {
            probes: Some(crate::probes::PlatformDiagnostics {
                probe_set: crate::probes::ProbeSet::Linux,
                platform_facts: Default::default(),
                issues,
                recommendations: Vec::new(),
            }),
            ..Default::default()
        };
        CredentialRepairer::new(ctx.clone()).analyze_and_repair(&results).fixes
    }

    #[test]
    fn test_proposal_aggregates_risk_and_resources() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir, ScriptRunner::new());
        let flow = ConsentFlow::new(Arc::new(FileBackupStore::new(dir.path().join("b"))), ConsentPolicy::Interactive);
        let fixes = fixes_for(
            &ctx,
            vec![FixAction::MigrateAuths, FixAction::AddUserToGroup { user: "dev".into(), group: "docker".into() }],
        );

        let proposal = flow.propose(&fixes, &ctx).unwrap();
        assert_eq!(proposal.risk, RiskLevel::High);
        assert_eq!(proposal.fix_ids.len(), 2);
        assert!(proposal.affected_resources.contains(&ctx.docker_config.display().to_string()));
        assert!(proposal.affected_resources.contains(&"membership of dev in group docker".to_string()));
        assert!(proposal.diff.unwrap().contains("$ sudo -n usermod -aG docker dev"));
    }

    #[test]
    fn test_backup_failure_aborts_proposal() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir, ScriptRunner::new());
        let flow = ConsentFlow::new(Arc::new(BrokenStore), ConsentPolicy::Batch);
        let fixes = fixes_for(&ctx, vec![FixAction::ResetConfig]);

        let err = flow.propose(&fixes, &ctx).unwrap_err();
        assert!(matches!(err, ConsentError::BackupFailure(_)));
        assert!(!err.suggestion().is_empty());
    }

    #[tokio::test]
    async fn test_auto_approve_only_below_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir, ScriptRunner::new());
        let flow = ConsentFlow::new(
            Arc::new(FileBackupStore::new(dir.path().join("b"))),
            ConsentPolicy::AutoApprove { below: RiskLevel::High },
        );
        let prompt = Answer::new(false);

        let low = flow.propose(&fixes_for(&ctx, vec![FixAction::MigrateAuths]), &ctx).unwrap();
        assert!(flow.get_consent(&low, &prompt).await.approved);
        assert_eq!(prompt.asked.load(Ordering::SeqCst), 0);

        let high = flow.propose(&fixes_for(&ctx, vec![FixAction::RemoveCredsStore]), &ctx).unwrap();
        let decision = flow.get_consent(&high, &prompt).await;
        assert!(!decision.approved);
        assert_eq!(prompt.asked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_critical_needs_a_human_unless_batch() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir, ScriptRunner::new());
        let store: Arc<dyn BackupStore> = Arc::new(FileBackupStore::new(dir.path().join("b")));
        let fixes = fixes_for(&ctx, vec![FixAction::ResetConfig]);
        let prompt = Answer::new(true);

        let lenient = ConsentFlow::new(store.clone(), ConsentPolicy::AutoApprove { below: RiskLevel::Critical });
        let proposal = lenient.propose(&fixes, &ctx).unwrap();
        assert_eq!(proposal.risk, RiskLevel::Critical);
        assert!(lenient.get_consent(&proposal, &prompt).await.approved);
        assert_eq!(prompt.asked.load(Ordering::SeqCst), 1);

        let batch = ConsentFlow::new(store, ConsentPolicy::Batch);
        assert!(batch.get_consent(&proposal, &prompt).await.approved);
        assert_eq!(prompt.asked.load(Ordering::SeqCst), 1);
    }
}
