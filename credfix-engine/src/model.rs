//! Shared diagnostic data model
//!
//! Issues are the unit every probe produces. Their identity is structural:
//! the same type and evidence always hash to the same id, so two scans of an
//! unchanged system produce the same issue set.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::repair::FixAction;

/// Issue classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    CredentialHelper,
    Configuration,
    Permissions,
    Network,
    Daemon,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::CredentialHelper => "credential_helper",
            IssueType::Configuration => "configuration",
            IssueType::Permissions => "permissions",
            IssueType::Network => "network",
            IssueType::Daemon => "daemon",
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity, ordered so that `Critical` is the greatest value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A classified finding produced by a probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    /// Stable machine code, e.g. `DAEMON_NOT_RUNNING`
    pub code: String,
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub severity: Severity,
    pub description: String,
    /// Raw command output or error code backing the finding
    pub evidence: String,
    pub auto_fixable: bool,
    pub suggestion: String,
    /// Minimal corrective operation; present exactly when `auto_fixable`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remedy: Option<FixAction>,
    /// Context for display (helper names, paths, measured values)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl Issue {
    pub fn new(
        code: &str,
        issue_type: IssueType,
        severity: Severity,
        description: impl Into<String>,
        evidence: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        let evidence = evidence.into();
        Self {
            id: structural_id(issue_type, &evidence),
            code: code.to_string(),
            issue_type,
            severity,
            description: description.into(),
            evidence,
            auto_fixable: false,
            suggestion: suggestion.into(),
            remedy: None,
            details: BTreeMap::new(),
        }
    }

    /// Mark the issue as repairable by `action` without human intervention
    pub fn fixable_by(mut self, action: FixAction) -> Self {
        self.auto_fixable = true;
        self.remedy = Some(action);
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).map(String::as_str)
    }
}

fn structural_id(issue_type: IssueType, evidence: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(issue_type.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(evidence.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", issue_type.as_str(), &digest[..12])
}

/// Merge issue lists from several sources.
///
/// Duplicates (same type and evidence) keep their first occurrence; the
/// result is ordered by severity, ties kept in discovery order.
pub fn merge_issues<I>(sources: I) -> Vec<Issue>
where
    I: IntoIterator<Item = Vec<Issue>>,
{
    let mut seen = HashSet::new();
    let mut merged: Vec<Issue> = sources
        .into_iter()
        .flatten()
        .filter(|issue| seen.insert(issue.id.clone()))
        .collect();
    // sort_by is stable
    merged.sort_by(|a, b| b.severity.cmp(&a.severity));
    merged
}

/// A prioritised, human-readable next step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: Severity,
    pub title: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
}

impl Recommendation {
    pub fn advisory(priority: Severity, title: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            priority,
            title: title.into(),
            action: action.into(),
            issue_id: None,
        }
    }

    pub fn for_issue(issue: &Issue) -> Self {
        Self {
            priority: issue.severity,
            title: issue.description.clone(),
            action: issue.suggestion.clone(),
            issue_id: Some(issue.id.clone()),
        }
    }
}

/// Order recommendations critical > high > medium > low, ties in discovery order
pub fn prioritize(mut recommendations: Vec<Recommendation>) -> Vec<Recommendation> {
    recommendations.sort_by(|a, b| b.priority.cmp(&a.priority));
    recommendations
}

/// Issue counts per severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl SeverityCounts {
    pub fn from_issues(issues: &[Issue]) -> Self {
        let mut counts = Self::default();
        for issue in issues {
            match issue.severity {
                Severity::Critical => counts.critical += 1,
                Severity::High => counts.high += 1,
                Severity::Medium => counts.medium += 1,
                Severity::Low => counts.low += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.critical + self.high + self.medium + self.low
    }
}
