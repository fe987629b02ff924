//! Platform-specific probe set
//!
//! A closed set of variants, one per OS family, selected once from the
//! platform's OS fact. Every variant fills the same fact map and issue list,
//! then runs the shared helper and config checks.

pub mod helpers;
pub mod linux;
pub mod macos;
pub mod packages;
pub mod windows;

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::context::ProbeContext;
use crate::docker::configuration;
use crate::model::{prioritize, Issue, Recommendation, Severity};
use crate::platform::OsFamily;
use helpers::{assess_helper, assess_unconfigured, HelperRole};

/// Named observations collected by a probe run
pub type Facts = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeSet {
    Linux,
    #[serde(rename = "macos")]
    MacOs,
    Windows,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformDiagnostics {
    pub probe_set: ProbeSet,
    pub platform_facts: Facts,
    pub issues: Vec<Issue>,
    pub recommendations: Vec<Recommendation>,
}

impl ProbeSet {
    pub fn for_os(os: OsFamily) -> Option<Self> {
        match os {
            OsFamily::Linux => Some(ProbeSet::Linux),
            OsFamily::MacOs => Some(ProbeSet::MacOs),
            OsFamily::Windows => Some(ProbeSet::Windows),
            OsFamily::Other => None,
        }
    }

    pub async fn run_diagnostics(&self, ctx: &ProbeContext) -> PlatformDiagnostics {
        info!("Running {:?} probe set...", self);
        let mut facts = Facts::new();
        let mut issues = Vec::new();

        let preferred = match self {
            ProbeSet::Linux => linux::probe(ctx, &mut facts, &mut issues).await,
            ProbeSet::MacOs => macos::probe(ctx, &mut facts, &mut issues).await,
            ProbeSet::Windows => windows::probe(ctx, &mut facts, &mut issues).await,
        };
        if let Some(helper) = &preferred {
            facts.insert("preferred_helper".into(), json!(helper));
        }

        shared_checks(ctx, preferred.as_deref(), &mut facts, &mut issues).await;

        let recommendations = build_recommendations(&facts, &issues);
        debug!("{:?} probe set: {} facts, {} issues", self, facts.len(), issues.len());

        PlatformDiagnostics {
            probe_set: *self,
            platform_facts: facts,
            issues,
            recommendations,
        }
    }
}

/// Config file validity and credential helper health, common to every OS
async fn shared_checks(ctx: &ProbeContext, preferred: Option<&str>, facts: &mut Facts, issues: &mut Vec<Issue>) {
    let file = configuration::inspect_file(ctx);
    facts.insert("config_exists".into(), json!(file.exists));
    facts.insert("config_valid".into(), json!(file.valid_json));
    issues.extend(file.issues.iter().cloned());

    // An unparsable config says nothing about which helper is declared
    if file.exists && !file.valid_json {
        return;
    }

    if let Some(store) = &file.creds_store {
        facts.insert("creds_store".into(), json!(store));
        let (status, issue) = assess_helper(ctx, store, &HelperRole::CredsStore).await;
        facts.insert("creds_store_status".into(), json!(status));
        issues.extend(issue);
    }
    for (registry, helper) in &file.cred_helpers {
        let role = HelperRole::CredHelper {
            registry: registry.clone(),
        };
        let (_, issue) = assess_helper(ctx, helper, &role).await;
        issues.extend(issue);
    }

    if file.creds_store.is_none() && file.cred_helpers.is_empty() {
        let (available, issue) = assess_unconfigured(ctx, preferred).await;
        facts.insert("path_helpers".into(), json!(available));
        issues.extend(issue);
    }
}

/// Recommendations as a pure function of facts and issues.
///
/// One entry per issue, then fact-based advisories, ordered
/// critical > high > medium > low with ties in discovery order.
pub fn build_recommendations(facts: &Facts, issues: &[Issue]) -> Vec<Recommendation> {
    let mut recommendations: Vec<Recommendation> = issues.iter().map(Recommendation::for_issue).collect();

    let flag = |key: &str| facts.get(key).and_then(Value::as_bool);

    if flag("headless") == Some(true) && facts.get("creds_store") == Some(&json!("secretservice")) {
        recommendations.push(Recommendation::advisory(
            Severity::Medium,
            "Secret Service on a headless machine",
            "Use the `pass` helper (`\"credsStore\": \"pass\"`) on machines without a desktop session",
        ));
    }
    if facts.get("package_manager") == Some(&Value::Null) {
        recommendations.push(Recommendation::advisory(
            Severity::Low,
            "No supported package manager found",
            "Download docker-credential-helpers from https://github.com/docker/docker-credential-helpers/releases",
        ));
    }
    if flag("dbus_system") == Some(false) && flag("dbus_session") == Some(true) {
        recommendations.push(Recommendation::advisory(
            Severity::Low,
            "System D-Bus not reachable",
            "Only the session bus is needed for credential storage; no action required unless other services fail",
        ));
    }
    if flag("docker_desktop_installed") == Some(true) && facts.get("creds_store").is_none() {
        recommendations.push(Recommendation::advisory(
            Severity::Low,
            "Docker Desktop ships its own helper",
            "Signing in through Docker Desktop configures `\"credsStore\": \"desktop\"` automatically",
        ));
    }

    prioritize(recommendations)
}
