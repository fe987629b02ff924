//! Docker client config checks: existence, JSON validity, structure, helpers

use serde::Serialize;
use std::collections::BTreeMap;

use super::ReportSection;
use crate::context::ProbeContext;
use crate::docker_config::{cred_helpers, creds_store, validate, ConfigState, ConfigValidation};
use crate::execution::HelperStatus;
use crate::model::{Issue, IssueType, Severity};
use crate::probes::helpers::{assess_helper, HelperRole};
use crate::repair::FixAction;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigurationSection {
    pub path: String,
    pub exists: bool,
    pub valid_json: bool,
    pub creds_store: Option<String>,
    pub cred_helpers: BTreeMap<String, String>,
    pub validation: Option<ConfigValidation>,
    pub helper_status: Option<HelperStatus>,
    pub warnings: Vec<String>,
    pub issues: Vec<Issue>,
    pub error: Option<String>,
}

impl ReportSection for ConfigurationSection {
    fn fail(&mut self, error: String) {
        self.error = Some(error);
    }

    fn issues(&self) -> &[Issue] {
        &self.issues
    }
}

/// File-level findings; no external commands
pub fn inspect_file(ctx: &ProbeContext) -> ConfigurationSection {
    let path = ctx.docker_config.display().to_string();
    let mut section = ConfigurationSection {
        path: path.clone(),
        ..Default::default()
    };

    match ctx.config_file().load() {
        ConfigState::Missing => {
            // Docker creates it on first login
            section
                .warnings
                .push(format!("{path} does not exist; Docker defaults apply"));
        }
        ConfigState::Unreadable { error } => {
            section.exists = true;
            section.issues.push(Issue::new(
                "CONFIG_UNREADABLE",
                IssueType::Configuration,
                Severity::High,
                "Docker config file cannot be read",
                format!("{path}: {error}"),
                format!("Check ownership and permissions of {path}"),
            ));
        }
        ConfigState::Malformed { error } => {
            section.exists = true;
            section.issues.push(
                Issue::new(
                    "CONFIG_MALFORMED",
                    IssueType::Configuration,
                    Severity::High,
                    "Docker config file is not valid JSON",
                    format!("{path}: {error}"),
                    "Fix the JSON by hand, or reset the file to an empty config (a backup is taken first)",
                )
                .fixable_by(FixAction::ResetConfig),
            );
        }
        ConfigState::Parsed(value) => {
            section.exists = true;
            section.valid_json = true;
            section.creds_store = creds_store(&value).map(str::to_string);
            section.cred_helpers = cred_helpers(&value);

            let validation = validate(&value);
            section.warnings.extend(validation.warnings.iter().cloned());

            if validation.auths_is_string {
                section.issues.push(
                    Issue::new(
                        "AUTHS_INVALID_FORMAT",
                        IssueType::Configuration,
                        Severity::Medium,
                        "`auths` uses the deprecated string format",
                        format!("{path}: auths is a string"),
                        "Run `docker login` again after the legacy value is replaced with an empty object",
                    )
                    .fixable_by(FixAction::MigrateAuths),
                );
            }
            let structural: Vec<&String> = validation
                .errors
                .iter()
                .filter(|e| !(validation.auths_is_string && e.starts_with("`auths` is a string")))
                .collect();
            if !structural.is_empty() {
                section.issues.push(Issue::new(
                    "CONFIG_INVALID",
                    IssueType::Configuration,
                    Severity::Medium,
                    "Docker config file has invalid entries",
                    format!(
                        "{path}: {}",
                        structural.iter().map(|s| s.as_str()).collect::<Vec<_>>().join("; ")
                    ),
                    "Correct the listed keys by hand; Docker ignores or rejects them",
                ));
            }
            if !validation.string_auths.is_empty() {
                section.issues.push(
                    Issue::new(
                        "DEPRECATED_AUTH_ENTRIES",
                        IssueType::Configuration,
                        Severity::Low,
                        "Some `auths` entries use the legacy string format",
                        format!("{path}: string auths for {}", validation.string_auths.join(", ")),
                        "Convert them to `{\"auth\": \"...\"}` objects",
                    )
                    .fixable_by(FixAction::MigrateAuths),
                );
            }
            section.validation = Some(validation);
        }
    }

    section
}

pub async fn check(ctx: &ProbeContext) -> ConfigurationSection {
    let mut section = inspect_file(ctx);

    // A declared helper is only valid if it answers `list`
    if let Some(helper) = section.creds_store.clone() {
        let (status, issue) = assess_helper(ctx, &helper, &HelperRole::CredsStore).await;
        section.helper_status = Some(status);
        section.issues.extend(issue);
    }
    for (registry, helper) in section.cred_helpers.clone() {
        let (_, issue) = assess_helper(ctx, &helper, &HelperRole::CredHelper { registry }).await;
        section.issues.extend(issue);
    }

    section
}
