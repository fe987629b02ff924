//! Credential helper assessment shared by the probe set and the Docker checker
//!
//! Both callers build issues through these functions, so the same helper
//! state always yields the same issue (and merges to one after dedup).

use crate::context::ProbeContext;
use crate::execution::{helper_binary, test_helper, HelperStatus};
use crate::model::{Issue, IssueType, Severity};
use crate::platform::expected_helpers;
use crate::probes::packages::install_hint;
use crate::repair::FixAction;

/// Where the helper under test is referenced from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperRole {
    /// `credsStore` in config.json
    CredsStore,
    /// `credHelpers[registry]` in config.json
    CredHelper { registry: String },
    /// Found on PATH but not referenced by the config
    Path,
}

impl HelperRole {
    fn reference(&self, helper: &str) -> String {
        match self {
            HelperRole::CredsStore => format!("credsStore={helper}"),
            HelperRole::CredHelper { registry } => format!("credHelpers[{registry}]={helper}"),
            HelperRole::Path => format!("{} on PATH", helper_binary(helper)),
        }
    }
}

/// Test `helper` and turn a bad status into an issue
pub async fn assess_helper(ctx: &ProbeContext, helper: &str, role: &HelperRole) -> (HelperStatus, Option<Issue>) {
    let status = test_helper(ctx.runner.as_ref(), helper, ctx.settings.timeouts.helper()).await;
    let issue = match &status {
        HelperStatus::Working => None,
        HelperStatus::Broken { evidence } => Some(broken_helper(ctx, helper, role, evidence).await),
        HelperStatus::NotInstalled => Some(missing_helper(ctx, helper, role).await),
        HelperStatus::TimedOut { evidence } => Some(
            Issue::new(
                "HELPER_TIMEOUT",
                IssueType::CredentialHelper,
                Severity::High,
                format!("Credential helper '{helper}' did not answer in time"),
                evidence.clone(),
                "The helper is probably waiting on a locked keyring or a GUI unlock prompt; unlock it and retry",
            )
            .with_detail("helper", helper),
        ),
        HelperStatus::Failed { evidence } => Some(
            Issue::new(
                "HELPER_FAILED",
                IssueType::CredentialHelper,
                Severity::High,
                format!("Credential helper '{helper}' failed"),
                evidence.clone(),
                format!("Run `{} list` manually to see the full error", helper_binary(helper)),
            )
            .with_detail("helper", helper),
        ),
    };
    (status, issue)
}

async fn broken_helper(ctx: &ProbeContext, helper: &str, role: &HelperRole, evidence: &str) -> Issue {
    let issue = Issue::new(
        "HELPER_BROKEN",
        IssueType::CredentialHelper,
        Severity::Critical,
        format!("Credential helper '{helper}' is installed but cannot reach its secret store"),
        evidence,
        broken_suggestion(helper),
    )
    .with_detail("helper", helper)
    .with_detail("reference", role.reference(helper));

    if matches!(role, HelperRole::CredHelper { .. }) {
        return issue;
    }
    match working_alternative(ctx, helper).await {
        Some(alternative) => issue
            .with_detail("alternative", alternative.clone())
            .fixable_by(FixAction::SetCredsStore { helper: alternative }),
        None if *role == HelperRole::CredsStore => issue.fixable_by(FixAction::RemoveCredsStore),
        None => issue,
    }
}

fn broken_suggestion(helper: &str) -> String {
    match helper {
        "secretservice" => "No usable Secret Service session (common over SSH or headless). Unlock or start gnome-keyring, or switch to `pass`".to_string(),
        "pass" => "Initialise the password store with `gpg --gen-key` and `pass init <gpg-id>`".to_string(),
        "osxkeychain" => "Unlock the login keychain with `security unlock-keychain login.keychain-db`".to_string(),
        "wincred" => "Open Credential Manager and check that Windows Credentials are accessible".to_string(),
        other => format!("Reinstall or reconfigure docker-credential-{other}"),
    }
}

async fn missing_helper(ctx: &ProbeContext, helper: &str, role: &HelperRole) -> Issue {
    let reference = role.reference(helper);
    let issue = Issue::new(
        "HELPER_NOT_INSTALLED",
        IssueType::CredentialHelper,
        Severity::Critical,
        format!("Configured credential helper '{helper}' is not installed"),
        format!("{reference}: {} not found", helper_binary(helper)),
        format!("Install {} or remove the reference from config.json", helper_binary(helper)),
    )
    .with_detail("helper", helper);

    match install_hint(ctx, helper).await {
        Some(hint) => issue.with_detail("package", hint.package.clone()).fixable_by(FixAction::InstallHelper {
            helper: helper.to_string(),
            manager: hint.manager,
            package: hint.package,
        }),
        None => issue,
    }
}

/// Expected helpers present on PATH, in preference order
pub async fn path_helpers(ctx: &ProbeContext) -> Vec<String> {
    let mut found = Vec::new();
    for helper in expected_helpers(ctx.os) {
        if ctx.command_exists(&helper_binary(helper)).await {
            found.push(helper.to_string());
        }
    }
    found
}

async fn working_alternative(ctx: &ProbeContext, broken: &str) -> Option<String> {
    for helper in path_helpers(ctx).await {
        if helper == broken {
            continue;
        }
        let status = test_helper(ctx.runner.as_ref(), &helper, ctx.settings.timeouts.helper()).await;
        if status.is_working() {
            return Some(helper);
        }
    }
    None
}

/// No `credsStore`, no `credHelpers`: look at what is available on PATH.
///
/// `preferred` is the helper the platform probe would install.
pub async fn assess_unconfigured(ctx: &ProbeContext, preferred: Option<&str>) -> (Vec<String>, Option<Issue>) {
    let available = path_helpers(ctx).await;

    let Some(first) = available.first() else {
        let expected = expected_helpers(ctx.os)
            .iter()
            .map(|h| helper_binary(h))
            .collect::<Vec<_>>()
            .join(", ");
        let issue = Issue::new(
            "NO_CREDENTIAL_HELPER",
            IssueType::CredentialHelper,
            Severity::Critical,
            "No credential helper installed",
            format!("credsStore not set; none of [{expected}] on PATH"),
            "Install a credential helper for this platform and set `credsStore` in config.json",
        );
        let issue = match preferred {
            Some(helper) => match install_hint(ctx, helper).await {
                Some(hint) => issue
                    .with_detail("helper", helper)
                    .with_detail("package", hint.package.clone())
                    .fixable_by(FixAction::InstallHelper {
                        helper: helper.to_string(),
                        manager: hint.manager,
                        package: hint.package,
                    }),
                None => issue.with_detail("helper", helper),
            },
            None => issue,
        };
        return (available, Some(issue));
    };

    let (status, issue) = assess_helper(ctx, first, &HelperRole::Path).await;
    if issue.is_some() {
        return (available, issue);
    }
    if status.is_working() {
        let issue = Issue::new(
            "HELPER_NOT_CONFIGURED",
            IssueType::CredentialHelper,
            Severity::Medium,
            format!("'{first}' is installed but Docker is not configured to use it"),
            format!("credsStore not set; {} on PATH", helper_binary(first)),
            format!("Set `\"credsStore\": \"{first}\"` so credentials are not stored base64-encoded in config.json"),
        )
        .with_detail("helper", first.clone())
        .fixable_by(FixAction::SetCredsStore { helper: first.clone() });
        return (available, Some(issue));
    }
    (available, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context, ScriptRunner};

    #[tokio::test]
    async fn test_broken_creds_store_switches_to_working_alternative() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::new()
            .exit("docker-credential-secretservice list", 1, "Cannot autolaunch D-Bus without X11 $DISPLAY")
            .ok("which docker-credential-secretservice", "/usr/bin/docker-credential-secretservice")
            .ok("which docker-credential-pass", "/usr/bin/docker-credential-pass")
            .ok("docker-credential-pass list", "{}");
        let ctx = test_context(&dir, runner);

        let (status, issue) = assess_helper(&ctx, "secretservice", &HelperRole::CredsStore).await;
        assert!(matches!(status, HelperStatus::Broken { .. }));
        let issue = issue.unwrap();
        assert_eq!(issue.issue_type, IssueType::CredentialHelper);
        assert_eq!(issue.severity, Severity::Critical);
        assert_eq!(issue.remedy, Some(FixAction::SetCredsStore { helper: "pass".into() }));
    }

    #[tokio::test]
    async fn test_broken_creds_store_without_alternative_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::new().exit("docker-credential-secretservice list", 1, "");
        let ctx = test_context(&dir, runner);
        let (_, issue) = assess_helper(&ctx, "secretservice", &HelperRole::CredsStore).await;
        assert_eq!(issue.unwrap().remedy, Some(FixAction::RemoveCredsStore));
    }

    #[tokio::test]
    async fn test_broken_cred_helper_is_manual() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::new().exit("docker-credential-ecr-login list", 1, "no credentials");
        let ctx = test_context(&dir, runner);
        let role = HelperRole::CredHelper { registry: "123.dkr.ecr.us-east-1.amazonaws.com".into() };
        let (_, issue) = assess_helper(&ctx, "ecr-login", &role).await;
        let issue = issue.unwrap();
        assert_eq!(issue.severity, Severity::Critical);
        assert!(!issue.auto_fixable);
        assert!(issue.remedy.is_none());
    }

    #[tokio::test]
    async fn test_nothing_installed_offers_package() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::new()
            .ok("which apt-get", "/usr/bin/apt-get")
            .ok("apt-cache policy golang-docker-credential-helpers", "  Candidate: 0.6.4\n");
        let ctx = test_context(&dir, runner);

        let (available, issue) = assess_unconfigured(&ctx, Some("pass")).await;
        assert!(available.is_empty());
        let issue = issue.unwrap();
        assert_eq!(issue.code, "NO_CREDENTIAL_HELPER");
        assert!(matches!(issue.remedy, Some(FixAction::InstallHelper { ref helper, .. }) if helper == "pass"));
    }

    #[tokio::test]
    async fn test_installed_but_unconfigured_helper() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::new()
            .ok("which docker-credential-pass", "/usr/bin/docker-credential-pass")
            .ok("docker-credential-pass list", "{}");
        let ctx = test_context(&dir, runner);

        let (_, issue) = assess_unconfigured(&ctx, None).await;
        let issue = issue.unwrap();
        assert_eq!(issue.severity, Severity::Medium);
        assert_eq!(issue.remedy, Some(FixAction::SetCredsStore { helper: "pass".into() }));
    }
}
