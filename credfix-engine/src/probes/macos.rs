//! macOS probes: Keychain, Homebrew, Docker Desktop

use serde_json::json;

use super::packages::PackageManager;
use super::Facts;
use crate::context::{ProbeContext, SecretStoreStatus};
use crate::model::{Issue, IssueType, Severity};

pub async fn probe(ctx: &ProbeContext, facts: &mut Facts, issues: &mut Vec<Issue>) -> Option<String> {
    let version = ctx
        .run("sw_vers", &["-productVersion"])
        .await
        .ok()
        .map(|o| o.stdout.trim().to_string());
    facts.insert("macos_version".into(), json!(version));

    let keychains: Vec<String> = match ctx.run("security", &["list-keychains", "-d", "user"]).await {
        Ok(output) => output
            .stdout
            .lines()
            .map(|l| l.trim().trim_matches('"').to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        Err(_) => Vec::new(),
    };
    facts.insert("keychains".into(), json!(keychains));

    // show-keychain-info fails on a locked keychain when no UI is allowed
    let locked = match ctx.run("security", &["show-keychain-info", "login.keychain-db"]).await {
        Ok(_) => Some(false),
        Err(e) if e.stderr().contains("could not be found") => None,
        Err(_) => Some(true),
    };
    facts.insert("keychain_locked".into(), json!(locked));

    match ctx.secret_store.check().await {
        SecretStoreStatus::Accessible => {
            facts.insert("keychain_accessible".into(), json!(true));
        }
        SecretStoreStatus::Inaccessible { reason } => {
            facts.insert("keychain_accessible".into(), json!(false));
            issues.push(Issue::new(
                "KEYCHAIN_INACCESSIBLE",
                IssueType::CredentialHelper,
                Severity::High,
                "The login keychain cannot be accessed",
                format!("keychain: {reason}"),
                "Unlock it with `security unlock-keychain login.keychain-db`, or repair it in Keychain Access",
            ));
        }
    }
    if keychains.is_empty() {
        issues.push(Issue::new(
            "NO_USER_KEYCHAIN",
            IssueType::CredentialHelper,
            Severity::High,
            "No user keychain is in the search list",
            "security list-keychains -d user: empty",
            "Restore the login keychain with `security list-keychains -d user -s login.keychain-db`",
        ));
    }

    let manager = PackageManager::detect(ctx).await;
    facts.insert("package_manager".into(), json!(manager));
    facts.insert(
        "docker_desktop_installed".into(),
        json!(ctx.system_path("/Applications/Docker.app").exists()),
    );

    Some("osxkeychain".to_string())
}
