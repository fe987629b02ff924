//! Windows probes: Credential Manager, Docker Desktop registration and service,
//! administrator rights.

use serde_json::json;

use super::Facts;
use crate::context::ProbeContext;
use crate::model::{Issue, IssueType, Severity};

pub async fn probe(ctx: &ProbeContext, facts: &mut Facts, issues: &mut Vec<Issue>) -> Option<String> {
    let version = ctx.run("cmd", &["/C", "ver"]).await.ok().map(|o| o.stdout.trim().to_string());
    facts.insert("windows_version".into(), json!(version));

    match ctx.run("cmdkey", &["/list"]).await {
        Ok(output) => {
            let docker_entries = output
                .stdout
                .lines()
                .filter(|l| l.trim_start().starts_with("Target:") && l.to_lowercase().contains("docker"))
                .count();
            facts.insert("credential_manager".into(), json!(true));
            facts.insert("credential_manager_docker_entries".into(), json!(docker_entries));
        }
        Err(e) => {
            facts.insert("credential_manager".into(), json!(false));
            issues.push(Issue::new(
                "CREDENTIAL_MANAGER_UNAVAILABLE",
                IssueType::CredentialHelper,
                Severity::High,
                "Windows Credential Manager is not accessible",
                e.evidence(),
                "Make sure the Credential Manager service (VaultSvc) is running and you are in an interactive session",
            ));
        }
    }

    let desktop = ctx
        .run("reg", &["query", r"HKLM\SOFTWARE\Docker Inc.\Docker Desktop"])
        .await
        .is_ok();
    facts.insert("docker_desktop_installed".into(), json!(desktop));

    let service = match ctx.run("sc", &["query", "com.docker.service"]).await {
        Ok(output) if output.stdout.contains("RUNNING") => Some("running"),
        Ok(_) => Some("stopped"),
        Err(_) => None,
    };
    facts.insert("docker_service".into(), json!(service));

    // `net session` only succeeds with administrator rights
    let elevated = ctx.run("net", &["session"]).await.is_ok();
    facts.insert("elevated".into(), json!(elevated));
    facts.insert("package_manager".into(), json!(null));

    Some("wincred".to_string())
}
