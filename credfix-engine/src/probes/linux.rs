//! Linux probes: distribution, desktop session, D-Bus, Secret Service,
//! keyring lock state, package manager, Docker service, groups and socket.

use serde_json::{json, Value};
use tracing::debug;

use super::packages::PackageManager;
use super::Facts;
use crate::context::ProbeContext;
use crate::docker::permissions::socket_findings;
use crate::docker_config::creds_store;
use crate::model::{Issue, IssueType, Severity};

/// Release files in lookup order; the first readable one wins
const RELEASE_FILES: [&str; 5] = [
    "/etc/os-release",
    "/usr/lib/os-release",
    "/etc/lsb-release",
    "/etc/redhat-release",
    "/etc/debian_version",
];

const DESKTOP_PROCESSES: [(&str, &str); 7] = [
    ("gnome-shell", "GNOME"),
    ("plasmashell", "KDE"),
    ("xfce4-session", "XFCE"),
    ("cinnamon", "Cinnamon"),
    ("mate-session", "MATE"),
    ("lxsession", "LXDE"),
    ("lxqt-session", "LXQt"),
];

pub async fn probe(ctx: &ProbeContext, facts: &mut Facts, issues: &mut Vec<Issue>) -> Option<String> {
    facts.insert("distribution".into(), distribution(ctx).unwrap_or(Value::Null));

    let desktop = desktop_environment(ctx).await;
    let headless = desktop.is_none() && ctx.env_var("DISPLAY").is_none() && ctx.env_var("WAYLAND_DISPLAY").is_none();
    facts.insert("desktop_environment".into(), json!(desktop));
    facts.insert("headless".into(), json!(headless));

    let session_bus = bus_reachable(ctx, "--session").await;
    let system_bus = bus_reachable(ctx, "--system").await;
    facts.insert("dbus_session".into(), json!(session_bus));
    facts.insert("dbus_system".into(), json!(system_bus));

    let secret_service = session_bus && secret_service_reachable(ctx).await;
    facts.insert("secret_service".into(), json!(secret_service));
    let locked = if secret_service { keyring_locked(ctx).await } else { None };
    facts.insert("keyring_locked".into(), json!(locked));

    let manager = PackageManager::detect(ctx).await;
    facts.insert("package_manager".into(), json!(manager));

    let preferred = if secret_service { "secretservice" } else { "pass" };
    if let Some(manager) = manager {
        let offered = match manager.helper_package(preferred) {
            Some(package) => manager.is_offered(ctx, package).await,
            None => false,
        };
        facts.insert("helper_package_offered".into(), json!(offered));
    }

    facts.insert("docker_service".into(), json!(docker_service(ctx).await));

    let (access, in_group, socket_issue) = socket_findings(ctx).await;
    facts.insert("docker_socket".into(), json!(access));
    facts.insert("docker_group".into(), json!(in_group));
    issues.extend(socket_issue);

    // Secret Service problems only matter when Docker is told to use it
    let configured = ctx.config_file().load();
    let uses_secretservice = configured
        .value()
        .and_then(creds_store)
        .map(|h| h == "secretservice")
        .unwrap_or(false);
    if uses_secretservice {
        if !secret_service {
            issues.push(Issue::new(
                "SECRET_SERVICE_UNAVAILABLE",
                IssueType::CredentialHelper,
                Severity::High,
                "The Secret Service API is not reachable on the session bus",
                format!(
                    "dbus session bus: {}; org.freedesktop.secrets: unreachable",
                    if session_bus { "reachable" } else { "unreachable" }
                ),
                if headless {
                    "No desktop session: use the `pass` helper, or start gnome-keyring-daemon inside a D-Bus session"
                } else {
                    "Start the keyring daemon (gnome-keyring or KWallet) for this session"
                },
            ));
        } else if locked == Some(true) {
            issues.push(Issue::new(
                "KEYRING_LOCKED",
                IssueType::CredentialHelper,
                Severity::Medium,
                "The default keyring is locked",
                "org.freedesktop.secrets default collection: Locked=true",
                "Unlock the login keyring (log in graphically, or use `gnome-keyring-daemon --unlock`)",
            ));
        }
    }

    Some(preferred.to_string())
}

/// Distribution identity from the first readable release file
pub fn distribution(ctx: &ProbeContext) -> Option<Value> {
    for candidate in RELEASE_FILES {
        let Ok(content) = std::fs::read_to_string(ctx.system_path(candidate)) else {
            continue;
        };
        debug!("Distribution from {}", candidate);
        let name = match candidate {
            "/etc/os-release" | "/usr/lib/os-release" => {
                key_value(&content, "PRETTY_NAME").or_else(|| key_value(&content, "NAME"))
            }
            "/etc/lsb-release" => key_value(&content, "DISTRIB_DESCRIPTION").or_else(|| key_value(&content, "DISTRIB_ID")),
            "/etc/debian_version" => Some(format!("Debian {}", content.trim())),
            _ => content.lines().next().map(|l| l.trim().to_string()),
        };
        let id = key_value(&content, "ID").or_else(|| key_value(&content, "DISTRIB_ID"));
        return Some(json!({ "name": name, "id": id, "source": candidate }));
    }
    None
}

fn key_value(content: &str, key: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k.trim() == key).then(|| v.trim().trim_matches('"').to_string())
    })
}

/// Environment variables first, then running-process heuristics
pub async fn desktop_environment(ctx: &ProbeContext) -> Option<String> {
    for var in ["XDG_CURRENT_DESKTOP", "DESKTOP_SESSION", "GDMSESSION"] {
        if let Some(value) = ctx.env_var(var) {
            return Some(value.to_string());
        }
    }
    let output = ctx.run("ps", &["-eo", "comm"]).await.ok()?;
    let processes: Vec<&str> = output.stdout.lines().map(str::trim).collect();
    DESKTOP_PROCESSES
        .iter()
        .find(|(process, _)| processes.contains(process))
        .map(|(_, desktop)| desktop.to_string())
}

async fn bus_reachable(ctx: &ProbeContext, bus: &str) -> bool {
    ctx.run(
        "dbus-send",
        &[
            bus,
            "--dest=org.freedesktop.DBus",
            "--type=method_call",
            "--print-reply",
            "/org/freedesktop/DBus",
            "org.freedesktop.DBus.ListNames",
        ],
    )
    .await
    .is_ok()
}

async fn secret_service_reachable(ctx: &ProbeContext) -> bool {
    ctx.run(
        "dbus-send",
        &[
            "--session",
            "--print-reply",
            "--dest=org.freedesktop.secrets",
            "/org/freedesktop/secrets",
            "org.freedesktop.DBus.Properties.Get",
            "string:org.freedesktop.Secret.Service",
            "string:Collections",
        ],
    )
    .await
    .is_ok()
}

async fn keyring_locked(ctx: &ProbeContext) -> Option<bool> {
    let output = ctx
        .run(
            "dbus-send",
            &[
                "--session",
                "--print-reply",
                "--dest=org.freedesktop.secrets",
                "/org/freedesktop/secrets/aliases/default",
                "org.freedesktop.DBus.Properties.Get",
                "string:org.freedesktop.Secret.Collection",
                "string:Locked",
            ],
        )
        .await
        .ok()?;
    if output.stdout.contains("boolean true") {
        Some(true)
    } else if output.stdout.contains("boolean false") {
        Some(false)
    } else {
        None
    }
}

/// `systemctl is-active docker`: "active", "inactive", "failed"... or null
async fn docker_service(ctx: &ProbeContext) -> Option<String> {
    match ctx.run("systemctl", &["is-active", "docker"]).await {
        Ok(output) => Some(output.stdout.trim().to_string()),
        // is-active exits non-zero for anything but "active"
        Err(crate::execution::ExecutionError::NonZeroExit { stdout, .. }) if !stdout.trim().is_empty() => {
            Some(stdout.trim().to_string())
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context, ScriptRunner};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const SESSION_PING: &str = "dbus-send --session --dest=org.freedesktop.DBus --type=method_call --print-reply /org/freedesktop/DBus org.freedesktop.DBus.ListNames";
    const SECRETS_GET: &str = "dbus-send --session --print-reply --dest=org.freedesktop.secrets /org/freedesktop/secrets org.freedesktop.DBus.Properties.Get string:org.freedesktop.Secret.Service string:Collections";

    #[test]
    fn test_first_release_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir, ScriptRunner::new());
        let etc = ctx.system_path("/etc");
        std::fs::create_dir_all(&etc).unwrap();
        std::fs::write(etc.join("debian_version"), "12.5\n").unwrap();
        assert_eq!(distribution(&ctx).unwrap()["name"], json!("Debian 12.5"));

        std::fs::write(etc.join("os-release"), "NAME=\"Ubuntu\"\nID=ubuntu\nPRETTY_NAME=\"Ubuntu 24.04 LTS\"\n").unwrap();
        let distro = distribution(&ctx).unwrap();
        assert_eq!(distro["name"], json!("Ubuntu 24.04 LTS"));
        assert_eq!(distro["id"], json!("ubuntu"));
        assert_eq!(distro["source"], json!("/etc/os-release"));
    }

    #[tokio::test]
    async fn test_desktop_from_env_then_processes() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = BTreeMap::new();
        env.insert("XDG_CURRENT_DESKTOP".to_string(), "KDE".to_string());
        let ctx = test_context(&dir, ScriptRunner::new()).with_env(env);
        assert_eq!(desktop_environment(&ctx).await.as_deref(), Some("KDE"));

        let runner = ScriptRunner::new().ok("ps -eo comm", "COMMAND\nsystemd\ngnome-shell\nbash\n");
        let ctx = test_context(&dir, runner);
        assert_eq!(desktop_environment(&ctx).await.as_deref(), Some("GNOME"));
    }

    #[tokio::test]
    async fn test_headless_secretservice_reports_unreachable_service() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir, ScriptRunner::new());
        std::fs::create_dir_all(ctx.docker_dir()).unwrap();
        std::fs::write(&ctx.docker_config, r#"{"auths": {}, "credsStore": "secretservice"}"#).unwrap();

        let mut facts = Facts::new();
        let mut issues = Vec::new();
        let preferred = probe(&ctx, &mut facts, &mut issues).await;
        assert_eq!(preferred.as_deref(), Some("pass"));
        assert_eq!(facts["headless"], json!(true));
        assert_eq!(facts["secret_service"], json!(false));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, "SECRET_SERVICE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_desktop_session_prefers_secretservice() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::new()
            .ok(SESSION_PING, "method return")
            .ok(SECRETS_GET, "variant array [ object path \"/org/freedesktop/secrets/collection/login\" ]")
            .ok("systemctl is-active docker", "active\n");
        let mut ctx = test_context(&dir, runner);
        ctx.env = Arc::new(BTreeMap::from([("XDG_CURRENT_DESKTOP".to_string(), "GNOME".to_string())]));

        let mut facts = Facts::new();
        let mut issues = Vec::new();
        let preferred = probe(&ctx, &mut facts, &mut issues).await;
        assert_eq!(preferred.as_deref(), Some("secretservice"));
        assert_eq!(facts["docker_service"], json!("active"));
        assert_eq!(facts["dbus_system"], json!(false));
        assert!(issues.is_empty());
    }
}
