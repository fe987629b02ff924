//! Socket access, `~/.docker` ownership, elevated sessions

use serde::Serialize;
use std::path::Path;

use super::ReportSection;
use crate::context::ProbeContext;
use crate::model::{Issue, IssueType, Severity};
use crate::platform::OsFamily;
use crate::repair::FixAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketAccess {
    Missing,
    ReadWrite,
    Denied,
    /// Named pipes and other non-file endpoints
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DirAccess {
    Missing,
    Ok,
    OwnedByOther,
    NotWritable,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PermissionsSection {
    pub socket: Option<SocketAccess>,
    pub docker_group: Option<bool>,
    pub docker_dir: Option<DirAccess>,
    pub elevated: bool,
    pub issues: Vec<Issue>,
    pub error: Option<String>,
}

impl ReportSection for PermissionsSection {
    fn fail(&mut self, error: String) {
        self.error = Some(error);
    }

    fn issues(&self) -> &[Issue] {
        &self.issues
    }
}

pub fn socket_access(path: &Path) -> SocketAccess {
    if path.to_string_lossy().starts_with(r"\\.\pipe\") {
        return SocketAccess::Unknown;
    }
    if !path.exists() {
        return SocketAccess::Missing;
    }
    #[cfg(unix)]
    {
        use nix::unistd::{access, AccessFlags};
        match access(path, AccessFlags::R_OK | AccessFlags::W_OK) {
            Ok(()) => SocketAccess::ReadWrite,
            Err(_) => SocketAccess::Denied,
        }
    }
    #[cfg(not(unix))]
    {
        SocketAccess::Unknown
    }
}

/// Groups of the current user via `id -nG`
pub async fn user_groups(ctx: &ProbeContext) -> Option<Vec<String>> {
    let output = ctx.run("id", &["-nG"]).await.ok()?;
    Some(output.stdout.split_whitespace().map(str::to_string).collect())
}

/// Socket access plus group membership, and the issue they imply
pub async fn socket_findings(ctx: &ProbeContext) -> (SocketAccess, Option<bool>, Option<Issue>) {
    let access = socket_access(&ctx.docker_socket);
    if ctx.os != OsFamily::Linux {
        return (access, None, socket_issue(ctx, access, None));
    }
    let in_group = user_groups(ctx).await.map(|groups| groups.iter().any(|g| g == "docker"));
    (access, in_group, socket_issue(ctx, access, in_group))
}

fn socket_issue(ctx: &ProbeContext, access: SocketAccess, in_group: Option<bool>) -> Option<Issue> {
    if access != SocketAccess::Denied {
        return None;
    }
    let socket = ctx.docker_socket.display().to_string();
    let issue = Issue::new(
        "SOCKET_PERMISSION_DENIED",
        IssueType::Permissions,
        Severity::High,
        format!("User '{}' cannot read/write the Docker socket", ctx.user.name),
        format!("{socket}: read/write access denied for {}", ctx.user.name),
        "Add the user to the `docker` group, then log out and back in",
    );
    match (ctx.os, in_group) {
        // Already a member: the session predates the change
        (_, Some(true)) => Some(Issue {
            suggestion: "Log out and back in (or run `newgrp docker`) so the docker group membership takes effect"
                .to_string(),
            ..issue
        }),
        (OsFamily::Linux, _) => Some(issue.fixable_by(FixAction::AddUserToGroup {
            user: ctx.user.name.clone(),
            group: "docker".to_string(),
        })),
        _ => Some(issue),
    }
}

fn docker_dir_access(ctx: &ProbeContext) -> DirAccess {
    let dir = ctx.docker_dir();
    let Ok(metadata) = std::fs::metadata(&dir) else {
        return DirAccess::Missing;
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Some(uid) = ctx.user.uid {
            if metadata.uid() != uid && !ctx.user.elevated {
                return DirAccess::OwnedByOther;
            }
        }
        use nix::unistd::{access, AccessFlags};
        if access(&dir, AccessFlags::W_OK | AccessFlags::X_OK).is_err() {
            return DirAccess::NotWritable;
        }
    }
    #[cfg(not(unix))]
    {
        if metadata.permissions().readonly() {
            return DirAccess::NotWritable;
        }
    }
    DirAccess::Ok
}

pub async fn check(ctx: &ProbeContext) -> PermissionsSection {
    let mut section = PermissionsSection::default();

    let (access, in_group, issue) = socket_findings(ctx).await;
    section.socket = Some(access);
    section.docker_group = in_group;
    section.issues.extend(issue);

    let dir = ctx.docker_dir();
    let dir_access = docker_dir_access(ctx);
    section.docker_dir = Some(dir_access);
    match dir_access {
        DirAccess::OwnedByOther => section.issues.push(
            Issue::new(
                "DOCKER_DIR_NOT_OWNED",
                IssueType::Permissions,
                Severity::Medium,
                format!("{} is owned by another user", dir.display()),
                format!("{}: not owned by {}", dir.display(), ctx.user.name),
                format!("Take ownership with `sudo chown -R {0}: {1}`", ctx.user.name, dir.display()),
            )
            .fixable_by(FixAction::FixDockerDirOwnership {
                user: ctx.user.name.clone(),
            }),
        ),
        DirAccess::NotWritable => section.issues.push(Issue::new(
            "DOCKER_DIR_NOT_WRITABLE",
            IssueType::Permissions,
            Severity::Medium,
            format!("{} is not writable", dir.display()),
            format!("{}: write access denied", dir.display()),
            format!("Restore write permission with `chmod u+rwx {}`", dir.display()),
        )),
        DirAccess::Missing | DirAccess::Ok => {}
    }

    section.elevated = ctx.user.elevated;
    if ctx.user.elevated {
        section.issues.push(Issue::new(
            "ELEVATED_SESSION",
            IssueType::Permissions,
            Severity::Low,
            "Diagnostics are running with elevated privileges",
            format!("running as {}", ctx.user.name),
            "Run without sudo/administrator rights so the checks and repairs apply to your own Docker config",
        ));
    }

    section
}
