//! Package manager identity and credential-helper package availability

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::context::ProbeContext;
use crate::platform::OsFamily;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
    Pacman,
    Zypper,
    Apk,
    Brew,
}

impl PackageManager {
    const LINUX: [PackageManager; 6] = [
        PackageManager::Apt,
        PackageManager::Dnf,
        PackageManager::Yum,
        PackageManager::Pacman,
        PackageManager::Zypper,
        PackageManager::Apk,
    ];

    pub fn binary(&self) -> &'static str {
        match self {
            PackageManager::Apt => "apt-get",
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
            PackageManager::Pacman => "pacman",
            PackageManager::Zypper => "zypper",
            PackageManager::Apk => "apk",
            PackageManager::Brew => "brew",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "apt" => Some(PackageManager::Apt),
            "dnf" => Some(PackageManager::Dnf),
            "yum" => Some(PackageManager::Yum),
            "pacman" => Some(PackageManager::Pacman),
            "zypper" => Some(PackageManager::Zypper),
            "apk" => Some(PackageManager::Apk),
            "brew" => Some(PackageManager::Brew),
            _ => None,
        }
    }

    /// First package manager found on PATH for the platform
    pub async fn detect(ctx: &ProbeContext) -> Option<Self> {
        let candidates: &[PackageManager] = match ctx.os {
            OsFamily::Linux => &Self::LINUX,
            OsFamily::MacOs => &[PackageManager::Brew],
            _ => &[],
        };
        for manager in candidates {
            if ctx.command_exists(manager.binary()).await {
                debug!("Package manager: {}", manager);
                return Some(*manager);
            }
        }
        None
    }

    /// Package shipping `docker-credential-<helper>`, if this ecosystem has one
    pub fn helper_package(&self, helper: &str) -> Option<&'static str> {
        match (self, helper) {
            (PackageManager::Apt, "secretservice" | "pass") => Some("golang-docker-credential-helpers"),
            (PackageManager::Dnf | PackageManager::Yum | PackageManager::Zypper, "secretservice" | "pass") => {
                Some("docker-credential-helpers")
            }
            (PackageManager::Pacman, "secretservice") => Some("docker-credential-secretservice"),
            (PackageManager::Pacman, "pass") => Some("docker-credential-pass"),
            (PackageManager::Brew, "osxkeychain") => Some("docker-credential-helper"),
            _ => None,
        }
    }

    /// Command line that installs `package`
    pub fn install_command(&self, package: &str, elevated: bool) -> Vec<String> {
        let mut command: Vec<String> = Vec::new();
        if *self != PackageManager::Brew && !elevated {
            command.extend(["sudo".to_string(), "-n".to_string()]);
        }
        let args: &[&str] = match self {
            PackageManager::Apt => &["apt-get", "install", "-y"],
            PackageManager::Dnf => &["dnf", "install", "-y"],
            PackageManager::Yum => &["yum", "install", "-y"],
            PackageManager::Pacman => &["pacman", "-S", "--noconfirm"],
            PackageManager::Zypper => &["zypper", "--non-interactive", "install"],
            PackageManager::Apk => &["apk", "add"],
            PackageManager::Brew => &["brew", "install"],
        };
        command.extend(args.iter().map(|a| a.to_string()));
        command.push(package.to_string());
        command
    }

    /// Ask the package index whether `package` can be installed
    pub async fn is_offered(&self, ctx: &ProbeContext, package: &str) -> bool {
        match self {
            PackageManager::Apt => match ctx.run("apt-cache", &["policy", package]).await {
                Ok(output) => output
                    .stdout
                    .lines()
                    .any(|l| l.trim_start().starts_with("Candidate:") && !l.contains("(none)")),
                Err(_) => false,
            },
            PackageManager::Dnf | PackageManager::Yum => {
                ctx.run(self.binary(), &["info", package]).await.is_ok()
            }
            PackageManager::Pacman => ctx.run("pacman", &["-Si", package]).await.is_ok(),
            PackageManager::Zypper => ctx
                .run("zypper", &["--non-interactive", "info", package])
                .await
                .map(|o| !o.stdout.contains("not found"))
                .unwrap_or(false),
            PackageManager::Apk => ctx.run("apk", &["search", "-e", package]).await.is_ok(),
            PackageManager::Brew => ctx.run("brew", &["info", package]).await.is_ok(),
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PackageManager::Apt => "apt",
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
            PackageManager::Pacman => "pacman",
            PackageManager::Zypper => "zypper",
            PackageManager::Apk => "apk",
            PackageManager::Brew => "brew",
        };
        f.write_str(name)
    }
}

/// How a missing helper can be installed on this machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallHint {
    pub manager: PackageManager,
    pub package: String,
}

pub async fn install_hint(ctx: &ProbeContext, helper: &str) -> Option<InstallHint> {
    let manager = PackageManager::detect(ctx).await?;
    let package = manager.helper_package(helper)?;
    if !manager.is_offered(ctx, package).await {
        debug!("{} does not offer {}", manager, package);
        return None;
    }
    Some(InstallHint {
        manager,
        package: package.to_string(),
    })
}
