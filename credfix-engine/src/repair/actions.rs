//! Corrective operations and the concrete steps behind them

use serde::{Deserialize, Serialize};
use std::fmt;

use super::RiskLevel;
use crate::context::ProbeContext;
use crate::docker_config::ConfigEdit;
use crate::execution::render_command;
use crate::platform::OsFamily;
use crate::probes::packages::PackageManager;

/// Minimal corrective operation attached to a fixable issue
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FixAction {
    /// Install the helper package, then point `credsStore` at it
    InstallHelper {
        helper: String,
        manager: PackageManager,
        package: String,
    },
    SetCredsStore { helper: String },
    RemoveCredsStore,
    /// Replace an unparsable config with an empty one
    ResetConfig,
    MigrateAuths,
    FixDockerDirOwnership { user: String },
    AddUserToGroup { user: String, group: String },
    StartDaemon,
}

/// One concrete operation of a fix
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    Run { program: String, args: Vec<String> },
    Edit { edit: ConfigEdit },
}

impl Step {
    fn run(command: Vec<String>) -> Self {
        let mut parts = command.into_iter();
        let program = parts.next().unwrap_or_default();
        Step::Run {
            program,
            args: parts.collect(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Step::Run { program, args } => {
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                render_command(program, &args)
            }
            Step::Edit { edit } => match edit {
                ConfigEdit::SetCredsStore { helper } => format!("set credsStore to \"{helper}\" in config.json"),
                ConfigEdit::RemoveCredsStore => "remove credsStore from config.json".to_string(),
                ConfigEdit::MigrateStringAuths => "convert legacy auths entries in config.json".to_string(),
                ConfigEdit::Reset => "reset config.json to an empty configuration".to_string(),
            },
        }
    }
}

impl FixAction {
    pub fn risk(&self) -> RiskLevel {
        match self {
            FixAction::StartDaemon | FixAction::MigrateAuths => RiskLevel::Low,
            FixAction::InstallHelper { .. }
            | FixAction::SetCredsStore { .. }
            | FixAction::FixDockerDirOwnership { .. } => RiskLevel::Medium,
            FixAction::AddUserToGroup { .. } | FixAction::RemoveCredsStore => RiskLevel::High,
            FixAction::ResetConfig => RiskLevel::Critical,
        }
    }

    /// Touches the daemon or the login session
    pub fn requires_restart(&self) -> bool {
        matches!(self, FixAction::StartDaemon | FixAction::AddUserToGroup { .. })
    }

    /// Touches where registry credentials live
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            FixAction::InstallHelper { .. }
                | FixAction::SetCredsStore { .. }
                | FixAction::RemoveCredsStore
                | FixAction::ResetConfig
                | FixAction::MigrateAuths
        )
    }

    /// Edits config.json (and so needs it backed up)
    pub fn edits_config(&self) -> bool {
        self.config_edit().is_some()
    }

    fn config_edit(&self) -> Option<ConfigEdit> {
        match self {
            FixAction::InstallHelper { helper, .. } | FixAction::SetCredsStore { helper } => {
                Some(ConfigEdit::SetCredsStore { helper: helper.clone() })
            }
            FixAction::RemoveCredsStore => Some(ConfigEdit::RemoveCredsStore),
            FixAction::ResetConfig => Some(ConfigEdit::Reset),
            FixAction::MigrateAuths => Some(ConfigEdit::MigrateStringAuths),
            _ => None,
        }
    }

    pub fn slug(&self) -> String {
        match self {
            FixAction::InstallHelper { helper, .. } => format!("install-helper-{helper}"),
            FixAction::SetCredsStore { helper } => format!("set-creds-store-{helper}"),
            FixAction::RemoveCredsStore => "remove-creds-store".to_string(),
            FixAction::ResetConfig => "reset-config".to_string(),
            FixAction::MigrateAuths => "migrate-auths".to_string(),
            FixAction::FixDockerDirOwnership { user } => format!("chown-docker-dir-{user}"),
            FixAction::AddUserToGroup { user, group } => format!("add-{user}-to-{group}"),
            FixAction::StartDaemon => "start-daemon".to_string(),
        }
    }

    /// Concrete steps for this machine, in execution order
    pub fn steps(&self, ctx: &ProbeContext) -> Vec<Step> {
        let sudo = |command: &[&str]| -> Vec<String> {
            let mut line: Vec<String> = Vec::new();
            if !ctx.user.elevated {
                line.extend(["sudo".to_string(), "-n".to_string()]);
            }
            line.extend(command.iter().map(|s| s.to_string()));
            line
        };

        let mut steps = match self {
            FixAction::InstallHelper { manager, package, .. } => {
                vec![Step::run(manager.install_command(package, ctx.user.elevated))]
            }
            FixAction::FixDockerDirOwnership { user } => {
                let owner = format!("{user}:");
                let dir = ctx.docker_dir().display().to_string();
                vec![Step::run(sudo(&["chown", "-R", owner.as_str(), dir.as_str()]))]
            }
            FixAction::AddUserToGroup { user, group } => vec![Step::run(sudo(&["usermod", "-aG", group.as_str(), user.as_str()]))],
            FixAction::StartDaemon => vec![Step::run(match ctx.os {
                OsFamily::MacOs => vec!["open".to_string(), "-a".to_string(), "Docker".to_string()],
                OsFamily::Windows => vec![
                    "powershell".to_string(),
                    "-NoProfile".to_string(),
                    "-Command".to_string(),
                    r"Start-Process 'C:\Program Files\Docker\Docker\Docker Desktop.exe'".to_string(),
                ],
                _ => sudo(&["systemctl", "start", "docker"]),
            })],
            _ => Vec::new(),
        };
        if let Some(edit) = self.config_edit() {
            steps.push(Step::Edit { edit });
        }
        steps
    }
}

impl fmt::Display for FixAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixAction::InstallHelper { helper, manager, package } => {
                write!(f, "Install {package} with {manager} and use the '{helper}' helper")
            }
            FixAction::SetCredsStore { helper } => write!(f, "Use the '{helper}' credential helper"),
            FixAction::RemoveCredsStore => write!(f, "Stop using the broken credential helper"),
            FixAction::ResetConfig => write!(f, "Reset the malformed Docker config file"),
            FixAction::MigrateAuths => write!(f, "Migrate legacy auth entries"),
            FixAction::FixDockerDirOwnership { user } => write!(f, "Give {user} ownership of ~/.docker"),
            FixAction::AddUserToGroup { user, group } => write!(f, "Add {user} to the {group} group"),
            FixAction::StartDaemon => write!(f, "Start the Docker daemon"),
        }
    }
}
