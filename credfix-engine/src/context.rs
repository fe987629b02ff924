//! Everything a probe needs from the outside world
//!
//! Probes never read ambient state directly: the runner, environment
//! snapshot, filesystem root and paths all come through `ProbeContext`, which
//! is cloned into each concurrently running probe.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::docker::system::{ResourceSampler, SysinfoSampler};
use crate::docker_config::DockerConfigFile;
use crate::execution::{CommandOutput, CommandRunner, ExecutionError, SystemRunner};
use crate::platform::OsFamily;
use crate::settings::Settings;

/// The user the scan runs as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub name: String,
    pub uid: Option<u32>,
    /// root on Unix; on Windows this is refined by the probe set
    pub elevated: bool,
}

impl UserIdentity {
    pub fn current() -> Self {
        #[cfg(unix)]
        {
            let uid = nix::unistd::geteuid();
            let name = nix::unistd::User::from_uid(uid)
                .ok()
                .flatten()
                .map(|u| u.name)
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "unknown".to_string());
            Self {
                name,
                uid: Some(uid.as_raw()),
                elevated: uid.is_root(),
            }
        }
        #[cfg(not(unix))]
        {
            Self {
                name: std::env::var("USERNAME").unwrap_or_else(|_| "unknown".to_string()),
                uid: None,
                elevated: false,
            }
        }
    }
}

/// Result of touching the platform secret store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SecretStoreStatus {
    Accessible,
    Inaccessible { reason: String },
}

impl SecretStoreStatus {
    pub fn is_accessible(&self) -> bool {
        matches!(self, SecretStoreStatus::Accessible)
    }
}

#[async_trait]
pub trait SecretStoreAccess: Send + Sync {
    async fn check(&self) -> SecretStoreStatus;
}

/// Keychain / Credential Manager through `keyring`, Secret Service through D-Bus
pub struct NativeSecretStore {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl NativeSecretStore {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }
}

#[async_trait]
impl SecretStoreAccess for NativeSecretStore {
    async fn check(&self) -> SecretStoreStatus {
        if cfg!(target_os = "linux") {
            let result = self
                .runner
                .run(
                    "dbus-send",
                    &[
                        "--session",
                        "--print-reply",
                        "--dest=org.freedesktop.secrets",
                        "/org/freedesktop/secrets",
                        "org.freedesktop.DBus.Peer.Ping",
                    ],
                    self.timeout,
                )
                .await;
            return match result {
                Ok(_) => SecretStoreStatus::Accessible,
                Err(e) => SecretStoreStatus::Inaccessible { reason: e.evidence() },
            };
        }

        // Read-only lookup of an entry that normally does not exist
        let lookup = tokio::task::spawn_blocking(|| {
            keyring::Entry::new("docker-credential-fix", "access-probe").and_then(|entry| entry.get_password())
        });
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(Ok(_))) | Ok(Ok(Err(keyring::Error::NoEntry))) => SecretStoreStatus::Accessible,
            Ok(Ok(Err(e))) => SecretStoreStatus::Inaccessible { reason: e.to_string() },
            Ok(Err(e)) => SecretStoreStatus::Inaccessible { reason: e.to_string() },
            Err(_) => SecretStoreStatus::Inaccessible {
                reason: "secret store did not answer in time".to_string(),
            },
        }
    }
}

#[derive(Clone)]
pub struct ProbeContext {
    pub runner: Arc<dyn CommandRunner>,
    pub settings: Arc<Settings>,
    pub os: OsFamily,
    pub env: Arc<BTreeMap<String, String>>,
    /// Prefix for absolute system paths such as `/etc/os-release`
    pub fs_root: PathBuf,
    pub home: PathBuf,
    pub docker_config: PathBuf,
    pub docker_socket: PathBuf,
    pub user: UserIdentity,
    pub secret_store: Arc<dyn SecretStoreAccess>,
    pub resources: Arc<dyn ResourceSampler>,
}

impl ProbeContext {
    /// Context wired to the real machine
    pub fn from_environment(settings: Settings) -> Result<Self> {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let env: BTreeMap<String, String> = std::env::vars().collect();
        let os = OsFamily::current();
        let home = dirs::home_dir().context("Could not find home directory")?;
        let docker_config = settings.docker_config_path()?;
        let docker_socket = default_socket(os, &home, &env);
        let secret_store = Arc::new(NativeSecretStore::new(runner.clone(), settings.timeouts.helper()));

        debug!(
            "Probe context: os={}, config={}, socket={}",
            os,
            docker_config.display(),
            docker_socket.display()
        );

        Ok(Self {
            runner,
            settings: Arc::new(settings),
            os,
            env: Arc::new(env),
            fs_root: PathBuf::from("/"),
            home,
            docker_config,
            docker_socket,
            user: UserIdentity::current(),
            secret_store,
            resources: Arc::new(SysinfoSampler),
        })
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Arc::new(env);
        self
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// Resolve an absolute system path under `fs_root`
    pub fn system_path(&self, absolute: &str) -> PathBuf {
        self.fs_root.join(absolute.trim_start_matches('/'))
    }

    pub fn docker_dir(&self) -> PathBuf {
        self.docker_config
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.home.join(".docker"))
    }

    pub fn config_file(&self) -> DockerConfigFile {
        DockerConfigFile::new(self.docker_config.clone())
    }

    /// Run with the default probe deadline
    pub async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ExecutionError> {
        self.runner.run(program, args, self.settings.timeouts.command()).await
    }

    /// PATH lookup through `which` / `where`
    pub async fn command_exists(&self, command: &str) -> bool {
        let lookup = if self.os == OsFamily::Windows { "where" } else { "which" };
        self.runner
            .run(lookup, &[command], self.settings.timeouts.command())
            .await
            .is_ok()
    }
}

fn default_socket(os: OsFamily, home: &Path, env: &BTreeMap<String, String>) -> PathBuf {
    if let Some(path) = env.get("DOCKER_HOST").and_then(|h| h.strip_prefix("unix://")) {
        return PathBuf::from(path);
    }
    match os {
        OsFamily::Windows => PathBuf::from(r"\\.\pipe\docker_engine"),
        OsFamily::MacOs => {
            let desktop = home.join(".docker").join("run").join("docker.sock");
            if desktop.exists() {
                desktop
            } else {
                PathBuf::from("/var/run/docker.sock")
            }
        }
        _ => PathBuf::from("/var/run/docker.sock"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_host_overrides_socket() {
        let mut env = BTreeMap::new();
        env.insert("DOCKER_HOST".to_string(), "unix:///run/user/1000/docker.sock".to_string());
        let socket = default_socket(OsFamily::Linux, Path::new("/home/u"), &env);
        assert_eq!(socket, PathBuf::from("/run/user/1000/docker.sock"));
    }

    #[test]
    fn test_current_user_has_a_name() {
        let user = UserIdentity::current();
        assert!(!user.name.is_empty());
    }
}
