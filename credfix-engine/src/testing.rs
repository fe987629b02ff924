//! Scripted collaborators for unit tests

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::context::{ProbeContext, SecretStoreAccess, SecretStoreStatus, UserIdentity};
use crate::docker::system::{ResourceSampler, ResourceSnapshot};
use crate::execution::{render_command, CommandOutput, CommandRunner, ExecutionError};
use crate::platform::OsFamily;
use crate::settings::Settings;

#[derive(Clone)]
enum Scripted {
    Ok(String),
    Exit(i32, String),
    Timeout,
}

/// Answers by exact rendered command line; anything unscripted is "not found"
#[derive(Clone, Default)]
pub struct ScriptRunner {
    responses: Arc<Mutex<HashMap<String, Scripted>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(self, command: &str, response: Scripted) -> Self {
        self.responses.lock().unwrap().insert(command.to_string(), response);
        self
    }

    pub fn ok(self, command: &str, stdout: &str) -> Self {
        self.script(command, Scripted::Ok(stdout.to_string()))
    }

    pub fn exit(self, command: &str, code: i32, stderr: &str) -> Self {
        self.script(command, Scripted::Exit(code, stderr.to_string()))
    }

    pub fn hang(self, command: &str) -> Self {
        self.script(command, Scripted::Timeout)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptRunner {
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput, ExecutionError> {
        let command = render_command(program, args);
        self.calls.lock().unwrap().push(command.clone());
        let response = self.responses.lock().unwrap().get(&command).cloned();
        match response {
            Some(Scripted::Ok(stdout)) => Ok(CommandOutput::success(stdout)),
            Some(Scripted::Exit(exit_code, stderr)) => Err(ExecutionError::NonZeroExit {
                command,
                exit_code,
                stdout: String::new(),
                stderr,
            }),
            Some(Scripted::Timeout) => Err(ExecutionError::Timeout {
                command,
                timeout_ms: timeout.as_millis() as u64,
            }),
            None => Err(ExecutionError::SpawnFailure {
                command,
                message: "No such file or directory (os error 2)".to_string(),
                not_found: true,
            }),
        }
    }
}

pub struct FixedSampler(pub ResourceSnapshot);

#[async_trait]
impl ResourceSampler for FixedSampler {
    async fn sample(&self) -> anyhow::Result<ResourceSnapshot> {
        Ok(self.0.clone())
    }
}

pub struct FixedSecretStore(pub SecretStoreStatus);

#[async_trait]
impl SecretStoreAccess for FixedSecretStore {
    async fn check(&self) -> SecretStoreStatus {
        self.0.clone()
    }
}

/// Linux context rooted in a temp dir, unprivileged user, calm resources
pub fn test_context(dir: &tempfile::TempDir, runner: ScriptRunner) -> ProbeContext {
    let home = dir.path().join("home");
    ProbeContext {
        runner: Arc::new(runner),
        settings: Arc::new(Settings::default()),
        os: OsFamily::Linux,
        env: Arc::new(BTreeMap::new()),
        fs_root: dir.path().join("root"),
        docker_config: home.join(".docker").join("config.json"),
        home,
        docker_socket: dir.path().join("docker.sock"),
        user: UserIdentity {
            name: "dev".to_string(),
            uid: Some(1000),
            elevated: false,
        },
        secret_store: Arc::new(FixedSecretStore(SecretStoreStatus::Accessible)),
        resources: Arc::new(FixedSampler(ResourceSnapshot {
            memory_total_mb: 16_000,
            memory_used_mb: 4_000,
            memory_percent: 25.0,
            cpu_cores: 8,
            ..Default::default()
        })),
    }
}
