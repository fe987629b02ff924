/*!
Test harness for credfix scenarios

Builds a probe context rooted in a temp directory:
- Docker config under a throw-away home
- backups next to it
- a `MockRunner` for every external command
- calm resource figures and an accessible secret store
*/

use crate::decisions::RecordingSink;
use crate::mock_runner::{command_line, MockResponse, MockRunner};
use anyhow::Result;
use async_trait::async_trait;
use credfix_engine::consent::backup::{BackupStore, FileBackupStore};
use credfix_engine::consent::{ConsentFlow, ConsentPolicy};
use credfix_engine::context::{SecretStoreAccess, SecretStoreStatus, UserIdentity};
use credfix_engine::docker::system::{ResourceSampler, ResourceSnapshot};
use credfix_engine::doctor::session::{DiagnosticSession, Scanner};
use credfix_engine::doctor::{DecisionProvider, Doctor, DoctorReport};
use credfix_engine::platform::OsFamily;
use credfix_engine::repair::ExecuteOptions;
use credfix_engine::{ProbeContext, Settings};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tempfile::TempDir;

pub const DOCKER_VERSION: &str = "24.0.7";
pub const HELPER_PACKAGE: &str = "golang-docker-credential-helpers";

/// Temp home with a Docker config path and a backup directory
pub struct ConfigFixture {
    dir: TempDir,
}

impl ConfigFixture {
    pub fn new() -> Result<Self> {
        Ok(Self { dir: tempfile::tempdir()? })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn home(&self) -> PathBuf {
        self.root().join("home")
    }

    pub fn config_path(&self) -> PathBuf {
        self.home().join(".docker").join("config.json")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root().join("backups")
    }

    pub fn write_config(&self, content: &str) -> Result<()> {
        let path = self.config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_bytes(&self) -> Option<Vec<u8>> {
        std::fs::read(self.config_path()).ok()
    }

    pub fn config_json(&self) -> Option<Value> {
        serde_json::from_slice(&self.config_bytes()?).ok()
    }

    pub fn config_modified(&self) -> Option<SystemTime> {
        std::fs::metadata(self.config_path()).and_then(|m| m.modified()).ok()
    }
}

struct StaticSecretStore(SecretStoreStatus);

#[async_trait]
impl SecretStoreAccess for StaticSecretStore {
    async fn check(&self) -> SecretStoreStatus {
        self.0.clone()
    }
}

struct StaticSampler(ResourceSnapshot);

#[async_trait]
impl ResourceSampler for StaticSampler {
    async fn sample(&self) -> Result<ResourceSnapshot> {
        Ok(self.0.clone())
    }
}

pub struct TestHarness {
    pub fixture: ConfigFixture,
    pub runner: MockRunner,
    pub sink: Arc<RecordingSink>,
    pub settings: Settings,
}

impl TestHarness {
    pub fn new() -> Result<Self> {
        env_logger::try_init().ok();

        let fixture = ConfigFixture::new()?;
        let mut settings = Settings::default();
        settings.paths.docker_config = Some(fixture.config_path());
        settings.paths.backup_dir = Some(fixture.backup_dir());

        Ok(Self {
            fixture,
            runner: MockRunner::new(),
            sink: Arc::new(RecordingSink::new()),
            settings,
        })
    }

    /// Docker CLI and daemon answer, registry pull succeeds
    pub fn with_healthy_docker(self) -> Self {
        let server = serde_json::json!({
            "Client": { "Version": DOCKER_VERSION },
            "Server": { "Version": DOCKER_VERSION, "ApiVersion": "1.43", "Os": "linux", "Arch": "amd64" },
        });
        self.runner
            .ok(command_line("docker", &["version", "--format", "{{json .}}"]), &server.to_string())
            .ok(command_line("docker", &["version", "--format", "{{.Client.Version}}"]), DOCKER_VERSION)
            .ok(command_line("docker", &["pull", "hello-world:latest"]), "Status: Image is up to date")
            .ok(command_line("uname", &["-r"]), "6.8.0-45-generic")
            .ok(command_line("systemctl", &["is-active", "docker"]), "active");
        log::info!("🐳 Scripted a healthy Docker installation");
        self
    }

    /// apt is present and offers the credential helper package
    pub fn with_apt(self) -> Self {
        self.runner
            .ok(command_line("which", &["apt-get"]), "/usr/bin/apt-get")
            .ok(
                command_line("apt-cache", &["policy", HELPER_PACKAGE]),
                &format!("{HELPER_PACKAGE}:\n  Installed: (none)\n  Candidate: 0.6.4-1\n"),
            );
        self
    }

    /// `docker-credential-<helper>` on PATH, answering `list` with `{}`
    pub fn with_working_helper(self, helper: &str) -> Self {
        let binary = format!("docker-credential-{helper}");
        self.runner
            .ok(command_line("which", &[binary.as_str()]), &format!("/usr/bin/{binary}"))
            .ok(command_line(&binary, &["list"]), "{}");
        self
    }

    /// `docker-credential-<helper> list` exits 1
    pub fn with_broken_helper(self, helper: &str, stderr: &str) -> Self {
        let binary = format!("docker-credential-{helper}");
        self.runner.exit(command_line(&binary, &["list"]), 1, stderr);
        self
    }

    /// Installing the helper package puts `helper` on PATH
    pub fn installing_provides(self, helper: &str) -> Self {
        let binary = format!("docker-credential-{helper}");
        let install = command_line("sudo", &["-n", "apt-get", "install", "-y", HELPER_PACKAGE]);
        self.runner
            .ok(install.clone(), "Setting up golang-docker-credential-helpers")
            .on_success(
                install.clone(),
                command_line("which", &[binary.as_str()]),
                MockResponse::Ok(format!("/usr/bin/{binary}")),
            )
            .on_success(install, command_line(&binary, &["list"]), MockResponse::Ok("{}".into()));
        self
    }

    pub fn context(&self) -> ProbeContext {
        let home = self.fixture.home();
        ProbeContext {
            runner: Arc::new(self.runner.clone()),
            settings: Arc::new(self.settings.clone()),
            os: OsFamily::Linux,
            env: Arc::new(BTreeMap::new()),
            fs_root: self.fixture.root().join("root"),
            docker_config: self.fixture.config_path(),
            home,
            docker_socket: self.fixture.root().join("docker.sock"),
            user: UserIdentity {
                elevated: false,
                ..UserIdentity::current()
            },
            secret_store: Arc::new(StaticSecretStore(SecretStoreStatus::Accessible)),
            resources: Arc::new(StaticSampler(ResourceSnapshot {
                memory_total_mb: 16_000,
                memory_used_mb: 4_000,
                memory_percent: 25.0,
                cpu_cores: 8,
                ..Default::default()
            })),
        }
    }

    pub fn backup_store(&self) -> Arc<FileBackupStore> {
        Arc::new(FileBackupStore::new(self.fixture.backup_dir()))
    }

    pub async fn scan(&self) -> DiagnosticSession {
        Scanner::new(self.context()).quick_scan("scenario", self.sink.as_ref()).await
    }

    pub fn doctor(&self, policy: ConsentPolicy, options: ExecuteOptions) -> Doctor {
        let store: Arc<dyn BackupStore> = self.backup_store();
        Doctor::new(self.context(), ConsentFlow::new(store, policy), self.sink.clone()).with_options(options)
    }

    pub async fn run_doctor(
        &self,
        policy: ConsentPolicy,
        options: ExecuteOptions,
        decisions: &dyn DecisionProvider,
    ) -> Result<DoctorReport> {
        let report = self.doctor(policy, options).run(decisions).await?;
        log::info!("🩺 Doctor finished: {:?}", report.outcome);
        Ok(report)
    }
}

/// Scenario test with a fresh harness bound to `$harness`
#[macro_export]
macro_rules! scenario_test {
    ($name:ident, |$harness:ident| $body:block) => {
        #[tokio::test]
        async fn $name() {
            let $harness = $crate::TestHarness::new().expect("harness setup");
            let result: $crate::anyhow::Result<()> = async { $body }.await;
            if let Err(e) = result {
                panic!("❌ Scenario '{}' failed: {:#}", stringify!($name), e);
            }
        }
    };
}
