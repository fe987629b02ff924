//! Platform detection for the diagnostic run
//!
//! This module handles:
//! - OS family, architecture and OS version identification
//! - Docker client version (absence tolerated)
//! - Credential helper resolution: config-declared first, then PATH
//! - Helper health test and secret store accessibility
//!
//! Every sub-step is independent; a failure is recorded and the remaining
//! steps still run.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

use crate::context::ProbeContext;
use crate::docker_config::{creds_store, ConfigState};
use crate::execution::{test_helper, HelperStatus};
use crate::model::{Issue, IssueType, Severity};
use crate::probes::helpers::path_helpers;

/// Operating system family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Linux,
    #[serde(rename = "macos")]
    MacOs,
    Windows,
    Other,
}

impl OsFamily {
    pub fn current() -> Self {
        Self::from_os_str(std::env::consts::OS)
    }

    pub fn from_os_str(os: &str) -> Self {
        match os {
            "linux" => OsFamily::Linux,
            "macos" => OsFamily::MacOs,
            "windows" => OsFamily::Windows,
            _ => OsFamily::Other,
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsFamily::Linux => write!(f, "linux"),
            OsFamily::MacOs => write!(f, "macos"),
            OsFamily::Windows => write!(f, "windows"),
            OsFamily::Other => write!(f, "other"),
        }
    }
}

/// Helpers the platform is expected to use, in preference order
pub fn expected_helpers(os: OsFamily) -> &'static [&'static str] {
    match os {
        OsFamily::MacOs => &["osxkeychain", "desktop"],
        OsFamily::Linux => &["secretservice", "pass"],
        OsFamily::Windows => &["wincred", "desktop"],
        OsFamily::Other => &[],
    }
}

/// Where the resolved helper came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelperSource {
    Config,
    Path,
    None,
}

/// Immutable platform snapshot, created once per diagnostic run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub os: OsFamily,
    pub architecture: String,
    pub os_version: Option<String>,
    pub hostname: String,
    pub docker_version: Option<String>,
    pub credential_helper: Option<String>,
    pub helper_source: HelperSource,
    pub helper_status: Option<HelperStatus>,
    /// `credsStore` from the Docker config, if any
    pub config_helper: Option<String>,
    /// Expected helpers found on PATH, in preference order
    pub path_helpers: Vec<String>,
    pub keychain_accessible: bool,
    /// Sub-steps that failed; the snapshot is partial when non-empty
    pub errors: Vec<String>,
}

impl PlatformInfo {
    pub fn helper_working(&self) -> bool {
        self.helper_status.as_ref().map(HelperStatus::is_working).unwrap_or(false)
    }
}

pub struct PlatformDetector {
    ctx: ProbeContext,
}

impl PlatformDetector {
    pub fn new(ctx: ProbeContext) -> Self {
        Self { ctx }
    }

    /// Detect the platform snapshot; partial results beat none
    pub async fn detect(&self) -> PlatformInfo {
        info!("Starting platform detection...");
        let mut errors = Vec::new();

        let os = self.ctx.os;
        let architecture = std::env::consts::ARCH.to_string();
        let hostname = gethostname::gethostname().to_string_lossy().to_string();

        let os_version = match self.os_version().await {
            Ok(version) => Some(version),
            Err(e) => {
                errors.push(format!("os version: {e}"));
                None
            }
        };

        let docker_version = match self.docker_version().await {
            Ok(version) => Some(version),
            Err(e) => {
                debug!("Docker client version unavailable: {}", e);
                errors.push(format!("docker version: {e}"));
                None
            }
        };

        let config_helper = match self.ctx.config_file().load() {
            ConfigState::Parsed(value) => creds_store(&value).map(str::to_string),
            ConfigState::Missing => None,
            ConfigState::Malformed { error } | ConfigState::Unreadable { error } => {
                errors.push(format!("docker config: {error}"));
                None
            }
        };

        let path_helpers = path_helpers(&self.ctx).await;

        // Config-declared helper is authoritative
        let (credential_helper, helper_source) = match (&config_helper, path_helpers.first()) {
            (Some(helper), _) => (Some(helper.clone()), HelperSource::Config),
            (None, Some(helper)) => (Some(helper.clone()), HelperSource::Path),
            (None, None) => (None, HelperSource::None),
        };

        let helper_status = match &credential_helper {
            Some(helper) => {
                Some(test_helper(self.ctx.runner.as_ref(), helper, self.ctx.settings.timeouts.helper()).await)
            }
            None => None,
        };

        let keychain_accessible = self.ctx.secret_store.check().await.is_accessible();

        if !errors.is_empty() {
            warn!("Platform detection finished with {} partial failures", errors.len());
        }
        info!(
            "Platform: {} {} helper={:?} ({:?})",
            os, architecture, credential_helper, helper_source
        );

        PlatformInfo {
            os,
            architecture,
            os_version,
            hostname,
            docker_version,
            credential_helper,
            helper_source,
            helper_status,
            config_helper,
            path_helpers,
            keychain_accessible,
            errors,
        }
    }

    async fn os_version(&self) -> anyhow::Result<String> {
        let output = match self.ctx.os {
            OsFamily::MacOs => self.ctx.run("sw_vers", &["-productVersion"]).await?,
            OsFamily::Windows => self.ctx.run("cmd", &["/C", "ver"]).await?,
            _ => self.ctx.run("uname", &["-r"]).await?,
        };
        let version = output.stdout.trim().to_string();
        if version.is_empty() {
            anyhow::bail!("empty version output");
        }
        Ok(version)
    }

    async fn docker_version(&self) -> anyhow::Result<String> {
        let output = self
            .ctx
            .run("docker", &["version", "--format", "{{.Client.Version}}"])
            .await?;
        Ok(output.stdout.trim().to_string())
    }
}

/// Advisory issues derived from the platform snapshot alone.
///
/// A config-declared helper that differs from the preferred PATH helper is
/// kept as-is and only flagged.
pub fn advisories(info: &PlatformInfo) -> Vec<Issue> {
    let mut issues = Vec::new();

    if let (Some(configured), Some(preferred)) = (&info.config_helper, info.path_helpers.first()) {
        if configured != preferred && !info.path_helpers.contains(configured) {
            issues.push(
                Issue::new(
                    "HELPER_MISMATCH",
                    IssueType::CredentialHelper,
                    Severity::Low,
                    format!("credsStore is '{configured}' but '{preferred}' is the helper found on PATH"),
                    format!("credsStore={configured}; path_helpers={}", info.path_helpers.join(",")),
                    format!(
                        "The configured helper is used. Switch with `\"credsStore\": \"{preferred}\"` only if '{configured}' is not intended"
                    ),
                )
                .with_detail("configured", configured.clone())
                .with_detail("preferred", preferred.clone()),
            );
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context, ScriptRunner};

    #[test]
    fn test_expected_helpers() {
        assert_eq!(expected_helpers(OsFamily::MacOs)[0], "osxkeychain");
        assert_eq!(expected_helpers(OsFamily::Linux), &["secretservice", "pass"]);
        assert_eq!(expected_helpers(OsFamily::Windows)[0], "wincred");
    }

    #[tokio::test]
    async fn test_config_helper_takes_priority() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::new()
            .ok("uname -r", "6.8.0\n")
            .ok("docker version --format '{{.Client.Version}}'", "27.1.1\n")
            .ok("which docker-credential-secretservice", "/usr/bin/docker-credential-secretservice")
            .ok("which docker-credential-pass", "/usr/bin/docker-credential-pass")
            .ok("docker-credential-pass list", "{}");
        let ctx = test_context(&dir, runner);
        std::fs::create_dir_all(ctx.docker_dir()).unwrap();
        std::fs::write(&ctx.docker_config, r#"{"auths": {}, "credsStore": "pass"}"#).unwrap();

        let info = PlatformDetector::new(ctx).detect().await;
        assert_eq!(info.credential_helper.as_deref(), Some("pass"));
        assert_eq!(info.helper_source, HelperSource::Config);
        assert_eq!(info.path_helpers, vec!["secretservice".to_string(), "pass".to_string()]);
        assert_eq!(info.docker_version.as_deref(), Some("27.1.1"));
        assert!(info.helper_working());
        assert!(advisories(&info).is_empty());
    }

    #[tokio::test]
    async fn test_partial_results_when_docker_missing() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::new()
            .ok("uname -r", "6.8.0\n")
            .ok("which docker-credential-secretservice", "/usr/bin/docker-credential-secretservice")
            .exit("docker-credential-secretservice list", 1, "Cannot autolaunch D-Bus without X11 $DISPLAY");
        let ctx = test_context(&dir, runner);

        let info = PlatformDetector::new(ctx).detect().await;
        assert!(info.docker_version.is_none());
        assert!(info.errors.iter().any(|e| e.starts_with("docker version")));
        assert_eq!(info.helper_source, HelperSource::Path);
        assert!(matches!(info.helper_status, Some(HelperStatus::Broken { .. })));
    }

    #[test]
    fn test_mismatch_advisory_is_low_and_manual() {
        let info = PlatformInfo {
            os: OsFamily::Linux,
            architecture: "x86_64".into(),
            os_version: None,
            hostname: "host".into(),
            docker_version: None,
            credential_helper: Some("ecr-login".into()),
            helper_source: HelperSource::Config,
            helper_status: Some(HelperStatus::Working),
            config_helper: Some("ecr-login".into()),
            path_helpers: vec!["pass".into()],
            keychain_accessible: true,
            errors: vec![],
        };
        let issues = advisories(&info);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Low);
        assert!(!issues[0].auto_fixable);
    }
}
