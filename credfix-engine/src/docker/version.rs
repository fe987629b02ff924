use serde::Serialize;

use super::ReportSection;
use crate::context::ProbeContext;
use crate::model::{Issue, IssueType, Severity};

/// Oldest client release with reliable credential-helper handling
pub const MINIMUM_CLIENT: (u32, u32) = (20, 10);

#[derive(Debug, Clone, Default, Serialize)]
pub struct VersionSection {
    pub client: Option<String>,
    pub minimum: String,
    pub outdated: bool,
    pub issues: Vec<Issue>,
    pub error: Option<String>,
}

impl ReportSection for VersionSection {
    fn fail(&mut self, error: String) {
        self.error = Some(error);
    }

    fn issues(&self) -> &[Issue] {
        &self.issues
    }
}

/// `major.minor` of a Docker version string such as `24.0.7` or `20.10.21+dfsg1`
pub fn major_minor(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.trim().trim_start_matches('v').split('.');
    let major = parts.next()?.parse().ok()?;
    let minor: String = parts.next()?.chars().take_while(|c| c.is_ascii_digit()).collect();
    Some((major, minor.parse().ok()?))
}

pub async fn check(ctx: &ProbeContext) -> VersionSection {
    let mut section = VersionSection {
        minimum: format!("{}.{}", MINIMUM_CLIENT.0, MINIMUM_CLIENT.1),
        ..Default::default()
    };

    let client = match ctx.run("docker", &["version", "--format", "{{.Client.Version}}"]).await {
        Ok(output) => output.stdout.trim().to_string(),
        Err(e) => {
            section.error = Some(e.evidence());
            return section;
        }
    };

    if let Some(parsed) = major_minor(&client) {
        if parsed < MINIMUM_CLIENT {
            section.outdated = true;
            section.issues.push(Issue::new(
                "DOCKER_CLIENT_OUTDATED",
                IssueType::Daemon,
                Severity::Low,
                format!("Docker client {client} is older than {}", section.minimum),
                format!("docker client {client} < {}", section.minimum),
                "Upgrade Docker; older clients mishandle some credential helper responses",
            ));
        }
    } else {
        section.error = Some(format!("unrecognised client version '{client}'"));
    }
    section.client = Some(client);

    section
}
