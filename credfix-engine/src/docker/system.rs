//! Host resource pressure and Docker's own storage usage
//!
//! Provides:
//! - memory / CPU / disk sampling through `sysinfo`
//! - Docker storage usage from `docker system df`
//! - threshold warnings (memory, free disk, Docker storage)

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::{Disks, System};
use tracing::debug;

use super::ReportSection;
use crate::context::ProbeContext;
use crate::model::{Issue, IssueType, Severity};

/// Point-in-time host resource usage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub memory_percent: f32,
    pub cpu_percent: f32,
    pub cpu_cores: usize,
    pub load_avg: [f64; 3],
    pub disks: Vec<DiskUsage>,
}

/// Usage per mounted filesystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub mount_point: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl DiskUsage {
    pub fn free_percent(&self) -> f32 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.available_bytes as f64 / self.total_bytes as f64 * 100.0) as f32
    }
}

impl ResourceSnapshot {
    /// Filesystem holding `path`, by longest mount-point prefix
    pub fn disk_for(&self, path: &Path) -> Option<&DiskUsage> {
        self.disks
            .iter()
            .filter(|d| path.starts_with(&d.mount_point))
            .max_by_key(|d| d.mount_point.len())
    }
}

#[async_trait]
pub trait ResourceSampler: Send + Sync {
    async fn sample(&self) -> Result<ResourceSnapshot>;
}

/// Samples the real host
#[derive(Debug, Default, Clone)]
pub struct SysinfoSampler;

#[async_trait]
impl ResourceSampler for SysinfoSampler {
    async fn sample(&self) -> Result<ResourceSnapshot> {
        debug!("Collecting host resource usage...");
        let snapshot = tokio::task::spawn_blocking(|| {
            let mut sys = System::new_all();
            sys.refresh_all();
            // CPU usage needs two refreshes spaced apart
            std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
            sys.refresh_cpu_usage();

            let total = sys.total_memory();
            let used = total.saturating_sub(sys.available_memory());
            let memory_percent = if total > 0 {
                (used as f32 / total as f32) * 100.0
            } else {
                0.0
            };

            let load_avg = if cfg!(unix) {
                let load = System::load_average();
                [load.one, load.five, load.fifteen]
            } else {
                [0.0, 0.0, 0.0]
            };

            let disks = Disks::new_with_refreshed_list()
                .list()
                .iter()
                .map(|disk| DiskUsage {
                    mount_point: disk.mount_point().to_string_lossy().to_string(),
                    total_bytes: disk.total_space(),
                    available_bytes: disk.available_space(),
                })
                .collect();

            ResourceSnapshot {
                memory_total_mb: total / (1024 * 1024),
                memory_used_mb: used / (1024 * 1024),
                memory_percent,
                cpu_percent: sys.global_cpu_info().cpu_usage(),
                cpu_cores: sys.cpus().len(),
                load_avg,
                disks,
            }
        })
        .await?;
        Ok(snapshot)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemSection {
    pub resources: Option<ResourceSnapshot>,
    pub docker_root: Option<String>,
    pub docker_storage_bytes: Option<u64>,
    pub docker_storage_percent: Option<f32>,
    pub warnings: Vec<String>,
    pub issues: Vec<Issue>,
    pub error: Option<String>,
}

impl ReportSection for SystemSection {
    fn fail(&mut self, error: String) {
        self.error = Some(error);
    }

    fn issues(&self) -> &[Issue] {
        &self.issues
    }
}

pub async fn check(ctx: &ProbeContext) -> SystemSection {
    let mut section = SystemSection::default();
    let thresholds = &ctx.settings.thresholds;

    match ctx.resources.sample().await {
        Ok(snapshot) => {
            if snapshot.memory_percent > thresholds.memory_percent {
                section.warnings.push(format!("memory usage at {:.1}%", snapshot.memory_percent));
                section.issues.push(pressure_issue(
                    "HIGH_MEMORY_USAGE",
                    format!("Host memory usage is {:.1}%", snapshot.memory_percent),
                    format!("memory usage above {}%", thresholds.memory_percent),
                    "Stop unused containers or applications; credential helpers and the daemon can fail to start under memory pressure",
                ));
            }
            section.resources = Some(snapshot);
        }
        Err(e) => section.warnings.push(format!("resource sampling failed: {e}")),
    }

    section.docker_root = ctx
        .run("docker", &["info", "--format", "{{.DockerRootDir}}"])
        .await
        .ok()
        .map(|o| o.stdout.trim().to_string())
        .filter(|s| !s.is_empty());

    // Free space is judged on the filesystem Docker writes to
    let root = section.docker_root.clone().unwrap_or_else(|| "/".to_string());
    if let Some(disk) = section.resources.as_ref().and_then(|r| r.disk_for(Path::new(&root))) {
        let free = disk.free_percent();
        if free < thresholds.disk_free_percent {
            section.warnings.push(format!("{} has {:.1}% free", disk.mount_point, free));
            section.issues.push(pressure_issue(
                "LOW_DISK_SPACE",
                format!("Only {:.1}% free on {}", free, disk.mount_point),
                format!("{}: free space below {}%", disk.mount_point, thresholds.disk_free_percent),
                "Free disk space, e.g. `docker system prune` for unused images and build cache",
            ));
        }
    }

    match ctx.run("docker", &["system", "df", "--format", "{{json .}}"]).await {
        Ok(output) => {
            let bytes = docker_storage_bytes(&output.stdout);
            section.docker_storage_bytes = Some(bytes);
            let total = section
                .resources
                .as_ref()
                .and_then(|r| r.disk_for(Path::new(&root)))
                .map(|d| d.total_bytes)
                .filter(|t| *t > 0);
            if let Some(total) = total {
                let percent = (bytes as f64 / total as f64 * 100.0) as f32;
                section.docker_storage_percent = Some(percent);
                if percent > thresholds.docker_storage_percent {
                    section.issues.push(pressure_issue(
                        "DOCKER_STORAGE_HIGH",
                        format!("Docker data uses {:.1}% of its filesystem", percent),
                        format!("docker storage above {}%", thresholds.docker_storage_percent),
                        "Remove unused images, volumes and build cache with `docker system prune`",
                    ));
                }
            }
        }
        Err(e) => {
            debug!("docker system df unavailable: {}", e);
            section.warnings.push(format!("docker storage usage unavailable: {}", e.evidence()));
        }
    }

    section
}

fn pressure_issue(code: &str, description: String, evidence: String, suggestion: &str) -> Issue {
    Issue::new(code, IssueType::Daemon, Severity::Medium, description, evidence, suggestion)
}

/// Sum of the `Size` column of `docker system df --format '{{json .}}'`
pub fn docker_storage_bytes(output: &str) -> u64 {
    output
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter_map(|row| row.get("Size").and_then(|s| s.as_str()).and_then(parse_size))
        .sum()
}

/// Parse Docker's human-readable sizes (`1.2GB`, `512kB`, `0B`); units are decimal
pub fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw.find(|c: char| c.is_ascii_alphabetic())?;
    let (number, unit) = raw.split_at(split);
    let value: f64 = number.trim().parse().ok()?;
    let multiplier = match unit.to_ascii_uppercase().as_str() {
        "B" => 1.0,
        "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => return None,
    };
    Some((value * multiplier) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("0B"), Some(0));
        assert_eq!(parse_size("512kB"), Some(512_000));
        assert_eq!(parse_size("2.5GB"), Some(2_500_000_000));
        assert_eq!(parse_size("n/a"), None);
    }

    #[test]
    fn test_docker_storage_sums_rows() {
        let output = r#"{"Active":"2","Reclaimable":"1GB (50%)","Size":"2GB","TotalCount":"5","Type":"Images"}
{"Active":"1","Reclaimable":"0B","Size":"500MB","TotalCount":"1","Type":"Containers"}
{"Active":"0","Reclaimable":"0B","Size":"0B","TotalCount":"0","Type":"Local Volumes"}"#;
        assert_eq!(docker_storage_bytes(output), 2_500_000_000);
    }

    #[test]
    fn test_disk_for_picks_longest_mount() {
        let snapshot = ResourceSnapshot {
            disks: vec![
                DiskUsage { mount_point: "/".into(), total_bytes: 100, available_bytes: 50 },
                DiskUsage { mount_point: "/var/lib/docker".into(), total_bytes: 100, available_bytes: 5 },
            ],
            ..Default::default()
        };
        let disk = snapshot.disk_for(Path::new("/var/lib/docker")).unwrap();
        assert_eq!(disk.mount_point, "/var/lib/docker");
        assert_eq!(disk.free_percent(), 5.0);
    }

    #[tokio::test]
    async fn test_sysinfo_sampler_reports_memory() {
        let snapshot = SysinfoSampler.sample().await.unwrap();
        assert!(snapshot.memory_total_mb > 0);
        assert!(snapshot.cpu_cores > 0);
    }
}
