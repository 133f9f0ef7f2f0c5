//! Wire shapes shared between the pipeline core and the presentation layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An external, enumerable block device that is a candidate flash target.
///
/// Owned by the discovery collaborator; re-queried on demand, never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub size_human: String,
    pub vendor: String,
    pub model: String,
    pub tran: String,
    pub serial: String,
    /// Whether the device already carries a bootable OS (offers the
    /// skip-flash shortcut).
    pub has_bootable_os: bool,
}

/// Pipeline phase names, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Backup,
    Download,
    Flash,
    Inject,
    Sandbox,
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageName::Backup => "backup",
            StageName::Download => "download",
            StageName::Flash => "flash",
            StageName::Inject => "inject",
            StageName::Sandbox => "sandbox",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// An external reference shown next to a stage (text + URL).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLink {
    pub text: String,
    pub url: String,
}

/// One pipeline phase with its own progress and status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: StageName,
    pub status: StageStatus,
    /// Integer percent, 0-100, monotonic within a stage under normal
    /// operation.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Throughput in bytes per second.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Estimated seconds remaining.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<StageLink>,
}

impl Stage {
    pub fn pending(name: StageName) -> Self {
        Stage {
            name,
            status: StageStatus::Pending,
            progress: 0,
            description: None,
            speed: None,
            eta: None,
            link: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    Completed,
    Failed,
}

/// The single unit of provisioning work. At most one job may be
/// `in_progress` system-wide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub device: Device,
    /// Ordered stage collection; keyed lookups go through [`Job::stage`].
    pub stages: Vec<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn stage(&self, name: StageName) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_mut(&mut self, name: StageName) -> Option<&mut Stage> {
        self.stages.iter_mut().find(|s| s.name == name)
    }

    /// The stage currently `in_progress`, found by scanning stage statuses.
    pub fn active_stage(&self) -> Option<StageName> {
        self.stages
            .iter()
            .find(|s| s.status == StageStatus::InProgress)
            .map(|s| s.name)
    }
}

/// Options accepted by the pipeline orchestrator for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloneOptions {
    /// Reuse this existing backup instead of creating a new one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_slug: Option<String>,
    /// Skip download and flash; the device already carries a bootable OS.
    #[serde(default)]
    pub skip_flash: bool,
    /// Skip the interactive sandbox stage.
    #[serde(default)]
    pub skip_sandbox: bool,
}

/// Events broadcast to progress observers. `StageUpdate` events are
/// strictly ordered per job; a terminal `Done`/`Error`/`Cancelled` is the
/// last event a subscriber observes for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    StageUpdate {
        stage: StageName,
        status: StageStatus,
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        eta: Option<u64>,
    },
    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        backup_name: Option<String>,
    },
    Error {
        stage: StageName,
        message: String,
    },
    Cancelled,
}

/// Aggregated system information from the platform's read-only queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub machine: String,
    pub board_slug: String,
    pub os_version: String,
    pub os_version_latest: String,
    pub ip_address: String,
    pub free_space_bytes: u64,
    pub free_space_human: String,
}

/// A previously downloaded, checksum-verified image on local disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageCacheInfo {
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub board: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_human: Option<String>,
}

/// Backup entry as reported by the platform's backup API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorBackup {
    pub slug: String,
    pub name: String,
    pub date: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Size in MB as reported by the Supervisor.
    pub size: f64,
}

/// Response to a backup-creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJobResponse {
    pub job_id: String,
}

/// Poll result for an in-flight Supervisor job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorJobStatus {
    pub done: bool,
    pub progress: f64,
    pub reference: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}
