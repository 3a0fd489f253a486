//! Image and download-job entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A reusable OS disk template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub spec: ImageSpec,
    pub status: ImageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageSpec {
    pub format: ImageFormat,
    #[serde(default)]
    pub visibility: ImageVisibility,
    pub os_info: Option<OsInfo>,
    /// Minimum resources a VM booted from this image needs.
    pub min_cpu_cores: Option<u32>,
    pub min_memory_mib: Option<u64>,
    /// Catalog entry this image was downloaded from, if any.
    pub catalog_id: Option<String>,
    pub source_url: Option<String>,
    pub ova_metadata: Option<OvaMetadata>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ImageFormat {
    Raw,
    #[default]
    Qcow2,
    Vmdk,
    Vhd,
    Iso,
    Ova,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ImageVisibility {
    #[default]
    Private,
    Project,
    Public,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsInfo {
    pub family: String,
    pub distribution: String,
    pub version: String,
}

/// Envelope details parsed from an OVA archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OvaMetadata {
    pub ovf_descriptor: String,
    pub disk_filenames: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ImagePhase {
    #[default]
    Pending,
    Downloading,
    Converting,
    Ready,
    Error,
    Deleting,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageStatus {
    pub phase: ImagePhase,
    pub size_bytes: u64,
    pub virtual_size_bytes: u64,
    pub progress_percent: u32,
    pub checksum: Option<String>,
    /// Node holding the image file.
    pub node_id: Option<String>,
    pub storage_pool_id: Option<String>,
    pub path: Option<String>,
    pub folder_path: Option<String>,
    pub filename: Option<String>,
    pub message: Option<String>,
}

// =============================================================================
// Download jobs
// =============================================================================

/// State machine for image downloads; terminal states are sticky.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DownloadState {
    #[default]
    Pending,
    Downloading,
    Converting,
    Completed,
    Failed,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Completed | DownloadState::Failed)
    }

    /// Legal transitions: pending -> downloading -> (converting)? ->
    /// completed | failed. Failure is reachable from any live state.
    pub fn can_transition(&self, to: DownloadState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (DownloadState::Pending, DownloadState::Downloading) => true,
            (DownloadState::Downloading, DownloadState::Converting) => true,
            (DownloadState::Downloading, DownloadState::Completed) => true,
            (DownloadState::Converting, DownloadState::Completed) => true,
            (_, DownloadState::Failed) => true,
            _ => false,
        }
    }
}

/// Tracks one routed image download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: String,
    pub image_id: String,
    pub catalog_id: String,
    pub pool_id: String,
    /// Node actually performing the transfer.
    pub node_id: Option<String>,
    /// Job id on the daemon side, used for progress polling.
    pub remote_job_id: Option<String>,
    pub target_path: Option<String>,
    pub state: DownloadState,
    pub progress_percent: u32,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_sticky() {
        assert!(!DownloadState::Completed.can_transition(DownloadState::Failed));
        assert!(!DownloadState::Failed.can_transition(DownloadState::Downloading));
    }

    #[test]
    fn test_happy_path_transitions() {
        assert!(DownloadState::Pending.can_transition(DownloadState::Downloading));
        assert!(DownloadState::Downloading.can_transition(DownloadState::Converting));
        assert!(DownloadState::Converting.can_transition(DownloadState::Completed));
        assert!(DownloadState::Downloading.can_transition(DownloadState::Completed));
    }

    #[test]
    fn test_failure_reachable_from_live_states() {
        assert!(DownloadState::Pending.can_transition(DownloadState::Failed));
        assert!(DownloadState::Downloading.can_transition(DownloadState::Failed));
        assert!(DownloadState::Converting.can_transition(DownloadState::Failed));
    }

    #[test]
    fn test_no_skipping_download() {
        assert!(!DownloadState::Pending.can_transition(DownloadState::Completed));
        assert!(!DownloadState::Pending.can_transition(DownloadState::Converting));
    }
}
