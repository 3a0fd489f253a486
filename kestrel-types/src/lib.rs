//! Kestrel domain model.
//!
//! Entities follow the spec/status split: `spec` holds user intent and is
//! only written through the typed APIs, `status` is owned by the
//! reconcilers. Polymorphic configuration (storage backends, volume
//! sources) is modeled as tagged enums so unknown variants fail on decode
//! instead of flowing through as opaque blobs.

pub mod audit;
pub mod cluster;
pub mod error;
pub mod image;
pub mod node;
pub mod normalize;
pub mod storage;
pub mod token;
pub mod vm;

pub use audit::{Alert, AlertSeverity, AuditEntry};
pub use cluster::{Cluster, ClusterHaConfig, ClusterHealth, ClusterWithStats, DrsConfig, DrsMode};
pub use error::{Error, Result};
pub use image::{
    DownloadJob, DownloadState, Image, ImageFormat, ImagePhase, ImageSpec, ImageStatus,
    ImageVisibility, OsInfo, OvaMetadata,
};
pub use node::{
    Node, NodeCondition, NodePhase, NodeRoles, NodeSpec, NodeStatus, Resources, SystemInfo,
};
pub use normalize::{normalize_folder_path, normalize_project_id, DEFAULT_PROJECT_ID};
pub use storage::{
    PoolBackend, PoolCapacity, PoolHostStatus, PoolPhase, PoolStatus, Provisioning, QosPolicy,
    Snapshot, SnapshotState, StoragePool, Volume, VolumeAccessMode, VolumePhase, VolumeSource,
    VolumeSpec, VolumeStatus,
};
pub use token::RegistrationToken;
pub use vm::{
    DiskBus, DiskSpec, HaPolicy, NicModel, NicSpec, PlacementConstraints, ResourceUsage,
    VirtualMachine, VmSpec, VmState, VmStatus,
};
