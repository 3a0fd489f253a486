//! Repository contract and SQLite implementation.
//!
//! The traits in [`traits`] are the persistence seam of the control plane:
//! services and reconcilers only ever see these, never the driver. The
//! SQLite implementation keeps entities in relational tables with JSON
//! TEXT columns for the tagged-variant fields and enforces the uniqueness
//! invariants through composite unique indexes.

pub mod sqlite;
pub mod traits;

pub use sqlite::{PoolSettings, SqliteRepository};
pub use traits::{
    AlertFilter, AuditExport, AuditFilter, AlertRepo, AuditRepo, ClusterRepo, DownloadJobRepo,
    ImageFilter, ImageRepo, NodeFilter, NodeRepo, PoolRepo, Repository, SnapshotRepo, TokenRepo,
    VmCursorPage, VmFilter, VmRepo, VolumeFilter, VolumeRepo,
};
