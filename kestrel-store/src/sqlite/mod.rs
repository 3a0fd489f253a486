//! SQLite-backed repository.
//!
//! Entities live in one table each; tagged-variant and nested fields are
//! stored as JSON TEXT columns. A handful of columns (phase, node_id,
//! catalog_id, ...) are denormalized from the JSON so the indexed queries
//! of the contract stay real SQL predicates.

mod audits;
mod images;
mod nodes;
mod storage;
mod vms;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::warn;

use kestrel_types::{Error, Result};

use crate::traits::Repository;

/// Connection-pool bounds.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub conn_max_lifetime: std::time::Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            conn_max_lifetime: std::time::Duration::from_secs(30 * 60),
        }
    }
}

/// Composite repository over a single SQLite pool.
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Opens (creating if needed) the database file and runs migrations.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        Self::open_with(data_dir, PoolSettings::default()).await
    }

    pub async fn open_with(data_dir: &Path, settings: PoolSettings) -> Result<Self> {
        let db_path = data_dir.join("kestrel.db");
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        Self::open_url(&db_url, settings).await
    }

    /// In-memory database for tests and dev mode.
    pub async fn open_in_memory() -> Result<Self> {
        // A single connection keeps the in-memory database alive and
        // serializes test access.
        Self::open_url(
            "sqlite::memory:",
            PoolSettings {
                max_connections: 1,
                min_connections: 1,
                conn_max_lifetime: std::time::Duration::from_secs(3600),
            },
        )
        .await
    }

    async fn open_url(db_url: &str, settings: PoolSettings) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .max_lifetime(settings.conn_max_lifetime)
            .connect(db_url)
            .await
            .map_err(|e| Error::internal("open database", e))?;

        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                hostname TEXT NOT NULL UNIQUE,
                management_ip TEXT NOT NULL,
                cluster_id TEXT,
                labels TEXT NOT NULL DEFAULT '{}',
                spec TEXT NOT NULL,
                status TEXT NOT NULL,
                phase TEXT NOT NULL,
                compute INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS vms (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                labels TEXT NOT NULL DEFAULT '{}',
                hardware_version INTEGER NOT NULL DEFAULT 1,
                spec TEXT NOT NULL,
                status TEXT NOT NULL,
                state TEXT NOT NULL,
                node_id TEXT,
                created_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (project_id, name)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_vms_node ON vms (node_id)",
            "CREATE INDEX IF NOT EXISTS idx_vms_created ON vms (created_at DESC, id)",
            r#"
            CREATE TABLE IF NOT EXISTS clusters (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                ha TEXT NOT NULL,
                drs TEXT NOT NULL,
                defaults TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS storage_pools (
                id TEXT PRIMARY KEY,
                project_id TEXT,
                name TEXT NOT NULL UNIQUE,
                backend TEXT NOT NULL,
                assigned_node_ids TEXT NOT NULL DEFAULT '[]',
                labels TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL,
                phase TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS volumes (
                id TEXT PRIMARY KEY,
                pool_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                name TEXT NOT NULL,
                spec TEXT NOT NULL,
                status TEXT NOT NULL,
                phase TEXT NOT NULL,
                attached_vm_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (project_id, name)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_volumes_pool ON volumes (pool_id)",
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                id TEXT PRIMARY KEY,
                vm_id TEXT NOT NULL,
                name TEXT NOT NULL,
                parent_id TEXT,
                state TEXT NOT NULL,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                vm_spec TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (vm_id, name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS images (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                name TEXT NOT NULL,
                spec TEXT NOT NULL,
                status TEXT NOT NULL,
                phase TEXT NOT NULL,
                catalog_id TEXT,
                node_id TEXT,
                path TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_images_catalog ON images (catalog_id)",
            r#"
            CREATE TABLE IF NOT EXISTS registration_tokens (
                id TEXT PRIMARY KEY,
                token TEXT NOT NULL UNIQUE,
                expires_at TEXT,
                max_uses INTEGER NOT NULL DEFAULT 0,
                use_count INTEGER NOT NULL DEFAULT 0,
                used_by_nodes TEXT NOT NULL DEFAULT '[]',
                revoked INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS audit_entries (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                project_id TEXT,
                details TEXT NOT NULL DEFAULT 'null'
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_audit_time ON audit_entries (timestamp)",
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                severity TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                message TEXT NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                resolved_at TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS download_jobs (
                id TEXT PRIMARY KEY,
                image_id TEXT NOT NULL,
                catalog_id TEXT NOT NULL,
                pool_id TEXT NOT NULL,
                node_id TEXT,
                remote_job_id TEXT,
                target_path TEXT,
                state TEXT NOT NULL,
                progress_percent INTEGER NOT NULL DEFAULT 0,
                bytes_downloaded INTEGER NOT NULL DEFAULT 0,
                total_bytes INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        ];

        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::internal("migrate", e))?;
        }
        Ok(())
    }
}

impl Repository for SqliteRepository {
    fn nodes(&self) -> &dyn crate::traits::NodeRepo {
        self
    }
    fn vms(&self) -> &dyn crate::traits::VmRepo {
        self
    }
    fn clusters(&self) -> &dyn crate::traits::ClusterRepo {
        self
    }
    fn pools(&self) -> &dyn crate::traits::PoolRepo {
        self
    }
    fn volumes(&self) -> &dyn crate::traits::VolumeRepo {
        self
    }
    fn snapshots(&self) -> &dyn crate::traits::SnapshotRepo {
        self
    }
    fn images(&self) -> &dyn crate::traits::ImageRepo {
        self
    }
    fn tokens(&self) -> &dyn crate::traits::TokenRepo {
        self
    }
    fn audit(&self) -> &dyn crate::traits::AuditRepo {
        self
    }
    fn alerts(&self) -> &dyn crate::traits::AlertRepo {
        self
    }
    fn download_jobs(&self) -> &dyn crate::traits::DownloadJobRepo {
        self
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Maps a driver error into the taxonomy. Unique-constraint violations are
/// detected through the structured error code (SQLite 2067 / 1555), never
/// by message matching.
pub(crate) fn map_err(op: &str, err: sqlx::Error) -> Error {
    match err {
        sqlx::Error::RowNotFound => Error::NotFound(op.to_string()),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("2067") | Some("1555") => {
                Error::AlreadyExists(format!("{}: {}", op, db.message()))
            }
            _ => Error::internal(op, db.message()),
        },
        other => Error::internal(op, other),
    }
}

/// Fixed-width RFC 3339 so lexicographic order matches time order.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(op: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::internal(op, format!("bad timestamp {:?}: {}", raw, e)))
}

pub(crate) fn to_json<T: Serialize>(op: &str, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::internal(op, e))
}

/// Strict decode for spec/status/backend columns: an unknown variant tag
/// is an error, not a default.
pub(crate) fn from_json<T: DeserializeOwned>(op: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| Error::internal(op, format!("decode: {}", e)))
}

/// Lenient decode for ancillary columns (labels, id lists): a corrupt
/// value is logged and replaced by the default instead of failing reads.
pub(crate) fn from_json_or_default<T: DeserializeOwned + Default>(op: &str, raw: &str) -> T {
    match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(op = op, error = %e, "defaulting undecodable JSON column");
            T::default()
        }
    }
}
