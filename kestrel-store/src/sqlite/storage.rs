//! Storage tables: pools, volumes, snapshots.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use kestrel_types::{
    Error, PoolStatus, Result, Snapshot, SnapshotState, StoragePool, Volume, VolumeStatus,
};

use super::{from_json, from_json_or_default, map_err, parse_ts, to_json, ts, SqliteRepository};
use crate::traits::{PoolRepo, SnapshotRepo, VolumeFilter, VolumeRepo};

// =============================================================================
// Pools
// =============================================================================

fn row_to_pool(row: SqliteRow) -> Result<StoragePool> {
    let backend_json: String = row.get("backend");
    let status_json: String = row.get("status");
    let assigned_json: String = row.get("assigned_node_ids");
    let labels_json: String = row.get("labels");
    Ok(StoragePool {
        id: row.get("id"),
        project_id: row.get("project_id"),
        name: row.get("name"),
        backend: from_json("pool.backend", &backend_json)?,
        assigned_node_ids: from_json_or_default("pool.assigned_node_ids", &assigned_json),
        labels: from_json_or_default("pool.labels", &labels_json),
        status: from_json("pool.status", &status_json)?,
        created_at: parse_ts("pool.created_at", &row.get::<String, _>("created_at"))?,
        updated_at: parse_ts("pool.updated_at", &row.get::<String, _>("updated_at"))?,
    })
}

#[async_trait]
impl PoolRepo for SqliteRepository {
    async fn create(&self, pool: &StoragePool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO storage_pools
                (id, project_id, name, backend, assigned_node_ids, labels,
                 status, phase, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&pool.id)
        .bind(&pool.project_id)
        .bind(&pool.name)
        .bind(to_json("create pool", &pool.backend)?)
        .bind(to_json("create pool", &pool.assigned_node_ids)?)
        .bind(to_json("create pool", &pool.labels)?)
        .bind(to_json("create pool", &pool.status)?)
        .bind(to_json("create pool", &pool.status.phase)?)
        .bind(ts(&pool.created_at))
        .bind(ts(&pool.updated_at))
        .execute(self.pool())
        .await
        .map_err(|e| map_err("create pool", e))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<StoragePool> {
        let row = sqlx::query("SELECT * FROM storage_pools WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_err("get pool", e))?;
        match row {
            Some(row) => row_to_pool(row),
            None => Err(Error::NotFound(format!("storage pool {}", id))),
        }
    }

    async fn get_by_name(&self, name: &str) -> Result<StoragePool> {
        let row = sqlx::query("SELECT * FROM storage_pools WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_err("get pool by name", e))?;
        match row {
            Some(row) => row_to_pool(row),
            None => Err(Error::NotFound(format!("storage pool {}", name))),
        }
    }

    async fn list(&self, project_id: Option<&str>) -> Result<Vec<StoragePool>> {
        let rows = sqlx::query(
            "SELECT * FROM storage_pools WHERE (?1 IS NULL OR project_id = ?1) ORDER BY name",
        )
        .bind(project_id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_err("list pools", e))?;
        rows.into_iter().map(row_to_pool).collect()
    }

    async fn list_assigned_to_node(&self, node_id: &str) -> Result<Vec<StoragePool>> {
        // Containment over the JSON array column.
        let rows = sqlx::query(
            r#"
            SELECT * FROM storage_pools
            WHERE EXISTS (
                SELECT 1 FROM json_each(storage_pools.assigned_node_ids)
                WHERE json_each.value = ?
            )
            ORDER BY name
            "#,
        )
        .bind(node_id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_err("list pools assigned to node", e))?;
        rows.into_iter().map(row_to_pool).collect()
    }

    async fn update(&self, pool: &StoragePool) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE storage_pools
            SET name = ?, backend = ?, assigned_node_ids = ?, labels = ?,
                status = ?, phase = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&pool.name)
        .bind(to_json("update pool", &pool.backend)?)
        .bind(to_json("update pool", &pool.assigned_node_ids)?)
        .bind(to_json("update pool", &pool.labels)?)
        .bind(to_json("update pool", &pool.status)?)
        .bind(to_json("update pool", &pool.status.phase)?)
        .bind(ts(&Utc::now()))
        .bind(&pool.id)
        .execute(self.pool())
        .await
        .map_err(|e| map_err("update pool", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("storage pool {}", pool.id)));
        }
        Ok(())
    }

    async fn update_status(&self, id: &str, status: &PoolStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE storage_pools SET status = ?, phase = ?, updated_at = ? WHERE id = ?",
        )
        .bind(to_json("update pool status", status)?)
        .bind(to_json("update pool status", &status.phase)?)
        .bind(ts(&Utc::now()))
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|e| map_err("update pool status", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("storage pool {}", id)));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM storage_pools WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| map_err("delete pool", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("storage pool {}", id)));
        }
        Ok(())
    }
}

// =============================================================================
// Volumes
// =============================================================================

fn row_to_volume(row: SqliteRow) -> Result<Volume> {
    let spec_json: String = row.get("spec");
    let status_json: String = row.get("status");
    Ok(Volume {
        id: row.get("id"),
        pool_id: row.get("pool_id"),
        project_id: row.get("project_id"),
        name: row.get("name"),
        spec: from_json("volume.spec", &spec_json)?,
        status: from_json("volume.status", &status_json)?,
        created_at: parse_ts("volume.created_at", &row.get::<String, _>("created_at"))?,
        updated_at: parse_ts("volume.updated_at", &row.get::<String, _>("updated_at"))?,
    })
}

#[async_trait]
impl VolumeRepo for SqliteRepository {
    async fn create(&self, volume: &Volume) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO volumes
                (id, pool_id, project_id, name, spec, status, phase,
                 attached_vm_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&volume.id)
        .bind(&volume.pool_id)
        .bind(&volume.project_id)
        .bind(&volume.name)
        .bind(to_json("create volume", &volume.spec)?)
        .bind(to_json("create volume", &volume.status)?)
        .bind(to_json("create volume", &volume.status.phase)?)
        .bind(&volume.status.attached_vm_id)
        .bind(ts(&volume.created_at))
        .bind(ts(&volume.updated_at))
        .execute(self.pool())
        .await
        .map_err(|e| map_err("create volume", e))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Volume> {
        let row = sqlx::query("SELECT * FROM volumes WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_err("get volume", e))?;
        match row {
            Some(row) => row_to_volume(row),
            None => Err(Error::NotFound(format!("volume {}", id))),
        }
    }

    async fn get_by_name(&self, project_id: &str, name: &str) -> Result<Volume> {
        let row = sqlx::query("SELECT * FROM volumes WHERE project_id = ? AND name = ?")
            .bind(project_id)
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_err("get volume by name", e))?;
        match row {
            Some(row) => row_to_volume(row),
            None => Err(Error::NotFound(format!("volume {}/{}", project_id, name))),
        }
    }

    async fn list(
        &self,
        filter: &VolumeFilter,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<Volume>, u64)> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM volumes
            WHERE (?1 IS NULL OR project_id = ?1)
              AND (?2 IS NULL OR pool_id = ?2)
            ORDER BY created_at DESC, id
            LIMIT ?3 OFFSET ?4
            "#,
        )
        .bind(&filter.project_id)
        .bind(&filter.pool_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_err("list volumes", e))?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM volumes
            WHERE (?1 IS NULL OR project_id = ?1)
              AND (?2 IS NULL OR pool_id = ?2)
            "#,
        )
        .bind(&filter.project_id)
        .bind(&filter.pool_id)
        .fetch_one(self.pool())
        .await
        .map_err(|e| map_err("count volumes", e))?;

        let volumes = rows.into_iter().map(row_to_volume).collect::<Result<_>>()?;
        Ok((volumes, total as u64))
    }

    async fn count_by_pool(&self, pool_id: &str) -> Result<u64> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM volumes WHERE pool_id = ?")
            .bind(pool_id)
            .fetch_one(self.pool())
            .await
            .map_err(|e| map_err("count volumes by pool", e))?;
        Ok(total as u64)
    }

    async fn update(&self, volume: &Volume) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE volumes
            SET name = ?, spec = ?, status = ?, phase = ?, attached_vm_id = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&volume.name)
        .bind(to_json("update volume", &volume.spec)?)
        .bind(to_json("update volume", &volume.status)?)
        .bind(to_json("update volume", &volume.status.phase)?)
        .bind(&volume.status.attached_vm_id)
        .bind(ts(&Utc::now()))
        .bind(&volume.id)
        .execute(self.pool())
        .await
        .map_err(|e| map_err("update volume", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("volume {}", volume.id)));
        }
        Ok(())
    }

    async fn update_status(&self, id: &str, status: &VolumeStatus) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE volumes
            SET status = ?, phase = ?, attached_vm_id = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(to_json("update volume status", status)?)
        .bind(to_json("update volume status", &status.phase)?)
        .bind(&status.attached_vm_id)
        .bind(ts(&Utc::now()))
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|e| map_err("update volume status", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("volume {}", id)));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM volumes WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| map_err("delete volume", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("volume {}", id)));
        }
        Ok(())
    }
}

// =============================================================================
// Snapshots
// =============================================================================

fn row_to_snapshot(row: SqliteRow) -> Result<Snapshot> {
    let vm_spec_json: String = row.get("vm_spec");
    let state_json: String = row.get("state");
    Ok(Snapshot {
        id: row.get("id"),
        vm_id: row.get("vm_id"),
        name: row.get("name"),
        parent_id: row.get("parent_id"),
        state: from_json("snapshot.state", &state_json)?,
        size_bytes: row.get::<i64, _>("size_bytes") as u64,
        vm_spec: from_json("snapshot.vm_spec", &vm_spec_json)?,
        created_at: parse_ts("snapshot.created_at", &row.get::<String, _>("created_at"))?,
        updated_at: parse_ts("snapshot.updated_at", &row.get::<String, _>("updated_at"))?,
    })
}

#[async_trait]
impl SnapshotRepo for SqliteRepository {
    async fn create(&self, snapshot: &Snapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshots
                (id, vm_id, name, parent_id, state, size_bytes, vm_spec,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.id)
        .bind(&snapshot.vm_id)
        .bind(&snapshot.name)
        .bind(&snapshot.parent_id)
        .bind(to_json("create snapshot", &snapshot.state)?)
        .bind(snapshot.size_bytes as i64)
        .bind(to_json("create snapshot", &snapshot.vm_spec)?)
        .bind(ts(&snapshot.created_at))
        .bind(ts(&snapshot.updated_at))
        .execute(self.pool())
        .await
        .map_err(|e| map_err("create snapshot", e))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Snapshot> {
        let row = sqlx::query("SELECT * FROM snapshots WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_err("get snapshot", e))?;
        match row {
            Some(row) => row_to_snapshot(row),
            None => Err(Error::NotFound(format!("snapshot {}", id))),
        }
    }

    async fn get_by_name(&self, vm_id: &str, name: &str) -> Result<Snapshot> {
        let row = sqlx::query("SELECT * FROM snapshots WHERE vm_id = ? AND name = ?")
            .bind(vm_id)
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_err("get snapshot by name", e))?;
        match row {
            Some(row) => row_to_snapshot(row),
            None => Err(Error::NotFound(format!("snapshot {}/{}", vm_id, name))),
        }
    }

    async fn list_by_vm(&self, vm_id: &str) -> Result<Vec<Snapshot>> {
        // Sibling order under a shared parent is (created_at, id); stable
        // under equal timestamps.
        let rows = sqlx::query("SELECT * FROM snapshots WHERE vm_id = ? ORDER BY created_at, id")
            .bind(vm_id)
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_err("list snapshots", e))?;
        rows.into_iter().map(row_to_snapshot).collect()
    }

    async fn update(&self, snapshot: &Snapshot) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE snapshots
            SET name = ?, parent_id = ?, state = ?, size_bytes = ?, vm_spec = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&snapshot.name)
        .bind(&snapshot.parent_id)
        .bind(to_json("update snapshot", &snapshot.state)?)
        .bind(snapshot.size_bytes as i64)
        .bind(to_json("update snapshot", &snapshot.vm_spec)?)
        .bind(ts(&Utc::now()))
        .bind(&snapshot.id)
        .execute(self.pool())
        .await
        .map_err(|e| map_err("update snapshot", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("snapshot {}", snapshot.id)));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM snapshots WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| map_err("delete snapshot", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("snapshot {}", id)));
        }
        Ok(())
    }

    async fn sync_from_hypervisor(&self, vm_id: &str, delivered: &[Snapshot]) -> Result<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_err("sync snapshots", e))?;

        let stored_ids: Vec<String> = sqlx::query_scalar("SELECT id FROM snapshots WHERE vm_id = ?")
            .bind(vm_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_err("sync snapshots", e))?;

        let now = ts(&Utc::now());
        let available = to_json("sync snapshots", &SnapshotState::Available)?;
        let deleted = to_json("sync snapshots", &SnapshotState::Deleted)?;

        for snapshot in delivered {
            // Upsert delivered snapshots as Available.
            sqlx::query(
                r#"
                INSERT INTO snapshots
                    (id, vm_id, name, parent_id, state, size_bytes, vm_spec,
                     created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (id) DO UPDATE SET
                    name = excluded.name,
                    parent_id = excluded.parent_id,
                    state = excluded.state,
                    size_bytes = excluded.size_bytes,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&snapshot.id)
            .bind(vm_id)
            .bind(&snapshot.name)
            .bind(&snapshot.parent_id)
            .bind(&available)
            .bind(snapshot.size_bytes as i64)
            .bind(to_json("sync snapshots", &snapshot.vm_spec)?)
            .bind(ts(&snapshot.created_at))
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_err("sync snapshots", e))?;
        }

        // Stored but no longer reported: mark Deleted.
        for stored in &stored_ids {
            if !delivered.iter().any(|s| &s.id == stored) {
                sqlx::query("UPDATE snapshots SET state = ?, updated_at = ? WHERE id = ?")
                    .bind(&deleted)
                    .bind(&now)
                    .bind(stored)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_err("sync snapshots", e))?;
            }
        }

        tx.commit().await.map_err(|e| map_err("sync snapshots", e))?;
        Ok(())
    }
}
