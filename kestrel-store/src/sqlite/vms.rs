//! VM table, including the cursor-based listing.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{QueryBuilder, Row};

use kestrel_types::{Error, Result, VirtualMachine, VmStatus};

use super::{from_json, from_json_or_default, map_err, parse_ts, to_json, ts, SqliteRepository};
use crate::traits::{VmCursorPage, VmFilter, VmRepo};

fn row_to_vm(row: SqliteRow) -> Result<VirtualMachine> {
    let spec_json: String = row.get("spec");
    let status_json: String = row.get("status");
    let labels_json: String = row.get("labels");
    Ok(VirtualMachine {
        id: row.get("id"),
        project_id: row.get("project_id"),
        name: row.get("name"),
        description: row.get("description"),
        labels: from_json_or_default("vm.labels", &labels_json),
        hardware_version: row.get::<i64, _>("hardware_version") as u32,
        spec: from_json("vm.spec", &spec_json)?,
        status: from_json("vm.status", &status_json)?,
        created_by: row.get("created_by"),
        created_at: parse_ts("vm.created_at", &row.get::<String, _>("created_at"))?,
        updated_at: parse_ts("vm.updated_at", &row.get::<String, _>("updated_at"))?,
    })
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &VmFilter) -> Result<()> {
    qb.push(" WHERE 1 = 1");
    if let Some(project_id) = &filter.project_id {
        qb.push(" AND project_id = ").push_bind(project_id.clone());
    }
    if let Some(node_id) = &filter.node_id {
        qb.push(" AND node_id = ").push_bind(node_id.clone());
    }
    if let Some(states) = &filter.states {
        if !states.is_empty() {
            qb.push(" AND state IN (");
            let mut sep = qb.separated(", ");
            for state in states {
                sep.push_bind(to_json("vm filter", state)?);
            }
            qb.push(")");
        }
    }
    if let Some(needle) = &filter.name_contains {
        qb.push(" AND name LIKE ").push_bind(format!("%{}%", needle));
    }
    Ok(())
}

async fn count_filtered(repo: &SqliteRepository, filter: &VmFilter) -> Result<u64> {
    let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM vms");
    push_filter(&mut qb, filter)?;
    let total: i64 = qb
        .build_query_scalar()
        .fetch_one(repo.pool())
        .await
        .map_err(|e| map_err("count vms", e))?;
    Ok(total as u64)
}

#[async_trait]
impl VmRepo for SqliteRepository {
    async fn create(&self, vm: &VirtualMachine) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO vms
                (id, project_id, name, description, labels, hardware_version,
                 spec, status, state, node_id, created_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&vm.id)
        .bind(&vm.project_id)
        .bind(&vm.name)
        .bind(&vm.description)
        .bind(to_json("create vm", &vm.labels)?)
        .bind(vm.hardware_version as i64)
        .bind(to_json("create vm", &vm.spec)?)
        .bind(to_json("create vm", &vm.status)?)
        .bind(to_json("create vm", &vm.status.state)?)
        .bind(&vm.status.node_id)
        .bind(&vm.created_by)
        .bind(ts(&vm.created_at))
        .bind(ts(&vm.updated_at))
        .execute(self.pool())
        .await
        .map_err(|e| map_err("create vm", e))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<VirtualMachine> {
        let row = sqlx::query("SELECT * FROM vms WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_err("get vm", e))?;
        match row {
            Some(row) => row_to_vm(row),
            None => Err(Error::NotFound(format!("vm {}", id))),
        }
    }

    async fn get_by_name(&self, project_id: &str, name: &str) -> Result<VirtualMachine> {
        let row = sqlx::query("SELECT * FROM vms WHERE project_id = ? AND name = ?")
            .bind(project_id)
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_err("get vm by name", e))?;
        match row {
            Some(row) => row_to_vm(row),
            None => Err(Error::NotFound(format!("vm {}/{}", project_id, name))),
        }
    }

    async fn list(
        &self,
        filter: &VmFilter,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<VirtualMachine>, u64)> {
        let mut qb = QueryBuilder::new("SELECT * FROM vms");
        push_filter(&mut qb, filter)?;
        qb.push(" ORDER BY created_at DESC, id");
        qb.push(" LIMIT ").push_bind(limit as i64);
        qb.push(" OFFSET ").push_bind(offset as i64);

        let rows = qb
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_err("list vms", e))?;
        let vms: Vec<VirtualMachine> = rows.into_iter().map(row_to_vm).collect::<Result<_>>()?;
        let total = count_filtered(self, filter).await?;
        Ok((vms, total))
    }

    async fn list_cursor(
        &self,
        filter: &VmFilter,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<VmCursorPage> {
        let mut qb = QueryBuilder::new("SELECT * FROM vms");
        push_filter(&mut qb, filter)?;

        if let Some(cursor) = cursor {
            let (created, id) = cursor.split_once('|').ok_or_else(|| {
                Error::InvalidArgument(format!("malformed cursor {:?}", cursor))
            })?;
            // Keyset predicate for (created_at DESC, id ASC) ordering.
            qb.push(" AND (created_at < ")
                .push_bind(created.to_string())
                .push(" OR (created_at = ")
                .push_bind(created.to_string())
                .push(" AND id > ")
                .push_bind(id.to_string())
                .push("))");
        }

        qb.push(" ORDER BY created_at DESC, id LIMIT ")
            .push_bind(limit as i64);

        let rows = qb
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_err("list vms", e))?;
        let items: Vec<VirtualMachine> = rows.into_iter().map(row_to_vm).collect::<Result<_>>()?;

        let next_cursor = if items.len() == limit as usize {
            items
                .last()
                .map(|vm| format!("{}|{}", ts(&vm.created_at), vm.id))
        } else {
            None
        };
        let total = count_filtered(self, filter).await?;

        Ok(VmCursorPage {
            items,
            next_cursor,
            total,
        })
    }

    async fn list_by_node(&self, node_id: &str) -> Result<Vec<VirtualMachine>> {
        let rows = sqlx::query("SELECT * FROM vms WHERE node_id = ? ORDER BY created_at DESC, id")
            .bind(node_id)
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_err("list vms by node", e))?;
        rows.into_iter().map(row_to_vm).collect()
    }

    async fn count_by_node(&self, node_id: &str) -> Result<u64> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vms WHERE node_id = ?")
            .bind(node_id)
            .fetch_one(self.pool())
            .await
            .map_err(|e| map_err("count vms by node", e))?;
        Ok(total as u64)
    }

    async fn count_by_project(&self, project_id: &str) -> Result<u64> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vms WHERE project_id = ?")
            .bind(project_id)
            .fetch_one(self.pool())
            .await
            .map_err(|e| map_err("count vms by project", e))?;
        Ok(total as u64)
    }

    async fn update(&self, vm: &VirtualMachine) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE vms
            SET name = ?, description = ?, labels = ?, hardware_version = ?,
                spec = ?, status = ?, state = ?, node_id = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&vm.name)
        .bind(&vm.description)
        .bind(to_json("update vm", &vm.labels)?)
        .bind(vm.hardware_version as i64)
        .bind(to_json("update vm", &vm.spec)?)
        .bind(to_json("update vm", &vm.status)?)
        .bind(to_json("update vm", &vm.status.state)?)
        .bind(&vm.status.node_id)
        .bind(ts(&Utc::now()))
        .bind(&vm.id)
        .execute(self.pool())
        .await
        .map_err(|e| map_err("update vm", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("vm {}", vm.id)));
        }
        Ok(())
    }

    async fn update_status(&self, id: &str, status: &VmStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE vms SET status = ?, state = ?, node_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(to_json("update vm status", status)?)
        .bind(to_json("update vm status", &status.state)?)
        .bind(&status.node_id)
        .bind(ts(&Utc::now()))
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|e| map_err("update vm status", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("vm {}", id)));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        // VM deletion cascades to snapshots in one transaction.
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_err("delete vm", e))?;

        sqlx::query("DELETE FROM snapshots WHERE vm_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_err("delete vm snapshots", e))?;

        let result = sqlx::query("DELETE FROM vms WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_err("delete vm", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("vm {}", id)));
        }

        tx.commit().await.map_err(|e| map_err("delete vm", e))?;
        Ok(())
    }
}
