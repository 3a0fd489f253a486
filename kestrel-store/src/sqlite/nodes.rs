//! Node table.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use kestrel_types::{Error, Node, NodeStatus, Resources, Result};

use super::{from_json, from_json_or_default, map_err, parse_ts, to_json, ts, SqliteRepository};
use crate::traits::{NodeFilter, NodeRepo};

fn row_to_node(row: SqliteRow) -> Result<Node> {
    let spec_json: String = row.get("spec");
    let status_json: String = row.get("status");
    let labels_json: String = row.get("labels");
    Ok(Node {
        id: row.get("id"),
        hostname: row.get("hostname"),
        management_ip: row.get("management_ip"),
        cluster_id: row.get("cluster_id"),
        labels: from_json_or_default("node.labels", &labels_json),
        spec: from_json("node.spec", &spec_json)?,
        status: from_json("node.status", &status_json)?,
        created_at: parse_ts("node.created_at", &row.get::<String, _>("created_at"))?,
        updated_at: parse_ts("node.updated_at", &row.get::<String, _>("updated_at"))?,
    })
}

#[async_trait]
impl NodeRepo for SqliteRepository {
    async fn create(&self, node: &Node) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO nodes
                (id, hostname, management_ip, cluster_id, labels, spec, status,
                 phase, compute, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&node.id)
        .bind(&node.hostname)
        .bind(&node.management_ip)
        .bind(&node.cluster_id)
        .bind(to_json("create node", &node.labels)?)
        .bind(to_json("create node", &node.spec)?)
        .bind(to_json("create node", &node.status)?)
        .bind(to_json("create node", &node.status.phase)?)
        .bind(node.spec.roles.compute as i64)
        .bind(ts(&node.created_at))
        .bind(ts(&node.updated_at))
        .execute(self.pool())
        .await
        .map_err(|e| map_err("create node", e))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Node> {
        let row = sqlx::query("SELECT * FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_err("get node", e))?;
        match row {
            Some(row) => row_to_node(row),
            None => Err(Error::NotFound(format!("node {}", id))),
        }
    }

    async fn get_by_hostname(&self, hostname: &str) -> Result<Node> {
        let row = sqlx::query("SELECT * FROM nodes WHERE hostname = ?")
            .bind(hostname)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_err("get node by hostname", e))?;
        match row {
            Some(row) => row_to_node(row),
            None => Err(Error::NotFound(format!("node {}", hostname))),
        }
    }

    async fn list(
        &self,
        filter: &NodeFilter,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<Node>, u64)> {
        // Optional predicates collapse to always-true when unset.
        let phase_json = match &filter.phase {
            Some(p) => Some(to_json("list nodes", p)?),
            None => None,
        };

        let rows = sqlx::query(
            r#"
            SELECT * FROM nodes
            WHERE (?1 IS NULL OR cluster_id = ?1)
              AND (?2 IS NULL OR phase = ?2)
            ORDER BY hostname
            LIMIT ?3 OFFSET ?4
            "#,
        )
        .bind(&filter.cluster_id)
        .bind(&phase_json)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_err("list nodes", e))?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM nodes
            WHERE (?1 IS NULL OR cluster_id = ?1)
              AND (?2 IS NULL OR phase = ?2)
            "#,
        )
        .bind(&filter.cluster_id)
        .bind(&phase_json)
        .fetch_one(self.pool())
        .await
        .map_err(|e| map_err("count nodes", e))?;

        let nodes = rows.into_iter().map(row_to_node).collect::<Result<_>>()?;
        Ok((nodes, total as u64))
    }

    async fn update(&self, node: &Node) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE nodes
            SET hostname = ?, management_ip = ?, cluster_id = ?, labels = ?,
                spec = ?, status = ?, phase = ?, compute = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&node.hostname)
        .bind(&node.management_ip)
        .bind(&node.cluster_id)
        .bind(to_json("update node", &node.labels)?)
        .bind(to_json("update node", &node.spec)?)
        .bind(to_json("update node", &node.status)?)
        .bind(to_json("update node", &node.status.phase)?)
        .bind(node.spec.roles.compute as i64)
        .bind(ts(&Utc::now()))
        .bind(&node.id)
        .execute(self.pool())
        .await
        .map_err(|e| map_err("update node", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("node {}", node.id)));
        }
        Ok(())
    }

    async fn update_status(&self, id: &str, status: &NodeStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE nodes SET status = ?, phase = ?, updated_at = ? WHERE id = ?",
        )
        .bind(to_json("update node status", status)?)
        .bind(to_json("update node status", &status.phase)?)
        .bind(ts(&Utc::now()))
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|e| map_err("update node status", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("node {}", id)));
        }
        Ok(())
    }

    async fn update_heartbeat(&self, id: &str, allocated: Resources) -> Result<()> {
        // Read-modify-write of the status blob; the heartbeat column is
        // part of the status, so there is no denormalized shortcut here.
        let mut node = NodeRepo::get(self, id).await?;
        node.status.allocated = allocated;
        node.status.last_heartbeat = Some(Utc::now());
        self.update_status(id, &node.status).await
    }

    async fn list_schedulable(&self) -> Result<Vec<Node>> {
        let phase_ready = to_json("list schedulable", &kestrel_types::NodePhase::Ready)?;
        let rows = sqlx::query(
            "SELECT * FROM nodes WHERE phase = ? AND compute = 1 ORDER BY hostname",
        )
        .bind(phase_ready)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_err("list schedulable", e))?;
        rows.into_iter().map(row_to_node).collect()
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| map_err("delete node", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("node {}", id)));
        }
        Ok(())
    }
}
