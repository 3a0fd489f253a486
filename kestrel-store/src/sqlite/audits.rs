//! Clusters, registration tokens, audit entries, alerts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tokio::sync::{mpsc, oneshot};

use kestrel_types::{Alert, AuditEntry, Cluster, Error, RegistrationToken, Result};

use super::{from_json, from_json_or_default, map_err, parse_ts, to_json, ts, SqliteRepository};
use crate::traits::{AlertFilter, AlertRepo, AuditExport, AuditFilter, AuditRepo, ClusterRepo, TokenRepo};

// =============================================================================
// Clusters
// =============================================================================

fn row_to_cluster(row: SqliteRow) -> Result<Cluster> {
    let ha_json: String = row.get("ha");
    let drs_json: String = row.get("drs");
    let defaults_json: String = row.get("defaults");
    Ok(Cluster {
        id: row.get("id"),
        name: row.get("name"),
        ha: from_json("cluster.ha", &ha_json)?,
        drs: from_json("cluster.drs", &drs_json)?,
        defaults: from_json_or_default("cluster.defaults", &defaults_json),
        created_at: parse_ts("cluster.created_at", &row.get::<String, _>("created_at"))?,
        updated_at: parse_ts("cluster.updated_at", &row.get::<String, _>("updated_at"))?,
    })
}

#[async_trait]
impl ClusterRepo for SqliteRepository {
    async fn create(&self, cluster: &Cluster) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO clusters (id, name, ha, drs, defaults, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&cluster.id)
        .bind(&cluster.name)
        .bind(to_json("create cluster", &cluster.ha)?)
        .bind(to_json("create cluster", &cluster.drs)?)
        .bind(to_json("create cluster", &cluster.defaults)?)
        .bind(ts(&cluster.created_at))
        .bind(ts(&cluster.updated_at))
        .execute(self.pool())
        .await
        .map_err(|e| map_err("create cluster", e))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Cluster> {
        let row = sqlx::query("SELECT * FROM clusters WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_err("get cluster", e))?;
        match row {
            Some(row) => row_to_cluster(row),
            None => Err(Error::NotFound(format!("cluster {}", id))),
        }
    }

    async fn get_by_name(&self, name: &str) -> Result<Cluster> {
        let row = sqlx::query("SELECT * FROM clusters WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_err("get cluster by name", e))?;
        match row {
            Some(row) => row_to_cluster(row),
            None => Err(Error::NotFound(format!("cluster {}", name))),
        }
    }

    async fn list(&self) -> Result<Vec<Cluster>> {
        let rows = sqlx::query("SELECT * FROM clusters ORDER BY name")
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_err("list clusters", e))?;
        rows.into_iter().map(row_to_cluster).collect()
    }

    async fn update(&self, cluster: &Cluster) -> Result<()> {
        let result = sqlx::query(
            "UPDATE clusters SET name = ?, ha = ?, drs = ?, defaults = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&cluster.name)
        .bind(to_json("update cluster", &cluster.ha)?)
        .bind(to_json("update cluster", &cluster.drs)?)
        .bind(to_json("update cluster", &cluster.defaults)?)
        .bind(ts(&Utc::now()))
        .bind(&cluster.id)
        .execute(self.pool())
        .await
        .map_err(|e| map_err("update cluster", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("cluster {}", cluster.id)));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM clusters WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| map_err("delete cluster", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("cluster {}", id)));
        }
        Ok(())
    }
}

// =============================================================================
// Registration tokens
// =============================================================================

fn row_to_token(row: SqliteRow) -> Result<RegistrationToken> {
    let used_by_json: String = row.get("used_by_nodes");
    let expires_at: Option<String> = row.get("expires_at");
    Ok(RegistrationToken {
        id: row.get("id"),
        token: row.get("token"),
        expires_at: match expires_at {
            Some(raw) => Some(parse_ts("token.expires_at", &raw)?),
            None => None,
        },
        max_uses: row.get::<i64, _>("max_uses") as u32,
        use_count: row.get::<i64, _>("use_count") as u32,
        used_by_nodes: from_json_or_default("token.used_by_nodes", &used_by_json),
        revoked: row.get::<i64, _>("revoked") != 0,
        created_at: parse_ts("token.created_at", &row.get::<String, _>("created_at"))?,
    })
}

#[async_trait]
impl TokenRepo for SqliteRepository {
    async fn create(&self, token: &RegistrationToken) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO registration_tokens
                (id, token, expires_at, max_uses, use_count, used_by_nodes, revoked, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&token.id)
        .bind(&token.token)
        .bind(token.expires_at.as_ref().map(ts))
        .bind(token.max_uses as i64)
        .bind(token.use_count as i64)
        .bind(to_json("create token", &token.used_by_nodes)?)
        .bind(token.revoked as i64)
        .bind(ts(&token.created_at))
        .execute(self.pool())
        .await
        .map_err(|e| map_err("create token", e))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<RegistrationToken> {
        let row = sqlx::query("SELECT * FROM registration_tokens WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_err("get token", e))?;
        match row {
            Some(row) => row_to_token(row),
            None => Err(Error::NotFound(format!("registration token {}", id))),
        }
    }

    async fn get_by_token(&self, token: &str) -> Result<RegistrationToken> {
        let row = sqlx::query("SELECT * FROM registration_tokens WHERE token = ?")
            .bind(token)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_err("get token", e))?;
        match row {
            Some(row) => row_to_token(row),
            None => Err(Error::NotFound("registration token".to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<RegistrationToken>> {
        let rows = sqlx::query("SELECT * FROM registration_tokens ORDER BY created_at DESC")
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_err("list tokens", e))?;
        rows.into_iter().map(row_to_token).collect()
    }

    async fn update(&self, token: &RegistrationToken) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE registration_tokens
            SET expires_at = ?, max_uses = ?, use_count = ?, used_by_nodes = ?, revoked = ?
            WHERE id = ?
            "#,
        )
        .bind(token.expires_at.as_ref().map(ts))
        .bind(token.max_uses as i64)
        .bind(token.use_count as i64)
        .bind(to_json("update token", &token.used_by_nodes)?)
        .bind(token.revoked as i64)
        .bind(&token.id)
        .execute(self.pool())
        .await
        .map_err(|e| map_err("update token", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("registration token {}", token.id)));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM registration_tokens WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| map_err("delete token", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("registration token {}", id)));
        }
        Ok(())
    }
}

// =============================================================================
// Audit entries
// =============================================================================

fn row_to_audit(row: SqliteRow) -> Result<AuditEntry> {
    let details_json: String = row.get("details");
    Ok(AuditEntry {
        id: row.get("id"),
        timestamp: parse_ts("audit.timestamp", &row.get::<String, _>("timestamp"))?,
        actor: row.get("actor"),
        action: row.get("action"),
        resource_type: row.get("resource_type"),
        resource_id: row.get("resource_id"),
        project_id: row.get("project_id"),
        details: from_json_or_default("audit.details", &details_json),
    })
}

const AUDIT_FILTER_SQL: &str = r#"
      (?1 IS NULL OR resource_type = ?1)
  AND (?2 IS NULL OR resource_id = ?2)
  AND (?3 IS NULL OR actor = ?3)
  AND (?4 IS NULL OR timestamp >= ?4)
  AND (?5 IS NULL OR timestamp < ?5)
"#;

fn bind_audit_filter<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    filter: &'q AuditFilter,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(&filter.resource_type)
        .bind(&filter.resource_id)
        .bind(&filter.actor)
        .bind(filter.since.as_ref().map(ts))
        .bind(filter.until.as_ref().map(ts))
}

#[async_trait]
impl AuditRepo for SqliteRepository {
    async fn create(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_entries
                (id, timestamp, actor, action, resource_type, resource_id, project_id, details)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(ts(&entry.timestamp))
        .bind(&entry.actor)
        .bind(&entry.action)
        .bind(&entry.resource_type)
        .bind(&entry.resource_id)
        .bind(&entry.project_id)
        .bind(to_json("create audit entry", &entry.details)?)
        .execute(self.pool())
        .await
        .map_err(|e| map_err("create audit entry", e))?;
        Ok(())
    }

    async fn list(
        &self,
        filter: &AuditFilter,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<AuditEntry>, u64)> {
        let sql = format!(
            "SELECT * FROM audit_entries WHERE {} ORDER BY timestamp DESC LIMIT ?6 OFFSET ?7",
            AUDIT_FILTER_SQL
        );
        let rows = bind_audit_filter(sqlx::query(&sql), filter)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_err("list audit entries", e))?;

        let count_sql = format!("SELECT COUNT(*) FROM audit_entries WHERE {}", AUDIT_FILTER_SQL);
        let total: i64 = bind_audit_filter(sqlx::query(&count_sql), filter)
            .fetch_one(self.pool())
            .await
            .map_err(|e| map_err("count audit entries", e))?
            .get(0);

        let entries = rows.into_iter().map(row_to_audit).collect::<Result<_>>()?;
        Ok((entries, total as u64))
    }

    async fn export(&self, filter: &AuditFilter) -> Result<AuditExport> {
        let (entry_tx, entry_rx) = mpsc::channel(64);
        let (err_tx, err_rx) = oneshot::channel();

        // Fetch in ascending pages so the export streams in time order
        // without holding the whole table in memory.
        let pool = self.pool().clone();
        let filter = filter.clone();
        tokio::spawn(async move {
            let sql = format!(
                "SELECT * FROM audit_entries WHERE {} AND (?6 IS NULL OR (timestamp > ?7 OR (timestamp = ?7 AND id > ?8))) ORDER BY timestamp, id LIMIT 256",
                AUDIT_FILTER_SQL
            );
            let mut cursor: Option<(String, String)> = None;

            loop {
                let has_cursor = cursor.is_some();
                let (cursor_ts, cursor_id) = cursor.clone().unwrap_or_default();
                let result = bind_audit_filter(sqlx::query(&sql), &filter)
                    .bind(if has_cursor { Some(1i64) } else { None })
                    .bind(&cursor_ts)
                    .bind(&cursor_id)
                    .fetch_all(&pool)
                    .await;

                let rows = match result {
                    Ok(rows) => rows,
                    Err(e) => {
                        let _ = err_tx.send(map_err("export audit entries", e));
                        return;
                    }
                };
                if rows.is_empty() {
                    return; // channel closes when entry_tx drops
                }

                for row in rows {
                    let raw_ts: String = row.get("timestamp");
                    let raw_id: String = row.get("id");
                    let entry = match row_to_audit(row) {
                        Ok(entry) => entry,
                        Err(e) => {
                            let _ = err_tx.send(e);
                            return;
                        }
                    };
                    if entry_tx.send(entry).await.is_err() {
                        return; // receiver dropped, export cancelled
                    }
                    cursor = Some((raw_ts, raw_id));
                }
            }
        });

        Ok(AuditExport {
            entries: entry_rx,
            errors: err_rx,
        })
    }

    async fn prune_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM audit_entries WHERE timestamp < ?")
            .bind(ts(&before))
            .execute(self.pool())
            .await
            .map_err(|e| map_err("prune audit entries", e))?;
        Ok(result.rows_affected())
    }
}

// =============================================================================
// Alerts
// =============================================================================

fn row_to_alert(row: SqliteRow) -> Result<Alert> {
    let severity_json: String = row.get("severity");
    let resolved_at: Option<String> = row.get("resolved_at");
    Ok(Alert {
        id: row.get("id"),
        severity: from_json("alert.severity", &severity_json)?,
        resource_type: row.get("resource_type"),
        resource_id: row.get("resource_id"),
        message: row.get("message"),
        resolved: row.get::<i64, _>("resolved") != 0,
        resolved_at: match resolved_at {
            Some(raw) => Some(parse_ts("alert.resolved_at", &raw)?),
            None => None,
        },
        created_at: parse_ts("alert.created_at", &row.get::<String, _>("created_at"))?,
    })
}

#[async_trait]
impl AlertRepo for SqliteRepository {
    async fn create(&self, alert: &Alert) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alerts
                (id, severity, resource_type, resource_id, message, resolved, resolved_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&alert.id)
        .bind(to_json("create alert", &alert.severity)?)
        .bind(&alert.resource_type)
        .bind(&alert.resource_id)
        .bind(&alert.message)
        .bind(alert.resolved as i64)
        .bind(alert.resolved_at.as_ref().map(ts))
        .bind(ts(&alert.created_at))
        .execute(self.pool())
        .await
        .map_err(|e| map_err("create alert", e))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Alert> {
        let row = sqlx::query("SELECT * FROM alerts WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_err("get alert", e))?;
        match row {
            Some(row) => row_to_alert(row),
            None => Err(Error::NotFound(format!("alert {}", id))),
        }
    }

    async fn list(
        &self,
        filter: &AlertFilter,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<Alert>, u64)> {
        let severity_json = match &filter.severity {
            Some(s) => Some(to_json("list alerts", s)?),
            None => None,
        };
        let resolved = filter.resolved.map(|r| r as i64);

        let rows = sqlx::query(
            r#"
            SELECT * FROM alerts
            WHERE (?1 IS NULL OR resolved = ?1)
              AND (?2 IS NULL OR severity = ?2)
              AND (?3 IS NULL OR resource_id = ?3)
            ORDER BY created_at DESC
            LIMIT ?4 OFFSET ?5
            "#,
        )
        .bind(resolved)
        .bind(&severity_json)
        .bind(&filter.resource_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_err("list alerts", e))?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM alerts
            WHERE (?1 IS NULL OR resolved = ?1)
              AND (?2 IS NULL OR severity = ?2)
              AND (?3 IS NULL OR resource_id = ?3)
            "#,
        )
        .bind(resolved)
        .bind(&severity_json)
        .bind(&filter.resource_id)
        .fetch_one(self.pool())
        .await
        .map_err(|e| map_err("count alerts", e))?;

        let alerts = rows.into_iter().map(row_to_alert).collect::<Result<_>>()?;
        Ok((alerts, total as u64))
    }

    async fn resolve(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE alerts SET resolved = 1, resolved_at = ? WHERE id = ?")
            .bind(ts(&at))
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| map_err("resolve alert", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("alert {}", id)));
        }
        Ok(())
    }
}
