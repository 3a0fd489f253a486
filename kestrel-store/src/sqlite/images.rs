//! Image and download-job tables.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;

use kestrel_types::{DownloadJob, DownloadState, Error, Image, ImageStatus, Result};

use super::{from_json, map_err, parse_ts, to_json, ts, SqliteRepository};
use crate::traits::{DownloadJobRepo, ImageFilter, ImageRepo};

fn row_to_image(row: SqliteRow) -> Result<Image> {
    let spec_json: String = row.get("spec");
    let status_json: String = row.get("status");
    Ok(Image {
        id: row.get("id"),
        project_id: row.get("project_id"),
        name: row.get("name"),
        spec: from_json("image.spec", &spec_json)?,
        status: from_json("image.status", &status_json)?,
        created_at: parse_ts("image.created_at", &row.get::<String, _>("created_at"))?,
        updated_at: parse_ts("image.updated_at", &row.get::<String, _>("updated_at"))?,
    })
}

#[async_trait]
impl ImageRepo for SqliteRepository {
    async fn create(&self, image: &Image) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO images
                (id, project_id, name, spec, status, phase, catalog_id,
                 node_id, path, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&image.id)
        .bind(&image.project_id)
        .bind(&image.name)
        .bind(to_json("create image", &image.spec)?)
        .bind(to_json("create image", &image.status)?)
        .bind(to_json("create image", &image.status.phase)?)
        .bind(&image.spec.catalog_id)
        .bind(&image.status.node_id)
        .bind(&image.status.path)
        .bind(ts(&image.created_at))
        .bind(ts(&image.updated_at))
        .execute(self.pool())
        .await
        .map_err(|e| map_err("create image", e))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Image> {
        let row = sqlx::query("SELECT * FROM images WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_err("get image", e))?;
        match row {
            Some(row) => row_to_image(row),
            None => Err(Error::NotFound(format!("image {}", id))),
        }
    }

    async fn list(
        &self,
        filter: &ImageFilter,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<Image>, u64)> {
        let phase_json = match &filter.phase {
            Some(p) => Some(to_json("list images", p)?),
            None => None,
        };

        let rows = sqlx::query(
            r#"
            SELECT * FROM images
            WHERE (?1 IS NULL OR project_id = ?1)
              AND (?2 IS NULL OR phase = ?2)
            ORDER BY created_at DESC, id
            LIMIT ?3 OFFSET ?4
            "#,
        )
        .bind(&filter.project_id)
        .bind(&phase_json)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_err("list images", e))?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM images
            WHERE (?1 IS NULL OR project_id = ?1)
              AND (?2 IS NULL OR phase = ?2)
            "#,
        )
        .bind(&filter.project_id)
        .bind(&phase_json)
        .fetch_one(self.pool())
        .await
        .map_err(|e| map_err("count images", e))?;

        let images = rows.into_iter().map(row_to_image).collect::<Result<_>>()?;
        Ok((images, total as u64))
    }

    async fn find_by_catalog_ids(&self, catalog_ids: &[String]) -> Result<HashMap<String, Image>> {
        let mut found = HashMap::new();
        if catalog_ids.is_empty() {
            return Ok(found);
        }
        // Newest row wins per catalog id.
        let rows = sqlx::query(
            "SELECT * FROM images WHERE catalog_id IS NOT NULL ORDER BY created_at",
        )
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_err("find images by catalog", e))?;

        for row in rows {
            let image = row_to_image(row)?;
            if let Some(catalog_id) = image.spec.catalog_id.clone() {
                if catalog_ids.contains(&catalog_id) {
                    found.insert(catalog_id, image);
                }
            }
        }
        Ok(found)
    }

    async fn upsert(&self, image: &Image) -> Result<()> {
        // Keyed by (node_id, path): the filesystem scanner re-reports the
        // same file without knowing the row id.
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM images WHERE node_id = ?1 AND path = ?2",
        )
        .bind(&image.status.node_id)
        .bind(&image.status.path)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| map_err("upsert image", e))?;

        match existing {
            Some(id) => {
                let mut updated = image.clone();
                updated.id = id;
                ImageRepo::update(self, &updated).await
            }
            None => ImageRepo::create(self, image).await,
        }
    }

    async fn update(&self, image: &Image) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE images
            SET name = ?, spec = ?, status = ?, phase = ?, catalog_id = ?,
                node_id = ?, path = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&image.name)
        .bind(to_json("update image", &image.spec)?)
        .bind(to_json("update image", &image.status)?)
        .bind(to_json("update image", &image.status.phase)?)
        .bind(&image.spec.catalog_id)
        .bind(&image.status.node_id)
        .bind(&image.status.path)
        .bind(ts(&Utc::now()))
        .bind(&image.id)
        .execute(self.pool())
        .await
        .map_err(|e| map_err("update image", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("image {}", image.id)));
        }
        Ok(())
    }

    async fn update_status(&self, id: &str, status: &ImageStatus) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE images
            SET status = ?, phase = ?, node_id = ?, path = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(to_json("update image status", status)?)
        .bind(to_json("update image status", &status.phase)?)
        .bind(&status.node_id)
        .bind(&status.path)
        .bind(ts(&Utc::now()))
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|e| map_err("update image status", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("image {}", id)));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM images WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| map_err("delete image", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("image {}", id)));
        }
        Ok(())
    }
}

// =============================================================================
// Download jobs
// =============================================================================

fn row_to_job(row: SqliteRow) -> Result<DownloadJob> {
    let state_json: String = row.get("state");
    Ok(DownloadJob {
        id: row.get("id"),
        image_id: row.get("image_id"),
        catalog_id: row.get("catalog_id"),
        pool_id: row.get("pool_id"),
        node_id: row.get("node_id"),
        remote_job_id: row.get("remote_job_id"),
        target_path: row.get("target_path"),
        state: from_json("job.state", &state_json)?,
        progress_percent: row.get::<i64, _>("progress_percent") as u32,
        bytes_downloaded: row.get::<i64, _>("bytes_downloaded") as u64,
        total_bytes: row.get::<i64, _>("total_bytes") as u64,
        error: row.get("error"),
        created_at: parse_ts("job.created_at", &row.get::<String, _>("created_at"))?,
        updated_at: parse_ts("job.updated_at", &row.get::<String, _>("updated_at"))?,
    })
}

#[async_trait]
impl DownloadJobRepo for SqliteRepository {
    async fn create(&self, job: &DownloadJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO download_jobs
                (id, image_id, catalog_id, pool_id, node_id, remote_job_id,
                 target_path, state, progress_percent, bytes_downloaded,
                 total_bytes, error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.image_id)
        .bind(&job.catalog_id)
        .bind(&job.pool_id)
        .bind(&job.node_id)
        .bind(&job.remote_job_id)
        .bind(&job.target_path)
        .bind(to_json("create job", &job.state)?)
        .bind(job.progress_percent as i64)
        .bind(job.bytes_downloaded as i64)
        .bind(job.total_bytes as i64)
        .bind(&job.error)
        .bind(ts(&job.created_at))
        .bind(ts(&job.updated_at))
        .execute(self.pool())
        .await
        .map_err(|e| map_err("create job", e))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<DownloadJob> {
        let row = sqlx::query("SELECT * FROM download_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_err("get job", e))?;
        match row {
            Some(row) => row_to_job(row),
            None => Err(Error::NotFound(format!("download job {}", id))),
        }
    }

    async fn list_active(&self) -> Result<Vec<DownloadJob>> {
        let completed = to_json("list jobs", &DownloadState::Completed)?;
        let failed = to_json("list jobs", &DownloadState::Failed)?;
        let rows = sqlx::query(
            "SELECT * FROM download_jobs WHERE state NOT IN (?, ?) ORDER BY created_at",
        )
        .bind(completed)
        .bind(failed)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_err("list jobs", e))?;
        rows.into_iter().map(row_to_job).collect()
    }

    async fn update(&self, job: &DownloadJob) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE download_jobs
            SET node_id = ?, remote_job_id = ?, target_path = ?, state = ?,
                progress_percent = ?, bytes_downloaded = ?, total_bytes = ?,
                error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&job.node_id)
        .bind(&job.remote_job_id)
        .bind(&job.target_path)
        .bind(to_json("update job", &job.state)?)
        .bind(job.progress_percent as i64)
        .bind(job.bytes_downloaded as i64)
        .bind(job.total_bytes as i64)
        .bind(&job.error)
        .bind(ts(&Utc::now()))
        .bind(&job.id)
        .execute(self.pool())
        .await
        .map_err(|e| map_err("update job", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("download job {}", job.id)));
        }
        Ok(())
    }

    async fn list_by_state(&self, state: DownloadState) -> Result<Vec<DownloadJob>> {
        let rows = sqlx::query("SELECT * FROM download_jobs WHERE state = ? ORDER BY created_at")
            .bind(to_json("list jobs", &state)?)
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_err("list jobs", e))?;
        rows.into_iter().map(row_to_job).collect()
    }
}
