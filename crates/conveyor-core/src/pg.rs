//! Postgres-backed job repository.

use crate::job::{Job, JobContext, JobStatus, Priority};
use crate::{Error, JobStore, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    let status_raw: String = row.try_get("status")?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| Error::msg(format!("unknown job status {status_raw:?}")))?;

    let priority_raw: String = row.try_get("priority")?;
    let priority = Priority::parse(&priority_raw)
        .ok_or_else(|| Error::msg(format!("unknown priority {priority_raw:?}")))?;

    let original_raw: String = row.try_get("original_priority")?;
    let original_priority = Priority::parse(&original_raw)
        .ok_or_else(|| Error::msg(format!("unknown priority {original_raw:?}")))?;

    let context_raw: Value = row.try_get("context")?;
    let context: JobContext = serde_json::from_value(context_raw)?;

    let current_step_index: i32 = row.try_get("current_step_index")?;

    Ok(Job {
        id: row.try_get("id")?,
        feature_name: row.try_get("feature_name")?,
        status,
        current_step_index: current_step_index.max(0) as u32,
        context,
        error_code: row.try_get("error_code")?,
        error_log: row.try_get("error_log")?,
        retryable: row.try_get("retryable")?,
        priority,
        original_priority,
        user_id: row.try_get("user_id")?,
        queued_at: row.try_get("queued_at")?,
        promoted_at: row.try_get("promoted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_progress_at: row.try_get("last_progress_at")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        let context = serde_json::to_value(&job.context)?;
        sqlx::query(
            r#"
            INSERT INTO jobs (
              id, feature_name, status, current_step_index, context,
              error_code, error_log, retryable,
              priority, original_priority, user_id,
              queued_at, promoted_at, created_at, updated_at, last_progress_at
            ) VALUES (
              $1, $2, $3, $4, $5,
              $6, $7, $8,
              $9, $10, $11,
              $12, $13, $14, $15, $16
            )
            "#,
        )
        .bind(job.id)
        .bind(&job.feature_name)
        .bind(job.status.as_str())
        .bind(job.current_step_index as i32)
        .bind(context)
        .bind(&job.error_code)
        .bind(&job.error_log)
        .bind(job.retryable)
        .bind(job.priority.as_str())
        .bind(job.original_priority.as_str())
        .bind(&job.user_id)
        .bind(job.queued_at)
        .bind(job.promoted_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.last_progress_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            SELECT id, feature_name, status, current_step_index, context,
                   error_code, error_log, retryable,
                   priority, original_priority, user_id,
                   queued_at, promoted_at, created_at, updated_at, last_progress_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn update(&self, job: &Job) -> Result<()> {
        let context = serde_json::to_value(&job.context)?;
        sqlx::query(
            r#"
            UPDATE jobs
            SET feature_name = $2,
                status = $3,
                current_step_index = $4,
                context = $5,
                error_code = $6,
                error_log = $7,
                retryable = $8,
                priority = $9,
                user_id = $10,
                queued_at = $11,
                promoted_at = $12,
                updated_at = $13,
                last_progress_at = $14
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(&job.feature_name)
        .bind(job.status.as_str())
        .bind(job.current_step_index as i32)
        .bind(context)
        .bind(&job.error_code)
        .bind(&job.error_log)
        .bind(job.retryable)
        .bind(job.priority.as_str())
        .bind(&job.user_id)
        .bind(job.queued_at)
        .bind(job.promoted_at)
        .bind(job.updated_at)
        .bind(job.last_progress_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_stalled_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT id, feature_name, status, current_step_index, context,
                   error_code, error_log, retryable,
                   priority, original_priority, user_id,
                   queued_at, promoted_at, created_at, updated_at, last_progress_at
            FROM jobs
            WHERE status = 'RUNNING'
              AND last_progress_at < $1
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn list_promotable(
        &self,
        low_cutoff: DateTime<Utc>,
        medium_cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT id, feature_name, status, current_step_index, context,
                   error_code, error_log, retryable,
                   priority, original_priority, user_id,
                   queued_at, promoted_at, created_at, updated_at, last_progress_at
            FROM jobs
            WHERE status IN ('PENDING', 'RUNNING')
              AND (
                (priority = 'low' AND queued_at < $1)
                OR (priority = 'medium' AND original_priority <> 'high' AND queued_at < $2)
              )
            ORDER BY queued_at
            "#,
        )
        .bind(low_cutoff)
        .bind(medium_cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }
}
