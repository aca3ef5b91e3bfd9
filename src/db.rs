use crate::error::StoreError;
use crate::store::JobStore;
use crate::{ImageJob, JobUpdate, NewJob};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, Postgres, QueryBuilder};
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, original_filename, status, original_path, processed_path, \
    target_dimension, original_size_bytes, processed_size_bytes, error, created_at, updated_at";

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
}

impl DbHandle {
    #[instrument(name = "db.new", skip(url))]
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&*self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl JobStore for DbHandle {
    #[instrument(name = "db.create_job", skip_all, fields(job_id = %job.id))]
    async fn create_job(&self, job: &NewJob) -> Result<ImageJob, StoreError> {
        debug!("Creating job {:?}", job);
        let sql = format!(
            "INSERT INTO image_jobs \
            (id, original_filename, status, original_path, target_dimension, original_size_bytes) \
            VALUES ($1, $2, 'pending', $3, $4, $5) \
            RETURNING {}",
            JOB_COLUMNS
        );
        sqlx::query_as::<_, ImageJob>(&sql)
            .bind(job.id)
            .bind(&job.original_filename)
            .bind(&job.original_path)
            .bind(job.target_dimension)
            .bind(job.original_size_bytes)
            .fetch_one(&*self.pool)
            .await
            .map_err(|err| {
                let duplicate = err
                    .as_database_error()
                    .and_then(|e| e.code())
                    .is_some_and(|code| code == UNIQUE_VIOLATION);
                if duplicate {
                    StoreError::Duplicate(job.id)
                } else {
                    StoreError::Database(err)
                }
            })
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ImageJob>, StoreError> {
        let sql = format!("SELECT {} FROM image_jobs WHERE id = $1", JOB_COLUMNS);
        Ok(sqlx::query_as::<_, ImageJob>(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?)
    }

    #[instrument(name = "db.update_job", skip_all, fields(job_id = %id, status = ?update.status))]
    async fn update_job(&self, id: Uuid, update: &JobUpdate) -> Result<ImageJob, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new("UPDATE image_jobs SET ");
        {
            let mut fields = builder.separated(", ");
            if let Some(status) = update.status {
                fields.push("status = ").push_bind_unseparated(status);
            }
            if let Some(path) = &update.processed_path {
                fields
                    .push("processed_path = ")
                    .push_bind_unseparated(path.clone());
            }
            if let Some(size) = update.processed_size_bytes {
                fields
                    .push("processed_size_bytes = ")
                    .push_bind_unseparated(size);
            }
            if let Some(error) = &update.error {
                fields.push("error = ").push_bind_unseparated(error.clone());
            }
            fields.push("updated_at = GREATEST(NOW(), updated_at + INTERVAL '1 microsecond')");
        }
        builder
            .push(" WHERE id = ")
            .push_bind(id)
            .push(" RETURNING ")
            .push(JOB_COLUMNS);

        builder
            .build_query_as::<ImageJob>()
            .fetch_optional(&*self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_jobs(&self, limit: i64) -> Result<Vec<ImageJob>, StoreError> {
        debug!("Listing {} jobs", limit);
        let sql = format!(
            "SELECT {} FROM image_jobs ORDER BY created_at DESC LIMIT $1",
            JOB_COLUMNS
        );
        Ok(sqlx::query_as::<_, ImageJob>(&sql)
            .bind(limit)
            .fetch_all(&*self.pool)
            .await?)
    }

    async fn find_requeue_candidates(&self) -> Result<Vec<Uuid>, StoreError> {
        debug!("Getting requeue candidates");
        Ok(sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM image_jobs \
            WHERE status IN ('pending', 'processing') \
            ORDER BY updated_at ASC",
        )
        .fetch_all(&*self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobStatus;

    async fn connect() -> DbHandle {
        let url = std::env::var("IMAGEQ_TEST_DATABASE_URL")
            .expect("IMAGEQ_TEST_DATABASE_URL must point at a scratch database");
        DbHandle::new(&url, 2).await.unwrap()
    }

    fn new_job() -> NewJob {
        NewJob {
            id: Uuid::new_v4(),
            original_filename: Some("photo.jpg".into()),
            original_path: "uploads/photo.jpg".into(),
            target_dimension: 512,
            original_size_bytes: Some(2048),
        }
    }

    #[tokio::test]
    #[ignore = "needs a PostgreSQL database"]
    async fn create_update_roundtrip() {
        let db = connect().await;
        let job = db.create_job(&new_job()).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let dup = db
            .create_job(&NewJob {
                id: job.id,
                ..new_job()
            })
            .await
            .unwrap_err();
        assert!(matches!(dup, StoreError::Duplicate(_)));

        let processing = db.update_job(job.id, &JobUpdate::processing()).await.unwrap();
        assert_eq!(processing.status, JobStatus::Processing);
        assert!(processing.updated_at > job.updated_at);

        let untouched = db.update_job(job.id, &JobUpdate::default()).await.unwrap();
        assert_eq!(untouched.status, JobStatus::Processing);
        assert_eq!(untouched.original_path, job.original_path);
        assert!(untouched.updated_at > processing.updated_at);

        let done = db
            .update_job(job.id, &JobUpdate::completed("processed/x.jpg".into(), 99))
            .await
            .unwrap();
        assert!(done.is_consistent());
        assert!(!db.find_requeue_candidates().await.unwrap().contains(&job.id));
    }

    #[tokio::test]
    #[ignore = "needs a PostgreSQL database"]
    async fn update_missing_job_is_not_found() {
        let db = connect().await;
        let err = db
            .update_job(Uuid::new_v4(), &JobUpdate::processing())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
