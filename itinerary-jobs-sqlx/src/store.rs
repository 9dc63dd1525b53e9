use std::ops::Deref;

use async_trait::async_trait;
use itinerary_jobs::{
    itinerary::{Itinerary, ItineraryId, UserId},
    job::{ItineraryFileJob, JobId},
    store::{JobStore, ReapCursor, StoreError},
};
use sqlx::{PgConnection, PgPool};
use tracing::instrument;

use crate::types::{Job, JobStatus};

const JOB_COLUMNS: &str = r#"
    id,
    status,
    status_description,
    creation_date,
    start_date,
    end_date,
    file_path,
    file_manager,
    itinerary_id,
    async_task_id
"#;

/// A [`JobStore`] keeping jobs in the `itinerary_file_jobs` table.
///
/// Counting a user's jobs joins against the `itineraries` table for ownership.
#[derive(Clone, Debug)]
pub struct PgJobStore {
    pool: PgPool,
}

impl Deref for PgJobStore {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl From<PgPool> for PgJobStore {
    fn from(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl From<&PgPool> for PgJobStore {
    fn from(value: &PgPool) -> Self {
        Self {
            pool: value.to_owned(),
        }
    }
}

fn database(error: sqlx::Error) -> StoreError {
    StoreError::Database(error.to_string())
}

fn count(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::BadState)
}

impl PgJobStore {
    /// Soft delete every job of the itinerary on the given connection.
    ///
    /// Pass the transaction deleting the itinerary, so the jobs and the itinerary are removed
    /// together:
    ///
    /// ```no_run
    /// # use itinerary_jobs_sqlx::PgJobStore;
    /// # async fn run(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
    /// let mut tx = pool.begin().await?;
    /// PgJobStore::soft_delete_itinerary_jobs_in(&mut tx, 1.into()).await?;
    /// // Remove the rest of the itinerary on `tx` here.
    /// tx.commit().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn soft_delete_itinerary_jobs_in(
        conn: &mut PgConnection,
        itinerary_id: ItineraryId,
    ) -> Result<u64, StoreError> {
        Ok(sqlx::query(
            r#"UPDATE itinerary_file_jobs
            SET status = 'deleted'
            WHERE itinerary_id = $1
            AND status <> 'deleted'"#,
        )
        .bind(i32::from(itinerary_id))
        .execute(conn)
        .await
        .map_err(database)?
        .rows_affected())
    }

    async fn exists(&self, id: JobId) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM itinerary_file_jobs WHERE id = $1)",
        )
        .bind(i32::from(id))
        .fetch_one(self.deref())
        .await
        .map_err(database)
    }

    /// Tell apart a missing job from one whose stored status refused the update.
    async fn rejected(&self, id: JobId, to: itinerary_jobs::job::JobStatus) -> StoreError {
        match self.exists(id).await {
            Ok(true) => StoreError::TransitionRejected { id, to },
            Ok(false) => StoreError::NotFound(id),
            Err(error) => error,
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip(self, itinerary), fields(itinerary_id = %itinerary.id))]
    async fn prepare(
        &self,
        itinerary: &Itinerary,
        file_manager: &str,
    ) -> Result<ItineraryFileJob, StoreError> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"INSERT INTO itinerary_file_jobs (
                status,
                file_manager,
                itinerary_id
            ) VALUES ('pending', $1, $2)
            RETURNING {JOB_COLUMNS}"#
        ))
        .bind(file_manager)
        .bind(i32::from(itinerary.id))
        .fetch_one(self.deref())
        .await
        .map_err(database)
        .inspect_err(|error| tracing::error!(?error, "Failed to prepare job: {error}"))?;
        Ok(job.into())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status))]
    async fn update_status(&self, job: &ItineraryFileJob) -> Result<(), StoreError> {
        let sources = job
            .status
            .allowed_sources()
            .iter()
            .copied()
            .map(JobStatus::from)
            .collect::<Vec<_>>();
        let result = sqlx::query(
            r#"UPDATE itinerary_file_jobs
            SET
                status = $2,
                status_description = $3,
                start_date = $4,
                end_date = $5,
                file_path = $6
            WHERE id = $1
            AND status = ANY($7)"#,
        )
        .bind(i32::from(job.id))
        .bind(JobStatus::from(job.status))
        .bind(&job.status_description)
        .bind(job.start_date)
        .bind(job.end_date)
        .bind(job.file_path.as_deref())
        .bind(sources)
        .execute(self.deref())
        .await
        .map_err(database)?;

        if result.rows_affected() == 0 {
            return Err(self.rejected(job.id, job.status).await);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_async_task_id(&self, id: JobId, task_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"UPDATE itinerary_file_jobs
            SET async_task_id = $2
            WHERE id = $1
            AND status <> 'deleted'"#,
        )
        .bind(i32::from(id))
        .bind(task_id)
        .execute(self.deref())
        .await
        .map_err(database)?;

        match result.rows_affected() {
            0 => Err(StoreError::NotFound(id)),
            _ => Ok(()),
        }
    }

    #[instrument(skip(self))]
    async fn soft_delete(&self, id: JobId) -> Result<(), StoreError> {
        let to = itinerary_jobs::job::JobStatus::Deleted;
        let sources = to
            .allowed_sources()
            .iter()
            .copied()
            .map(JobStatus::from)
            .collect::<Vec<_>>();
        let result = sqlx::query(
            r#"UPDATE itinerary_file_jobs
            SET status = 'deleted'
            WHERE id = $1
            AND status = ANY($2)"#,
        )
        .bind(i32::from(id))
        .bind(sources)
        .execute(self.deref())
        .await
        .map_err(database)?;

        if result.rows_affected() == 0 {
            return Err(self.rejected(id, to).await);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn soft_delete_itinerary_jobs(
        &self,
        itinerary_id: ItineraryId,
    ) -> Result<u64, StoreError> {
        let mut conn = self.acquire().await.map_err(database)?;
        Self::soft_delete_itinerary_jobs_in(&mut conn, itinerary_id).await
    }

    async fn get(&self, id: JobId) -> Result<Option<ItineraryFileJob>, StoreError> {
        Ok(sqlx::query_as::<_, Job>(&format!(
            r#"SELECT {JOB_COLUMNS}
            FROM itinerary_file_jobs
            WHERE id = $1
            AND status <> 'deleted'"#
        ))
        .bind(i32::from(id))
        .fetch_optional(self.deref())
        .await
        .map_err(database)?
        .map(From::from))
    }

    async fn list_for_itinerary(
        &self,
        itinerary_id: ItineraryId,
    ) -> Result<Vec<ItineraryFileJob>, StoreError> {
        Ok(sqlx::query_as::<_, Job>(&format!(
            r#"SELECT {JOB_COLUMNS}
            FROM itinerary_file_jobs
            WHERE itinerary_id = $1
            AND status <> 'deleted'
            ORDER BY creation_date DESC, id DESC"#
        ))
        .bind(i32::from(itinerary_id))
        .fetch_all(self.deref())
        .await
        .map_err(database)?
        .into_iter()
        .map(From::from)
        .collect())
    }

    async fn in_progress_count_for_itinerary(
        &self,
        itinerary_id: ItineraryId,
    ) -> Result<u64, StoreError> {
        let value = sqlx::query_scalar::<_, i64>(
            r#"SELECT COUNT(*)
            FROM itinerary_file_jobs
            WHERE itinerary_id = $1
            AND status IN ('pending', 'running')"#,
        )
        .bind(i32::from(itinerary_id))
        .fetch_one(self.deref())
        .await
        .map_err(database)?;
        count(value)
    }

    async fn in_progress_count_for_user(&self, user_id: UserId) -> Result<u64, StoreError> {
        let value = sqlx::query_scalar::<_, i64>(
            r#"SELECT COUNT(*)
            FROM itinerary_file_jobs jobs
            JOIN itineraries ON itineraries.id = jobs.itinerary_id
            WHERE itineraries.user_id = $1
            AND jobs.status IN ('pending', 'running')"#,
        )
        .bind(i32::from(user_id))
        .fetch_one(self.deref())
        .await
        .map_err(database)?;
        count(value)
    }

    async fn reap_candidates(
        &self,
        limit: u32,
        after: Option<ReapCursor>,
    ) -> Result<Vec<ItineraryFileJob>, StoreError> {
        Ok(sqlx::query_as::<_, Job>(&format!(
            r#"SELECT {JOB_COLUMNS}
            FROM itinerary_file_jobs
            WHERE status = 'deleted'
            AND (
                $2::timestamptz IS NULL
                OR (creation_date, id) > ($2::timestamptz, $3::integer)
            )
            ORDER BY creation_date ASC, id ASC
            LIMIT $1"#
        ))
        .bind(i64::from(limit))
        .bind(after.map(|cursor| cursor.creation_date))
        .bind(after.map(|cursor| i32::from(cursor.id)))
        .fetch_all(self.deref())
        .await
        .map_err(database)?
        .into_iter()
        .map(From::from)
        .collect())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn purge(&self, ids: &[JobId]) -> Result<u64, StoreError> {
        let ids = ids.iter().copied().map(i32::from).collect::<Vec<_>>();
        Ok(sqlx::query(
            r#"DELETE FROM itinerary_file_jobs
            WHERE status = 'deleted'
            AND id = ANY($1)"#,
        )
        .bind(ids)
        .execute(self.deref())
        .await
        .map_err(database)?
        .rows_affected())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use itinerary_jobs::{store_test_suite, testing::FIXTURE_ITINERARIES};

    impl PgJobStore {
        async fn with_fixture_itineraries(pool: PgPool) -> Self {
            for (id, user_id) in FIXTURE_ITINERARIES {
                sqlx::query("INSERT INTO itineraries (id, user_id) VALUES ($1, $2)")
                    .bind(id)
                    .bind(user_id)
                    .execute(&pool)
                    .await
                    .unwrap();
            }
            pool.into()
        }
    }

    store_test_suite!(
        attr: sqlx::test,
        extra: ignore = "requires a Postgres DATABASE_URL",
        args: (pool: PgPool),
        store: PgJobStore::with_fixture_itineraries(pool).await
    );

    #[sqlx::test]
    #[ignore = "requires a Postgres DATABASE_URL"]
    async fn update_status_of_missing_job_is_not_found(pool: PgPool) {
        let store = PgJobStore::with_fixture_itineraries(pool).await;
        let job = ItineraryFileJob::new_pending(JobId::from(i32::MAX), 1.into(), "local");

        let result = store.update_status(&job).await;

        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[sqlx::test]
    #[ignore = "requires a Postgres DATABASE_URL"]
    async fn itinerary_jobs_delete_follows_the_callers_transaction(pool: PgPool) {
        let store = PgJobStore::with_fixture_itineraries(pool).await;
        let itinerary = itinerary_jobs::testing::mock_itinerary(1, 1);
        let first = store.prepare(&itinerary, "local").await.unwrap();
        let second = store.prepare(&itinerary, "local").await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let count = PgJobStore::soft_delete_itinerary_jobs_in(&mut tx, itinerary.id)
            .await
            .unwrap();
        assert_eq!(count, 2);
        tx.rollback().await.unwrap();

        assert!(store.get(first.id).await.unwrap().is_some());
        assert!(store.get(second.id).await.unwrap().is_some());

        let mut tx = store.begin().await.unwrap();
        PgJobStore::soft_delete_itinerary_jobs_in(&mut tx, itinerary.id)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(store.list_for_itinerary(itinerary.id).await.unwrap().is_empty());
    }

    #[sqlx::test]
    #[ignore = "requires a Postgres DATABASE_URL"]
    async fn prepare_requires_existing_itinerary(pool: PgPool) {
        let store = PgJobStore::from(pool);

        let result = store
            .prepare(&itinerary_jobs::testing::mock_itinerary(99, 1), "local")
            .await;

        assert!(matches!(result, Err(StoreError::Database(_))));
    }
}
