//! Test suite for ensuring a correct implementation of a [`JobStore`].
//!
//! The suite prepares jobs for the itineraries in [`FIXTURE_ITINERARIES`].
#![allow(clippy::unwrap_used)]

use crate::{
    itinerary::Itinerary,
    job::{JobStatus, COMPLETED_DESCRIPTION, STOPPED_DESCRIPTION},
    testing::{mock_itinerary, FIXTURE_ITINERARIES},
};

use super::*;

macro_rules! assert_store_error {
    ($result:expr, $pattern:pat) => {
        match $result {
            Err($pattern) => {}
            other => panic!("expected {}, got {other:?}", stringify!($pattern)),
        }
    };
}

/// Create the test suite for a job store.
///
/// Store implementors should include this as part of their test suites, with the `testing`
/// feature enabled on their `itinerary-jobs` dev-dependency.
///
/// # Example
///
/// ```ignore
/// use itinerary_jobs::store_test_suite;
/// use itinerary_jobs::store::memory::InMemoryJobStore;
/// store_test_suite!(for: InMemoryJobStore::new());
/// ```
///
/// A different async test attribute, and an extra attribute such as `ignore`, can be given:
///
/// ```ignore
/// use itinerary_jobs::store_test_suite;
/// store_test_suite!(
///     attr: sqlx::test,
///     extra: ignore = "requires a Postgres database",
///     args: (pool: PgPool),
///     store: PgJobStore::from(pool)
/// );
/// ```
#[macro_export]
macro_rules! store_test_suite {
    (for: $store:expr) => {
        $crate::store_test_suite!(attr: tokio::test, args: (), store: $store);
    };
    (attr: $attr:meta, $(extra: $extra:meta,)? args: $args:tt, store: $store:expr) => {
        $crate::store_test_suite!(@tests [$attr] [$($extra)?] $args $store;
            prepare_creates_pending_job,
            prepare_assigns_distinct_ids,
            start_marks_job_running,
            complete_persists_file_path,
            fail_records_reason,
            stop_pending_and_running_jobs,
            complete_rejected_after_stop,
            transitions_rejected_after_delete,
            soft_delete_hides_job,
            soft_delete_rejects_running_job,
            soft_delete_itinerary_jobs_is_scoped,
            set_async_task_id,
            in_progress_count_for_itinerary,
            in_progress_count_for_user,
            list_for_itinerary_newest_first,
            reap_candidates_oldest_deleted_first,
            purge_only_removes_deleted_jobs,
        );
    };
    (@tests [$attr:meta] $extra:tt $args:tt $store:expr; $($name:ident,)*) => {
        $(
            $crate::store_test_suite!(@test [$attr] $extra $args $store; $name);
        )*
    };
    (@test [$attr:meta] [$($extra:meta)?] $args:tt $store:expr; $name:ident) => {
        #[$attr]
        $(#[$extra])?
        async fn $name $args {
            let store = $store;
            $crate::store::testing::$name(store).await;
        }
    };
}

pub use store_test_suite;

fn itinerary(index: usize) -> Itinerary {
    let (id, user_id) = FIXTURE_ITINERARIES[index];
    mock_itinerary(id, user_id)
}

#[doc(hidden)]
pub async fn prepare_creates_pending_job(store: impl JobStore) {
    let itinerary = itinerary(0);

    let job = store.prepare(&itinerary, "local").await.unwrap();

    assert_ne!(i32::from(job.id), 0);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.file_manager, "local");
    assert_eq!(job.itinerary_id, itinerary.id);
    assert_eq!(job.status_description, "");
    assert!(job.start_date.is_none());
    assert!(job.end_date.is_none());
    assert!(job.file_path.is_none());
    assert!(job.async_task_id.is_none());

    let stored = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored, job);
}

#[doc(hidden)]
pub async fn prepare_assigns_distinct_ids(store: impl JobStore) {
    let first = store.prepare(&itinerary(0), "local").await.unwrap();
    let second = store.prepare(&itinerary(0), "s3").await.unwrap();

    assert!(second.id > first.id);
    assert_eq!(second.file_manager, "s3");
}

#[doc(hidden)]
pub async fn start_marks_job_running(store: impl JobStore) {
    let mut job = store.prepare(&itinerary(0), "local").await.unwrap();

    store.start(&mut job).await.unwrap();

    let stored = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Running);
    assert!(stored.start_date.is_some());
    assert_eq!(stored, job);
}

#[doc(hidden)]
pub async fn complete_persists_file_path(store: impl JobStore) {
    let mut job = store.prepare(&itinerary(0), "local").await.unwrap();
    store.start(&mut job).await.unwrap();

    store.complete(&mut job, "1/1/file.md").await.unwrap();

    let stored = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.status_description, COMPLETED_DESCRIPTION);
    assert_eq!(stored.file_path.as_deref(), Some("1/1/file.md"));
    assert!(stored.end_date.is_some());
}

#[doc(hidden)]
pub async fn fail_records_reason(store: impl JobStore) {
    let mut job = store.prepare(&itinerary(0), "local").await.unwrap();

    store.fail(&mut job, "model unavailable").await.unwrap();

    let stored = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.status_description, "model unavailable");
    assert!(stored.end_date.is_some());
    assert!(stored.file_path.is_none());
}

#[doc(hidden)]
pub async fn stop_pending_and_running_jobs(store: impl JobStore) {
    let mut pending = store.prepare(&itinerary(0), "local").await.unwrap();
    let mut running = store.prepare(&itinerary(1), "local").await.unwrap();
    store.start(&mut running).await.unwrap();

    store.stop(&mut pending).await.unwrap();
    store.stop(&mut running).await.unwrap();

    for id in [pending.id, running.id] {
        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Stopped);
        assert_eq!(stored.status_description, STOPPED_DESCRIPTION);
        assert!(stored.end_date.is_some());
    }
}

#[doc(hidden)]
pub async fn complete_rejected_after_stop(store: impl JobStore) {
    let mut worker_handle = store.prepare(&itinerary(0), "local").await.unwrap();
    store.start(&mut worker_handle).await.unwrap();
    let mut user_handle = store.get(worker_handle.id).await.unwrap().unwrap();
    store.stop(&mut user_handle).await.unwrap();

    let result = store.complete(&mut worker_handle, "1/1/file.md").await;

    assert_store_error!(result, StoreError::TransitionRejected { to: JobStatus::Completed, .. });
    assert_eq!(worker_handle.status, JobStatus::Running);
    let stored = store.get(worker_handle.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Stopped);
}

#[doc(hidden)]
pub async fn transitions_rejected_after_delete(store: impl JobStore) {
    let mut job = store.prepare(&itinerary(0), "local").await.unwrap();
    store.soft_delete(job.id).await.unwrap();

    assert_store_error!(
        store.start(&mut job).await,
        StoreError::TransitionRejected { to: JobStatus::Running, .. }
    );
    assert_store_error!(
        store.fail(&mut job, "late failure").await,
        StoreError::TransitionRejected { to: JobStatus::Failed, .. }
    );
    assert_eq!(job.status, JobStatus::Pending);
    assert!(store.get(job.id).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn soft_delete_hides_job(store: impl JobStore) {
    let mut job = store.prepare(&itinerary(0), "local").await.unwrap();
    store.start(&mut job).await.unwrap();
    store.complete(&mut job, "1/1/file.md").await.unwrap();

    store.soft_delete(job.id).await.unwrap();

    assert!(store.get(job.id).await.unwrap().is_none());
    assert!(store
        .list_for_itinerary(job.itinerary_id)
        .await
        .unwrap()
        .is_empty());
    let candidates = store.reap_candidates(10, None).await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].file_path.as_deref(), Some("1/1/file.md"));
    assert_eq!(candidates[0].status_description, COMPLETED_DESCRIPTION);
}

#[doc(hidden)]
pub async fn soft_delete_rejects_running_job(store: impl JobStore) {
    let mut job = store.prepare(&itinerary(0), "local").await.unwrap();
    store.start(&mut job).await.unwrap();

    assert_store_error!(
        store.soft_delete(job.id).await,
        StoreError::TransitionRejected { to: JobStatus::Deleted, .. }
    );
    assert_store_error!(
        store.soft_delete(JobId::from(i32::MAX)).await,
        StoreError::NotFound(_)
    );
}

#[doc(hidden)]
pub async fn soft_delete_itinerary_jobs_is_scoped(store: impl JobStore) {
    let target = itinerary(0);
    let other = itinerary(1);
    let mut running = store.prepare(&target, "local").await.unwrap();
    store.start(&mut running).await.unwrap();
    let mut failed = store.prepare(&target, "local").await.unwrap();
    store.fail(&mut failed, "boom").await.unwrap();
    let untouched = store.prepare(&other, "local").await.unwrap();

    let count = store.soft_delete_itinerary_jobs(target.id).await.unwrap();

    assert_eq!(count, 2);
    assert!(store.list_for_itinerary(target.id).await.unwrap().is_empty());
    assert_eq!(
        store.in_progress_count_for_itinerary(target.id).await.unwrap(),
        0
    );
    let remaining = store.list_for_itinerary(other.id).await.unwrap();
    assert_eq!(remaining, vec![untouched]);
}

#[doc(hidden)]
pub async fn set_async_task_id(store: impl JobStore) {
    let job = store.prepare(&itinerary(0), "local").await.unwrap();

    store.set_async_task_id(job.id, "task-123").await.unwrap();

    let stored = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.async_task_id.as_deref(), Some("task-123"));
    assert_eq!(stored.status, JobStatus::Pending);
}

#[doc(hidden)]
pub async fn in_progress_count_for_itinerary(store: impl JobStore) {
    let target = itinerary(0);
    assert_eq!(
        store.in_progress_count_for_itinerary(target.id).await.unwrap(),
        0
    );

    let _pending = store.prepare(&target, "local").await.unwrap();
    let mut running = store.prepare(&target, "local").await.unwrap();
    store.start(&mut running).await.unwrap();
    let mut completed = store.prepare(&target, "local").await.unwrap();
    store.start(&mut completed).await.unwrap();
    store.complete(&mut completed, "path").await.unwrap();
    let mut failed = store.prepare(&target, "local").await.unwrap();
    store.fail(&mut failed, "boom").await.unwrap();
    let mut stopped = store.prepare(&target, "local").await.unwrap();
    store.stop(&mut stopped).await.unwrap();
    let deleted = store.prepare(&target, "local").await.unwrap();
    store.soft_delete(deleted.id).await.unwrap();
    let _other = store.prepare(&itinerary(1), "local").await.unwrap();

    assert_eq!(
        store.in_progress_count_for_itinerary(target.id).await.unwrap(),
        2
    );
}

#[doc(hidden)]
pub async fn in_progress_count_for_user(store: impl JobStore) {
    let first = itinerary(0);
    let second = itinerary(1);
    let other_user = itinerary(2);
    assert_eq!(first.user_id, second.user_id);
    assert_ne!(first.user_id, other_user.user_id);

    let _pending = store.prepare(&first, "local").await.unwrap();
    let mut running = store.prepare(&second, "local").await.unwrap();
    store.start(&mut running).await.unwrap();
    let mut stopped = store.prepare(&second, "local").await.unwrap();
    store.stop(&mut stopped).await.unwrap();
    let _elsewhere = store.prepare(&other_user, "local").await.unwrap();

    assert_eq!(
        store.in_progress_count_for_user(first.user_id).await.unwrap(),
        2
    );
    assert_eq!(
        store
            .in_progress_count_for_user(other_user.user_id)
            .await
            .unwrap(),
        1
    );
}

#[doc(hidden)]
pub async fn list_for_itinerary_newest_first(store: impl JobStore) {
    let target = itinerary(0);
    let first = store.prepare(&target, "local").await.unwrap();
    let second = store.prepare(&target, "local").await.unwrap();

    let ids = store
        .list_for_itinerary(target.id)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect::<Vec<_>>();

    assert_eq!(ids, vec![second.id, first.id]);
}

#[doc(hidden)]
pub async fn reap_candidates_oldest_deleted_first(store: impl JobStore) {
    let mut deleted = Vec::new();
    for _ in 0..3 {
        let job = store.prepare(&itinerary(0), "local").await.unwrap();
        deleted.push(job.id);
    }
    let _alive = store.prepare(&itinerary(0), "local").await.unwrap();
    for id in deleted.iter().rev() {
        store.soft_delete(*id).await.unwrap();
    }

    let candidates = store.reap_candidates(2, None).await.unwrap();

    assert_eq!(candidates.len(), 2);
    assert!(candidates
        .iter()
        .all(|job| job.status == JobStatus::Deleted));
    assert!(candidates[0].creation_date <= candidates[1].creation_date);
    assert_eq!(
        candidates.iter().map(|job| job.id).collect::<Vec<_>>(),
        deleted[..2].to_vec()
    );
    assert!(store.reap_candidates(0, None).await.unwrap().is_empty());

    let rest = store
        .reap_candidates(2, Some(ReapCursor::from(&candidates[1])))
        .await
        .unwrap();
    assert_eq!(
        rest.iter().map(|job| job.id).collect::<Vec<_>>(),
        deleted[2..].to_vec()
    );
}

#[doc(hidden)]
pub async fn purge_only_removes_deleted_jobs(store: impl JobStore) {
    let deleted = store.prepare(&itinerary(0), "local").await.unwrap();
    let alive = store.prepare(&itinerary(0), "local").await.unwrap();
    store.soft_delete(deleted.id).await.unwrap();

    let count = store.purge(&[deleted.id, alive.id]).await.unwrap();

    assert_eq!(count, 1);
    assert!(store.reap_candidates(10, None).await.unwrap().is_empty());
    assert!(store.get(alive.id).await.unwrap().is_some());
}
