//! Postgres backed [`JobStore`](itinerary_jobs::store::JobStore) and
//! [`TaskQueue`](itinerary_jobs::queue::TaskQueue) for `itinerary-jobs`.
//!
//! Run [`migrate`] once at startup to create the tables both rely on:
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = sqlx::PgPool::connect("postgres://localhost/itineraries").await?;
//! itinerary_jobs_sqlx::migrate(&pool).await?;
//!
//! let store = itinerary_jobs_sqlx::PgJobStore::from(&pool);
//! let queue = itinerary_jobs_sqlx::PgTaskQueue::new(pool).await?;
//! # Ok(())
//! # }
//! ```
use sqlx::PgPool;

mod queue;
mod store;
mod types;

pub use queue::PgTaskQueue;
pub use store::PgJobStore;

/// Apply the migrations bundled with this crate.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
