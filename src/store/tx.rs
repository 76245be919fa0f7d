//! Scoped transaction acquisition.
//!
//! `with_transaction` guarantees release on every exit path: commit on `Ok`,
//! explicit rollback on `Err`, and sqlx's rollback-on-drop if the future is
//! cancelled mid-flight. Store operations take `impl PgExecutor` so a caller
//! already inside a transaction passes the transaction handle instead of the
//! pool — reuse, never nesting.

use futures::future::BoxFuture;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::warn;

use crate::errors::AppError;

pub async fn with_transaction<T, F>(pool: &PgPool, f: F) -> Result<T, AppError>
where
    F: for<'t> FnOnce(&'t mut Transaction<'static, Postgres>) -> BoxFuture<'t, Result<T, AppError>>,
{
    let mut tx = pool.begin().await?;
    match f(&mut tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("transaction rollback failed: {}", rollback_err);
            }
            Err(e)
        }
    }
}
