//! Optimistic transaction driver.
//!
//! [`transact`] runs a caller-supplied operation inside a store transaction
//! and re-runs it from scratch whenever the commit reports a conflict.
//!
//! ```ignore
//! let id = transact(store, RetryPolicy::Bounded(10), |t, _attempt| {
//!     let path = path.clone();
//!     Box::pin(async move {
//!         let next = t.read(&path).await?.unwrap_or_default();
//!         t.write(&path, "1").await?;
//!         Ok(next)
//!     })
//! })
//! .await?;
//! ```

use futures::future::BoxFuture;
use tracing::debug;

use crate::store::{Store, StoreError, Transaction};

/// How often to re-run a transaction that keeps conflicting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry forever, logging every `log_every` attempts.
    Unbounded { log_every: u32 },
    /// Give up with [`StoreError::Conflict`] after this many attempts.
    Bounded(u32),
}

/// Run `op` in a transaction until it commits.
///
/// `op` receives the open transaction and the zero-based attempt number. An
/// error from `op` aborts the transaction and is returned unchanged.
pub async fn transact<T, E, F>(store: &dyn Store, policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F: for<'t> FnMut(&'t mut dyn Transaction, u32) -> BoxFuture<'t, Result<T, E>>,
    E: From<StoreError>,
{
    let mut attempt = 0u32;
    loop {
        let mut tx = store.begin().await?;
        match op(tx.as_mut(), attempt).await {
            Ok(value) => {
                if tx.commit().await? {
                    return Ok(value);
                }
            }
            Err(e) => {
                tx.abort().await;
                return Err(e);
            }
        }

        attempt = attempt.saturating_add(1);
        match policy {
            RetryPolicy::Unbounded { log_every } => {
                if log_every > 0 && attempt % log_every == 0 {
                    debug!(attempt, "transaction still conflicting, retrying");
                }
            }
            RetryPolicy::Bounded(max) => {
                if attempt >= max {
                    return Err(StoreError::Conflict(format!(
                        "transaction gave up after {} attempts",
                        attempt
                    ))
                    .into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_commits_first_attempt() {
        let store = MemoryStore::new();
        let value: Result<u32, StoreError> =
            transact(&store, RetryPolicy::Bounded(3), |t, attempt| {
                Box::pin(async move {
                    t.write("/counter", "1").await?;
                    Ok(attempt)
                })
            })
            .await;

        assert_eq!(value.unwrap(), 0);
        assert_eq!(
            store.read("/counter").await.unwrap(),
            Some("1".to_string())
        );
    }

    #[tokio::test]
    async fn test_retries_on_conflict() {
        let store = Arc::new(MemoryStore::new());
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), StoreError> = transact(store.as_ref(), RetryPolicy::Bounded(5), |t, attempt| {
            let store = Arc::clone(&store);
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                t.read("/x").await?;
                // Sneak a concurrent write in on the first two attempts.
                if attempt < 2 {
                    store.write("/x", &attempt.to_string()).await?;
                }
                t.write("/x", "done").await?;
                Ok(())
            })
        })
        .await;

        result.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.read("/x").await.unwrap(), Some("done".to_string()));
    }

    #[tokio::test]
    async fn test_bounded_gives_up() {
        let store = Arc::new(MemoryStore::new());

        let result: Result<(), StoreError> = transact(store.as_ref(), RetryPolicy::Bounded(3), |t, _| {
            let store = Arc::clone(&store);
            Box::pin(async move {
                t.read("/x").await?;
                store.write("/x", "other").await?;
                t.write("/x", "mine").await?;
                Ok(())
            })
        })
        .await;

        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert_eq!(store.read("/x").await.unwrap(), Some("other".to_string()));
    }

    #[tokio::test]
    async fn test_op_error_aborts() {
        let store = MemoryStore::new();

        let result: Result<(), StoreError> = transact(&store, RetryPolicy::Bounded(3), |t, _| {
            Box::pin(async move {
                t.write("/partial", "1").await?;
                Err(StoreError::Internal("refused".into()))
            })
        })
        .await;

        assert!(matches!(result, Err(StoreError::Internal(_))));
        assert!(store.read("/partial").await.unwrap().is_none());
    }
}
