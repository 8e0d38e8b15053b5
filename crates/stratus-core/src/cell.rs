//! Single-assignment future cell.
//!
//! An atomically-swappable handle holding either "pending" or
//! "resolved(value | error)". The session installs a pending cell as its
//! device observer *before* the observer exists, so concurrent readers
//! (notification handlers, unpublish paths) await the same resolution
//! instead of racing the asynchronous creation.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::ServiceError;

type Slot<T> = Option<Result<Arc<T>, Arc<ServiceError>>>;

/// Readable half: clone freely, await [`get`](Self::get).
pub struct FutureCell<T> {
    rx: watch::Receiver<Slot<T>>,
}

impl<T> Clone for FutureCell<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

/// Writable half: resolves the cell exactly once; later calls no-op.
pub struct Resolver<T> {
    tx: Arc<watch::Sender<Slot<T>>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T> FutureCell<T> {
    pub fn new() -> (Self, Resolver<T>) {
        let (tx, rx) = watch::channel(None);
        (Self { rx }, Resolver { tx: Arc::new(tx) })
    }

    /// Wait until the cell resolves and return the shared result.
    ///
    /// Errors with [`ServiceError::Internal`] if every resolver was
    /// dropped without resolving.
    pub async fn get(&self) -> Result<Arc<T>, ServiceError> {
        let mut rx = self.rx.clone();
        let resolved = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ServiceError::Internal("future cell abandoned unresolved".into()))?;
        match resolved.as_ref() {
            Some(Ok(value)) => Ok(Arc::clone(value)),
            Some(Err(err)) => Err(ServiceError::from_shared(err)),
            None => Err(ServiceError::Internal("future cell abandoned unresolved".into())),
        }
    }

    /// Non-blocking read; `None` while still pending.
    pub fn try_get(&self) -> Option<Result<Arc<T>, ServiceError>> {
        self.rx.borrow().as_ref().map(|result| match result {
            Ok(value) => Ok(Arc::clone(value)),
            Err(err) => Err(ServiceError::from_shared(err)),
        })
    }
}

impl<T> Resolver<T> {
    /// Resolve the cell. The first resolution wins; every later call is
    /// ignored so racing creation paths cannot overwrite each other.
    pub fn resolve(&self, result: Result<Arc<T>, ServiceError>) {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result.map_err(Arc::new));
            true
        });
    }
}

// ── Tests ────────────────────────────────────────────────────────────
