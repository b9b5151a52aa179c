//! Memoized asynchronous initialization.
//!
//! A connection handle goes through `Uninitialized → Initializing → Ready`.
//! While an open is in flight, every caller awaits the same shared future
//! instead of issuing a second open (and a second schema upgrade).

use super::StorageError;
use futures_util::future::{FutureExt, LocalBoxFuture, Shared};
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

type PendingInit<T> = Shared<LocalBoxFuture<'static, Result<T, StorageError>>>;

enum InitState<T: Clone> {
    Uninitialized,
    Initializing(PendingInit<T>),
    Ready(T),
}

/// A lazily-initialized value shared by all clones of the cell.
///
/// A failed initialization is not cached: the cell returns to
/// `Uninitialized` and the next caller retries.
pub struct InitCell<T: Clone + 'static> {
    state: Rc<RefCell<InitState<T>>>,
}

impl<T: Clone + 'static> Clone for InitCell<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + 'static> Default for InitCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> InitCell<T> {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(InitState::Uninitialized)),
        }
    }

    /// Returns the ready value without initializing.
    pub fn get(&self) -> Option<T> {
        match &*self.state.borrow() {
            InitState::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn is_initializing(&self) -> bool {
        matches!(&*self.state.borrow(), InitState::Initializing(_))
    }

    /// Returns the value, running `open` only if no initialization is ready or
    /// in flight.
    pub async fn get_or_init<F, Fut>(&self, open: F) -> Result<T, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StorageError>> + 'static,
    {
        let pending = {
            let mut state = self.state.borrow_mut();
            let existing = match &*state {
                InitState::Ready(value) => return Ok(value.clone()),
                InitState::Initializing(pending) => Some(pending.clone()),
                InitState::Uninitialized => None,
            };
            match existing {
                Some(pending) => pending,
                None => {
                    let pending = open().boxed_local().shared();
                    *state = InitState::Initializing(pending.clone());
                    pending
                }
            }
        };

        let result = pending.clone().await;

        // Only the attempt that is still current may settle the state; a
        // newer attempt started after a failure must not be overwritten.
        let mut state = self.state.borrow_mut();
        let is_current = matches!(
            &*state,
            InitState::Initializing(current) if Shared::ptr_eq(current, &pending)
        );
        if is_current {
            *state = match &result {
                Ok(value) => InitState::Ready(value.clone()),
                Err(_) => InitState::Uninitialized,
            };
        }

        result
    }

    /// Drops a ready value so the next caller initializes again.
    pub fn reset(&self) {
        *self.state.borrow_mut() = InitState::Uninitialized;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_channel::oneshot;
    use futures_executor::LocalPool;
    use futures_util::task::LocalSpawnExt;
    use std::cell::Cell;

    #[test]
    fn test_concurrent_callers_share_one_open() {
        let mut pool = LocalPool::new();
        let cell: InitCell<u32> = InitCell::new();
        let opens = Rc::new(Cell::new(0u32));
        let results = Rc::new(RefCell::new(Vec::new()));
        let (release, gate) = oneshot::channel::<()>();
        let gate = Rc::new(RefCell::new(Some(gate)));

        for answer in [7u32, 8u32] {
            let cell = cell.clone();
            let opens = opens.clone();
            let results = results.clone();
            let gate = gate.clone();
            pool.spawner()
                .spawn_local(async move {
                    let value = cell
                        .get_or_init(move || {
                            opens.set(opens.get() + 1);
                            let gate = gate.borrow_mut().take();
                            async move {
                                if let Some(gate) = gate {
                                    gate.await
                                        .map_err(|e| StorageError::Other(e.to_string()))?;
                                }
                                Ok(answer)
                            }
                        })
                        .await;
                    results.borrow_mut().push(value);
                })
                .unwrap();
        }

        pool.run_until_stalled();
        assert!(cell.is_initializing());
        assert_eq!(opens.get(), 1);
        assert!(results.borrow().is_empty());

        release.send(()).unwrap();
        pool.run_until_stalled();

        assert_eq!(*results.borrow(), vec![Ok(7), Ok(7)]);
        assert_eq!(cell.get(), Some(7));
        assert_eq!(opens.get(), 1);
    }

    #[test]
    fn test_failed_open_is_retried() {
        let mut pool = LocalPool::new();
        let cell: InitCell<&'static str> = InitCell::new();

        let first = pool.run_until(cell.get_or_init(|| async {
            Err(StorageError::DatabaseOpenFailed("blocked".to_string()))
        }));
        assert_eq!(
            first,
            Err(StorageError::DatabaseOpenFailed("blocked".to_string()))
        );
        assert_eq!(cell.get(), None);

        let second = pool.run_until(cell.get_or_init(|| async { Ok("open") }));
        assert_eq!(second, Ok("open"));

        // Ready values are returned without calling the opener again.
        let third = pool.run_until(cell.get_or_init(|| async {
            Err(StorageError::Other("should not run".to_string()))
        }));
        assert_eq!(third, Ok("open"));
    }

    #[test]
    fn test_reset_forces_reopen() {
        let mut pool = LocalPool::new();
        let cell: InitCell<u8> = InitCell::new();
        pool.run_until(cell.get_or_init(|| async { Ok(1) })).unwrap();
        cell.reset();
        let value = pool.run_until(cell.get_or_init(|| async { Ok(2) }));
        assert_eq!(value, Ok(2));
    }
}
