//! Cancellation and first-error-wins joining of the tasks that make up a build.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    thread,
};

use log::debug;

use crate::Error;

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Callbacks {
    next_id: u64,
    pending: BTreeMap<u64, Callback>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

impl Inner {
    fn callbacks(&self) -> MutexGuard<'_, Callbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A cancellation signal shared between tasks. Cloning the token yields a handle to the same signal.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<Inner>);

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation and runs the registered callbacks. Only the first call has an effect.
    pub fn cancel(&self) {
        if self.0.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks = std::mem::take(&mut self.0.callbacks().pending);
        for callback in callbacks.into_values() {
            callback();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Runs `callback` once the token is cancelled, or right away if it already is. The callback
    /// is unregistered when the returned guard is dropped.
    pub fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) -> Registration {
        let mut callbacks = self.0.callbacks();
        if self.is_cancelled() {
            drop(callbacks);
            callback();
            return Registration {
                inner: Weak::new(),
                id: None,
            };
        }
        let id = callbacks.next_id;
        callbacks.next_id += 1;
        callbacks.pending.insert(id, Box::new(callback));
        Registration {
            inner: Arc::downgrade(&self.0),
            id: Some(id),
        }
    }

    /// Returns a new token that is cancelled when this one is, but can also be cancelled on its
    /// own without affecting this one. The link to this token lasts as long as the registration.
    pub fn child(&self) -> (Self, Registration) {
        let child = Self::new();
        let registration = self.on_cancel({
            let child = child.clone();
            move || child.cancel()
        });
        (child, registration)
    }

    #[cfg(test)]
    pub(crate) fn callback_count(&self) -> usize {
        self.0.callbacks().pending.len()
    }
}

/// A callback registered with [`CancellationToken::on_cancel`]. Dropping it removes the callback
/// if it has not run yet.
#[must_use = "dropping the registration removes the callback"]
pub struct Registration {
    inner: Weak<Inner>,
    id: Option<u64>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let (Some(id), Some(inner)) = (self.id, self.inner.upgrade()) else {
            return;
        };
        inner.callbacks().pending.remove(&id);
    }
}

/// A set of tasks running on scoped threads. The first task to fail cancels the group's token and
/// its error becomes the result of [`join`]. Errors of tasks failing later are discarded.
pub struct TaskGroup<'scope, 'env: 'scope> {
    scope: &'scope thread::Scope<'scope, 'env>,
    token: CancellationToken,
    first_error: Arc<Mutex<Option<Error>>>,
}

impl<'scope, 'env> TaskGroup<'scope, 'env> {
    /// The token that is cancelled when any task in the group fails, or when the parent token is
    /// cancelled.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn spawn<T, F>(&self, name: &'static str, task: F) -> Task<'scope, T>
    where
        T: Send + 'scope,
        F: FnOnce() -> Result<T, Error> + Send + 'scope,
    {
        let token = self.token.clone();
        let first_error = Arc::clone(&self.first_error);
        let handle = self.scope.spawn(move || match task() {
            Ok(value) => Some(value),
            Err(error) => {
                let mut slot = first_error.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.is_none() {
                    debug!("task {name} failed first: {error}");
                    *slot = Some(error);
                } else {
                    debug!("discarding error of task {name}: {error}");
                }
                drop(slot);
                token.cancel();
                None
            }
        });
        Task(handle)
    }
}

/// Handle to a task spawned in a [`TaskGroup`].
pub struct Task<'scope, T>(thread::ScopedJoinHandle<'scope, Option<T>>);

impl<T> Task<'_, T> {
    /// Waits for the task and returns its value, or `None` if it failed. The error of a failed task
    /// is reported by [`join`].
    pub fn join(self) -> Option<T> {
        match self.0.join() {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Runs `f` with a fresh task group whose token is a child of `parent`, then waits for every task
/// spawned in the group. Returns the value of `f` if no task failed, and the first error otherwise.
pub fn join<'env, T, F>(parent: &CancellationToken, f: F) -> Result<T, Error>
where
    F: for<'scope> FnOnce(&TaskGroup<'scope, 'env>) -> T,
{
    let (token, _registration) = parent.child();
    let first_error = Arc::new(Mutex::new(None));

    let value = thread::scope(|scope| {
        let group = TaskGroup {
            scope,
            token,
            first_error: Arc::clone(&first_error),
        };
        f(&group)
    });

    let first_error = first_error
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    match first_error {
        Some(error) => Err(error),
        None => Ok(value),
    }
}
