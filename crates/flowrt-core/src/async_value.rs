//! One-shot, reference-counted completion values.
//!
//! An [`AsyncValueRef`] starts unresolved and transitions exactly once to
//! either a concrete value or an error. The transition is decided by a single
//! compare-and-set on the state tag, so any number of threads may race to
//! resolve it: one wins and the others get their payload handed back.
//!
//! ```text
//!              try_set_value / try_set_error (CAS winner)
//! Unresolved ─────────────────────────────────────────────▶ Concrete | Error
//!      │                                                          │
//!      └── and_then(f): queued ──────── drained, run once ◀───────┘
//! ```
//!
//! # Example
//!
//! ```
//! use flowrt_core::async_value::AsyncValueRef;
//!
//! let value = AsyncValueRef::<u32>::unresolved();
//! let observer = value.clone();
//! std::thread::spawn(move || {
//!     value.set_value(42);
//! });
//! assert_eq!(observer.wait().as_ref().ok(), Some(&42));
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{FlowError, Result};

const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 1;
const CONCRETE: u8 = 2;
const ERROR: u8 = 3;

/// Observable state of an [`AsyncValueRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncState {
    /// Not yet resolved.
    Unresolved,
    /// Holds a value.
    Concrete,
    /// Holds an error.
    Error,
}

impl AsyncState {
    /// Check if the state is terminal.
    pub fn is_ready(self) -> bool {
        !matches!(self, Self::Unresolved)
    }
}

type Waiter<T> = Box<dyn FnOnce(&Result<T>) + Send>;

pub(crate) struct AsyncValue<T> {
    /// State tag; the only field raced on.
    state: AtomicU8,
    /// Written once by the CAS winner, before the tag leaves `RESOLVING`.
    payload: OnceLock<Result<T>>,
    /// Continuations registered before resolution.
    waiters: Mutex<Vec<Waiter<T>>>,
    /// Signalled when the tag becomes terminal.
    ready: Condvar,
}

/// Shared handle to a one-shot completion value.
///
/// Cloning adds a reference, dropping releases one; the payload is freed
/// together with the last handle.
pub struct AsyncValueRef<T> {
    inner: Arc<AsyncValue<T>>,
}

impl<T> Clone for AsyncValueRef<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> AsyncValueRef<T> {
    /// Create an unresolved value.
    pub fn unresolved() -> Self {
        Self::with_state(UNRESOLVED, OnceLock::new())
    }

    /// Create a value that is already available.
    pub fn available(value: T) -> Self {
        Self::with_state(CONCRETE, OnceLock::from(Ok(value)))
    }

    /// Create a value that is already in the error state.
    pub fn error(error: FlowError) -> Self {
        Self::with_state(ERROR, OnceLock::from(Err(error)))
    }

    fn with_state(state: u8, payload: OnceLock<Result<T>>) -> Self {
        Self {
            inner: Arc::new(AsyncValue {
                state: AtomicU8::new(state),
                payload,
                waiters: Mutex::new(Vec::new()),
                ready: Condvar::new(),
            }),
        }
    }

    /// Resolve with a value.
    ///
    /// Returns `Err(value)` if the value was already resolved; the caller owns
    /// the payload it failed to install.
    pub fn try_set_value(&self, value: T) -> std::result::Result<(), T> {
        self.try_set_result(Ok(value)).map_err(|result| match result {
            Ok(value) => value,
            Err(_) => unreachable!("payload kind changed"),
        })
    }

    /// Resolve with an error.
    ///
    /// Returns `Err(error)` if the value was already resolved.
    pub fn try_set_error(&self, error: FlowError) -> std::result::Result<(), FlowError> {
        self.try_set_result(Err(error)).map_err(|result| match result {
            Err(error) => error,
            Ok(_) => unreachable!("payload kind changed"),
        })
    }

    /// Resolve with a value, dropping it if another resolver won.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn set_value(&self, value: T) -> bool {
        self.try_set_value(value).is_ok()
    }

    /// Resolve with an error, dropping it if another resolver won.
    pub fn set_error(&self, error: FlowError) -> bool {
        self.try_set_error(error).is_ok()
    }

    /// Resolve with either outcome.
    pub fn set_result(&self, result: Result<T>) -> bool {
        self.try_set_result(result).is_ok()
    }

    fn try_set_result(&self, result: Result<T>) -> std::result::Result<(), Result<T>> {
        if self
            .inner
            .state
            .compare_exchange(UNRESOLVED, RESOLVING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(result);
        }

        let tag = if result.is_ok() { CONCRETE } else { ERROR };
        // Only the CAS winner gets here, the cell is still empty.
        let _ = self.inner.payload.set(result);

        let waiters = {
            let mut waiters = self.inner.waiters.lock();
            self.inner.state.store(tag, Ordering::Release);
            self.inner.ready.notify_all();
            std::mem::take(&mut *waiters)
        };

        if !waiters.is_empty() {
            let result = self.resolved();
            for waiter in waiters {
                waiter(result);
            }
        }
        Ok(())
    }

    /// Current state.
    pub fn state(&self) -> AsyncState {
        match self.inner.state.load(Ordering::Acquire) {
            CONCRETE => AsyncState::Concrete,
            ERROR => AsyncState::Error,
            _ => AsyncState::Unresolved,
        }
    }

    /// Check if the value has been resolved.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Check if the value resolved to a concrete value.
    #[inline]
    pub fn is_concrete(&self) -> bool {
        self.state() == AsyncState::Concrete
    }

    /// Check if the value resolved to an error.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.state() == AsyncState::Error
    }

    /// Get the result if resolved.
    pub fn get(&self) -> Option<&Result<T>> {
        if self.is_ready() {
            self.inner.payload.get()
        } else {
            None
        }
    }

    /// Get the value if resolved to one.
    pub fn value(&self) -> Option<&T> {
        self.get().and_then(|result| result.as_ref().ok())
    }

    /// Get the error if resolved to one.
    pub fn get_error(&self) -> Option<&FlowError> {
        self.get().and_then(|result| result.as_ref().err())
    }

    /// Block the calling thread until the value is resolved.
    pub fn wait(&self) -> &Result<T> {
        if !self.is_ready() {
            let mut guard = self.inner.waiters.lock();
            while !self.is_ready() {
                self.inner.ready.wait(&mut guard);
            }
        }
        self.resolved()
    }

    /// Block until resolved or until `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<&Result<T>> {
        if !self.is_ready() {
            let deadline = Instant::now() + timeout;
            let mut guard = self.inner.waiters.lock();
            while !self.is_ready() {
                if self.inner.ready.wait_until(&mut guard, deadline).timed_out() {
                    break;
                }
            }
        }
        self.get()
    }

    /// Await resolution from async code without parking a thread.
    pub async fn ready(&self) -> &Result<T> {
        if !self.is_ready() {
            let (tx, rx) = tokio::sync::oneshot::channel::<()>();
            self.and_then(move |_| {
                let _ = tx.send(());
            });
            let _ = rx.await;
        }
        self.resolved()
    }

    /// Register a continuation.
    ///
    /// Runs immediately on the calling thread if the value is already
    /// resolved, otherwise exactly once on whichever thread resolves it.
    /// A continuation that captures a clone of this value keeps it alive until
    /// it runs.
    pub fn and_then<F>(&self, waiter: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        {
            let mut waiters = self.inner.waiters.lock();
            if !self.is_ready() {
                waiters.push(Box::new(waiter));
                return;
            }
        }
        waiter(self.resolved());
    }

    /// Number of live handles to this value.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Check whether two handles refer to the same value.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Take the payload out if this is the last handle and it is resolved.
    ///
    /// Otherwise the handle is given back unchanged.
    pub fn try_into_result(self) -> std::result::Result<Result<T>, Self> {
        if !self.is_ready() {
            return Err(self);
        }
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => match inner.payload.into_inner() {
                Some(result) => Ok(result),
                None => unreachable!("ready async value without payload"),
            },
            Err(inner) => Err(Self { inner }),
        }
    }

    /// Leak this handle into a raw pointer, keeping its reference.
    pub(crate) fn into_raw(self) -> *const AsyncValue<T> {
        Arc::into_raw(self.inner)
    }

    /// Reclaim a handle leaked by [`into_raw`](Self::into_raw).
    ///
    /// # Safety
    ///
    /// `ptr` must come from `into_raw` and its reference must not have been
    /// reclaimed already.
    pub(crate) unsafe fn from_raw(ptr: *const AsyncValue<T>) -> Self {
        Self {
            // SAFETY: guaranteed by the caller.
            inner: unsafe { Arc::from_raw(ptr) },
        }
    }

    /// Take a new handle from a pointer leaked by [`into_raw`](Self::into_raw)
    /// without consuming that pointer's reference.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `into_raw` and its reference must still be live
    /// for the duration of the call.
    pub(crate) unsafe fn clone_from_raw(ptr: *const AsyncValue<T>) -> Self {
        // SAFETY: the leaked reference keeps the allocation alive while we
        // add ours.
        unsafe {
            Arc::increment_strong_count(ptr);
            Self::from_raw(ptr)
        }
    }

    fn resolved(&self) -> &Result<T> {
        match self.inner.payload.get() {
            Some(result) => result,
            None => unreachable!("ready async value without payload"),
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for AsyncValueRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncValueRef")
            .field("state", &self.state())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
