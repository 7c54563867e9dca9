//! Request scopes and execution contexts.
//!
//! A [`RequestContext`] is the per-request owner of a cancellation slot and
//! of request-scoped data. Cancelling installs a shared error-state
//! completion value in the slot; the transition happens at most once no
//! matter how many threads race on it.
//!
//! Cancellation is observational: work already enqueued on a device stream
//! or dispatched to the blocking pool runs to completion.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::async_value::{AsyncValue, AsyncValueRef};
use crate::error::{FlowError, Result};
use crate::executor::{HostExecutor, RequestId};

type RequestData = HashMap<TypeId, Box<dyn Any + Send + Sync>>;

struct RequestInner {
    id: RequestId,
    host: HostExecutor,
    data: RequestData,
    /// Null, or a reference leaked from an error-state `AsyncValueRef<()>`.
    cancel_value: AtomicPtr<AsyncValue<()>>,
}

impl Drop for RequestInner {
    fn drop(&mut self) {
        let installed = self.cancel_value.swap(ptr::null_mut(), Ordering::Acquire);
        if !installed.is_null() {
            // SAFETY: a non-null slot holds exactly one reference leaked by
            // `cancel`, and the swap above took it out of the slot.
            drop(unsafe { AsyncValueRef::from_raw(installed) });
        }
        self.host.release_request(self.id);
    }
}

/// Builder for [`RequestContext`].
pub struct RequestContextBuilder {
    host: HostExecutor,
    data: RequestData,
}

impl RequestContextBuilder {
    /// Start building a request on `host`.
    pub fn new(host: HostExecutor) -> Self {
        Self {
            host,
            data: HashMap::new(),
        }
    }

    /// Attach a piece of request-scoped data, replacing any value of the same
    /// type.
    #[must_use]
    pub fn insert<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.data.insert(TypeId::of::<T>(), Box::new(value));
        self
    }

    /// Register the request with the executor.
    ///
    /// Fails with [`FlowError::RequestRejected`] when the executor refuses the
    /// registration.
    pub fn build(self) -> Result<RequestContext> {
        let id = self.host.init_request()?;
        Ok(RequestContext {
            inner: Arc::new(RequestInner {
                id,
                host: self.host,
                data: self.data,
                cancel_value: AtomicPtr::new(ptr::null_mut()),
            }),
        })
    }
}

/// Reference-counted request scope.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<RequestInner>,
}

impl RequestContext {
    /// Start building a request scope.
    pub fn builder(host: HostExecutor) -> RequestContextBuilder {
        RequestContextBuilder::new(host)
    }

    /// Create a request scope without request data.
    ///
    /// # Panics
    ///
    /// Panics if the executor refuses to register the request. Call sites
    /// that can handle the refusal should use [`builder`](Self::builder).
    pub fn create(host: &HostExecutor) -> Self {
        match RequestContextBuilder::new(host.clone()).build() {
            Ok(ctx) => ctx,
            Err(e) => panic!("request registration refused: {e}"),
        }
    }

    /// Cancel the request.
    ///
    /// Returns `true` if this call performed the cancellation. Later and
    /// concurrent calls are no-ops.
    pub fn cancel(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }

        let candidate = AsyncValueRef::<()>::error(FlowError::Cancelled).into_raw();
        match self.inner.cancel_value.compare_exchange(
            ptr::null_mut(),
            candidate.cast_mut(),
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                debug!(request = %self.inner.id, "Request cancelled");
                true
            }
            Err(_) => {
                // SAFETY: `candidate` was leaked just above and never
                // published, so this is its only reference.
                drop(unsafe { AsyncValueRef::from_raw(candidate) });
                false
            }
        }
    }

    /// Check if the request has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        !self.inner.cancel_value.load(Ordering::Acquire).is_null()
    }

    /// The installed cancellation value, if any.
    pub fn cancel_value(&self) -> Option<AsyncValueRef<()>> {
        let installed = self.inner.cancel_value.load(Ordering::Acquire);
        if installed.is_null() {
            return None;
        }
        // SAFETY: the slot is only cleared in `RequestInner::drop`, which
        // cannot run while `self` holds the scope, so the slot's reference is
        // live.
        Some(unsafe { AsyncValueRef::clone_from_raw(installed) })
    }

    /// Request-scoped data of type `T`.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner
            .data
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Request id.
    pub fn id(&self) -> RequestId {
        self.inner.id
    }

    /// The executor this request was registered with.
    pub fn host(&self) -> &HostExecutor {
        &self.inner.host
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.inner.id)
            .field("cancelled", &self.is_cancelled())
            .field("data_entries", &self.inner.data.len())
            .finish()
    }
}

/// Context handed to conversion functions.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    request_ctx: RequestContext,
}

impl ExecutionContext {
    /// Wrap a request scope.
    pub fn new(request_ctx: RequestContext) -> Self {
        Self { request_ctx }
    }

    /// The executor of the underlying request.
    pub fn host(&self) -> &HostExecutor {
        self.request_ctx.host()
    }

    /// The underlying request scope.
    pub fn request_ctx(&self) -> &RequestContext {
        &self.request_ctx
    }

    /// Check if the underlying request has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.request_ctx.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutorConfig, ExecutorConfigBuilder};
    use std::sync::Barrier;
    use std::thread;

    fn host() -> HostExecutor {
        HostExecutor::new(ExecutorConfig::minimal()).unwrap()
    }

    #[test]
    fn test_cancel_once() {
        let host = host();
        let ctx = RequestContext::create(&host);
        assert!(!ctx.is_cancelled());
        assert!(ctx.cancel_value().is_none());

        assert!(ctx.cancel());
        assert!(!ctx.cancel());
        assert!(ctx.is_cancelled());

        let value = ctx.cancel_value().unwrap();
        assert_eq!(value.get_error(), Some(&FlowError::Cancelled));
    }

    #[test]
    fn test_concurrent_cancel_single_installed_value() {
        const THREADS: usize = 16;
        let host = host();

        for _ in 0..20 {
            let ctx = RequestContext::create(&host);
            let barrier = Arc::new(Barrier::new(THREADS));

            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let ctx = ctx.clone();
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        ctx.cancel()
                    })
                })
                .collect();

            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);

            let first = ctx.cancel_value().unwrap();
            let second = ctx.cancel_value().unwrap();
            assert!(first.ptr_eq(&second));
            // Slot + two handles: losers released theirs.
            assert_eq!(first.ref_count(), 3);
        }
    }

    #[test]
    fn test_drop_releases_cancel_value() {
        let host = host();
        let ctx = RequestContext::create(&host);
        ctx.cancel();
        let value = ctx.cancel_value().unwrap();
        assert_eq!(value.ref_count(), 2);

        drop(ctx);
        assert_eq!(value.ref_count(), 1);
        assert_eq!(host.active_requests(), 0);
    }

    #[test]
    fn test_request_data() {
        #[derive(Debug, PartialEq)]
        struct TraceTag(&'static str);

        let ctx = RequestContext::builder(host())
            .insert(TraceTag("upload"))
            .insert(42u32)
            .build()
            .unwrap();

        assert_eq!(ctx.get::<TraceTag>(), Some(&TraceTag("upload")));
        assert_eq!(ctx.get::<u32>(), Some(&42));
        assert!(ctx.get::<String>().is_none());
    }

    #[test]
    fn test_registration_rejected_at_limit() {
        let config = ExecutorConfigBuilder::minimal()
            .with_max_active_requests(1)
            .build();
        let host = HostExecutor::new(config).unwrap();

        let first = RequestContext::builder(host.clone()).build().unwrap();
        let second = RequestContext::builder(host.clone()).build();
        assert!(matches!(second, Err(FlowError::RequestRejected(_))));

        // Clones share one registration.
        let clone = first.clone();
        drop(first);
        assert_eq!(host.active_requests(), 1);
        drop(clone);
        assert_eq!(host.active_requests(), 0);
        assert!(RequestContext::builder(host).build().is_ok());
    }

    #[test]
    #[should_panic(expected = "request registration refused")]
    fn test_create_panics_when_refused() {
        let host = host();
        host.shutdown();
        let _ = RequestContext::create(&host);
    }

    #[test]
    fn test_execution_context() {
        let host = host();
        let exec = ExecutionContext::new(RequestContext::create(&host));
        assert!(!exec.is_cancelled());
        exec.request_ctx().cancel();
        assert!(exec.is_cancelled());
        assert_eq!(exec.host().active_requests(), 1);
    }
}
