//! Ordered, composable wrappers around call handling.
//!
//! A [`Chain`] is a plain list of interceptors in declaration order. When a
//! dispatcher is built, [`Chain::compose`] folds the list right to left
//! around every registered handler, so the first interceptor declared is the
//! outermost: it runs first and observes the final outcome last.
//!
//! An interceptor receives the call's context, its channel ends and a
//! [`Next`] handle. Calling [`Next::proceed`] runs the rest of the chain;
//! returning without calling it short-circuits the call. `Next` is consumed
//! by `proceed`, so the rest of the chain runs at most once.
//!
//! ## Provided interceptors
//!
//! - [`recovery::Recovery`] - converts panics into `Internal` statuses.
//! - [`logging::Logging`] - one span and one completion event per call.
//! - [`auth::Authenticator`] - bearer-token authentication.
//! - [`auth::RoleGuard`] - per-method role requirements.

pub mod auth;
pub mod logging;
pub mod recovery;

use crate::{
    context::CallContext,
    error::Status,
    service::{CallIo, CallService},
};
use core::{fmt, future::Future};
use std::sync::Arc;

/// A cross-cutting wrapper around call handling.
#[tonic::async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Name used in logs and debug output.
    fn name(&self) -> &'static str {
        core::any::type_name::<Self>()
    }

    async fn intercept(&self, ctx: CallContext, io: CallIo, next: Next) -> Result<(), Status>;
}

/// The remainder of the chain, runnable once.
pub struct Next {
    inner: Arc<dyn CallService>,
}

impl Next {
    pub(crate) fn new(inner: Arc<dyn CallService>) -> Self {
        Self { inner }
    }

    /// Runs the remaining interceptors and the handler.
    pub async fn proceed(self, ctx: CallContext, io: CallIo) -> Result<(), Status> {
        self.inner.call(ctx, io).await
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").finish_non_exhaustive()
    }
}

/// One interceptor bound to everything inside it.
struct Layered {
    interceptor: Arc<dyn Interceptor>,
    inner: Arc<dyn CallService>,
}

#[tonic::async_trait]
impl CallService for Layered {
    async fn call(&self, ctx: CallContext, io: CallIo) -> Result<(), Status> {
        let next = Next::new(Arc::clone(&self.inner));
        self.interceptor.intercept(ctx, io, next).await
    }
}

/// Interceptors in declaration order, outermost first.
#[derive(Clone, Default)]
pub struct Chain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Chain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an interceptor inside the ones already declared.
    #[must_use]
    pub fn with<I: Interceptor>(mut self, interceptor: I) -> Self {
        self.push(Arc::new(interceptor));
        self
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.interceptors.iter().map(|i| i.name())
    }

    /// Wraps `handler` in every interceptor, innermost last.
    #[must_use]
    pub fn compose(&self, handler: Arc<dyn CallService>) -> Arc<dyn CallService> {
        self.interceptors
            .iter()
            .rev()
            .fold(handler, |inner, interceptor| {
                Arc::new(Layered {
                    interceptor: Arc::clone(interceptor),
                    inner,
                })
            })
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// An interceptor built from an async closure.
pub struct FnInterceptor<F> {
    name: &'static str,
    f: F,
}

/// Creates an interceptor from a closure taking `(ctx, io, next)`.
pub fn from_fn<F, Fut>(name: &'static str, f: F) -> FnInterceptor<F>
where
    F: Fn(CallContext, CallIo, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    FnInterceptor { name, f }
}

#[tonic::async_trait]
impl<F, Fut> Interceptor for FnInterceptor<F>
where
    F: Fn(CallContext, CallIo, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    async fn intercept(&self, ctx: CallContext, io: CallIo, next: Next) -> Result<(), Status> {
        (self.f)(ctx, io, next).await
    }
}

impl<F> fmt::Debug for FnInterceptor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnInterceptor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
