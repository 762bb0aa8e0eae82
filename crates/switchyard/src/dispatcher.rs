//! Admission and scheduling of calls.
//!
//! The [`Dispatcher`] owns the composed handler table for its whole
//! lifetime. Every admitted call gets its own context, its own pair of
//! stream channels and its own Tokio task, so calls only ever contend on
//! state their handlers share explicitly.
//!
//! Shutdown is cooperative and mirrors a worker pool's drain:
//! 1. stop admitting new calls,
//! 2. let in-flight calls finish for up to `shutdown_timeout`,
//! 3. cancel what is left through the parent token every call token derives
//!    from, and wait once more for those calls to settle.

use crate::{
    call::{self, CallId, CallShared, Pattern},
    channel::{CallSignal, Direction, stream_channel},
    client::{CallOptions, ClientCall, Connection},
    config::DispatcherConfig,
    context::CallContext,
    error::{Error, Status},
    interceptor::{Chain, Interceptor, recovery::panic_message},
    registry::{Registration, Registry},
    service::CallIo,
};
use core::fmt;
use futures::FutureExt;
use portable_atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::{panic::AssertUnwindSafe, sync::Arc};
use tokio::{
    sync::{Notify, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

/// Assembles a [`Dispatcher`] from handlers, interceptors and limits.
#[derive(Debug, Default)]
pub struct DispatcherBuilder {
    registry: Registry,
    chain: Chain,
    config: DispatcherConfig,
    shutdown: Option<CancellationToken>,
}

impl DispatcherBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the handler table.
    #[must_use]
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// The handler table, for registering in place.
    pub const fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Appends an interceptor inside the ones already added.
    #[must_use]
    pub fn interceptor<I: Interceptor>(mut self, interceptor: I) -> Self {
        self.chain.push(Arc::new(interceptor));
        self
    }

    /// Replaces the interceptor list.
    #[must_use]
    pub fn chain(mut self, chain: Chain) -> Self {
        self.chain = chain;
        self
    }

    #[must_use]
    pub const fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Ties every call to an external shutdown signal: cancelling `token`
    /// cancels all in-flight calls.
    #[must_use]
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Composes the interceptor chain around every registered handler.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the configuration is invalid.
    pub fn build(self) -> Result<Dispatcher, Error> {
        self.config.validate()?;
        tracing::debug!(
            handlers = self.registry.len(),
            interceptors = ?self.chain,
            "Building dispatcher"
        );
        let routes = self.registry.compose_with(&self.chain);
        Ok(Dispatcher {
            inner: Arc::new(Inner {
                routes,
                chain: self.chain,
                config: self.config,
                shutdown: self.shutdown.unwrap_or_default(),
                accepting: AtomicBool::new(true),
                next_id: AtomicU64::new(0),
                inflight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        })
    }
}

struct Inner {
    routes: Registry,
    chain: Chain,
    config: DispatcherConfig,
    shutdown: CancellationToken,
    accepting: AtomicBool,
    next_id: AtomicU64,
    inflight: AtomicUsize,
    idle: Notify,
}

impl Inner {
    fn try_admit(&self) -> bool {
        let max = self.config.max_inflight_calls;
        self.inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    fn release(&self) {
        if self.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn drained(&self) {
        loop {
            let notified = self.idle.notified();
            if self.inflight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Routes calls through the interceptor chain to their handlers.
///
/// Cheap to clone; clones share the same handlers, limits and shutdown
/// state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    #[must_use]
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// A connection over which any number of calls can be multiplexed.
    #[must_use]
    pub fn connect(&self) -> Connection {
        Connection::new(self.clone())
    }

    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Calls currently admitted and not yet settled.
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.inner.inflight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Registered methods and their patterns.
    pub fn methods(&self) -> impl Iterator<Item = (&str, Pattern)> {
        self.inner.routes.methods()
    }

    /// Opens a call.
    ///
    /// The call always yields a handle. A call that cannot be admitted
    /// (unknown method, pattern mismatch, shutdown, saturation) is already
    /// failed, and its handle reports the status.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn open(&self, method: &str, pattern: Pattern, options: CallOptions) -> ClientCall {
        let inner = &self.inner;
        let id = CallId::new(inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (metadata, timeout) = options.into_parts();
        let deadline = timeout
            .or(inner.config.default_timeout)
            .map(|t| Instant::now() + t);

        let token = inner.shutdown.child_token();
        let signal = CallSignal::new(token.clone(), deadline);
        let shared = Arc::new(CallShared::new());
        let (requests, handler_rx) = stream_channel(
            pattern.inbound(),
            Direction::Inbound,
            signal.clone(),
            Arc::clone(&shared),
        );
        let (handler_tx, responses) = stream_channel(
            pattern.outbound(),
            Direction::Outbound,
            signal.clone(),
            Arc::clone(&shared),
        );
        let (status_tx, status_rx) = oneshot::channel();

        let admitted = self.admit(method, pattern);
        let method_id: Arc<str> = match &admitted {
            Ok(registration) => Arc::clone(registration.method_arc()),
            Err(_) => Arc::from(method),
        };
        let call = ClientCall::new(
            id,
            Arc::clone(&method_id),
            pattern,
            requests,
            responses,
            status_rx,
            token,
            Arc::clone(&shared),
        );

        let service = match admitted {
            Ok(registration) => Arc::clone(registration.service()),
            Err(status) => {
                tracing::debug!(
                    call_id = %id,
                    method,
                    %pattern,
                    code = %status.code(),
                    reason = status.message(),
                    "Call refused"
                );
                let _ = status_tx.send(call::settle(&shared, Err(status)));
                return call;
            }
        };

        let ctx = CallContext::new(
            id,
            method_id,
            pattern,
            signal,
            metadata,
            Arc::clone(&shared),
        );
        let io = CallIo {
            inbound: handler_rx,
            outbound: handler_tx,
        };
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(call::drive(ctx, io, service))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => {
                    tracing::error!(
                        call_id = %id,
                        panic = panic_message(panic.as_ref()),
                        "Call task panicked outside the interceptor chain"
                    );
                    let status = Status::internal("Internal error while handling the call");
                    call::settle(&shared, Err(status))
                }
            };
            debug_assert!(shared.state().is_terminal());
            // The caller may have gone away; its status is then unobserved.
            let _ = status_tx.send(outcome);
            inner.release();
        });
        call
    }

    fn admit(&self, method: &str, pattern: Pattern) -> Result<&Registration, Status> {
        let inner = &self.inner;
        if !inner.accepting.load(Ordering::Acquire) || inner.shutdown.is_cancelled() {
            return Err(Error::Shutdown.into());
        }
        let registration = inner.routes.resolve(method, pattern)?;
        if !inner.try_admit() {
            return Err(Status::cancelled(format!(
                "Dispatcher is saturated ({} calls in flight)",
                inner.config.max_inflight_calls
            )));
        }
        Ok(registration)
    }

    /// Stops admitting calls and drains the ones in flight.
    ///
    /// # Errors
    ///
    /// [`Error::Shutdown`] if shutdown was already requested.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let inner = &self.inner;
        if !inner.accepting.swap(false, Ordering::AcqRel) {
            return Err(Error::Shutdown);
        }
        let timeout = inner.config.shutdown_timeout;
        tracing::info!(inflight = self.inflight(), "Initiating dispatcher shutdown");

        if tokio::time::timeout(timeout, inner.drained()).await.is_ok() {
            tracing::debug!("In-flight calls drained");
        } else {
            tracing::warn!(
                inflight = self.inflight(),
                "Drain timed out, cancelling remaining calls"
            );
            inner.shutdown.cancel();
            if tokio::time::timeout(timeout, inner.drained()).await.is_err() {
                tracing::warn!(inflight = self.inflight(), "Calls still running after cancellation");
            }
        }
        inner.shutdown.cancel();

        tracing::info!("Dispatcher shutdown complete");
        Ok(())
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.inner.routes.len())
            .field("interceptors", &self.inner.chain)
            .field("config", &self.inner.config)
            .field("inflight", &self.inflight())
            .finish()
    }
}
