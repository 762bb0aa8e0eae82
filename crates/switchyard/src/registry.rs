//! Method identifier to handler routing.
//!
//! Registrations are added while the dispatcher is being built and are
//! read-only afterwards: the registry is moved into the dispatcher, so no
//! registration can change while calls are being served.

use crate::{
    call::Pattern,
    channel::{FrameReceiver, FrameSender},
    context::CallContext,
    error::{Error, Status},
    frame::Frame,
    interceptor::Chain,
    service::{BidiStreaming, CallService, ClientStreaming, ServerStreaming, Unary},
};
use core::future::Future;
use std::{collections::HashMap, sync::Arc};

/// A handler bound to the pattern it serves.
#[derive(Clone)]
pub struct Registration {
    method: Arc<str>,
    pattern: Pattern,
    service: Arc<dyn CallService>,
}

impl Registration {
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    pub(crate) const fn method_arc(&self) -> &Arc<str> {
        &self.method
    }

    #[must_use]
    pub const fn pattern(&self) -> Pattern {
        self.pattern
    }

    pub(crate) fn service(&self) -> &Arc<dyn CallService> {
        &self.service
    }
}

impl core::fmt::Debug for Registration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registration")
            .field("method", &self.method)
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, Default)]
pub struct Registry {
    routes: HashMap<Arc<str>, Registration>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `method` to `service` for calls of `pattern`.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateRegistration`] if `method` is already bound.
    /// - [`Error::InvalidMethod`] if `method` is empty or contains
    ///   whitespace.
    pub fn register<S: CallService>(
        &mut self,
        method: &str,
        pattern: Pattern,
        service: S,
    ) -> Result<&mut Self, Error> {
        if method.is_empty() || method.chars().any(char::is_whitespace) {
            return Err(Error::InvalidMethod {
                method: method.to_string(),
                reason: "must be non-empty and free of whitespace".to_string(),
            });
        }
        if self.routes.contains_key(method) {
            return Err(Error::DuplicateRegistration {
                method: method.to_string(),
            });
        }
        tracing::debug!(method, %pattern, "Registered handler");
        let method: Arc<str> = Arc::from(method);
        self.routes.insert(
            Arc::clone(&method),
            Registration {
                method,
                pattern,
                service: Arc::new(service),
            },
        );
        Ok(self)
    }

    /// Registers a one-request, one-response handler.
    ///
    /// # Errors
    ///
    /// See [`register`](Self::register).
    pub fn unary<F, Fut>(&mut self, method: &str, handler: F) -> Result<&mut Self, Error>
    where
        F: Fn(CallContext, Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Frame, Status>> + Send + 'static,
    {
        self.register(method, Pattern::Unary, Unary(handler))
    }

    /// Registers a one-request, streamed-response handler.
    ///
    /// # Errors
    ///
    /// See [`register`](Self::register).
    pub fn server_streaming<F, Fut>(&mut self, method: &str, handler: F) -> Result<&mut Self, Error>
    where
        F: Fn(CallContext, Frame, FrameSender) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.register(method, Pattern::ServerStream, ServerStreaming(handler))
    }

    /// Registers a streamed-request, one-response handler.
    ///
    /// # Errors
    ///
    /// See [`register`](Self::register).
    pub fn client_streaming<F, Fut>(&mut self, method: &str, handler: F) -> Result<&mut Self, Error>
    where
        F: Fn(CallContext, FrameReceiver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Frame, Status>> + Send + 'static,
    {
        self.register(method, Pattern::ClientStream, ClientStreaming(handler))
    }

    /// Registers a handler with independent streams in both directions.
    ///
    /// # Errors
    ///
    /// See [`register`](Self::register).
    pub fn bidi_streaming<F, Fut>(&mut self, method: &str, handler: F) -> Result<&mut Self, Error>
    where
        F: Fn(CallContext, FrameReceiver, FrameSender) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.register(method, Pattern::BidiStream, BidiStreaming(handler))
    }

    /// Finds the handler for a call.
    ///
    /// # Errors
    ///
    /// `Unimplemented` for an unknown method, `ProtocolViolation` if the
    /// caller's pattern differs from the registered one.
    pub fn resolve(&self, method: &str, pattern: Pattern) -> Result<&Registration, Status> {
        let registration = self
            .routes
            .get(method)
            .ok_or_else(|| Status::unimplemented(format!("Method `{method}` is not registered")))?;
        if registration.pattern != pattern {
            return Err(Status::protocol_violation(format!(
                "Method `{method}` is {}, called as {pattern}",
                registration.pattern
            )));
        }
        Ok(registration)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn methods(&self) -> impl Iterator<Item = (&str, Pattern)> {
        self.routes.iter().map(|(m, r)| (&**m, r.pattern))
    }

    /// Wraps every handler in `chain`.
    pub(crate) fn compose_with(self, chain: &Chain) -> Self {
        let routes = self
            .routes
            .into_iter()
            .map(|(method, registration)| {
                let service = chain.compose(registration.service);
                (method, Registration { service, ..registration })
            })
            .collect();
        Self { routes }
    }
}
