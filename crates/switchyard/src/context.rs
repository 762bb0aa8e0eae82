//! Per-call state handed to interceptors and handlers.
//!
//! A [`CallContext`] is passed by value down the interceptor chain. An
//! interceptor may add values to its [`Extensions`] before handing it to the
//! next link; because the context is moved, anything added downstream is
//! never visible upstream.

use crate::{
    call::{CallId, CallShared, Pattern},
    channel::CallSignal,
    error::Status,
    interceptor::auth::{Principal, Role},
    metadata::{FORWARDED_FOR, Metadata},
};
use core::{
    any::{Any, TypeId},
    fmt,
    time::Duration,
};
use std::{collections::HashMap, sync::Arc};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Typed, write-once values injected by interceptors.
///
/// Keyed by type, so each capability is a distinct Rust type rather than a
/// string key.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`. A value of the same type that is already present is
    /// kept, and `value` is handed back.
    ///
    /// # Errors
    ///
    /// Returns `Err(value)` if a value of type `T` was already stored.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Result<(), T> {
        use std::collections::hash_map::Entry;

        match self.map.entry(TypeId::of::<T>()) {
            Entry::Occupied(_) => Err(value),
            Entry::Vacant(slot) => {
                slot.insert(Box::new(value));
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref())
    }

    #[must_use]
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.map.contains_key(&TypeId::of::<T>())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

/// Everything known about one call on the serving side.
#[derive(Debug)]
pub struct CallContext {
    id: CallId,
    method: Arc<str>,
    pattern: Pattern,
    signal: CallSignal,
    metadata: Metadata,
    shared: Arc<CallShared>,
    extensions: Extensions,
}

impl CallContext {
    pub(crate) fn new(
        id: CallId,
        method: Arc<str>,
        pattern: Pattern,
        signal: CallSignal,
        metadata: Metadata,
        shared: Arc<CallShared>,
    ) -> Self {
        Self {
            id,
            method,
            pattern,
            signal,
            metadata,
            shared,
            extensions: Extensions::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> CallId {
        self.id
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub const fn pattern(&self) -> Pattern {
        self.pattern
    }

    /// Inbound metadata, as received from the caller.
    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The caller's advertised origin, if any.
    #[must_use]
    pub fn peer(&self) -> Option<&str> {
        self.metadata.get(FORWARDED_FOR)
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.signal.deadline()
    }

    /// Time left before the deadline, `None` if the call has no deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Resolves once the call is cancelled. Does not observe the deadline.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.signal.token().cancelled()
    }

    /// A token that is cancelled together with the call, for work the
    /// handler spawns on the call's behalf.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.signal.token().clone()
    }

    /// Adds an outbound header.
    ///
    /// # Errors
    ///
    /// [`Code::ProtocolViolation`](crate::Code::ProtocolViolation) once the
    /// first outbound message has been sent.
    pub fn append_header(&self, key: &str, value: impl Into<String>) -> Result<(), Status> {
        self.shared.append_header(key, value.into())
    }

    #[must_use]
    pub const fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub const fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// The authenticated caller, when an authentication interceptor ran.
    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        self.extensions.get::<Principal>()
    }

    /// Fails unless the authenticated caller holds one of `allowed`.
    ///
    /// # Errors
    ///
    /// [`Code::Unauthenticated`](crate::Code::Unauthenticated) without a
    /// principal, [`Code::PermissionDenied`](crate::Code::PermissionDenied)
    /// if the principal's role is not allowed.
    pub fn require_role<'a, I>(&self, allowed: I) -> Result<&Principal, Status>
    where
        I: IntoIterator<Item = &'a Role>,
    {
        let principal = self
            .principal()
            .ok_or_else(|| Status::unauthenticated("Call has no authenticated principal"))?;
        if allowed.into_iter().any(|role| role == principal.role()) {
            Ok(principal)
        } else {
            Err(Status::permission_denied(format!(
                "Role `{}` may not call {}",
                principal.role(),
                self.method
            )))
        }
    }

    pub(crate) const fn signal(&self) -> &CallSignal {
        &self.signal
    }

    pub(crate) const fn shared(&self) -> &Arc<CallShared> {
        &self.shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct TenantId(u32);

    #[test]
    fn extensions_are_write_once() {
        let mut ext = Extensions::new();
        assert!(ext.insert(TenantId(7)).is_ok());
        assert_eq!(ext.insert(TenantId(8)), Err(TenantId(8)));
        assert_eq!(ext.get::<TenantId>(), Some(&TenantId(7)));
        assert!(ext.get::<String>().is_none());
    }

    #[test]
    fn require_role_checks_principal() {
        let shared = Arc::new(CallShared::new());
        let signal = CallSignal::new(CancellationToken::new(), None);
        let mut ctx = CallContext::new(
            CallId::new(1),
            Arc::from("/inventory.Products/Delete"),
            Pattern::Unary,
            signal,
            Metadata::new(),
            shared,
        );
        let admin = Role::new("admin");
        let viewer = Role::new("viewer");

        let err = ctx.require_role([&admin]).unwrap_err();
        assert_eq!(err.code(), crate::Code::Unauthenticated);

        ctx.extensions_mut()
            .insert(Principal::new("ada", viewer.clone()))
            .unwrap();
        let err = ctx.require_role([&admin]).unwrap_err();
        assert_eq!(err.code(), crate::Code::PermissionDenied);
        assert_eq!(ctx.require_role([&admin, &viewer]).unwrap().subject(), "ada");
    }
}
