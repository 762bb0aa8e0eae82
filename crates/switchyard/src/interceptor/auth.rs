//! Bearer-token authentication and role checks.
//!
//! [`Authenticator`] resolves the `authorization` header into a
//! [`Principal`] and stores it in the call's extensions before the rest of
//! the chain runs. Methods on its bypass list skip it entirely. [`RoleGuard`]
//! is the narrower check that sits inside it and fails with
//! `PermissionDenied` when the caller's role is not allowed for a method.

use super::{Interceptor, Next};
use crate::{
    context::CallContext,
    error::Status,
    metadata::{AUTHORIZATION, Metadata},
    service::CallIo,
};
use core::fmt;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

/// Permission class of a caller.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Role(Arc<str>);

impl Role {
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Role {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Resolved identity of an authenticated caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    subject: String,
    role: Role,
}

impl Principal {
    #[must_use]
    pub fn new(subject: impl Into<String>, role: Role) -> Self {
        Self {
            subject: subject.into(),
            role,
        }
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[must_use]
    pub const fn role(&self) -> &Role {
        &self.role
    }
}

/// Maps a presented token to the principal it identifies.
pub trait TokenResolver: Send + Sync + 'static {
    fn resolve(&self, token: &str) -> Option<Principal>;
}

impl<F> TokenResolver for F
where
    F: Fn(&str) -> Option<Principal> + Send + Sync + 'static,
{
    fn resolve(&self, token: &str) -> Option<Principal> {
        self(token)
    }
}

/// A fixed token table.
#[derive(Clone, Debug, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, Principal>,
}

impl StaticTokens {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the principal for `token`.
    pub fn insert(&mut self, token: impl Into<String>, principal: Principal) -> &mut Self {
        self.tokens.insert(token.into(), principal);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl TokenResolver for StaticTokens {
    fn resolve(&self, token: &str) -> Option<Principal> {
        self.tokens.get(token).cloned()
    }
}

impl<T: Into<String>> FromIterator<(T, Principal)> for StaticTokens {
    fn from_iter<I: IntoIterator<Item = (T, Principal)>>(iter: I) -> Self {
        Self {
            tokens: iter.into_iter().map(|(t, p)| (t.into(), p)).collect(),
        }
    }
}

/// Authenticates callers from a bearer token in inbound metadata.
pub struct Authenticator {
    key: &'static str,
    scheme: String,
    resolver: Arc<dyn TokenResolver>,
    bypass: HashSet<String>,
}

impl Authenticator {
    pub const DEFAULT_SCHEME: &'static str = "Bearer ";

    pub fn new(resolver: impl TokenResolver) -> Self {
        Self {
            key: AUTHORIZATION,
            scheme: Self::DEFAULT_SCHEME.to_string(),
            resolver: Arc::new(resolver),
            bypass: HashSet::new(),
        }
    }

    /// Lets `methods` through without any credentials.
    #[must_use]
    pub fn with_bypass<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bypass.extend(methods.into_iter().map(Into::into));
        self
    }

    /// Replaces the required credential prefix, `Bearer ` by default.
    #[must_use]
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    #[must_use]
    pub fn bypasses(&self, method: &str) -> bool {
        self.bypass.contains(method)
    }

    /// Resolves the caller's principal from `metadata`.
    ///
    /// # Errors
    ///
    /// `Unauthenticated` if the header is missing, does not start with the
    /// scheme, carries an empty token, or the token is not recognized.
    pub fn authenticate(&self, metadata: &Metadata) -> Result<Principal, Status> {
        let value = metadata
            .get(self.key)
            .ok_or_else(|| Status::unauthenticated("Missing authorization metadata"))?;
        let token = value
            .strip_prefix(self.scheme.as_str())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Status::unauthenticated("Malformed authorization metadata"))?;
        self.resolver
            .resolve(token)
            .ok_or_else(|| Status::unauthenticated("Invalid token"))
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("key", &self.key)
            .field("scheme", &self.scheme)
            .field("bypass", &self.bypass)
            .finish_non_exhaustive()
    }
}

#[tonic::async_trait]
impl Interceptor for Authenticator {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn intercept(&self, mut ctx: CallContext, io: CallIo, next: Next) -> Result<(), Status> {
        if self.bypasses(ctx.method()) {
            return next.proceed(ctx, io).await;
        }

        let principal = self.authenticate(ctx.metadata()).inspect_err(|e| {
            tracing::debug!(call_id = %ctx.id(), method = ctx.method(), reason = e.message(), "Authentication failed");
        })?;
        tracing::trace!(subject = principal.subject(), role = %principal.role(), "Authenticated");
        if ctx.extensions_mut().insert(principal).is_err() {
            return Err(Status::internal("Principal was already set for this call"));
        }
        next.proceed(ctx, io).await
    }
}

/// Per-method role requirements. Methods without an entry pass through.
#[derive(Clone, Debug, Default)]
pub struct RoleGuard {
    rules: HashMap<String, Vec<Role>>,
}

impl RoleGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts `method` to callers holding one of `roles`.
    #[must_use]
    pub fn allow<I, R>(mut self, method: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Role>,
    {
        self.rules
            .entry(method.into())
            .or_default()
            .extend(roles.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn roles_for(&self, method: &str) -> Option<&[Role]> {
        self.rules.get(method).map(Vec::as_slice)
    }
}

#[tonic::async_trait]
impl Interceptor for RoleGuard {
    fn name(&self) -> &'static str {
        "role_guard"
    }

    async fn intercept(&self, ctx: CallContext, io: CallIo, next: Next) -> Result<(), Status> {
        if let Some(roles) = self.roles_for(ctx.method()) {
            ctx.require_role(roles)?;
        }
        next.proceed(ctx, io).await
    }
}
