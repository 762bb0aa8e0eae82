//! The handlers this server exposes and the chain every call runs through.
//!
//! ## Interceptors, outermost first
//!
//! 1. [`Recovery`] - a panicking handler fails its own call with `INTERNAL`.
//! 2. [`Logging`] - one `call` span and one completion event per call.
//! 3. [`Metrics`] - call counters and durations.
//! 4. [`Authenticator`] - bearer tokens from `AUTH_TOKENS`; methods in
//!    `AUTH_BYPASS` skip it.
//! 5. [`RoleGuard`] - writes need `admin`, reads `admin` or `viewer`.

pub mod products;
pub mod store;
pub mod users;

use crate::server::{config::ServerConfig, metrics::Metrics};
use products::Product;
use std::sync::Arc;
use store::ResourceStore;
use switchyard::{
    Authenticator, CallContext, Dispatcher, Frame, Logging, Recovery, Registry, RoleGuard,
    StaticTokens, Status,
};
use users::User;

/// Liveness probe served through the dispatcher itself.
pub const HEALTH_METHOD: &str = "/switchyard.Health/Check";

async fn health(_ctx: CallContext, _request: Frame) -> Result<Frame, Status> {
    Ok(Frame::text("SERVING"))
}

pub fn build_dispatcher(config: &ServerConfig) -> anyhow::Result<Dispatcher> {
    let tokens: StaticTokens = config
        .tokens
        .iter()
        .map(|grant| (grant.token.clone(), grant.principal.clone()))
        .collect();
    if tokens.is_empty() {
        tracing::warn!("No AUTH_TOKENS configured; only bypassed methods are callable");
    }

    let mut registry = Registry::new();
    registry.unary(HEALTH_METHOD, health)?;
    let guard = store::register(
        &mut registry,
        RoleGuard::new(),
        Arc::new(ResourceStore::<User>::new()),
    )?;
    let guard = store::register(
        &mut registry,
        guard,
        Arc::new(ResourceStore::<Product>::new()),
    )?;

    let dispatcher = Dispatcher::builder()
        .registry(registry)
        .config(config.dispatcher.clone())
        .interceptor(Recovery)
        .interceptor(Logging)
        .interceptor(Metrics)
        .interceptor(Authenticator::new(tokens).with_bypass(config.auth_bypass.iter().cloned()))
        .interceptor(guard)
        .build()?;
    Ok(dispatcher)
}
