#![doc = include_str!("../README.md")]

mod call;
mod channel;
mod client;
mod config;
mod context;
mod dispatcher;
mod error;
mod frame;
pub mod interceptor;
mod metadata;
mod registry;
mod service;

pub use crate::call::*;
pub use crate::channel::*;
pub use crate::client::*;
pub use crate::config::*;
pub use crate::context::*;
pub use crate::dispatcher::*;
pub use crate::error::*;
pub use crate::frame::*;
pub use crate::interceptor::{
    Chain, Interceptor, Next, from_fn,
    auth::{Authenticator, Principal, Role, RoleGuard, StaticTokens, TokenResolver},
    logging::Logging,
    recovery::Recovery,
};
pub use crate::metadata::*;
pub use crate::registry::*;
pub use crate::service::*;

#[cfg(test)]
mod tests;
