//! Panic recovery.
//!
//! Meant to be declared first so it wraps everything else. A panic raised by
//! any inner interceptor or the handler unwinds to here, the call's channel
//! ends are dropped on the way (closing both directions), and the call ends
//! with an `Internal` status. Other calls are unaffected.

use super::{Interceptor, Next};
use crate::{context::CallContext, error::Status, service::CallIo};
use core::any::Any;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;

#[derive(Clone, Copy, Debug, Default)]
pub struct Recovery;

#[tonic::async_trait]
impl Interceptor for Recovery {
    fn name(&self) -> &'static str {
        "recovery"
    }

    async fn intercept(&self, ctx: CallContext, io: CallIo, next: Next) -> Result<(), Status> {
        let call_id = ctx.id();
        let method = ctx.method().to_string();

        match AssertUnwindSafe(next.proceed(ctx, io)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                tracing::error!(
                    call_id = %call_id,
                    method = %method,
                    panic = panic_message(panic.as_ref()),
                    "Recovered from panic in call handling"
                );
                Err(Status::internal("Internal error while handling the call"))
            }
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}
