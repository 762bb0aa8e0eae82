//! Structured per-call logging.
//!
//! Opens one `call` span for the duration of the call, tags the call with an
//! `x-call-id` outbound header, and emits a single completion event whose
//! level follows the outcome: `info` on success, `warn` for caller-side
//! failures and cancellations, `error` otherwise.

use super::{Interceptor, Next};
use crate::{
    context::CallContext,
    error::{Code, Status},
    metadata::CALL_ID,
    service::CallIo,
};
use tokio::time::Instant;
use tracing::Instrument;

#[derive(Clone, Copy, Debug, Default)]
pub struct Logging;

#[tonic::async_trait]
impl Interceptor for Logging {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn intercept(&self, ctx: CallContext, io: CallIo, next: Next) -> Result<(), Status> {
        let span = tracing::info_span!(
            "call",
            call_id = %ctx.id(),
            method = %ctx.method(),
            pattern = %ctx.pattern(),
            peer = ctx.peer().unwrap_or("-"),
        );
        if let Err(err) = ctx.append_header(CALL_ID, ctx.id().to_string()) {
            tracing::debug!(parent: &span, error = %err, "Outbound metadata already frozen");
        }

        async move {
            let start = Instant::now();
            tracing::debug!("Call started");
            let outcome = next.proceed(ctx, io).await;
            let elapsed_ms = start.elapsed().as_secs_f64() * 1_000.0;

            match &outcome {
                Ok(()) => tracing::info!(code = "ok", elapsed_ms, "Call completed"),
                Err(status) if status.code() == Code::Internal => tracing::error!(
                    code = %status.code(),
                    message = status.message(),
                    elapsed_ms,
                    "Call failed"
                ),
                Err(status) => tracing::warn!(
                    code = %status.code(),
                    message = status.message(),
                    elapsed_ms,
                    "Call failed"
                ),
            }
            outcome
        }
        .instrument(span)
        .await
    }
}
