//! Feeds the call instruments from inside the interceptor chain.

use crate::server::telemetry::{
    decrement_calls_inflight, increment_call_errors, increment_calls, increment_calls_inflight,
    record_call_duration,
};
use switchyard::{CallContext, CallIo, Interceptor, Next, Status};
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, Default)]
pub struct Metrics;

/// Keeps `calls_inflight` balanced when the rest of the chain unwinds.
struct Inflight;

impl Inflight {
    fn enter() -> Self {
        increment_calls_inflight();
        Self
    }
}

impl Drop for Inflight {
    fn drop(&mut self) {
        decrement_calls_inflight();
    }
}

#[tonic::async_trait]
impl Interceptor for Metrics {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn intercept(&self, ctx: CallContext, io: CallIo, next: Next) -> Result<(), Status> {
        increment_calls();
        let _inflight = Inflight::enter();
        let start = Instant::now();

        let outcome = next.proceed(ctx, io).await;

        record_call_duration(start.elapsed().as_secs_f64() * 1_000.0);
        if let Err(status) = &outcome {
            increment_call_errors(status.code().as_str());
        }
        outcome
    }
}
