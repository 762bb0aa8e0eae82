//! The terminal handler seam and its per-pattern adapters.
//!
//! Everything that runs a call, whether an interceptor layer or a business
//! handler, is a [`CallService`]: it consumes the call's context and its two
//! channel ends and returns the call's outcome. Business handlers are
//! usually written against one of the pattern-shaped adapters below, which
//! enforce the message counts of their pattern.

use crate::{
    call::Pattern,
    channel::{FrameReceiver, FrameSender},
    context::CallContext,
    error::Status,
    frame::Frame,
};
use core::{fmt, future::Future};

/// The serving side's two channel ends of one call.
#[derive(Debug)]
pub struct CallIo {
    /// Frames sent by the caller.
    pub inbound: FrameReceiver,
    /// Frames for the caller.
    pub outbound: FrameSender,
}

/// Runs one call to completion.
#[tonic::async_trait]
pub trait CallService: Send + Sync + 'static {
    async fn call(&self, ctx: CallContext, io: CallIo) -> Result<(), Status>;
}

/// One request, one response.
pub struct Unary<F>(pub F);

/// One request, a stream of responses written to a [`FrameSender`].
pub struct ServerStreaming<F>(pub F);

/// A stream of requests read from a [`FrameReceiver`], one response.
pub struct ClientStreaming<F>(pub F);

/// Independent streams in both directions.
pub struct BidiStreaming<F>(pub F);

macro_rules! adapter_debug {
    ($($adapter:ident => $pattern:ident),* $(,)?) => {
        $(
            impl<F> fmt::Debug for $adapter<F> {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.debug_tuple(stringify!($adapter)).finish_non_exhaustive()
                }
            }

            impl<F> $adapter<F> {
                pub const PATTERN: Pattern = Pattern::$pattern;
            }
        )*
    };
}

adapter_debug! {
    Unary => Unary,
    ServerStreaming => ServerStream,
    ClientStreaming => ClientStream,
    BidiStreaming => BidiStream,
}

#[tonic::async_trait]
impl<F, Fut> CallService for Unary<F>
where
    F: Fn(CallContext, Frame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Frame, Status>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, io: CallIo) -> Result<(), Status> {
        let CallIo {
            mut inbound,
            mut outbound,
        } = io;
        let request = inbound.receive_one().await?;
        let response = (self.0)(ctx, request).await?;
        outbound.send(response)?;
        outbound.close_send();
        Ok(())
    }
}

#[tonic::async_trait]
impl<F, Fut> CallService for ServerStreaming<F>
where
    F: Fn(CallContext, Frame, FrameSender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, io: CallIo) -> Result<(), Status> {
        let CallIo {
            mut inbound,
            outbound,
        } = io;
        let request = inbound.receive_one().await?;
        (self.0)(ctx, request, outbound).await
    }
}

#[tonic::async_trait]
impl<F, Fut> CallService for ClientStreaming<F>
where
    F: Fn(CallContext, FrameReceiver) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Frame, Status>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, io: CallIo) -> Result<(), Status> {
        let CallIo {
            inbound,
            mut outbound,
        } = io;
        let response = (self.0)(ctx, inbound).await?;
        outbound.send(response)?;
        outbound.close_send();
        Ok(())
    }
}

#[tonic::async_trait]
impl<F, Fut> CallService for BidiStreaming<F>
where
    F: Fn(CallContext, FrameReceiver, FrameSender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, io: CallIo) -> Result<(), Status> {
        (self.0)(ctx, io.inbound, io.outbound).await
    }
}
