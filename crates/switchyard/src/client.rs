//! The caller's side of a call.
//!
//! [`ClientCall`] is the stream handle for every pattern: `send` and
//! `close_send` drive the inbound direction, `receive` reads the outbound
//! one, and `finish` yields the single terminal status. [`Connection`]
//! layers the per-pattern conveniences on top and stamps its own metadata on
//! every call it opens.

use crate::{
    call::{CallId, CallShared, Pattern},
    channel::{ChannelError, FrameReceiver, FrameSender, Shot},
    dispatcher::Dispatcher,
    error::{Code, Status, VIOLATION_KEY},
    frame::Frame,
    metadata::Metadata,
};
use core::time::Duration;
use futures::Stream;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Per-call settings supplied by the caller.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    metadata: Metadata,
    timeout: Option<Duration>,
}

impl CallOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// Bounds the call. Without a timeout the dispatcher's default applies.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub const fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn into_parts(self) -> (Metadata, Option<Duration>) {
        (self.metadata, self.timeout)
    }
}

pub(crate) type StatusReceiver = oneshot::Receiver<Result<(), Status>>;

fn abandoned() -> Status {
    Status::cancelled("Call was abandoned by the dispatcher")
}

enum Event {
    Frame(Result<Option<Frame>, ChannelError>),
    Settled(Result<(), Status>),
}

/// Handle to one in-flight call.
///
/// Dropping the handle before the call reaches its terminal status cancels
/// the call.
#[derive(Debug)]
pub struct ClientCall {
    id: CallId,
    method: Arc<str>,
    pattern: Pattern,
    requests: FrameSender,
    responses: FrameReceiver,
    held: Option<Frame>,
    status: Option<StatusReceiver>,
    terminal: Option<Result<(), Status>>,
    token: CancellationToken,
    shared: Arc<CallShared>,
}

impl ClientCall {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: CallId,
        method: Arc<str>,
        pattern: Pattern,
        requests: FrameSender,
        responses: FrameReceiver,
        status: StatusReceiver,
        token: CancellationToken,
        shared: Arc<CallShared>,
    ) -> Self {
        Self {
            id,
            method,
            pattern,
            requests,
            responses,
            held: None,
            status: Some(status),
            terminal: None,
            token,
            shared,
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

    /// Sends one request frame.
    ///
    /// # Errors
    ///
    /// `Cancelled`/`DeadlineExceeded` once the call was interrupted, and
    /// `ProtocolViolation` for a frame after `close_send`, a second frame on
    /// a single-request pattern, or a frame after the terminal status. A
    /// frame refused because the call already failed returns the terminal
    /// status instead, tagged with the refusal.
    pub fn send(&mut self, frame: Frame) -> Result<(), Status> {
        let Err(err) = self.requests.send(frame) else {
            return Ok(());
        };
        let refused = Status::from(err);
        if refused.code() != Code::ProtocolViolation {
            return Err(refused);
        }
        match self.poll_terminal() {
            Some(Err(status)) => {
                status.metadata_mut().insert(VIOLATION_KEY, refused.message());
                Err(status.clone())
            }
            _ => Err(refused),
        }
    }

    /// Signals that no more requests follow. Idempotent.
    pub fn close_send(&mut self) {
        self.requests.close_send();
    }

    /// Waits for the next response frame.
    ///
    /// Returns `Ok(None)` once the handler's direction is closed and the
    /// call succeeded. Returns as soon as the call settles, even if the
    /// handler left a sender alive. On single-response patterns the frame is
    /// released only together with a successful terminal status. Cancel-safe:
    /// it can be raced in `tokio::select!` without losing frames or the
    /// terminal status.
    ///
    /// # Errors
    ///
    /// The call's terminal status if it failed.
    pub async fn receive(&mut self) -> Result<Option<Frame>, Status> {
        if self.pattern.outbound() == Shot::Multi {
            return self.next_frame().await;
        }
        if self.held.is_none() {
            match self.next_frame().await? {
                Some(frame) => self.held = Some(frame),
                None => return Ok(None),
            }
        }
        self.finish().await?;
        Ok(self.held.take())
    }

    /// The next outbound frame, or the terminal status once the pipe is
    /// drained. Frames buffered before the call settled are still delivered.
    async fn next_frame(&mut self) -> Result<Option<Frame>, Status> {
        if self.terminal.is_none() {
            if let Some(rx) = self.status.as_mut() {
                let event = tokio::select! {
                    biased;
                    frame = self.responses.receive() => Event::Frame(frame),
                    outcome = rx => Event::Settled(outcome.unwrap_or_else(|_| Err(abandoned()))),
                };
                match event {
                    Event::Frame(Ok(Some(frame))) => return Ok(Some(frame)),
                    Event::Frame(Ok(None)) => return self.finish().await.map(|()| None),
                    Event::Frame(Err(err)) => return Err(err.into()),
                    Event::Settled(outcome) => {
                        self.status = None;
                        self.terminal = Some(outcome);
                    }
                }
            }
        }
        match self.responses.try_receive() {
            Some(frame) => Ok(Some(frame)),
            None => self.finish().await.map(|()| None),
        }
    }

    /// Waits for the terminal status. Repeated calls return the same status.
    ///
    /// Cancel-safe, like [`receive`](Self::receive).
    ///
    /// # Errors
    ///
    /// The call's terminal status if it failed.
    pub async fn finish(&mut self) -> Result<(), Status> {
        if let Some(terminal) = &self.terminal {
            return terminal.clone();
        }
        // Awaited through a reference so that a dropped `finish` future
        // leaves the receiver in place.
        let outcome = match self.status.as_mut() {
            Some(rx) => rx.await.unwrap_or_else(|_| Err(abandoned())),
            None => Err(abandoned()),
        };
        self.status = None;
        self.terminal = Some(outcome.clone());
        outcome
    }

    /// Closes the request direction and waits for the single response.
    ///
    /// A response is returned only with a successful terminal status, so a
    /// message and an error are never both observed.
    ///
    /// # Errors
    ///
    /// The call's terminal status if it failed, or `ProtocolViolation` if it
    /// succeeded without a response.
    pub async fn close_and_receive(&mut self) -> Result<Frame, Status> {
        self.close_send();
        let response = self.receive().await?;
        self.finish().await?;
        response.ok_or_else(|| Status::protocol_violation("Call completed without a response"))
    }

    /// Cancels the call. Pending operations on both sides unblock with
    /// `Cancelled`.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A token that cancels this call, usable while the handle is borrowed
    /// or moved elsewhere.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Outbound metadata set by the serving side. Complete once the first
    /// response frame was received or the call finished.
    #[must_use]
    pub fn headers(&self) -> Metadata {
        self.shared.headers()
    }

    /// Adapts the response direction into a stream that ends after the last
    /// frame of a successful call, or with the terminal error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Frame, Status>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut call = state?;
            match call.receive().await {
                Ok(Some(frame)) => Some((Ok(frame), Some(call))),
                Ok(None) => None,
                Err(status) => Some((Err(status), None)),
            }
        })
    }

    fn poll_terminal(&mut self) -> Option<&mut Result<(), Status>> {
        if self.terminal.is_none() {
            if let Some(outcome) = self.status.as_mut().and_then(|rx| rx.try_recv().ok()) {
                self.terminal = Some(outcome);
                self.status = None;
            }
        }
        self.terminal.as_mut()
    }
}

impl Drop for ClientCall {
    fn drop(&mut self) {
        if !self.shared.is_terminal() {
            tracing::trace!(call_id = %self.id, "Call handle dropped before completion");
            self.token.cancel();
        }
    }
}

/// A logical connection to a [`Dispatcher`], multiplexing any number of
/// concurrent calls.
#[derive(Clone, Debug)]
pub struct Connection {
    dispatcher: Dispatcher,
    metadata: Metadata,
}

impl Connection {
    pub(crate) const fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            metadata: Metadata::new(),
        }
    }

    /// Attaches `key: value` to every call opened on this connection.
    #[must_use]
    pub fn with_metadata(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Opens a call of any pattern.
    #[must_use]
    pub fn open(&self, method: &str, pattern: Pattern, mut options: CallOptions) -> ClientCall {
        options.metadata_mut().merge(&self.metadata);
        self.dispatcher.open(method, pattern, options)
    }

    /// Sends one request and waits for its response.
    ///
    /// # Errors
    ///
    /// The call's terminal status if it failed.
    pub async fn unary(
        &self,
        method: &str,
        request: Frame,
        options: CallOptions,
    ) -> Result<Frame, Status> {
        let mut call = self.open(method, Pattern::Unary, options);
        call.send(request)?;
        call.close_and_receive().await
    }

    /// Sends one request and returns the handle to read responses from.
    ///
    /// # Errors
    ///
    /// The call's terminal status if it failed before the request was
    /// accepted.
    pub fn server_streaming(
        &self,
        method: &str,
        request: Frame,
        options: CallOptions,
    ) -> Result<ClientCall, Status> {
        let mut call = self.open(method, Pattern::ServerStream, options);
        call.send(request)?;
        call.close_send();
        Ok(call)
    }

    /// Opens a streamed-request call; finish it with
    /// [`ClientCall::close_and_receive`].
    #[must_use]
    pub fn client_streaming(&self, method: &str, options: CallOptions) -> ClientCall {
        self.open(method, Pattern::ClientStream, options)
    }

    /// Opens a call with independent streams in both directions.
    #[must_use]
    pub fn bidi_streaming(&self, method: &str, options: CallOptions) -> ClientCall {
        self.open(method, Pattern::BidiStream, options)
    }
}
