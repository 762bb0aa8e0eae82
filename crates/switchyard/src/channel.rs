//! Ordered, directional frame pipes underlying every call.
//!
//! Each call owns two pipes: inbound (caller to handler) and outbound
//! (handler to caller). A pipe is either single-shot (exactly one frame) or
//! multi-shot (any number of frames until closed), as fixed by the call's
//! [`Pattern`](crate::Pattern).
//!
//! Pipes are unbounded until closed, so `send` never waits. `receive` waits
//! for the next frame, the close signal, or the call being interrupted by
//! cancellation or its deadline, whichever comes first.

use crate::{call::CallShared, error::Status, frame::Frame};
use futures::Stream;
use std::sync::Arc;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

/// Failure of a single channel operation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The sending direction was already closed.
    #[error("Channel closed for sending")]
    Closed,

    /// The operation breaks the call's framing contract.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The call was cancelled, or the peer went away.
    #[error("Call cancelled")]
    Cancelled,

    /// The call's deadline passed.
    #[error("Call deadline exceeded")]
    DeadlineExceeded,
}

impl From<ChannelError> for Status {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Closed => Self::protocol_violation("Frame sent after close"),
            ChannelError::ProtocolViolation(reason) => Self::protocol_violation(reason),
            ChannelError::Cancelled => Self::cancelled("Call was cancelled"),
            ChannelError::DeadlineExceeded => Self::deadline_exceeded("Call deadline exceeded"),
        }
    }
}

/// How many frames a direction carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Shot {
    Single,
    Multi,
}

/// Which way frames flow on a pipe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Caller to handler.
    Inbound,
    /// Handler to caller.
    Outbound,
}

/// Cancellation and deadline of one call, shared by everything that may
/// suspend on its behalf.
#[derive(Clone, Debug)]
pub struct CallSignal {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallSignal {
    #[must_use]
    pub const fn new(cancel: CancellationToken, deadline: Option<Instant>) -> Self {
        Self { cancel, deadline }
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fails if the call has already been interrupted.
    ///
    /// # Errors
    ///
    /// [`ChannelError::DeadlineExceeded`] once the deadline has passed,
    /// otherwise [`ChannelError::Cancelled`] if the token was cancelled.
    pub fn check(&self) -> Result<(), ChannelError> {
        if self.deadline_passed() {
            Err(ChannelError::DeadlineExceeded)
        } else if self.cancel.is_cancelled() {
            Err(ChannelError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when the call is cancelled or its deadline passes.
    pub async fn interrupted(&self) -> ChannelError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                () = self.cancel.cancelled() => {
                    if self.deadline_passed() {
                        ChannelError::DeadlineExceeded
                    } else {
                        ChannelError::Cancelled
                    }
                }
                () = tokio::time::sleep_until(deadline) => ChannelError::DeadlineExceeded,
            },
            None => {
                self.cancel.cancelled().await;
                ChannelError::Cancelled
            }
        }
    }
}

/// Creates one direction of a call.
///
/// Only the inbound receiver observes the call signal: the handler must be
/// woken by cancellation, while the caller races the outbound pipe against
/// the terminal status.
pub(crate) fn stream_channel(
    shot: Shot,
    direction: Direction,
    signal: CallSignal,
    shared: Arc<CallShared>,
) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let receiver_signal = match direction {
        Direction::Inbound => Some(signal.clone()),
        Direction::Outbound => None,
    };
    (
        FrameSender {
            tx: Some(tx),
            shot,
            direction,
            sent: 0,
            signal,
            shared,
        },
        FrameReceiver {
            rx,
            signal: receiver_signal,
            received: 0,
        },
    )
}

/// Sending end of one direction.
#[derive(Debug)]
pub struct FrameSender {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    shot: Shot,
    direction: Direction,
    sent: u64,
    signal: CallSignal,
    shared: Arc<CallShared>,
}

impl FrameSender {
    /// Appends a frame to this direction.
    ///
    /// On the outbound direction the first successful send freezes the
    /// call's outbound metadata, and any framing violation is recorded
    /// against the call so that it becomes the terminal status even if the
    /// handler ignores this error.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Closed`] after [`close_send`](Self::close_send).
    /// - [`ChannelError::ProtocolViolation`] for a second frame on a
    ///   single-shot direction, or a frame after the call reached a terminal
    ///   status.
    /// - [`ChannelError::Cancelled`] / [`ChannelError::DeadlineExceeded`]
    ///   once the call was interrupted or the receiving end is gone. These
    ///   take precedence over the other errors.
    pub fn send(&mut self, frame: Frame) -> Result<(), ChannelError> {
        self.signal.check()?;

        let sealed = match self.direction {
            Direction::Outbound => self.shared.is_sealed(),
            Direction::Inbound => self.shared.is_terminal(),
        };
        if sealed {
            let err = ChannelError::ProtocolViolation(
                "Frame sent after the call reached a terminal status".to_string(),
            );
            self.shared.note_violation(err.to_string());
            return Err(err);
        }

        let Some(tx) = self.tx.as_ref() else {
            return Err(self.violation(ChannelError::Closed));
        };
        if self.shot == Shot::Single && self.sent > 0 {
            return Err(self.violation(ChannelError::ProtocolViolation(
                "Single-shot direction accepts exactly one frame".to_string(),
            )));
        }

        if self.direction == Direction::Outbound {
            self.shared.freeze_headers();
        }
        if tx.send(frame).is_err() {
            return Err(ChannelError::Cancelled);
        }
        self.sent += 1;
        Ok(())
    }

    /// Marks this direction closed. Idempotent.
    pub fn close_send(&mut self) {
        if self.tx.take().is_some() {
            tracing::trace!(direction = ?self.direction, sent = self.sent, "Direction closed");
        }
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.tx.is_none()
    }

    /// Number of frames sent so far.
    #[must_use]
    pub const fn sent(&self) -> u64 {
        self.sent
    }

    fn violation(&self, err: ChannelError) -> ChannelError {
        if self.direction == Direction::Outbound {
            self.shared.record(err.clone().into());
        }
        err
    }
}

/// Receiving end of one direction.
#[derive(Debug)]
pub struct FrameReceiver {
    rx: mpsc::UnboundedReceiver<Frame>,
    signal: Option<CallSignal>,
    received: u64,
}

impl FrameReceiver {
    /// Waits for the next frame.
    ///
    /// Returns `Ok(None)` once the sender closed its direction and every
    /// frame sent before the close has been received.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Cancelled`] or [`ChannelError::DeadlineExceeded`] if
    /// the call is interrupted before a frame arrives.
    pub async fn receive(&mut self) -> Result<Option<Frame>, ChannelError> {
        let frame = match &self.signal {
            Some(signal) => {
                signal.check()?;
                tokio::select! {
                    biased;
                    err = signal.interrupted() => return Err(err),
                    frame = self.rx.recv() => frame,
                }
            }
            None => self.rx.recv().await,
        };
        if frame.is_some() {
            self.received += 1;
        }
        Ok(frame)
    }

    /// Takes a frame that is already buffered, without waiting.
    pub(crate) fn try_receive(&mut self) -> Option<Frame> {
        let frame = self.rx.try_recv().ok()?;
        self.received += 1;
        Some(frame)
    }

    /// Receives exactly one frame followed by the close signal.
    ///
    /// # Errors
    ///
    /// [`ChannelError::ProtocolViolation`] if the direction closes without a
    /// frame or carries more than one, plus the errors of
    /// [`receive`](Self::receive).
    pub async fn receive_one(&mut self) -> Result<Frame, ChannelError> {
        let frame = self.receive().await?.ok_or_else(|| {
            ChannelError::ProtocolViolation("Expected one message, stream closed empty".to_string())
        })?;
        match self.receive().await? {
            None => Ok(frame),
            Some(_) => Err(ChannelError::ProtocolViolation(
                "Expected one message, received more".to_string(),
            )),
        }
    }

    /// Number of frames received so far.
    #[must_use]
    pub const fn received(&self) -> u64 {
        self.received
    }

    /// Adapts the receiver into a stream that ends after the close signal or
    /// the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Frame, ChannelError>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut receiver = state?;
            match receiver.receive().await {
                Ok(Some(frame)) => Some((Ok(frame), Some(receiver))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}
