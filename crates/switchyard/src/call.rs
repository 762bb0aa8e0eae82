//! The per-call state machine.
//!
//! A call moves `Initiated → Active → {Completed | Failed | Cancelled}`. The
//! dispatcher creates it in `Initiated`, [`drive`] moves it to `Active` and
//! runs the composed service, and [`settle`] records the single terminal
//! state. Terminal states are final: later transitions are ignored.
//!
//! State that both ends of a call need to observe (the lifecycle phase,
//! outbound headers, a protocol error recorded by the channel) lives in
//! [`CallShared`], guarded by one short-lived lock.

use crate::{
    channel::Shot,
    context::CallContext,
    error::{Status, VIOLATION_KEY},
    metadata::Metadata,
    service::{CallIo, CallService},
};
use core::{fmt, str::FromStr};
use parking_lot::Mutex;
use std::sync::Arc;

/// Identifier of one call, unique within a dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

impl CallId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Shape of the messages exchanged by a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Pattern {
    /// One request, one response.
    Unary,
    /// One request, zero or more responses.
    ServerStream,
    /// Zero or more requests, one response.
    ClientStream,
    /// Zero or more messages in each direction, independently.
    BidiStream,
}

impl Pattern {
    pub const ALL: [Self; 4] = [
        Self::Unary,
        Self::ServerStream,
        Self::ClientStream,
        Self::BidiStream,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unary => "unary",
            Self::ServerStream => "server_stream",
            Self::ClientStream => "client_stream",
            Self::BidiStream => "bidi_stream",
        }
    }

    /// How many frames the caller sends.
    #[must_use]
    pub const fn inbound(self) -> Shot {
        match self {
            Self::Unary | Self::ServerStream => Shot::Single,
            Self::ClientStream | Self::BidiStream => Shot::Multi,
        }
    }

    /// How many frames the handler sends.
    #[must_use]
    pub const fn outbound(self) -> Shot {
        match self {
            Self::Unary | Self::ClientStream => Shot::Single,
            Self::ServerStream | Self::BidiStream => Shot::Multi,
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Pattern {
    type Err = Status;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| Status::protocol_violation(format!("Unknown calling pattern `{s}`")))
    }
}

/// Lifecycle phase of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallState {
    Initiated,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl CallState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    const fn can_advance(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Initiated, Self::Active)
                | (Self::Active, Self::Completed)
                | (Self::Initiated | Self::Active, Self::Failed | Self::Cancelled)
        )
    }
}

#[derive(Debug)]
struct SharedState {
    phase: CallState,
    headers: Metadata,
    headers_frozen: bool,
    recorded: Option<Status>,
    violations: Vec<String>,
}

/// State observed by every participant of one call.
#[derive(Debug)]
pub(crate) struct CallShared {
    inner: Mutex<SharedState>,
}

impl CallShared {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(SharedState {
                phase: CallState::Initiated,
                headers: Metadata::new(),
                headers_frozen: false,
                recorded: None,
                violations: Vec::new(),
            }),
        }
    }

    pub(crate) fn state(&self) -> CallState {
        self.inner.lock().phase
    }

    /// Moves to `next` if the transition is legal. Returns whether it moved.
    pub(crate) fn advance(&self, next: CallState) -> bool {
        let mut inner = self.inner.lock();
        if inner.phase.can_advance(next) {
            tracing::trace!(from = ?inner.phase, to = ?next, "Call state transition");
            inner.phase = next;
            true
        } else {
            false
        }
    }

    /// True once no more outbound frames may be delivered: the call is
    /// terminal or an error has been recorded against it.
    pub(crate) fn is_sealed(&self) -> bool {
        let inner = self.inner.lock();
        inner.phase.is_terminal() || inner.recorded.is_some()
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.inner.lock().phase.is_terminal()
    }

    pub(crate) fn append_header(&self, key: &str, value: String) -> Result<(), Status> {
        let mut inner = self.inner.lock();
        if inner.headers_frozen {
            return Err(Status::protocol_violation(
                "Outbound metadata is frozen once the first message is sent",
            ));
        }
        inner.headers.insert(key, value);
        Ok(())
    }

    pub(crate) fn freeze_headers(&self) {
        self.inner.lock().headers_frozen = true;
    }

    /// True once at least one outbound frame has been handed to the pipe.
    pub(crate) fn responded(&self) -> bool {
        self.inner.lock().headers_frozen
    }

    pub(crate) fn headers(&self) -> Metadata {
        self.inner.lock().headers.clone()
    }

    /// Records a protocol error. The first recorded error wins.
    pub(crate) fn record(&self, status: Status) {
        let mut inner = self.inner.lock();
        if inner.recorded.is_none() {
            inner.recorded = Some(status);
        }
    }

    fn take_recorded(&self) -> Option<Status> {
        self.inner.lock().recorded.take()
    }

    pub(crate) fn note_violation(&self, what: impl Into<String>) {
        self.inner.lock().violations.push(what.into());
    }

    fn take_violations(&self) -> Vec<String> {
        core::mem::take(&mut self.inner.lock().violations)
    }
}

/// Runs a call to completion and returns its terminal status.
///
/// Cancellation and the deadline preempt the service: its future is dropped,
/// which closes every channel end it owned.
pub(crate) async fn drive(
    ctx: CallContext,
    io: CallIo,
    service: Arc<dyn CallService>,
) -> Result<(), Status> {
    let shared = Arc::clone(ctx.shared());
    let signal = ctx.signal().clone();
    let pattern = ctx.pattern();
    shared.advance(CallState::Active);

    let outcome = tokio::select! {
        biased;
        err = signal.interrupted() => Err(Status::from(err)),
        result = service.call(ctx, io) => match result {
            // A handler that returns without closing its outbound direction
            // closes it implicitly, unless an error was recorded first.
            Ok(()) => match shared.take_recorded() {
                Some(status) => Err(status),
                None if pattern.outbound() == Shot::Single && !shared.responded() => Err(
                    Status::protocol_violation("Handler completed without a response"),
                ),
                None => Ok(()),
            },
            Err(status) => Err(status),
        },
    };

    settle(&shared, outcome)
}

/// Moves the call into the terminal state matching `outcome` and attaches
/// any refused late frames to the status as trailing metadata.
pub(crate) fn settle(shared: &CallShared, outcome: Result<(), Status>) -> Result<(), Status> {
    let next = match &outcome {
        Ok(()) => CallState::Completed,
        Err(status) if status.code().is_cancellation() => CallState::Cancelled,
        Err(_) => CallState::Failed,
    };
    shared.advance(next);

    let violations = shared.take_violations();
    outcome.map_err(|mut status| {
        for violation in violations {
            status.metadata_mut().insert(VIOLATION_KEY, violation);
        }
        status
    })
}
