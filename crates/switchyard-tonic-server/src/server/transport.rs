//! gRPC transport for dispatcher calls.
//!
//! Every `Invoke` stream is one call. HTTP/2 already multiplexes streams on
//! a connection, so each stream maps onto its own [`ClientCall`] and calls on
//! the same connection never wait on each other.
//!
//! Per stream, a pump task moves envelopes in both directions:
//!
//! - request frames go to [`ClientCall::send`]; the end of the request
//!   stream is the caller's half-close,
//! - response frames are forwarded into a bounded buffer read by tonic,
//! - the terminal status becomes the gRPC status of the stream,
//! - a client that goes away cancels the call.

use crate::server::{
    proto::{
        Envelope, Frame as WireFrame, Open, Pattern as WirePattern, envelope::Kind,
        switchyard_server::Switchyard,
    },
    telemetry::increment_frames_sent,
};
use core::{pin::Pin, time::Duration};
use futures::Stream;
use switchyard::{
    CallOptions, ClientCall, Dispatcher, FORWARDED_FOR, Frame, Metadata, Pattern, Status,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Streaming};
use tracing::Instrument;

const GRPC_TIMEOUT: &str = "grpc-timeout";

type EnvelopeResult = Result<Envelope, tonic::Status>;

#[derive(Clone, Debug)]
pub struct InvokeService {
    dispatcher: Dispatcher,
    stream_buffer: usize,
}

impl InvokeService {
    pub fn new(dispatcher: Dispatcher, stream_buffer: usize) -> Self {
        Self {
            dispatcher,
            stream_buffer: stream_buffer.max(1),
        }
    }

    /// Stops admitting calls and drains the ones in flight.
    pub async fn shutdown(&self) -> Result<(), switchyard::Error> {
        self.dispatcher.shutdown().await
    }
}

#[tonic::async_trait]
impl Switchyard for InvokeService {
    type InvokeStream = Pin<Box<dyn Stream<Item = EnvelopeResult> + Send>>;

    async fn invoke(
        &self,
        request: Request<Streaming<Envelope>>,
    ) -> Result<Response<Self::InvokeStream>, tonic::Status> {
        let mut metadata = Metadata::from_tonic(request.metadata());
        if !metadata.contains_key(FORWARDED_FOR) {
            if let Some(addr) = request.remote_addr() {
                metadata.insert(FORWARDED_FOR, addr.to_string());
            }
        }
        let timeout = metadata.get(GRPC_TIMEOUT).and_then(parse_grpc_timeout);
        let mut inbound = request.into_inner();

        let open = match inbound.message().await? {
            Some(Envelope {
                kind: Some(Kind::Open(open)),
            }) => open,
            Some(_) => return Err(unopened("The first envelope must open the call")),
            None => return Err(unopened("Request stream ended before the call was opened")),
        };
        let pattern = pattern_of(&open)?;

        let mut options = CallOptions::new();
        *options.metadata_mut() = metadata;
        if let Some(timeout) = timeout {
            options = options.with_timeout(timeout);
        }
        let call = self.dispatcher.open(&open.method, pattern, options);

        let span = tracing::debug_span!("invoke", call_id = %call.id(), method = %open.method);
        let (tx, rx) = mpsc::channel(self.stream_buffer);
        tokio::spawn(pump(call, inbound, tx).instrument(span));

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

fn unopened(message: &str) -> tonic::Status {
    Status::protocol_violation(message).into()
}

fn pattern_of(open: &Open) -> Result<Pattern, Status> {
    match open.pattern() {
        WirePattern::Unary => Ok(Pattern::Unary),
        WirePattern::ServerStream => Ok(Pattern::ServerStream),
        WirePattern::ClientStream => Ok(Pattern::ClientStream),
        WirePattern::BidiStream => Ok(Pattern::BidiStream),
        WirePattern::Unspecified => Err(Status::invalid_argument(format!(
            "Call to `{}` does not name a calling pattern",
            open.method
        ))),
    }
}

async fn pump(
    mut call: ClientCall,
    mut inbound: Streaming<Envelope>,
    tx: mpsc::Sender<EnvelopeResult>,
) {
    let mut reading = true;
    loop {
        tokio::select! {
            message = inbound.message(), if reading => match message {
                Ok(Some(Envelope { kind: Some(Kind::Frame(frame)) })) => {
                    if let Err(status) = call.send(Frame::new(frame.tag, frame.payload)) {
                        tracing::debug!(code = %status.code(), "Request frame refused");
                        call.cancel();
                        let _ = tx.send(Err(status.into())).await;
                        return;
                    }
                }
                Ok(Some(_)) => {
                    call.cancel();
                    let status = Status::protocol_violation("Only the first envelope may open");
                    let _ = tx.send(Err(status.into())).await;
                    return;
                }
                Ok(None) => {
                    call.close_send();
                    reading = false;
                }
                Err(err) => {
                    tracing::debug!(error = %err, "Request stream failed");
                    call.cancel();
                    reading = false;
                }
            },
            response = call.receive() => match response {
                Ok(Some(frame)) => {
                    let (tag, payload) = frame.into_parts();
                    let envelope = Envelope {
                        kind: Some(Kind::Frame(WireFrame { tag, payload })),
                    };
                    if tx.send(Ok(envelope)).await.is_err() {
                        call.cancel();
                        return;
                    }
                    increment_frames_sent();
                }
                Ok(None) => return,
                Err(status) => {
                    let _ = tx.send(Err(status.into())).await;
                    return;
                }
            },
            () = tx.closed() => {
                tracing::debug!("Client went away");
                call.cancel();
                return;
            }
        }
    }
}

/// Parses a `grpc-timeout` header value: at most eight digits followed by
/// one of `H`, `M`, `S`, `m`, `u` or `n`.
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    let unit = value.chars().last()?;
    let digits = &value[..value.len() - unit.len_utf8()];
    if digits.is_empty() || digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        'H' => Duration::from_secs(amount * 3_600),
        'M' => Duration::from_secs(amount * 60),
        'S' => Duration::from_secs(amount),
        'm' => Duration::from_millis(amount),
        'u' => Duration::from_micros(amount),
        'n' => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}
