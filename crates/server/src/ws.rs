//! The WebSocket session protocol.
//!
//! Framing: text frames carry payload in both directions (client text is
//! process input, process output goes back as text). Binary frames from the
//! client are control: the first one is the [`CallMessage`], later ones are
//! [`SignalMessage`]s. The server emits exactly one binary frame, the
//! terminal [`ResultMessage`], followed by a graceful close. Other message
//! types are ignored.

use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{FutureExt, SinkExt, StreamExt};
use http::request::Parts;
use pow_proto::{
    CallMessage, CancelCause, Context, Handler, ResultMessage, Signal, SignalMessage, SUBPROTOCOL,
};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt, SimplexStream, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::{CancellationToken, PollSender};
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::session::{panic_message, PIPE_CAPACITY};

/// Capacity of the text-frame input channel; should be > 1 so a `close`
/// signal can flush frames already enqueued ahead of it.
const MESSAGE_BUFFER_SIZE: usize = 5;

/// How long the client has to send the initial call frame.
const READ_CALL_TIMEOUT: Duration = Duration::from_secs(1);

/// Does the request ask for a WebSocket upgrade?
pub(crate) fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = headers
        .get(header::CONNECTION)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    upgrade && connection
}

fn offers_subprotocol(headers: &HeaderMap) -> bool {
    headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(',').any(|token| token.trim() == SUBPROTOCOL))
        .unwrap_or(false)
}

pub(crate) struct WsTransport {
    state: Arc<WsState>,
}

pub(crate) struct WsState {
    handler: Arc<dyn Handler>,
    /// Parent scope of every connection; cancelled on shutdown.
    scope: Context,
    tracker: TaskTracker,
}

impl WsTransport {
    pub(crate) fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            state: Arc::new(WsState {
                handler,
                scope: Context::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub(crate) fn state(&self) -> Arc<WsState> {
        Arc::clone(&self.state)
    }

    /// Cancel every live connection and wait for their protocol lanes to
    /// finish.
    pub(crate) async fn shutdown(&self) {
        self.state
            .scope
            .cancel(CancelCause::Other("server closing".into()));
        self.state.tracker.close();
        self.state.tracker.wait().await;
    }
}

/// Accept (or refuse) an upgrade and drive the session protocol over the
/// connection.
pub(crate) fn handle_upgrade(
    state: Arc<WsState>,
    parts: Parts,
    upgrade: WebSocketUpgrade,
) -> Response {
    if !offers_subprotocol(&parts.headers) {
        return (
            StatusCode::BAD_REQUEST,
            format!("only support subprotocol {SUBPROTOCOL:?}"),
        )
            .into_response();
    }

    let tracker = state.tracker.clone();
    upgrade
        .protocols([SUBPROTOCOL])
        .on_upgrade(move |socket| tracker.track_future(serve(state, parts, socket)))
}

async fn serve(state: Arc<WsState>, parts: Parts, socket: WebSocket) {
    let negotiated = socket
        .protocol()
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    if negotiated.as_deref() != Some(SUBPROTOCOL) {
        // the front is required to refuse mismatched upgrades before we ever
        // see the connection
        panic!("websocket subprotocol not enforced");
    }

    let (ws_tx, ws_rx) = socket.split();
    let ctx = state.scope.child();
    let done = CancellationToken::new();

    let (input_tx, input_rx) = mpsc::channel::<Option<Bytes>>(MESSAGE_BUFFER_SIZE);
    let (call_tx, call_rx) = oneshot::channel::<Bytes>();
    let (out_tx, out_rx) = mpsc::channel::<Message>(1);

    let writer = tokio::spawn(write_loop(ws_tx, out_rx));
    let reader = tokio::spawn(read_loop(
        ws_rx,
        input_tx,
        call_tx,
        ctx.clone(),
        state.scope.clone(),
        done.clone(),
    ));

    let (value, error, forwarder) =
        run_call(&state, &parts, &ctx, call_rx, input_rx, out_tx.clone()).await;

    // termination: exactly one binary result frame (unless the client is
    // gone), then a graceful close, then every lane is joined
    ctx.cancel(CancelCause::HandlerReturn);

    let client_gone = ctx.cause() == Some(CancelCause::ClientGone);
    if !client_gone {
        let result = ResultMessage::from_outcome(value, error.as_deref());
        if let Ok(encoded) = serde_json::to_vec(&result) {
            let _ = out_tx.send(Message::Binary(encoded.into())).await;
        }
    }
    let _ = out_tx
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        })))
        .await;
    drop(out_tx);
    done.cancel();

    let _ = writer.await;
    let _ = reader.await;
    if let Some(forwarder) = forwarder {
        let _ = forwarder.await;
    }
}

/// Wait for the call frame, resolve the process, wire up its I/O, and run it
/// to completion. Returns the captured `(value, error)` pair and the input
/// forwarder lane, if it was started.
async fn run_call(
    state: &Arc<WsState>,
    parts: &Parts,
    ctx: &Context,
    call_rx: oneshot::Receiver<Bytes>,
    input_rx: mpsc::Receiver<Option<Bytes>>,
    out_tx: mpsc::Sender<Message>,
) -> (
    Option<Value>,
    Option<String>,
    Option<tokio::task::JoinHandle<()>>,
) {
    let call: CallMessage = match timeout(READ_CALL_TIMEOUT, call_rx).await {
        Err(_) => return (None, Some(CancelCause::Timeout.to_string()), None),
        Ok(Err(_)) => {
            // the reader lane went away before the first binary frame
            let cause = ctx.cause().unwrap_or(CancelCause::ProtocolError);
            return (None, Some(cause.to_string()), None);
        }
        Ok(Ok(body)) => match serde_json::from_slice(&body) {
            Ok(call) => call,
            Err(_) => return (None, Some(CancelCause::ProtocolError.to_string()), None),
        },
    };

    let process = match state.handler.get(parts, &call.call, &call.params).await {
        Ok(process) => process,
        Err(err) => return (None, Some(format!("failed to get process: {err}")), None),
    };

    let (pipe_rd, pipe_wr) = tokio::io::simplex(PIPE_CAPACITY);
    let forwarder = tokio::spawn(forward_input(input_rx, pipe_wr));
    let output = FrameWriter::new(out_tx);

    let work = async move {
        process
            .run(
                ctx.clone(),
                Box::pin(pipe_rd),
                Box::pin(output),
                &call.params,
            )
            .await
    };
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(value)) => (Some(value), None, Some(forwarder)),
        Ok(Err(err)) => (None, Some(format!("{err:#}")), Some(forwarder)),
        Err(panic) => (None, Some(panic_message(panic.as_ref())), Some(forwarder)),
    }
}

/// Reader lane: text frames feed the input channel, the first binary frame is
/// the call, later binary frames are signals. Exits when the connection dies
/// (cancelling with `ClientGone`) or once the protocol is done.
async fn read_loop(
    mut ws_rx: SplitStream<WebSocket>,
    input_tx: mpsc::Sender<Option<Bytes>>,
    call_tx: oneshot::Sender<Bytes>,
    ctx: Context,
    scope: Context,
    done: CancellationToken,
) {
    let mut call_tx = Some(call_tx);
    let mut had_cancel = false;

    loop {
        let next = tokio::select! {
            next = ws_rx.next() => next,
            _ = scope.cancelled() => {
                ctx.cancel(CancelCause::ClientGone);
                return;
            }
            _ = done.cancelled() => return,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(_)) | None => {
                ctx.cancel(CancelCause::ClientGone);
                return;
            }
        };

        match message {
            Message::Text(text) => {
                if input_tx
                    .send(Some(Bytes::copy_from_slice(text.as_bytes())))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Message::Binary(body) => {
                if let Some(tx) = call_tx.take() {
                    let _ = tx.send(body);
                    continue;
                }

                let signal: SignalMessage = match serde_json::from_slice(&body) {
                    Ok(signal) => signal,
                    Err(_) => {
                        // keep reading; the transport still closes normally
                        ctx.cancel(CancelCause::ProtocolError);
                        continue;
                    }
                };
                match signal.signal {
                    Signal::Close => {
                        if input_tx.send(None).await.is_err() {
                            return;
                        }
                    }
                    Signal::Cancel if !had_cancel => {
                        ctx.cancel(CancelCause::ClientRequest);
                        had_cancel = true;
                    }
                    Signal::Cancel => {
                        // a repeated cancel also closes the input, aliasing
                        // cancel-then-close on the wire
                        debug!("repeated cancel signal, closing input");
                        if input_tx.send(None).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Message::Close(_) => {}
            // unrecognized message types are ignored
            _ => {}
        }
    }
}

/// Forwarder lane: drains the input channel into the pipe. The `None`
/// sentinel closes the writer (EOF for the process) while the channel keeps
/// draining so the reader lane never wedges on a full channel.
async fn forward_input(
    mut input_rx: mpsc::Receiver<Option<Bytes>>,
    pipe_wr: WriteHalf<SimplexStream>,
) {
    let mut pipe_wr = Some(pipe_wr);
    while let Some(item) = input_rx.recv().await {
        match item {
            Some(bytes) => {
                if let Some(writer) = pipe_wr.as_mut() {
                    let _ = writer.write_all(&bytes).await;
                }
            }
            None => {
                if let Some(mut writer) = pipe_wr.take() {
                    let _ = writer.shutdown().await;
                }
            }
        }
    }
}

/// Writer lane: the only owner of the outgoing sink.
async fn write_loop(mut ws_tx: SplitSink<WebSocket, Message>, mut out_rx: mpsc::Receiver<Message>) {
    while let Some(message) = out_rx.recv().await {
        if ws_tx.send(message).await.is_err() {
            return;
        }
    }
}

/// Process output sink: every write becomes one text frame and suspends until
/// the writer lane has taken it.
struct FrameWriter {
    sender: PollSender<Message>,
}

impl FrameWriter {
    fn new(out_tx: mpsc::Sender<Message>) -> Self {
        Self {
            sender: PollSender::new(out_tx),
        }
    }
}

impl AsyncWrite for FrameWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.sender.poll_reserve(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(_)) => Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into())),
            Poll::Ready(Ok(())) => {
                let text = String::from_utf8_lossy(buf).into_owned();
                match self.sender.send_item(Message::Text(text.into())) {
                    Ok(()) => Poll::Ready(Ok(buf.len())),
                    Err(_) => Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into())),
                }
            }
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
