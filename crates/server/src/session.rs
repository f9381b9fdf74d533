//! One process invocation, adapted to a poll-based transport.
//!
//! A session pipes transport-written input into the process, collects process
//! output in a bounded [`LineBuffer`], and captures the terminal `(value,
//! error)` pair. It moves through three stages, each transition happening at
//! most once:
//!
//! ```text
//! Init --start()--> Running --process returns/panics--> Finished
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use http::request::Parts;
use parking_lot::RwLock;
use pow_proto::{CallMessage, CancelCause, Context, Handler, ResultMessage};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, ReadHalf, SimplexStream, WriteHalf};
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::linebuf::{BufferWriter, LineBuffer};

/// Below this, the output cap is raised; polling clients would otherwise lose
/// output between polls.
const MIN_MAX_LINES: usize = 1000;

/// Input pipe capacity. Writers suspend once this many bytes are unread, so
/// backpressure reaches the transport.
pub(crate) const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOpts {
    /// Output lines retained for `status` snapshots. Clamped to at least
    /// 1000.
    pub max_lines: usize,
}

impl SessionOpts {
    fn max_lines(self) -> usize {
        self.max_lines.max(MIN_MAX_LINES)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session input closed")]
    InputClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Init,
    Running,
    Finished,
}

struct SessionState {
    stage: Stage,
    call: Option<CallMessage>,
    reader: Option<ReadHalf<SimplexStream>>,
    value: Option<Value>,
    error: Option<String>,
}

/// Snapshot returned by [`Session::status`]. While the process runs, `result`
/// serializes as `{"status":"pending"}`; once finished it carries the
/// terminal result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Status {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub buffer: String,
    #[serde(serialize_with = "pending_if_none")]
    pub result: Option<ResultMessage>,
}

fn pending_if_none<S>(result: &Option<ResultMessage>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match result {
        Some(result) => result.serialize(serializer),
        None => ResultMessage::Pending.serialize(serializer),
    }
}

/// Cheap to clone; clones share the same underlying session.
#[derive(Clone)]
pub struct Session {
    handler: Arc<dyn Handler>,
    ctx: Context,
    out: Arc<LineBuffer>,
    state: Arc<RwLock<SessionState>>,
    input_wr: Arc<Mutex<Option<WriteHalf<SimplexStream>>>>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Session {
    /// Prepare a session under `parent`'s cancellation scope. The process is
    /// not resolved or started until [`Session::start`].
    pub fn new(handler: Arc<dyn Handler>, parent: &Context, opts: SessionOpts) -> Self {
        let (reader, writer) = tokio::io::simplex(PIPE_CAPACITY);
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            handler,
            ctx: parent.child(),
            out: Arc::new(LineBuffer::new(opts.max_lines())),
            state: Arc::new(RwLock::new(SessionState {
                stage: Stage::Init,
                call: None,
                reader: Some(reader),
                value: None,
                error: None,
            })),
            input_wr: Arc::new(Mutex::new(Some(writer))),
            done_tx,
            done_rx,
        }
    }

    /// The session's cancellation scope, as handed to the process.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Record the call and spawn the process. Returns `false` (and does
    /// nothing) unless the session is still in its initial stage.
    pub fn start(&self, req: Parts, call: CallMessage) -> bool {
        let reader = {
            let mut state = self.state.write();
            if state.stage != Stage::Init {
                return false;
            }
            state.stage = Stage::Running;
            state.call = Some(call);
            state.reader.take()
        };
        let Some(reader) = reader else {
            return false;
        };

        let session = self.clone();
        tokio::spawn(async move {
            session.run(req, reader).await;
        });
        true
    }

    async fn run(self, req: Parts, reader: ReadHalf<SimplexStream>) {
        let call = self
            .state
            .read()
            .call
            .clone()
            .expect("start recorded the call");

        let handler = Arc::clone(&self.handler);
        let ctx = self.ctx.clone();
        let output = BufferWriter(Arc::clone(&self.out));
        let work = async move {
            let process = handler
                .get(&req, &call.call, &call.params)
                .await
                .map_err(|err| anyhow::anyhow!("failed to get process: {err}"))?;
            process
                .run(ctx, Box::pin(reader), Box::pin(output), &call.params)
                .await
        };

        let (value, error) = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(Ok(value)) => (Some(value), None),
            Ok(Err(err)) => (None, Some(format!("{err:#}"))),
            Err(panic) => (None, Some(panic_message(panic.as_ref()))),
        };
        debug!(error = ?error, "process finished");
        self.finish(value, error).await;
    }

    /// Terminal commit. The order is deliberate: the input writer goes first
    /// (later writes fail closed), the scope is cancelled with
    /// [`CancelCause::HandlerReturn`], the `(value, error)` pair and stage
    /// are committed under the write lock, and only then does the completion
    /// latch fire, so every waiter observes the committed snapshot.
    async fn finish(&self, value: Option<Value>, error: Option<String>) {
        drop(self.input_wr.lock().await.take());
        self.ctx.cancel(CancelCause::HandlerReturn);
        {
            let mut state = self.state.write();
            state.value = value;
            state.error = error;
            state.stage = Stage::Finished;
        }
        let _ = self.done_tx.send(true);
    }

    /// Copy `data` into the process's input. Fails once the input has been
    /// closed or the session has finished.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        let mut guard = self.input_wr.lock().await;
        let writer = guard.as_mut().ok_or(SessionError::InputClosed)?;
        writer
            .write_all(data)
            .await
            .map_err(|_| SessionError::InputClosed)
    }

    /// Close the input pipe: the process sees EOF on its reader and later
    /// writes fail. Errors if the input was already closed.
    pub async fn close_input(&self) -> Result<(), SessionError> {
        drop(self.state.write().reader.take());
        let writer = self.input_wr.lock().await.take();
        match writer {
            Some(mut writer) => {
                let _ = writer.shutdown().await;
                Ok(())
            }
            None => Err(SessionError::InputClosed),
        }
    }

    /// Cancel the session with `cause`, close its input, and wait for the
    /// process to wind down. A session whose process never started has
    /// nothing to wait for.
    pub async fn close_with(&self, cause: CancelCause) {
        self.ctx.cancel(cause);
        let started = self.state.read().stage != Stage::Init;
        let _ = self.close_input().await;
        if started {
            self.wait_done().await;
        }
    }

    /// Wait for completion, returning the captured pair, or the cancellation
    /// cause of `ctx` if that fires first.
    pub async fn wait(
        &self,
        ctx: &Context,
    ) -> Result<(Option<Value>, Option<String>), CancelCause> {
        tokio::select! {
            _ = self.wait_done() => {
                let state = self.state.read();
                Ok((state.value.clone(), state.error.clone()))
            }
            _ = ctx.cancelled() => {
                Err(ctx.cause().unwrap_or(CancelCause::Other("context cancelled".into())))
            }
        }
    }

    async fn wait_done(&self) {
        let mut rx = self.done_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Pure read of the current buffer snapshot and, once finished, the
    /// terminal result.
    pub fn status(&self) -> Status {
        let state = self.state.read();
        match state.stage {
            Stage::Init => Status::default(),
            Stage::Running => Status {
                buffer: self.out.contents(),
                result: None,
            },
            Stage::Finished => Status {
                buffer: self.out.contents(),
                result: Some(ResultMessage::from_outcome(
                    state.value.clone(),
                    state.error.as_deref(),
                )),
            },
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic() in process".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::BoxFuture;
    use pow_proto::{BoxProcess, HandlerError, HandlerFn, ProcessFn, ProcessInput, ProcessOutput};
    use serde_json::json;

    use super::*;

    fn request_parts() -> Parts {
        http::Request::builder()
            .uri("/")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    /// `echo` copies input to output and resolves with its params; `sleep`
    /// waits for cancellation and rejects with the cause; `panic` panics.
    fn test_handler() -> Arc<dyn Handler> {
        Arc::new(HandlerFn(|_req: &Parts, name: &str, _params: &[String]| {
            match name {
                "echo" => Ok(Box::new(ProcessFn(
                    |_ctx: Context,
                     mut input: ProcessInput,
                     mut output: ProcessOutput,
                     params: Vec<String>|
                     -> BoxFuture<'static, anyhow::Result<Value>> {
                        Box::pin(async move {
                            tokio::io::copy(&mut input, &mut output).await?;
                            Ok(json!(params))
                        })
                    },
                )) as BoxProcess),
                "sleep" => Ok(Box::new(ProcessFn(
                    |ctx: Context,
                     _input: ProcessInput,
                     _output: ProcessOutput,
                     _params: Vec<String>|
                     -> BoxFuture<'static, anyhow::Result<Value>> {
                        Box::pin(async move {
                            ctx.cancelled().await;
                            let cause = ctx.cause().expect("cancelled scopes carry a cause");
                            Err(anyhow::anyhow!(cause))
                        })
                    },
                )) as BoxProcess),
                "panic" => Ok(Box::new(ProcessFn(
                    |_ctx: Context,
                     _input: ProcessInput,
                     _output: ProcessOutput,
                     _params: Vec<String>|
                     -> BoxFuture<'static, anyhow::Result<Value>> {
                        Box::pin(async move { panic!("boom") })
                    },
                )) as BoxProcess),
                _ => Err(HandlerError::UnknownProcess),
            }
        }))
    }

    fn new_session() -> Arc<Session> {
        Arc::new(Session::new(
            test_handler(),
            &Context::new(),
            SessionOpts::default(),
        ))
    }

    #[tokio::test]
    async fn echo_happy_path() {
        let session = new_session();

        let call = CallMessage {
            call: "echo".into(),
            params: vec!["a".into(), "b".into()],
        };
        assert!(session.start(request_parts(), call.clone()));
        assert!(!session.start(request_parts(), call), "second start is a no-op");

        session.write(b"hello\n").await.unwrap();
        session.close_input().await.unwrap();

        let (value, error) = session.wait(&Context::new()).await.unwrap();
        assert_eq!(value, Some(json!(["a", "b"])));
        assert_eq!(error, None);

        let status = session.status();
        assert_eq!(status.buffer, "hello");
        assert_eq!(
            status.result,
            Some(ResultMessage::from_outcome(Some(json!(["a", "b"])), None))
        );
        // status in Finished is idempotent
        assert_eq!(session.status().buffer, status.buffer);

        assert!(matches!(
            session.write(b"late").await,
            Err(SessionError::InputClosed)
        ));
    }

    #[tokio::test]
    async fn status_serializes_pending_then_result() {
        let session = new_session();
        session.start(
            request_parts(),
            CallMessage {
                call: "sleep".into(),
                params: vec![],
            },
        );

        let status = serde_json::to_value(session.status()).unwrap();
        assert_eq!(status, json!({"result": {"status": "pending"}}));

        session.close_with(CancelCause::ClientRequest).await;
        let status = serde_json::to_value(session.status()).unwrap();
        assert_eq!(
            status,
            json!({"result": {"status": "rejected", "reason": "client requested cancellation"}})
        );
    }

    #[tokio::test]
    async fn close_with_cancels_and_waits() {
        let session = new_session();
        session.start(
            request_parts(),
            CallMessage {
                call: "sleep".into(),
                params: vec![],
            },
        );

        session.close_with(CancelCause::ClientRequest).await;
        let (value, error) = session.wait(&Context::new()).await.unwrap();
        assert_eq!(value, None);
        assert_eq!(error, Some("client requested cancellation".to_string()));
        assert_eq!(
            session.context().cause(),
            Some(CancelCause::ClientRequest),
            "finish must not overwrite the first cause"
        );
    }

    #[tokio::test]
    async fn panics_become_rejections() {
        let session = new_session();
        session.start(
            request_parts(),
            CallMessage {
                call: "panic".into(),
                params: vec![],
            },
        );

        let (value, error) = session.wait(&Context::new()).await.unwrap();
        assert_eq!(value, None);
        assert_eq!(error, Some("panic: boom".to_string()));
    }

    #[tokio::test]
    async fn unresolvable_process_finishes_rejected() {
        let session = new_session();
        session.start(
            request_parts(),
            CallMessage {
                call: "no-such-process".into(),
                params: vec![],
            },
        );

        let (_, error) = session.wait(&Context::new()).await.unwrap();
        assert_eq!(error, Some("failed to get process: unknown process".to_string()));
    }

    #[tokio::test]
    async fn wait_honors_caller_cancellation() {
        let session = new_session();
        session.start(
            request_parts(),
            CallMessage {
                call: "sleep".into(),
                params: vec![],
            },
        );

        let caller = Context::new();
        let waiter = caller.clone();
        let handle = tokio::spawn(async move { session.wait(&waiter).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        caller.cancel(CancelCause::Timeout);
        assert_eq!(handle.await.unwrap(), Err(CancelCause::Timeout));
    }

    #[tokio::test]
    async fn double_close_input_errors() {
        let session = new_session();
        session.start(
            request_parts(),
            CallMessage {
                call: "echo".into(),
                params: vec![],
            },
        );
        session.close_input().await.unwrap();
        assert!(matches!(
            session.close_input().await,
            Err(SessionError::InputClosed)
        ));
    }
}
