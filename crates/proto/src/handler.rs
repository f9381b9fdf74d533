//! The [`Handler`] and [`Process`] traits implemented by applications.

use std::pin::Pin;

use async_trait::async_trait;
use futures::future::BoxFuture;
use http::request::Parts;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::Context;

/// Byte stream a process reads its input from. EOF means the client closed
/// the input side; it does not imply the process has to stop producing
/// output.
pub type ProcessInput = Pin<Box<dyn AsyncRead + Send + 'static>>;

/// Byte sink a process writes its output to. Writes may suspend until the
/// transport has taken the bytes; backpressure flows from the client to the
/// process.
pub type ProcessOutput = Pin<Box<dyn AsyncWrite + Send + 'static>>;

pub type BoxProcess = Box<dyn Process>;

/// Errors a [`Handler`] may raise while resolving a process. They surface to
/// the client verbatim in the terminal result.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("unknown process")]
    UnknownProcess,

    #[error("invalid args")]
    InvalidArgs,

    #[error("authorization denied")]
    AuthorizationDenied,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Resolves a process name to an implementation.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Resolve `name` for the request that started the session.
    ///
    /// `req` holds the metadata of the originating HTTP request; on the
    /// WebSocket transport that is the upgrade request.
    async fn get(
        &self,
        req: &Parts,
        name: &str,
        params: &[String],
    ) -> Result<BoxProcess, HandlerError>;
}

/// A streaming unit of work.
#[async_trait]
pub trait Process: Send + Sync {
    /// Run to completion, reading `input` and writing `output`.
    ///
    /// `ctx` is cancelled once the session ends; its cause describes why (see
    /// [`crate::CancelCause`]). Honoring it is cooperative.
    async fn run(
        &self,
        ctx: Context,
        input: ProcessInput,
        output: ProcessOutput,
        params: &[String],
    ) -> anyhow::Result<Value>;
}

/// Implements [`Handler`] from a plain resolution closure.
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F> Handler for HandlerFn<F>
where
    F: Fn(&Parts, &str, &[String]) -> Result<BoxProcess, HandlerError> + Send + Sync,
{
    async fn get(
        &self,
        req: &Parts,
        name: &str,
        params: &[String],
    ) -> Result<BoxProcess, HandlerError> {
        (self.0)(req, name, params)
    }
}

/// Implements [`Process`] from a closure returning a boxed future.
pub struct ProcessFn<F>(pub F);

#[async_trait]
impl<F> Process for ProcessFn<F>
where
    F: Fn(Context, ProcessInput, ProcessOutput, Vec<String>) -> BoxFuture<'static, anyhow::Result<Value>>
        + Send
        + Sync,
{
    async fn run(
        &self,
        ctx: Context,
        input: ProcessInput,
        output: ProcessOutput,
        params: &[String],
    ) -> anyhow::Result<Value> {
        (self.0)(ctx, input, output, params.to_vec()).await
    }
}
