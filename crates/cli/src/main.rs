//! Example pow server exposing a single `echo` process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use clap::Parser;
use http::request::Parts;
use pow_proto::{
    BoxProcess, Context, Handler, HandlerError, Process, ProcessInput, ProcessOutput,
};
use pow_server::{Options, RestOptions, Server};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pow", about = "Example pow server with an echo process")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:3000")]
    bind: SocketAddr,

    /// Disable the WebSocket transport.
    #[arg(long)]
    disable_websocket: bool,

    /// Disable the REST transport.
    #[arg(long)]
    disable_rest: bool,

    /// REST session timeout in seconds (minimum 60).
    #[arg(long, default_value_t = 60)]
    session_timeout: u64,

    /// Base path of the REST transport.
    #[arg(long, default_value = "/")]
    base_path: String,

    /// Server description in the served OpenAPI document.
    #[arg(long, default_value = "pow example server")]
    description: String,

    /// Skip serving the interactive API docs.
    #[arg(long)]
    disable_swagger_ui: bool,
}

struct DemoHandler;

#[async_trait]
impl Handler for DemoHandler {
    async fn get(
        &self,
        _req: &Parts,
        name: &str,
        params: &[String],
    ) -> Result<BoxProcess, HandlerError> {
        info!(process = name, ?params, "resolving process");
        match name {
            "echo" => Ok(Box::new(Echo)),
            _ => Err(HandlerError::UnknownProcess),
        }
    }
}

/// Copies its input back to its output, then resolves with its params. A
/// cancelled session surfaces its cause instead.
struct Echo;

#[async_trait]
impl Process for Echo {
    async fn run(
        &self,
        ctx: Context,
        mut input: ProcessInput,
        mut output: ProcessOutput,
        params: &[String],
    ) -> anyhow::Result<Value> {
        info!("starting echo process");
        tokio::io::copy(&mut input, &mut output)
            .await
            .context("failed to copy")?;
        info!("echo process exiting");
        match ctx.cause() {
            Some(cause) => Err(cause.into()),
            None => Ok(json!(params)),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let server = Arc::new(Server::new(
        Arc::new(DemoHandler),
        Options {
            disable_websocket: args.disable_websocket,
            disable_rest: args.disable_rest,
            rest: RestOptions {
                timeout: Duration::from_secs(args.session_timeout),
                disable_swagger_ui: args.disable_swagger_ui,
                openapi_server_description: args.description,
                base_path: args.base_path,
                ..RestOptions::default()
            },
        },
    ));

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to listen on {}", args.bind))?;
    info!(addr = %args.bind, "listening");

    let shutdown = {
        let server = Arc::clone(&server);
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            server.shutdown().await;
        }
    };

    let router = server.router().layer(TraceLayer::new_for_http());
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server failed")?;
    info!("goodbye");
    Ok(())
}
