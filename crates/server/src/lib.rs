//! Streaming processes over two HTTP transports.
//!
//! A [`Server`] exposes application-supplied processes (resolved through a
//! [`pow_proto::Handler`]) over a bidirectional WebSocket protocol and, for
//! environments without WebSockets, a polling REST API backed by a TTL
//! session registry. Requests carrying a WebSocket upgrade go to the
//! WebSocket transport when it is enabled; everything else goes to REST.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use pow_server::{Options, Server};
//!
//! # fn handler() -> Arc<dyn pow_proto::Handler> { unimplemented!() }
//! #[tokio::main]
//! async fn main() {
//!     let server = Arc::new(Server::new(handler(), Options::default()));
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await.unwrap();
//!     axum::serve(listener, server.router()).await.unwrap();
//! }
//! ```

mod clean;
pub mod linebuf;
pub mod omap;
mod rest;
pub mod session;
pub mod vapor;
mod ws;

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use pow_proto::Handler;
use tower::ServiceExt;

pub use rest::{RestOptions, RestServer};

/// Which transports to expose, and how.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub disable_websocket: bool,
    pub disable_rest: bool,
    pub rest: RestOptions,
}

/// The composite front over both transports.
pub struct Server {
    ws: Option<ws::WsTransport>,
    rest: Option<RestServer>,
}

impl Server {
    pub fn new(handler: Arc<dyn Handler>, options: Options) -> Self {
        Self {
            ws: (!options.disable_websocket)
                .then(|| ws::WsTransport::new(Arc::clone(&handler))),
            rest: (!options.disable_rest).then(|| RestServer::new(handler, options.rest)),
        }
    }

    /// The composite router: WebSocket upgrades to the WebSocket transport,
    /// everything else to REST, 404 when neither is enabled.
    pub fn router(&self) -> Router {
        let rest = self.rest.as_ref().map(|rest| rest.router());
        match &self.ws {
            Some(ws) => {
                let front = FrontState {
                    ws: ws.state(),
                    rest,
                };
                Router::new().fallback(dispatch).with_state(front)
            }
            None => rest.unwrap_or_else(|| {
                Router::new().fallback(|| async { StatusCode::NOT_FOUND })
            }),
        }
    }

    /// Shut both transports down concurrently: live WebSocket connections are
    /// cancelled and joined, REST sessions are drained.
    pub async fn shutdown(&self) {
        tokio::join!(
            async {
                if let Some(ws) = &self.ws {
                    ws.shutdown().await;
                }
            },
            async {
                if let Some(rest) = &self.rest {
                    rest.shutdown().await;
                }
            },
        );
    }
}

#[derive(Clone)]
struct FrontState {
    ws: Arc<ws::WsState>,
    rest: Option<Router>,
}

async fn dispatch(State(state): State<FrontState>, req: Request) -> Response {
    if ws::is_websocket_upgrade(req.headers()) {
        let (mut parts, _body) = req.into_parts();
        return match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => ws::handle_upgrade(state.ws, parts, upgrade),
            Err(rejection) => rejection.into_response(),
        };
    }

    match state.rest {
        Some(router) => match router.oneshot(req).await {
            Ok(response) => response,
            Err(infallible) => match infallible {},
        },
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
