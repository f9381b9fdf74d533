//! The polling REST transport.
//!
//! Five routes under a configurable base path map onto session operations
//! through the TTL registry: `new` allocates and starts a session, `input`
//! feeds it, `status` polls it, `closeInput` sends EOF, `cancel` winds it
//! down. Every successful id lookup extends the session's TTL; sessions
//! nobody polls are finalized with a timeout cancellation.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{FutureExt, StreamExt};
use pow_proto::{CallMessage, CancelCause, Context, Handler};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clean::clean;
use crate::session::{Session, SessionOpts};
use crate::vapor::{FinalizeReason, Vapor, VaporError};
use crate::ws::is_websocket_upgrade;

static OPENAPI_DOC: &str = include_str!("../assets/openapi.json");
static DOCS_PAGE: &str = include_str!("../assets/docs.html");

/// Sessions expiring faster than this would be finalized between two
/// reasonable polls.
const MIN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RestOptions {
    /// TTL of a session; extended on every successful access. Clamped to at
    /// least one minute.
    pub timeout: Duration,
    /// Skip serving the interactive documentation UI at `<base>docs/`.
    pub disable_swagger_ui: bool,
    /// Description of the single `servers` entry in the served OpenAPI
    /// document.
    pub openapi_server_description: String,
    /// Output lines retained per session (minimum 1000).
    pub max_lines: usize,
    /// Mount point of the transport; cleaned to `/…/` form.
    pub base_path: String,
}

impl Default for RestOptions {
    fn default() -> Self {
        Self {
            timeout: MIN_TIMEOUT,
            disable_swagger_ui: false,
            openapi_server_description: String::new(),
            max_lines: 0,
            base_path: "/".to_string(),
        }
    }
}

impl RestOptions {
    pub(crate) fn defaulted(mut self) -> Self {
        self.timeout = self.timeout.max(MIN_TIMEOUT);
        self.base_path = clean(&self.base_path);
        self
    }
}

struct RestState {
    scope: Context,
    vapor: Arc<Vapor<Session>>,
    options: RestOptions,
    /// The OpenAPI document with its `servers` entry rewritten to the base
    /// path, sibling field order preserved.
    openapi: String,
}

pub struct RestServer {
    state: Arc<RestState>,
}

impl RestServer {
    pub fn new(handler: Arc<dyn Handler>, options: RestOptions) -> Self {
        let options = options.defaulted();
        let scope = Context::new();

        let session_scope = scope.clone();
        let session_opts = SessionOpts {
            max_lines: options.max_lines,
        };
        let vapor = Vapor::new(
            Box::new(|| Uuid::new_v4().to_string()),
            Box::new(move || {
                Session::new(Arc::clone(&handler), &session_scope, session_opts)
            }),
            Box::new(|reason, session: Arc<Session>| {
                async move {
                    if reason == FinalizeReason::Expired {
                        session.close_with(CancelCause::Timeout).await;
                    }
                }
                .boxed()
            }),
        );

        let openapi = rewrite_servers(&options);
        Self {
            state: Arc::new(RestState {
                scope,
                vapor,
                options,
                openapi,
            }),
        }
    }

    /// The transport as an axum router, mounted under the configured base
    /// path.
    pub fn router(&self) -> Router {
        let state = Arc::clone(&self.state);

        let mut routes = Router::new()
            .route("/new", post(serve_new))
            .route("/status/{id}", get(serve_status))
            .route("/status", get(missing_id))
            .route("/status/", get(missing_id))
            .route("/input/{id}", post(serve_input))
            .route("/input", post(missing_id))
            .route("/input/", post(missing_id))
            .route("/closeInput/{id}", post(serve_close_input))
            .route("/closeInput", post(missing_id))
            .route("/closeInput/", post(missing_id))
            .route("/cancel/{id}", post(serve_cancel))
            .route("/cancel", post(missing_id))
            .route("/cancel/", post(missing_id))
            .route("/openapi.json", get(serve_openapi));
        if !state.options.disable_swagger_ui {
            routes = routes
                .route("/docs", get(|| async { Redirect::permanent("docs/") }))
                .route("/docs/", get(serve_docs));
        }
        let routes = routes
            .layer(middleware::from_fn_with_state(
                Arc::clone(&state),
                guard,
            ))
            .with_state(state);

        let base = self.state.options.base_path.trim_end_matches('/');
        if base.is_empty() {
            routes
        } else {
            Router::new().nest(base, routes)
        }
    }

    /// Refuse new sessions, cancel and drain every live one ("server
    /// closing"), and stop the expiry driver. Resolves once every session has
    /// wound down.
    pub async fn shutdown(&self) {
        info!("draining rest sessions");
        self.state
            .scope
            .cancel(CancelCause::Other("server closing".into()));
        self.state
            .vapor
            .evict_after(|session| {
                async move {
                    session
                        .close_with(CancelCause::Other("server closing".into()))
                        .await;
                }
                .boxed()
            })
            .await;
        self.state.vapor.close();
    }
}

fn rewrite_servers(options: &RestOptions) -> String {
    let server = if options.openapi_server_description.is_empty() {
        json!({"url": options.base_path})
    } else {
        json!({
            "url": options.base_path,
            "description": options.openapi_server_description,
        })
    };
    match crate::omap::set_field(OPENAPI_DOC, "servers", &json!([server])) {
        Ok(doc) => doc,
        Err(err) => {
            warn!(error = %err, "failed to rewrite openapi servers entry");
            OPENAPI_DOC.to_string()
        }
    }
}

/// Rejects upgrade attempts (REST and WebSocket never share a path) and
/// everything once the server is closed.
async fn guard(State(state): State<Arc<RestState>>, req: Request, next: Next) -> Response {
    if is_websocket_upgrade(req.headers()) {
        return StatusCode::NOT_FOUND.into_response();
    }
    if state.scope.is_cancelled() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    next.run(req).await
}

async fn missing_id() -> Response {
    (StatusCode::BAD_REQUEST, "did not provide id").into_response()
}

async fn serve_new(State(state): State<Arc<RestState>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(_) => return (StatusCode::BAD_REQUEST, "failed to read body").into_response(),
    };
    let call: CallMessage = match serde_json::from_slice(&body) {
        Ok(call) => call,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, "failed to decode call message").into_response()
        }
    };

    let (id, session) = match state.vapor.create(state.options.timeout) {
        Ok(created) => created,
        Err(VaporError::Stopped) => return StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(err) => {
            warn!(error = %err, "failed to allocate session");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to create new process",
            )
                .into_response();
        }
    };

    info!(id = %id, call = %call.call, "starting session");
    session.start(parts, call);

    Json(id).into_response()
}

async fn serve_status(
    State(state): State<Arc<RestState>>,
    Path(id): Path<String>,
) -> Response {
    let session = match state.vapor.get(&id) {
        Ok(session) => session,
        Err(_) => return (StatusCode::NOT_FOUND, "process not found").into_response(),
    };
    Json(session.status()).into_response()
}

async fn serve_input(
    State(state): State<Arc<RestState>>,
    Path(id): Path<String>,
    body: Body,
) -> Response {
    let session = match state.vapor.get(&id) {
        Ok(session) => session,
        Err(_) => return (StatusCode::NOT_FOUND, "process not found").into_response(),
    };

    let mut stream = body.into_data_stream();
    let mut copied = 0usize;
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(_) => {
                return (StatusCode::BAD_REQUEST, "failed to read body").into_response();
            }
        };
        if session.write(&chunk).await.is_err() {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "error copying data to process",
            )
                .into_response();
        }
        copied += chunk.len();
    }
    debug!(id = %id, bytes = copied, "copied input");

    (StatusCode::OK, "input sent").into_response()
}

async fn serve_close_input(
    State(state): State<Arc<RestState>>,
    Path(id): Path<String>,
) -> Response {
    let session = match state.vapor.get(&id) {
        Ok(session) => session,
        Err(_) => return (StatusCode::NOT_FOUND, "process not found").into_response(),
    };
    if session.close_input().await.is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "error closing input").into_response();
    }
    (StatusCode::OK, "input closed").into_response()
}

async fn serve_cancel(
    State(state): State<Arc<RestState>>,
    Path(id): Path<String>,
) -> Response {
    let session = match state.vapor.get(&id) {
        Ok(session) => session,
        Err(_) => return (StatusCode::NOT_FOUND, "process not found").into_response(),
    };
    session.close_with(CancelCause::ClientRequest).await;
    (StatusCode::OK, "process cancelled").into_response()
}

async fn serve_openapi(State(state): State<Arc<RestState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "application/json")],
        state.openapi.clone(),
    )
        .into_response()
}

async fn serve_docs() -> Html<&'static str> {
    Html(DOCS_PAGE)
}

#[cfg(test)]
mod tests {
    use axum::http::Request as HttpRequest;
    use futures::future::BoxFuture;
    use http::request::Parts;
    use pow_proto::{BoxProcess, HandlerError, HandlerFn, ProcessFn, ProcessInput, ProcessOutput};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

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
                            Err(anyhow::anyhow!(ctx.cause().expect("cause set")))
                        })
                    },
                )) as BoxProcess),
                _ => Err(HandlerError::UnknownProcess),
            }
        }))
    }

    fn test_server() -> RestServer {
        RestServer::new(test_handler(), RestOptions::default())
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn start_echo(router: &Router) -> String {
        let response = router
            .clone()
            .oneshot(
                HttpRequest::post("/new")
                    .body(Body::from(r#"{"call":"echo","params":["a"]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        serde_json::from_str(&body_string(response).await).unwrap()
    }

    #[tokio::test]
    async fn happy_path_polls_to_fulfilled() {
        let server = test_server();
        let router = server.router();

        let id = start_echo(&router).await;

        let response = router
            .clone()
            .oneshot(
                HttpRequest::post(format!("/input/{id}"))
                    .body(Body::from("hello\n"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "input sent");

        // the echo process consumes the pipe asynchronously; poll until the
        // line shows up in the buffer
        let mut status = Value::Null;
        for _ in 0..100 {
            let response = router
                .clone()
                .oneshot(
                    HttpRequest::get(format!("/status/{id}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            status = serde_json::from_str(&body_string(response).await).unwrap();
            if status["buffer"] == json!("hello") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status["buffer"], json!("hello"));

        let response = router
            .clone()
            .oneshot(
                HttpRequest::post(format!("/closeInput/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "input closed");

        // the process winds down asynchronously; poll until it has
        let mut status = Value::Null;
        for _ in 0..100 {
            let response = router
                .clone()
                .oneshot(
                    HttpRequest::get(format!("/status/{id}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            status = serde_json::from_str(&body_string(response).await).unwrap();
            if status["result"]["status"] != json!("pending") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status["result"]["status"], json!("fulfilled"));
        assert_eq!(status["result"]["value"], json!(["a"]));
    }

    #[tokio::test]
    async fn cancel_rejects_with_client_request() {
        let server = test_server();
        let router = server.router();

        let response = router
            .clone()
            .oneshot(
                HttpRequest::post("/new")
                    .body(Body::from(r#"{"call":"sleep"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        let id: String = serde_json::from_str(&body_string(response).await).unwrap();

        let response = router
            .clone()
            .oneshot(
                HttpRequest::post(format!("/cancel/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .clone()
            .oneshot(
                HttpRequest::get(format!("/status/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(
            status["result"],
            json!({"status": "rejected", "reason": "client requested cancellation"})
        );
    }

    #[tokio::test]
    async fn malformed_call_is_rejected() {
        let router = test_server().router();
        let response = router
            .oneshot(
                HttpRequest::post("/new")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "failed to decode call message");
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let router = test_server().router();
        for request in [
            HttpRequest::get("/status/nope").body(Body::empty()).unwrap(),
            HttpRequest::post("/input/nope").body(Body::from("x")).unwrap(),
            HttpRequest::post("/closeInput/nope").body(Body::empty()).unwrap(),
            HttpRequest::post("/cancel/nope").body(Body::empty()).unwrap(),
        ] {
            let response = router.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn missing_id_is_bad_request() {
        let router = test_server().router();
        let response = router
            .oneshot(HttpRequest::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "did not provide id");
    }

    #[tokio::test]
    async fn upgrade_requests_are_not_found() {
        let router = test_server().router();
        let response = router
            .oneshot(
                HttpRequest::get("/status/some-id")
                    .header("connection", "Upgrade")
                    .header("upgrade", "websocket")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn closed_server_is_unavailable() {
        let server = test_server();
        let router = server.router();

        let id = start_echo(&router).await;
        server.shutdown().await;

        // the drained session was cancelled with "server closing"
        for request in [
            HttpRequest::post("/new")
                .body(Body::from(r#"{"call":"echo"}"#))
                .unwrap(),
            HttpRequest::get(format!("/status/{id}"))
                .body(Body::empty())
                .unwrap(),
        ] {
            let response = router.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        }
    }

    #[tokio::test]
    async fn drain_cancels_sessions_with_server_closing() {
        let server = test_server();
        let router = server.router();

        let response = router
            .clone()
            .oneshot(
                HttpRequest::post("/new")
                    .body(Body::from(r#"{"call":"sleep"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        let id: String = serde_json::from_str(&body_string(response).await).unwrap();
        let session = server.state.vapor.get(&id).unwrap();

        server.shutdown().await;

        let status = serde_json::to_value(session.status()).unwrap();
        assert_eq!(
            status["result"],
            json!({"status": "rejected", "reason": "server closing"})
        );
    }

    #[tokio::test]
    async fn openapi_servers_entry_is_rewritten_in_place() {
        let server = RestServer::new(
            test_handler(),
            RestOptions {
                base_path: "/api/v1".to_string(),
                openapi_server_description: "test server".to_string(),
                ..RestOptions::default()
            },
        );
        let router = server.router();

        let response = router
            .oneshot(
                HttpRequest::get("/api/v1/openapi.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let doc = body_string(response).await;
        let parsed: Value = serde_json::from_str(&doc).unwrap();
        assert_eq!(
            parsed["servers"],
            json!([{"url": "/api/v1/", "description": "test server"}])
        );
        // sibling order is untouched: openapi/info stay ahead of servers
        let openapi_at = doc.find(r#""openapi""#).unwrap();
        let info_at = doc.find(r#""info""#).unwrap();
        let servers_at = doc.find(r#""servers""#).unwrap();
        let paths_at = doc.find(r#""paths""#).unwrap();
        assert!(openapi_at < info_at && info_at < servers_at && servers_at < paths_at);
    }

    #[tokio::test]
    async fn docs_ui_can_be_disabled() {
        let enabled = test_server().router();
        let response = enabled
            .oneshot(HttpRequest::get("/docs/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let disabled = RestServer::new(
            test_handler(),
            RestOptions {
                disable_swagger_ui: true,
                ..RestOptions::default()
            },
        )
        .router();
        let response = disabled
            .oneshot(HttpRequest::get("/docs/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn options_are_clamped() {
        let options = RestOptions {
            timeout: Duration::from_secs(1),
            base_path: "api//v1/".to_string(),
            ..RestOptions::default()
        }
        .defaulted();
        assert_eq!(options.timeout, Duration::from_secs(60));
        assert_eq!(options.base_path, "/api/v1/");
    }
}
