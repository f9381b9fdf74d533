//! Cancellation scopes with causes.
//!
//! A [`Context`] is handed to every running process. Cancellation is
//! cooperative: the server cancels the scope with a [`CancelCause`] and the
//! process is expected to observe it promptly; nothing is force-killed.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// Why a [`Context`] was cancelled.
///
/// The display strings are part of the wire contract: they surface verbatim
/// as the `reason` of a rejected result when the process returns its
/// cancellation cause as an error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CancelCause {
    /// The client is no longer reachable (socket died, poll TTL elapsed on a
    /// transport that tracks liveness that way).
    #[error("client has gone away")]
    ClientGone,

    /// The process handler has returned; late cancellation observers can no
    /// longer affect the client.
    #[error("handler has returned")]
    HandlerReturn,

    /// The client explicitly requested cancellation.
    #[error("client requested cancellation")]
    ClientRequest,

    /// A protocol error occurred and the process is cancelled for safety.
    #[error("protocol error occurred")]
    ProtocolError,

    /// A timeout expired.
    #[error("timeout expired")]
    Timeout,

    /// An application-supplied cause (for example "server closing").
    #[error("{0}")]
    Other(String),
}

#[derive(Debug)]
struct Inner {
    token: CancellationToken,
    cause: OnceLock<CancelCause>,
    parent: Option<Arc<Inner>>,
}

/// A clonable cancellation scope carrying a one-shot [`CancelCause`].
///
/// Derived scopes ([`Context::child`]) are cancelled together with their
/// parent; [`Context::cause`] falls back to the parent's cause when the scope
/// itself never recorded one, so a scope cancelled transitively still reports
/// why.
#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// A fresh root scope.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                cause: OnceLock::new(),
                parent: None,
            }),
        }
    }

    /// Derive a scope that is cancelled whenever `self` is.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                token: self.inner.token.child_token(),
                cause: OnceLock::new(),
                parent: Some(self.inner.clone()),
            }),
        }
    }

    /// Cancel this scope with the given cause. The first caller wins; later
    /// calls are no-ops. Returns whether this call recorded the cause.
    pub fn cancel(&self, cause: CancelCause) -> bool {
        // The cause must be observable before any waiter wakes up.
        let recorded = self.inner.cause.set(cause).is_ok();
        self.inner.token.cancel();
        recorded
    }

    /// Suspend until the scope is cancelled (directly or via a parent).
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// The recorded cause, walking up to parents for scopes that were
    /// cancelled transitively. `None` while the scope is live.
    pub fn cause(&self) -> Option<CancelCause> {
        let mut inner = Some(&self.inner);
        while let Some(i) = inner {
            if let Some(cause) = i.cause.get() {
                return Some(cause.clone());
            }
            inner = i.parent.as_ref();
        }
        None
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
