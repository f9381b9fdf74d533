//! Protocol surface of the pow server.
//!
//! A *process* is an application-supplied unit of work that consumes an input
//! byte stream, produces an output byte stream, and eventually yields a JSON
//! value or an error. A *handler* resolves a process name (plus initial string
//! parameters) to a process implementation. This crate defines those two
//! traits, the wire messages exchanged with clients, and the cancellation
//! [`Context`] handed to every running process.
//!
//! Transports live in `pow-server`; nothing in this crate touches HTTP or
//! WebSocket framing beyond the request metadata passed to [`Handler::get`].

mod context;
mod handler;
mod messages;

pub use context::{CancelCause, Context};
pub use handler::{
    BoxProcess, Handler, HandlerError, HandlerFn, Process, ProcessFn, ProcessInput, ProcessOutput,
};
pub use messages::{CallMessage, ResultMessage, Signal, SignalMessage};

/// The mandatory WebSocket subprotocol. Servers must refuse upgrades that do
/// not negotiate it.
pub const SUBPROTOCOL: &str = "pow-1";
