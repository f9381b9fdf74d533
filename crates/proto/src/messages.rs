//! Wire messages exchanged between clients and the server.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sent by the client to invoke a named process.
///
/// On the WebSocket transport this is the first binary frame; on the REST
/// transport it is the body of `POST <base>new`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMessage {
    /// Name of the process to invoke.
    pub call: String,
    /// Initial string parameters passed to the process.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,
}

/// A control signal sent by the client while a process is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub signal: Signal,
}

/// The closed set of client control signals. Anything else fails to decode
/// and is treated as a protocol error by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    /// Request cooperative cancellation of the running process.
    Cancel,
    /// Close the input stream (EOF on the process's reader) while letting the
    /// process keep producing output.
    Close,
}

/// The terminal outcome of a process, as serialized to clients.
///
/// ```json
/// {"status":"pending"}
/// {"status":"fulfilled","value":["a","b"]}
/// {"status":"rejected","reason":"client requested cancellation"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ResultMessage {
    /// The process has not finished yet.
    Pending,
    /// The process returned a value (which may be JSON `null`).
    Fulfilled {
        // an explicit `"value":null` must survive a round trip, so null
        // deserializes to Some(Null) and only a missing key is None
        #[serde(
            default,
            deserialize_with = "value_or_null",
            skip_serializing_if = "Option::is_none"
        )]
        value: Option<Value>,
    },
    /// The process failed; `reason` is the stringified error, omitted when
    /// the error rendered to an empty string.
    Rejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ResultMessage {
    /// Build the terminal message from a captured `(value, error)` pair.
    /// An error always wins over a value.
    pub fn from_outcome(value: Option<Value>, error: Option<&str>) -> Self {
        match error {
            Some(reason) => ResultMessage::Rejected {
                reason: (!reason.is_empty()).then(|| reason.to_owned()),
            },
            None => ResultMessage::Fulfilled { value },
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ResultMessage::Pending)
    }
}

impl Default for ResultMessage {
    fn default() -> Self {
        ResultMessage::Pending
    }
}

fn value_or_null<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}
