use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{Column, Warning};

/// Messages sent from the server to the client.
///
/// The protocol carries no request identifiers: the server answers requests
/// strictly in the order received on a connection, and a row-returning
/// request streams `ResultHeader`, `Row`* and `ResultDone` frames before the
/// next request's response begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledgement for a control command.
    Ok,

    /// Successful authentication.
    AuthOk { session_id: String },

    /// Reply to `Ping`.
    Pong { timestamp: i64 },

    /// Begins one result set.
    ResultHeader { columns: Vec<Column> },

    /// One row of the current result set.
    Row { values: Vec<Value> },

    /// Ends one result set, or a statement that produced none.
    ResultDone {
        #[serde(default)]
        affected: u64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        generated_ids: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auto_increment: Option<u64>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<Warning>,
        /// Another `ResultHeader` for the same request follows.
        #[serde(default)]
        more_results: bool,
    },

    /// The request at the head of the pipeline failed.
    Error { code: u16, message: String },
}

impl ServerMessage {
    /// A `ResultDone` that closes a row-less statement.
    pub fn done(affected: u64) -> Self {
        ServerMessage::ResultDone {
            affected,
            generated_ids: Vec::new(),
            auto_increment: None,
            warnings: Vec::new(),
            more_results: false,
        }
    }

    /// An error message with the given server code.
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }
}
