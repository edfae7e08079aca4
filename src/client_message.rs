use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::util::default_for_null;

/// The payload for a client's "start" message. This triggers execution of a
/// query, mutation, or subscription.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StartPayload {
    /// The document body.
    pub query: String,

    /// The operation's variables.
    #[serde(
        default,
        deserialize_with = "default_for_null",
        skip_serializing_if = "Map::is_empty"
    )]
    pub variables: Map<String, Value>,

    /// The operation name (required if the document contains multiple
    /// operations).
    #[serde(
        default,
        deserialize_with = "default_for_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_name: Option<String>,

    /// Protocol extensions. None are supported; servers fail any start
    /// message whose extensions map is populated.
    #[serde(
        default,
        deserialize_with = "default_for_null",
        skip_serializing_if = "Map::is_empty"
    )]
    pub extensions: Map<String, Value>,
}

/// ClientMessage defines the message types that clients can send.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ClientMessage {
    /// Sent by the client upon connecting. The payload is commonly used for
    /// authentication.
    ConnectionInit {
        /// Arbitrary parameters forwarded to the server.
        #[serde(default, skip_serializing_if = "Value::is_null")]
        payload: Value,
    },

    /// Begins an operation.
    ///
    /// The payload stays unparsed at the envelope level so that a malformed
    /// payload fails the operation, not the connection.
    Start {
        /// The operation id. Must be unique within the connection.
        id: String,
        /// A [`StartPayload`] in JSON form.
        payload: Value,
    },

    /// Cancels an operation.
    Stop {
        /// The id of the operation to stop.
        id: String,
    },

    /// Graceful close request.
    ConnectionTerminate,
}
