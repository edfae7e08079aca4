use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::util::default_for_null;

/// A position in the query string related to an error.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct ErrorLocation {
    /// One-based line number.
    pub line: u32,
    /// One-based column number.
    pub column: u32,
}

/// An error description meant to be useful for a developer debugging an
/// operation.
#[derive(Clone, Debug, Deserialize, Display, PartialEq, Serialize)]
#[display("{message}")]
pub struct GraphQLError {
    /// The error message.
    pub message: String,

    /// Positions in the query string related to the error.
    #[serde(
        default,
        deserialize_with = "default_for_null",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub locations: Vec<ErrorLocation>,

    /// The response path the error occurred at.
    #[serde(
        default,
        deserialize_with = "default_for_null",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub path: Vec<String>,

    /// Engine-specific error details.
    #[serde(
        default,
        deserialize_with = "default_for_null",
        skip_serializing_if = "Map::is_empty"
    )]
    pub extensions: Map<String, Value>,
}

impl GraphQLError {
    /// An error carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: Vec::new(),
            path: Vec::new(),
            extensions: Map::new(),
        }
    }
}

/// The result of executing an operation. For queries and mutations this is
/// delivered once; for subscriptions, once per relevant change.
///
/// Decoding is strict: unknown fields are rejected to catch protocol drift
/// early. Note that parse and validation errors are not carried here; those
/// travel in `error` messages.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DataPayload {
    /// The result data.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,

    /// Errors that occurred during execution.
    #[serde(
        default,
        deserialize_with = "default_for_null",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub errors: Vec<GraphQLError>,
}

impl DataPayload {
    /// Strictly decodes a payload taken from a `data` message envelope.
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}

/// ServerMessage defines the message types that servers can send.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ServerMessage {
    /// Rejects a message that is not associated with an operation, such as an
    /// unparseable frame or a failed `connection_init`.
    ConnectionError {
        /// The raw error description.
        #[serde(default)]
        payload: Value,
    },

    /// Acknowledges a `connection_init`. Operations may start after this.
    ConnectionAck,

    /// Carries an operation result: a [`DataPayload`] in JSON form.
    Data {
        /// The id of the operation the result belongs to.
        id: String,
        /// The data and execution errors.
        payload: Value,
    },

    /// An error that occurred before execution, such as a validation failure.
    Error {
        /// The id of the operation that triggered the error.
        id: String,
        /// The raw error description.
        payload: Value,
    },

    /// No more messages will be sent for this operation; its id is retired.
    Complete {
        /// The id of the finished operation.
        id: String,
    },

    /// Periodic keep-alive tick.
    #[serde(rename = "ka")]
    ConnectionKeepAlive,
}

impl ServerMessage {
    /// Builds a `data` message for an operation.
    pub fn data(id: impl Into<String>, payload: &DataPayload) -> Self {
        Self::Data {
            id: id.into(),
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }

    /// Builds an operation-scoped `error` message.
    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            id: id.into(),
            payload: Value::String(message.into()),
        }
    }

    /// Builds a `complete` message.
    pub fn complete(id: impl Into<String>) -> Self {
        Self::Complete { id: id.into() }
    }

    /// The wire spelling of the message's type tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ConnectionError { .. } => "connection_error",
            Self::ConnectionAck => "connection_ack",
            Self::Data { .. } => "data",
            Self::Error { .. } => "error",
            Self::Complete { .. } => "complete",
            Self::ConnectionKeepAlive => "ka",
        }
    }
}
