use derive_more::{Display, Error};

use crate::schema::SchemaError;

/// Failures surfaced by the client and server transports.
///
/// Execution errors are not represented here: a GraphQL executor reporting
/// errors is a successful delivery, carried in [`DataPayload::errors`].
///
/// [`DataPayload::errors`]: crate::DataPayload::errors
#[derive(Clone, Debug, Display, Error, PartialEq)]
pub enum Error {
    /// Socket I/O failed, a deadline lapsed, or the websocket handshake broke
    /// down. Fatal to the connection.
    #[display("transport failure: {_0}")]
    Transport(#[error(not(source))] String),

    /// The remote end violated the graphql-ws protocol.
    #[display("protocol violation: {_0}")]
    Protocol(#[error(not(source))] String),

    /// The operation was rejected before execution. Scoped to the operation;
    /// the connection stays up.
    #[display("{_0}")]
    Validation(#[error(not(source))] String),

    /// An [`Update`] did not line up with the schema it was applied to.
    ///
    /// [`Update`]: crate::Update
    #[display("{_0}")]
    Schema(SchemaError),

    /// The client no longer accepts work.
    #[display("client is already in shutdown")]
    AlreadyShutdown,
}

impl From<SchemaError> for Error {
    fn from(error: SchemaError) -> Self {
        Self::Schema(error)
    }
}
