#![doc = include_str!("../README.md")]

mod client;
mod client_message;
mod cluster;
mod connection;
mod error;
mod log;
mod operation;
mod schema;
mod server;
mod server_message;
mod util;

pub use self::client::{
    Client, ClientConfig, DataCallback, ErrorCallback, MutationConfig, QueryConfig, Subscription,
    SubscriptionConfig,
};
pub use self::client_message::{ClientMessage, StartPayload};
pub use self::cluster::{Cluster, ClusterConfig, HttpPeer, Peer, Peers, Publisher, StaticPeers};
pub use self::error::Error;
pub use self::log::{Logger, NullLogger, StdLogger};
pub use self::schema::{Schema, SchemaError, SchemaIndex, Update};
pub use self::server::{Server, ServerConfig};
pub use self::server_message::{DataPayload, ErrorLocation, GraphQLError, ServerMessage};
