use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use axum::{
    extract::ws::{WebSocket, WebSocketUpgrade},
    response::Response,
};
use uuid::Uuid;

use crate::{
    cluster::Publisher,
    connection::{Connection, ConnectionSettings},
    log::{Log, Logger},
    schema::{Schema, SchemaError, SchemaIndex, Update},
};

/// Settings for [`Server::new`].
pub struct ServerConfig {
    /// The schema to serve.
    pub schema: Arc<dyn Schema>,

    /// Send `ka` messages after every five seconds of writer idleness, which
    /// also arms connected clients' read deadlines.
    pub enable_keep_alive: bool,

    /// Re-execute a registered subscription whenever this long passes without
    /// it running. Zero disables polling, leaving [`Server::publish`] as the
    /// only trigger.
    pub polling_interval: Duration,

    /// Per-read socket deadline. Zero disables.
    pub read_timeout: Duration,

    /// Per-send socket deadline. Zero disables.
    pub write_timeout: Duration,

    /// Troubleshooting sink. `None` discards all logs.
    pub logger: Option<Arc<dyn Logger>>,
}

impl ServerConfig {
    /// A configuration with keep-alive, polling, deadlines, and logging all
    /// disabled.
    pub fn new(schema: Arc<dyn Schema>) -> Self {
        Self {
            schema,
            enable_keep_alive: false,
            polling_interval: Duration::ZERO,
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            logger: None,
        }
    }
}

struct ConnectionTable {
    state: RwLock<ConnectionTableState>,
}

struct ConnectionTableState {
    closed: bool,
    conns: HashMap<Uuid, Arc<Connection>>,
}

impl ConnectionTable {
    fn new() -> Self {
        Self {
            state: RwLock::new(ConnectionTableState {
                closed: false,
                conns: HashMap::new(),
            }),
        }
    }

    fn add(&self, conn: Arc<Connection>) -> Result<(), ()> {
        let mut state = self.state.write().unwrap();
        if state.closed {
            return Err(());
        }
        state.conns.insert(conn.id, conn);
        Ok(())
    }

    fn remove(&self, id: &Uuid) {
        self.state.write().unwrap().conns.remove(id);
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.state.read().unwrap().conns.values().cloned().collect()
    }
}

/// A GraphQL over WebSocket server.
///
/// Each accepted socket multiplexes any number of queries, mutations, and
/// subscriptions. Registered subscriptions re-execute when a published
/// [`Update`] overlaps their field set, and optionally on a polling interval
/// as a safety net against missed events.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    settings: ConnectionSettings,
    log: Log,
    schema_index: Arc<SchemaIndex>,
    connections: ConnectionTable,
    publish_lock: Mutex<()>,
}

impl Server {
    /// Analyses the configured schema and prepares the connection table. The
    /// analysed schema is immutable for the server's lifetime.
    pub fn new(config: ServerConfig) -> Result<Self, SchemaError> {
        let schema_index = Arc::new(SchemaIndex::analyse(config.schema.document())?);
        Ok(Self {
            inner: Arc::new(ServerInner {
                settings: ConnectionSettings {
                    schema: config.schema,
                    schema_index: schema_index.clone(),
                    enable_keep_alive: config.enable_keep_alive,
                    polling_interval: config.polling_interval,
                    read_timeout: config.read_timeout,
                    write_timeout: config.write_timeout,
                },
                log: Log::new(config.logger),
                schema_index,
                connections: ConnectionTable::new(),
                publish_lock: Mutex::new(()),
            }),
        })
    }

    /// Accepts a websocket upgrade and runs the connection to completion.
    /// Only the `graphql-ws` sub-protocol is served; connections that fail to
    /// negotiate it are dropped after the upgrade.
    ///
    /// ```ignore
    /// let app = Router::new().route(
    ///     "/graphql",
    ///     get(move |ws: WebSocketUpgrade| async move { server.upgrade(ws) }),
    /// );
    /// ```
    pub fn upgrade(&self, ws: WebSocketUpgrade) -> Response {
        self.inner.log.info("Serving request");
        let server = self.clone();
        ws.protocols(["graphql-ws"])
            .on_upgrade(move |socket| async move { server.run_socket(socket).await })
    }

    async fn run_socket(&self, socket: WebSocket) {
        if socket.protocol().map(|p| p.as_bytes()) != Some(b"graphql-ws".as_slice()) {
            self.inner
                .log
                .info("Connection does not implement the GraphQL WS protocol");
            return;
        }
        let (conn, outbox_rx) = Connection::new(&self.inner.settings, self.inner.log.clone());
        if self.inner.connections.add(conn.clone()).is_err() {
            return;
        }
        conn.clone().run(socket, outbox_rx).await;
        self.inner.connections.remove(&conn.id);
        self.inner.log.info("Connection terminated");
    }

    /// Re-executes every registered subscription whose field set overlaps
    /// `update`. Publishes are serialized by an update lock so that two
    /// concurrent publishes cannot interleave their dispatch; the executions
    /// themselves run concurrently.
    pub fn publish(&self, update: &Update) {
        let _guard = self.inner.publish_lock.lock().unwrap();
        for conn in self.inner.connections.snapshot() {
            for op in conn.operations.snapshot() {
                let Some(field_set) = op.field_set() else {
                    continue;
                };
                match field_set.overlaps(update) {
                    Ok(true) => {
                        let op = op.clone();
                        tokio::spawn(async move { op.execute().await });
                    }
                    Ok(false) => {}
                    Err(error) => self
                        .inner
                        .log
                        .error(&format!("Discarding update for a mismatched schema: {error}")),
                }
            }
        }
    }

    /// The analysed schema, for building [`Update`]s and for reuse by
    /// [`Cluster`].
    ///
    /// [`Cluster`]: crate::Cluster
    pub fn schema_index(&self) -> Arc<SchemaIndex> {
        self.inner.schema_index.clone()
    }
}

impl Publisher for Server {
    fn publish(&self, update: &Update) {
        Server::publish(self, update);
    }

    fn schema_index(&self) -> Arc<SchemaIndex> {
        Server::schema_index(self)
    }
}
