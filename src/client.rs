use std::collections::HashMap;
use std::sync::{
    Arc, Mutex, RwLock,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use derive_more::Display;
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use graphql_parser::query::{Definition, OperationDefinition};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{HeaderMap, HeaderValue, header::SEC_WEBSOCKET_PROTOCOL},
    },
};
use uuid::Uuid;

use crate::{
    client_message::{ClientMessage, StartPayload},
    error::Error,
    log::{Log, Logger},
    server_message::{DataPayload, ServerMessage},
    util::{ErrorSlot, Outbox, flag_raised},
};

const SUBPROTOCOL: &str = "graphql-ws";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Settings for [`Client::connect`].
pub struct ClientConfig {
    /// Host and port of the server, e.g. `"127.0.0.1:8080"`.
    pub address: String,

    /// Path component of the websocket endpoint, e.g. `"/graphql"`.
    pub path: String,

    /// Extra headers for the upgrade request, typically carrying
    /// authentication.
    pub header: Option<HeaderMap>,

    /// Payload for the `connection_init` message. What a server expects here
    /// varies, but it commonly carries credentials. Defaults to an empty
    /// object.
    pub initial_payload: Option<Value>,

    /// Maximum wait between messages from the server. Only enforced once the
    /// server has sent its first keep-alive, since a server that never sends
    /// them makes arbitrarily long silences legitimate. Zero disables.
    pub read_timeout: Duration,

    /// Maximum wait for the server to take each outgoing message. Zero
    /// disables.
    pub write_timeout: Duration,

    /// Troubleshooting sink. `None` discards all logs.
    pub logger: Option<Arc<dyn Logger>>,
}

impl ClientConfig {
    /// A configuration with no headers, payload, deadlines, or logging.
    pub fn new(address: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            path: path.into(),
            header: None,
            initial_payload: None,
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            logger: None,
        }
    }
}

/// Receives subscription results.
pub type DataCallback = Box<dyn Fn(DataPayload) + Send + Sync>;

/// Receives operation-scoped errors.
pub type ErrorCallback = Box<dyn Fn(Error) + Send + Sync>;

/// A GraphQL query to run over the websocket.
#[derive(Clone, Debug, Default)]
pub struct QueryConfig {
    /// The document body. Must contain exactly one query operation.
    pub query: String,
    /// The operation's variables.
    pub variables: Map<String, Value>,
    /// The operation name.
    pub operation_name: Option<String>,
}

/// A GraphQL mutation to run over the websocket.
#[derive(Clone, Debug, Default)]
pub struct MutationConfig {
    /// The document body. Must contain exactly one mutation operation.
    pub query: String,
    /// The operation's variables.
    pub variables: Map<String, Value>,
    /// The operation name.
    pub operation_name: Option<String>,
}

/// A long-lived subscription to register over the websocket.
pub struct SubscriptionConfig {
    /// The document body. Must contain exactly one subscription operation.
    pub query: String,
    /// The operation's variables.
    pub variables: Map<String, Value>,
    /// The operation name.
    pub operation_name: Option<String>,
    /// Invoked for every `data` message the server delivers.
    pub data_callback: DataCallback,
    /// Invoked when the server rejects or aborts the operation.
    pub error_callback: ErrorCallback,
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
enum OperationKind {
    #[display("query")]
    Query,
    #[display("mutation")]
    Mutation,
    #[display("subscription")]
    Subscription,
}

struct ClientOperation {
    id: String,
    log: Log,
    data_callback: DataCallback,
    error_callback: ErrorCallback,
    finished: watch::Sender<bool>,
}

impl ClientOperation {
    fn deliver_data(&self, payload: DataPayload) {
        self.log.info("Delivering data message payload via the data callback");
        (self.data_callback)(payload);
    }

    fn deliver_error(&self, payload: Value) {
        self.log.info("Delivering error message payload via the error callback");
        let message = match payload {
            Value::String(message) => message,
            other => other.to_string(),
        };
        (self.error_callback)(Error::Validation(message));
    }
}

#[derive(Default)]
struct OperationsState {
    in_shutdown: bool,
    ops: HashMap<String, Arc<ClientOperation>>,
}

struct ClientInner {
    log: Log,
    read_timeout: Duration,
    outbox: Arc<Outbox<ClientMessage>>,
    operations: RwLock<OperationsState>,
    error: ErrorSlot,
    expect_keep_alive: AtomicBool,
    read_loop_closed: watch::Sender<bool>,
    closing: watch::Sender<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// A client over one persistent websocket, multiplexing any number of
/// concurrent queries, mutations, and subscriptions.
///
/// Cloning is cheap and every clone drives the same connection. All blocking
/// calls are cancel-safe futures; bound them with [`tokio::time::timeout`]
/// where a deadline is wanted.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

/// A handle for an active subscription.
pub struct Subscription {
    client: Client,
    op: Arc<ClientOperation>,
}

impl Subscription {
    /// Asks the server to cancel the subscription. Idempotent; the
    /// subscription is finished once `complete` arrives.
    pub fn stop(&self) {
        if *self.op.finished.borrow() {
            return;
        }
        self.op.log.info("Queuing stop message");
        self.client.inner.outbox.send(ClientMessage::Stop {
            id: self.op.id.clone(),
        });
    }

    /// Waits until the server completes the subscription. If the connection
    /// dies first, the operation is reaped and the recorded connection error
    /// is returned.
    pub async fn wait_until_finished(&self) -> Result<(), Error> {
        self.client.wait_finished(&self.op).await
    }
}

impl Client {
    /// Dials the server, negotiates the `graphql-ws` sub-protocol, performs
    /// the `connection_init`/`connection_ack` handshake, and starts the
    /// socket tasks.
    pub async fn connect(config: ClientConfig) -> Result<Self, Error> {
        let request = upgrade_request(&config)?;
        let log = Log::new(config.logger.clone());
        log.info("Dialing server");
        let (socket, response) = connect_async(request)
            .await
            .map_err(|error| Error::Transport(format!("failed to dial server: {error}")))?;
        Self::initialize(config, socket, response).await
    }

    /// Like [`Client::connect`], but performs the websocket handshake over a
    /// caller-supplied TCP stream instead of dialing one. This is the hook
    /// for proxied or otherwise customised transports.
    pub async fn connect_on(config: ClientConfig, stream: TcpStream) -> Result<Self, Error> {
        let request = upgrade_request(&config)?;
        let (socket, response) =
            tokio_tungstenite::client_async(request, MaybeTlsStream::Plain(stream))
                .await
                .map_err(|error| {
                    Error::Transport(format!("failed to complete the upgrade handshake: {error}"))
                })?;
        Self::initialize(config, socket, response).await
    }

    async fn initialize(
        config: ClientConfig,
        socket: Socket,
        response: tungstenite::handshake::client::Response,
    ) -> Result<Self, Error> {
        let log = Log::new(config.logger);
        log.info("Connected to server");

        let negotiated = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok());
        if negotiated != Some(SUBPROTOCOL) {
            return Err(Error::Transport(format!(
                "failed to negotiate '{SUBPROTOCOL}' subprotocol"
            )));
        }

        let (sink, stream) = socket.split();
        let (outbox, outbox_rx) = Outbox::new();
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel();
        let (read_loop_closed, _) = watch::channel(false);
        let (closing, _) = watch::channel(false);

        let inner = Arc::new(ClientInner {
            log,
            read_timeout: config.read_timeout,
            outbox: Arc::new(outbox),
            operations: RwLock::new(OperationsState::default()),
            error: ErrorSlot::default(),
            expect_keep_alive: AtomicBool::new(false),
            read_loop_closed,
            closing,
            tasks: Mutex::new(Vec::new()),
        });

        let writer = tokio::spawn(write_loop(
            inner.clone(),
            sink,
            outbox_rx,
            config.write_timeout,
        ));
        let reader = tokio::spawn(read_loop(inner.clone(), stream, inbox_tx));
        inner.tasks.lock().unwrap().extend([writer, reader]);

        inner.log.info("Queuing connection init message");
        inner.outbox.send(ClientMessage::ConnectionInit {
            payload: config
                .initial_payload
                .unwrap_or_else(|| Value::Object(Map::new())),
        });

        // the handshake must complete before any operation may begin
        match inbox_rx.recv().await {
            Some(ServerMessage::ConnectionAck) => {
                inner.log.info("Server acknowledged the connection");
            }
            Some(ServerMessage::ConnectionError { payload }) => {
                teardown(&inner);
                return Err(Error::Protocol(format!(
                    "the server rejected the connection: {payload}"
                )));
            }
            Some(other) => {
                teardown(&inner);
                return Err(Error::Protocol(format!(
                    "server responded to connection init with unexpected message type: {}",
                    other.type_name()
                )));
            }
            None => {
                let error = inner
                    .error
                    .get()
                    .unwrap_or_else(|| Error::Transport("connection closed".into()));
                teardown(&inner);
                return Err(error);
            }
        }

        let dispatcher = tokio::spawn(dispatch_loop(inner.clone(), inbox_rx));
        inner.tasks.lock().unwrap().push(dispatcher);

        Ok(Self { inner })
    }

    /// Runs a query to completion and returns its result.
    pub async fn query(&self, config: QueryConfig) -> Result<DataPayload, Error> {
        self.once(
            config.query,
            config.variables,
            config.operation_name,
            OperationKind::Query,
        )
        .await
    }

    /// Runs a mutation to completion and returns its result.
    pub async fn mutation(&self, config: MutationConfig) -> Result<DataPayload, Error> {
        self.once(
            config.query,
            config.variables,
            config.operation_name,
            OperationKind::Mutation,
        )
        .await
    }

    /// Registers a subscription for repeated updates. Results and errors
    /// arrive through the configured callbacks; the returned handle stops the
    /// subscription and awaits its completion.
    pub fn subscription(&self, config: SubscriptionConfig) -> Result<Subscription, Error> {
        validate_operation_kind(&config.query, OperationKind::Subscription)?;
        let op = self.begin_operation(
            config.query,
            config.variables,
            config.operation_name,
            config.data_callback,
            config.error_callback,
        )?;
        Ok(Subscription {
            client: self.clone(),
            op,
        })
    }

    /// Gracefully closes the client: stops every live operation and awaits
    /// its completion, sends `connection_terminate`, closes the outbox and
    /// socket, and joins the socket tasks. A second call returns
    /// [`Error::AlreadyShutdown`].
    pub async fn shutdown(&self) -> Result<(), Error> {
        {
            let mut state = self.inner.operations.write().unwrap();
            if state.in_shutdown {
                return Err(Error::AlreadyShutdown);
            }
            state.in_shutdown = true;
        }
        self.inner.log.info("Shutting down client");

        let live: Vec<_> = {
            let state = self.inner.operations.read().unwrap();
            state.ops.values().cloned().collect()
        };
        futures::future::join_all(live.into_iter().map(|op| {
            let client = self.clone();
            async move {
                if !*op.finished.borrow() {
                    op.log.info("Queuing stop message");
                    client
                        .inner
                        .outbox
                        .send(ClientMessage::Stop { id: op.id.clone() });
                }
                let _ = client.wait_finished(&op).await;
            }
        }))
        .await;
        self.inner.log.info("Stopped all live operations");

        self.inner.log.info("Queuing connection terminate message");
        self.inner.outbox.send(ClientMessage::ConnectionTerminate);

        // teardown noise past this point is expected, not reportable
        self.inner.error.seal();
        self.inner.outbox.close();
        let _ = self.inner.closing.send(true);

        let handles: Vec<_> = self.inner.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.inner.log.info("Client has shut down");
        Ok(())
    }

    /// Non-blocking, best-effort teardown for error paths. The socket tasks
    /// exit on their own; nothing is awaited.
    pub fn close(&self) {
        self.inner.log.info("Closing client");
        self.inner.operations.write().unwrap().in_shutdown = true;
        teardown(&self.inner);
    }

    async fn once(
        &self,
        query: String,
        variables: Map<String, Value>,
        operation_name: Option<String>,
        kind: OperationKind,
    ) -> Result<DataPayload, Error> {
        validate_operation_kind(&query, kind)?;

        let result: Arc<Mutex<Option<DataPayload>>> = Arc::new(Mutex::new(None));
        let failure: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        let data = result.clone();
        let fail = failure.clone();
        let op = self.begin_operation(
            query,
            variables,
            operation_name,
            Box::new(move |payload| {
                *data.lock().unwrap() = Some(payload);
            }),
            Box::new(move |error| {
                *fail.lock().unwrap() = Some(error);
            }),
        )?;

        self.wait_finished(&op).await?;

        if let Some(error) = failure.lock().unwrap().take() {
            return Err(error);
        }
        result
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Protocol("operation completed without a result".into()))
    }

    fn begin_operation(
        &self,
        query: String,
        variables: Map<String, Value>,
        operation_name: Option<String>,
        data_callback: DataCallback,
        error_callback: ErrorCallback,
    ) -> Result<Arc<ClientOperation>, Error> {
        let mut state = self.inner.operations.write().unwrap();
        if state.in_shutdown {
            return Err(Error::AlreadyShutdown);
        }
        let id = loop {
            let id = Uuid::new_v4().to_string();
            if !state.ops.contains_key(&id) {
                break id;
            }
        };
        let (finished, _) = watch::channel(false);
        let op = Arc::new(ClientOperation {
            id: id.clone(),
            log: self.inner.log.scoped(format!(" (operation: {id})")),
            data_callback,
            error_callback,
            finished,
        });
        state.ops.insert(id.clone(), op.clone());
        drop(state);
        op.log.info("Added a new operation to the client");

        op.log.info("Queuing start message");
        self.inner.outbox.send(ClientMessage::Start {
            id,
            payload: serde_json::to_value(StartPayload {
                query,
                variables,
                operation_name,
                extensions: Map::new(),
            })
            .unwrap_or(Value::Null),
        });
        Ok(op)
    }

    async fn wait_finished(&self, op: &Arc<ClientOperation>) -> Result<(), Error> {
        let mut finished = op.finished.subscribe();
        let mut closed = self.inner.read_loop_closed.subscribe();
        tokio::select! {
            biased;
            _ = flag_raised(&mut finished) => Ok(()),
            _ = flag_raised(&mut closed) => {
                // the connection died underneath the operation; reap it here
                self.inner.operations.write().unwrap().ops.remove(&op.id);
                let _ = op.finished.send(true);
                op.log.info("Cleaned up operation because of a closed connection");
                Err(self
                    .inner
                    .error
                    .get()
                    .unwrap_or_else(|| Error::Transport("connection closed".into())))
            }
        }
    }
}

fn upgrade_request(
    config: &ClientConfig,
) -> Result<tungstenite::handshake::client::Request, Error> {
    let url = format!("ws://{}{}", config.address, config.path);
    let mut request = url.into_client_request().map_err(|error| {
        Error::Transport(format!("failed to build the upgrade request: {error}"))
    })?;
    if let Some(header) = &config.header {
        for (name, value) in header.iter() {
            request.headers_mut().append(name, value.clone());
        }
    }
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
    Ok(request)
}

fn teardown(inner: &Arc<ClientInner>) {
    inner.error.seal();
    inner.outbox.close();
    let _ = inner.closing.send(true);
}

fn validate_operation_kind(query: &str, expected: OperationKind) -> Result<(), Error> {
    let document = graphql_parser::parse_query::<String>(query)
        .map_err(|error| Error::Validation(format!("failed to parse query as valid GraphQL: {error}")))?;
    let mut operation = None;
    for definition in document.definitions {
        let Definition::Operation(candidate) = definition else {
            return Err(Error::Validation(
                "query string may only contain operation definitions".into(),
            ));
        };
        if operation.is_some() {
            return Err(Error::Validation(
                "query string cannot define multiple operations".into(),
            ));
        }
        operation = Some(candidate);
    }
    let Some(operation) = operation else {
        return Err(Error::Validation(
            "query string must define a valid GraphQL operation".into(),
        ));
    };
    let found = match operation {
        OperationDefinition::SelectionSet(_) | OperationDefinition::Query(_) => {
            OperationKind::Query
        }
        OperationDefinition::Mutation(_) => OperationKind::Mutation,
        OperationDefinition::Subscription(_) => OperationKind::Subscription,
    };
    if found != expected {
        return Err(Error::Validation(format!(
            "query string must define a {expected}, instead found '{found}'"
        )));
    }
    Ok(())
}

async fn write_loop(
    inner: Arc<ClientInner>,
    mut sink: SplitSink<Socket, tungstenite::Message>,
    mut outbox_rx: mpsc::UnboundedReceiver<ClientMessage>,
    write_timeout: Duration,
) {
    inner.log.info("Starting write loop");
    while let Some(message) = outbox_rx.recv().await {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(error) => {
                inner
                    .error
                    .record(Error::Protocol(format!("failed to encode message: {error}")));
                break;
            }
        };
        let send = sink.send(tungstenite::Message::text(text));
        let result = if write_timeout.is_zero() {
            send.await.map_err(|error| {
                Error::Transport(format!("failed to write to the connection: {error}"))
            })
        } else {
            match timeout(write_timeout, send).await {
                Ok(result) => result.map_err(|error| {
                    Error::Transport(format!("failed to write to the connection: {error}"))
                }),
                Err(_) => Err(Error::Transport("write deadline exceeded".into())),
            }
        };
        if let Err(error) = result {
            inner.error.record(error);
            break;
        }
    }
    let _ = sink.close().await;
    inner.log.info("Write loop finished");
}

async fn read_loop(
    inner: Arc<ClientInner>,
    mut stream: SplitStream<Socket>,
    inbox: mpsc::UnboundedSender<ServerMessage>,
) {
    inner.log.info("Starting read loop");
    let mut closing = inner.closing.subscribe();
    loop {
        let item = tokio::select! {
            biased;
            _ = flag_raised(&mut closing) => break,
            item = next_frame(&inner, &mut stream) => item,
        };
        match item {
            Ok(Some(message)) => {
                inner.log.info("Read loop queuing a new message for the dispatcher");
                if inbox.send(message).is_err() {
                    break;
                }
            }
            Ok(None) => continue,
            Err(error) => {
                inner.error.record(error);
                break;
            }
        }
    }
    drop(inbox);
    inner.log.info("Read loop finished");
    let _ = inner.read_loop_closed.send(true);
    // force the outbox closed in case the connection failure was not
    // intentional
    inner.outbox.close();
}

async fn next_frame(
    inner: &ClientInner,
    stream: &mut SplitStream<Socket>,
) -> Result<Option<ServerMessage>, Error> {
    let next = stream.next();
    let armed =
        inner.expect_keep_alive.load(Ordering::SeqCst) && !inner.read_timeout.is_zero();
    let item = if armed {
        match timeout(inner.read_timeout, next).await {
            Ok(item) => item,
            Err(_) => return Err(Error::Transport("read deadline exceeded".into())),
        }
    } else {
        next.await
    };
    match item {
        None => Err(Error::Transport("connection closed".into())),
        Some(Err(error)) => Err(Error::Transport(format!(
            "failed to read from the connection: {error}"
        ))),
        Some(Ok(tungstenite::Message::Text(text))) => {
            // a frame that is not JSON corrupts the connection; a JSON frame
            // of an unrecognised type is logged and dropped
            let value: Value = serde_json::from_str(text.as_str())
                .map_err(|error| Error::Protocol(format!("failed to decode message: {error}")))?;
            match serde_json::from_value::<ServerMessage>(value.clone()) {
                Ok(message) => Ok(Some(message)),
                Err(_) => {
                    let kind = value
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("<missing>");
                    inner
                        .log
                        .error(&format!("Server sent unexpected message type: {kind}"));
                    Ok(None)
                }
            }
        }
        Some(Ok(tungstenite::Message::Close(_))) => {
            Err(Error::Transport("server closed the connection".into()))
        }
        Some(Ok(_)) => Ok(None),
    }
}

async fn dispatch_loop(inner: Arc<ClientInner>, mut inbox_rx: mpsc::UnboundedReceiver<ServerMessage>) {
    inner.log.info("Starting dispatcher loop");
    while let Some(message) = inbox_rx.recv().await {
        inner.log.info("Dispatcher received a new message");
        match message {
            ServerMessage::ConnectionKeepAlive => {
                inner.log.info("Received keep-alive message from server");
                inner.expect_keep_alive.store(true, Ordering::SeqCst);
            }
            ServerMessage::Data { id, payload } => {
                let op = inner.operations.read().unwrap().ops.get(&id).cloned();
                match op {
                    Some(op) => match DataPayload::from_value(payload) {
                        Ok(data) => op.deliver_data(data),
                        Err(error) => op
                            .log
                            .error(&format!("Discarding corrupt data payload: {error}")),
                    },
                    None => inner
                        .log
                        .error(&format!("Discarding data payload for unknown operation: {id}")),
                }
            }
            ServerMessage::Error { id, payload } => {
                let op = inner.operations.read().unwrap().ops.get(&id).cloned();
                match op {
                    Some(op) => op.deliver_error(payload),
                    None => inner.log.error(&format!(
                        "Discarding error for an unknown operation: {id}: {payload}"
                    )),
                }
            }
            ServerMessage::Complete { id } => {
                let op = inner.operations.write().unwrap().ops.remove(&id);
                match op {
                    Some(op) => {
                        let _ = op.finished.send(true);
                        op.log.info("Cleaned up completed operation");
                    }
                    None => inner.log.error(&format!(
                        "Server indicated an unknown operation was completed: {id}"
                    )),
                }
            }
            ServerMessage::ConnectionError { payload } => {
                inner
                    .log
                    .error(&format!("Server ignored a message due to parsing errors: {payload}"));
            }
            ServerMessage::ConnectionAck => {
                inner.log.error("Server sent an unexpected connection_ack");
            }
        }
    }
    inner.log.info("Dispatcher loop finished");
}
