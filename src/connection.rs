use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::{
    client_message::ClientMessage,
    error::Error,
    log::Log,
    operation::{self, AddRejected, Operation},
    schema::{Schema, SchemaIndex},
    server_message::ServerMessage,
    util::{ErrorSlot, Outbox, flag_raised},
};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// A decoded inbound frame. Frames that are valid JSON but not a recognised
/// protocol message are kept, so the dispatcher can answer them with
/// `connection_error` instead of tearing the connection down.
enum Inbound {
    Message(ClientMessage),
    Unsupported(String),
}

/// Everything a connection inherits from its server's configuration.
#[derive(Clone)]
pub(crate) struct ConnectionSettings {
    pub(crate) schema: Arc<dyn Schema>,
    pub(crate) schema_index: Arc<SchemaIndex>,
    pub(crate) enable_keep_alive: bool,
    pub(crate) polling_interval: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
}

/// The connection's registered operations. Adds are rejected once the table
/// is closed; closing is idempotent.
pub(crate) struct OperationTable {
    state: RwLock<TableState>,
}

struct TableState {
    closed: bool,
    ops: HashMap<String, Arc<Operation>>,
}

impl OperationTable {
    fn new() -> Self {
        Self {
            state: RwLock::new(TableState {
                closed: false,
                ops: HashMap::new(),
            }),
        }
    }

    pub(crate) fn add(&self, op: Arc<Operation>) -> Result<(), AddRejected> {
        let mut state = self.state.write().unwrap();
        if state.closed {
            return Err(AddRejected::Closed);
        }
        if state.ops.contains_key(&op.id) {
            return Err(AddRejected::Duplicate);
        }
        state.ops.insert(op.id.clone(), op);
        Ok(())
    }

    pub(crate) fn remove(&self, id: &str) -> Option<Arc<Operation>> {
        self.state.write().unwrap().ops.remove(id)
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Operation>> {
        self.state.read().unwrap().ops.values().cloned().collect()
    }

    fn shutdown(&self) -> Vec<Arc<Operation>> {
        let mut state = self.state.write().unwrap();
        state.closed = true;
        state.ops.drain().map(|(_, op)| op).collect()
    }
}

/// Per-socket server state. Four tasks cooperate over it: the socket reader,
/// the socket writer (the only task that touches the sink), the inbox
/// dispatcher, and the keep-alive ticker.
pub(crate) struct Connection {
    pub(crate) id: Uuid,
    pub(crate) log: Log,
    pub(crate) schema: Arc<dyn Schema>,
    pub(crate) schema_index: Arc<SchemaIndex>,
    pub(crate) polling_interval: Duration,
    pub(crate) outbox: Arc<Outbox<ServerMessage>>,
    pub(crate) operations: OperationTable,
    enable_keep_alive: bool,
    read_timeout: Duration,
    write_timeout: Duration,
    error: ErrorSlot,
    closed: watch::Sender<bool>,
    close_guard: Mutex<bool>,
}

impl Connection {
    pub(crate) fn new(
        settings: &ConnectionSettings,
        log: Log,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (outbox, outbox_rx) = Outbox::new();
        let (closed, _) = watch::channel(false);
        (
            Arc::new(Self {
                id: Uuid::new_v4(),
                log,
                schema: settings.schema.clone(),
                schema_index: settings.schema_index.clone(),
                polling_interval: settings.polling_interval,
                outbox: Arc::new(outbox),
                operations: OperationTable::new(),
                enable_keep_alive: settings.enable_keep_alive,
                read_timeout: settings.read_timeout,
                write_timeout: settings.write_timeout,
                error: ErrorSlot::default(),
                closed,
                close_guard: Mutex::new(false),
            }),
            outbox_rx,
        )
    }

    /// Runs the connection to completion. Returns once every task has been
    /// joined, at which point the caller unregisters the connection.
    pub(crate) async fn run(
        self: Arc<Self>,
        socket: WebSocket,
        outbox_rx: mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        let (sink, stream) = socket.split();
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel();
        let (ka_tx, ka_rx) = mpsc::channel::<()>(1);

        let reader = tokio::spawn(Self::read_loop(self.clone(), stream, inbox_tx));
        let writer = tokio::spawn(Self::write_loop(self.clone(), sink, outbox_rx, ka_tx));
        let keep_alive = tokio::spawn(Self::keep_alive_loop(self.clone(), ka_rx));

        // the protocol handshake: the first frame must be connection_init
        let mut dispatcher = None;
        match inbox_rx.recv().await {
            Some(Inbound::Message(ClientMessage::ConnectionInit { .. })) => {
                self.log.info("Received message from client: connection_init");
                self.outbox.send(ServerMessage::ConnectionAck);
                dispatcher = Some(tokio::spawn(Self::inbox_loop(self.clone(), inbox_rx)));
            }
            Some(_) => {
                let error = Error::Protocol("client failed to send connection_init".into());
                self.log.error(&error.to_string());
                self.close(Some(error));
            }
            None => self.close(None),
        }

        let _ = reader.await;
        let _ = writer.await;
        let _ = keep_alive.await;
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
        }

        // the first error any task recorded is the reason the connection died
        if let Some(error) = self.error.get() {
            self.log
                .error(&format!("Connection terminated with error: {error}"));
        }
    }

    /// Initiates connection teardown: reaps the operations, closes the
    /// outbox (which unblocks the writer), and signals the reader. Idempotent;
    /// only the first caller's error is recorded.
    pub(crate) fn close(&self, error: Option<Error>) {
        {
            let mut closed = self.close_guard.lock().unwrap();
            if *closed {
                return;
            }
            *closed = true;
        }
        if let Some(error) = error {
            self.error.record(error);
        }
        for op in self.operations.shutdown() {
            op.cancel();
        }
        self.outbox.close();
        let _ = self.closed.send(true);
    }

    async fn read_loop(
        conn: Arc<Self>,
        mut stream: SplitStream<WebSocket>,
        inbox: mpsc::UnboundedSender<Inbound>,
    ) {
        conn.log.info("Read loop commenced");
        let mut closed = conn.closed.subscribe();
        loop {
            let frame = tokio::select! {
                biased;
                _ = flag_raised(&mut closed) => break,
                frame = Self::read_frame(&mut stream, conn.read_timeout) => frame,
            };
            match frame {
                Ok(Some(message)) => {
                    if inbox.send(message).is_err() {
                        break;
                    }
                }
                Ok(None) => continue,
                Err(error) => {
                    conn.error.record(error);
                    break;
                }
            }
        }
        drop(inbox);
        conn.log.info("Read loop terminated");
        conn.close(None);
    }

    async fn read_frame(
        stream: &mut SplitStream<WebSocket>,
        read_timeout: Duration,
    ) -> Result<Option<Inbound>, Error> {
        let next = stream.next();
        let item = if read_timeout.is_zero() {
            next.await
        } else {
            match timeout(read_timeout, next).await {
                Ok(item) => item,
                Err(_) => return Err(Error::Transport("read deadline exceeded".into())),
            }
        };
        match item {
            None => Err(Error::Transport("connection closed".into())),
            Some(Err(error)) => Err(Error::Transport(format!("failed to read message: {error}"))),
            Some(Ok(Message::Text(text))) => {
                // a frame that is not JSON corrupts the connection; a JSON
                // frame of an unrecognised type only draws a protocol reply
                let value: Value = serde_json::from_str(text.as_str()).map_err(|error| {
                    Error::Protocol(format!("failed to decode message: {error}"))
                })?;
                match serde_json::from_value::<ClientMessage>(value.clone()) {
                    Ok(message) => Ok(Some(Inbound::Message(message))),
                    Err(_) => {
                        let kind = value
                            .get("type")
                            .and_then(Value::as_str)
                            .unwrap_or("<missing>")
                            .to_owned();
                        Ok(Some(Inbound::Unsupported(kind)))
                    }
                }
            }
            Some(Ok(Message::Close(_))) => {
                Err(Error::Transport("client closed the connection".into()))
            }
            Some(Ok(_)) => Ok(None),
        }
    }

    async fn write_loop(
        conn: Arc<Self>,
        mut sink: SplitSink<WebSocket, Message>,
        mut outbox_rx: mpsc::UnboundedReceiver<ServerMessage>,
        ka_tx: mpsc::Sender<()>,
    ) {
        conn.log.info("Write loop commenced");
        while let Some(message) = outbox_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(error) => {
                    conn.log.error(&format!("Failed to encode message: {error}"));
                    continue;
                }
            };
            if let Err(error) = Self::write_frame(&mut sink, text, conn.write_timeout).await {
                conn.log.error(&format!("Failed to send message: {error}"));
                conn.error.record(error);
                break;
            }
            // reset the keep-alive idle timer; a full channel means a tick is
            // already pending, which is just as good
            let _ = ka_tx.try_send(());
            conn.log
                .info(&format!("Sent a message to the client: {}", message.type_name()));
        }
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
        conn.log.info("Write loop terminated");
        conn.close(None);
    }

    async fn write_frame(
        sink: &mut SplitSink<WebSocket, Message>,
        text: String,
        write_timeout: Duration,
    ) -> Result<(), Error> {
        let send = sink.send(Message::Text(text.into()));
        if write_timeout.is_zero() {
            send.await
                .map_err(|error| Error::Transport(format!("failed to write to the connection: {error}")))
        } else {
            match timeout(write_timeout, send).await {
                Ok(result) => result.map_err(|error| {
                    Error::Transport(format!("failed to write to the connection: {error}"))
                }),
                Err(_) => Err(Error::Transport("write deadline exceeded".into())),
            }
        }
    }

    async fn keep_alive_loop(conn: Arc<Self>, mut ka_rx: mpsc::Receiver<()>) {
        if !conn.enable_keep_alive {
            return;
        }
        conn.log.info("Keep alive routine commenced");
        loop {
            tokio::select! {
                poked = ka_rx.recv() => {
                    if poked.is_none() {
                        break;
                    }
                }
                _ = sleep(KEEP_ALIVE_INTERVAL) => {
                    conn.outbox.send(ServerMessage::ConnectionKeepAlive);
                }
            }
        }
        conn.log.info("Keep alive routine terminated");
    }

    async fn inbox_loop(conn: Arc<Self>, mut inbox_rx: mpsc::UnboundedReceiver<Inbound>) {
        conn.log.info("Inbox loop commenced");
        while let Some(inbound) = inbox_rx.recv().await {
            let message = match inbound {
                Inbound::Message(message) => message,
                Inbound::Unsupported(kind) => {
                    let error = format!("received unsupported message type: {kind}");
                    conn.log.error(&error);
                    conn.outbox.send(ServerMessage::ConnectionError {
                        payload: Value::String(error),
                    });
                    continue;
                }
            };
            match message {
                ClientMessage::Start { id, payload } => {
                    operation::start(&conn, id, payload).await;
                }
                ClientMessage::Stop { id } => operation::stop(&conn, &id),
                ClientMessage::ConnectionTerminate => {
                    conn.log
                        .info("Terminating connection at the request of the client");
                    conn.close(None);
                }
                ClientMessage::ConnectionInit { .. } => {
                    let error = "received unsupported message type: connection_init";
                    conn.log.error(error);
                    conn.outbox.send(ServerMessage::ConnectionError {
                        payload: Value::String(error.into()),
                    });
                }
            }
        }
        conn.log.info("Inbox loop terminated");
    }
}
