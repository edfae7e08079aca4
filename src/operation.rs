use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use graphql_parser::query::{Definition, Document, OperationDefinition, Selection, SelectionSet};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::time::{Instant, sleep};

use crate::{
    client_message::StartPayload,
    connection::Connection,
    log::Log,
    schema::{Schema, Update},
    server_message::ServerMessage,
    util::{Outbox, flag_raised},
};

/// Server-side state for one registered subscription.
pub(crate) struct Operation {
    pub(crate) id: String,
    payload: StartPayload,
    log: Log,
    schema: Arc<dyn Schema>,
    outbox: Arc<Outbox<ServerMessage>>,
    field_set: OnceLock<Update>,
    delivery: Mutex<DeliveryState>,
    updated: watch::Sender<Instant>,
    stopped: watch::Sender<bool>,
    polling_interval: Duration,
}

/// Delivery bookkeeping shared by executes and the terminal `complete`.
/// Holding one lock across the stopped check and the send is what keeps a
/// publish-triggered execute from slipping a `data` frame in behind the
/// `complete` that a racing `stop` already queued.
#[derive(Default)]
struct DeliveryState {
    last_digest: Option<[u8; 32]>,
    stopped: bool,
}

/// Handles a client's `start` message: validates the payload, parses and
/// validates the query, delivers the first execution, and registers the
/// operation for polling when the document subscribes to anything.
pub(crate) async fn start(conn: &Arc<Connection>, id: String, payload: serde_json::Value) {
    conn.log.info("Client commencing a new operation");

    let payload: StartPayload = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(error) => {
            return reject(conn, &id, format!("payload is invalid for a start message: {error}"));
        }
    };
    if !payload.extensions.is_empty() {
        return reject(conn, &id, "extensions are not supported".into());
    }

    // the document borrows the query text, so parse from a local copy and
    // let the payload move into the operation untouched
    let query = payload.query.clone();
    let document = match graphql_parser::parse_query::<String>(&query) {
        Ok(document) => document,
        Err(error) => return reject(conn, &id, error.to_string()),
    };
    if let Err(error) = conn.schema.validate(&document) {
        return reject(conn, &id, error.to_string());
    }

    let (updated, _) = watch::channel(Instant::now());
    let (stopped, _) = watch::channel(false);
    let log = conn.log.scoped(format!(" (operation: {id})"));
    let op = Arc::new(Operation {
        id,
        log,
        schema: conn.schema.clone(),
        outbox: conn.outbox.clone(),
        field_set: OnceLock::new(),
        delivery: Mutex::new(DeliveryState::default()),
        updated,
        stopped,
        polling_interval: conn.polling_interval,
        payload,
    });

    // The first tick always runs, and runs before the field set is derived.
    op.execute().await;

    let (requires_subscription, fields) = subscription_fields(&document);
    if !requires_subscription {
        op.finish();
        return;
    }

    let field_set = match conn.schema_index.new_update(&fields) {
        Ok(update) => update,
        Err(error) => return reject(conn, &op.id, error.to_string()),
    };
    let _ = op.field_set.set(field_set);

    match conn.operations.add(op.clone()) {
        Ok(()) => {
            op.log.info("Registered a new subscription operation");
            tokio::spawn(poll_loop(op));
        }
        Err(AddRejected::Duplicate) => {
            reject(conn, &op.id, format!("operation '{}' already exists", op.id));
        }
        // the connection is closing; the socket teardown reaps the client side
        Err(AddRejected::Closed) => {}
    }
}

/// Handles a client's `stop` message.
pub(crate) fn stop(conn: &Connection, id: &str) {
    conn.log.info("Client operation terminated");
    if let Some(op) = conn.operations.remove(id) {
        op.finish();
        op.cancel();
    }
}

/// Reports an operation-scoped failure: `error` followed by `complete`, with
/// the operation left unregistered.
fn reject(conn: &Connection, id: &str, message: String) {
    conn.log.error(&message);
    conn.outbox.send(ServerMessage::error(id, message));
    conn.outbox.send(ServerMessage::complete(id));
}

impl Operation {
    /// The leaves this operation subscribed to, once derived.
    pub(crate) fn field_set(&self) -> Option<&Update> {
        self.field_set.get()
    }

    /// Runs the executor once and forwards the result. A result whose
    /// serialized form matches the previous delivery is suppressed, as is any
    /// result arriving after the operation was stopped; either way the
    /// poller's idle timer is reset.
    pub(crate) async fn execute(&self) {
        let result = self.schema.execute(&self.payload).await;
        let message = ServerMessage::data(self.id.as_str(), &result);
        let encoded = match serde_json::to_vec(&message) {
            Ok(encoded) => encoded,
            Err(error) => {
                self.log.error(&format!("Failed to encode execution result: {error}"));
                return;
            }
        };
        let digest: [u8; 32] = Sha256::digest(&encoded).into();

        {
            let mut delivery = self.delivery.lock().unwrap();
            let repeat = delivery.last_digest == Some(digest);
            if !repeat {
                delivery.last_digest = Some(digest);
            }
            if !repeat && !delivery.stopped {
                self.outbox.send(message);
            }
        }
        let _ = self.updated.send(Instant::now());
    }

    /// Sends `complete`, retiring the operation's id on the client. Marks the
    /// operation stopped under the delivery lock first, so no in-flight
    /// execute can enqueue `data` behind the `complete`. Idempotent.
    pub(crate) fn finish(&self) {
        let mut delivery = self.delivery.lock().unwrap();
        if delivery.stopped {
            return;
        }
        delivery.stopped = true;
        self.outbox.send(ServerMessage::complete(self.id.as_str()));
    }

    /// Stops the poller and suppresses further deliveries without sending
    /// anything.
    pub(crate) fn cancel(&self) {
        self.delivery.lock().unwrap().stopped = true;
        let _ = self.stopped.send(true);
    }
}

/// Why an operation could not be added to a table.
pub(crate) enum AddRejected {
    Closed,
    Duplicate,
}

/// Safety-net re-execution for subscriptions. Executes whenever
/// `polling_interval` elapses with no execution having happened elsewhere;
/// an external poke resets the timer without executing.
async fn poll_loop(op: Arc<Operation>) {
    let interval = op.polling_interval;
    if interval.is_zero() {
        return;
    }
    op.log.info("Polling subscription operation");
    let mut stopped = op.stopped.subscribe();
    let mut updated = op.updated.subscribe();
    let mut last_update = Instant::now();
    loop {
        let wait = interval.saturating_sub(last_update.elapsed());
        tokio::select! {
            _ = flag_raised(&mut stopped) => break,
            changed = updated.changed() => {
                if changed.is_err() {
                    break;
                }
                last_update = *updated.borrow_and_update();
            }
            _ = sleep(wait) => {
                if *op.stopped.borrow() {
                    break;
                }
                op.execute().await;
                // cool-down: a schema changing faster than the interval must
                // not pin the executor
                tokio::select! {
                    _ = flag_raised(&mut stopped) => break,
                    _ = sleep(interval / 2) => {}
                }
            }
        }
    }
    op.log.info("Stopped polling subscription operation");
}

/// Walks the document's subscription operations, collecting the dotted path
/// of every selected field that has no sub-selection. Fragments do not
/// contribute to field sets.
fn subscription_fields(document: &Document<'_, String>) -> (bool, Vec<String>) {
    let mut requires_subscription = false;
    let mut fields = Vec::new();
    for definition in &document.definitions {
        if let Definition::Operation(OperationDefinition::Subscription(subscription)) = definition
        {
            requires_subscription = true;
            collect_selection_leaves(&subscription.selection_set, String::new(), &mut fields);
        }
    }
    (requires_subscription, fields)
}

fn collect_selection_leaves(
    selection_set: &SelectionSet<'_, String>,
    prefix: String,
    out: &mut Vec<String>,
) {
    for selection in &selection_set.items {
        let Selection::Field(field) = selection else {
            continue;
        };
        let path = format!("{prefix}{}", field.name);
        if field.selection_set.items.is_empty() {
            out.push(path);
        } else {
            collect_selection_leaves(&field.selection_set, format!("{path}."), out);
        }
    }
}
