use std::sync::Mutex;

use serde::{Deserialize, Deserializer};
use tokio::sync::{mpsc, watch};

use crate::error::Error;

/// Deserializes a `null`able value by placing the [`Default`] value instead of `null`.
pub(crate) fn default_for_null<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Resolves once the watched flag is raised. Also resolves if the sender is
/// gone, since nothing can raise the flag after that.
pub(crate) async fn flag_raised(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// The sending half of a connection's outgoing message queue.
///
/// The queue is closed exactly once; messages sent after that are dropped
/// silently so that racing senders never observe an error.
pub(crate) struct Outbox<T> {
    tx: Mutex<Option<mpsc::UnboundedSender<T>>>,
}

impl<T> Outbox<T> {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    pub(crate) fn send(&self, message: T) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(message);
        }
    }

    pub(crate) fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

/// A write-once error slot. The first recorded error sticks; sealing the slot
/// discards everything reported afterwards, which teardown paths use to keep
/// expected socket noise out of the way.
#[derive(Default)]
pub(crate) struct ErrorSlot {
    state: Mutex<ErrorSlotState>,
}

#[derive(Default)]
struct ErrorSlotState {
    reported: bool,
    error: Option<Error>,
}

impl ErrorSlot {
    pub(crate) fn record(&self, error: Error) {
        let mut state = self.state.lock().unwrap();
        if !state.reported {
            state.reported = true;
            state.error = Some(error);
        }
    }

    pub(crate) fn seal(&self) {
        self.state.lock().unwrap().reported = true;
    }

    pub(crate) fn get(&self) -> Option<Error> {
        self.state.lock().unwrap().error.clone()
    }
}
