//! Per-connection change relay.
//!
//! A [`RelayConnection`] owns one store session and one forwarding task per
//! collection. Each task waits on its change stream and pushes a
//! [`ChangeFeed`] for every event that carries a payload into a bounded
//! channel the transport drains. The tasks share a cancellation token and
//! are released together when the connection closes or is dropped.

use crate::store::{ChangeStream, DocumentStore, StoreSession};
use crate::types::Collection;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// One forwarded change: the collection it happened in and the new row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFeed {
    pub table: Collection,
    pub value: Value,
}

/// Lifecycle of a relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Connecting,
    Subscribed,
    Closed,
}

/// Attaches relays to clients. Holds nothing but the store handle, so every
/// attached connection gets its own session and subscriptions.
#[derive(Clone)]
pub struct ChangeRelay {
    store: Arc<dyn DocumentStore>,
}

impl ChangeRelay {
    /// Create a relay over `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Open a session and subscribe to every collection, forwarding into
    /// `sink`.
    ///
    /// If no session can be opened the returned connection is already
    /// [`RelayState::Closed`] and nothing is ever sent. A collection whose
    /// subscription fails is logged and skipped.
    pub async fn attach(&self, sink: mpsc::Sender<ChangeFeed>) -> RelayConnection {
        let mut conn = RelayConnection {
            state: RelayState::Connecting,
            subscriptions: SubscriptionSet::new(),
            session: None,
        };

        let mut session = match self.store.open_session().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Relay could not open a store session");
                conn.state = RelayState::Closed;
                return conn;
            }
        };

        for collection in Collection::ALL {
            match session.changes(collection).await {
                Ok(stream) => conn.subscriptions.spawn(collection, stream, sink.clone()),
                Err(e) => warn!(%collection, error = %e, "Subscription failed; skipping collection"),
            }
        }

        conn.session = Some(session);
        conn.state = RelayState::Subscribed;
        info!(
            subscriptions = conn.subscriptions.len(),
            backend = self.store.backend(),
            "Relay subscribed"
        );
        conn
    }
}

/// A relay bound to one client.
pub struct RelayConnection {
    state: RelayState,
    // Declared before the session so its tasks are cancelled first on drop.
    subscriptions: SubscriptionSet,
    session: Option<Box<dyn StoreSession>>,
}

impl RelayConnection {
    /// Current lifecycle state.
    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Collections whose forwarding task is still running.
    pub fn live_subscriptions(&self) -> Vec<Collection> {
        self.subscriptions.live()
    }

    /// Cancel every subscription, wait for the forwarding tasks to finish and
    /// release the session. Idempotent.
    pub async fn close(&mut self) {
        if self.state == RelayState::Closed {
            return;
        }
        self.subscriptions.shutdown().await;
        self.session = None;
        self.state = RelayState::Closed;
        debug!("Relay closed");
    }
}

/// The forwarding tasks of one connection, released as a group.
struct SubscriptionSet {
    token: CancellationToken,
    tasks: Vec<(Collection, JoinHandle<()>)>,
}

impl SubscriptionSet {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    fn spawn(&mut self, collection: Collection, stream: ChangeStream, sink: mpsc::Sender<ChangeFeed>) {
        let token = self.token.child_token();
        let handle = tokio::spawn(forward(collection, stream, sink, token));
        self.tasks.push((collection, handle));
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }

    fn live(&self) -> Vec<Collection> {
        self.tasks
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(collection, _)| *collection)
            .collect()
    }

    async fn shutdown(&mut self) {
        self.token.cancel();
        for (collection, handle) in self.tasks.drain(..) {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(%collection, error = %e, "Forwarding task panicked");
                }
            }
        }
    }
}

impl Drop for SubscriptionSet {
    fn drop(&mut self) {
        self.token.cancel();
        for (_, handle) in &self.tasks {
            handle.abort();
        }
    }
}

/// Receive loop of one subscription. Stops on cancellation, on a stream
/// error or end, and when the sink is gone.
async fn forward(
    collection: Collection,
    mut stream: ChangeStream,
    sink: mpsc::Sender<ChangeFeed>,
    token: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            item = stream.next() => item,
        };

        let event = match item {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!(%collection, error = %e, "Change stream failed; subscription stopped");
                break;
            }
            None => {
                debug!(%collection, "Change stream ended");
                break;
            }
        };

        if event.is_heartbeat() {
            trace!(%collection, "Heartbeat skipped");
            continue;
        }

        let feed = ChangeFeed {
            table: collection,
            value: event.new_value.unwrap_or(Value::Null),
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            sent = sink.send(feed) => {
                if sent.is_err() {
                    debug!(%collection, "Relay sink closed");
                    break;
                }
            }
        }
    }
}
