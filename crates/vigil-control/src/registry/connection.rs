//! In-memory registry of live worker control channels.
//!
//! Only routes outbound messages and ACK waiters. Ownership lives in the
//! lease table.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, info};

use vigil_core::protocol::{Ack, ControlMessage};

/// An open control channel to one worker.
pub struct WorkerConnection {
    pub worker_id: String,
    /// Distinguishes successive connections from the same worker.
    pub session_id: String,
    pub tenant_id: String,
    pub site_id: String,
    tx: mpsc::Sender<ControlMessage>,
    /// ACK waiters keyed by intent ID.
    pending: Arc<RwLock<HashMap<String, oneshot::Sender<Ack>>>>,
}

impl WorkerConnection {
    pub fn new(
        worker_id: String,
        session_id: String,
        tenant_id: String,
        site_id: String,
        tx: mpsc::Sender<ControlMessage>,
    ) -> Self {
        Self {
            worker_id,
            session_id,
            tenant_id,
            site_id,
            tx,
            pending: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Send a message to the worker.
    pub async fn send(
        &self,
        msg: ControlMessage,
    ) -> Result<(), mpsc::error::SendError<ControlMessage>> {
        self.tx.send(msg).await
    }

    /// Register an ACK waiter for an intent.
    pub async fn register_pending(&self, intent_id: String) -> oneshot::Receiver<Ack> {
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(intent_id, tx);
        rx
    }

    /// Hand an ACK to its waiter, if any.
    pub async fn complete_pending(&self, ack: Ack) -> bool {
        if let Some(tx) = self.pending.write().await.remove(&ack.intent_id) {
            tx.send(ack).is_ok()
        } else {
            false
        }
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub async fn cancel_all_pending(&self) {
        self.pending.write().await.clear();
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }
}

/// Thread-safe registry of connected workers.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<String, Arc<WorkerConnection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, replacing any previous one for the worker.
    pub async fn register(&self, conn: WorkerConnection) -> Arc<WorkerConnection> {
        let conn = Arc::new(conn);
        let previous = self
            .connections
            .write()
            .await
            .insert(conn.worker_id.clone(), Arc::clone(&conn));
        if let Some(previous) = previous {
            debug!(
                worker_id = %conn.worker_id,
                old_session = %previous.session_id,
                "Replaced existing worker connection"
            );
            previous.cancel_all_pending().await;
        }
        info!(worker_id = %conn.worker_id, session_id = %conn.session_id, "Worker connection registered");
        conn
    }

    /// Remove a worker's connection if it is still the given session. A
    /// session that was superseded by a reconnect leaves the new one alone.
    pub async fn unregister(&self, worker_id: &str, session_id: &str) -> bool {
        let mut connections = self.connections.write().await;
        let current = connections
            .get(worker_id)
            .is_some_and(|c| c.session_id == session_id);
        if current {
            connections.remove(worker_id);
            info!(worker_id, session_id, "Worker connection unregistered");
        }
        current
    }

    pub async fn get(&self, worker_id: &str) -> Option<Arc<WorkerConnection>> {
        self.connections.read().await.get(worker_id).cloned()
    }

    pub async fn is_connected(&self, worker_id: &str) -> bool {
        self.connections.read().await.contains_key(worker_id)
    }

    /// Send to a worker if it is connected. Returns whether the message was
    /// handed to its channel.
    pub async fn send_to(&self, worker_id: &str, msg: ControlMessage) -> bool {
        let Some(conn) = self.get(worker_id).await else {
            return false;
        };
        conn.send(msg).await.is_ok()
    }

    pub async fn connected_workers(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
