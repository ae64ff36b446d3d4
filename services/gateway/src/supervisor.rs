//! Connection supervision.
//!
//! One temporary child task per connection: a crashed connection is never
//! restarted and never disturbs its siblings.  The supervisor owns a
//! registry of live connections (metadata plus each actor's inbox sender)
//! and drives graceful shutdown.

use gate_protocol::Channel;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Messages injected into a connection actor's inbox.
#[derive(Debug)]
pub enum ActorMessage {
    /// A subscription push produced by an engine callback.
    Push {
        subscription_id: String,
        channel: Channel,
        data: Value,
    },
    /// Shutdown announcement; the actor forwards a `system` frame and keeps
    /// serving until the grace period ends.
    ShutdownNotice { grace_period_ms: u64 },
    /// Close the connection with code 1000 `server_shutdown` and tear down.
    Terminate,
}

/// Registry metadata for one live connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMeta {
    pub connection_id: String,
    pub remote_address: String,
    pub connected_at: i64,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub store_subscription_count: usize,
    pub rules_subscription_count: usize,
}

pub struct ConnectionHandle {
    meta: Mutex<ConnectionMeta>,
    pub inbox: mpsc::Sender<ActorMessage>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHandle {
    pub fn meta(&self) -> ConnectionMeta {
        self.meta
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_auth(&self, user_id: Option<String>) {
        let mut meta = self.meta.lock().unwrap_or_else(PoisonError::into_inner);
        meta.authenticated = user_id.is_some();
        meta.user_id = user_id;
    }

    pub fn set_subscription_counts(&self, store: usize, rules: usize) {
        let mut meta = self.meta.lock().unwrap_or_else(PoisonError::into_inner);
        meta.store_subscription_count = store;
        meta.rules_subscription_count = rules;
    }
}

pub struct ConnectionSupervisor {
    connections: RwLock<HashMap<String, Arc<ConnectionHandle>>>,
    accepting: AtomicBool,
}

impl Default for ConnectionSupervisor {
    fn default() -> Self {
        ConnectionSupervisor::new()
    }
}

impl ConnectionSupervisor {
    pub fn new() -> Self {
        ConnectionSupervisor {
            connections: RwLock::new(HashMap::new()),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    pub fn list_connections(&self) -> Vec<ConnectionMeta> {
        let mut metas: Vec<ConnectionMeta> =
            self.read().values().map(|h| h.meta()).collect();
        metas.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        metas
    }

    pub fn register(
        &self,
        connection_id: &str,
        remote_address: &str,
        inbox: mpsc::Sender<ActorMessage>,
    ) -> Arc<ConnectionHandle> {
        let handle = Arc::new(ConnectionHandle {
            meta: Mutex::new(ConnectionMeta {
                connection_id: connection_id.to_owned(),
                remote_address: remote_address.to_owned(),
                connected_at: gate_core::epoch_ms(),
                authenticated: false,
                user_id: None,
                store_subscription_count: 0,
                rules_subscription_count: 0,
            }),
            inbox,
            join: Mutex::new(None),
        });
        self.write()
            .insert(connection_id.to_owned(), Arc::clone(&handle));
        handle
    }

    pub fn attach_join(&self, connection_id: &str, join: JoinHandle<()>) {
        if let Some(handle) = self.read().get(connection_id) {
            *handle.join.lock().unwrap_or_else(PoisonError::into_inner) = Some(join);
        }
    }

    pub fn remove(&self, connection_id: &str) {
        self.write().remove(connection_id);
    }

    /// Graceful shutdown.
    ///
    /// With a grace period: refuse new accepts, broadcast a shutdown notice,
    /// wait for voluntary disconnects, then force-terminate stragglers.
    /// Without one, go straight to force termination.
    pub async fn stop(&self, grace_period_ms: Option<u64>) {
        self.accepting.store(false, Ordering::SeqCst);
        info!(connections = self.count(), "supervisor stopping");

        if let Some(grace) = grace_period_ms.filter(|g| *g > 0) {
            for handle in self.snapshot() {
                let _ = handle.inbox.try_send(ActorMessage::ShutdownNotice {
                    grace_period_ms: grace,
                });
            }
            self.wait_for_drain(Duration::from_millis(grace)).await;
        }

        for handle in self.snapshot() {
            if handle.inbox.try_send(ActorMessage::Terminate).is_err() {
                // Inbox gone or jammed; fall back to aborting the task.
                if let Some(join) = handle
                    .join
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                {
                    join.abort();
                }
            }
        }
        self.wait_for_drain(Duration::from_millis(1000)).await;

        // Anything still registered is stuck past its suspension point.
        let stragglers: Vec<(String, Arc<ConnectionHandle>)> = self
            .read()
            .iter()
            .map(|(id, h)| (id.clone(), Arc::clone(h)))
            .collect();
        for (id, handle) in stragglers {
            warn!(connection_id = %id, "force-aborting connection");
            if let Some(join) = handle
                .join
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                join.abort();
            }
            self.remove(&id);
        }
        debug!("supervisor stopped");
    }

    async fn wait_for_drain(&self, budget: Duration) {
        let deadline = tokio::time::Instant::now() + budget;
        while self.count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.read().values().map(Arc::clone).collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<ConnectionHandle>>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<ConnectionHandle>>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes the connection from the registry on every exit path, including
/// panic unwind of the actor task.
pub struct RegistryGuard {
    pub supervisor: Arc<ConnectionSupervisor>,
    pub connection_id: String,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.supervisor.remove(&self.connection_id);
        debug!(connection_id = %self.connection_id, "connection unregistered");
    }
}
