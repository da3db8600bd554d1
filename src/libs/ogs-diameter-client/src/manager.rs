//! Pool of peer connections
//!
//! Connections are keyed by [`PeerConnConfig`]. Lookups take the read side
//! of the pool lock; the write side is held only while the map changes and
//! never across a dial.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::{PeerConnConfig, PeerServerConfig};
use crate::connection::Connection;
use crate::error::{DiameterError, DiameterResult};
use crate::link::{Dialer, LinkHandle, LinkId};

/// Shared connection pool with admission control
pub struct ConnectionManager {
    dialer: Arc<dyn Dialer>,
    connections: RwLock<HashMap<PeerConnConfig, Arc<Connection>>>,
    disabled: Arc<AtomicBool>,
    reenable: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            connections: RwLock::new(HashMap::new()),
            disabled: Arc::new(AtomicBool::new(false)),
            reenable: Mutex::new(None),
        }
    }

    /// Pooled connection for `server`, created (and dialed in the
    /// background) on first use.
    pub async fn get_or_create(&self, server: &PeerServerConfig) -> DiameterResult<Arc<Connection>> {
        if self.is_disabled() {
            return Err(DiameterError::ManagerDisabled);
        }

        if let Some(conn) = self.connections.read().await.get(&server.conn) {
            return Ok(conn.clone());
        }

        let conn = {
            let mut connections = self.connections.write().await;
            // disable_for flips the flag under this lock
            if self.is_disabled() {
                return Err(DiameterError::ManagerDisabled);
            }
            if let Some(conn) = connections.get(&server.conn) {
                return Ok(conn.clone());
            }
            let conn = Arc::new(Connection::new(server.clone(), self.dialer.clone()));
            connections.insert(server.conn.clone(), conn.clone());
            conn
        };
        log::debug!("[{}] new pooled connection", server.conn);

        let initial = conn.clone();
        let disabled = self.disabled.clone();
        tokio::spawn(async move {
            if disabled.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = initial.get_or_dial().await {
                log::warn!("[{}] initial dial failed: {e}", initial.server().conn);
            }
        });
        Ok(conn)
    }

    /// Pool a link the peer opened towards us so requests to `server` use it.
    ///
    /// A connection already pooled under the same key is replaced and closed.
    pub async fn adopt(
        &self,
        link: LinkHandle,
        server: &PeerServerConfig,
    ) -> DiameterResult<Arc<Connection>> {
        let conn = Arc::new(Connection::from_link(
            server.clone(),
            self.dialer.clone(),
            link,
        )?);
        let replaced = self
            .connections
            .write()
            .await
            .insert(server.conn.clone(), conn.clone());
        if let Some(replaced) = replaced {
            replaced.cleanup().await;
        }
        log::info!("[{}] adopted inbound link", server.conn);
        Ok(conn)
    }

    /// Tear down every pooled connection and refuse new ones for `duration`.
    ///
    /// Calling this again while disabled restarts the window from now.
    pub async fn disable_for(&self, duration: Duration) {
        let drained: Vec<_> = {
            let mut connections = self.connections.write().await;
            self.disabled.store(true, Ordering::SeqCst);
            connections.drain().map(|(_, conn)| conn).collect()
        };

        let disabled = self.disabled.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            disabled.store(false, Ordering::SeqCst);
            log::info!("connection manager re-enabled");
        });
        if let Some(previous) = self.reenable_timer().replace(timer) {
            previous.abort();
        }

        log::warn!("connection manager disabled for {duration:?}");
        for conn in drained {
            conn.cleanup().await;
        }
    }

    /// Accept new connections again
    pub fn enable(&self) {
        if let Some(timer) = self.reenable_timer().take() {
            timer.abort();
        }
        self.disabled.store(false, Ordering::SeqCst);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Connection whose current link is `link`
    pub async fn find_by_handle(&self, link: LinkId) -> Option<Arc<Connection>> {
        for conn in self.snapshot().await {
            if conn.link_id() == Some(link) {
                return Some(conn);
            }
        }
        None
    }

    pub async fn find_by_config(&self, peer: &PeerConnConfig) -> Option<Arc<Connection>> {
        self.connections.read().await.get(peer).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Close every link and empty the pool. The manager stays usable.
    pub async fn shutdown(&self) {
        self.enable();
        self.cleanup_all().await;
    }

    async fn cleanup_all(&self) {
        let drained: Vec<_> = self.connections.write().await.drain().collect();
        for (_, conn) in drained {
            conn.cleanup().await;
        }
    }

    async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    fn reenable_timer(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reenable.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(timer) = self.reenable_timer().take() {
            timer.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("disabled", &self.is_disabled())
            .finish_non_exhaustive()
    }
}
