//! One lazily dialed link to one Diameter peer
//!
//! ```text
//!   Unconnected --get_or_dial--> Connected(link, metadata)
//!        ^                              |
//!        +------- write failure --------+
//! ```
//!
//! The link and the peer metadata learned from it are stored and cleared
//! together under the connection's own lock. A dial happens while that lock
//! is held, so concurrent senders wait for it and then reuse its result.
//! The current link is mirrored outside that lock so lookups by link
//! never wait on a dial.

use std::fmt;
use std::sync::{Arc, PoisonError};

use tokio::sync::Mutex;

use crate::avp::{code, Avp};
use crate::config::PeerServerConfig;
use crate::error::{DiameterError, DiameterResult};
use crate::link::{Dialer, LinkHandle, LinkId, PeerLink, PeerMetadata};
use crate::message::{DiameterMessage, MessageKind};

#[derive(Clone)]
struct Connected {
    link: LinkHandle,
    metadata: PeerMetadata,
}

/// Pooled connection to a single peer
pub struct Connection {
    server: PeerServerConfig,
    dialer: Arc<dyn Dialer>,
    state: Mutex<Option<Connected>>,
    current: std::sync::Mutex<Option<LinkHandle>>,
}

impl Connection {
    /// An unconnected connection; the first send dials
    pub fn new(server: PeerServerConfig, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            server,
            dialer,
            state: Mutex::new(None),
            current: std::sync::Mutex::new(None),
        }
    }

    /// A connection around a link the peer opened towards us
    pub fn from_link(
        server: PeerServerConfig,
        dialer: Arc<dyn Dialer>,
        link: LinkHandle,
    ) -> DiameterResult<Self> {
        let metadata = link.metadata().ok_or_else(|| {
            DiameterError::Protocol(format!(
                "no peer metadata on {} from {}",
                link.id(),
                server.conn
            ))
        })?;
        Ok(Self {
            server,
            dialer,
            current: std::sync::Mutex::new(Some(link.clone())),
            state: Mutex::new(Some(Connected { link, metadata })),
        })
    }

    pub fn server(&self) -> &PeerServerConfig {
        &self.server
    }

    /// Id of the cached link, if connected. Does not wait on a dial.
    pub fn link_id(&self) -> Option<LinkId> {
        self.current().as_ref().map(|link| link.id())
    }

    /// The cached link, if connected. Does not wait on a dial.
    pub fn link(&self) -> Option<LinkHandle> {
        self.current().clone()
    }

    fn current(&self) -> std::sync::MutexGuard<'_, Option<LinkHandle>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Return the cached link or dial a new one.
    pub async fn get_or_dial(&self) -> DiameterResult<(LinkHandle, PeerMetadata)> {
        let mut state = self.state.lock().await;
        if let Some(connected) = state.as_ref() {
            return Ok((connected.link.clone(), connected.metadata.clone()));
        }

        log::debug!("[{}] dialing", self.server.conn);
        let link = self.dialer.dial(&self.server.conn).await?;
        let Some(metadata) = link.metadata() else {
            link.close().await;
            return Err(DiameterError::dial(
                &self.server.conn,
                "peer metadata unavailable after handshake",
            ));
        };
        log::info!(
            "[{}] connected to {} ({}) on {}",
            self.server.conn,
            metadata.origin_host,
            metadata.origin_realm,
            link.id()
        );

        *state = Some(Connected {
            link: link.clone(),
            metadata: metadata.clone(),
        });
        *self.current() = Some(link.clone());
        Ok((link, metadata))
    }

    /// Send `msg`, trying up to `retries + 1` times without delay. Errors
    /// another attempt cannot fix (config, missing destination) end the loop.
    ///
    /// Requests get destination AVPs from `server_override` if given, else
    /// from this connection's own server config.
    pub async fn send_with_retries(
        &self,
        msg: &DiameterMessage,
        kind: MessageKind,
        retries: u32,
        server_override: Option<&PeerServerConfig>,
    ) -> DiameterResult<()> {
        let mut attempt = 0;
        loop {
            match self.send_once(msg, kind, server_override).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < retries && e.is_retryable() => {
                    attempt += 1;
                    log::debug!(
                        "[{}] send attempt {attempt}/{} failed: {e}",
                        self.server.conn,
                        retries + 1
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(
        &self,
        msg: &DiameterMessage,
        kind: MessageKind,
        server_override: Option<&PeerServerConfig>,
    ) -> DiameterResult<()> {
        let (link, metadata) = self.get_or_dial().await?;

        let mut msg = msg.clone();
        if kind == MessageKind::Request {
            let server = server_override.unwrap_or(&self.server);
            inject_destination(&mut msg, server, &metadata)?;
        }

        if let Err(e) = link.write(&msg).await {
            log::warn!("[{}] write on {} failed: {e}", self.server.conn, link.id());
            self.destroy(&link).await;
            return Err(match e {
                DiameterError::Write { .. } => e,
                other => DiameterError::write(&self.server.conn, other),
            });
        }
        Ok(())
    }

    /// Drop the cached link if it is still `link`, then close `link`.
    ///
    /// A link that was already replaced by a newer dial is closed without
    /// touching the replacement.
    pub async fn destroy(&self, link: &LinkHandle) {
        {
            let mut state = self.state.lock().await;
            if state.as_ref().is_some_and(|c| c.link.id() == link.id()) {
                *state = None;
                *self.current() = None;
                log::debug!("[{}] dropped {}", self.server.conn, link.id());
            }
        }
        link.close().await;
    }

    /// Drop and close whatever link is cached
    pub async fn cleanup(&self) {
        let connected = {
            let mut state = self.state.lock().await;
            *self.current() = None;
            state.take()
        };
        if let Some(connected) = connected {
            log::debug!("[{}] closing {}", self.server.conn, connected.link.id());
            connected.link.close().await;
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

fn non_empty<'a>(preferred: &'a str, fallback: &'a str) -> Option<&'a str> {
    [preferred, fallback].into_iter().find(|s| !s.is_empty())
}

/// Set Destination-Realm and, unless disabled, Destination-Host on a request.
///
/// Configured values win over what the peer announced. Destination-Realm is
/// always rewritten; an existing Destination-Host is kept unless
/// `overwrite_dest_host` is set.
pub fn inject_destination(
    msg: &mut DiameterMessage,
    server: &PeerServerConfig,
    metadata: &PeerMetadata,
) -> DiameterResult<()> {
    let realm = non_empty(&server.dest_realm, &metadata.origin_realm)
        .ok_or_else(|| DiameterError::MissingDestination(server.conn.to_string()))?;
    msg.set_avp(Avp::identity(code::DESTINATION_REALM, realm));

    if server.disable_dest_host {
        return Ok(());
    }
    if let Some(host) = non_empty(&server.dest_host, &metadata.origin_host) {
        if server.overwrite_dest_host || !msg.has_avp(code::DESTINATION_HOST) {
            msg.set_avp(Avp::identity(code::DESTINATION_HOST, host));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PeerConnConfig, TransportProtocol};
    use crate::mock::{MockDialer, MockLink, PEER_HOST, PEER_REALM};
    use std::sync::atomic::Ordering;

    const ULR: u32 = 316;
    const S6A_APP_ID: u32 = 16777251;

    fn server() -> PeerServerConfig {
        PeerServerConfig::new(PeerConnConfig::new("127.0.0.1:3868", TransportProtocol::Tcp))
    }

    fn connection(dialer: &MockDialer) -> Connection {
        Connection::new(server(), Arc::new(dialer.clone()))
    }

    fn ulr() -> DiameterMessage {
        DiameterMessage::new_request(ULR, S6A_APP_ID)
    }

    #[tokio::test]
    async fn test_get_or_dial_caches() {
        let dialer = MockDialer::new();
        let conn = connection(&dialer);
        assert!(!conn.is_connected().await);

        let (first, metadata) = conn.get_or_dial().await.unwrap();
        let (second, _) = conn.get_or_dial().await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(metadata.origin_host, PEER_HOST);
        assert_eq!(dialer.state.dials(), 1);
        assert_eq!(conn.link_id(), Some(first.id()));
    }

    #[tokio::test]
    async fn test_concurrent_get_or_dial_dials_once() {
        let dialer = MockDialer::new();
        dialer.state.dial_delay_ms.store(20, Ordering::SeqCst);
        let conn = Arc::new(connection(&dialer));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.get_or_dial().await.map(|(l, _)| l.id()) })
            })
            .collect();
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(dialer.state.dials(), 1);
    }

    #[tokio::test]
    async fn test_dial_without_metadata_fails() {
        let dialer = MockDialer::new();
        dialer.state.no_metadata.store(true, Ordering::SeqCst);
        let conn = connection(&dialer);

        assert!(matches!(conn.get_or_dial().await, Err(DiameterError::Dial { .. })));
        assert!(dialer.state.link(0).is_closed());
        assert!(!conn.is_connected().await);
    }

    #[tokio::test]
    async fn test_send_injects_destination() {
        let dialer = MockDialer::new();
        let conn = connection(&dialer);

        conn.send_with_retries(&ulr(), MessageKind::Request, 0, None)
            .await
            .unwrap();
        let sent = dialer.state.last_written().unwrap();
        assert_eq!(sent.destination_realm(), Some(PEER_REALM));
        assert_eq!(sent.destination_host(), Some(PEER_HOST));
    }

    #[tokio::test]
    async fn test_send_answer_is_untouched() {
        let dialer = MockDialer::new();
        let conn = connection(&dialer);
        let answer = DiameterMessage::new_answer(&ulr());

        conn.send_with_retries(&answer, MessageKind::Answer, 0, None)
            .await
            .unwrap();
        let sent = dialer.state.last_written().unwrap();
        assert!(!sent.has_avp(code::DESTINATION_REALM));
        assert!(!sent.has_avp(code::DESTINATION_HOST));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let dialer = MockDialer::new();
        let conn = connection(&dialer);
        dialer.state.fail_next_writes(3);

        conn.send_with_retries(&ulr(), MessageKind::Request, 3, None)
            .await
            .unwrap();
        assert_eq!(dialer.state.write_attempts(), 4);
        // every failed write tore the link down and forced a redial
        assert_eq!(dialer.state.dials(), 4);
        assert!(dialer.state.link(0).is_closed());
        assert!(!dialer.state.link(3).is_closed());
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let dialer = MockDialer::new();
        let conn = connection(&dialer);
        dialer.state.fail_next_writes(5);

        let err = conn
            .send_with_retries(&ulr(), MessageKind::Request, 2, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DiameterError::Write { .. }));
        assert_eq!(dialer.state.write_attempts(), 3);
        assert!(!conn.is_connected().await);
    }

    #[tokio::test]
    async fn test_dial_errors_count_against_budget() {
        let dialer = MockDialer::new();
        let conn = connection(&dialer);
        dialer.state.fail_next_dials(1);

        conn.send_with_retries(&ulr(), MessageKind::Request, 1, None)
            .await
            .unwrap();
        assert_eq!(dialer.state.dials(), 2);
        assert_eq!(dialer.state.write_attempts(), 1);
    }

    #[tokio::test]
    async fn test_config_error_is_not_retried() {
        let dialer = MockDialer::new();
        let conn = connection(&dialer);
        dialer.state.reject_dials.store(true, Ordering::SeqCst);

        let err = conn
            .send_with_retries(&ulr(), MessageKind::Request, 3, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DiameterError::Config(_)));
        assert_eq!(dialer.state.dials(), 1);
    }

    #[tokio::test]
    async fn test_missing_destination_is_not_retried() {
        let dialer = MockDialer::new();
        let link = MockLink::new(dialer.state.clone(), Some(PeerMetadata::default()));
        let conn = Connection::from_link(server(), Arc::new(dialer.clone()), link).unwrap();

        let err = conn
            .send_with_retries(&ulr(), MessageKind::Request, 3, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DiameterError::MissingDestination(_)));
        assert_eq!(dialer.state.write_attempts(), 0);
        assert!(conn.is_connected().await);
    }

    #[tokio::test]
    async fn test_killed_link_is_replaced() {
        let dialer = MockDialer::new();
        let conn = connection(&dialer);
        let (stale, _) = conn.get_or_dial().await.unwrap();
        dialer.state.link(0).kill();

        conn.send_with_retries(&ulr(), MessageKind::Request, 1, None)
            .await
            .unwrap();
        assert_ne!(conn.link_id(), Some(stale.id()));
        assert_eq!(dialer.state.dials(), 2);
    }

    #[tokio::test]
    async fn test_destroy_ignores_replaced_link() {
        let dialer = MockDialer::new();
        let conn = connection(&dialer);
        let (old, _) = conn.get_or_dial().await.unwrap();
        conn.cleanup().await;
        let (current, _) = conn.get_or_dial().await.unwrap();

        conn.destroy(&old).await;
        assert_eq!(conn.link_id(), Some(current.id()));
        assert!(dialer.state.link(0).is_closed());

        conn.destroy(&current).await;
        assert!(!conn.is_connected().await);
        assert!(dialer.state.link(1).is_closed());
    }

    #[tokio::test]
    async fn test_from_link_requires_metadata() {
        let dialer = MockDialer::new();
        let link = MockLink::new(dialer.state.clone(), None);
        assert!(Connection::from_link(server(), Arc::new(dialer.clone()), link).is_err());

        let link = MockLink::new(dialer.state.clone(), Some(crate::mock::peer_metadata()));
        let conn = Connection::from_link(server(), Arc::new(dialer.clone()), link.clone()).unwrap();
        assert_eq!(conn.link_id(), Some(link.id()));
        assert_eq!(dialer.state.dials(), 0);
    }

    fn metadata() -> PeerMetadata {
        crate::mock::peer_metadata()
    }

    #[test]
    fn test_inject_destination_prefers_config() {
        let mut msg = ulr();
        let server = server().with_destination("hss.override", "override.realm");
        inject_destination(&mut msg, &server, &metadata()).unwrap();
        assert_eq!(msg.destination_realm(), Some("override.realm"));
        assert_eq!(msg.destination_host(), Some("hss.override"));
    }

    #[test]
    fn test_inject_destination_missing_realm() {
        let mut msg = ulr();
        let result = inject_destination(&mut msg, &server(), &PeerMetadata::default());
        assert!(matches!(result, Err(DiameterError::MissingDestination(_))));
    }

    #[test]
    fn test_inject_destination_disable_host() {
        let mut msg = ulr();
        let mut server = server().with_destination("hss.override", "");
        server.disable_dest_host = true;
        inject_destination(&mut msg, &server, &metadata()).unwrap();
        assert_eq!(msg.destination_realm(), Some(PEER_REALM));
        assert!(!msg.has_avp(code::DESTINATION_HOST));
    }

    #[test]
    fn test_inject_destination_existing_avps() {
        let mut msg = ulr();
        msg.add_avp(Avp::identity(code::DESTINATION_REALM, "caller.realm"));
        msg.add_avp(Avp::identity(code::DESTINATION_HOST, "caller.host"));

        inject_destination(&mut msg, &server(), &metadata()).unwrap();
        assert_eq!(msg.destination_realm(), Some(PEER_REALM));
        assert_eq!(msg.destination_host(), Some("caller.host"));

        let mut server = server();
        server.overwrite_dest_host = true;
        inject_destination(&mut msg, &server, &metadata()).unwrap();
        assert_eq!(msg.destination_host(), Some(PEER_HOST));
        assert_eq!(msg.avps.len(), 2);
    }
}
