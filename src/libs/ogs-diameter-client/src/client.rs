//! Diameter client façade
//!
//! Composes the connection pool and the request tracker. Requests go out
//! through [`DiameterClient::send_request`]; answers come back on the
//! inbound channel, are matched to a pending request by the handler
//! registered for their command and application, and are delivered to the
//! waiting caller. Link failures reported by the transport are fed to the
//! recovery loop, which drops the dead link and redials with backoff.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::avp::{code, Avp, AvpValue};
use crate::config::{ClientConfig, PeerServerConfig};
use crate::connection::Connection;
use crate::error::DiameterResult;
use crate::link::{Dialer, ErrorReport, InboundMessage, LinkHandle};
use crate::manager::ConnectionManager;
use crate::message::{DiameterMessage, MessageKind};
use crate::tracker::{RequestKey, RequestTracker};
use crate::transport::TcpDialer;

/// Outcome of an answer handler
#[derive(Debug)]
pub enum Correlation<A> {
    /// The answer belongs to the request tracked under `key`
    Matched { key: RequestKey, answer: A },
    /// Not ours; the message is dropped
    Uncorrelated,
}

/// Extracts the correlation key and parsed answer from an inbound answer
pub type AnswerHandler<A> = Arc<dyn Fn(&DiameterMessage) -> Correlation<A> + Send + Sync>;

/// Diameter client generic over the parsed answer type `A`
pub struct DiameterClient<A> {
    config: ClientConfig,
    manager: Arc<ConnectionManager>,
    tracker: RequestTracker<A>,
    handlers: RwLock<HashMap<(u32, u32), AnswerHandler<A>>>,
    origin_state_id: u32,
}

impl<A: Send + 'static> DiameterClient<A> {
    /// Client sending through links created by `dialer`
    pub fn new(config: ClientConfig, dialer: Arc<dyn Dialer>) -> DiameterResult<Self> {
        Self::with_origin_state_id(config, dialer, rand::random())
    }

    /// Client whose Origin-State-Id matches the one its dialer announces
    pub fn with_origin_state_id(
        config: ClientConfig,
        dialer: Arc<dyn Dialer>,
        origin_state_id: u32,
    ) -> DiameterResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            manager: Arc::new(ConnectionManager::new(dialer)),
            tracker: RequestTracker::new(),
            handlers: RwLock::new(HashMap::new()),
            origin_state_id,
        })
    }

    /// Client on the built-in TCP transport, with inbound dispatch and
    /// error recovery already running.
    pub fn tcp(config: ClientConfig) -> DiameterResult<Arc<Self>> {
        let origin_state_id = rand::random();
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let (error_tx, error_rx) = mpsc::channel(64);
        let dialer = TcpDialer::new(config.clone(), origin_state_id, inbound_tx, error_tx);
        let client = Arc::new(Self::with_origin_state_id(
            config,
            Arc::new(dialer),
            origin_state_id,
        )?);

        let inbound = client.clone();
        tokio::spawn(async move { inbound.run_inbound(inbound_rx).await });
        client.spawn_error_recovery(error_rx);
        Ok(client)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn origin_state_id(&self) -> u32 {
        self.origin_state_id
    }

    /// Number of requests still waiting for an answer
    pub fn pending_requests(&self) -> usize {
        self.tracker.len()
    }

    /// Send a request to `server` and deliver its answer to `done`.
    ///
    /// On error the request is no longer tracked and `done` will never
    /// receive a value.
    pub async fn send_request(
        &self,
        server: &PeerServerConfig,
        key: RequestKey,
        mut msg: DiameterMessage,
        done: oneshot::Sender<A>,
    ) -> DiameterResult<()> {
        let registration = self.tracker.register(key.clone(), done);

        self.add_origin_avps(&mut msg);
        if let Err(e) = self.send(server, &msg).await {
            log::warn!("[{key}] request to {} failed: {e}", server.conn);
            // a concurrent send may have re-registered the key
            self.tracker.withdraw(&key, registration);
            return Err(e);
        }
        Ok(())
    }

    async fn send(&self, server: &PeerServerConfig, msg: &DiameterMessage) -> DiameterResult<()> {
        let conn = self.manager.get_or_create(server).await?;
        conn.send_with_retries(msg, MessageKind::Request, self.config.retransmits, Some(server))
            .await
    }

    fn add_origin_avps(&self, msg: &mut DiameterMessage) {
        msg.set_avp(Avp::identity(code::ORIGIN_HOST, self.config.host.as_str()));
        msg.set_avp(Avp::identity(code::ORIGIN_REALM, self.config.realm.as_str()));
        msg.set_avp(Avp::mandatory(
            code::ORIGIN_STATE_ID,
            AvpValue::Unsigned32(self.origin_state_id),
        ));
    }

    /// Route answers with this command and application to `handler`.
    /// Replaces any handler already registered for the pair.
    pub fn register_answer_handler<F>(&self, command_code: u32, application_id: u32, handler: F)
    where
        F: Fn(&DiameterMessage) -> Correlation<A> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((command_code, application_id), Arc::new(handler));
    }

    /// Stop waiting for the answer to `key`. A late answer is dropped.
    pub fn ignore_answer(&self, key: &RequestKey) {
        let _ = self.tracker.deregister(key);
    }

    /// Hand an inbound answer to its handler and waiting caller.
    /// Returns whether it reached a caller.
    pub fn dispatch(&self, msg: &DiameterMessage) -> bool {
        let command_code = msg.header.command_code;
        let application_id = msg.header.application_id;
        if msg.kind() == MessageKind::Request {
            log::debug!("unsolicited request {command_code}/{application_id} dropped");
            return false;
        }

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(command_code, application_id))
            .cloned();
        let Some(handler) = handler else {
            log::debug!("no handler for answer {command_code}/{application_id}");
            return false;
        };

        match handler(msg) {
            Correlation::Uncorrelated => {
                log::debug!("uncorrelated answer {command_code}/{application_id} dropped");
                false
            }
            Correlation::Matched { key, answer } => match self.tracker.deregister(&key) {
                Ok(done) => {
                    if done.send(answer).is_err() {
                        log::debug!("[{key}] caller stopped waiting");
                        return false;
                    }
                    true
                }
                Err(_) => {
                    log::debug!("[{key}] answer without pending request");
                    false
                }
            },
        }
    }

    /// Dispatch inbound messages until the channel closes
    pub async fn run_inbound(&self, mut rx: mpsc::Receiver<InboundMessage>) {
        while let Some(inbound) = rx.recv().await {
            self.dispatch(&inbound.message);
        }
        log::debug!("inbound channel closed");
    }

    /// Pool a link the peer opened towards us
    pub async fn adopt(
        &self,
        link: LinkHandle,
        server: &PeerServerConfig,
    ) -> DiameterResult<Arc<Connection>> {
        self.manager.adopt(link, server).await
    }

    pub async fn disable_for(&self, duration: Duration) {
        self.manager.disable_for(duration).await
    }

    pub fn enable(&self) {
        self.manager.enable()
    }

    /// Close every pooled link
    pub async fn shutdown(&self) {
        self.manager.shutdown().await
    }

    /// Consume link error reports until the channel closes.
    ///
    /// The failed link is dropped at once and a backoff redial is started
    /// in the background for the connection that owned it.
    pub async fn error_recovery_loop(&self, mut reports: mpsc::Receiver<ErrorReport>) {
        while let Some(report) = reports.recv().await {
            self.recover(report).await;
        }
        log::debug!("error report channel closed");
    }

    /// Run [`Self::error_recovery_loop`] on its own task
    pub fn spawn_error_recovery(self: &Arc<Self>, reports: mpsc::Receiver<ErrorReport>) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move { client.error_recovery_loop(reports).await })
    }

    async fn recover(&self, report: ErrorReport) {
        let Some(conn) = self.manager.find_by_handle(report.link).await else {
            log::debug!("error on unpooled {}: {}", report.link, report.error);
            return;
        };
        log::warn!(
            "[{}] {} failed: {}",
            conn.server().conn,
            report.link,
            report.error
        );
        if let Some(link) = conn.link() {
            if link.id() == report.link {
                conn.destroy(&link).await;
            }
        }

        let manager = self.manager.clone();
        let recovery = self.config.recovery;
        tokio::spawn(async move {
            for attempt in 0..recovery.max_attempts {
                tokio::time::sleep(recovery.delay(attempt)).await;

                let pooled = manager.find_by_config(&conn.server().conn).await;
                if !pooled.is_some_and(|p| Arc::ptr_eq(&p, &conn)) {
                    log::debug!("[{}] no longer pooled, recovery stopped", conn.server().conn);
                    return;
                }
                match conn.get_or_dial().await {
                    Ok((link, _)) => {
                        log::info!("[{}] recovered on {}", conn.server().conn, link.id());
                        return;
                    }
                    Err(e) => log::debug!(
                        "[{}] recovery attempt {}/{} failed: {e}",
                        conn.server().conn,
                        attempt + 1,
                        recovery.max_attempts
                    ),
                }
            }
            log::debug!("[{}] recovery gave up", conn.server().conn);
        });
    }
}

impl<A> fmt::Debug for DiameterClient<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiameterClient")
            .field("host", &self.config.host)
            .field("realm", &self.config.realm)
            .field("manager", &self.manager)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PeerConnConfig, RecoveryConfig, TransportProtocol};
    use crate::error::DiameterError;
    use crate::link::{LinkId, PeerLink};
    use crate::mock::{MockDialer, PEER_HOST, PEER_REALM};
    use crate::session;
    use crate::transport::DiameterListener;

    const ULR: u32 = 316;
    const S6A_APP_ID: u32 = 16777251;

    /// Parsed answer used by the tests
    #[derive(Debug, PartialEq)]
    struct Ula {
        session_id: String,
        result_code: u32,
    }

    fn config() -> ClientConfig {
        let mut config = ClientConfig::new("gw.magma.com", "magma.com");
        config.recovery = RecoveryConfig {
            base_interval: Duration::from_millis(10),
            max_attempts: 3,
        };
        config
    }

    fn client(dialer: &MockDialer) -> Arc<DiameterClient<Ula>> {
        let client = DiameterClient::new(config(), Arc::new(dialer.clone())).unwrap();
        handle_ula(&client);
        Arc::new(client)
    }

    fn handle_ula(client: &DiameterClient<Ula>) {
        client.register_answer_handler(ULR, S6A_APP_ID, |msg| match msg.session_id() {
            Some(session_id) => Correlation::Matched {
                key: RequestKey::new(session_id),
                answer: Ula {
                    session_id: session_id.to_string(),
                    result_code: msg.result_code().unwrap_or_default(),
                },
            },
            None => Correlation::Uncorrelated,
        });
    }

    /// Let the background initial dial spawned by `get_or_create` finish
    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    fn hss() -> PeerServerConfig {
        PeerServerConfig::new(PeerConnConfig::new("10.0.0.1:3868", TransportProtocol::Tcp))
    }

    fn ulr(session_id: &str) -> DiameterMessage {
        let mut msg = DiameterMessage::new_request(ULR, S6A_APP_ID);
        msg.set_session_id(session_id);
        msg
    }

    fn new_session() -> String {
        session::encode(
            "gw.magma.com",
            &session::new_internal_session_id("001010000000001", None),
        )
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let dialer = MockDialer::new();
        let result = DiameterClient::<Ula>::new(ClientConfig::default(), Arc::new(dialer));
        assert!(matches!(result, Err(DiameterError::Config(_))));
    }

    #[tokio::test]
    async fn test_send_request_answer_delivered() {
        let _ = env_logger::try_init();
        let dialer = MockDialer::new();
        let client = client(&dialer);
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        dialer.state.answer_with(inbound_tx);
        let dispatcher = client.clone();
        tokio::spawn(async move { dispatcher.run_inbound(inbound_rx).await });

        let session_id = new_session();
        let (done, answer) = oneshot::channel();
        client
            .send_request(&hss(), RequestKey::new(&session_id), ulr(&session_id), done)
            .await
            .unwrap();

        let answer = answer.await.unwrap();
        assert_eq!(answer.session_id, session_id);
        assert_eq!(answer.result_code, 2001);
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_send_request_adds_origin_and_destination() {
        let dialer = MockDialer::new();
        let client = client(&dialer);
        let session_id = new_session();
        let (done, _answer) = oneshot::channel();

        client
            .send_request(&hss(), RequestKey::new(&session_id), ulr(&session_id), done)
            .await
            .unwrap();
        let sent = dialer.state.last_written().unwrap();
        assert_eq!(sent.origin_host(), Some("gw.magma.com"));
        assert_eq!(sent.origin_realm(), Some("magma.com"));
        assert_eq!(
            sent.find_avp(code::ORIGIN_STATE_ID).and_then(Avp::as_u32),
            Some(client.origin_state_id())
        );
        assert_eq!(sent.destination_host(), Some(PEER_HOST));
        assert_eq!(sent.destination_realm(), Some(PEER_REALM));
        assert_eq!(client.pending_requests(), 1);
    }

    #[tokio::test]
    async fn test_origin_state_id_is_stable() {
        let dialer = MockDialer::new();
        let client = client(&dialer);
        let mut seen = Vec::new();
        for _ in 0..3 {
            let session_id = new_session();
            let (done, _answer) = oneshot::channel();
            client
                .send_request(&hss(), RequestKey::new(&session_id), ulr(&session_id), done)
                .await
                .unwrap();
            let sent = dialer.state.last_written().unwrap();
            seen.push(sent.find_avp(code::ORIGIN_STATE_ID).and_then(Avp::as_u32));
        }
        assert!(seen.iter().all(|id| *id == Some(client.origin_state_id())));
    }

    #[tokio::test]
    async fn test_retry_budget() {
        let dialer = MockDialer::new();
        let client = client(&dialer);
        let retries = client.config().retransmits;
        dialer.state.fail_next_writes(retries);

        let session_id = new_session();
        let (done, _answer) = oneshot::channel();
        client
            .send_request(&hss(), RequestKey::new(&session_id), ulr(&session_id), done)
            .await
            .unwrap();
        assert_eq!(dialer.state.write_attempts(), retries + 1);
    }

    #[tokio::test]
    async fn test_failed_send_deregisters() {
        let dialer = MockDialer::new();
        let client = client(&dialer);
        dialer.state.fail_next_writes(10);

        let session_id = new_session();
        let key = RequestKey::new(&session_id);
        let (done, answer) = oneshot::channel();
        let result = client.send_request(&hss(), key, ulr(&session_id), done).await;

        assert!(matches!(result, Err(DiameterError::Write { .. })));
        assert_eq!(client.pending_requests(), 0);
        // the sender was dropped with the tracker entry
        assert!(answer.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_keeps_newer_registration() {
        let dialer = MockDialer::new();
        let client = client(&dialer);
        dialer.state
            .dial_delay_ms
            .store(100, std::sync::atomic::Ordering::SeqCst);
        dialer.state.fail_next_writes(10);

        let session_id = new_session();
        let key = RequestKey::new(&session_id);
        let (done, _first) = oneshot::channel();
        let sending = {
            let client = client.clone();
            let key = key.clone();
            tokio::spawn(async move { client.send_request(&hss(), key, ulr(&session_id), done).await })
        };
        while dialer.state.dials() == 0 {
            tokio::task::yield_now().await;
        }

        // the same key is registered again while the first send is in flight
        let (newer, newer_rx) = oneshot::channel();
        client.tracker.register(key.clone(), newer);

        assert!(sending.await.unwrap().is_err());
        assert_eq!(client.pending_requests(), 1);
        let answer = Ula {
            session_id: key.to_string(),
            result_code: 2001,
        };
        client.tracker.deregister(&key).unwrap().send(answer).unwrap();
        assert!(newer_rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_disabled_manager_rejects_send() {
        let dialer = MockDialer::new();
        let client = client(&dialer);
        client.disable_for(Duration::from_secs(60)).await;

        let session_id = new_session();
        let (done, _answer) = oneshot::channel();
        let result = client
            .send_request(&hss(), RequestKey::new(&session_id), ulr(&session_id), done)
            .await;
        assert!(matches!(result, Err(DiameterError::ManagerDisabled)));
        assert_eq!(client.pending_requests(), 0);

        client.enable();
        let (done, _answer) = oneshot::channel();
        client
            .send_request(&hss(), RequestKey::new(&session_id), ulr(&session_id), done)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_externally_closed_link_is_redialed() {
        let dialer = MockDialer::new();
        let client = client(&dialer);

        let first = new_session();
        let (done, _answer) = oneshot::channel();
        client
            .send_request(&hss(), RequestKey::new(&first), ulr(&first), done)
            .await
            .unwrap();
        let stale = dialer.state.link(0);
        stale.kill();

        let second = new_session();
        let (done, _answer) = oneshot::channel();
        client
            .send_request(&hss(), RequestKey::new(&second), ulr(&second), done)
            .await
            .unwrap();

        let conn = client.manager().find_by_config(&hss().conn).await.unwrap();
        let current = conn.link_id().unwrap();
        assert_ne!(current, stale.id());
        assert_eq!(dialer.state.dials(), 2);
        assert_eq!(dialer.state.written.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_uncorrelated_and_unknown() {
        let dialer = MockDialer::new();
        let client = client(&dialer);

        // no Session-Id, so the handler cannot correlate it
        let request = DiameterMessage::new_request(ULR, S6A_APP_ID);
        let answer = DiameterMessage::new_answer(&request);
        assert!(!client.dispatch(&answer));

        // no handler for this command
        let other = DiameterMessage::new_answer(&DiameterMessage::new_request(318, S6A_APP_ID));
        assert!(!client.dispatch(&other));

        // requests are never treated as answers
        assert!(!client.dispatch(&ulr("s")));

        // correlated but nothing pending
        let mut late = DiameterMessage::new_answer(&request);
        late.set_session_id("gw;1;2;IMSI001010000000001");
        assert!(!client.dispatch(&late));
    }

    #[tokio::test]
    async fn test_ignore_answer() {
        let dialer = MockDialer::new();
        let client = client(&dialer);
        let session_id = new_session();
        let key = RequestKey::new(&session_id);
        let (done, answer) = oneshot::channel();
        client
            .send_request(&hss(), key.clone(), ulr(&session_id), done)
            .await
            .unwrap();

        client.ignore_answer(&key);
        client.ignore_answer(&key);

        let mut late = DiameterMessage::new_answer(&ulr(&session_id));
        late.set_session_id(&session_id);
        assert!(!client.dispatch(&late));
        assert!(answer.await.is_err());
    }

    #[tokio::test]
    async fn test_error_recovery_redials() {
        let _ = env_logger::try_init();
        let dialer = MockDialer::new();
        let client = client(&dialer);
        let (error_tx, error_rx) = mpsc::channel(4);
        client.spawn_error_recovery(error_rx);

        let conn = client.manager().get_or_create(&hss()).await.unwrap();
        let (link, _) = conn.get_or_dial().await.unwrap();
        settle().await;

        error_tx
            .send(ErrorReport {
                link: link.id(),
                error: DiameterError::Protocol("watchdog timeout".into()),
            })
            .await
            .unwrap();

        let mut recovered = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if let Some(id) = conn.link_id() {
                if id != link.id() {
                    recovered = Some(id);
                    break;
                }
            }
        }
        assert!(recovered.is_some());
        assert!(dialer.state.link(0).is_closed());
        assert_eq!(dialer.state.dials(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_recovery_gives_up() {
        let dialer = MockDialer::new();
        let client = client(&dialer);
        let conn = client.manager().get_or_create(&hss()).await.unwrap();
        let (link, _) = conn.get_or_dial().await.unwrap();
        settle().await;
        dialer.state.fail_next_dials(100);

        client
            .recover(ErrorReport {
                link: link.id(),
                error: DiameterError::LinkClosed,
            })
            .await;
        assert!(!conn.is_connected().await);

        // 10 + 20 + 40 ms of backoff
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!conn.is_connected().await);
        assert_eq!(dialer.state.dials(), 1 + 3);
    }

    #[tokio::test]
    async fn test_error_report_for_unknown_link() {
        let dialer = MockDialer::new();
        let client = client(&dialer);
        let conn = client.manager().get_or_create(&hss()).await.unwrap();
        let (link, _) = conn.get_or_dial().await.unwrap();

        client
            .recover(ErrorReport {
                link: LinkId::next(),
                error: DiameterError::LinkClosed,
            })
            .await;
        assert_eq!(conn.link_id(), Some(link.id()));
    }

    #[tokio::test]
    async fn test_tcp_end_to_end() {
        let _ = env_logger::try_init();
        let (inbound_tx, mut inbound) = mpsc::channel(16);
        let (errors_tx, _errors) = mpsc::channel(16);
        let listener = DiameterListener::bind(
            ([127, 0, 0, 1], 0).into(),
            ClientConfig::new("hss.test", "test.realm"),
            9,
            inbound_tx,
            errors_tx,
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();

        // HSS side: answer every request with DIAMETER_SUCCESS
        tokio::spawn(async move {
            let link = listener.accept().await.unwrap();
            while let Some(request) = inbound.recv().await {
                let request = request.message;
                let mut answer = DiameterMessage::new_answer(&request);
                if let Some(session_id) = request.session_id() {
                    answer.set_session_id(session_id);
                }
                answer.add_avp(Avp::mandatory(code::RESULT_CODE, AvpValue::Unsigned32(2001)));
                link.write(&answer).await.unwrap();
            }
        });

        let client = DiameterClient::<Ula>::tcp(config()).unwrap();
        handle_ula(&client);
        let hss = PeerServerConfig::new(PeerConnConfig::new(addr.to_string(), TransportProtocol::Tcp));

        let session_id = new_session();
        let (done, answer) = oneshot::channel();
        client
            .send_request(&hss, RequestKey::new(&session_id), ulr(&session_id), done)
            .await
            .unwrap();
        let answer = tokio::time::timeout(Duration::from_secs(5), answer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer.session_id, session_id);
        assert_eq!(answer.result_code, 2001);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_links() {
        let dialer = MockDialer::new();
        let client = client(&dialer);
        let session_id = new_session();
        let (done, _answer) = oneshot::channel();
        client
            .send_request(&hss(), RequestKey::new(&session_id), ulr(&session_id), done)
            .await
            .unwrap();

        client.shutdown().await;
        assert!(client.manager().is_empty().await);
        assert!(dialer.state.link(0).is_closed());
    }
}
