//! Test doubles for the link seam

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::avp::{code, Avp, AvpValue};
use crate::config::PeerConnConfig;
use crate::error::{DiameterError, DiameterResult};
use crate::link::{Dialer, InboundMessage, LinkHandle, LinkId, PeerLink, PeerMetadata};
use crate::message::{DiameterMessage, MessageKind};

pub const PEER_HOST: &str = "hss.epc.mnc001.mcc001.3gppnetwork.org";
pub const PEER_REALM: &str = "epc.mnc001.mcc001.3gppnetwork.org";

/// Shared by a dialer and every link it created
#[derive(Debug, Default)]
pub struct MockState {
    pub dials: AtomicU32,
    pub dial_failures: AtomicU32,
    pub write_attempts: AtomicU32,
    pub write_failures: AtomicU32,
    pub no_metadata: AtomicBool,
    pub dial_delay_ms: AtomicU32,
    /// Dials fail with a configuration error
    pub reject_dials: AtomicBool,
    pub links: Mutex<Vec<Arc<MockLink>>>,
    pub written: Mutex<Vec<DiameterMessage>>,
    /// When set, every successfully written request is answered here
    pub responder: Mutex<Option<mpsc::Sender<InboundMessage>>>,
}

impl MockState {
    pub fn dials(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn write_attempts(&self) -> u32 {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub fn fail_next_writes(&self, n: u32) {
        self.write_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_dials(&self, n: u32) {
        self.dial_failures.store(n, Ordering::SeqCst);
    }

    pub fn last_written(&self) -> Option<DiameterMessage> {
        self.written.lock().unwrap().last().cloned()
    }

    pub fn link(&self, index: usize) -> Arc<MockLink> {
        self.links.lock().unwrap()[index].clone()
    }

    pub fn answer_with(&self, tx: mpsc::Sender<InboundMessage>) {
        *self.responder.lock().unwrap() = Some(tx);
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug)]
pub struct MockLink {
    id: LinkId,
    metadata: Option<PeerMetadata>,
    closed: AtomicBool,
    state: Arc<MockState>,
}

impl MockLink {
    pub fn new(state: Arc<MockState>, metadata: Option<PeerMetadata>) -> Arc<Self> {
        Arc::new(Self {
            id: LinkId::next(),
            metadata,
            closed: AtomicBool::new(false),
            state,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simulate the peer dropping the association
    pub fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub fn peer_metadata() -> PeerMetadata {
    PeerMetadata {
        origin_host: PEER_HOST.to_string(),
        origin_realm: PEER_REALM.to_string(),
    }
}

#[async_trait]
impl PeerLink for MockLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn metadata(&self) -> Option<PeerMetadata> {
        self.metadata.clone()
    }

    async fn write(&self, msg: &DiameterMessage) -> DiameterResult<()> {
        self.state.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return Err(DiameterError::LinkClosed);
        }
        if take_one(&self.state.write_failures) {
            return Err(DiameterError::write(self.id, "injected failure"));
        }
        self.state.written.lock().unwrap().push(msg.clone());

        if msg.kind() == MessageKind::Request {
            let responder = self.state.responder.lock().unwrap().clone();
            if let Some(tx) = responder {
                let mut answer = DiameterMessage::new_answer(msg);
                if let Some(session_id) = msg.session_id() {
                    answer.set_session_id(session_id);
                }
                answer.add_avp(Avp::mandatory(code::RESULT_CODE, AvpValue::Unsigned32(2001)));
                answer.add_avp(Avp::identity(code::ORIGIN_HOST, PEER_HOST));
                let _ = tx.try_send(InboundMessage {
                    link: self.id,
                    message: answer,
                });
            }
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockDialer {
    pub state: Arc<MockState>,
}

impl MockDialer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, peer: &PeerConnConfig) -> DiameterResult<LinkHandle> {
        self.state.dials.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.dial_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
        }
        if self.state.reject_dials.load(Ordering::SeqCst) {
            return Err(DiameterError::Config(format!("unusable peer {}", peer.address)));
        }
        if take_one(&self.state.dial_failures) {
            return Err(DiameterError::dial(&peer.address, "injected failure"));
        }
        let metadata = if self.state.no_metadata.load(Ordering::SeqCst) {
            None
        } else {
            Some(peer_metadata())
        };
        let link = MockLink::new(self.state.clone(), metadata);
        self.state.links.lock().unwrap().push(link.clone());
        Ok(link as LinkHandle)
    }
}
