//! Seam between the connection pool and the protocol engine
//!
//! A [`PeerLink`] is one established, capability-exchanged association with
//! a peer. A [`Dialer`] creates them. The built-in TCP engine lives in
//! [`crate::transport`]; other transports plug in by implementing these
//! traits.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::PeerConnConfig;
use crate::error::{DiameterError, DiameterResult};
use crate::message::DiameterMessage;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a link, used to match error reports and to
/// tell a stale link from its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    pub fn next() -> Self {
        LinkId(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Identity the peer announced during capability exchange
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerMetadata {
    pub origin_host: String,
    pub origin_realm: String,
}

/// An established association with a peer
#[async_trait]
pub trait PeerLink: Send + Sync + fmt::Debug {
    fn id(&self) -> LinkId;

    /// Peer identity learned at handshake, `None` if not (yet) known
    fn metadata(&self) -> Option<PeerMetadata>;

    /// Write one message; an error means the link is unusable
    async fn write(&self, msg: &DiameterMessage) -> DiameterResult<()>;

    /// Close the link. Idempotent.
    async fn close(&self);
}

/// Shared handle to a link
pub type LinkHandle = Arc<dyn PeerLink>;

/// Opens links towards peers
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, peer: &PeerConnConfig) -> DiameterResult<LinkHandle>;
}

/// Asynchronous failure of a link, e.g. watchdog expiry or read error
#[derive(Debug)]
pub struct ErrorReport {
    pub link: LinkId,
    pub error: DiameterError,
}

/// A message read from a link
#[derive(Debug)]
pub struct InboundMessage {
    pub link: LinkId,
    pub message: DiameterMessage,
}
