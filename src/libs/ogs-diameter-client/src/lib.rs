//! Diameter client transport and session layer
//!
//! Used by a gateway to reach HSS, PCRF and OCS peers (S6a, Gx, Gy):
//! - pooled peer connections with lazy (re)dial and destination routing
//! - asynchronous request/answer correlation
//! - watchdog-triggered reconnection with bounded backoff
//! - temporary admission control on connection creation
//! - session-id and PLMN/location wire encodings
//!
//! The wire format follows RFC 6733. The built-in TCP transport performs
//! only the capability exchange and watchdog replies needed to keep a link
//! usable; other transports plug in through [`Dialer`] and [`PeerLink`].

pub mod avp;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod link;
pub mod manager;
pub mod message;
pub mod plmn;
pub mod session;
pub mod tracker;
pub mod transport;

#[cfg(test)]
mod mock;

pub use avp::{Avp, AvpValue};
pub use client::{AnswerHandler, Correlation, DiameterClient};
pub use config::{ClientConfig, PeerConnConfig, PeerServerConfig, RecoveryConfig, TransportProtocol};
pub use connection::Connection;
pub use error::{DiameterError, DiameterResult, ResultCode};
pub use link::{Dialer, ErrorReport, InboundMessage, LinkHandle, LinkId, PeerLink, PeerMetadata};
pub use manager::ConnectionManager;
pub use message::{DiameterHeader, DiameterMessage, MessageKind};
pub use session::SessionIdParts;
pub use tracker::{Registration, RequestKey, RequestTracker};
pub use transport::{DiameterListener, TcpDialer, TcpPeerLink};

/// 3GPP Vendor ID
pub const VENDOR_ID_3GPP: u32 = 10415;

/// Diameter protocol version
pub const DIAMETER_VERSION: u8 = 1;
