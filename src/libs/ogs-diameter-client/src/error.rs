//! Diameter client error types

use thiserror::Error;

/// Diameter client error type
#[derive(Error, Debug)]
pub enum DiameterError {
    /// Bad peer address, transport or identity. Fatal to setup.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Dial or capability exchange towards a peer failed
    #[error("Dial to {peer} failed: {reason}")]
    Dial { peer: String, reason: String },

    /// Writing a message to an established link failed
    #[error("Write to {peer} failed: {reason}")]
    Write { peer: String, reason: String },

    /// Neither the server config nor the peer supplied a Destination-Realm
    #[error("Missing destination realm for peer {0}")]
    MissingDestination(String),

    /// Connection creation is temporarily disabled
    #[error("Connection manager is disabled")]
    ManagerDisabled,

    /// Deregistering a key that is not tracked
    #[error("No pending request for key {0}")]
    RequestNotFound(String),

    #[error("Invalid length: expected {expected}, got {actual}")]
    InvalidLength { expected: String, actual: usize },

    #[error("Invalid IMSI: {0}")]
    InvalidImsi(String),

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Invalid AVP: {0}")]
    InvalidAvp(String),

    #[error("Missing mandatory AVP: {0}")]
    MissingAvp(String),

    #[error("Buffer too small: need {needed}, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The link was closed locally or by the peer
    #[error("Link closed")]
    LinkClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DiameterError {
    /// Build a dial error for `peer`
    pub fn dial(peer: impl ToString, reason: impl ToString) -> Self {
        DiameterError::Dial {
            peer: peer.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Build a write error for `peer`
    pub fn write(peer: impl ToString, reason: impl ToString) -> Self {
        DiameterError::Write {
            peer: peer.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether another attempt within the caller's retry budget may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DiameterError::Dial { .. }
                | DiameterError::Write { .. }
                | DiameterError::LinkClosed
                | DiameterError::Io(_)
        )
    }
}

/// Diameter result type
pub type DiameterResult<T> = Result<T, DiameterError>;

/// Diameter Result-Code values (RFC 6733, 3GPP TS 29.272)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResultCode {
    MultiRoundAuth = 1001,

    Success = 2001,
    LimitedSuccess = 2002,

    CommandUnsupported = 3001,
    UnableToDeliver = 3002,
    RealmNotServed = 3003,
    TooBusy = 3004,
    LoopDetected = 3005,
    ApplicationUnsupported = 3007,
    UnknownPeer = 3010,

    AuthenticationRejected = 4001,
    AuthenticationDataUnavailable = 4181,

    UnknownSessionId = 5002,
    AuthorizationRejected = 5003,
    MissingAvp = 5005,
    UnableToComply = 5012,
    UserUnknown = 5030,
    NoCommonApplication = 5010,
    RoamingNotAllowed = 5004,
}

impl ResultCode {
    /// 2xxx
    pub fn is_success(&self) -> bool {
        (2000..3000).contains(&(*self as u32))
    }

    /// 3xxx
    pub fn is_protocol_error(&self) -> bool {
        (3000..4000).contains(&(*self as u32))
    }

    /// 4xxx
    pub fn is_transient_failure(&self) -> bool {
        (4000..5000).contains(&(*self as u32))
    }

    /// 5xxx
    pub fn is_permanent_failure(&self) -> bool {
        (5000..6000).contains(&(*self as u32))
    }
}

impl From<u32> for ResultCode {
    fn from(value: u32) -> Self {
        match value {
            1001 => ResultCode::MultiRoundAuth,
            2001 => ResultCode::Success,
            2002 => ResultCode::LimitedSuccess,
            3001 => ResultCode::CommandUnsupported,
            3002 => ResultCode::UnableToDeliver,
            3003 => ResultCode::RealmNotServed,
            3004 => ResultCode::TooBusy,
            3005 => ResultCode::LoopDetected,
            3007 => ResultCode::ApplicationUnsupported,
            3010 => ResultCode::UnknownPeer,
            4001 => ResultCode::AuthenticationRejected,
            4181 => ResultCode::AuthenticationDataUnavailable,
            5002 => ResultCode::UnknownSessionId,
            5003 => ResultCode::AuthorizationRejected,
            5004 => ResultCode::RoamingNotAllowed,
            5005 => ResultCode::MissingAvp,
            5010 => ResultCode::NoCommonApplication,
            5030 => ResultCode::UserUnknown,
            _ => ResultCode::UnableToComply,
        }
    }
}
