//! Diameter message header and message container
//!
//! Header layout (RFC 6733 §3): version, 3-byte length, command flags,
//! 3-byte command code, Application-ID, Hop-by-Hop and End-to-End ids.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::avp::{code, Avp, AvpValue};
use crate::error::{DiameterError, DiameterResult};
use crate::DIAMETER_VERSION;

/// Diameter message header size
pub const HEADER_SIZE: usize = 20;

/// Command flag bits
pub mod cmd_flags {
    pub const REQUEST: u8 = 0x80;
    pub const PROXIABLE: u8 = 0x40;
    pub const ERROR: u8 = 0x20;
    pub const RETRANSMIT: u8 = 0x10;
}

/// Base protocol command codes
pub mod base_cmd {
    pub const CAPABILITIES_EXCHANGE: u32 = 257;
    pub const DEVICE_WATCHDOG: u32 = 280;
    pub const DISCONNECT_PEER: u32 = 282;
}

/// Base protocol application id
pub const BASE_APPLICATION_ID: u32 = 0;

/// Diameter message header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiameterHeader {
    pub flags: u8,
    pub command_code: u32,
    pub application_id: u32,
    pub hop_by_hop_id: u32,
    pub end_to_end_id: u32,
}

impl DiameterHeader {
    pub fn is_request(&self) -> bool {
        self.flags & cmd_flags::REQUEST != 0
    }

    pub fn is_answer(&self) -> bool {
        !self.is_request()
    }

    pub fn is_error(&self) -> bool {
        self.flags & cmd_flags::ERROR != 0
    }
}

/// Whether a message is sent as a request or an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Answer,
}

/// Diameter message (header + AVPs)
#[derive(Debug, Clone, PartialEq)]
pub struct DiameterMessage {
    pub header: DiameterHeader,
    pub avps: Vec<Avp>,
}

impl DiameterMessage {
    /// New proxiable request with zeroed identifiers
    pub fn new_request(command_code: u32, application_id: u32) -> Self {
        Self {
            header: DiameterHeader {
                flags: cmd_flags::REQUEST | cmd_flags::PROXIABLE,
                command_code,
                application_id,
                hop_by_hop_id: 0,
                end_to_end_id: 0,
            },
            avps: Vec::new(),
        }
    }

    /// Answer skeleton echoing the request's command and identifiers
    pub fn new_answer(request: &DiameterMessage) -> Self {
        Self {
            header: DiameterHeader {
                flags: request.header.flags & cmd_flags::PROXIABLE,
                ..request.header.clone()
            },
            avps: Vec::new(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        if self.header.is_request() {
            MessageKind::Request
        } else {
            MessageKind::Answer
        }
    }

    pub fn with_ids(mut self, hop_by_hop_id: u32, end_to_end_id: u32) -> Self {
        self.header.hop_by_hop_id = hop_by_hop_id;
        self.header.end_to_end_id = end_to_end_id;
        self
    }

    pub fn add_avp(&mut self, avp: Avp) {
        self.avps.push(avp);
    }

    /// Replace the first AVP with the same code and vendor, or append it
    pub fn set_avp(&mut self, avp: Avp) {
        match self
            .avps
            .iter_mut()
            .find(|a| a.code == avp.code && a.vendor_id == avp.vendor_id)
        {
            Some(slot) => *slot = avp,
            None => self.avps.push(avp),
        }
    }

    /// Remove every AVP with `code` and `vendor_id`, returning how many went
    pub fn remove_avp(&mut self, code: u32, vendor_id: Option<u32>) -> usize {
        let before = self.avps.len();
        self.avps
            .retain(|a| !(a.code == code && a.vendor_id == vendor_id));
        before - self.avps.len()
    }

    pub fn find_avp(&self, code: u32) -> Option<&Avp> {
        self.avps.iter().find(|a| a.code == code)
    }

    pub fn find_vendor_avp(&self, code: u32, vendor_id: u32) -> Option<&Avp> {
        self.avps
            .iter()
            .find(|a| a.code == code && a.vendor_id == Some(vendor_id))
    }

    pub fn has_avp(&self, code: u32) -> bool {
        self.find_avp(code).is_some()
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.avps.iter().map(Avp::encoded_len).sum::<usize>()
    }

    pub fn encode(&self) -> BytesMut {
        let len = self.encoded_len();
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(DIAMETER_VERSION);
        buf.put_uint(len as u64, 3);
        buf.put_u8(self.header.flags);
        buf.put_uint(self.header.command_code as u64, 3);
        buf.put_u32(self.header.application_id);
        buf.put_u32(self.header.hop_by_hop_id);
        buf.put_u32(self.header.end_to_end_id);
        for avp in &self.avps {
            avp.encode(&mut buf);
        }
        buf
    }

    pub fn decode(buf: &mut Bytes) -> DiameterResult<Self> {
        if buf.remaining() < HEADER_SIZE {
            return Err(DiameterError::BufferTooSmall {
                needed: HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        let version = buf.get_u8();
        if version != DIAMETER_VERSION {
            return Err(DiameterError::InvalidMessage(format!(
                "unsupported Diameter version {version}"
            )));
        }
        let length = buf.get_uint(3) as usize;
        let header = DiameterHeader {
            flags: buf.get_u8(),
            command_code: buf.get_uint(3) as u32,
            application_id: buf.get_u32(),
            hop_by_hop_id: buf.get_u32(),
            end_to_end_id: buf.get_u32(),
        };

        let avp_len = length.checked_sub(HEADER_SIZE).ok_or_else(|| {
            DiameterError::InvalidMessage(format!("message length {length} below header size"))
        })?;
        if buf.remaining() < avp_len {
            return Err(DiameterError::BufferTooSmall {
                needed: avp_len,
                available: buf.remaining(),
            });
        }

        let mut avp_buf = buf.copy_to_bytes(avp_len);
        let mut avps = Vec::new();
        while avp_buf.has_remaining() {
            avps.push(Avp::decode(&mut avp_buf)?);
        }

        Ok(Self { header, avps })
    }

    pub fn session_id(&self) -> Option<&str> {
        self.find_avp(code::SESSION_ID)?.as_str()
    }

    pub fn origin_host(&self) -> Option<&str> {
        self.find_avp(code::ORIGIN_HOST)?.as_str()
    }

    pub fn origin_realm(&self) -> Option<&str> {
        self.find_avp(code::ORIGIN_REALM)?.as_str()
    }

    pub fn destination_host(&self) -> Option<&str> {
        self.find_avp(code::DESTINATION_HOST)?.as_str()
    }

    pub fn destination_realm(&self) -> Option<&str> {
        self.find_avp(code::DESTINATION_REALM)?.as_str()
    }

    pub fn result_code(&self) -> Option<u32> {
        self.find_avp(code::RESULT_CODE)?.as_u32()
    }

    /// Experimental-Result-Code nested in Experimental-Result
    pub fn experimental_result_code(&self) -> Option<u32> {
        self.find_avp(code::EXPERIMENTAL_RESULT)?
            .grouped()
            .ok()?
            .iter()
            .find(|a| a.code == code::EXPERIMENTAL_RESULT_CODE)?
            .as_u32()
    }

    pub fn set_session_id(&mut self, session_id: &str) {
        self.set_avp(Avp::mandatory(
            code::SESSION_ID,
            AvpValue::Utf8String(session_id.to_string()),
        ));
    }
}
