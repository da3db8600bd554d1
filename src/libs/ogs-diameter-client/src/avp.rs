//! Diameter AVP (Attribute-Value Pair) model
//!
//! AVP layout (RFC 6733 §4.1): 4-byte code, 1-byte flags (V M P), 3-byte
//! length, optional 4-byte Vendor-ID, data padded to a 4-byte boundary.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::IpAddr;

use crate::error::{DiameterError, DiameterResult};

/// AVP flag bits
pub mod flags {
    pub const VENDOR: u8 = 0x80;
    pub const MANDATORY: u8 = 0x40;
    pub const PROTECTED: u8 = 0x20;
}

/// AVP codes used by this layer
pub mod code {
    pub const USER_NAME: u32 = 1;
    pub const HOST_IP_ADDRESS: u32 = 257;
    pub const AUTH_APPLICATION_ID: u32 = 258;
    pub const ACCT_APPLICATION_ID: u32 = 259;
    pub const VENDOR_SPECIFIC_APPLICATION_ID: u32 = 260;
    pub const SESSION_ID: u32 = 263;
    pub const ORIGIN_HOST: u32 = 264;
    pub const SUPPORTED_VENDOR_ID: u32 = 265;
    pub const VENDOR_ID: u32 = 266;
    pub const RESULT_CODE: u32 = 268;
    pub const PRODUCT_NAME: u32 = 269;
    pub const DISCONNECT_CAUSE: u32 = 273;
    pub const ORIGIN_STATE_ID: u32 = 278;
    pub const DESTINATION_REALM: u32 = 283;
    pub const DESTINATION_HOST: u32 = 293;
    pub const ORIGIN_REALM: u32 = 296;
    pub const EXPERIMENTAL_RESULT: u32 = 297;
    pub const EXPERIMENTAL_RESULT_CODE: u32 = 298;
    /// 3GPP-User-Location-Info (TS 29.061), carries the location-info codec output
    pub const TGPP_USER_LOCATION_INFO: u32 = 22;
    /// Visited-PLMN-Id (TS 29.272), carries the network-id codec output
    pub const VISITED_PLMN_ID: u32 = 1407;
}

/// Diameter AVP
#[derive(Debug, Clone, PartialEq)]
pub struct Avp {
    pub code: u32,
    pub flags: u8,
    pub vendor_id: Option<u32>,
    pub value: AvpValue,
}

/// AVP payload. Decoded AVPs carry `Raw` until read through a typed accessor.
#[derive(Debug, Clone, PartialEq)]
pub enum AvpValue {
    OctetString(Bytes),
    Unsigned32(u32),
    Integer32(i32),
    Utf8String(String),
    DiameterIdentity(String),
    Address(IpAddr),
    Grouped(Vec<Avp>),
    Raw(Bytes),
}

impl Avp {
    pub fn new(code: u32, flags: u8, vendor_id: Option<u32>, value: AvpValue) -> Self {
        let flags = match vendor_id {
            Some(_) => flags | self::flags::VENDOR,
            None => flags & !self::flags::VENDOR,
        };
        Self {
            code,
            flags,
            vendor_id,
            value,
        }
    }

    /// Mandatory base-protocol AVP
    pub fn mandatory(code: u32, value: AvpValue) -> Self {
        Self::new(code, flags::MANDATORY, None, value)
    }

    /// Mandatory vendor-specific AVP
    pub fn vendor_mandatory(code: u32, vendor_id: u32, value: AvpValue) -> Self {
        Self::new(code, flags::MANDATORY, Some(vendor_id), value)
    }

    /// Mandatory DiameterIdentity AVP (Origin-Host, Destination-Realm, ...)
    pub fn identity(code: u32, value: impl Into<String>) -> Self {
        Self::mandatory(code, AvpValue::DiameterIdentity(value.into()))
    }

    pub fn is_mandatory(&self) -> bool {
        self.flags & flags::MANDATORY != 0
    }

    fn header_len(&self) -> usize {
        if self.vendor_id.is_some() {
            12
        } else {
            8
        }
    }

    /// Length on the wire including padding
    pub fn encoded_len(&self) -> usize {
        (self.header_len() + self.value.encoded_len() + 3) & !3
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let data_len = self.value.encoded_len();
        let avp_len = self.header_len() + data_len;

        buf.put_u32(self.code);
        buf.put_u8(self.flags);
        buf.put_uint(avp_len as u64, 3);
        if let Some(vendor_id) = self.vendor_id {
            buf.put_u32(vendor_id);
        }
        self.value.encode(buf);
        buf.put_bytes(0, (4 - data_len % 4) % 4);
    }

    pub fn decode(buf: &mut Bytes) -> DiameterResult<Self> {
        if buf.remaining() < 8 {
            return Err(DiameterError::BufferTooSmall {
                needed: 8,
                available: buf.remaining(),
            });
        }

        let code = buf.get_u32();
        let flags = buf.get_u8();
        let avp_len = buf.get_uint(3) as usize;

        let vendor_id = if flags & self::flags::VENDOR != 0 {
            if buf.remaining() < 4 {
                return Err(DiameterError::BufferTooSmall {
                    needed: 4,
                    available: buf.remaining(),
                });
            }
            Some(buf.get_u32())
        } else {
            None
        };
        let header_len = if vendor_id.is_some() { 12 } else { 8 };

        let data_len = avp_len.checked_sub(header_len).ok_or_else(|| {
            DiameterError::InvalidAvp(format!(
                "AVP {code} length {avp_len} is shorter than its header"
            ))
        })?;
        if buf.remaining() < data_len {
            return Err(DiameterError::BufferTooSmall {
                needed: data_len,
                available: buf.remaining(),
            });
        }
        let data = buf.copy_to_bytes(data_len);
        buf.advance(((4 - data_len % 4) % 4).min(buf.remaining()));

        Ok(Self {
            code,
            flags,
            vendor_id,
            value: AvpValue::Raw(data),
        })
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match &self.value {
            AvpValue::OctetString(b) | AvpValue::Raw(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match &self.value {
            AvpValue::Unsigned32(v) => Some(*v),
            AvpValue::Integer32(v) => Some(*v as u32),
            AvpValue::Raw(b) if b.len() == 4 => Some(b.clone().get_u32()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            AvpValue::Utf8String(s) | AvpValue::DiameterIdentity(s) => Some(s),
            AvpValue::Raw(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Children of a grouped AVP, decoding raw payloads on demand
    pub fn grouped(&self) -> DiameterResult<Vec<Avp>> {
        match &self.value {
            AvpValue::Grouped(avps) => Ok(avps.clone()),
            AvpValue::Raw(b) => {
                let mut data = b.clone();
                let mut avps = Vec::new();
                while data.has_remaining() {
                    avps.push(Avp::decode(&mut data)?);
                }
                Ok(avps)
            }
            _ => Err(DiameterError::InvalidAvp(format!(
                "AVP {} is not grouped",
                self.code
            ))),
        }
    }
}

impl AvpValue {
    pub fn encoded_len(&self) -> usize {
        match self {
            AvpValue::OctetString(b) | AvpValue::Raw(b) => b.len(),
            AvpValue::Unsigned32(_) | AvpValue::Integer32(_) => 4,
            AvpValue::Utf8String(s) | AvpValue::DiameterIdentity(s) => s.len(),
            AvpValue::Address(IpAddr::V4(_)) => 6,
            AvpValue::Address(IpAddr::V6(_)) => 18,
            AvpValue::Grouped(avps) => avps.iter().map(Avp::encoded_len).sum(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            AvpValue::OctetString(b) | AvpValue::Raw(b) => buf.put_slice(b),
            AvpValue::Unsigned32(v) => buf.put_u32(*v),
            AvpValue::Integer32(v) => buf.put_i32(*v),
            AvpValue::Utf8String(s) | AvpValue::DiameterIdentity(s) => {
                buf.put_slice(s.as_bytes())
            }
            AvpValue::Address(IpAddr::V4(v4)) => {
                buf.put_u16(1);
                buf.put_slice(&v4.octets());
            }
            AvpValue::Address(IpAddr::V6(v6)) => {
                buf.put_u16(2);
                buf.put_slice(&v6.octets());
            }
            AvpValue::Grouped(avps) => avps.iter().for_each(|avp| avp.encode(buf)),
        }
    }
}
