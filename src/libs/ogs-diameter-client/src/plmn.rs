//! Binary encodings for PLMN-derived AVP payloads
//!
//! The network identifier is the MCC/MNC digit string ("00101" or
//! "310260"), packed as TBCD the way Visited-PLMN-Id and the location
//! structures of 3GPP-User-Location-Info expect it.

use bytes::{BufMut, BytesMut};

use crate::error::{DiameterError, DiameterResult};

/// Location-info type for a combined TAI + ECGI structure
pub const LOCATION_TYPE_TAI_ECGI: u8 = 0x82;

/// Encoded size of a location-info structure
pub const LOCATION_INFO_LEN: usize = 13;

const FILLER: u8 = 0x0f;

/// Pack a 5 or 6 digit network identifier into 3 bytes.
///
/// ```text
/// byte 0: MCC2 << 4 | MCC1
/// byte 1: MNC3 << 4 | MCC3   (MNC3 = 0xF for a 2-digit MNC)
/// byte 2: MNC2 << 4 | MNC1
/// ```
pub fn encode_network_id(id: &str) -> DiameterResult<[u8; 3]> {
    if !(5..=6).contains(&id.len()) {
        return Err(DiameterError::InvalidLength {
            expected: "5 or 6 digits".into(),
            actual: id.len(),
        });
    }

    let digits = id
        .bytes()
        .map(|b| match b {
            b'0'..=b'9' => Ok(b - b'0'),
            _ => Err(DiameterError::InvalidAvp(format!(
                "network id {id:?} contains a non-digit"
            ))),
        })
        .collect::<DiameterResult<Vec<u8>>>()?;

    let mnc3 = digits.get(5).copied().unwrap_or(FILLER);
    Ok([
        digits[0] | digits[1] << 4,
        digits[2] | mnc3 << 4,
        digits[3] | digits[4] << 4,
    ])
}

/// Encode a TAI + ECGI location structure:
/// type, network id, TAC, network id, E-UTRAN cell id.
pub fn encode_location_info(
    id: &str,
    tai: u16,
    cell_id: u32,
) -> DiameterResult<[u8; LOCATION_INFO_LEN]> {
    let network_id = encode_network_id(id)?;

    let mut buf = BytesMut::with_capacity(LOCATION_INFO_LEN);
    buf.put_u8(LOCATION_TYPE_TAI_ECGI);
    buf.put_slice(&network_id);
    buf.put_u16(tai);
    buf.put_slice(&network_id);
    buf.put_u32(cell_id);

    let mut out = [0u8; LOCATION_INFO_LEN];
    out.copy_from_slice(&buf);
    Ok(out)
}
