//! Session-Id codec
//!
//! Sessions created by this gateway carry a logical id of the form
//! `IMSI<digits>[_<bearer>]-<hexRandom>`. On the wire (RFC 6733 §8.8) the
//! same id is written as `<host>;<rnd1>;<rnd2>;IMSI<digits>[_<bearer>]`,
//! where `rnd1`/`rnd2` are the two halves of the hex random part. Ids issued
//! by other nodes are opaque and pass through both directions unchanged.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{DiameterError, DiameterResult};

const IMSI_PREFIX: &str = "IMSI";
const MIN_IMSI_DIGITS: usize = 10;
const MAX_IMSI_DIGITS: usize = 16;

/// Fields of a wire Session-Id. Absent fields are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionIdParts {
    pub host: String,
    pub rnd1: String,
    pub rnd2: String,
    pub imsi: String,
    pub bearer_id: String,
}

/// Split a logical id into (`IMSI<digits>[_<bearer>]`, hex random).
fn split_logical(key: &str) -> Option<(&str, &str)> {
    let (subscriber, random) = key.split_once('-')?;
    let rest = subscriber.strip_prefix(IMSI_PREFIX)?;
    let (digits, bearer) = match rest.split_once('_') {
        Some((digits, bearer)) => (digits, Some(bearer)),
        None => (rest, None),
    };

    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(digits) || bearer.is_some_and(|b| !all_digits(b)) {
        return None;
    }
    if random.is_empty() || !random.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some((subscriber, random))
}

/// Convert a logical session id to its wire form using `identity` as the
/// host part. Ids not in the logical form are returned unchanged.
pub fn encode(identity: &str, key: &str) -> String {
    match split_logical(key) {
        Some((subscriber, random)) => {
            let (rnd1, rnd2) = random.split_at(random.len() / 2);
            format!("{identity};{rnd1};{rnd2};{subscriber}")
        }
        None => key.to_string(),
    }
}

/// Convert a wire session id back to the logical form.
///
/// The random halves are joined textually, so leading zeros survive.
pub fn decode(wire_id: &str) -> String {
    let segments: Vec<&str> = wire_id.split(';').collect();
    match segments.as_slice() {
        [.., rnd1, rnd2, last] if segments.len() >= 4 && last.starts_with(IMSI_PREFIX) => {
            format!("{last}-{rnd1}{rnd2}")
        }
        _ => wire_id.to_string(),
    }
}

/// Split a wire session id into its fields, filling as many as are present.
pub fn parse(wire_id: &str) -> SessionIdParts {
    let segments: Vec<&str> = wire_id.split(';').collect();
    let mut parts = SessionIdParts::default();

    if let Some(subscriber) = segments.get(3) {
        let subscriber = subscriber.strip_prefix(IMSI_PREFIX).unwrap_or(subscriber);
        match subscriber.split_once('_') {
            Some((imsi, bearer)) => {
                parts.imsi = imsi.to_string();
                parts.bearer_id = bearer.to_string();
            }
            None => parts.imsi = subscriber.to_string(),
        }
    }
    if let Some(rnd2) = segments.get(2) {
        parts.rnd2 = rnd2.to_string();
    }
    if let Some(rnd1) = segments.get(1) {
        parts.rnd1 = rnd1.to_string();
    }
    parts.host = segments[0].to_string();
    parts
}

/// Extract the IMSI digits from the last segment of a wire session id.
pub fn extract_imsi(wire_id: &str) -> DiameterResult<String> {
    let last = wire_id.rsplit(';').next().unwrap_or(wire_id);
    let digits = last
        .strip_prefix(IMSI_PREFIX)
        .ok_or_else(|| DiameterError::InvalidImsi(format!("{last:?} has no IMSI prefix")))?;

    if !(MIN_IMSI_DIGITS..=MAX_IMSI_DIGITS).contains(&digits.len()) {
        return Err(DiameterError::InvalidImsi(format!(
            "{digits:?} is not {MIN_IMSI_DIGITS}-{MAX_IMSI_DIGITS} digits long"
        )));
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DiameterError::InvalidImsi(format!(
            "{digits:?} contains non-digits"
        )));
    }
    Ok(digits.to_string())
}

/// Generate a wire session id `identity[-protocol];<time>;<random>[;opt]`.
///
/// The time segment mixes whole seconds (high bits) with sub-second
/// nanoseconds (low bits). Uniqueness is process-local best effort.
pub fn generate_session_id(identity: &str, protocol: &str, opt: Option<&str>) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let time_bits = (now.as_secs() << 20) | u64::from(now.subsec_nanos() >> 10);
    let random: u32 = rand::random();

    let mut id = if protocol.is_empty() {
        identity.to_string()
    } else {
        format!("{identity}-{protocol}")
    };
    id.push_str(&format!(";{time_bits};{random}"));
    if let Some(opt) = opt.filter(|o| !o.is_empty()) {
        id.push(';');
        id.push_str(opt);
    }
    id
}

/// Create a logical session id `IMSI<digits>[_<bearer>]-<8 hex>` for a new
/// transaction. `imsi` may be given with or without the `IMSI` prefix.
pub fn new_internal_session_id(imsi: &str, bearer: Option<u8>) -> String {
    let digits = imsi.strip_prefix(IMSI_PREFIX).unwrap_or(imsi);
    let random: u32 = rand::random();
    match bearer {
        Some(bearer) => format!("{IMSI_PREFIX}{digits}_{bearer}-{random:08x}"),
        None => format!("{IMSI_PREFIX}{digits}-{random:08x}"),
    }
}
