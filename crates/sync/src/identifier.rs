//! Sortable identifiers for client-originated entities.
//!
//! Layout: `<prefix>_<12 hex><14 base62>`. The hex segment is
//! `timestamp_ms * 0x1000 + counter`, truncated to 48 bits, so two ids of
//! the same kind compare by creation order as plain strings. The server
//! uses the same layout, which is what lets a client id be compared
//! against ids the assistant produced.

use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

const TIME_HEX_LEN: usize = 12;
const RANDOM_LEN: usize = 14;
const MASK_48: u64 = (1 << 48) - 1;
const BASE62: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Last encoded value handed out by this process.
static LAST_VALUE: Mutex<u64> = Mutex::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    Session,
    Message,
    Part,
    Permission,
}

impl IdKind {
    pub fn prefix(self) -> &'static str {
        match self {
            IdKind::Session => "ses",
            IdKind::Message => "msg",
            IdKind::Part => "prt",
            IdKind::Permission => "per",
        }
    }
}

/// A fresh id that sorts after every id this process generated before.
pub fn ascending(kind: IdKind) -> String {
    encode(kind, next_value(None))
}

/// Like [`ascending`], but also strictly after `floor` when `floor` is an
/// id of the same kind. Protects against the server's clock running ahead
/// of ours. An unparsable floor is ignored.
pub fn ascending_after(kind: IdKind, floor: Option<&str>) -> String {
    let floor = floor.and_then(|id| time_segment(kind, id));
    encode(kind, next_value(floor))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn next_value(floor: Option<u64>) -> u64 {
    let candidate = now_ms().wrapping_mul(0x1000) & MASK_48;
    let mut last = LAST_VALUE.lock().unwrap_or_else(PoisonError::into_inner);

    // Same millisecond (or a clock step backwards) keeps counting up.
    let mut value = candidate.max((*last + 1) & MASK_48);
    if let Some(floor) = floor {
        if value <= floor {
            value = (floor + 1) & MASK_48;
        }
    }
    *last = value;
    value
}

fn encode(kind: IdKind, value: u64) -> String {
    let mut id = String::with_capacity(kind.prefix().len() + 1 + TIME_HEX_LEN + RANDOM_LEN);
    id.push_str(kind.prefix());
    id.push('_');
    id.push_str(&format!("{:0width$x}", value, width = TIME_HEX_LEN));

    let random = uuid::Uuid::new_v4();
    for byte in random.as_bytes().iter().take(RANDOM_LEN) {
        id.push(BASE62[(*byte as usize) % BASE62.len()] as char);
    }
    id
}

fn time_segment(kind: IdKind, id: &str) -> Option<u64> {
    let rest = id.strip_prefix(kind.prefix())?.strip_prefix('_')?;
    let hex = rest.get(..TIME_HEX_LEN)?;
    u64::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_prefix_and_fixed_length() {
        let id = ascending(IdKind::Message);
        assert!(id.starts_with("msg_"));
        assert_eq!(id.len(), 4 + TIME_HEX_LEN + RANDOM_LEN);
        assert!(id[4..].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn ids_sort_in_generation_order() {
        let ids: Vec<String> = (0..2000).map(|_| ascending(IdKind::Part)).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn ascending_after_sorts_past_a_future_floor() {
        let now = ascending(IdKind::Message);
        let value = time_segment(IdKind::Message, &now).unwrap();
        // Simulate a server id one minute ahead of our clock.
        let ahead = format!("msg_{:012x}zzzzzzzzzzzzzz", value + 60_000 * 0x1000);

        let next = ascending_after(IdKind::Message, Some(&ahead));
        assert!(next > ahead);
        assert!(ascending(IdKind::Message) > next);
    }

    #[test]
    fn ascending_after_ignores_foreign_or_bad_floor() {
        let a = ascending(IdKind::Message);
        let b = ascending_after(IdKind::Message, Some("ses_ffffffffffff0000"));
        let c = ascending_after(IdKind::Message, Some("msg_nothex"));
        assert!(a < b && b < c);
        assert!(!b.starts_with("msg_ffffffffffff"));
    }

    #[test]
    fn time_segment_round_trips_encoding() {
        let id = encode(IdKind::Session, 0xabc);
        assert_eq!(time_segment(IdKind::Session, &id), Some(0xabc));
        assert_eq!(time_segment(IdKind::Message, &id), None);
    }
}
