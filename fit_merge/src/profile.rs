//! The slice of the FIT profile this crate needs.

use chrono::{DateTime, Utc};

/// Seconds between the Unix epoch and the FIT epoch (1989-12-31T00:00:00Z).
pub const FIT_EPOCH_OFFSET: i64 = 631_065_600;

/// Global message number of `record` messages.
pub const MESG_RECORD: u16 = 20;

/// Field 253 carries the timestamp in every message type that has one.
pub const FIELD_TIMESTAMP: u8 = 253;
pub const FIELD_HEART_RATE: u8 = 3;
pub const FIELD_POWER: u8 = 7;

pub const BASE_UINT8: u8 = 0x02;
pub const BASE_UINT16: u8 = 0x84;
pub const BASE_UINT32: u8 = 0x86;

/// Width in bytes of one element of a FIT base type, keyed on the low five
/// bits of the base type byte.
pub fn base_type_size(base_type: u8) -> usize {
    match base_type & 0x1F {
        0x00 | 0x01 | 0x02 | 0x07 | 0x0A | 0x0D => 1,
        0x03 | 0x04 | 0x0B => 2,
        0x05 | 0x06 | 0x08 | 0x0C => 4,
        0x09 | 0x0E | 0x0F | 0x10 => 8,
        _ => 1,
    }
}

/// Raw value marking a field as unset. The `z` types use zero, everything
/// else this crate reads uses all bits set.
pub fn invalid_value(base_type: u8) -> u64 {
    match base_type & 0x1F {
        0x0A | 0x0B | 0x0C | 0x10 => 0,
        _ => {
            let bits = 8 * base_type_size(base_type) as u32;
            if bits >= 64 {
                u64::MAX
            } else {
                (1u64 << bits) - 1
            }
        }
    }
}

/// Convert a FIT timestamp into a UTC date-time.
pub fn fit_time_to_utc(timestamp: u32) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(FIT_EPOCH_OFFSET + i64::from(timestamp), 0)
}
