//! Timeout header codec.
//!
//! Format: up to eight ASCII digits followed by a unit
//! (`H` hours, `M` minutes, `S` seconds, `m` millis, `u` micros, `n` nanos).

use std::time::Duration;

/// Request header carrying the caller's timeout
pub const TIMEOUT_HEADER: &str = "gantry-timeout";

const MAX_DIGITS: usize = 8;
const MAX_VALUE: u64 = 99_999_999;

/// Parse a timeout header value
pub fn parse_timeout(value: &str) -> Option<Duration> {
    let value = value.trim();
    if !value.is_ascii() || value.len() < 2 || value.len() > MAX_DIGITS + 1 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;

    match unit {
        "H" => Some(Duration::from_secs(amount * 3600)),
        "M" => Some(Duration::from_secs(amount * 60)),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}

/// Encode a timeout using the finest unit that fits in eight digits
pub fn encode_timeout(timeout: Duration) -> String {
    let nanos = timeout.as_nanos();
    let units: [(u128, char); 6] = [
        (1, 'n'),
        (1_000, 'u'),
        (1_000_000, 'm'),
        (1_000_000_000, 'S'),
        (60_000_000_000, 'M'),
        (3_600_000_000_000, 'H'),
    ];

    for (scale, unit) in units {
        // Round up so the receiver never sees a longer timeout than intended
        let amount = nanos.div_ceil(scale);
        if amount <= MAX_VALUE as u128 {
            return format!("{}{}", amount, unit);
        }
    }
    format!("{}H", MAX_VALUE)
}
