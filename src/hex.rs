//! Hex encoding helpers used for client identifiers, hardware addresses and
//! reservation MAC prefixes.

use std::fmt::Write;

/// Formats bytes as lowercase hex pairs joined by `separator`.
///
/// `bytes_to_hex_string(&[0xaa, 0x01], ":")` yields `"aa:01"`.
pub fn bytes_to_hex_string(bytes: &[u8], separator: &str) -> String {
    let mut result = String::with_capacity(bytes.len() * (2 + separator.len()));
    for (index, byte) in bytes.iter().enumerate() {
        if index > 0 {
            result.push_str(separator);
        }
        let _ = write!(result, "{:02x}", byte);
    }
    result
}

/// Parses hex digits into bytes, skipping any non-hex characters.
///
/// Separators such as `:` or `-` are therefore accepted anywhere. An odd
/// trailing nibble is dropped rather than treated as an error.
pub fn hex_string_to_bytes(text: &str) -> Vec<u8> {
    let mut result = Vec::with_capacity(text.len() / 2);
    let mut high: Option<u8> = None;

    for digit in text.chars().filter_map(|c| c.to_digit(16)) {
        let nibble = digit as u8;
        match high.take() {
            None => high = Some(nibble),
            Some(upper) => result.push((upper << 4) | nibble),
        }
    }

    result
}
