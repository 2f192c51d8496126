//! Ledger address format checks (syntactic only).
//!
//! Accepts `0x` followed by 40 hex digits. All-lowercase and all-uppercase
//! bodies are accepted as-is; mixed case must carry a valid EIP-55 checksum.

use sha3::{Digest, Keccak256};

const ADDRESS_HEX_LEN: usize = 40;

fn hex_body(address: &str) -> Option<&str> {
    let body = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .unwrap_or(address);
    if body.len() == ADDRESS_HEX_LEN && body.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(body)
    } else {
        None
    }
}

/// EIP-55 mixed-case rendering of a 40-digit hex body.
fn checksum_body(body: &str) -> String {
    let lower = body.to_ascii_lowercase();
    let hash = Keccak256::digest(lower.as_bytes());

    lower
        .chars()
        .enumerate()
        .map(|(i, c)| {
            let byte = hash[i / 2];
            let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
            if c.is_ascii_alphabetic() && nibble >= 8 {
                c.to_ascii_uppercase()
            } else {
                c
            }
        })
        .collect()
}

/// Whether `address` is a syntactically valid ledger address.
pub fn is_valid_address(address: &str) -> bool {
    normalize_address(address).is_some()
}

/// Canonical checksummed `0x` form, or `None` when the address is malformed.
pub fn normalize_address(address: &str) -> Option<String> {
    let body = hex_body(address.trim())?;
    let checksummed = checksum_body(body);

    let has_lower = body.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = body.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper && body != checksummed {
        return None;
    }

    Some(format!("0x{}", checksummed))
}
