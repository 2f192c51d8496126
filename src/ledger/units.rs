//! Conversions between integer base units and decimal token strings.

/// Render `raw` base units as a decimal string with `decimals` fractional
/// digits, trimming trailing zeros but keeping at least one (`"1.0"`).
pub fn format_units(raw: u128, decimals: u8) -> String {
    if decimals == 0 {
        return format!("{}.0", raw);
    }

    let digits = raw.to_string();
    let decimals = decimals as usize;
    let padded = if digits.len() <= decimals {
        format!("{}{}", "0".repeat(decimals - digits.len() + 1), digits)
    } else {
        digits
    };

    let (whole, fraction) = padded.split_at(padded.len() - decimals);
    let fraction = fraction.trim_end_matches('0');
    if fraction.is_empty() {
        format!("{}.0", whole)
    } else {
        format!("{}.{}", whole, fraction)
    }
}

/// Parse a decimal token amount into base units.
///
/// Returns `None` for negative, malformed, over-precise or overflowing input.
pub fn parse_units(value: &str, decimals: u8) -> Option<u128> {
    let value = value.trim();
    let (whole, fraction) = match value.split_once('.') {
        Some((w, f)) => (w, f),
        None => (value, ""),
    };

    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if fraction.len() > decimals as usize {
        return None;
    }

    let scale = 10u128.checked_pow(decimals as u32)?;
    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let fraction_units: u128 = if fraction.is_empty() {
        0
    } else {
        let padded = format!("{:0<width$}", fraction, width = decimals as usize);
        padded.parse().ok()?
    };

    whole.checked_mul(scale)?.checked_add(fraction_units)
}

/// Serialize base-unit amounts as decimal strings so JSON clients without
/// 128-bit integers don't lose precision.
pub mod amount_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE_TOKEN: u128 = 1_000_000_000_000_000_000;

    #[test]
    fn test_format_units() {
        assert_eq!(format_units(ONE_TOKEN, 18), "1.0");
        assert_eq!(format_units(ONE_TOKEN / 2, 18), "0.5");
        assert_eq!(format_units(0, 18), "0.0");
        assert_eq!(format_units(1, 18), "0.000000000000000001");
        assert_eq!(format_units(1_000_000 * ONE_TOKEN + 25, 18), "1000000.000000000000000025");
        assert_eq!(format_units(42, 0), "42.0");
    }

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_units("1", 18), Some(ONE_TOKEN));
        assert_eq!(parse_units("0.5", 18), Some(ONE_TOKEN / 2));
        assert_eq!(parse_units(".25", 2), Some(25));
        assert_eq!(parse_units("1.001", 2), None);
        assert_eq!(parse_units("-1", 18), None);
        assert_eq!(parse_units("abc", 18), None);
        assert_eq!(parse_units("", 18), None);
    }
}
