//! Decimal token amounts <-> integer base units

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UnitsError {
    #[error("Invalid decimal amount: {0}")]
    Invalid(String),

    #[error("Too many fractional digits for {decimals} decimals: {value}")]
    TooPrecise { value: String, decimals: u8 },

    #[error("Amount overflows base units: {0}")]
    Overflow(String),
}

/// Parse a decimal string such as `"5"` or `"0.25"` into base units.
pub fn parse_units(value: &str, decimals: u8) -> Result<u128, UnitsError> {
    let value = value.trim();
    let (whole, frac) = match value.split_once('.') {
        Some((w, f)) => (w, f),
        None => (value, ""),
    };

    if whole.is_empty() && frac.is_empty() {
        return Err(UnitsError::Invalid(value.to_string()));
    }
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(whole) || !all_digits(frac) {
        return Err(UnitsError::Invalid(value.to_string()));
    }

    let frac = frac.trim_end_matches('0');
    if frac.len() > decimals as usize {
        return Err(UnitsError::TooPrecise {
            value: value.to_string(),
            decimals,
        });
    }

    let scale = 10u128
        .checked_pow(decimals as u32)
        .ok_or_else(|| UnitsError::Overflow(value.to_string()))?;

    let whole_units = if whole.is_empty() {
        0
    } else {
        whole
            .parse::<u128>()
            .map_err(|_| UnitsError::Overflow(value.to_string()))?
    };

    let frac_units = if frac.is_empty() {
        0
    } else {
        let padded = format!("{:0<width$}", frac, width = decimals as usize);
        padded
            .parse::<u128>()
            .map_err(|_| UnitsError::Overflow(value.to_string()))?
    };

    whole_units
        .checked_mul(scale)
        .and_then(|w| w.checked_add(frac_units))
        .ok_or_else(|| UnitsError::Overflow(value.to_string()))
}

/// Render base units as a decimal string, dropping trailing zeros.
pub fn format_units(amount: u128, decimals: u8) -> String {
    if decimals == 0 {
        return amount.to_string();
    }
    let digits = format!("{:0>width$}", amount, width = decimals as usize + 1);
    let (whole, frac) = digits.split_at(digits.len() - decimals as usize);
    let frac = frac.trim_end_matches('0');
    if frac.is_empty() {
        whole.to_string()
    } else {
        format!("{}.{}", whole, frac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_whole_and_fractional() {
        assert_eq!(parse_units("5", 18).unwrap(), 5_000_000_000_000_000_000);
        assert_eq!(parse_units("0.25", 2).unwrap(), 25);
        assert_eq!(parse_units("1.50", 1).unwrap(), 15);
        assert_eq!(parse_units(".5", 1).unwrap(), 5);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_units("", 18), Err(UnitsError::Invalid(_))));
        assert!(matches!(parse_units("1e18", 18), Err(UnitsError::Invalid(_))));
        assert!(matches!(parse_units("-1", 18), Err(UnitsError::Invalid(_))));
        assert!(matches!(
            parse_units("0.001", 2),
            Err(UnitsError::TooPrecise { .. })
        ));
    }

    #[test]
    fn test_parse_overflow() {
        assert!(matches!(
            parse_units("1000000000000000000000", 18),
            Err(UnitsError::Overflow(_))
        ));
    }

    #[test]
    fn test_format() {
        assert_eq!(format_units(5_000_000_000_000_000_000, 18), "5");
        assert_eq!(format_units(1_500_000_000_000_000_000, 18), "1.5");
        assert_eq!(format_units(1, 18), "0.000000000000000001");
        assert_eq!(format_units(0, 18), "0");
        assert_eq!(format_units(42, 0), "42");
    }
}
