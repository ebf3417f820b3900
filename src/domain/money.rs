use std::fmt;

/// Money is stored as integer paise (hundredths of a rupee) so that fee, GST and
/// EMI arithmetic never goes through binary floating point when persisted.
/// ₹50.00 = 5000.
pub type Cents = i64;

/// Basis points: 1 bp = 0.01%, so 18% GST is 1800 and a 2% penalty is 200.
pub type BasisPoints = i64;

/// Convert whole rupees to cents. `rupees(10_000)` is ₹10,000.00.
pub const fn rupees(units: i64) -> Cents {
    units * 100
}

/// Apply a rate in basis points to an amount, rounding half away from zero
/// to the nearest cent.
///
/// `percent_of(250, 1800)` is the GST on a ₹2.50 charge: 45 (₹0.45).
pub fn percent_of(amount: Cents, rate: BasisPoints) -> Cents {
    let raw = amount as i128 * rate as i128;
    let rounded = if raw >= 0 {
        (raw + 5_000) / 10_000
    } else {
        (raw - 5_000) / 10_000
    };
    rounded as Cents
}

/// Round a floating amount expressed in rupees to cents.
/// Only used where a formula is inherently real-valued (EMI amortization).
pub fn round_to_cents(value: f64) -> Cents {
    (value * 100.0).round() as Cents
}

/// Format cents as a decimal string: 295 -> "2.95", -1 -> "-0.01".
pub fn format_cents(cents: Cents) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Parse a decimal amount into cents. Digits past the second decimal place
/// are truncated; grouping commas are accepted ("1,00,000.50").
pub fn parse_cents(input: &str) -> Result<Cents, ParseCentsError> {
    let cleaned: String = input.trim().chars().filter(|c| *c != ',').collect();
    let (negative, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, cleaned.as_str()),
    };
    if digits.is_empty() {
        return Err(ParseCentsError::InvalidFormat);
    }

    let (units_str, fraction_str) = digits.split_once('.').unwrap_or((digits, ""));
    if fraction_str.contains('.') {
        return Err(ParseCentsError::InvalidFormat);
    }

    let units: i64 = if units_str.is_empty() {
        0
    } else {
        parse_digits(units_str)?
    };

    let fraction: String = fraction_str.chars().chain("00".chars()).take(2).collect();
    let fraction = parse_digits(&fraction)?;

    let cents = units
        .checked_mul(100)
        .and_then(|c| c.checked_add(fraction))
        .ok_or(ParseCentsError::Overflow)?;
    Ok(if negative { -cents } else { cents })
}

fn parse_digits(s: &str) -> Result<i64, ParseCentsError> {
    if !s.chars().all(|c| c.is_ascii_digit()) {
        return Err(ParseCentsError::InvalidFormat);
    }
    s.parse().map_err(|_| ParseCentsError::Overflow)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseCentsError {
    InvalidFormat,
    Overflow,
}

impl fmt::Display for ParseCentsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseCentsError::InvalidFormat => write!(f, "invalid money format"),
            ParseCentsError::Overflow => write!(f, "amount out of range"),
        }
    }
}

impl std::error::Error for ParseCentsError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_cents() {
        assert_eq!(format_cents(295), "2.95");
        assert_eq!(format_cents(888488), "8884.88");
        assert_eq!(format_cents(5), "0.05");
        assert_eq!(format_cents(0), "0.00");
        assert_eq!(format_cents(-1), "-0.01");
    }

    #[test]
    fn test_parse_cents() {
        assert_eq!(parse_cents("2.5"), Ok(250));
        assert_eq!(parse_cents("10000"), Ok(1_000_000));
        assert_eq!(parse_cents("1,00,000.50"), Ok(10_000_050));
        assert_eq!(parse_cents(".45"), Ok(45));
        assert_eq!(parse_cents("-3.10"), Ok(-310));
        assert_eq!(parse_cents("7.999"), Ok(799));
    }

    #[test]
    fn test_parse_cents_invalid() {
        assert_eq!(parse_cents(""), Err(ParseCentsError::InvalidFormat));
        assert_eq!(parse_cents("1.2.3"), Err(ParseCentsError::InvalidFormat));
        assert_eq!(parse_cents("12a"), Err(ParseCentsError::InvalidFormat));
        assert_eq!(
            parse_cents("99999999999999999999"),
            Err(ParseCentsError::Overflow)
        );
    }

    #[test]
    fn test_percent_of_rounds_half_up() {
        assert_eq!(percent_of(250, 1800), 45);
        assert_eq!(percent_of(1500, 1800), 270);
        // 0.5 paise rounds up
        assert_eq!(percent_of(25, 200), 1);
        assert_eq!(percent_of(24, 200), 0);
        assert_eq!(percent_of(-25, 200), -1);
    }

    #[test]
    fn test_rupees() {
        assert_eq!(rupees(200_000), 20_000_000);
    }
}
