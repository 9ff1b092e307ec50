//! Integer-cents money arithmetic and formatting.
//!
//! Every amount in Bloom POS is an `i64` count of cents, in memory, on
//! disk, and on the wire. Floating point never touches money; operator
//! input is parsed from dollar strings directly into cents.

/// Tolerance used when reconciling tender totals against an order total.
/// One cent absorbs rounding drift between split rows.
pub const MIN_BALANCE: i64 = 1;

/// Parse a user-entered dollar string into cents.
///
/// Accepts `"12.34"`, `"$1,234.50"`, `"12"`, `".50"`, and a leading minus.
/// Rejects more than two decimal places, empty input, and garbage.
pub fn parse_dollars(input: &str) -> Result<i64, String> {
    let raw = input.trim().trim_start_matches('$').replace(',', "");
    if raw.is_empty() {
        return Err("Amount is required".into());
    }

    let (negative, raw) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.as_str()),
    };

    let (whole, frac) = match raw.split_once('.') {
        Some((w, f)) => (w, f),
        None => (raw, ""),
    };

    if frac.len() > 2 {
        return Err(format!("Invalid amount: {input}"));
    }
    if whole.is_empty() && frac.is_empty() {
        return Err(format!("Invalid amount: {input}"));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("Invalid amount: {input}"));
    }

    let dollars: i64 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| format!("Amount too large: {input}"))?
    };

    // Right-pad the fraction: ".5" means 50 cents.
    let cents_part: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().unwrap_or(0) * 10,
        _ => frac.parse().unwrap_or(0),
    };

    let cents = dollars
        .checked_mul(100)
        .and_then(|c| c.checked_add(cents_part))
        .ok_or_else(|| format!("Amount too large: {input}"))?;

    Ok(if negative { -cents } else { cents })
}

/// Format cents as a plain decimal string: `1234` -> `"12.34"`, `-300` -> `"-3.00"`.
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

/// Format cents with a currency symbol: `1234` -> `"$12.34"`.
pub fn format_dollars(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}${}.{:02}", abs / 100, abs % 100)
}

/// `percent` of `amount_cents`, rounded half away from zero.
///
/// Percent is a whole number (10 means 10%).
pub fn percent_of(amount_cents: i64, percent: i64) -> i64 {
    div_round(amount_cents as i128 * percent as i128, 100)
}

/// Prorate `amount_cents` by `part / whole`, rounded half away from zero.
///
/// Returns 0 when `whole` is 0. Used for tax proration on partial refunds:
/// `prorate(original_tax, item_refund_total, item_row_total)`.
pub fn prorate(amount_cents: i64, part: i64, whole: i64) -> i64 {
    if whole == 0 {
        return 0;
    }
    div_round(amount_cents as i128 * part as i128, whole as i128)
}

/// Integer division rounded half away from zero.
fn div_round(numerator: i128, denominator: i128) -> i64 {
    let half = denominator.abs() / 2;
    let adjusted = if numerator >= 0 {
        numerator + half
    } else {
        numerator - half
    };
    (adjusted / denominator) as i64
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dollars_plain() {
        assert_eq!(parse_dollars("12.34").unwrap(), 1234);
        assert_eq!(parse_dollars("12").unwrap(), 1200);
        assert_eq!(parse_dollars("0.05").unwrap(), 5);
        assert_eq!(parse_dollars(".5").unwrap(), 50);
        assert_eq!(parse_dollars("0").unwrap(), 0);
    }

    #[test]
    fn test_parse_dollars_symbols_and_commas() {
        assert_eq!(parse_dollars("$1,234.50").unwrap(), 123450);
        assert_eq!(parse_dollars(" $99.99 ").unwrap(), 9999);
        assert_eq!(parse_dollars("-3.00").unwrap(), -300);
    }

    #[test]
    fn test_parse_dollars_rejects_garbage() {
        assert!(parse_dollars("").is_err());
        assert!(parse_dollars("abc").is_err());
        assert!(parse_dollars("12.345").is_err());
        assert!(parse_dollars("12.3.4").is_err());
        assert!(parse_dollars("$").is_err());
    }

    #[test]
    fn test_format_cents() {
        assert_eq!(format_cents(1234), "12.34");
        assert_eq!(format_cents(5), "0.05");
        assert_eq!(format_cents(-300), "-3.00");
        assert_eq!(format_cents(0), "0.00");
        assert_eq!(format_dollars(123450), "$1234.50");
        assert_eq!(format_dollars(-5), "-$0.05");
    }

    #[test]
    fn test_parse_format_round_trip() {
        for cents in [0, 1, 99, 100, 1234, 999999] {
            assert_eq!(parse_dollars(&format_cents(cents)).unwrap(), cents);
        }
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(5000, 10), 500);
        assert_eq!(percent_of(9999, 10), 1000); // 999.9 rounds up
        assert_eq!(percent_of(105, 50), 53); // 52.5 rounds up
        assert_eq!(percent_of(0, 25), 0);
        assert_eq!(percent_of(10000, 0), 0);
    }

    #[test]
    fn test_prorate() {
        // 800 tax on an 8000 order, refunding 2000 of items -> 200
        assert_eq!(prorate(800, 2000, 8000), 200);
        // Rounds half away from zero
        assert_eq!(prorate(100, 1, 3), 33);
        assert_eq!(prorate(100, 1, 2), 50);
        assert_eq!(prorate(100, 2, 3), 67);
        // Degenerate whole
        assert_eq!(prorate(800, 2000, 0), 0);
    }
}
