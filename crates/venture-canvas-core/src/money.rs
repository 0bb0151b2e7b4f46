//! Free-text currency handling.
//!
//! Amounts are entered by people ("$1.5M", "250,000 USD", "$500-$2,000"), so
//! parsing is deliberately forgiving: everything but digits, `.` and `-` is
//! discarded and the longest numeric prefix wins.

/// Parses a free-text amount, returning `0.0` when nothing numeric remains.
#[must_use]
pub fn parse_money(value: &str) -> f64 {
    let cleaned: String = value
        .chars()
        .filter(|ch| ch.is_ascii_digit() || *ch == '.' || *ch == '-')
        .collect();
    parse_float_prefix(&cleaned).unwrap_or(0.0)
}

/// Formats an amount as `$` followed by the thousands-grouped value.
/// Negative amounts keep their sign after the dollar: `$-2,000`.
#[must_use]
pub fn format_money(value: f64) -> String {
    format!("${}", group_thousands(value))
}

/// Compact display used by the dashboards: `$1.5M`, `$250K`, `$500`.
///
/// Blank input reads as `N/A`; input with no numeric prefix is echoed back.
#[must_use]
pub fn format_compact_currency(value: &str) -> String {
    if value.is_empty() {
        return "N/A".to_string();
    }

    let cleaned: String = value
        .chars()
        .filter(|ch| ch.is_ascii_digit() || *ch == '.' || *ch == '-')
        .collect();
    let Some(amount) = parse_float_prefix(&cleaned) else {
        return value.to_string();
    };

    if amount >= 1_000_000.0 {
        format!("${}M", compact_unit(amount / 1_000_000.0))
    } else if amount >= 1_000.0 {
        format!("${}K", compact_unit(amount / 1_000.0))
    } else {
        format_money(amount)
    }
}

/// Upper bound of a cost range such as `"$500-$2,000"`: the digits of the
/// segment after the first `-`. Missing or non-numeric bounds count as zero.
#[must_use]
pub fn cost_range_upper_bound(cost_range: &str) -> u64 {
    let Some(upper) = cost_range.split('-').nth(1) else {
        return 0;
    };
    let digits: String = upper.chars().filter(char::is_ascii_digit).collect();
    digits.parse::<u64>().unwrap_or(0)
}

/// Revenue potential minus cost structure, both parsed leniently.
#[must_use]
pub fn expected_return(cost_structure: &str, revenue_potential: &str) -> f64 {
    parse_money(revenue_potential) - parse_money(cost_structure)
}

fn compact_unit(value: f64) -> String {
    if value.fract() == 0.0 {
        to_fixed(value, 0)
    } else {
        to_fixed(value, 1)
    }
}

/// Fixed-point rendering of the exact binary value. Only exact halves are
/// rounded away from zero; `1.15` is stored below the half and rounds down.
pub(crate) fn to_fixed(value: f64, digits: usize) -> String {
    let doubling = 2.0 * 10_f64.powi(i32::try_from(digits).unwrap_or(0));
    let doubled = value * doubling;
    let exact_half = doubled.fract() == 0.0
        && (doubled % 2.0).abs() == 1.0
        && value.mul_add(doubling, -doubled) == 0.0;
    if exact_half {
        let away = (doubled + doubled.signum()) / doubling;
        format!("{away:.digits$}")
    } else {
        format!("{value:.digits$}")
    }
}

fn group_thousands(value: f64) -> String {
    let rendered = to_fixed(value.abs(), 3);
    let (whole, fraction) = rendered.split_once('.').unwrap_or((rendered.as_str(), ""));
    let fraction = fraction.trim_end_matches('0');

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (index, digit) in whole.chars().enumerate() {
        if index > 0 && (whole.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    let is_zero = whole.chars().all(|ch| ch == '0') && fraction.is_empty();
    let sign = if value.is_sign_negative() && !is_zero { "-" } else { "" };
    if fraction.is_empty() {
        format!("{sign}{grouped}")
    } else {
        format!("{sign}{grouped}.{fraction}")
    }
}

/// Longest prefix of `text` that reads as a decimal number.
fn parse_float_prefix(text: &str) -> Option<f64> {
    let bytes = text.as_bytes();
    let mut end = 0;
    if bytes.first() == Some(&b'-') {
        end = 1;
    }

    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut has_digits = end > int_start;

    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        if frac_end > frac_start {
            has_digits = true;
            end = frac_end;
        } else if has_digits {
            end = frac_start;
        }
    }

    if !has_digits {
        return None;
    }
    text[..end].trim_end_matches('.').parse::<f64>().ok()
}
