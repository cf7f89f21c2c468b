//! Field normalization
//!
//! Pure functions that turn raw scalar fields into stable, comparable forms.
//! None of them perform I/O or panic on malformed input.

use rust_decimal::prelude::*;

/// Width of a normalized case number
pub const CASE_KEY_WIDTH: usize = 8;

/// Width of a normalized purchase-order number
pub const ORDER_KEY_WIDTH: usize = 10;

/// Value returned by [`normalize_amount`] for input that cannot be parsed
pub fn amount_sentinel() -> Decimal {
    Decimal::new(0, 2)
}

/// Normalize a case number to exactly [`CASE_KEY_WIDTH`] digits
///
/// Non-digits are stripped and the remaining digits left-padded with zeros.
/// Returns an empty string (an invalid key) when the input has no digits or
/// more significant digits than fit in the width.
pub fn normalize_case_key(raw: &str) -> String {
    fixed_width_digits(raw, CASE_KEY_WIDTH)
}

/// Normalize a purchase-order number to exactly [`ORDER_KEY_WIDTH`] digits
pub fn normalize_order_key(raw: &str) -> String {
    fixed_width_digits(raw, ORDER_KEY_WIDTH)
}

fn fixed_width_digits(raw: &str, width: usize) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return String::new();
    }

    let significant = digits.trim_start_matches('0');
    if significant.len() > width {
        return String::new();
    }

    format!("{:0>width$}", significant, width = width)
}

/// Strip all whitespace and uppercase
pub fn normalize_client_code(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

/// Parse a currency amount into a two-digit fixed-point decimal
///
/// Currency symbols and letters are ignored. Separators:
/// - both `.` and `,` present: the last one is the decimal separator
/// - one kind present: it separates thousands when it occurs more than once
///   or is followed by exactly three digits, otherwise it is the decimal
///   separator
///
/// A leading `-` or surrounding parentheses make the amount negative. Rounds
/// half away from zero. Unparsable input yields [`amount_sentinel`].
pub fn normalize_amount(raw: &str) -> Decimal {
    let trimmed = raw.trim();
    let first_digit = trimmed.find(|c: char| c.is_ascii_digit());
    let Some(first_digit) = first_digit else {
        return amount_sentinel();
    };

    let negative = trimmed[..first_digit].contains('-')
        || (trimmed.starts_with('(') && trimmed.ends_with(')'));

    let kept: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();

    let Some(canonical) = resolve_separators(&kept) else {
        return amount_sentinel();
    };

    match Decimal::from_str(&canonical) {
        Ok(value) => {
            let rounded = value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
            if negative {
                -rounded
            } else {
                rounded
            }
        }
        Err(_) => amount_sentinel(),
    }
}

/// Rewrite digits and separators into `123.45` form
fn resolve_separators(kept: &str) -> Option<String> {
    let last_dot = kept.rfind('.');
    let last_comma = kept.rfind(',');

    let decimal_sep = match (last_dot, last_comma) {
        (None, None) => return Some(kept.to_string()),
        (Some(dot), Some(comma)) => {
            if dot > comma {
                '.'
            } else {
                ','
            }
        }
        (Some(pos), None) | (None, Some(pos)) => {
            let sep = if last_dot.is_some() { '.' } else { ',' };
            let occurrences = kept.matches(sep).count();
            let digits_after = kept[pos + 1..].len();
            if occurrences > 1 || digits_after == 3 {
                // Thousands separator only
                return Some(kept.replace(sep, ""));
            }
            sep
        }
    };

    let thousands_sep = if decimal_sep == '.' { ',' } else { '.' };
    let without_thousands = kept.replace(thousands_sep, "");
    if without_thousands.matches(decimal_sep).count() > 1 {
        return None;
    }

    let mut canonical = without_thousands.replace(decimal_sep, ".");
    if canonical.starts_with('.') {
        canonical.insert(0, '0');
    }
    if canonical.ends_with('.') {
        canonical.pop();
    }
    Some(canonical)
}

/// Convert a numeric source value to a two-digit fixed-point decimal
pub fn normalize_amount_number(value: f64) -> Decimal {
    match Decimal::from_f64(value) {
        Some(d) => d.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero),
        None => amount_sentinel(),
    }
}

/// Collapse whitespace and title-case each word
pub fn normalize_text(raw: Option<&str>) -> Option<String> {
    let raw = raw?;
    let words: Vec<String> = raw
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect();
    Some(words.join(" "))
}

/// Map a free-text service type onto the canonical vocabulary
///
/// Anything mentioning one of the known services maps to it; other values are
/// trimmed and uppercased. Blank input maps to `None`.
pub fn normalize_service_type(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() {
        return None;
    }

    let folded = trimmed.to_lowercase().replace('ú', "u");
    for canonical in ["arrastre", "traslado", "grua", "salvamento"] {
        if folded.contains(canonical) {
            return Some(canonical.to_uppercase());
        }
    }

    Some(trimmed.to_uppercase())
}
