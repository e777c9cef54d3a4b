//! Lenient numeric coercion for command values.
//!
//! Leading whitespace is skipped, the longest decimal prefix is taken and
//! anything after it is ignored. Text without a decimal prefix reads as zero.
//! Unlike C `atof`, only decimal notation is recognised: `inf`, `nan` and hex
//! floats read as zero, so a command value is always finite.

/// Reads the integer prefix of `text` (`"12.7"` -> 12, `"abc"` -> 0).
/// Out-of-range values saturate.
pub fn parse_int(text: &str) -> i64 {
    let bytes = text.trim_start().as_bytes();
    let (negative, mut pos) = match bytes.first() {
        Some(b'-') => (true, 1),
        Some(b'+') => (false, 1),
        _ => (false, 0),
    };

    let mut value: i64 = 0;
    while let Some(digit) = bytes.get(pos).filter(|b| b.is_ascii_digit()) {
        let d = i64::from(digit - b'0');
        value = if negative {
            value.saturating_mul(10).saturating_sub(d)
        } else {
            value.saturating_mul(10).saturating_add(d)
        };
        pos += 1;
    }
    value
}

/// Reads the decimal prefix of `text`, with optional fraction and exponent
/// (`"480.5V"` -> 480.5, `"1e3x"` -> 1000.0, `"abc"` -> 0.0).
/// Out-of-range values saturate at `f64::MAX`.
pub fn parse_float(text: &str) -> f64 {
    let bytes = text.trim_start().as_bytes();
    let mut pos = 0;

    let sign = match bytes.first() {
        Some(b'-') => {
            pos = 1;
            "-"
        }
        Some(b'+') => {
            pos = 1;
            ""
        }
        _ => "",
    };

    let int_start = pos;
    while bytes.get(pos).is_some_and(u8::is_ascii_digit) {
        pos += 1;
    }
    let int_digits = &bytes[int_start..pos];

    let mut frac_digits: &[u8] = &[];
    if bytes.get(pos) == Some(&b'.') {
        let frac_start = pos + 1;
        let mut end = frac_start;
        while bytes.get(end).is_some_and(u8::is_ascii_digit) {
            end += 1;
        }
        frac_digits = &bytes[frac_start..end];
        if !int_digits.is_empty() || !frac_digits.is_empty() {
            pos = end;
        }
    }

    if int_digits.is_empty() && frac_digits.is_empty() {
        return 0.0;
    }

    let mut exponent = String::new();
    if matches!(bytes.get(pos), Some(b'e') | Some(b'E')) {
        let mut end = pos + 1;
        let exp_sign = match bytes.get(end) {
            Some(b'-') => {
                end += 1;
                "-"
            }
            Some(b'+') => {
                end += 1;
                ""
            }
            _ => "",
        };
        let digits_start = end;
        while bytes.get(end).is_some_and(u8::is_ascii_digit) {
            end += 1;
        }
        if end > digits_start {
            exponent = format!("e{}{}", exp_sign, ascii(&bytes[digits_start..end]));
        }
    }

    let normalized = format!(
        "{}{}.{}{}",
        sign,
        if int_digits.is_empty() { "0" } else { ascii(int_digits) },
        if frac_digits.is_empty() { "0" } else { ascii(frac_digits) },
        exponent
    );
    let value: f64 = normalized.parse().unwrap_or(0.0);
    if value.is_infinite() {
        f64::MAX.copysign(value)
    } else {
        value
    }
}

fn ascii(bytes: &[u8]) -> &str {
    // only ever called on runs of ASCII digits
    std::str::from_utf8(bytes).unwrap_or("0")
}
