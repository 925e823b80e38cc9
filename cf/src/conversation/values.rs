//! Directive value parsers
//!
//! Each parser returns the reason string on failure; the compiler wraps it
//! into a located [`super::ParseError::InvalidValue`].

use std::time::Duration;

/// Parse a 0-1 fraction written as `75%`, `75` or `0.75`
///
/// A trailing `%` always divides by 100, and so does a bare integer (`1` is
/// 1%). Only a number with a decimal point of at most 1 is taken as a fraction.
pub fn parse_fraction(value: &str) -> Result<f64, String> {
    let v = value.trim();
    if v.is_empty() {
        return Err("expected a percentage".to_string());
    }

    let (number, percent) = match v.strip_suffix('%') {
        Some(n) => (n.trim(), true),
        None => (v, false),
    };

    let n: f64 = number.parse().map_err(|_| "not a number".to_string())?;
    if !n.is_finite() || n < 0.0 {
        return Err("must be a non-negative number".to_string());
    }

    let fraction = if percent || !number.contains('.') || n > 1.0 { n / 100.0 } else { n };
    if fraction > 1.0 {
        return Err("must not exceed 100%".to_string());
    }
    Ok(fraction)
}

/// Parse a non-negative integer
pub fn parse_count(value: &str) -> Result<u32, String> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| "expected a non-negative integer".to_string())
}

/// Parse a duration: `90` (seconds), `90s`, `2m`, `500ms`, `1h`
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let v = value.trim().to_lowercase();
    let split = v.find(|c: char| !c.is_ascii_digit()).unwrap_or(v.len());
    let (digits, unit) = v.split_at(split);
    let n: u64 = digits.parse().map_err(|_| "expected a duration like 60, 60s, 2m or 500ms".to_string())?;

    match unit.trim() {
        "" | "s" | "sec" | "secs" => Ok(Duration::from_secs(n)),
        "ms" => Ok(Duration::from_millis(n)),
        "m" | "min" | "mins" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        other => Err(format!("unknown duration unit '{}'", other)),
    }
}

/// Parse a boolean flag; an empty value means `empty_default`
pub fn parse_bool(value: &str, empty_default: bool) -> Result<bool, String> {
    match value.trim().to_lowercase().as_str() {
        "" => Ok(empty_default),
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err("expected true/false or yes/no".to_string()),
    }
}

/// Split a value into whitespace-separated words, honouring single and double quotes
///
/// Used for directive values (RUN-RETRY, RUN-ENV, VERIFY options); the RUN
/// command tokenizer lives with the command runner.
pub fn split_words(value: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in value.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err("unterminated quote".to_string());
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Format a fraction the way the serializer writes it back (`75%`)
pub fn format_percent(fraction: f64) -> String {
    let pct = fraction * 100.0;
    if (pct - pct.round()).abs() < 1e-9 {
        format!("{}%", pct.round() as i64)
    } else {
        format!("{}%", pct)
    }
}

/// Format a duration the way the serializer writes it back
pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() != 0 || d.as_secs() == 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}
