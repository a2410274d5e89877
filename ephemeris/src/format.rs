//! Sexagesimal formatting and parsing.

use crate::EphemerisError;

/// `05h30m00.0s`
pub fn format_hms(hours: f64) -> String {
    let tenths = (hours.rem_euclid(24.0) * 36_000.0).round() as u64 % (24 * 36_000);
    format!(
        "{:02}h{:02}m{:02}.{}s",
        tenths / 36_000,
        (tenths / 600) % 60,
        (tenths / 10) % 60,
        tenths % 10
    )
}

/// `+30°00'00"`
pub fn format_dms(degrees: f64) -> String {
    let sign = if degrees < 0.0 { '-' } else { '+' };
    let arcsec = (degrees.abs() * 3600.0).round() as u64;
    format!(
        "{}{:02}°{:02}'{:02}\"",
        sign,
        arcsec / 3600,
        (arcsec / 60) % 60,
        arcsec % 60
    )
}

/// Parse `12.5`, `12:30`, `12:30:00`, `-05 30 00` or `12h30m00s` style
/// values into a real number of the leading unit.
pub fn parse_sexagesimal(text: &str) -> Result<f64, EphemerisError> {
    let trimmed = text.trim();
    let negative = trimmed.starts_with('-');
    let body = trimmed.trim_start_matches(['+', '-']);

    let fields: Vec<&str> = body
        .split(|c: char| c == ':' || c.is_whitespace() || "hmsd°'\"".contains(c))
        .filter(|s| !s.is_empty())
        .collect();
    if fields.is_empty() || fields.len() > 3 {
        return Err(EphemerisError::Parse(text.to_string()));
    }

    let mut value = 0.0;
    for (index, field) in fields.iter().enumerate() {
        let part: f64 = field
            .parse()
            .map_err(|_| EphemerisError::Parse(text.to_string()))?;
        if part < 0.0 || (index > 0 && part >= 60.0) {
            return Err(EphemerisError::Parse(text.to_string()));
        }
        value += part / 60f64.powi(index as i32);
    }
    Ok(if negative { -value } else { value })
}
