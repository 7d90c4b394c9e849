//! Human duration parsing
//!
//! Accepts `s`, `m` and `h` suffixes; a bare number means seconds.

use anyhow::{bail, Result};
use std::time::Duration;

/// Parse strings like `90s`, `2m`, `1h` or `45`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("empty duration");
    }

    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => raw.split_at(pos),
        None => (raw, "s"),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid duration {raw:?}"))?;

    let secs = match unit.trim() {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        other => bail!("unknown duration unit {other:?} in {raw:?}"),
    };
    Ok(Duration::from_secs(secs))
}

/// Render a duration back in the largest exact unit.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs % 3600 == 0 && secs != 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 && secs != 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("m5").is_err());
        assert!(parse_duration("five").is_err());
    }

    #[test]
    fn test_format_round_trip() {
        for raw in ["15m", "2h", "45s"] {
            let d = parse_duration(raw).unwrap();
            assert_eq!(format_duration(d), raw);
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }
}
