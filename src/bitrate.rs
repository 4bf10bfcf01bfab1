use crate::error::Error;

type Result<T> = std::result::Result<T, Error>;

/// A bitrate given either as a plain number of bits per second or as a
/// human-readable string such as `"2M"` or `"192k"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BitrateSpec {
    Bits(i64),
    Text(String),
}

impl BitrateSpec {
    /// Resolve to bits per second.
    pub fn resolve(&self) -> Result<i64> {
        match self {
            BitrateSpec::Bits(bits) => Ok(*bits),
            BitrateSpec::Text(text) => parse_bitrate(text),
        }
    }
}

impl From<i64> for BitrateSpec {
    fn from(value: i64) -> Self {
        BitrateSpec::Bits(value)
    }
}

impl From<&str> for BitrateSpec {
    fn from(value: &str) -> Self {
        BitrateSpec::Text(value.to_string())
    }
}

impl From<String> for BitrateSpec {
    fn from(value: String) -> Self {
        BitrateSpec::Text(value)
    }
}

/// Parse a bitrate string into bits per second.
///
/// Accepts a bare integer (bits per second) or a decimal number followed by
/// `k`/`K` (×10³), `m`/`M` (×10⁶) or `g`/`G` (×10⁹). Surrounding whitespace
/// is allowed and fractional values are accepted (`"1.5M"` is 1,500,000).
pub fn parse_bitrate(value: &str) -> Result<i64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidArgument(format!("empty bitrate: {value:?}")));
    }

    let (number, multiplier) = match trimmed.char_indices().last() {
        Some((last, 'k')) | Some((last, 'K')) => (&trimmed[..last], 1_000_i64),
        Some((last, 'm')) | Some((last, 'M')) => (&trimmed[..last], 1_000_000),
        Some((last, 'g')) | Some((last, 'G')) => (&trimmed[..last], 1_000_000_000),
        _ => (trimmed, 1),
    };
    let number = number.trim_end();

    if multiplier == 1 {
        return number
            .parse::<i64>()
            .map_err(|_| Error::InvalidArgument(format!("invalid bitrate: {value:?}")));
    }

    let factor = number
        .parse::<f64>()
        .map_err(|_| Error::InvalidArgument(format!("invalid bitrate: {value:?}")))?;
    if !factor.is_finite() || factor < 0.0 {
        return Err(Error::InvalidArgument(format!(
            "invalid bitrate: {value:?}"
        )));
    }

    Ok((factor * multiplier as f64).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_integers() {
        assert_eq!(parse_bitrate("128000").unwrap(), 128_000);
        assert_eq!(parse_bitrate(" 2500000 ").unwrap(), 2_500_000);
    }

    #[test]
    fn parses_suffixes() {
        assert_eq!(parse_bitrate("192k").unwrap(), 192_000);
        assert_eq!(parse_bitrate("192K").unwrap(), 192_000);
        assert_eq!(parse_bitrate("2M").unwrap(), 2_000_000);
        assert_eq!(parse_bitrate("1g").unwrap(), 1_000_000_000);
    }

    #[test]
    fn parses_fractions() {
        assert_eq!(parse_bitrate("1.5M").unwrap(), 1_500_000);
        assert_eq!(parse_bitrate("0.5k").unwrap(), 500);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_bitrate("").is_err());
        assert!(parse_bitrate("   ").is_err());
        assert!(parse_bitrate("fast").is_err());
        assert!(parse_bitrate("12q").is_err());
        assert!(parse_bitrate("1.5").is_err(), "fraction without suffix");
        assert!(parse_bitrate("-2M").is_err());
        assert!(parse_bitrate("M").is_err());
    }

    #[test]
    fn spec_resolves() {
        assert_eq!(BitrateSpec::from(640_000).resolve().unwrap(), 640_000);
        assert_eq!(BitrateSpec::from("2M").resolve().unwrap(), 2_000_000);
        assert!(BitrateSpec::from("nope").resolve().is_err());
    }
}
