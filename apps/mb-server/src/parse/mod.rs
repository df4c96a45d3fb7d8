pub mod nied;
pub mod nzsm;

use anyhow::{Context, Result};

use crate::units;

/// Longitudes are stored wrapped to `[-180, 180]`.
pub fn wrap_longitude(mut longitude: f64) -> f64 {
    while longitude > 180.0 {
        longitude -= 360.0;
    }
    while longitude < -180.0 {
        longitude += 360.0;
    }
    longitude
}

/// The single parenthesized unit token of a header line.
pub fn parse_unit(line: &str) -> Result<String> {
    let mut units = Vec::new();
    let mut rest = line;
    while let Some(open) = rest.find('(') {
        let tail = &rest[open + 1..];
        let close = tail
            .find(')')
            .with_context(|| format!("unterminated unit in line: {line}"))?;
        units.push(tail[..close].to_string());
        rest = &tail[close + 1..];
    }
    match units.len() {
        0 => anyhow::bail!("No unit found in line: {line}."),
        1 => Ok(units.remove(0)),
        _ => anyhow::bail!("Multiple units found in line: {line}."),
    }
}

pub fn normalise_unit(line: &str) -> Result<String> {
    Ok(units::normalise_unit(&parse_unit(line)?))
}

/// `"(gal)/num/den"`-style scale factors; the unit token is optional.
pub fn strip_unit(line: &str) -> Result<f64> {
    let stripped = match parse_unit(line) {
        Ok(unit) => line.replace(&format!("({unit})"), ""),
        Err(_) => line.to_string(),
    };
    let (numerator, denominator) = stripped
        .split_once('/')
        .with_context(|| format!("no ratio found in line: {line}"))?;
    let numerator: f64 = numerator.trim().parse()?;
    let denominator: f64 = denominator.trim().parse()?;
    Ok(numerator / denominator)
}

/// Channel direction token: upper-cased, `-` removed.
pub fn parse_direction(token: &str) -> String {
    token.replace('-', "").trim().to_uppercase()
}

/// The single numeric token of a header line.
pub fn parse_value(line: &str) -> Result<String> {
    let mut values: Vec<String> = Vec::new();
    let mut current = String::new();
    for ch in line.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            current.push(ch);
        } else if !current.is_empty() {
            values.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        values.push(current);
    }
    match values.len() {
        0 => anyhow::bail!("No value found in line: {line}."),
        1 => Ok(values.remove(0)),
        _ => anyhow::bail!("Multiple values found in line: {line}."),
    }
}

/// Fixed-width field split used by the NZSM header and sample blocks. The
/// cut is nudged forward to the next character boundary so stray non-ASCII
/// bytes cannot panic the walk.
pub fn split_fixed(line: &str, size: usize) -> Vec<&str> {
    let line = line.trim_end_matches(['\n', '\r']);
    let mut fields = Vec::with_capacity(line.len() / size + 1);
    let mut rest = line;
    while !rest.is_empty() {
        let mut cut = size.min(rest.len());
        while cut < rest.len() && !rest.is_char_boundary(cut) {
            cut += 1;
        }
        fields.push(&rest[..cut]);
        rest = &rest[cut..];
    }
    fields
}

pub fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longitude_wrap() {
        assert_eq!(wrap_longitude(190.0), -170.0);
        assert_eq!(wrap_longitude(-181.0), 179.0);
        assert_eq!(wrap_longitude(172.5), 172.5);
    }

    #[test]
    fn unit_extraction_requires_exactly_one() {
        assert_eq!(parse_unit("Depth.            10(km)").unwrap(), "km");
        assert!(parse_unit("no unit here").is_err());
        assert!(parse_unit("two (km) units (m)").is_err());
    }

    #[test]
    fn gal_normalised_from_header() {
        assert_eq!(
            normalise_unit("Max. Acc.         123.4(gal)").unwrap(),
            "Gal"
        );
    }

    #[test]
    fn scale_factor_ratio() {
        // the unit token is removed first, then numerator/denominator
        let value = strip_unit("7845(gal)/8388608").unwrap();
        assert!((value - 7845.0 / 8388608.0).abs() < 1e-12);
        assert!((strip_unit("3/4").unwrap() - 0.75).abs() < 1e-12);
        assert!(strip_unit("no ratio").is_err());
    }

    #[test]
    fn direction_token() {
        assert_eq!(parse_direction("N-S"), "NS");
        assert_eq!(parse_direction("U-D"), "UD");
        assert_eq!(parse_direction("n28e"), "N28E");
    }

    #[test]
    fn value_extraction() {
        assert_eq!(parse_value("100Hz").unwrap(), "100");
        assert!(parse_value("1 and 2").is_err());
        assert!(parse_value("none").is_err());
    }

    #[test]
    fn fixed_split_handles_ragged_tail() {
        let fields = split_fixed("aaaabbbbcc", 4);
        assert_eq!(fields, vec!["aaaa", "bbbb", "cc"]);
        assert!(split_fixed("", 8).is_empty());
    }

    #[test]
    fn basename_strips_directories() {
        assert_eq!(basename("a/b/SZO.NS"), "SZO.NS");
        assert_eq!(basename("SZO.NS"), "SZO.NS");
    }
}
