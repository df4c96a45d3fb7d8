use anyhow::Result;

/// Canonical spelling of vendor unit tokens. NIED writes `gal` lower-case.
pub fn normalise_unit(unit: &str) -> String {
    let trimmed = unit.trim();
    if trimmed.eq_ignore_ascii_case("gal") {
        return "Gal".to_string();
    }
    trimmed.to_string()
}

fn length_in_metres(unit: &str) -> Result<f64> {
    Ok(match normalise_unit(unit).as_str() {
        "km" => 1000.0,
        "m" => 1.0,
        "cm" => 0.01,
        "mm" => 0.001,
        other => anyhow::bail!("unknown length unit: {other}"),
    })
}

fn time_in_seconds(unit: &str) -> Result<f64> {
    Ok(match normalise_unit(unit).as_str() {
        "s" | "sec" => 1.0,
        "ms" => 0.001,
        "min" => 60.0,
        other => anyhow::bail!("unknown time unit: {other}"),
    })
}

/// Acceleration units expressed in m/s². `Gal` is cm/s².
fn accel_in_si(unit: &str) -> Result<f64> {
    Ok(match normalise_unit(unit).as_str() {
        "Gal" | "cm/s/s" | "cm/s^2" | "cm/s2" => 0.01,
        "mm/s/s" | "mm/s^2" | "mm/s2" => 0.001,
        "m/s/s" | "m/s^2" | "m/s2" => 1.0,
        other => anyhow::bail!("unknown acceleration unit: {other}"),
    })
}

pub fn to_kilometres(value: f64, unit: &str) -> Result<f64> {
    Ok(value * length_in_metres(unit)? / 1000.0)
}

pub fn to_seconds(value: f64, unit: &str) -> Result<f64> {
    Ok(value * time_in_seconds(unit)?)
}

/// Multiplier converting acceleration samples from one unit into another.
pub fn accel_factor(from: &str, to: &str) -> Result<f64> {
    Ok(accel_in_si(from)? / accel_in_si(to)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gal_is_capitalised() {
        assert_eq!(normalise_unit("gal"), "Gal");
        assert_eq!(normalise_unit(" Gal "), "Gal");
    }

    #[test]
    fn depth_converts_to_kilometres() {
        assert_eq!(to_kilometres(10.0, "km").unwrap(), 10.0);
        assert_eq!(to_kilometres(2500.0, "m").unwrap(), 2.5);
    }

    #[test]
    fn acceleration_factors() {
        // mm/s/s into Gal (cm/s/s) divides by ten
        assert!((accel_factor("mm/s/s", "Gal").unwrap() - 0.1).abs() < 1e-12);
        assert!((accel_factor("Gal", "cm/s/s").unwrap() - 1.0).abs() < 1e-12);
        assert!((accel_factor("m/s/s", "Gal").unwrap() - 100.0).abs() < 1e-12);
    }

    #[test]
    fn unknown_units_are_rejected() {
        assert!(accel_factor("furlong", "Gal").is_err());
        assert!(to_seconds(1.0, "fortnight").is_err());
    }
}
