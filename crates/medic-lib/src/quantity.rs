//! Kubernetes quantity and condition threshold parsing
//!
//! Quantities are converted to `f64` base units (cores, bytes, counts),
//! which is precise enough for threshold comparison and quota arithmetic.

use crate::crd::SignalType;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid quantity {0:?}")]
    Invalid(String),

    #[error("unknown quantity suffix {suffix:?} in {raw:?}")]
    UnknownSuffix { raw: String, suffix: String },

    #[error("threshold {raw:?} carries a unit that does not apply to {signal}")]
    UnitMismatch { raw: String, signal: String },

    #[error("unsupported signal type {0}")]
    UnsupportedSignal(String),

    #[error("threshold {0:?} must be a finite, non-negative number")]
    OutOfRange(String),
}

/// Parse a Kubernetes quantity string ("100m", "512Mi", "2", "1e3") into base units
pub fn parse_quantity(raw: &str) -> Result<f64, QuantityError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(QuantityError::Empty);
    }

    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);

    // Decimal exponent form, e.g. "1e3" or "2.5E-1"
    if let Some(exponent) = suffix.strip_prefix(['e', 'E']) {
        if !exponent.is_empty() && exponent.parse::<i32>().is_ok() {
            return raw
                .parse::<f64>()
                .map_err(|_| QuantityError::Invalid(raw.to_string()));
        }
    }

    let value: f64 = number
        .parse()
        .map_err(|_| QuantityError::Invalid(raw.to_string()))?;

    let multiplier = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0_f64.powi(4),
        "Pi" => 1024.0_f64.powi(5),
        "Ei" => 1024.0_f64.powi(6),
        _ => {
            return Err(QuantityError::UnknownSuffix {
                raw: raw.to_string(),
                suffix: suffix.to_string(),
            })
        }
    };

    Ok(value * multiplier)
}

/// Parse every quantity of a resource list, e.g. container requests
pub fn parse_resource_list(
    list: &BTreeMap<String, Quantity>,
) -> Result<BTreeMap<String, f64>, QuantityError> {
    list.iter()
        .map(|(name, quantity)| Ok((name.clone(), parse_quantity(&quantity.0)?)))
        .collect()
}

/// A parsed condition threshold
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Threshold {
    /// Percentage of the resource limit (or an error-rate percentage)
    Percent(f64),
    /// Absolute value in base units: cores, bytes or restart count
    Absolute(f64),
}

impl Threshold {
    /// Parse a threshold for a signal.
    ///
    /// `"80%"` and bare numbers are percentages for CPU, memory and error
    /// rate; bare numbers are counts for pod restarts; suffixed quantities
    /// are absolute cores or bytes. NaN, infinite and negative values are
    /// rejected.
    pub fn parse(raw: &str, signal: &SignalType) -> Result<Self, QuantityError> {
        let threshold = Self::parse_unit(raw, signal)?;
        if !threshold.value().is_finite() || threshold.value() < 0.0 {
            return Err(QuantityError::OutOfRange(raw.to_string()));
        }
        Ok(threshold)
    }

    fn value(&self) -> f64 {
        match *self {
            Threshold::Percent(value) | Threshold::Absolute(value) => value,
        }
    }

    fn parse_unit(raw: &str, signal: &SignalType) -> Result<Self, QuantityError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(QuantityError::Empty);
        }
        if let SignalType::Other(other) = signal {
            return Err(QuantityError::UnsupportedSignal(other.clone()));
        }

        if let Some(percent) = trimmed.strip_suffix('%') {
            if matches!(signal, SignalType::PodRestarts) {
                return Err(QuantityError::UnitMismatch {
                    raw: raw.to_string(),
                    signal: signal.to_string(),
                });
            }
            let value = percent
                .trim()
                .parse::<f64>()
                .map_err(|_| QuantityError::Invalid(raw.to_string()))?;
            return Ok(Threshold::Percent(value));
        }

        if let Ok(value) = trimmed.parse::<f64>() {
            return Ok(match signal {
                SignalType::PodRestarts => Threshold::Absolute(value),
                _ => Threshold::Percent(value),
            });
        }

        match signal {
            SignalType::CpuUsage | SignalType::MemoryUsage => {
                parse_quantity(trimmed).map(Threshold::Absolute)
            }
            _ => Err(QuantityError::UnitMismatch {
                raw: raw.to_string(),
                signal: signal.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_parse_quantity_suffixes() {
        assert!(approx(parse_quantity("100m").unwrap(), 0.1));
        assert!(approx(parse_quantity("2").unwrap(), 2.0));
        assert!(approx(parse_quantity("1.5").unwrap(), 1.5));
        assert!(approx(parse_quantity("128Mi").unwrap(), 134_217_728.0));
        assert!(approx(parse_quantity("1G").unwrap(), 1e9));
        assert!(approx(parse_quantity("1e3").unwrap(), 1000.0));
        assert!(approx(parse_quantity("250u").unwrap(), 0.00025));
    }

    #[test]
    fn test_parse_quantity_errors() {
        assert_eq!(parse_quantity(""), Err(QuantityError::Empty));
        assert!(matches!(
            parse_quantity("12Qi"),
            Err(QuantityError::UnknownSuffix { .. })
        ));
        assert!(matches!(
            parse_quantity("abc"),
            Err(QuantityError::Invalid(_))
        ));
    }

    #[test]
    fn test_threshold_percent_forms() {
        assert_eq!(
            Threshold::parse("80%", &SignalType::CpuUsage).unwrap(),
            Threshold::Percent(80.0)
        );
        assert_eq!(
            Threshold::parse("80", &SignalType::CpuUsage).unwrap(),
            Threshold::Percent(80.0)
        );
        assert_eq!(
            Threshold::parse("5", &SignalType::ErrorRate).unwrap(),
            Threshold::Percent(5.0)
        );
    }

    #[test]
    fn test_threshold_absolute_forms() {
        assert_eq!(
            Threshold::parse("500m", &SignalType::CpuUsage).unwrap(),
            Threshold::Absolute(0.5)
        );
        assert_eq!(
            Threshold::parse("1Gi", &SignalType::MemoryUsage).unwrap(),
            Threshold::Absolute(1_073_741_824.0)
        );
        assert_eq!(
            Threshold::parse("3", &SignalType::PodRestarts).unwrap(),
            Threshold::Absolute(3.0)
        );
    }

    #[test]
    fn test_threshold_rejects_mismatched_units() {
        assert!(matches!(
            Threshold::parse("50%", &SignalType::PodRestarts),
            Err(QuantityError::UnitMismatch { .. })
        ));
        assert!(matches!(
            Threshold::parse("100m", &SignalType::ErrorRate),
            Err(QuantityError::UnitMismatch { .. })
        ));
        assert!(matches!(
            Threshold::parse("80", &SignalType::Other("Latency".to_string())),
            Err(QuantityError::UnsupportedSignal(_))
        ));
    }

    #[test]
    fn test_threshold_rejects_non_finite_and_negative() {
        for raw in ["NaN", "inf", "-inf", "-5%", "-1", "NaN%"] {
            assert_eq!(
                Threshold::parse(raw, &SignalType::CpuUsage),
                Err(QuantityError::OutOfRange(raw.to_string())),
                "{raw}"
            );
        }
        assert!(matches!(
            Threshold::parse("-500m", &SignalType::CpuUsage),
            Err(QuantityError::OutOfRange(_))
        ));
        assert!(matches!(
            Threshold::parse("inf", &SignalType::PodRestarts),
            Err(QuantityError::OutOfRange(_))
        ));
        assert_eq!(
            Threshold::parse("0", &SignalType::PodRestarts).unwrap(),
            Threshold::Absolute(0.0)
        );
    }
}
