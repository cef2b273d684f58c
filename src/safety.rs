//! Bounds checks applied before any voltage- or compliance-setting I/O.

use crate::error::SmuError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hard limits of the supported instruments. Never mutated at runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyLimits {
    pub max_abs_voltage: f64,
    pub max_compliance_ua: f64,
}

pub const SAFETY_LIMITS: SafetyLimits = SafetyLimits {
    max_abs_voltage: 210.0,
    max_compliance_ua: 1_000_000.0,
};

/// Sweeps reaching beyond this magnitude need an explicit acknowledgement.
pub const HIGH_VOLTAGE_ADVISORY: f64 = 5.0;

/// Smallest host-paced inter-point delay.
pub const MIN_HOST_DELAY: Duration = Duration::from_millis(10);

/// Lower bound on the delay of an instrument-timed loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FastLimit {
    #[default]
    #[serde(rename = "1ms")]
    OneMillisecond,
    #[serde(rename = "500ns")]
    FiveHundredNanoseconds,
}

impl FastLimit {
    pub fn min_delay(self) -> Duration {
        match self {
            FastLimit::OneMillisecond => Duration::from_millis(1),
            FastLimit::FiveHundredNanoseconds => Duration::from_nanos(500),
        }
    }
}

pub fn validate_voltage(voltage: f64) -> Result<(), SmuError> {
    if !voltage.is_finite() {
        return Err(SmuError::OutOfRange(
            "Voltage must be a finite number".to_string(),
        ));
    }
    if voltage.abs() > SAFETY_LIMITS.max_abs_voltage {
        return Err(SmuError::OutOfRange(format!(
            "Voltage {voltage} exceeds allowed range (+/-{} V)",
            SAFETY_LIMITS.max_abs_voltage
        )));
    }
    Ok(())
}

pub fn validate_compliance(compliance_ua: f64) -> Result<(), SmuError> {
    if !compliance_ua.is_finite() {
        return Err(SmuError::OutOfRange(
            "Compliance must be a finite number".to_string(),
        ));
    }
    if compliance_ua <= 0.0 {
        return Err(SmuError::OutOfRange(
            "Compliance must be greater than 0 uA".to_string(),
        ));
    }
    if compliance_ua > SAFETY_LIMITS.max_compliance_ua {
        return Err(SmuError::OutOfRange(format!(
            "Compliance {compliance_ua} uA exceeds allowed range ({} uA max)",
            SAFETY_LIMITS.max_compliance_ua
        )));
    }
    Ok(())
}

/// Check an inter-point delay (seconds) against the execution mode's floor.
///
/// `fast_limit` is `None` for host-paced execution.
pub fn validate_delay(delay_s: f64, fast_limit: Option<FastLimit>) -> Result<Duration, SmuError> {
    if !delay_s.is_finite() || delay_s < 0.0 {
        return Err(SmuError::OutOfRange(
            "Delay must be a non-negative finite number".to_string(),
        ));
    }
    let min = fast_limit.map_or(MIN_HOST_DELAY, FastLimit::min_delay);
    if delay_s < min.as_secs_f64() {
        return Err(SmuError::OutOfRange(format!(
            "Delay must be at least {}",
            describe_delay(min)
        )));
    }
    Duration::try_from_secs_f64(delay_s)
        .map_err(|_| SmuError::OutOfRange(format!("Delay {delay_s} s is too long")))
}

/// Whether any of the given levels needs a high-voltage acknowledgement.
pub fn exceeds_advisory<I>(voltages: I) -> bool
where
    I: IntoIterator<Item = f64>,
{
    voltages
        .into_iter()
        .any(|v| v.abs() > HIGH_VOLTAGE_ADVISORY)
}

fn describe_delay(d: Duration) -> String {
    if d < Duration::from_micros(1) {
        format!("{} ns", d.as_nanos())
    } else if d < Duration::from_millis(1) {
        format!("{:.1e} s", d.as_secs_f64())
    } else {
        format!("{:.3} s", d.as_secs_f64())
    }
}
