//! Command dialects spoken by the supported SMU families.
//!
//! Both adapters expose the same operation set over a borrowed
//! [`Transport`]; the session owns the transport and picks the adapter from
//! the identity string at connect time.

use crate::error::{DeviceErrorRecord, SmuError};
use crate::transport::Transport;
use crate::types::Measurement;
use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;

/// Readings at or beyond this magnitude are the instrument's overflow marker.
pub const OVERFLOW_SENTINEL: f64 = 9.9e37;

/// Models that speak the script dialect.
const SCRIPT_MODELS: [&str; 9] = [
    "2601", "2602", "2604", "2611", "2612", "2614", "2634", "2635", "2636",
];

static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[+-]?(?:\d+\.?\d*|\.\d+)(?:[Ee][+-]?\d+)?").expect("valid number pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    /// SCPI-style line commands (2400 family).
    Line,
    /// TSP script commands (2600 family).
    Script,
}

impl DialectKind {
    /// Decided by the model field alone; serial and firmware fields may
    /// contain anything.
    pub fn from_identity(identity: &str) -> Self {
        let model = model_field(identity);
        if SCRIPT_MODELS.iter().any(|m| model.starts_with(m)) {
            DialectKind::Script
        } else {
            DialectKind::Line
        }
    }

    /// Source-measure channel the script dialect addresses.
    pub fn channel(self) -> &'static str {
        "smua"
    }

    pub fn adapter(self) -> Box<dyn SmuDialect> {
        match self {
            DialectKind::Line => Box::new(LineDialect),
            DialectKind::Script => Box::new(ScriptDialect::new(self.channel())),
        }
    }
}

impl std::fmt::Display for DialectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialectKind::Line => write!(f, "scpi"),
            DialectKind::Script => write!(f, "tsp"),
        }
    }
}

/// Model token of an identity string: the second comma field with any
/// `MODEL` prefix removed, e.g. `2602B` for `Keithley ..., Model 2602B, ...`.
fn model_field(identity: &str) -> String {
    let upper = identity.to_uppercase();
    let field = upper.split(',').nth(1).unwrap_or(&upper).trim();
    field.strip_prefix("MODEL").unwrap_or(field).trim().to_string()
}

/// The abstract SMU operation set, rendered into one dialect's wire text.
pub trait SmuDialect: Send {
    fn kind(&self) -> DialectKind;

    fn identify(&self, t: &mut dyn Transport) -> Result<String, SmuError>;

    fn set_voltage(&self, t: &mut dyn Transport, volts: f64) -> Result<(), SmuError>;

    fn set_compliance_microamps(&self, t: &mut dyn Transport, microamps: f64) -> Result<(), SmuError>;

    fn measure_current(&self, t: &mut dyn Transport) -> Result<f64, SmuError>;

    fn enable_output(&self, t: &mut dyn Transport) -> Result<(), SmuError>;

    fn disable_output(&self, t: &mut dyn Transport) -> Result<(), SmuError>;

    /// Known-safe state: output off, 0 V, 1 µA limit, current autorange.
    fn reset_to_defaults(&self, t: &mut dyn Transport) -> Result<(), SmuError>;

    /// Pop every pending entry from the instrument's error queue.
    fn drain_errors(&self, t: &mut dyn Transport) -> Result<Vec<DeviceErrorRecord>, SmuError>;

    /// Compile an instrument-resident timed loop over `voltages`, if the
    /// dialect can run one.
    fn timed_sweep_script(&self, _voltages: &[f64], _delay: Duration) -> Option<String> {
        None
    }
}

/// Probe `*IDN?`, then the script-dialect model query, then give up with a
/// placeholder that will fail the vendor check.
pub fn probe_identity(t: &mut dyn Transport) -> String {
    match t.query("*IDN?") {
        Ok(reply) if !reply.trim().is_empty() => return reply.trim().to_string(),
        Ok(_) => debug!("Empty *IDN? reply"),
        Err(e) => debug!("*IDN? failed: {e}"),
    }
    match t.query("print(localnode.model)") {
        Ok(model) if !model.trim().is_empty() => format!("KEITHLEY,{},TSP", model.trim()),
        Ok(_) => "Unknown instrument".to_string(),
        Err(e) => {
            warn!("Instrument did not answer identity probes: {e}");
            "Unknown instrument".to_string()
        }
    }
}

/// First numeric literal of the first comma-separated field.
pub fn parse_first_number(raw: &str) -> Result<f64, SmuError> {
    let first = raw.trim().split(',').next().unwrap_or("");
    NUMBER
        .find(first)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .ok_or_else(|| SmuError::UnexpectedResponse(raw.trim().to_string()))
}

/// Parse a current reading, rejecting the overflow marker.
pub fn parse_current(raw: &str) -> Result<f64, SmuError> {
    let value = parse_first_number(raw)?;
    if value.abs() >= OVERFLOW_SENTINEL {
        return Err(SmuError::OverrangeReading(value));
    }
    Ok(value)
}

/// Split `v,i;v,i;...` into measurements, skipping malformed pairs.
pub fn parse_timed_sweep_reply(raw: &str) -> Vec<Measurement> {
    raw.trim()
        .split(';')
        .filter(|pair| !pair.trim().is_empty())
        .filter_map(|pair| {
            let (v, i) = pair.split_once(',')?;
            let v = v.trim().parse::<f64>().ok()?;
            let i = i.trim().parse::<f64>().ok()?;
            Some(Measurement::new(v, i))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LineDialect;

impl SmuDialect for LineDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Line
    }

    fn identify(&self, t: &mut dyn Transport) -> Result<String, SmuError> {
        Ok(t.query("*IDN?")?.trim().to_string())
    }

    fn set_voltage(&self, t: &mut dyn Transport, volts: f64) -> Result<(), SmuError> {
        t.write_line(&format!("SOUR:VOLT {volts}"))?;
        Ok(())
    }

    fn set_compliance_microamps(&self, t: &mut dyn Transport, microamps: f64) -> Result<(), SmuError> {
        t.write_line(&format!("SENS:CURR:PROT {}", microamps / 1e6))?;
        Ok(())
    }

    fn measure_current(&self, t: &mut dyn Transport) -> Result<f64, SmuError> {
        let raw = t.query("MEAS:CURR?")?;
        parse_current(&raw)
    }

    fn enable_output(&self, t: &mut dyn Transport) -> Result<(), SmuError> {
        t.write_line("OUTP ON")?;
        Ok(())
    }

    fn disable_output(&self, t: &mut dyn Transport) -> Result<(), SmuError> {
        t.write_line("OUTP OFF")?;
        Ok(())
    }

    fn reset_to_defaults(&self, t: &mut dyn Transport) -> Result<(), SmuError> {
        for command in [
            "*CLS",
            "OUTP OFF",
            "SOUR:VOLT 0",
            "SENS:CURR:RANG:AUTO ON",
            "SENS:CURR:PROT 1E-6",
        ] {
            t.write_line(command)?;
        }
        Ok(())
    }

    /// One `SYST:ERR?` read; at most one record per drain.
    fn drain_errors(&self, t: &mut dyn Transport) -> Result<Vec<DeviceErrorRecord>, SmuError> {
        let reply = t.query("SYST:ERR?")?;
        let reply = reply.trim();
        if reply.starts_with('0') || reply.starts_with("+0") {
            return Ok(Vec::new());
        }
        let (code, message) = reply.split_once(',').unwrap_or((reply, ""));
        let code = parse_first_number(code).map(|c| c as i64).unwrap_or(-1);
        Ok(vec![DeviceErrorRecord {
            code,
            message: message.trim().trim_matches('"').to_string(),
            severity: None,
            node: None,
        }])
    }
}

#[derive(Debug, Clone)]
pub struct ScriptDialect {
    channel: String,
}

impl ScriptDialect {
    pub fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl SmuDialect for ScriptDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Script
    }

    fn identify(&self, t: &mut dyn Transport) -> Result<String, SmuError> {
        Ok(probe_identity(t))
    }

    fn set_voltage(&self, t: &mut dyn Transport, volts: f64) -> Result<(), SmuError> {
        t.write_line(&format!("{}.source.levelv = {volts}", self.channel))?;
        Ok(())
    }

    fn set_compliance_microamps(&self, t: &mut dyn Transport, microamps: f64) -> Result<(), SmuError> {
        t.write_line(&format!("{}.source.limiti = {}", self.channel, microamps / 1e6))?;
        Ok(())
    }

    fn measure_current(&self, t: &mut dyn Transport) -> Result<f64, SmuError> {
        let raw = t.query(&format!("print({}.measure.i())", self.channel))?;
        parse_current(&raw)
    }

    fn enable_output(&self, t: &mut dyn Transport) -> Result<(), SmuError> {
        let ch = &self.channel;
        t.write_line(&format!("{ch}.source.output = {ch}.OUTPUT_ON"))?;
        Ok(())
    }

    fn disable_output(&self, t: &mut dyn Transport) -> Result<(), SmuError> {
        let ch = &self.channel;
        t.write_line(&format!("{ch}.source.output = {ch}.OUTPUT_OFF"))?;
        Ok(())
    }

    fn reset_to_defaults(&self, t: &mut dyn Transport) -> Result<(), SmuError> {
        let ch = &self.channel;
        for command in [
            format!("{ch}.reset()"),
            format!("{ch}.source.func = {ch}.OUTPUT_DCVOLTS"),
            format!("{ch}.source.levelv = 0"),
            format!("{ch}.source.limiti = 1e-6"),
            format!("{ch}.measure.autorangei = {ch}.AUTORANGE_ON"),
            format!("{ch}.source.output = {ch}.OUTPUT_OFF"),
        ] {
            t.write_line(&command)?;
        }
        Ok(())
    }

    fn drain_errors(&self, t: &mut dyn Transport) -> Result<Vec<DeviceErrorRecord>, SmuError> {
        let count = parse_first_number(&t.query("print(errorqueue.count)")?)?;
        let count = count.abs() as usize;
        let mut records = Vec::new();
        for _ in 0..count {
            let raw = t.query(
                "code, msg, sev, node = errorqueue.next(); \
                 print(code .. '|' .. msg .. '|' .. sev .. '|' .. node)",
            )?;
            let parts: Vec<&str> = raw.trim().split('|').collect();
            let code = parse_first_number(parts[0]).map(|c| c as i64).unwrap_or(0);
            if code == 0 {
                continue;
            }
            let field = |idx: usize| {
                parts
                    .get(idx)
                    .and_then(|p| parse_first_number(p).ok())
                    .map(|n| n as i64)
            };
            records.push(DeviceErrorRecord {
                code,
                message: parts
                    .get(1)
                    .map(|m| m.trim().to_string())
                    .unwrap_or_else(|| raw.trim().to_string()),
                severity: field(2),
                node: field(3),
            });
        }
        Ok(records)
    }

    fn timed_sweep_script(&self, voltages: &[f64], delay: Duration) -> Option<String> {
        let ch = &self.channel;
        let points = voltages
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let delay_s = delay.as_secs_f64();
        Some(format!(
            "local pts={{ {points} }}; local out=''; \
             for idx,v in ipairs(pts) do {ch}.source.levelv=v; delay({delay_s}); \
             local i={ch}.measure.i(); out=out..string.format('%.12g,%.12e;', v, i); end; \
             print(out)"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{SimModel, SimulatedSmu};

    #[test]
    fn test_dialect_from_identity() {
        assert_eq!(
            DialectKind::from_identity("Keithley Instruments Inc., Model 2602B, 1, 3.2.2"),
            DialectKind::Script
        );
        assert_eq!(DialectKind::from_identity("KEITHLEY,2636A,TSP"), DialectKind::Script);
        assert_eq!(
            DialectKind::from_identity("KEITHLEY INSTRUMENTS INC.,MODEL 2400,1,C30"),
            DialectKind::Line
        );
        assert_eq!(DialectKind::from_identity("Unknown instrument"), DialectKind::Line);
    }

    #[test]
    fn test_serial_number_does_not_select_dialect() {
        assert_eq!(
            DialectKind::from_identity("KEITHLEY INSTRUMENTS INC.,MODEL 2400,4126112,C30"),
            DialectKind::Line
        );
        assert_eq!(
            DialectKind::from_identity("KEITHLEY INSTRUMENTS INC.,MODEL 2410,1,C2602"),
            DialectKind::Line
        );
        assert_eq!(DialectKind::from_identity("Model 2611B"), DialectKind::Script);
    }

    #[test]
    fn test_parse_first_number() {
        assert_eq!(parse_first_number("+1.234560E-06,+2.0E+00").unwrap(), 1.23456e-6);
        assert_eq!(parse_first_number("  -5e-9\n").unwrap(), -5e-9);
        assert_eq!(parse_first_number("I=.5").unwrap(), 0.5);
        assert_eq!(parse_first_number("3.").unwrap(), 3.0);
        assert!(matches!(
            parse_first_number("nil"),
            Err(SmuError::UnexpectedResponse(_))
        ));
        // Only the first comma field is scanned.
        assert!(parse_first_number("abc,1.0").is_err());
    }

    #[test]
    fn test_overflow_marker_is_rejected() {
        assert!(matches!(parse_current("9.91E+37"), Err(SmuError::OverrangeReading(_))));
        assert!(matches!(parse_current("1e38"), Err(SmuError::OverrangeReading(_))));
        assert!(matches!(parse_current("-9.9e37"), Err(SmuError::OverrangeReading(_))));
        assert_eq!(parse_current("9.8e37").unwrap(), 9.8e37);
    }

    #[test]
    fn test_parse_timed_sweep_reply_skips_garbage() {
        let reply = "0,1.000000000000e-09;0.5,5.000000000000e-07;bad;1,;\n";
        let parsed = parse_timed_sweep_reply(reply);
        assert_eq!(
            parsed,
            vec![Measurement::new(0.0, 1e-9), Measurement::new(0.5, 5e-7)]
        );
        assert!(parse_timed_sweep_reply("").is_empty());
    }

    #[test]
    fn test_line_reset_sequence() {
        let smu = SimulatedSmu::new(SimModel::Keithley2400);
        let mut t = smu.clone();
        LineDialect.reset_to_defaults(&mut t).unwrap();
        assert_eq!(
            smu.commands(),
            vec!["*CLS", "OUTP OFF", "SOUR:VOLT 0", "SENS:CURR:RANG:AUTO ON", "SENS:CURR:PROT 1E-6"]
        );
        assert_eq!(smu.compliance_amps(), 1e-6);
        assert!(smu.autorange());
        assert!(LineDialect.drain_errors(&mut t).unwrap().is_empty());
    }

    #[test]
    fn test_script_commands_are_channel_qualified() {
        let smu = SimulatedSmu::new(SimModel::Keithley2602);
        let mut t = smu.clone();
        let dialect = ScriptDialect::new("smua");
        dialect.enable_output(&mut t).unwrap();
        dialect.set_voltage(&mut t, 1.5).unwrap();
        dialect.set_compliance_microamps(&mut t, 100.0).unwrap();
        assert_eq!(
            smu.commands(),
            vec![
                "smua.source.output = smua.OUTPUT_ON",
                "smua.source.levelv = 1.5",
                "smua.source.limiti = 0.0001",
            ]
        );
        assert!(smu.output_enabled());
        assert_eq!(smu.source_level(), 1.5);
    }

    #[test]
    fn test_line_drain_reads_one_entry() {
        let smu = SimulatedSmu::new(SimModel::Keithley2400);
        smu.push_device_error(-222, "Data out of range");
        smu.push_device_error(-113, "Undefined header");
        let mut t = smu.clone();
        let records = LineDialect.drain_errors(&mut t).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].code, -222);
        assert_eq!(records[0].message, "Data out of range");
        assert_eq!(smu.commands(), vec!["SYST:ERR?"]);

        let records = LineDialect.drain_errors(&mut t).unwrap();
        assert_eq!(records[0].to_string(), "-113: Undefined header");
        assert!(LineDialect.drain_errors(&mut t).unwrap().is_empty());
    }

    #[test]
    fn test_script_drain_parses_fields() {
        let smu = SimulatedSmu::new(SimModel::Keithley2602);
        smu.push_device_error(5007, "Operation would exceed safe operating area");
        let mut t = smu.clone();
        let records = ScriptDialect::new("smua").drain_errors(&mut t).unwrap();
        assert_eq!(
            records,
            vec![DeviceErrorRecord {
                code: 5007,
                message: "Operation would exceed safe operating area".to_string(),
                severity: Some(2),
                node: Some(1),
            }]
        );
        assert!(ScriptDialect::new("smua").drain_errors(&mut t).unwrap().is_empty());
    }

    #[test]
    fn test_probe_identity_falls_back_to_model_query() {
        let mut t = SimulatedSmu::new(SimModel::Keithley2602).fail_identity();
        assert_eq!(probe_identity(&mut t), "KEITHLEY,2602B,TSP");

        let mut t = SimulatedSmu::new(SimModel::Keithley2400).fail_identity();
        assert_eq!(probe_identity(&mut t), "Unknown instrument");
    }

    #[test]
    fn test_timed_sweep_script_layout() {
        let script = ScriptDialect::new("smua")
            .timed_sweep_script(&[0.0, 0.5, -1.0], Duration::from_millis(5))
            .unwrap();
        assert!(script.starts_with("local pts={ 0,0.5,-1 };"));
        assert!(script.contains("delay(0.005)"));
        assert!(script.contains("string.format('%.12g,%.12e;', v, i)"));
        assert!(script.ends_with("print(out)"));
        assert!(LineDialect.timed_sweep_script(&[0.0], Duration::ZERO).is_none());
    }
}
