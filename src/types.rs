use serde::{Deserialize, Serialize};

use crate::dialect::DialectKind;

/// One sourced-voltage / measured-current pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub voltage: f64,
    pub current: f64,
}

impl Measurement {
    pub fn new(voltage: f64, current: f64) -> Self {
        Self { voltage, current }
    }
}

/// What the instrument reported about itself on connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentIdentity {
    pub raw: String,
    pub dialect: DialectKind,
    pub channel: String,
}

impl InstrumentIdentity {
    pub fn from_raw(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let dialect = DialectKind::from_identity(&raw);
        Self {
            raw,
            dialect,
            channel: dialect.channel().to_string(),
        }
    }

    /// Vendor tokens accepted as a supported SMU.
    pub fn is_recognized(&self) -> bool {
        let upper = self.raw.to_uppercase();
        upper.contains("KEITHLEY") || upper.contains("TEKTRONIX")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_derives_dialect_and_channel() {
        let id = InstrumentIdentity::from_raw("Keithley Instruments Inc., Model 2602B, 4096, 3.2.2");
        assert_eq!(id.dialect, DialectKind::Script);
        assert_eq!(id.channel, "smua");
        assert!(id.is_recognized());

        let id = InstrumentIdentity::from_raw("KEITHLEY INSTRUMENTS INC.,MODEL 2400,1,C30");
        assert_eq!(id.dialect, DialectKind::Line);
        assert!(id.is_recognized());
    }

    #[test]
    fn test_unknown_vendor_is_rejected() {
        assert!(!InstrumentIdentity::from_raw("Unknown instrument").is_recognized());
        assert!(InstrumentIdentity::from_raw("TEKTRONIX,MSO,0,1").is_recognized());
    }
}
