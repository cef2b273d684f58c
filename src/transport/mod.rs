//! Byte-stream transports and the resource connector.
//!
//! A [`Transport`] is a strictly synchronous request/response channel: the
//! session never writes a second command before the previous reply has been
//! read. Resources are named with VISA-style identifiers:
//!
//! - `GPIB0::24::INSTR`, `USB0::...::INSTR` (VISA, feature `visa`)
//! - `ASRL3::INSTR`, `ASRL/dev/ttyUSB0::INSTR` (serial, feature `serial`)
//! - `TCPIP0::192.168.0.20::5025::SOCKET` (raw socket)
//! - `SIM::2602::INSTR`, `SIM::2400::INSTR` (in-process simulator)

use crate::error::TransportError;
use log::{debug, info, warn};
use regex::Regex;
use std::io::{BufRead, BufReader, Read, Write};
use std::sync::LazyLock;
use std::time::Duration;

#[cfg(feature = "serial")]
pub mod serial;
pub mod sim;
pub mod tcp;
#[cfg(feature = "visa")]
pub mod visa;

pub use sim::{SimModel, SimulatedBench, SimulatedSmu};
pub use tcp::TcpTransport;

/// Response timeout applied right after a resource is opened.
pub const BASELINE_TIMEOUT: Duration = Duration::from_millis(5000);

static GPIB_RESOURCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^GPIB(\d+)::(\d+)::INSTR$").expect("valid GPIB pattern")
});

/// Line terminators used on both directions of a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Terminators {
    pub write: String,
    pub read: u8,
}

impl Default for Terminators {
    fn default() -> Self {
        Self {
            write: "\n".to_string(),
            read: b'\n',
        }
    }
}

pub trait Transport: Send {
    /// Name the resource was opened under.
    fn resource_name(&self) -> &str;

    fn write_line(&mut self, command: &str) -> Result<(), TransportError>;

    fn read_line(&mut self) -> Result<String, TransportError>;

    fn query(&mut self, command: &str) -> Result<String, TransportError> {
        self.write_line(command)?;
        self.read_line()
    }

    fn timeout(&self) -> Duration;

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError>;

    fn set_terminators(&mut self, terminators: Terminators);

    fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens named resources. Owns any library handle the backends need.
pub trait ResourceManager: Send {
    fn open(&mut self, resource: &str) -> Result<Box<dyn Transport>, TransportError>;

    fn list_resources(&mut self) -> Result<Vec<String>, TransportError>;

    /// Release library handles. Called once the session is closed.
    fn close(&mut self) {}
}

/// The other adapter index for `GPIB0`/`GPIB1` resources.
pub fn gpib_sibling(resource: &str) -> Option<String> {
    let caps = GPIB_RESOURCE.captures(resource)?;
    let bus = match &caps[1] {
        "0" => 1,
        "1" => 0,
        _ => return None,
    };
    Some(format!("GPIB{bus}::{}::INSTR", &caps[2]))
}

/// Open `resource`, retrying the sibling GPIB bus index once when the
/// adapter reports the address as not present.
///
/// Any other error aborts immediately without trying alternates.
pub fn open_resource(
    manager: &mut dyn ResourceManager,
    resource: &str,
) -> Result<Box<dyn Transport>, TransportError> {
    let mut candidates = vec![resource.to_string()];
    candidates.extend(gpib_sibling(resource));

    let mut tried = Vec::new();
    let mut last_error = None;
    for candidate in &candidates {
        debug!("Opening resource {candidate}");
        match manager.open(candidate) {
            Ok(transport) => {
                if !tried.is_empty() {
                    info!("Opened {candidate} after {} was not present", tried.join(", "));
                }
                return Ok(transport);
            }
            Err(e) if e.is_not_present() => {
                warn!("Resource {candidate} not present: {e}");
                tried.push(candidate.clone());
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(TransportError::Exhausted {
        tried: tried.join(", "),
        last_error: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "Unknown error".to_string()),
    })
}

/// Dispatches on the resource prefix to the compiled-in backends.
pub struct DefaultResourceManager {
    serial_baud: u32,
    list_simulated: bool,
    #[cfg(feature = "visa")]
    visa: Option<visa::VisaLibrary>,
}

impl DefaultResourceManager {
    pub fn new() -> Self {
        Self {
            serial_baud: 9600,
            list_simulated: false,
            #[cfg(feature = "visa")]
            visa: None,
        }
    }

    pub fn with_serial_baud(mut self, baud: u32) -> Self {
        self.serial_baud = baud;
        self
    }

    /// Include the simulator resources in [`ResourceManager::list_resources`].
    pub fn with_simulated(mut self, list_simulated: bool) -> Self {
        self.list_simulated = list_simulated;
        self
    }

    #[cfg(feature = "visa")]
    fn visa(&mut self) -> Result<&mut visa::VisaLibrary, TransportError> {
        if self.visa.is_none() {
            self.visa = Some(visa::VisaLibrary::new()?);
            info!("VISA resource manager initialized");
        }
        self.visa.as_mut().ok_or(TransportError::Closed)
    }
}

impl Default for DefaultResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceManager for DefaultResourceManager {
    fn open(&mut self, resource: &str) -> Result<Box<dyn Transport>, TransportError> {
        let upper = resource.to_ascii_uppercase();
        if upper.starts_with("SIM::") {
            return Ok(Box::new(SimulatedSmu::from_resource(resource)?));
        }
        if upper.starts_with("TCPIP") && upper.ends_with("::SOCKET") {
            return Ok(Box::new(TcpTransport::open(resource, BASELINE_TIMEOUT)?));
        }
        if upper.starts_with("ASRL") {
            #[cfg(feature = "serial")]
            {
                return Ok(Box::new(serial::SerialTransport::open(
                    resource,
                    self.serial_baud,
                    BASELINE_TIMEOUT,
                )?));
            }
            #[cfg(not(feature = "serial"))]
            {
                let _ = self.serial_baud;
                return Err(TransportError::Unsupported(format!(
                    "{resource} (serial support not compiled, rebuild with --features serial)"
                )));
            }
        }

        #[cfg(feature = "visa")]
        {
            let transport = self.visa()?.open(resource, BASELINE_TIMEOUT)?;
            Ok(Box::new(transport))
        }
        #[cfg(not(feature = "visa"))]
        {
            Err(TransportError::Unsupported(format!(
                "{resource} (VISA support not compiled, rebuild with --features visa)"
            )))
        }
    }

    fn list_resources(&mut self) -> Result<Vec<String>, TransportError> {
        #[allow(unused_mut)]
        let mut resources: Vec<String> = Vec::new();

        #[cfg(feature = "visa")]
        resources.extend(self.visa()?.list()?);

        #[cfg(feature = "serial")]
        resources.extend(serial::list_ports()?);

        if self.list_simulated {
            resources.extend(SimModel::ALL.iter().map(|m| m.resource_name()));
        }
        info!("Detected {} resources", resources.len());
        Ok(resources)
    }

    fn close(&mut self) {
        #[cfg(feature = "visa")]
        {
            if self.visa.take().is_some() {
                debug!("VISA resource manager released");
            }
        }
    }
}

/// Terminated line framing over any blocking byte stream.
pub(crate) struct LineStream<S: Read + Write> {
    reader: BufReader<S>,
    terminators: Terminators,
}

impl<S: Read + Write> LineStream<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            reader: BufReader::new(stream),
            terminators: Terminators::default(),
        }
    }

    pub(crate) fn get_ref(&self) -> &S {
        self.reader.get_ref()
    }

    pub(crate) fn get_mut(&mut self) -> &mut S {
        self.reader.get_mut()
    }

    pub(crate) fn set_terminators(&mut self, terminators: Terminators) {
        self.terminators = terminators;
    }

    pub(crate) fn write_line(&mut self, command: &str) -> std::io::Result<()> {
        let stream = self.reader.get_mut();
        stream.write_all(command.as_bytes())?;
        stream.write_all(self.terminators.write.as_bytes())?;
        stream.flush()
    }

    pub(crate) fn read_line(&mut self) -> std::io::Result<String> {
        let mut buf = Vec::new();
        let n = self.reader.read_until(self.terminators.read, &mut buf)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed by instrument",
            ));
        }
        if buf.last() == Some(&self.terminators.read) {
            buf.pop();
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Map an I/O failure on an open stream into the transport taxonomy.
pub(crate) fn io_error(e: std::io::Error, timeout: Duration, context: &str) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            TransportError::Timeout(timeout.as_millis())
        }
        _ => TransportError::Io {
            source: e,
            context: context.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_gpib_sibling() {
        assert_eq!(gpib_sibling("GPIB0::24::INSTR").as_deref(), Some("GPIB1::24::INSTR"));
        assert_eq!(gpib_sibling("gpib1::5::instr").as_deref(), Some("GPIB0::5::INSTR"));
        assert_eq!(gpib_sibling("GPIB2::24::INSTR"), None);
        assert_eq!(gpib_sibling("ASRL3::INSTR"), None);
        assert_eq!(gpib_sibling("GPIB0::24"), None);
    }

    #[test]
    fn test_fallback_tries_sibling_bus() {
        let bench = SimulatedBench::new();
        bench.insert("GPIB1::24::INSTR", SimulatedSmu::new(SimModel::Keithley2602));
        let mut manager = bench.clone();

        let transport = open_resource(&mut manager, "GPIB0::24::INSTR").unwrap();
        assert_eq!(transport.resource_name(), "GPIB1::24::INSTR");
        assert_eq!(bench.open_attempts(), vec!["GPIB0::24::INSTR", "GPIB1::24::INSTR"]);
    }

    #[test]
    fn test_fallback_reports_every_attempt() {
        let mut bench = SimulatedBench::new();
        let err = open_resource(&mut bench, "GPIB1::7::INSTR").err().unwrap();
        let message = err.to_string();
        assert!(message.contains("GPIB1::7::INSTR, GPIB0::7::INSTR"), "{message}");
        assert!(message.contains("not present"), "{message}");
    }

    #[test]
    fn test_other_errors_abort_without_fallback() {
        let bench = SimulatedBench::new();
        bench.deny("GPIB0::24::INSTR", "resource locked by another session");
        bench.insert("GPIB1::24::INSTR", SimulatedSmu::new(SimModel::Keithley2400));
        let mut manager = bench.clone();

        let err = open_resource(&mut manager, "GPIB0::24::INSTR").err().unwrap();
        assert!(matches!(err, TransportError::Open { .. }));
        assert_eq!(bench.open_attempts(), vec!["GPIB0::24::INSTR"]);
    }

    #[test]
    fn test_non_gpib_resource_has_no_alternate() {
        let bench = SimulatedBench::new();
        let mut manager = bench.clone();
        assert!(open_resource(&mut manager, "USB0::0x05E6::0x2602::1::INSTR").is_err());
        assert_eq!(bench.open_attempts().len(), 1);
    }

    #[test]
    fn test_line_stream_strips_terminators() {
        let mut stream = LineStream::new(Cursor::new(b"+1.000E-06\r\nnext\n".to_vec()));
        assert_eq!(stream.read_line().unwrap(), "+1.000E-06");
        assert_eq!(stream.read_line().unwrap(), "next");
        assert!(stream.read_line().is_err());
    }

    #[test]
    fn test_default_manager_rejects_uncompiled_backends() {
        let mut manager = DefaultResourceManager::new();
        #[cfg(not(feature = "visa"))]
        assert!(matches!(
            manager.open("GPIB0::24::INSTR"),
            Err(TransportError::Unsupported(_))
        ));
        assert!(manager.open("SIM::2602::INSTR").is_ok());
    }
}
