use super::{io_error, LineStream, Terminators, Transport};
use crate::error::TransportError;
use log::debug;
use serialport::SerialPort;
use std::time::Duration;

/// RS-232 transport for `ASRL<n>::INSTR` / `ASRL<path>::INSTR` resources.
pub struct SerialTransport {
    port: LineStream<Box<dyn SerialPort>>,
    resource: String,
    timeout: Duration,
}

/// Map a VISA serial resource onto an OS port name.
///
/// `ASRL3::INSTR` is `COM3` on Windows and `/dev/ttyS2` elsewhere; any
/// non-numeric body is taken as a literal path.
pub fn port_name(resource: &str) -> Option<String> {
    let upper = resource.to_ascii_uppercase();
    if !upper.starts_with("ASRL") {
        return None;
    }
    let body = &resource[4..];
    let body = body
        .strip_suffix("::INSTR")
        .or_else(|| body.strip_suffix("::instr"))
        .unwrap_or(body);
    if body.is_empty() {
        return None;
    }
    match body.parse::<u32>() {
        Ok(n) if cfg!(windows) => Some(format!("COM{n}")),
        Ok(n) => Some(format!("/dev/ttyS{}", n.saturating_sub(1))),
        Err(_) => Some(body.to_string()),
    }
}

impl SerialTransport {
    pub fn open(resource: &str, baud_rate: u32, timeout: Duration) -> Result<Self, TransportError> {
        let name = port_name(resource)
            .ok_or_else(|| TransportError::Unsupported(resource.to_string()))?;

        let port = serialport::new(&name, baud_rate)
            .timeout(timeout)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => TransportError::NotPresent {
                    resource: resource.to_string(),
                    message: e.to_string(),
                },
                _ => TransportError::Open {
                    resource: resource.to_string(),
                    message: e.to_string(),
                },
            })?;

        debug!("Serial port '{name}' opened at {baud_rate} baud");

        Ok(Self {
            port: LineStream::new(port),
            resource: resource.to_string(),
            timeout,
        })
    }
}

impl Transport for SerialTransport {
    fn resource_name(&self) -> &str {
        &self.resource
    }

    fn write_line(&mut self, command: &str) -> Result<(), TransportError> {
        self.port
            .write_line(command)
            .map_err(|e| io_error(e, self.timeout, "writing to serial port"))
    }

    fn read_line(&mut self) -> Result<String, TransportError> {
        self.port
            .read_line()
            .map_err(|e| io_error(e, self.timeout, "reading from serial port"))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.port
            .get_mut()
            .set_timeout(timeout)
            .map_err(|e| TransportError::Open {
                resource: self.resource.clone(),
                message: e.to_string(),
            })?;
        self.timeout = timeout;
        Ok(())
    }

    fn set_terminators(&mut self, terminators: Terminators) {
        self.port.set_terminators(terminators);
    }

    fn close(&mut self) -> Result<(), TransportError> {
        debug!("Serial port for {} released", self.resource);
        Ok(())
    }
}

/// Serial ports visible to the OS, as `ASRL<path>::INSTR` resources.
pub fn list_ports() -> Result<Vec<String>, TransportError> {
    let ports = serialport::available_ports().map_err(|e| TransportError::Open {
        resource: "ASRL".to_string(),
        message: e.to_string(),
    })?;
    Ok(ports
        .into_iter()
        .map(|p| format!("ASRL{}::INSTR", p.port_name))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_name() {
        assert_eq!(port_name("ASRL/dev/ttyUSB0::INSTR").as_deref(), Some("/dev/ttyUSB0"));
        if cfg!(windows) {
            assert_eq!(port_name("ASRL3::INSTR").as_deref(), Some("COM3"));
        } else {
            assert_eq!(port_name("ASRL3::INSTR").as_deref(), Some("/dev/ttyS2"));
        }
        assert_eq!(port_name("ASRL::INSTR"), None);
        assert_eq!(port_name("GPIB0::1::INSTR"), None);
    }
}
