//! VISA backend for GPIB/USB/LXI resources via the `visa-rs` bindings.

use super::{io_error, LineStream, Terminators, Transport};
use crate::error::TransportError;
use log::debug;
use std::ffi::CString;
use std::time::Duration;
use visa_rs::prelude::*;

/// Status text VISA uses for an address with nothing behind it.
const NOT_PRESENT_MARKERS: [&str; 3] = [
    "RsrcNfound",
    "BFFF0011",
    "Insufficient location information",
];

pub struct VisaLibrary {
    rm: DefaultRM,
}

fn classify(resource: &str, e: impl std::fmt::Debug) -> TransportError {
    let message = format!("{e:?}");
    if NOT_PRESENT_MARKERS.iter().any(|m| message.contains(m)) {
        TransportError::NotPresent {
            resource: resource.to_string(),
            message,
        }
    } else {
        TransportError::Open {
            resource: resource.to_string(),
            message,
        }
    }
}

fn visa_name(resource: &str) -> Result<VisaString, TransportError> {
    let c_string = CString::new(resource)
        .map_err(|_| TransportError::Unsupported(resource.to_string()))?;
    Ok(VisaString::from(c_string))
}

impl VisaLibrary {
    pub fn new() -> Result<Self, TransportError> {
        let rm = DefaultRM::new().map_err(|e| classify("VISA resource manager", e))?;
        Ok(Self { rm })
    }

    pub fn open(&mut self, resource: &str, timeout: Duration) -> Result<VisaTransport, TransportError> {
        let name = visa_name(resource)?;
        let instr = self
            .rm
            .open(&name, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
            .map_err(|e| classify(resource, e))?;
        debug!("VISA session opened for {resource}");

        let mut transport = VisaTransport {
            stream: LineStream::new(instr),
            resource: resource.to_string(),
            timeout,
        };
        transport.set_timeout(timeout)?;
        Ok(transport)
    }

    pub fn list(&mut self) -> Result<Vec<String>, TransportError> {
        let expr = visa_name("?*INSTR")?;
        let mut list = self
            .rm
            .find_res_list(&expr)
            .map_err(|e| classify("?*INSTR", e))?;
        let mut resources = Vec::new();
        while let Some(res) = list.find_next().map_err(|e| classify("?*INSTR", e))? {
            resources.push(res.to_string());
        }
        Ok(resources)
    }
}

pub struct VisaTransport {
    stream: LineStream<Instrument>,
    resource: String,
    timeout: Duration,
}

impl Transport for VisaTransport {
    fn resource_name(&self) -> &str {
        &self.resource
    }

    fn write_line(&mut self, command: &str) -> Result<(), TransportError> {
        self.stream
            .write_line(command)
            .map_err(|e| io_error(e, self.timeout, "VISA write"))
    }

    fn read_line(&mut self) -> Result<String, TransportError> {
        self.stream
            .read_line()
            .map_err(|e| io_error(e, self.timeout, "VISA read"))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let attr = attribute::AttrTmoValue::new_checked(millis)
            .ok_or_else(|| TransportError::Unsupported(format!("timeout {millis} ms")))?;
        self.stream
            .get_ref()
            .set_attr(attr)
            .map_err(|e| classify(&self.resource, e))?;
        self.timeout = timeout;
        Ok(())
    }

    fn set_terminators(&mut self, terminators: Terminators) {
        self.stream.set_terminators(terminators);
    }

    fn close(&mut self) -> Result<(), TransportError> {
        debug!("VISA session for {} released", self.resource);
        Ok(())
    }
}
