use super::{io_error, LineStream, Terminators, Transport};
use crate::error::TransportError;
use log::{debug, warn};
use regex::Regex;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::LazyLock;
use std::time::Duration;

static SOCKET_RESOURCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^TCPIP\d*::([^:]+)::(\d+)::SOCKET$").expect("valid socket pattern")
});

/// Raw-socket transport for LAN instruments (`TCPIP0::<host>::<port>::SOCKET`).
pub struct TcpTransport {
    stream: LineStream<TcpStream>,
    resource: String,
    timeout: Duration,
}

impl TcpTransport {
    /// Split a socket resource name into `host:port`.
    pub fn parse_resource(resource: &str) -> Option<(String, u16)> {
        let caps = SOCKET_RESOURCE.captures(resource)?;
        let port = caps[2].parse().ok()?;
        Some((caps[1].to_string(), port))
    }

    pub fn open(resource: &str, timeout: Duration) -> Result<Self, TransportError> {
        let (host, port) = Self::parse_resource(resource)
            .ok_or_else(|| TransportError::Unsupported(resource.to_string()))?;

        let socket_addr: SocketAddr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Open {
                resource: resource.to_string(),
                message: e.to_string(),
            })?
            .next()
            .ok_or_else(|| TransportError::NotPresent {
                resource: resource.to_string(),
                message: format!("{host} did not resolve"),
            })?;

        debug!("Connecting to {socket_addr}");

        let stream = TcpStream::connect_timeout(&socket_addr, timeout).map_err(|e| {
            warn!("Failed to connect to {socket_addr}: {e}");
            match e.kind() {
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::ConnectionRefused => {
                    TransportError::NotPresent {
                        resource: resource.to_string(),
                        message: e.to_string(),
                    }
                }
                _ => TransportError::Open {
                    resource: resource.to_string(),
                    message: e.to_string(),
                },
            }
        })?;

        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream: LineStream::new(stream),
            resource: resource.to_string(),
            timeout,
        })
    }
}

impl Transport for TcpTransport {
    fn resource_name(&self) -> &str {
        &self.resource
    }

    fn write_line(&mut self, command: &str) -> Result<(), TransportError> {
        self.stream
            .write_line(command)
            .map_err(|e| io_error(e, self.timeout, "writing command"))
    }

    fn read_line(&mut self) -> Result<String, TransportError> {
        self.stream
            .read_line()
            .map_err(|e| io_error(e, self.timeout, "reading response"))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        let socket = self.stream.get_ref();
        socket.set_read_timeout(Some(timeout))?;
        socket.set_write_timeout(Some(timeout))?;
        self.timeout = timeout;
        Ok(())
    }

    fn set_terminators(&mut self, terminators: Terminators) {
        self.stream.set_terminators(terminators);
    }

    fn close(&mut self) -> Result<(), TransportError> {
        match self.stream.get_mut().shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(io_error(e, self.timeout, "closing socket")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_parse_resource() {
        assert_eq!(
            TcpTransport::parse_resource("TCPIP0::192.168.0.20::5025::SOCKET"),
            Some(("192.168.0.20".to_string(), 5025))
        );
        assert_eq!(
            TcpTransport::parse_resource("tcpip::localhost::23::socket"),
            Some(("localhost".to_string(), 23))
        );
        assert_eq!(TcpTransport::parse_resource("TCPIP0::10.0.0.1::INSTR"), None);
    }

    #[test]
    fn test_query_round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(socket.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, "*IDN?\n");
            let mut socket = socket;
            socket
                .write_all(b"KEITHLEY INSTRUMENTS INC.,MODEL 2400,1,C30\r\n")
                .unwrap();
        });

        let resource = format!("TCPIP0::127.0.0.1::{port}::SOCKET");
        let mut transport = TcpTransport::open(&resource, Duration::from_secs(2)).unwrap();
        let reply = transport.query("*IDN?").unwrap();
        assert_eq!(reply, "KEITHLEY INSTRUMENTS INC.,MODEL 2400,1,C30");
        transport.close().unwrap();
        server.join().unwrap();
    }
}
