use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use crate::error::ControlError;

/// Line-oriented byte link to the relay controller
pub trait Transport: Send {
    fn write_line(&mut self, line: &str) -> Result<(), ControlError>;

    /// Next complete line without its terminator. `Ok(None)` when nothing
    /// arrived within the transport's read timeout.
    fn read_line(&mut self) -> Result<Option<String>, ControlError>;

    fn port_name(&self) -> &str;
}

/// Opens transports by port name. The serial implementation talks to real
/// ports; the simulated one hands out connections to an in-memory controller.
pub trait Connector: Send + Sync {
    fn candidates(&self) -> Vec<super::discovery::PortCandidate>;

    fn open(&self, port: &str) -> Result<Box<dyn Transport>, ControlError>;
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    name: String,
    pending: Vec<u8>,
}

impl SerialTransport {
    pub fn open(path: &str, baud: u32, read_timeout: Duration) -> Result<Self, ControlError> {
        let port = serialport::new(path, baud)
            .timeout(read_timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;
        log::debug!("Opened serial port {} at {} baud", path, baud);
        Ok(Self {
            port,
            name: path.to_string(),
            pending: Vec::new(),
        })
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }
}

impl Transport for SerialTransport {
    fn write_line(&mut self, line: &str) -> Result<(), ControlError> {
        self.port.write_all(format!("{}\n", line).as_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<String>, ControlError> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }
        let mut buf = [0u8; 256];
        match self.port.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(n) => {
                self.pending.extend_from_slice(&buf[..n]);
                Ok(self.take_line())
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn port_name(&self) -> &str {
        &self.name
    }
}

/// Connector over the operating system's serial ports
pub struct SerialConnector {
    pub baud: u32,
    pub read_timeout: Duration,
}

impl Connector for SerialConnector {
    fn candidates(&self) -> Vec<super::discovery::PortCandidate> {
        match serialport::available_ports() {
            Ok(ports) => ports
                .into_iter()
                .map(super::discovery::PortCandidate::from)
                .collect(),
            Err(e) => {
                log::warn!("Could not enumerate serial ports: {}", e);
                Vec::new()
            }
        }
    }

    fn open(&self, port: &str) -> Result<Box<dyn Transport>, ControlError> {
        Ok(Box::new(SerialTransport::open(port, self.baud, self.read_timeout)?))
    }
}
