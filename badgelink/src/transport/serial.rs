use std::io::{self, Write};
use std::time::Duration;

use log::info;
use serialport::{ClearBuffer, SerialPort};

use super::{Transport, read_some};
use crate::error::ProtocolError;

/// UART link, as used by the FPGA loader
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    timeout: Duration,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, ProtocolError> {
        let timeout = crate::DEFAULT_READ_TIMEOUT;
        let port = serialport::new(path, baud_rate).timeout(timeout).open()?;
        info!("Opened {path} at {baud_rate} baud");
        Ok(SerialTransport { port, timeout })
    }

    pub fn name(&self) -> Option<String> {
        self.port.name()
    }

    /// Drop anything queued in either direction
    pub fn clear(&self) -> Result<(), ProtocolError> {
        Ok(self.port.clear(ClearBuffer::All)?)
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.port.write(data)?;
        self.port.flush()?;
        Ok(n)
    }

    fn read(
        &mut self,
        max_len: usize,
        timeout: Duration,
    ) -> io::Result<Vec<u8>> {
        if timeout != self.timeout {
            self.port.set_timeout(timeout)?;
            self.timeout = timeout;
        }
        read_some(&mut self.port, max_len)
    }
}
