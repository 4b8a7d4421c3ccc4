//! Serial transport seam.
//!
//! The connection manager and the worker loops talk to the hardware through
//! the `Transport` trait so the probe/handshake logic and the full engine
//! can be driven by an in-memory double in tests. The production
//! implementation wraps the `serialport` crate.

use std::io;
use std::time::Duration;

use log::debug;
use serialport::{ClearBuffer, FlowControl, SerialPort};

use crate::error::{Result, SynthError};

/// A bidirectional byte link with timeout-bounded reads.
pub trait Transport: Send {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
    /// Read up to `buf.len()` bytes. A timeout is reported as `Ok(0)`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn baud_rate(&self) -> u32;
    fn set_baud_rate(&mut self, baud: u32) -> io::Result<()>;
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;
    fn clear_input(&mut self) -> io::Result<()>;
    fn clear_output(&mut self) -> io::Result<()>;
    /// Independent handle to the same port, so the read loop never blocks a
    /// writer behind its 100 ms reads.
    fn try_clone(&self) -> io::Result<Box<dyn Transport>>;
}

/// Opens transports and enumerates candidate ports.
pub trait PortOpener: Send + Sync {
    fn open(&self, port: &str, baud: u32, timeout: Duration) -> Result<Box<dyn Transport>>;
    fn available_ports(&self) -> Vec<String>;
}

fn serial_err_to_io(err: serialport::Error) -> io::Error {
    io::Error::other(err.to_string())
}

/// `serialport`-backed transport.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    baud: u32,
}

impl Transport for SerialTransport {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn set_baud_rate(&mut self, baud: u32) -> io::Result<()> {
        self.port.set_baud_rate(baud).map_err(serial_err_to_io)?;
        self.baud = baud;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(serial_err_to_io)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(serial_err_to_io)
    }

    fn clear_output(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Output).map_err(serial_err_to_io)
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        let port = self.port.try_clone().map_err(serial_err_to_io)?;
        Ok(Box::new(SerialTransport {
            port,
            baud: self.baud,
        }))
    }
}

/// Opens real serial ports.
pub struct SerialOpener;

impl PortOpener for SerialOpener {
    fn open(&self, port: &str, baud: u32, timeout: Duration) -> Result<Box<dyn Transport>> {
        let mut handle = serialport::new(port, baud)
            .timeout(timeout)
            .flow_control(FlowControl::None)
            .open()?;
        // Apollo drives RTS as a direction line for two-way comms and expects
        // DTR asserted like most older serial peripherals.
        if let Err(e) = handle.write_data_terminal_ready(true) {
            debug!("Could not assert DTR on {port}: {e}");
        }
        if let Err(e) = handle.write_request_to_send(true) {
            debug!("Could not assert RTS on {port}: {e}");
        }
        if let Err(e) = handle.clear(ClearBuffer::All) {
            debug!("Could not clear buffers on {port}: {e}");
        }
        Ok(Box::new(SerialTransport { port: handle, baud }))
    }

    fn available_ports(&self) -> Vec<String> {
        match serialport::available_ports() {
            Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
            Err(e) => {
                debug!("Serial port enumeration failed: {e}");
                Vec::new()
            }
        }
    }
}

/// Whether an open failure looks like the port being temporarily held by
/// another process (worth retrying within a bounded connect deadline).
pub fn is_port_busy_error(err: &SynthError) -> bool {
    let text = err.to_string();
    text.contains("denied")
        || text.contains("Denied")
        || text.contains("busy")
        || text.contains("errno 13")
        || text.contains("in use")
}
