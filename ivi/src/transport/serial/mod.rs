use std::io::Write;
use std::time::Duration;

use anyhow::anyhow;
use serialport::SerialPort;

use super::{read_stream, Transport, TERMINATION};

pub mod params;
pub use params::SerialParams;

#[cfg(target_os = "linux")]
mod linux_low_latency;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

fn map_serial_error(err: serialport::Error) -> crate::Error {
    match err.kind {
        serialport::ErrorKind::Io(kind) => crate::Error::transport(std::io::Error::new(kind, err.description)),
        serialport::ErrorKind::NoDevice => crate::Error::configuration(anyhow!(err.description)),
        _ => crate::Error::transport(anyhow!(err.description)),
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn open_builder(path: &str, builder: serialport::SerialPortBuilder) -> crate::Result<Box<dyn SerialPort>> {
            let port = builder.open_native().map_err(map_serial_error)?;
            if let Err(x) = linux_low_latency::apply_low_latency(&port) {
                log::debug!("Cannot set ASYNC_LOW_LATENCY on {}: {}", path, x);
            }
            Ok(Box::new(port))
        }
    } else {
        fn open_builder(_path: &str, builder: serialport::SerialPortBuilder) -> crate::Result<Box<dyn SerialPort>> {
            builder.open().map_err(map_serial_error)
        }
    }
}

/// Open a serial port with the given line settings.
pub fn open_port(path: &str, params: &SerialParams, timeout: Duration) -> crate::Result<Box<dyn SerialPort>> {
    log::debug!("Opening {} with {}", path, params);
    let builder = serialport::new(path, params.baud)
        .parity(params.parity.into())
        .stop_bits(params.stop_bits.into())
        .data_bits(params.data_bits.into())
        .timeout(timeout);
    open_builder(path, builder)
}

/// Plain serial line with `\n` message termination (`ASRL` resources).
///
/// Writes not ending with the termination character get one appended.
pub struct SerialTransport {
    path: String,
    params: SerialParams,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new<T: Into<String>>(path: T, params: SerialParams) -> Self {
        Self {
            path: path.into(),
            params,
            timeout: DEFAULT_TIMEOUT,
            port: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn params(&self) -> &SerialParams {
        &self.params
    }

    fn with_port<T, F>(&mut self, f: F) -> crate::Result<T>
    where
        F: FnOnce(&mut dyn SerialPort) -> crate::Result<T>,
    {
        let mut port = match self.port.take() {
            Some(port) => port,
            None => open_port(&self.path, &self.params, self.timeout)?,
        };
        let ret = f(port.as_mut());
        match &ret {
            Ok(_) | Err(crate::Error::Protocol(_)) => {
                self.port.replace(port);
            }
            Err(err) => {
                log::debug!("Closing {} after error: {}", self.path, err);
            }
        }
        ret
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn write_raw(&mut self, data: &[u8]) -> crate::Result<()> {
        self.with_port(|port| {
            port.write_all(data).map_err(crate::Error::from)?;
            if data.last() != Some(&TERMINATION) {
                port.write_all(&[TERMINATION]).map_err(crate::Error::from)?;
            }
            port.flush().map_err(crate::Error::from)
        })
    }

    fn read_raw(&mut self, max_len: Option<usize>) -> crate::Result<Vec<u8>> {
        self.with_port(|port| read_stream(port, max_len))
    }

    fn close(&mut self) -> crate::Result<()> {
        self.port.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct_without_io() {
        let mut t = SerialTransport::new("/dev/does-not-exist", SerialParams::default());
        assert_eq!(t.path(), "/dev/does-not-exist");
        assert_eq!(t.params().baud, 9600);
        assert!(t.close().is_ok());
        assert!(t.write_raw(b"*IDN?\n").is_err());
    }
}
