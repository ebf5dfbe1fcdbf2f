/// This module drives GPIB instruments through a Prologix GPIB-USB adapter.
/// http://prologix.biz/gpib-usb-controller.html
///
/// The adapter shows up as a serial port. Lines starting with `++` are adapter commands,
/// everything else is forwarded to the currently addressed instrument.
/// Each session opens the port itself, so an adapter cannot be shared by two sessions at once.
use std::io::Write;
use std::time::Duration;

use anyhow::anyhow;
use serialport::{ClearBuffer, SerialPort};

use super::serial::{open_port, SerialParams};
use super::{read_stream, Transport, TERMINATION};
use crate::address::{GpibAddress, ResourceAddress, ResourceKind};
use crate::locator::Backend;
use crate::Error;

const ESCAPE: u8 = 0x1B;
const SECONDARY_ADDRESS_OFFSET: u8 = 96;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Escape the bytes the adapter would otherwise interpret.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut ret = Vec::with_capacity(data.len() + 1);
    for x in data {
        if matches!(*x, b'\n' | b'\r' | ESCAPE | b'+') {
            ret.push(ESCAPE);
        }
        ret.push(*x);
    }
    ret
}

fn address_command(address: &GpibAddress) -> String {
    match address.secondary {
        Some(secondary) => format!(
            "++addr {} {}\n",
            address.primary,
            secondary + SECONDARY_ADDRESS_OFFSET
        ),
        None => format!("++addr {}\n", address.primary),
    }
}

fn command(port: &mut dyn SerialPort, cmd: &str) -> crate::Result<()> {
    port.write_all(cmd.as_bytes()).map_err(Error::from)?;
    port.flush().map_err(Error::from)
}

fn init_prologix(port: &mut dyn SerialPort) -> crate::Result<()> {
    log::debug!("Initializing prologix adapter.");
    command(port, "++savecfg 0\n")?;
    command(port, "++auto 0\n")?;
    // termination characters are appended manually
    command(port, "++eos 3\n")
}

pub struct PrologixTransport {
    path: String,
    address: GpibAddress,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
    read_pending: bool,
}

impl PrologixTransport {
    pub fn new<T: Into<String>>(path: T, address: GpibAddress) -> Self {
        Self {
            path: path.into(),
            address,
            timeout: DEFAULT_TIMEOUT,
            port: None,
            read_pending: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> &GpibAddress {
        &self.address
    }

    fn with_port<T, F>(&mut self, f: F) -> crate::Result<T>
    where
        F: FnOnce(&mut dyn SerialPort, &GpibAddress) -> crate::Result<T>,
    {
        let mut port = match self.port.take() {
            Some(port) => port,
            None => {
                let mut port = open_port(&self.path, &SerialParams::default(), self.timeout)?;
                init_prologix(port.as_mut())?;
                port
            }
        };
        let ret = f(port.as_mut(), &self.address);
        match &ret {
            Ok(_) | Err(Error::Protocol(_)) => {
                self.port.replace(port);
            }
            Err(err) => {
                log::debug!("Closing prologix adapter {} after error: {}", self.path, err);
                self.read_pending = false;
            }
        }
        ret
    }

    /// Discard stale input and address the instrument before issuing `cmd`.
    fn addressed(&mut self, cmd: &'static str) -> crate::Result<()> {
        self.read_pending = false;
        self.with_port(|port, address| {
            port.clear(ClearBuffer::Input)
                .map_err(|x| Error::transport(anyhow!(x.description)))?;
            command(port, &address_command(address))?;
            command(port, cmd)
        })
    }
}

impl Transport for PrologixTransport {
    fn name(&self) -> &'static str {
        "prologix"
    }

    fn write_raw(&mut self, data: &[u8]) -> crate::Result<()> {
        let mut msg = escape(data);
        msg.push(TERMINATION);
        self.addressed("")?;
        self.with_port(|port, _| {
            port.write_all(&msg).map_err(Error::from)?;
            port.flush().map_err(Error::from)
        })
    }

    fn read_raw(&mut self, max_len: Option<usize>) -> crate::Result<Vec<u8>> {
        if !self.read_pending {
            self.addressed("++read eoi\n")?;
        }
        let ret = self.with_port(|port, _| read_stream(port, max_len))?;
        self.read_pending = max_len.is_some();
        Ok(ret)
    }

    fn read_stb(&mut self) -> crate::Result<u8> {
        self.addressed("++spoll\n")?;
        let reply = self.with_port(|port, _| read_stream(port, None))?;
        let reply = String::from_utf8_lossy(&reply);
        reply
            .trim()
            .parse::<u8>()
            .map_err(|_| Error::unexpected_response(reply.trim()))
    }

    fn trigger(&mut self) -> crate::Result<()> {
        self.addressed("++trg\n")
    }

    fn clear(&mut self) -> crate::Result<()> {
        self.addressed("++clr\n")
    }

    fn local(&mut self) -> crate::Result<()> {
        self.addressed("++loc\n")
    }

    fn close(&mut self) -> crate::Result<()> {
        self.read_pending = false;
        self.port.take();
        Ok(())
    }
}

/// Serves `GPIB` resources through an adapter attached to `path`.
pub struct PrologixBackend {
    path: String,
    timeout: Duration,
}

impl PrologixBackend {
    pub fn new<T: Into<String>>(path: T) -> Self {
        Self {
            path: path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Backend for PrologixBackend {
    fn name(&self) -> &'static str {
        "prologix"
    }

    fn open(&self, address: &ResourceAddress) -> crate::Result<Box<dyn Transport>> {
        if address.kind() != ResourceKind::Gpib {
            return Err(Error::configuration(anyhow!(
                "Prologix adapters only serve GPIB resources, not `{}`",
                address
            )));
        }
        let transport = PrologixTransport::new(self.path.clone(), address.gpib()?).with_timeout(self.timeout);
        Ok(Box::new(transport))
    }
}
