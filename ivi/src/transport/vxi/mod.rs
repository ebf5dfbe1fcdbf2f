/// VXI-11 instrument connections over LAN (`TCPIP` resources).
///
/// The core channel of the VXI-11 protocol is spoken directly over a blocking TCP socket.
/// The link is created on first use and dropped after socket errors, such that the next
/// operation reconnects.
use std::time::Duration;

use anyhow::anyhow;

use self::rpc::{RpcClient, XdrReader, XdrWriter};
use super::Transport;
use crate::address::{LanAddress, ResourceAddress};
use crate::locator::Backend;
use crate::{Error, TransportError};

pub mod rpc;

const DEVICE_CORE: u32 = 0x0607AF;
const DEVICE_CORE_VERSION: u32 = 1;

const CREATE_LINK: u32 = 10;
const DEVICE_WRITE: u32 = 11;
const DEVICE_READ: u32 = 12;
const DEVICE_READSTB: u32 = 13;
const DEVICE_TRIGGER: u32 = 14;
const DEVICE_CLEAR: u32 = 15;
const DEVICE_REMOTE: u32 = 16;
const DEVICE_LOCAL: u32 = 17;
const DESTROY_LINK: u32 = 23;

const FLAG_END: i32 = 0x08;

const REASON_CHR: i32 = 0x02;
const REASON_END: i32 = 0x04;

const ERR_IO_TIMEOUT: i32 = 15;

const READ_CHUNK: u32 = 0x10_0000;
const LOCK_TIMEOUT_MS: u32 = 0;
const SOCKET_TIMEOUT_MARGIN: Duration = Duration::from_secs(2);

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

fn error_message(code: i32) -> &'static str {
    match code {
        1 => "syntax error",
        3 => "device not accessible",
        4 => "invalid link identifier",
        5 => "parameter error",
        6 => "channel not established",
        8 => "operation not supported",
        9 => "out of resources",
        11 => "device locked by another link",
        12 => "no lock held by this link",
        17 => "I/O error",
        21 => "invalid address",
        23 => "abort",
        29 => "channel already established",
        _ => "unknown error",
    }
}

fn check_error(code: i32) -> crate::Result<()> {
    match code {
        0 => Ok(()),
        ERR_IO_TIMEOUT => Err(Error::timeout()),
        8 => Err(Error::NotSupported("vxi11")),
        code => Err(Error::transport(anyhow!(
            "VXI-11 error {}: {}",
            code,
            error_message(code)
        ))),
    }
}

fn millis(timeout: Duration) -> u32 {
    timeout.as_millis().min(u32::MAX as u128) as u32
}

/// An established link on the core channel.
struct CoreClient {
    rpc: RpcClient,
    lid: i32,
    max_recv_size: usize,
    io_timeout: u32,
}

impl CoreClient {
    fn connect(lan: &LanAddress, timeout: Duration) -> crate::Result<Self> {
        let port = rpc::get_port(&lan.host, DEVICE_CORE, DEVICE_CORE_VERSION, timeout)?;
        let addr = rpc::resolve(&lan.host, port)?;
        let mut rpc = RpcClient::connect(addr, DEVICE_CORE, DEVICE_CORE_VERSION, timeout + SOCKET_TIMEOUT_MARGIN)?;

        let mut args = XdrWriter::new();
        args.i32(0).bool(false).u32(LOCK_TIMEOUT_MS).string(&lan.device);
        let mut reply = rpc.call(CREATE_LINK, args.as_bytes())?;
        check_error(reply.i32()?)?;
        let lid = reply.i32()?;
        let _abort_port = reply.u32()?;
        let max_recv_size = reply.u32()? as usize;
        log::info!(
            "Created VXI-11 link {} to {} on {} (max. receive size {})",
            lid,
            lan.device,
            lan.host,
            max_recv_size
        );
        Ok(CoreClient {
            rpc,
            lid,
            // a server announcing 0 would never accept any data
            max_recv_size: max_recv_size.max(1),
            io_timeout: millis(timeout),
        })
    }

    fn device_write(&mut self, data: &[u8]) -> crate::Result<()> {
        let mut offset = 0;
        loop {
            let end = (offset + self.max_recv_size).min(data.len());
            let chunk = &data[offset..end];
            let flags = if end == data.len() { FLAG_END } else { 0 };
            let mut args = XdrWriter::new();
            args.i32(self.lid)
                .u32(self.io_timeout)
                .u32(LOCK_TIMEOUT_MS)
                .i32(flags)
                .opaque(chunk);
            let mut reply = self.rpc.call(DEVICE_WRITE, args.as_bytes())?;
            check_error(reply.i32()?)?;
            let written = reply.u32()? as usize;
            if written == 0 && !chunk.is_empty() {
                return Err(Error::transport(anyhow!("VXI-11 device accepted no data")));
            }
            offset += written.min(chunk.len());
            if offset >= data.len() {
                return Ok(());
            }
        }
    }

    fn device_read(&mut self, max_len: Option<usize>) -> crate::Result<Vec<u8>> {
        let mut ret = Vec::new();
        loop {
            let request_size = match max_len {
                Some(max_len) if ret.len() >= max_len => break,
                Some(max_len) => (max_len - ret.len()).min(READ_CHUNK as usize) as u32,
                None => READ_CHUNK,
            };
            let mut args = XdrWriter::new();
            args.i32(self.lid)
                .u32(request_size)
                .u32(self.io_timeout)
                .u32(LOCK_TIMEOUT_MS)
                .i32(0)
                .i32(0);
            let mut reply = self.rpc.call(DEVICE_READ, args.as_bytes())?;
            check_error(reply.i32()?)?;
            let reason = reply.i32()?;
            ret.extend(reply.opaque()?);
            if reason & (REASON_END | REASON_CHR) != 0 {
                break;
            }
        }
        Ok(ret)
    }

    /// Call one of the procedures taking `Device_GenericParms`.
    fn generic(&mut self, procedure: u32) -> crate::Result<XdrReader> {
        let mut args = XdrWriter::new();
        args.i32(self.lid)
            .i32(0)
            .u32(LOCK_TIMEOUT_MS)
            .u32(self.io_timeout);
        let mut reply = self.rpc.call(procedure, args.as_bytes())?;
        check_error(reply.i32()?)?;
        Ok(reply)
    }

    fn read_stb(&mut self) -> crate::Result<u8> {
        let mut reply = self.generic(DEVICE_READSTB)?;
        Ok((reply.u32()? & 0xFF) as u8)
    }

    fn destroy_link(&mut self) -> crate::Result<()> {
        let mut args = XdrWriter::new();
        args.i32(self.lid);
        let mut reply = self.rpc.call(DESTROY_LINK, args.as_bytes())?;
        check_error(reply.i32()?)
    }
}

pub struct VxiTransport {
    lan: LanAddress,
    timeout: Duration,
    client: Option<CoreClient>,
}

impl VxiTransport {
    pub fn new(lan: LanAddress) -> Self {
        Self {
            lan,
            timeout: DEFAULT_TIMEOUT,
            client: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> &LanAddress {
        &self.lan
    }

    fn with_client<T, F>(&mut self, f: F) -> crate::Result<T>
    where
        F: FnOnce(&mut CoreClient) -> crate::Result<T>,
    {
        let mut client = match self.client.take() {
            Some(client) => client,
            None => CoreClient::connect(&self.lan, self.timeout)?,
        };
        let ret = f(&mut client);
        match &ret {
            // the RPC stream may be out of sync after a socket error
            Err(Error::Transport(TransportError::Io(err))) => {
                log::debug!("Dropping VXI-11 link to {}: {}", self.lan.host, err);
            }
            _ => {
                self.client.replace(client);
            }
        }
        ret
    }
}

impl Transport for VxiTransport {
    fn name(&self) -> &'static str {
        "vxi11"
    }

    fn write_raw(&mut self, data: &[u8]) -> crate::Result<()> {
        self.with_client(|client| client.device_write(data))
    }

    fn read_raw(&mut self, max_len: Option<usize>) -> crate::Result<Vec<u8>> {
        if max_len == Some(0) {
            return Ok(Vec::new());
        }
        self.with_client(|client| client.device_read(max_len))
    }

    fn read_stb(&mut self) -> crate::Result<u8> {
        self.with_client(|client| client.read_stb())
    }

    fn trigger(&mut self) -> crate::Result<()> {
        self.with_client(|client| client.generic(DEVICE_TRIGGER).map(|_| ()))
    }

    fn clear(&mut self) -> crate::Result<()> {
        self.with_client(|client| client.generic(DEVICE_CLEAR).map(|_| ()))
    }

    fn remote(&mut self) -> crate::Result<()> {
        self.with_client(|client| client.generic(DEVICE_REMOTE).map(|_| ()))
    }

    fn local(&mut self) -> crate::Result<()> {
        self.with_client(|client| client.generic(DEVICE_LOCAL).map(|_| ()))
    }

    fn close(&mut self) -> crate::Result<()> {
        match self.client.take() {
            Some(mut client) => client.destroy_link(),
            None => Ok(()),
        }
    }
}

/// Serves `TCPIP` resources.
pub struct VxiBackend {
    timeout: Duration,
}

impl Default for VxiBackend {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl VxiBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Backend for VxiBackend {
    fn name(&self) -> &'static str {
        "vxi11"
    }

    fn open(&self, address: &ResourceAddress) -> crate::Result<Box<dyn Transport>> {
        Ok(Box::new(VxiTransport::new(address.lan()?).with_timeout(self.timeout)))
    }
}
