/// A minimal blocking ONC RPC client (RFC 5531) over TCP, with the subset of XDR
/// (RFC 4506) required by VXI-11.
use std::io::{Cursor, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use anyhow::anyhow;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use crate::Error;

const RPC_VERSION: u32 = 2;
const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
const REPLY_ACCEPTED: u32 = 0;
const ACCEPT_SUCCESS: u32 = 0;
const AUTH_NULL: u32 = 0;
const LAST_FRAGMENT: u32 = 0x8000_0000;
const MAX_FRAGMENT: usize = 0x7FFF_FFFF;

const PORTMAPPER_PORT: u16 = 111;
const PORTMAPPER_PROG: u32 = 100_000;
const PORTMAPPER_VERSION: u32 = 2;
const PORTMAPPER_GETPORT: u32 = 3;
const IPPROTO_TCP: u32 = 6;

fn truncated() -> Error {
    Error::protocol(anyhow!("Truncated RPC reply"))
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

#[derive(Default)]
pub struct XdrWriter {
    buf: Vec<u8>,
}

impl XdrWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u32(&mut self, x: u32) -> &mut Self {
        let mut tmp = [0_u8; 4];
        BigEndian::write_u32(&mut tmp, x);
        self.buf.extend_from_slice(&tmp);
        self
    }

    pub fn i32(&mut self, x: i32) -> &mut Self {
        let mut tmp = [0_u8; 4];
        BigEndian::write_i32(&mut tmp, x);
        self.buf.extend_from_slice(&tmp);
        self
    }

    pub fn bool(&mut self, x: bool) -> &mut Self {
        self.u32(x as u32)
    }

    pub fn opaque(&mut self, data: &[u8]) -> &mut Self {
        self.u32(data.len() as u32);
        self.buf.extend_from_slice(data);
        self.buf.extend(std::iter::repeat(0).take(padding(data.len())));
        self
    }

    pub fn string(&mut self, x: &str) -> &mut Self {
        self.opaque(x.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

pub struct XdrReader {
    cursor: Cursor<Vec<u8>>,
}

impl XdrReader {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    pub fn u32(&mut self) -> crate::Result<u32> {
        self.cursor.read_u32::<BigEndian>().map_err(|_| truncated())
    }

    pub fn i32(&mut self) -> crate::Result<i32> {
        self.cursor.read_i32::<BigEndian>().map_err(|_| truncated())
    }

    pub fn opaque(&mut self) -> crate::Result<Vec<u8>> {
        let len = self.u32()? as usize;
        let remaining = self.cursor.get_ref().len() - self.cursor.position() as usize;
        if len > remaining {
            return Err(truncated());
        }
        let mut ret = vec![0_u8; len];
        self.cursor.read_exact(&mut ret).map_err(|_| truncated())?;
        let pos = self.cursor.position() + padding(len) as u64;
        self.cursor.set_position(pos);
        Ok(ret)
    }
}

/// Send `data` as a single record using TCP record marking.
pub fn write_record<T: Write>(stream: &mut T, data: &[u8]) -> crate::Result<()> {
    if data.len() > MAX_FRAGMENT {
        return Err(Error::protocol(anyhow!("RPC message too large")));
    }
    let mut header = [0_u8; 4];
    BigEndian::write_u32(&mut header, LAST_FRAGMENT | data.len() as u32);
    let mut msg = Vec::with_capacity(data.len() + 4);
    msg.extend_from_slice(&header);
    msg.extend_from_slice(data);
    stream.write_all(&msg).map_err(Error::transport)?;
    stream.flush().map_err(Error::transport)
}

/// Receive a complete record, concatenating all fragments.
pub fn read_record<T: Read>(stream: &mut T) -> crate::Result<Vec<u8>> {
    let mut ret = Vec::new();
    loop {
        let header = stream.read_u32::<BigEndian>().map_err(Error::transport)?;
        let len = (header & !LAST_FRAGMENT) as usize;
        let start = ret.len();
        ret.resize(start + len, 0);
        stream.read_exact(&mut ret[start..]).map_err(Error::transport)?;
        if header & LAST_FRAGMENT != 0 {
            return Ok(ret);
        }
    }
}

pub struct RpcClient {
    stream: TcpStream,
    prog: u32,
    vers: u32,
    xid: u32,
}

pub fn resolve(host: &str, port: u16) -> crate::Result<SocketAddr> {
    let mut addrs = (host, port).to_socket_addrs().map_err(Error::transport)?;
    addrs
        .next()
        .ok_or_else(|| Error::configuration(anyhow!("Cannot resolve host `{}`", host)))
}

impl RpcClient {
    pub fn connect(addr: SocketAddr, prog: u32, vers: u32, timeout: Duration) -> crate::Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(Error::transport)?;
        stream.set_nodelay(true).map_err(Error::transport)?;
        let ret = RpcClient {
            stream,
            prog,
            vers,
            xid: 0,
        };
        ret.set_timeout(timeout)?;
        Ok(ret)
    }

    pub fn set_timeout(&self, timeout: Duration) -> crate::Result<()> {
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(Error::transport)?;
        self.stream
            .set_write_timeout(Some(timeout))
            .map_err(Error::transport)
    }

    /// Perform a call and return a reader positioned at the procedure results.
    pub fn call(&mut self, procedure: u32, args: &[u8]) -> crate::Result<XdrReader> {
        self.xid = self.xid.wrapping_add(1);
        let mut msg = XdrWriter::new();
        msg.u32(self.xid)
            .u32(MSG_CALL)
            .u32(RPC_VERSION)
            .u32(self.prog)
            .u32(self.vers)
            .u32(procedure)
            .u32(AUTH_NULL)
            .u32(0)
            .u32(AUTH_NULL)
            .u32(0);
        let mut data = msg.as_bytes().to_vec();
        data.extend_from_slice(args);
        write_record(&mut self.stream, &data)?;

        let mut reply = XdrReader::new(read_record(&mut self.stream)?);
        let xid = reply.u32()?;
        if xid != self.xid {
            return Err(Error::protocol(anyhow!(
                "RPC reply for transaction {} while waiting for {}",
                xid,
                self.xid
            )));
        }
        if reply.u32()? != MSG_REPLY {
            return Err(Error::protocol(anyhow!("Expected RPC reply message")));
        }
        if reply.u32()? != REPLY_ACCEPTED {
            return Err(Error::protocol(anyhow!("RPC call denied")));
        }
        // verifier
        reply.u32()?;
        reply.opaque()?;
        let accept_stat = reply.u32()?;
        if accept_stat != ACCEPT_SUCCESS {
            return Err(Error::protocol(anyhow!(
                "RPC call not accepted (status {})",
                accept_stat
            )));
        }
        Ok(reply)
    }
}

/// Ask the portmapper on `host` for the TCP port of the given program.
pub fn get_port(host: &str, prog: u32, vers: u32, timeout: Duration) -> crate::Result<u16> {
    let addr = resolve(host, PORTMAPPER_PORT)?;
    let mut client = RpcClient::connect(addr, PORTMAPPER_PROG, PORTMAPPER_VERSION, timeout)?;
    let mut args = XdrWriter::new();
    args.u32(prog).u32(vers).u32(IPPROTO_TCP).u32(0);
    let mut reply = client.call(PORTMAPPER_GETPORT, args.as_bytes())?;
    let port = reply.u32()?;
    if port == 0 || port > u16::MAX as u32 {
        return Err(Error::configuration(anyhow!(
            "Program {:#x} is not registered on {}",
            prog,
            host
        )));
    }
    Ok(port as u16)
}
