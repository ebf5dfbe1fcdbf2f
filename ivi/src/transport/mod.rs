/// This module defines the capability set every instrument connection exposes
/// and hosts the concrete backends.
use std::io::Read;

use anyhow::anyhow;

use crate::Error;

pub mod loopback;
pub mod prologix;
pub mod serial;
pub mod usbtmc;
pub mod visa;
pub mod vxi;

pub use loopback::{Capability, LoopbackTransport};

pub(crate) const TERMINATION: u8 = b'\n';

/// Character encoding used for string I/O.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Ascii,
    Latin1,
}

impl Default for Encoding {
    fn default() -> Self {
        Encoding::Utf8
    }
}

impl Encoding {
    pub fn encode(&self, msg: &str) -> crate::Result<Vec<u8>> {
        match self {
            Encoding::Utf8 => Ok(msg.as_bytes().to_vec()),
            Encoding::Ascii => {
                if !msg.is_ascii() {
                    return Err(Error::protocol(anyhow!("`{}` is not ASCII", msg)));
                }
                Ok(msg.as_bytes().to_vec())
            }
            Encoding::Latin1 => msg
                .chars()
                .map(|c| {
                    let c = c as u32;
                    if c > 0xFF {
                        Err(Error::protocol(anyhow!("`{}` is not Latin-1", msg)))
                    } else {
                        Ok(c as u8)
                    }
                })
                .collect(),
        }
    }

    pub fn decode(&self, data: &[u8]) -> crate::Result<String> {
        match self {
            Encoding::Utf8 => String::from_utf8(data.to_vec())
                .map_err(|_| Error::protocol(anyhow!("Reply is not valid UTF-8"))),
            Encoding::Ascii => {
                if !data.is_ascii() {
                    return Err(Error::protocol(anyhow!("Reply is not ASCII")));
                }
                Ok(data.iter().map(|x| *x as char).collect())
            }
            Encoding::Latin1 => Ok(data.iter().map(|x| *x as char).collect()),
        }
    }
}

/// The capability set of a connection to an instrument.
///
/// Only `write_raw` and `read_raw` are required. The optional capabilities return
/// `Error::NotSupported` by default, in which case the session emulates them with
/// IEEE 488.2 common commands where such an emulation exists.
pub trait Transport: Send {
    /// Short backend name, used in log output.
    fn name(&self) -> &'static str {
        "custom"
    }

    fn write_raw(&mut self, data: &[u8]) -> crate::Result<()>;

    /// Read up to `max_len` bytes. `None` reads a complete message, i.e. until the
    /// transport's termination character or end-of-message indicator.
    fn read_raw(&mut self, max_len: Option<usize>) -> crate::Result<Vec<u8>>;

    fn ask_raw(&mut self, _data: &[u8], _max_len: Option<usize>) -> crate::Result<Vec<u8>> {
        Err(Error::NotSupported("ask_raw"))
    }

    fn read_str(&mut self, _max_len: Option<usize>, _encoding: Encoding) -> crate::Result<String> {
        Err(Error::NotSupported("read"))
    }

    fn read_stb(&mut self) -> crate::Result<u8> {
        Err(Error::NotSupported("read_stb"))
    }

    fn trigger(&mut self) -> crate::Result<()> {
        Err(Error::NotSupported("trigger"))
    }

    fn clear(&mut self) -> crate::Result<()> {
        Err(Error::NotSupported("clear"))
    }

    fn remote(&mut self) -> crate::Result<()> {
        Err(Error::NotSupported("remote"))
    }

    fn local(&mut self) -> crate::Result<()> {
        Err(Error::NotSupported("local"))
    }

    fn close(&mut self) -> crate::Result<()> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn write_raw(&mut self, data: &[u8]) -> crate::Result<()> {
        (**self).write_raw(data)
    }

    fn read_raw(&mut self, max_len: Option<usize>) -> crate::Result<Vec<u8>> {
        (**self).read_raw(max_len)
    }

    fn ask_raw(&mut self, data: &[u8], max_len: Option<usize>) -> crate::Result<Vec<u8>> {
        (**self).ask_raw(data, max_len)
    }

    fn read_str(&mut self, max_len: Option<usize>, encoding: Encoding) -> crate::Result<String> {
        (**self).read_str(max_len, encoding)
    }

    fn read_stb(&mut self) -> crate::Result<u8> {
        (**self).read_stb()
    }

    fn trigger(&mut self) -> crate::Result<()> {
        (**self).trigger()
    }

    fn clear(&mut self) -> crate::Result<()> {
        (**self).clear()
    }

    fn remote(&mut self) -> crate::Result<()> {
        (**self).remote()
    }

    fn local(&mut self) -> crate::Result<()> {
        (**self).local()
    }

    fn close(&mut self) -> crate::Result<()> {
        (**self).close()
    }
}

/// Read from a byte stream either until `max_len` bytes have arrived or, if no
/// length is given, up to and including the termination character.
pub(crate) fn read_stream<T: Read + ?Sized>(
    stream: &mut T,
    max_len: Option<usize>,
) -> crate::Result<Vec<u8>> {
    let mut ret = Vec::new();
    let mut x = [0_u8; 1];
    loop {
        if let Some(max_len) = max_len {
            if ret.len() >= max_len {
                break;
            }
        }
        let n = stream.read(&mut x).map_err(Error::from)?;
        if n == 0 {
            break;
        }
        ret.push(x[0]);
        if max_len.is_none() && x[0] == TERMINATION {
            break;
        }
    }
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn encodings() {
        assert_eq!(Encoding::Utf8.encode("µs").unwrap(), "µs".as_bytes().to_vec());
        assert_eq!(Encoding::Latin1.encode("µs").unwrap(), vec![0xB5, b's']);
        assert!(Encoding::Ascii.encode("µs").is_err());
        assert!(Encoding::Latin1.encode("€").is_err());

        assert_eq!(Encoding::Latin1.decode(&[0xB5, b's']).unwrap(), "µs");
        assert!(Encoding::Utf8.decode(&[0xB5]).is_err());
        assert!(Encoding::Ascii.decode(&[0xB5]).is_err());
        assert_eq!(Encoding::Ascii.decode(b"*IDN?").unwrap(), "*IDN?");
    }

    #[test]
    fn stream_reads() {
        let mut rx = Cursor::new(b"1.0\n2.0\n".to_vec());
        assert_eq!(read_stream(&mut rx, None).unwrap(), b"1.0\n".to_vec());
        assert_eq!(read_stream(&mut rx, Some(2)).unwrap(), b"2.".to_vec());
        assert_eq!(read_stream(&mut rx, None).unwrap(), b"0\n".to_vec());
        assert_eq!(read_stream(&mut rx, None).unwrap(), Vec::<u8>::new());
    }
}
