/// This module implements the IEEE 488.2 definite/indefinite length arbitrary block format.
///
/// A block is framed as `#<l><n...><payload>` where `l` is a single ASCII digit giving the
/// number of digits of `n` and `n` is the payload length in ASCII decimal.
/// For example `#800002000` prefixes 2000 data bytes. With `l == 0` the payload extends
/// to the end of the message, and the `\n` terminating that message is not part of it.
use crate::{Error, ProtocolError};

pub const BLOCK_MARKER: u8 = b'#';

/// Message terminator closing an indefinite length block.
pub const BLOCK_TERMINATOR: u8 = b'\n';

/// Number of length digits emitted by the encoder.
pub const LENGTH_DIGITS: usize = 8;

const MAX_ENCODED_LENGTH: usize = 99_999_999;

/// Location of a block within a received buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Index of the first payload byte.
    pub offset: usize,
    /// Declared payload length, `None` for an indefinite (`#0`) block.
    pub length: Option<usize>,
}

/// Payload of an indefinite length block, without its message terminator.
pub fn strip_block_terminator(payload: &[u8]) -> &[u8] {
    match payload.split_last() {
        Some((&BLOCK_TERMINATOR, rest)) => rest,
        _ => payload,
    }
}

pub fn encode_ieee_block(payload: &[u8]) -> crate::Result<Vec<u8>> {
    encode_ieee_block_with_prefix(&[], payload)
}

/// Frame `payload` as a block, preceded by `prefix` (typically the SCPI command header).
pub fn encode_ieee_block_with_prefix(prefix: &[u8], payload: &[u8]) -> crate::Result<Vec<u8>> {
    if payload.len() > MAX_ENCODED_LENGTH {
        return Err(Error::invalid_block(format!(
            "payload of {} bytes does not fit into {} length digits",
            payload.len(),
            LENGTH_DIGITS
        )));
    }
    let header = format!("#{}{:08}", LENGTH_DIGITS, payload.len());
    let mut ret = Vec::with_capacity(prefix.len() + header.len() + payload.len());
    ret.extend_from_slice(prefix);
    ret.extend_from_slice(header.as_bytes());
    ret.extend_from_slice(payload);
    Ok(ret)
}

pub fn parse_digit(x: u8) -> crate::Result<usize> {
    if x.is_ascii_digit() {
        Ok((x - b'0') as usize)
    } else {
        Err(Error::invalid_block(format!("expected digit count, got {:#04x}", x)))
    }
}

pub fn parse_length(digits: &[u8]) -> crate::Result<usize> {
    if digits.is_empty() || !digits.iter().all(|x| x.is_ascii_digit()) {
        return Err(Error::invalid_block(format!(
            "invalid length field `{}`",
            String::from_utf8_lossy(digits)
        )));
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|x| x.parse::<usize>().ok())
        .ok_or_else(|| Error::invalid_block("length field overflow"))
}

/// Parse the header of a block. Any data before the first `#` is skipped.
pub fn parse_block_header(rx: &[u8]) -> crate::Result<BlockHeader> {
    let begin = rx
        .iter()
        .position(|x| *x == BLOCK_MARKER)
        .ok_or_else(|| Error::invalid_block("no block marker found"))?;
    let digit = rx
        .get(begin + 1)
        .ok_or_else(|| Error::invalid_block("missing digit count"))?;
    let header_length = parse_digit(*digit)?;
    let offset = begin + 2 + header_length;
    if header_length == 0 {
        return Ok(BlockHeader { offset, length: None });
    }
    if offset > rx.len() {
        return Err(Error::invalid_block("length field truncated"));
    }
    let length = parse_length(&rx[begin + 2..offset])?;
    Ok(BlockHeader {
        offset,
        length: Some(length),
    })
}

/// Extract the payload of a block.
///
/// A buffer shorter than the declared length yields the bytes that are present.
/// Use [`decode_ieee_block_exact`] to reject truncated blocks.
pub fn decode_ieee_block(rx: &[u8]) -> crate::Result<&[u8]> {
    if rx.is_empty() {
        return Ok(rx);
    }
    let header = parse_block_header(rx)?;
    match header.length {
        None => Ok(strip_block_terminator(&rx[header.offset..])),
        Some(length) => {
            let end = (header.offset + length).min(rx.len());
            Ok(&rx[header.offset..end])
        }
    }
}

pub fn decode_ieee_block_exact(rx: &[u8]) -> crate::Result<&[u8]> {
    if rx.is_empty() {
        return Ok(rx);
    }
    let header = parse_block_header(rx)?;
    match header.length {
        None => Ok(strip_block_terminator(&rx[header.offset..])),
        Some(length) => {
            let received = rx.len() - header.offset;
            if received < length {
                return Err(Error::Protocol(ProtocolError::TruncatedBlock {
                    expected: length,
                    received,
                }));
            }
            Ok(&rx[header.offset..header.offset + length])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_uses_eight_digits() {
        let block = encode_ieee_block(b"AB").unwrap();
        assert_eq!(block, b"#800000002AB".to_vec());

        let block = encode_ieee_block(&[]).unwrap();
        assert_eq!(block, b"#800000000".to_vec());

        let payload = vec![0x55_u8; 12345];
        let block = encode_ieee_block(&payload).unwrap();
        assert!(block.starts_with(b"#800012345"));
        assert_eq!(block.len(), 10 + payload.len());
    }

    #[test]
    fn encode_with_prefix() {
        let block = encode_ieee_block_with_prefix(b":DATA:DAC VMEM,", &[1, 2, 3]).unwrap();
        assert_eq!(block, b":DATA:DAC VMEM,#800000003\x01\x02\x03".to_vec());
    }

    #[test]
    fn decode_inverts_encode() {
        let payloads: [&[u8]; 4] = [b"", b"DATA", b"#8#8\n\r\x00", &[0xff; 300]];
        for payload in payloads.iter() {
            let block = encode_ieee_block(payload).unwrap();
            assert_eq!(decode_ieee_block(&block).unwrap(), *payload);
            assert_eq!(decode_ieee_block_exact(&block).unwrap(), *payload);
        }
    }

    #[test]
    fn decode_empty() {
        assert_eq!(decode_ieee_block(b"").unwrap(), b"");
        assert_eq!(decode_ieee_block_exact(b"").unwrap(), b"");
    }

    #[test]
    fn decode_skips_preamble() {
        let rx = b":CURVE #3004\x01\x02\x03\x04\n";
        assert_eq!(decode_ieee_block(rx).unwrap(), &[1, 2, 3, 4]);
        let header = parse_block_header(rx).unwrap();
        assert_eq!(header.offset, 12);
        assert_eq!(header.length, Some(4));
    }

    #[test]
    fn decode_indefinite_block() {
        let rx = b"#0abc\n";
        assert_eq!(decode_ieee_block(rx).unwrap(), b"abc");
        assert_eq!(decode_ieee_block_exact(rx).unwrap(), b"abc");
        // only the final terminator belongs to the message
        assert_eq!(decode_ieee_block(b"#0a\nb\n\n").unwrap(), b"a\nb\n");
        assert_eq!(decode_ieee_block(b"#0abc").unwrap(), b"abc");
        assert_eq!(parse_block_header(rx).unwrap().length, None);
    }

    #[test]
    fn truncated_block() {
        let rx = b"#800000010ABC";
        assert_eq!(decode_ieee_block(rx).unwrap(), b"ABC");
        let err = decode_ieee_block_exact(rx).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::TruncatedBlock {
                expected: 10,
                received: 3
            })
        ));
    }

    #[test]
    fn invalid_headers() {
        assert!(decode_ieee_block(b"no marker").is_err());
        assert!(decode_ieee_block(b"#").is_err());
        assert!(decode_ieee_block(b"#x123").is_err());
        assert!(decode_ieee_block(b"#41a34DATA").is_err());
        assert!(decode_ieee_block(b"#41").is_err());
    }
}
