pub mod block;
pub mod error;
pub mod scpi;

pub use crate::block::{
    decode_ieee_block, decode_ieee_block_exact, encode_ieee_block, encode_ieee_block_with_prefix,
    parse_block_header, strip_block_terminator, BlockHeader,
};
pub use crate::error::{Error, ProtocolError, TransportError};

pub type Result<T> = std::result::Result<T, Error>;
