//! Instrument sessions for IVI style drivers.
//!
//! A [`Session`] binds a driver to an instrument through a [`Transport`] selected from
//! the resource address, and offers the string, raw and IEEE block I/O per-model drivers
//! are built on. With simulation enabled, no I/O is performed at all.

#[macro_use]
extern crate dlopen_derive;
#[macro_use]
extern crate lazy_static;

pub mod address;
pub mod cache;
pub mod driver;
pub mod lock;
pub mod locator;
pub mod options;
pub mod session;
pub mod trace;
pub mod transport;

pub use ivi_protocol::block::{
    decode_ieee_block, decode_ieee_block_exact, encode_ieee_block, encode_ieee_block_with_prefix,
};
pub use ivi_protocol::scpi;
pub use ivi_protocol::{Error, ProtocolError, TransportError};

pub use crate::address::{ResourceAddress, ResourceKind};
pub use crate::cache::{cache_tag, AttributeCache};
pub use crate::driver::{Driver, IdentityInfo, OperationState};
pub use crate::lock::SessionLock;
pub use crate::locator::{Backend, GenericBackend, Locator, Resource};
pub use crate::options::SessionOptions;
pub use crate::session::Session;
pub use crate::trace::{get_index, Selector, TraceY, TraceYT};
pub use crate::transport::{Encoding, LoopbackTransport, Transport};

pub type Result<T> = std::result::Result<T, Error>;
