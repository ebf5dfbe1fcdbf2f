/// The instrument session: lifecycle, simulation gating and the I/O helpers per-model
/// drivers build their commands on.
use std::convert::TryFrom;
use std::sync::Arc;

use anyhow::anyhow;
use ivi_protocol::block::{
    encode_ieee_block_with_prefix, parse_digit, parse_length, strip_block_terminator, BLOCK_MARKER,
};
use ivi_protocol::scpi::{self, Idn};
use ivi_protocol::ProtocolError;

use crate::cache::AttributeCache;
use crate::driver::{IdentityInfo, OperationState, SIMULATED_IDENTITY};
use crate::lock::{SessionLock, SessionLockGuard};
use crate::locator::{Locator, Resource};
use crate::options::SessionOptions;
use crate::transport::{Encoding, Transport};
use crate::Error;

/// Upper bound for the buffer reserved from a block's declared length.
const BLOCK_PREALLOCATION: usize = 64 * 1024;

lazy_static! {
    static ref DEFAULT_LOCATOR: Arc<Locator> = Arc::new(Locator::with_default_backends());
}

/// The locator used by sessions which were not given one explicitly.
pub fn default_locator() -> Arc<Locator> {
    DEFAULT_LOCATOR.clone()
}

fn strip_termination(x: String) -> String {
    let len = x.trim_end_matches(|c| c == '\r' || c == '\n').len();
    let mut x = x;
    x.truncate(len);
    x
}

pub struct Session {
    locator: Arc<Locator>,
    transport: Option<Box<dyn Transport>>,
    initialized: bool,
    cache: AttributeCache,
    operation: OperationState,
    identity: IdentityInfo,
    lock: Arc<SessionLock>,
    encoding: Encoding,
}

impl Session {
    /// Create an uninitialized session using the default backends.
    pub fn new(options: SessionOptions) -> Self {
        Self::with_locator(default_locator(), options)
    }

    pub fn with_locator(locator: Arc<Locator>, options: SessionOptions) -> Self {
        Session {
            locator,
            transport: None,
            initialized: false,
            cache: AttributeCache::new(options.cache),
            operation: OperationState::new(options),
            identity: IdentityInfo::default(),
            lock: Arc::new(SessionLock::new()),
            encoding: Encoding::default(),
        }
    }

    /// Create and initialize a session without identity query or reset.
    pub fn open<R: Into<Resource>>(resource: R, options: SessionOptions) -> crate::Result<Self> {
        let mut ret = Self::new(options);
        ret.initialize(Some(resource.into()), false, false)?;
        Ok(ret)
    }

    /// Bind the session to `resource`. No I/O happens unless `id_query` or `reset` is set.
    /// In simulation, the resource is ignored.
    pub fn initialize(&mut self, resource: Option<Resource>, id_query: bool, reset: bool) -> crate::Result<()> {
        if self.initialized {
            return Err(Error::AlreadyInitialized);
        }
        let descriptor = resource
            .as_ref()
            .and_then(|x| x.address())
            .unwrap_or_default()
            .to_string();
        if self.simulate() {
            log::debug!("Simulating, ignoring resource `{}`", descriptor);
        } else {
            let resource = resource.ok_or_else(|| Error::configuration(anyhow!("No resource specified")))?;
            let transport = self
                .locator
                .locate(resource, self.operation.prefer_generic_backend())?;
            log::debug!("Bound `{}` to {} transport", descriptor, transport.name());
            self.transport = Some(transport);
        }
        self.operation.set_io_resource_descriptor(descriptor);
        self.invalidate_all_attributes();
        self.initialized = true;

        let ret = self.post_initialize(id_query, reset);
        if ret.is_err() {
            self.close();
        }
        ret
    }

    fn post_initialize(&mut self, id_query: bool, reset: bool) -> crate::Result<()> {
        if id_query && !self.simulate() {
            self.identify()?;
            let model = self.identity.instrument_model.clone();
            if !self.identity.supports_model(&model) {
                return Err(Error::configuration(anyhow!(
                    "Instrument model `{}` is not supported",
                    model
                )));
            }
        }
        if reset {
            self.reset()?;
        }
        Ok(())
    }

    /// Release the transport. Errors while closing it are logged and suppressed.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(err) = transport.close() {
                log::warn!("Error closing {} transport: {}", transport.name(), err);
            }
        }
        self.initialized = false;
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    pub fn simulate(&self) -> bool {
        self.operation.simulate()
    }

    pub fn set_simulate(&mut self, value: bool) -> crate::Result<()> {
        self.operation.set_simulate(value)
    }

    pub fn set_option(&mut self, key: &str, value: &str) -> crate::Result<()> {
        self.operation.set_option(key, value)
    }

    pub fn operation(&self) -> &OperationState {
        &self.operation
    }

    pub fn operation_mut(&mut self) -> &mut OperationState {
        &mut self.operation
    }

    pub fn identity(&self) -> &IdentityInfo {
        &self.identity
    }

    pub fn identity_mut(&mut self) -> &mut IdentityInfo {
        &mut self.identity
    }

    pub fn resource_descriptor(&self) -> &str {
        self.operation.io_resource_descriptor()
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn set_encoding(&mut self, encoding: Encoding) {
        self.encoding = encoding;
    }

    /// The attribute cache, enabled according to the `cache` option.
    pub fn cache(&mut self) -> &mut AttributeCache {
        self.cache.set_enabled(self.operation.cache());
        &mut self.cache
    }

    pub fn is_cache_valid(&mut self, tag: &str, index: Option<usize>) -> bool {
        self.cache().is_valid(tag, index)
    }

    pub fn mark_cache_valid(&mut self, valid: bool, tag: &str, index: Option<usize>) {
        self.cache.mark_valid(valid, tag, index);
    }

    pub fn invalidate_all_attributes(&mut self) {
        self.cache.invalidate_all();
    }

    /// Handle to the advisory lock, for sharing with other threads.
    pub fn lock_handle(&self) -> Arc<SessionLock> {
        self.lock.clone()
    }

    pub fn lock_object(&self) {
        self.lock.lock();
    }

    pub fn unlock_object(&self) -> crate::Result<()> {
        self.lock.unlock()
    }

    pub fn lock_guard(&self) -> SessionLockGuard<'_> {
        self.lock.guard()
    }

    fn io(&mut self) -> crate::Result<&mut dyn Transport> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        match self.transport.as_mut() {
            Some(transport) => Ok(transport.as_mut()),
            None => Err(Error::NotInitialized),
        }
    }

    pub fn write_raw(&mut self, data: &[u8]) -> crate::Result<()> {
        if self.simulate() {
            log::debug!("[simulating] Write raw ({} bytes)", data.len());
            return Ok(());
        }
        self.io()?.write_raw(data)
    }

    pub fn read_raw(&mut self, max_len: Option<usize>) -> crate::Result<Vec<u8>> {
        if self.simulate() {
            log::debug!("[simulating] Read raw");
            return Ok(Vec::new());
        }
        self.io()?.read_raw(max_len)
    }

    pub fn ask_raw(&mut self, data: &[u8], max_len: Option<usize>) -> crate::Result<Vec<u8>> {
        if self.simulate() {
            log::debug!("[simulating] Ask raw ({} bytes)", data.len());
            return Ok(Vec::new());
        }
        let transport = self.io()?;
        match transport.ask_raw(data, max_len) {
            Err(Error::NotSupported(_)) => {}
            ret => return ret,
        }
        transport.write_raw(data)?;
        transport.read_raw(max_len)
    }

    pub fn write(&mut self, msg: &str) -> crate::Result<()> {
        self.write_with(msg, self.encoding)
    }

    pub fn write_with(&mut self, msg: &str, encoding: Encoding) -> crate::Result<()> {
        if self.simulate() {
            log::debug!("[simulating] Write ({:?}) '{}'", encoding, msg);
            return Ok(());
        }
        let data = encoding.encode(msg)?;
        self.io()?.write_raw(&data)
    }

    /// Write each message in order. The first failure aborts the remaining messages.
    pub fn write_many<I, S>(&mut self, msgs: I) -> crate::Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for msg in msgs {
            self.write(msg.as_ref())?;
        }
        Ok(())
    }

    pub fn read(&mut self, max_len: Option<usize>) -> crate::Result<String> {
        self.read_with(max_len, self.encoding)
    }

    /// Read a reply with trailing CR/LF removed.
    pub fn read_with(&mut self, max_len: Option<usize>, encoding: Encoding) -> crate::Result<String> {
        if self.simulate() {
            log::debug!("[simulating] Read ({:?})", encoding);
            return Ok(String::new());
        }
        let transport = self.io()?;
        match transport.read_str(max_len, encoding) {
            Err(Error::NotSupported(_)) => {}
            ret => return ret,
        }
        let data = transport.read_raw(max_len)?;
        Ok(strip_termination(encoding.decode(&data)?))
    }

    pub fn ask(&mut self, msg: &str) -> crate::Result<String> {
        self.ask_with(msg, None, self.encoding)
    }

    pub fn ask_with(&mut self, msg: &str, max_len: Option<usize>, encoding: Encoding) -> crate::Result<String> {
        if self.simulate() {
            log::debug!("[simulating] Ask ({:?}) '{}'", encoding, msg);
            return Ok(String::new());
        }
        let data = encoding.encode(msg)?;
        let transport = self.io()?;
        match transport.ask_raw(&data, max_len) {
            Ok(reply) => return Ok(strip_termination(encoding.decode(&reply)?)),
            Err(Error::NotSupported(_)) => {}
            Err(err) => return Err(err),
        }
        transport.write_raw(&data)?;
        self.read_with(max_len, encoding)
    }

    /// Ask each query in order and collect the replies positionally.
    pub fn ask_many<I, S>(&mut self, msgs: I) -> crate::Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        msgs.into_iter().map(|msg| self.ask(msg.as_ref())).collect()
    }

    /// Ask for a delimited list of numbers.
    pub fn ask_for_values(&mut self, msg: &str, delim: char) -> crate::Result<Vec<f64>> {
        let reply = self.ask(msg)?;
        scpi::parse_values(&reply, delim)
    }

    pub fn read_stb(&mut self) -> crate::Result<u8> {
        if self.simulate() {
            log::debug!("[simulating] Read status byte");
            return Ok(0);
        }
        match self.io()?.read_stb() {
            Err(Error::NotSupported(_)) => {}
            ret => return ret,
        }
        let reply = self.ask(scpi::READ_STATUS_BYTE)?;
        let stb = scpi::parse_int(&reply)?;
        u8::try_from(stb).map_err(|_| Error::unexpected_response(reply))
    }

    pub fn trigger(&mut self) -> crate::Result<()> {
        if self.simulate() {
            log::debug!("[simulating] Trigger");
            return Ok(());
        }
        let ret = self.io()?.trigger();
        match ret {
            Err(Error::NotSupported(_)) => self.write(scpi::TRIGGER),
            ret => ret,
        }
    }

    pub fn clear(&mut self) -> crate::Result<()> {
        if self.simulate() {
            log::debug!("[simulating] Clear");
            return Ok(());
        }
        let ret = self.io()?.clear();
        match ret {
            Err(Error::NotSupported(_)) => self.write(scpi::CLEAR_STATUS),
            ret => ret,
        }
    }

    pub fn remote(&mut self) -> crate::Result<()> {
        if self.simulate() {
            log::debug!("[simulating] Remote");
            return Ok(());
        }
        self.io()?.remote()
    }

    pub fn local(&mut self) -> crate::Result<()> {
        if self.simulate() {
            log::debug!("[simulating] Local");
            return Ok(());
        }
        self.io()?.local()
    }

    /// Read an IEEE 488.2 block from the instrument, skipping anything before the `#`.
    pub fn read_ieee_block(&mut self) -> crate::Result<Vec<u8>> {
        if self.simulate() {
            log::debug!("[simulating] Read IEEE block");
            return Ok(Vec::new());
        }
        let lenient = self.operation.lenient_blocks();
        let transport = self.io()?;

        loop {
            let x = transport.read_raw(Some(1))?;
            match x.first() {
                None => return Ok(Vec::new()),
                Some(&BLOCK_MARKER) => break,
                Some(_) => {}
            }
        }

        let digit = transport.read_raw(Some(1))?;
        let digits = match digit.first() {
            Some(x) => parse_digit(*x)?,
            None => return Err(Error::invalid_block("Missing length digit")),
        };
        if digits == 0 {
            let ret = transport.read_raw(None)?;
            return Ok(strip_block_terminator(&ret).to_vec());
        }

        let mut length = Vec::with_capacity(digits);
        while length.len() < digits {
            let x = transport.read_raw(Some(digits - length.len()))?;
            if x.is_empty() {
                return Err(Error::invalid_block("Truncated length field"));
            }
            length.extend(x);
        }
        let expected = parse_length(&length)?;

        let mut ret = Vec::with_capacity(expected.min(BLOCK_PREALLOCATION));
        while ret.len() < expected {
            match transport.read_raw(Some(expected - ret.len())) {
                Ok(x) if x.is_empty() => break,
                Ok(x) => ret.extend(x),
                Err(err) if lenient && err.is_timeout() => break,
                Err(err) => return Err(err),
            }
        }
        if ret.len() < expected {
            if !lenient {
                return Err(Error::Protocol(ProtocolError::TruncatedBlock {
                    expected,
                    received: ret.len(),
                }));
            }
            log::warn!("IEEE block truncated: expected {} bytes, received {}", expected, ret.len());
        }
        Ok(ret)
    }

    pub fn ask_for_ieee_block(&mut self, msg: &str) -> crate::Result<Vec<u8>> {
        self.write(msg)?;
        self.read_ieee_block()
    }

    /// Write `data` as IEEE block, preceded by `prefix`, e.g. `:WAV:DATA `.
    pub fn write_ieee_block(&mut self, data: &[u8], prefix: &str) -> crate::Result<()> {
        let prefix = self.encoding.encode(prefix)?;
        let block = encode_ieee_block_with_prefix(&prefix, data)?;
        self.write_raw(&block)
    }

    /// Query `*IDN?` and store the result in the identity.
    pub fn identify(&mut self) -> crate::Result<Idn> {
        if self.simulate() {
            let idn = Idn {
                manufacturer: SIMULATED_IDENTITY.to_string(),
                model: SIMULATED_IDENTITY.to_string(),
                serial: SIMULATED_IDENTITY.to_string(),
                firmware: SIMULATED_IDENTITY.to_string(),
            };
            self.identity.update_from_idn(&idn);
            return Ok(idn);
        }
        let reply = self.ask(scpi::IDENTIFY)?;
        let idn = Idn::parse(&reply)?;
        self.identity.update_from_idn(&idn);
        Ok(idn)
    }

    /// Send `*RST` and forget all cached attributes.
    pub fn reset(&mut self) -> crate::Result<()> {
        self.write(scpi::RESET)?;
        self.invalidate_all_attributes();
        Ok(())
    }

    pub fn reset_with_defaults(&mut self) -> crate::Result<()> {
        self.reset()
    }

    pub fn self_test(&mut self) -> crate::Result<(i32, String)> {
        if self.simulate() {
            return Ok((0, "Self test passed".to_string()));
        }
        let reply = self.ask(scpi::SELF_TEST)?;
        let code = scpi::parse_int(&reply)?;
        let code = i32::try_from(code).map_err(|_| Error::unexpected_response(reply))?;
        let message = if code == 0 {
            "Self test passed"
        } else {
            "Self test failed"
        };
        Ok((code, message.to_string()))
    }

    /// Pop one entry off the instrument error queue.
    pub fn error_query(&mut self) -> crate::Result<(i32, String)> {
        if self.simulate() {
            return Ok((0, "No error".to_string()));
        }
        let reply = self.ask(scpi::ERROR_QUERY)?;
        scpi::parse_error_entry(&reply)
    }

    pub fn disable(&mut self) -> crate::Result<()> {
        Ok(())
    }

    /// Fails with `InstrumentStatus` if the instrument reports an error and the
    /// `query_instr_status` option is enabled.
    pub fn check_instrument_status(&mut self) -> crate::Result<()> {
        if !self.operation.query_instr_status() || self.simulate() {
            return Ok(());
        }
        let (code, message) = self.error_query()?;
        if code != 0 {
            return Err(Error::InstrumentStatus { code, message });
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Driver;
    use crate::transport::{Capability, LoopbackTransport};
    use ivi_protocol::decode_ieee_block;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn session_with(options: SessionOptions, transport: &LoopbackTransport) -> Session {
        init_logger();
        let mut session = Session::with_locator(Arc::new(Locator::new()), options);
        session
            .initialize(Some(Resource::from_transport(transport.clone())), false, false)
            .unwrap();
        session
    }

    fn session(transport: &LoopbackTransport) -> Session {
        session_with(SessionOptions::default(), transport)
    }

    #[test]
    fn simulation_never_touches_transport() {
        let transport = LoopbackTransport::new();
        let mut session = session_with(SessionOptions::simulated(), &transport);
        assert!(session.initialized());

        session.write("*RST").unwrap();
        session.write_raw(b"\x00\x01").unwrap();
        session.write_many(&["A", "B"]).unwrap();
        assert_eq!(session.read(None).unwrap(), "");
        assert_eq!(session.ask("*IDN?").unwrap(), "");
        assert!(session.read_raw(Some(10)).unwrap().is_empty());
        assert!(session.ask_raw(b"CURV?", None).unwrap().is_empty());
        assert_eq!(session.ask_many(&["A?", "B?", "C?"]).unwrap(), vec!["", "", ""]);
        assert!(session.ask_for_values("DATA?", ',').unwrap().is_empty());
        assert_eq!(session.read_stb().unwrap(), 0);
        session.trigger().unwrap();
        session.clear().unwrap();
        session.remote().unwrap();
        session.local().unwrap();
        assert!(session.read_ieee_block().unwrap().is_empty());
        assert!(session.ask_for_ieee_block("CURV?").unwrap().is_empty());
        session.write_ieee_block(b"abc", ":DATA ").unwrap();
        assert_eq!(session.self_test().unwrap(), (0, "Self test passed".to_string()));
        assert_eq!(session.error_query().unwrap(), (0, "No error".to_string()));
        session.close();

        assert!(transport.calls().is_empty());
    }

    #[test]
    fn simulated_initialize_with_queries() {
        init_logger();
        let mut session = Session::with_locator(Arc::new(Locator::new()), SessionOptions::simulated());
        session.initialize(None, true, true).unwrap();
        assert!(session.initialized());
        assert_eq!(session.identity().instrument_model, crate::driver::UNKNOWN_INSTRUMENT);
    }

    #[test]
    fn simulated_identify() {
        init_logger();
        let mut session = Session::with_locator(Arc::new(Locator::new()), SessionOptions::simulated());
        session.initialize(None, false, false).unwrap();
        let idn = session.identify().unwrap();
        assert_eq!(idn.model, crate::driver::SIMULATED_IDENTITY);
        let identity = session.identity();
        assert_eq!(identity.instrument_manufacturer, crate::driver::SIMULATED_IDENTITY);
        assert_eq!(identity.instrument_model, crate::driver::SIMULATED_IDENTITY);
        assert_eq!(identity.instrument_serial_number, crate::driver::SIMULATED_IDENTITY);
        assert_eq!(identity.instrument_firmware_revision, crate::driver::SIMULATED_IDENTITY);
    }

    #[test]
    fn not_initialized() {
        init_logger();
        let mut session = Session::with_locator(Arc::new(Locator::new()), SessionOptions::default());
        assert!(matches!(session.write("*RST"), Err(Error::NotInitialized)));
        assert!(matches!(session.read(None), Err(Error::NotInitialized)));
        assert!(matches!(session.ask("*IDN?"), Err(Error::NotInitialized)));
        assert!(matches!(session.read_raw(None), Err(Error::NotInitialized)));
        assert!(matches!(session.trigger(), Err(Error::NotInitialized)));
        assert!(matches!(session.clear(), Err(Error::NotInitialized)));
        assert!(matches!(session.read_stb(), Err(Error::NotInitialized)));
        assert!(matches!(session.local(), Err(Error::NotInitialized)));
        assert!(matches!(session.read_ieee_block(), Err(Error::NotInitialized)));
    }

    #[test]
    fn closed_session() {
        let transport = LoopbackTransport::new();
        let mut session = session(&transport);
        session.write("*CLS").unwrap();
        session.close();
        assert!(transport.is_closed());
        assert!(!session.initialized());
        assert!(matches!(session.write("*CLS"), Err(Error::NotInitialized)));
        assert_eq!(transport.written_lines(), vec!["*CLS"]);
    }

    #[test]
    fn close_suppresses_errors() {
        let transport = LoopbackTransport::new();
        transport.fail_on_close();
        let mut session = session(&transport);
        session.close();
        assert!(!session.initialized());
        assert!(transport.is_closed());
    }

    #[test]
    fn drop_closes() {
        let transport = LoopbackTransport::new();
        drop(session(&transport));
        assert!(transport.is_closed());
    }

    #[test]
    fn simulation_state() {
        let transport = LoopbackTransport::new();
        let mut session = session(&transport);
        session.set_simulate(false).unwrap();
        session.set_option("Simulate", "true").unwrap();
        assert!(matches!(session.set_simulate(false), Err(Error::SimulationState)));
        assert!(session.simulate());

        // simulation wins over the bound transport
        assert_eq!(session.ask("*IDN?").unwrap(), "");
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn initialize_twice() {
        let transport = LoopbackTransport::new();
        let mut session = session(&transport);
        let again = session.initialize(Some(Resource::from_transport(LoopbackTransport::new())), false, false);
        assert!(matches!(again, Err(Error::AlreadyInitialized)));
    }

    #[test]
    fn initialize_invalidates_cache() {
        let transport = LoopbackTransport::new();
        let mut session = session(&transport);
        session.mark_cache_valid(true, "acquisition_type", None);
        assert!(session.is_cache_valid("acquisition_type", None));
        session.close();
        session
            .initialize(Some(Resource::from_transport(transport.clone())), false, false)
            .unwrap();
        assert!(!session.is_cache_valid("acquisition_type", None));
    }

    #[test]
    fn cache_option() {
        let transport = LoopbackTransport::new();
        let mut session = session(&transport);
        session.mark_cache_valid(true, "channel_enabled", Some(1));
        assert!(session.is_cache_valid("channel_enabled", Some(1)));
        session.set_option("cache", "false").unwrap();
        assert!(!session.is_cache_valid("channel_enabled", Some(1)));
        session.operation_mut().set_cache(true);
        assert!(session.is_cache_valid("channel_enabled", Some(1)));
    }

    #[test]
    fn unknown_resource() {
        init_logger();
        let mut session = Session::with_locator(Arc::new(Locator::new()), SessionOptions::default());
        let err = session
            .initialize(Some("TCPIP::10.0.0.1::INSTR".into()), false, false)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(!session.initialized());

        let err = session.initialize(None, false, false).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn resource_descriptor() {
        struct LoopbackBackend(LoopbackTransport);

        impl crate::locator::Backend for LoopbackBackend {
            fn name(&self) -> &'static str {
                "loopback"
            }

            fn open(&self, _address: &crate::address::ResourceAddress) -> crate::Result<Box<dyn Transport>> {
                Ok(Box::new(self.0.clone()))
            }
        }

        init_logger();
        let transport = LoopbackTransport::new();
        let mut locator = Locator::new();
        locator.register(crate::address::ResourceKind::Gpib, LoopbackBackend(transport.clone()));
        let mut session = Session::with_locator(Arc::new(locator), SessionOptions::default());
        session.initialize(Some("GPIB0::10::INSTR".into()), false, false).unwrap();
        assert_eq!(session.resource_descriptor(), "GPIB0::10::INSTR");
        session.write("*CLS").unwrap();
        assert_eq!(transport.written_lines(), vec!["*CLS"]);
    }

    #[test]
    fn id_query_and_reset() {
        let transport = LoopbackTransport::new();
        transport.push_reply("TEKTRONIX,DPO5054,C012345,CF:91.1CT FV:v6.3.0\n");
        init_logger();
        let mut session = Session::with_locator(Arc::new(Locator::new()), SessionOptions::default());
        session
            .initialize(Some(Resource::from_transport(transport.clone())), true, true)
            .unwrap();
        assert_eq!(session.identity().instrument_manufacturer, "TEKTRONIX");
        assert_eq!(session.identity().instrument_model, "DPO5054");
        assert_eq!(transport.written_lines(), vec!["*IDN?", "*RST"]);
    }

    #[test]
    fn failed_id_query_leaves_session_closed() {
        let transport = LoopbackTransport::new();
        transport.push_reply("garbage\n");
        init_logger();
        let mut session = Session::with_locator(Arc::new(Locator::new()), SessionOptions::default());
        session.identity_mut().supported_instrument_models = vec!["DPO5054".to_string()];
        let err = session
            .initialize(Some(Resource::from_transport(transport.clone())), true, false)
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::UnexpectedResponse(_))));
        assert!(!session.initialized());
        assert!(transport.is_closed());
    }

    #[test]
    fn unsupported_model() {
        let transport = LoopbackTransport::new();
        transport.push_reply("AGILENT TECHNOLOGIES,MSO9064A,MY123,04.50\n");
        init_logger();
        let mut session = Session::with_locator(Arc::new(Locator::new()), SessionOptions::default());
        session.identity_mut().supported_instrument_models = vec!["DPO5054".to_string()];
        let err = session
            .initialize(Some(Resource::from_transport(transport)), true, false)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(!session.initialized());
    }

    #[test]
    fn block_from_mock_transport() {
        let transport = LoopbackTransport::new();
        transport.set_default_reply(b"#800000004DATA");
        let mut session = session(&transport);
        let raw = session.read_raw(None).unwrap();
        assert_eq!(decode_ieee_block(&raw).unwrap(), b"DATA");
        assert_eq!(session.read_ieee_block().unwrap(), b"DATA".to_vec());
    }

    #[test]
    fn ask_many_in_order() {
        let transport = LoopbackTransport::new();
        transport.push_reply("1\n");
        transport.push_reply("2\r\n");
        transport.push_reply("3\n");
        let mut session = session(&transport);
        let replies = session.ask_many(vec!["A?", "B?", "C?"]).unwrap();
        assert_eq!(replies, vec!["1", "2", "3"]);
        assert_eq!(transport.written_lines(), vec!["A?", "B?", "C?"]);
        assert_eq!(
            transport.calls(),
            vec![
                "write_raw",
                "read_raw",
                "write_raw",
                "read_raw",
                "write_raw",
                "read_raw"
            ]
        );
    }

    #[test]
    fn write_many_aborts_on_failure() {
        let transport = LoopbackTransport::new();
        transport.fail_writes_after(1);
        let mut session = session(&transport);
        assert!(session.write_many(&["A", "B", "C"]).is_err());
        assert_eq!(transport.written_lines(), vec!["A"]);
    }

    #[test]
    fn native_capabilities() {
        let transport = LoopbackTransport::new()
            .with_native(Capability::AskRaw)
            .with_native(Capability::ReadStr)
            .with_native(Capability::ReadStb)
            .with_native(Capability::Trigger)
            .with_native(Capability::Clear)
            .with_native(Capability::Remote)
            .with_native(Capability::Local);
        transport.set_status_byte(0x10);
        transport.push_reply("ok\n");
        transport.push_reply("fine\n");
        let mut session = session(&transport);

        assert_eq!(session.ask("X?").unwrap(), "ok");
        assert_eq!(session.read(None).unwrap(), "fine");
        assert_eq!(session.read_stb().unwrap(), 0x10);
        session.trigger().unwrap();
        session.clear().unwrap();
        session.remote().unwrap();
        session.local().unwrap();
        assert_eq!(
            transport.calls(),
            vec!["ask_raw", "read_str", "read_stb", "trigger", "clear", "remote", "local"]
        );
    }

    #[test]
    fn emulated_capabilities() {
        let transport = LoopbackTransport::new();
        transport.push_reply("+64\n");
        let mut session = session(&transport);

        assert_eq!(session.read_stb().unwrap(), 64);
        session.trigger().unwrap();
        session.clear().unwrap();
        assert_eq!(transport.written_lines(), vec!["*STB?", "*TRG", "*CLS"]);

        assert!(matches!(session.remote(), Err(Error::NotSupported(_))));
        assert!(matches!(session.local(), Err(Error::NotSupported(_))));
    }

    #[test]
    fn transport_errors_propagate() {
        let transport = LoopbackTransport::new();
        let mut session = session(&transport);
        // no reply queued
        assert!(session.ask("*IDN?").unwrap_err().is_timeout());
        transport.push_reply("300\n");
        assert!(matches!(
            session.read_stb(),
            Err(Error::Protocol(ProtocolError::UnexpectedResponse(_)))
        ));
    }

    #[test]
    fn blocks() {
        let transport = LoopbackTransport::new();
        transport.set_default_reply("");
        transport.push_reply("junk#800000003abc\n");
        transport.push_reply("#0indef\ninite\n");
        let mut session = session(&transport);
        assert_eq!(session.ask_for_ieee_block("CURV?").unwrap(), b"abc".to_vec());
        // leftover terminator of the first block is skipped while seeking the marker
        assert_eq!(session.read_ieee_block().unwrap(), b"indef\ninite".to_vec());
        // nothing available at all
        assert!(session.read_ieee_block().unwrap().is_empty());
        assert_eq!(transport.written_lines(), vec!["CURV?"]);
    }

    #[test]
    fn truncated_block_strict() {
        let transport = LoopbackTransport::new();
        transport.set_default_reply("");
        transport.push_reply("#800000010ABC");
        let mut session = session(&transport);
        let err = session.read_ieee_block().unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::TruncatedBlock {
                expected: 10,
                received: 3
            })
        ));
    }

    #[test]
    fn oversized_block_header() {
        let transport = LoopbackTransport::new();
        transport.set_default_reply("");
        transport.push_reply("#9999999999AB");
        let mut session = session(&transport);
        assert!(matches!(
            session.read_ieee_block(),
            Err(Error::Protocol(ProtocolError::TruncatedBlock {
                expected: 999_999_999,
                received: 2
            }))
        ));
    }

    #[test]
    fn truncated_block_lenient() {
        let transport = LoopbackTransport::new();
        transport.push_reply("#800000010ABC");
        let mut session = session_with(
            SessionOptions {
                lenient_blocks: true,
                ..Default::default()
            },
            &transport,
        );
        // the missing bytes surface as timeout of the loopback transport
        assert_eq!(session.read_ieee_block().unwrap(), b"ABC".to_vec());
    }

    #[test]
    fn invalid_block_header() {
        let transport = LoopbackTransport::new();
        transport.push_reply("#X0000");
        let mut session = session(&transport);
        assert!(matches!(
            session.read_ieee_block(),
            Err(Error::Protocol(ProtocolError::InvalidBlockHeader(_)))
        ));
    }

    #[test]
    fn write_block() {
        let transport = LoopbackTransport::new();
        let mut session = session(&transport);
        session.write_ieee_block(b"abc", ":WAV:DATA ").unwrap();
        assert_eq!(transport.written(), vec![b":WAV:DATA #800000003abc".to_vec()]);
    }

    #[test]
    fn values_and_encodings() {
        let transport = LoopbackTransport::new();
        transport.push_reply("1.0,2.5,-3E-3\n");
        let mut session = session(&transport);
        assert_eq!(session.ask_for_values("DATA?", ',').unwrap(), vec![1.0, 2.5, -3e-3]);

        session.write_with("µs", Encoding::Latin1).unwrap();
        session.set_encoding(Encoding::Ascii);
        assert!(session.write("µs").is_err());
        assert_eq!(transport.written()[1], vec![0xB5, b's']);
    }

    #[test]
    fn utility() {
        let transport = LoopbackTransport::new();
        transport.push_reply("0\n");
        transport.push_reply("1\n");
        transport.push_reply("-113,\"Undefined header\"\n");
        transport.push_reply("-222,\"Data out of range\"\n");
        let mut session = session(&transport);

        assert_eq!(session.self_test().unwrap(), (0, "Self test passed".to_string()));
        assert_eq!(session.self_test().unwrap(), (1, "Self test failed".to_string()));
        assert_eq!(
            session.error_query().unwrap(),
            (-113, "Undefined header".to_string())
        );

        // status checks are off by default
        session.check_instrument_status().unwrap();
        session.operation_mut().set_query_instr_status(true);
        let err = session.check_instrument_status().unwrap_err();
        assert!(matches!(err, Error::InstrumentStatus { code: -222, .. }));

        session.disable().unwrap();
        session.mark_cache_valid(true, "x", None);
        session.reset_with_defaults().unwrap();
        assert!(!session.is_cache_valid("x", None));
        assert_eq!(
            transport.written_lines(),
            vec!["*TST?", "*TST?", ":SYST:ERR?", ":SYST:ERR?", "*RST"]
        );
    }

    #[test]
    fn advisory_lock() {
        let transport = LoopbackTransport::new();
        let session = session(&transport);
        session.lock_object();
        {
            let _guard = session.lock_guard();
            assert_eq!(session.lock_handle().depth(), 2);
        }
        session.unlock_object().unwrap();
        assert!(!session.lock_handle().is_locked());
        assert!(session.unlock_object().is_err());
    }

    /// A minimal per-model driver with a single cached attribute.
    struct Scope {
        session: Session,
        acquisition_type: String,
    }

    impl Driver for Scope {
        fn session(&self) -> &Session {
            &self.session
        }

        fn session_mut(&mut self) -> &mut Session {
            &mut self.session
        }
    }

    impl Scope {
        fn acquisition_type(&mut self) -> crate::Result<String> {
            let tag = crate::cache::cache_tag("_get_acquisition_type");
            if !self.session.simulate() && !self.session.is_cache_valid(tag, None) {
                self.acquisition_type = self.session.ask("ACQ:MODE?")?;
                self.session.mark_cache_valid(true, tag, None);
            }
            Ok(self.acquisition_type.clone())
        }

        fn set_acquisition_type(&mut self, value: &str) -> crate::Result<()> {
            let tag = crate::cache::cache_tag("_set_acquisition_type");
            self.session.write(&format!("ACQ:MODE {}", value))?;
            self.acquisition_type = value.to_string();
            self.session.mark_cache_valid(true, tag, None);
            Ok(())
        }
    }

    #[test]
    fn driver_cached_attribute() {
        let transport = LoopbackTransport::new();
        transport.push_reply("SAMPLE\n");
        let mut scope = Scope {
            session: session(&transport),
            acquisition_type: String::new(),
        };
        assert!(scope.initialized());
        assert_eq!(scope.acquisition_type().unwrap(), "SAMPLE");
        assert_eq!(scope.acquisition_type().unwrap(), "SAMPLE");
        scope.set_acquisition_type("AVERAGE").unwrap();
        assert_eq!(scope.acquisition_type().unwrap(), "AVERAGE");
        assert_eq!(transport.written_lines(), vec!["ACQ:MODE?", "ACQ:MODE AVERAGE"]);

        scope.session_mut().reset().unwrap();
        transport.push_reply("SAMPLE\n");
        assert_eq!(scope.acquisition_type().unwrap(), "SAMPLE");
        assert_eq!(scope.identity().description, "Base IVI Driver");
    }
}
