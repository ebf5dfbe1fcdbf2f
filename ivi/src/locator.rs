/// Selection of the transport serving a resource.
///
/// Backends are registered per resource kind. A generic backend (usually VISA) may serve
/// any resource string, including strings which do not follow the resource grammar.
use std::collections::HashMap;
use std::fmt;

use anyhow::anyhow;

use crate::address::{ResourceAddress, ResourceKind};
use crate::transport::prologix::PrologixBackend;
use crate::transport::serial::SerialTransport;
use crate::transport::usbtmc::UsbtmcBackend;
use crate::transport::visa::VisaBackend;
use crate::transport::vxi::VxiBackend;
use crate::transport::Transport;
use crate::Error;

/// Constructs transports for parsed resource addresses of one kind.
/// Opening must not perform any I/O.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self, address: &ResourceAddress) -> crate::Result<Box<dyn Transport>>;
}

/// Constructs transports for arbitrary resource strings.
pub trait GenericBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self, resource: &str) -> crate::Result<Box<dyn Transport>>;
}

/// What a session is opened against.
pub enum Resource {
    Address(String),
    Transport(Box<dyn Transport>),
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Address(x) => f.debug_tuple("Address").field(x).finish(),
            Resource::Transport(x) => f.debug_tuple("Transport").field(&x.name()).finish(),
        }
    }
}

impl From<&str> for Resource {
    fn from(x: &str) -> Self {
        Resource::Address(x.to_string())
    }
}

impl From<String> for Resource {
    fn from(x: String) -> Self {
        Resource::Address(x)
    }
}

impl From<Box<dyn Transport>> for Resource {
    fn from(x: Box<dyn Transport>) -> Self {
        Resource::Transport(x)
    }
}

impl Resource {
    pub fn from_transport<T: Transport + 'static>(transport: T) -> Self {
        Resource::Transport(Box::new(transport))
    }

    /// The resource string, if any.
    pub fn address(&self) -> Option<&str> {
        match self {
            Resource::Address(x) => Some(x),
            Resource::Transport(_) => None,
        }
    }
}

/// Serves `ASRL` resources with plain serial ports.
#[derive(Default)]
pub struct SerialBackend;

impl Backend for SerialBackend {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn open(&self, address: &ResourceAddress) -> crate::Result<Box<dyn Transport>> {
        let (path, params) = address.serial()?;
        Ok(Box::new(SerialTransport::new(path, params)))
    }
}

#[derive(Default)]
pub struct Locator {
    backends: HashMap<ResourceKind, Box<dyn Backend>>,
    generic: Option<Box<dyn GenericBackend>>,
}

impl Locator {
    /// A locator without any backends.
    pub fn new() -> Self {
        Self::default()
    }

    /// VXI-11 for `TCPIP`, serial ports for `ASRL`, USBTMC for `USB` on Linux and,
    /// if it can be loaded, VISA as generic backend.
    pub fn with_default_backends() -> Self {
        let mut ret = Self::new();
        ret.register(ResourceKind::Tcpip, VxiBackend::new());
        ret.register(ResourceKind::Asrl, SerialBackend);
        if UsbtmcBackend::is_available() {
            ret.register(ResourceKind::Usb, UsbtmcBackend::new());
        }
        if let Some(visa) = VisaBackend::load() {
            ret.set_generic(visa);
        }
        ret
    }

    pub fn register<B: Backend + 'static>(&mut self, kind: ResourceKind, backend: B) -> &mut Self {
        log::debug!("Registering {} backend for {}", backend.name(), kind);
        self.backends.insert(kind, Box::new(backend));
        self
    }

    /// Serve `GPIB` resources through a Prologix adapter attached to `path`.
    pub fn register_prologix<T: Into<String>>(&mut self, path: T) -> &mut Self {
        self.register(ResourceKind::Gpib, PrologixBackend::new(path))
    }

    pub fn set_generic<B: GenericBackend + 'static>(&mut self, backend: B) -> &mut Self {
        log::debug!("Using {} as generic backend", backend.name());
        self.generic = Some(Box::new(backend));
        self
    }

    pub fn has_backend(&self, kind: ResourceKind) -> bool {
        self.backends.contains_key(&kind)
    }

    pub fn has_generic(&self) -> bool {
        self.generic.is_some()
    }

    /// Bind a transport to `resource` without performing any I/O.
    pub fn locate(&self, resource: Resource, prefer_generic: bool) -> crate::Result<Box<dyn Transport>> {
        let resource = match resource {
            Resource::Transport(transport) => return Ok(transport),
            Resource::Address(x) => x,
        };
        let address = match ResourceAddress::parse(&resource) {
            Ok(address) => address,
            Err(err) => {
                return match &self.generic {
                    Some(generic) => {
                        log::debug!("Handing `{}` to the {} backend", resource, generic.name());
                        generic.open(&resource)
                    }
                    None => Err(err),
                };
            }
        };

        let native = self.backends.get(&address.kind());
        let generic = self.generic.as_ref();
        let transport = match (prefer_generic, native, generic) {
            (true, _, Some(generic)) | (false, None, Some(generic)) => {
                log::debug!("Opening `{}` with the {} backend", resource, generic.name());
                generic.open(address.as_str())?
            }
            (_, Some(native), _) => {
                log::debug!("Opening `{}` with the {} backend", resource, native.name());
                native.open(&address)?
            }
            (_, None, None) => {
                return Err(Error::configuration(anyhow!(
                    "No backend available for {} resources",
                    address.kind()
                )));
            }
        };
        Ok(transport)
    }
}
