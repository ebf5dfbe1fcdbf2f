/// Generic backend on top of a VISA implementation installed on the system.
///
/// The shared library is loaded once on first use. If it cannot be loaded, the backend
/// is simply not offered.
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::time::Duration;

use anyhow::anyhow;
use dlopen::wrapper::{Container, WrapperApi};

use super::Transport;
use crate::locator::GenericBackend;
use crate::Error;

type ViStatus = i32;
type ViSession = u32;
type ViObject = u32;
type ViAccessMode = u32;
type ViAttr = u32;
type ViAttrState = u64;

const VI_SUCCESS_MAX_CNT: ViStatus = 0x3FFF_0006;
const VI_ERROR_TMO: ViStatus = 0xBFFF_0015_u32 as ViStatus;
const VI_ERROR_NSUP_OPER: ViStatus = 0xBFFF_0067_u32 as ViStatus;
const VI_ATTR_TMO_VALUE: ViAttr = 0x3FFF_001A;
const VI_TRIG_PROT_DEFAULT: u16 = 0;
const VI_GPIB_REN_ASSERT_ADDRESS: u16 = 3;
const VI_GPIB_REN_ADDRESS_GTL: u16 = 6;
const VI_NO_LOCK: ViAccessMode = 0;

const READ_CHUNK: usize = 0x1_0000;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        const VISA_LIBRARIES: &[&str] = &["visa64.dll", "visa32.dll"];
    } else if #[cfg(target_os = "macos")] {
        const VISA_LIBRARIES: &[&str] = &["/Library/Frameworks/VISA.framework/VISA"];
    } else {
        const VISA_LIBRARIES: &[&str] = &["libvisa.so", "libvisa.so.0", "librsvisa.so"];
    }
}

#[allow(non_snake_case)]
#[derive(WrapperApi)]
struct Api {
    viOpenDefaultRM: unsafe extern "C" fn(vi: *mut ViSession) -> ViStatus,
    viOpen: unsafe extern "C" fn(
        session: ViSession,
        rsrc: *const c_char,
        access_mode: ViAccessMode,
        timeout: u32,
        vi: *mut ViObject,
    ) -> ViStatus,
    viClose: extern "C" fn(vi: ViObject) -> ViStatus,
    viSetAttribute: extern "C" fn(vi: ViObject, attr: ViAttr, value: ViAttrState) -> ViStatus,
    viStatusDesc: unsafe extern "C" fn(vi: ViObject, status: ViStatus, desc: *mut c_char) -> ViStatus,
    viRead: unsafe extern "C" fn(vi: ViObject, buf: *mut u8, cnt: u32, ret_cnt: *mut u32) -> ViStatus,
    viWrite: unsafe extern "C" fn(vi: ViObject, buf: *const u8, cnt: u32, ret_cnt: *mut u32) -> ViStatus,
    viReadSTB: unsafe extern "C" fn(vi: ViObject, status: *mut u16) -> ViStatus,
    viAssertTrigger: extern "C" fn(vi: ViObject, protocol: u16) -> ViStatus,
    viClear: extern "C" fn(vi: ViObject) -> ViStatus,
    viGpibControlREN: extern "C" fn(vi: ViObject, mode: u16) -> ViStatus,
}

struct Visa {
    api: Container<Api>,
    rm: ViSession,
}

impl Visa {
    fn load() -> Option<Self> {
        for name in VISA_LIBRARIES {
            let api: Container<Api> = match unsafe { Container::load(*name) } {
                Ok(api) => api,
                Err(_) => continue,
            };
            let mut rm: ViSession = 0;
            let status = unsafe { api.viOpenDefaultRM(&mut rm as *mut ViSession) };
            if status < 0 {
                log::warn!("Could not open VISA resource manager of {}: {:#x}", name, status);
                continue;
            }
            log::info!("Loaded VISA library {}", name);
            return Some(Visa { api, rm });
        }
        None
    }

    fn describe_status(&self, status: ViStatus) -> String {
        let mut desc = [0 as c_char; 256];
        let ret = unsafe { self.api.viStatusDesc(self.rm, status, desc.as_mut_ptr()) };
        if ret < 0 {
            return "unknown error".to_string();
        }
        unsafe { CStr::from_ptr(desc.as_ptr()) }.to_string_lossy().to_string()
    }

    fn check(&self, status: ViStatus) -> crate::Result<ViStatus> {
        match status {
            x if x >= 0 => Ok(x),
            VI_ERROR_TMO => Err(Error::timeout()),
            VI_ERROR_NSUP_OPER => Err(Error::NotSupported("visa")),
            x => Err(Error::transport(anyhow!(
                "VISA error {:#x}: {}",
                x as u32,
                self.describe_status(x)
            ))),
        }
    }
}

lazy_static! {
    static ref VISA: Option<Visa> = Visa::load();
}

fn visa() -> crate::Result<&'static Visa> {
    VISA.as_ref()
        .ok_or_else(|| Error::configuration(anyhow!("No VISA library available")))
}

pub struct VisaTransport {
    resource: String,
    timeout: Duration,
    instr: Option<ViObject>,
}

impl VisaTransport {
    pub fn new<T: Into<String>>(resource: T) -> Self {
        Self {
            resource: resource.into(),
            timeout: DEFAULT_TIMEOUT,
            instr: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    fn instrument(&mut self) -> crate::Result<(&'static Visa, ViObject)> {
        let visa = visa()?;
        if let Some(instr) = self.instr {
            return Ok((visa, instr));
        }
        let rsrc = CString::new(self.resource.as_str())
            .map_err(|_| Error::configuration(anyhow!("Invalid resource string `{}`", self.resource)))?;
        let mut instr: ViObject = 0;
        let status = unsafe { visa.api.viOpen(visa.rm, rsrc.as_ptr(), VI_NO_LOCK, 0, &mut instr as *mut ViObject) };
        visa.check(status)?;
        let timeout_ms = self.timeout.as_millis().min(u32::MAX as u128 - 1) as u64;
        if let Err(err) = visa.check(visa.api.viSetAttribute(instr, VI_ATTR_TMO_VALUE, timeout_ms)) {
            visa.api.viClose(instr);
            return Err(err);
        }
        log::info!("Opened VISA resource {}", self.resource);
        self.instr = Some(instr);
        Ok((visa, instr))
    }
}

impl Transport for VisaTransport {
    fn name(&self) -> &'static str {
        "visa"
    }

    fn write_raw(&mut self, data: &[u8]) -> crate::Result<()> {
        let (visa, instr) = self.instrument()?;
        let mut offset = 0;
        while offset < data.len() {
            let chunk = &data[offset..];
            let mut written = 0_u32;
            let status = unsafe {
                visa.api
                    .viWrite(instr, chunk.as_ptr(), chunk.len().min(u32::MAX as usize) as u32, &mut written as *mut u32)
            };
            visa.check(status)?;
            if written == 0 {
                return Err(Error::transport(anyhow!("VISA write stalled")));
            }
            offset += written as usize;
        }
        Ok(())
    }

    fn read_raw(&mut self, max_len: Option<usize>) -> crate::Result<Vec<u8>> {
        let (visa, instr) = self.instrument()?;
        let mut ret = Vec::new();
        loop {
            let chunk = match max_len {
                Some(max_len) if ret.len() >= max_len => break,
                Some(max_len) => (max_len - ret.len()).min(READ_CHUNK),
                None => READ_CHUNK,
            };
            let start = ret.len();
            ret.resize(start + chunk, 0);
            let mut count = 0_u32;
            let status = unsafe { visa.api.viRead(instr, ret[start..].as_mut_ptr(), chunk as u32, &mut count as *mut u32) };
            let status = visa.check(status)?;
            ret.truncate(start + count as usize);
            if status != VI_SUCCESS_MAX_CNT {
                break;
            }
        }
        Ok(ret)
    }

    fn read_stb(&mut self) -> crate::Result<u8> {
        let (visa, instr) = self.instrument()?;
        let mut stb = 0_u16;
        visa.check(unsafe { visa.api.viReadSTB(instr, &mut stb as *mut u16) })?;
        Ok((stb & 0xFF) as u8)
    }

    fn trigger(&mut self) -> crate::Result<()> {
        let (visa, instr) = self.instrument()?;
        visa.check(visa.api.viAssertTrigger(instr, VI_TRIG_PROT_DEFAULT)).map(|_| ())
    }

    fn clear(&mut self) -> crate::Result<()> {
        let (visa, instr) = self.instrument()?;
        visa.check(visa.api.viClear(instr)).map(|_| ())
    }

    fn remote(&mut self) -> crate::Result<()> {
        let (visa, instr) = self.instrument()?;
        visa.check(visa.api.viGpibControlREN(instr, VI_GPIB_REN_ASSERT_ADDRESS))
            .map(|_| ())
    }

    fn local(&mut self) -> crate::Result<()> {
        let (visa, instr) = self.instrument()?;
        visa.check(visa.api.viGpibControlREN(instr, VI_GPIB_REN_ADDRESS_GTL))
            .map(|_| ())
    }

    fn close(&mut self) -> crate::Result<()> {
        match (self.instr.take(), VISA.as_ref()) {
            (Some(instr), Some(visa)) => visa.check(visa.api.viClose(instr)).map(|_| ()),
            _ => Ok(()),
        }
    }
}

impl Drop for VisaTransport {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("Error closing VISA resource {}: {}", self.resource, err);
        }
    }
}

/// Hands any resource string to the system VISA library.
pub struct VisaBackend {
    timeout: Duration,
}

impl VisaBackend {
    /// Returns `None` if no VISA library can be loaded.
    pub fn load() -> Option<Self> {
        VISA.as_ref().map(|_| VisaBackend {
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl GenericBackend for VisaBackend {
    fn name(&self) -> &'static str {
        "visa"
    }

    fn open(&self, resource: &str) -> crate::Result<Box<dyn Transport>> {
        Ok(Box::new(VisaTransport::new(resource).with_timeout(self.timeout)))
    }
}
