/// USB instruments through the Linux `usbtmc` kernel driver (`USB` resources).
///
/// Devices are looked up in sysfs by vendor id, product id and optionally serial number
/// and interface number. The character device is opened on first use.
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::anyhow;

use super::Transport;
use crate::address::{ResourceAddress, UsbAddress};
use crate::locator::Backend;
use crate::{Error, TransportError};

const SYSFS_CLASS: &str = "/sys/class/usbmisc";
const DEVICE_DIR: &str = "/dev";
const READ_CHUNK: usize = 0x10_0000;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

fn read_attr(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|x| x.trim().to_string())
}

fn read_hex(path: &Path) -> Option<u16> {
    read_attr(path).and_then(|x| u16::from_str_radix(&x, 16).ok())
}

/// Find the device node of the usbtmc interface matching `address`.
/// `class_dir` is the sysfs class directory listing the `usbtmcN` entries.
pub fn find_device(class_dir: &Path, address: &UsbAddress) -> crate::Result<PathBuf> {
    let entries = fs::read_dir(class_dir).map_err(Error::transport)?;
    let mut names: Vec<String> = entries
        .filter_map(|x| x.ok())
        .filter_map(|x| x.file_name().into_string().ok())
        .filter(|x| x.starts_with("usbtmc"))
        .collect();
    names.sort();
    for name in names {
        let interface_dir = class_dir.join(&name).join("device");
        let device_dir = interface_dir.join("..");
        if read_hex(&device_dir.join("idVendor")) != Some(address.vendor_id)
            || read_hex(&device_dir.join("idProduct")) != Some(address.product_id)
        {
            continue;
        }
        if let Some(serial) = &address.serial {
            if read_attr(&device_dir.join("serial")).as_deref() != Some(serial.as_str()) {
                continue;
            }
        }
        if let Some(interface) = address.interface {
            let number = read_attr(&interface_dir.join("bInterfaceNumber"))
                .and_then(|x| u8::from_str_radix(&x, 16).ok());
            if number != Some(interface) {
                continue;
            }
        }
        return Ok(Path::new(DEVICE_DIR).join(name));
    }
    Err(Error::transport(anyhow!(
        "No USBTMC device {:04x}:{:04x} found",
        address.vendor_id,
        address.product_id
    )))
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        use std::os::unix::io::AsRawFd;

        const USBTMC_IOCTL_CLEAR: u64 = 0x5B02;
        const USBTMC_IOCTL_SET_TIMEOUT: u64 = 0x4004_5B0A;
        const USBTMC488_IOCTL_READ_STB: u64 = 0x8001_5B12;
        const USBTMC488_IOCTL_REN_CONTROL: u64 = 0x4001_5B13;
        const USBTMC488_IOCTL_GOTO_LOCAL: u64 = 0x5B14;
        const USBTMC488_IOCTL_TRIGGER: u64 = 0x5B16;

        fn check_ioctl(ret: libc::c_int) -> crate::Result<()> {
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ENOTTY) || err.raw_os_error() == Some(libc::EINVAL) {
                    return Err(Error::NotSupported("usbtmc ioctl"));
                }
                return Err(Error::from(err));
            }
            Ok(())
        }

        fn ioctl_none(file: &File, request: u64) -> crate::Result<()> {
            check_ioctl(unsafe { libc::ioctl(file.as_raw_fd(), request as _) })
        }

        fn ioctl_write<T>(file: &File, request: u64, value: &T) -> crate::Result<()> {
            check_ioctl(unsafe { libc::ioctl(file.as_raw_fd(), request as _, value as *const T) })
        }

        fn ioctl_read_u8(file: &File, request: u64) -> crate::Result<u8> {
            let mut ret = 0_u8;
            check_ioctl(unsafe { libc::ioctl(file.as_raw_fd(), request as _, &mut ret as *mut u8) })?;
            Ok(ret)
        }

        fn open_device(path: &Path, timeout: Duration) -> crate::Result<File> {
            let file = OpenOptions::new().read(true).write(true).open(path).map_err(Error::from)?;
            let timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
            ioctl_write(&file, USBTMC_IOCTL_SET_TIMEOUT, &timeout_ms)?;
            log::info!("Opened {}", path.display());
            Ok(file)
        }
    } else {
        fn unsupported() -> Error {
            Error::configuration(anyhow!("USBTMC is only supported on Linux"))
        }

        fn ioctl_none(_file: &File, _request: u64) -> crate::Result<()> {
            Err(unsupported())
        }

        fn ioctl_write<T>(_file: &File, _request: u64, _value: &T) -> crate::Result<()> {
            Err(unsupported())
        }

        fn ioctl_read_u8(_file: &File, _request: u64) -> crate::Result<u8> {
            Err(unsupported())
        }

        fn open_device(_path: &Path, _timeout: Duration) -> crate::Result<File> {
            Err(unsupported())
        }

        const USBTMC_IOCTL_CLEAR: u64 = 0;
        const USBTMC488_IOCTL_READ_STB: u64 = 0;
        const USBTMC488_IOCTL_REN_CONTROL: u64 = 0;
        const USBTMC488_IOCTL_GOTO_LOCAL: u64 = 0;
        const USBTMC488_IOCTL_TRIGGER: u64 = 0;
    }
}

pub struct UsbtmcTransport {
    address: UsbAddress,
    class_dir: PathBuf,
    timeout: Duration,
    file: Option<File>,
}

impl UsbtmcTransport {
    pub fn new(address: UsbAddress) -> Self {
        Self {
            address,
            class_dir: PathBuf::from(SYSFS_CLASS),
            timeout: DEFAULT_TIMEOUT,
            file: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> &UsbAddress {
        &self.address
    }

    fn with_file<T, F>(&mut self, f: F) -> crate::Result<T>
    where
        F: FnOnce(&mut File) -> crate::Result<T>,
    {
        let mut file = match self.file.take() {
            Some(file) => file,
            None => {
                let path = find_device(&self.class_dir, &self.address)?;
                open_device(&path, self.timeout)?
            }
        };
        let ret = f(&mut file);
        match &ret {
            Err(Error::Transport(TransportError::Io(err))) => {
                log::debug!("Closing USBTMC device after error: {}", err);
            }
            _ => {
                self.file.replace(file);
            }
        }
        ret
    }
}

impl Transport for UsbtmcTransport {
    fn name(&self) -> &'static str {
        "usbtmc"
    }

    fn write_raw(&mut self, data: &[u8]) -> crate::Result<()> {
        self.with_file(|file| file.write_all(data).map_err(Error::from))
    }

    /// Every `read` call on the device returns at most one message, a short read marks its end.
    fn read_raw(&mut self, max_len: Option<usize>) -> crate::Result<Vec<u8>> {
        self.with_file(|file| {
            let mut ret = Vec::new();
            loop {
                let chunk = match max_len {
                    Some(max_len) if ret.len() >= max_len => break,
                    Some(max_len) => (max_len - ret.len()).min(READ_CHUNK),
                    None => READ_CHUNK,
                };
                let start = ret.len();
                ret.resize(start + chunk, 0);
                let n = file.read(&mut ret[start..]).map_err(Error::from)?;
                ret.truncate(start + n);
                if n < chunk {
                    break;
                }
            }
            Ok(ret)
        })
    }

    fn read_stb(&mut self) -> crate::Result<u8> {
        self.with_file(|file| ioctl_read_u8(file, USBTMC488_IOCTL_READ_STB))
    }

    fn trigger(&mut self) -> crate::Result<()> {
        self.with_file(|file| ioctl_none(file, USBTMC488_IOCTL_TRIGGER))
    }

    fn clear(&mut self) -> crate::Result<()> {
        self.with_file(|file| ioctl_none(file, USBTMC_IOCTL_CLEAR))
    }

    fn remote(&mut self) -> crate::Result<()> {
        self.with_file(|file| ioctl_write(file, USBTMC488_IOCTL_REN_CONTROL, &1_u8))
    }

    fn local(&mut self) -> crate::Result<()> {
        self.with_file(|file| ioctl_none(file, USBTMC488_IOCTL_GOTO_LOCAL))
    }

    fn close(&mut self) -> crate::Result<()> {
        self.file.take();
        Ok(())
    }
}

/// Serves `USB` resources.
pub struct UsbtmcBackend {
    timeout: Duration,
}

impl Default for UsbtmcBackend {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl UsbtmcBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn is_available() -> bool {
        cfg!(target_os = "linux")
    }
}

impl Backend for UsbtmcBackend {
    fn name(&self) -> &'static str {
        "usbtmc"
    }

    fn open(&self, address: &ResourceAddress) -> crate::Result<Box<dyn Transport>> {
        Ok(Box::new(UsbtmcTransport::new(address.usb()?).with_timeout(self.timeout)))
    }
}
