use std::mem;
use std::os::raw::c_schar;
use std::os::unix::io::AsRawFd;

use anyhow::anyhow;
use libc::{c_char, c_int, c_short, c_uint, c_ulong};

const ASYNC_LOW_LATENCY: c_int = 1 << 13;
const TIOCGSERIAL: c_ulong = 0x541E;
const TIOCSSERIAL: c_ulong = 0x541F;

/// Mirror of the kernel's `struct serial_struct`.
#[repr(C)]
struct SerialInfo {
    typ: c_int,
    line: c_int,
    port: c_uint,
    irq: c_int,
    flags: c_int,
    xmit_fifo_size: c_int,
    custom_divisor: c_int,
    baud_rate: c_int,
    close_delay: c_short,
    io_type: c_schar,
    reserved_char: c_schar,
    hub6: c_int,
    closing_wait: c_short,
    closing_wait2: c_short,
    iomem_base: *mut c_char,
    iomem_reg_shift: c_short,
    port_high: c_int,
    iomap_base: c_ulong,
}

/// Ask the tty driver to push received bytes without batching them.
pub(crate) fn apply_low_latency<T: AsRawFd>(port: &T) -> crate::Result<()> {
    let fd = port.as_raw_fd();
    let mut info: SerialInfo = unsafe { mem::zeroed() };
    if unsafe { libc::ioctl(fd, TIOCGSERIAL as _, &mut info as *mut SerialInfo) } != 0 {
        return Err(crate::Error::transport(anyhow!("TIOCGSERIAL failed")));
    }
    info.flags |= ASYNC_LOW_LATENCY;
    if unsafe { libc::ioctl(fd, TIOCSSERIAL as _, &mut info as *mut SerialInfo) } != 0 {
        return Err(crate::Error::transport(anyhow!("TIOCSSERIAL failed")));
    }
    Ok(())
}
