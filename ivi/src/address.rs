/// This module implements `ResourceAddress` which is used for parsing
/// resource strings of the form "TCPIP0::10.0.0.1::gpib,5::INSTR"
use std::fmt;
use std::fmt::{Display, Formatter};

use anyhow::anyhow;

use crate::transport::serial::SerialParams;
use crate::Error;

const RESOURCE_CLASS: &str = "INSTR";
const MAX_ARGS: usize = 4;
const DEFAULT_LAN_DEVICE: &str = "inst0";
const DEFAULT_BAUD: u32 = 9600;

/// The interface type token of a resource string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Tcpip,
    Usb,
    Gpib,
    Asrl,
}

impl ResourceKind {
    fn from_token(token: &str) -> Option<Self> {
        match token.to_uppercase().as_str() {
            "TCPIP" => Some(ResourceKind::Tcpip),
            "USB" => Some(ResourceKind::Usb),
            "GPIB" => Some(ResourceKind::Gpib),
            "ASRL" => Some(ResourceKind::Asrl),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Tcpip => "TCPIP",
            ResourceKind::Usb => "USB",
            ResourceKind::Gpib => "GPIB",
            ResourceKind::Asrl => "ASRL",
        }
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a parsed resource string.
/// The original string is kept for diagnostics and for handing it to a generic backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceAddress {
    kind: ResourceKind,
    board: Option<u32>,
    args: Vec<String>,
    resource: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LanAddress {
    pub host: String,
    pub device: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsbAddress {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
    pub interface: Option<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GpibAddress {
    pub board: u32,
    pub primary: u8,
    pub secondary: Option<u8>,
}

fn invalid(resource: &str) -> Error {
    Error::configuration(anyhow!("Invalid resource string `{}`", resource))
}

/// Split at `::` separators which are not enclosed in brackets, such that
/// `usb0[1234::5678::SERIAL::0]` remains a single segment.
fn split_segments(resource: &str) -> Option<Vec<&str>> {
    let bytes = resource.as_bytes();
    let mut ret = Vec::new();
    let mut depth = 0_usize;
    let mut start = 0;
    let mut k = 0;
    while k < bytes.len() {
        match bytes[k] {
            b'[' => depth += 1,
            b']' => depth = depth.checked_sub(1)?,
            b':' if depth == 0 && bytes.get(k + 1) == Some(&b':') => {
                ret.push(&resource[start..k]);
                k += 2;
                start = k;
                continue;
            }
            _ => {}
        }
        k += 1;
    }
    if depth != 0 {
        return None;
    }
    ret.push(&resource[start..]);
    Some(ret)
}

fn valid_arg(arg: &str) -> bool {
    if arg.is_empty() {
        return false;
    }
    let mut depth = 0;
    for c in arg.chars() {
        match c {
            '[' => depth += 1,
            ']' => depth -= 1,
            c if depth == 0 && (c.is_whitespace() || c == ':') => return false,
            _ => {}
        }
    }
    true
}

fn parse_int<T: std::str::FromStr>(x: &str) -> Option<T> {
    x.parse().ok()
}

fn parse_id(x: &str) -> Option<u16> {
    let lower = x.to_lowercase();
    if let Some(hex) = lower.strip_prefix("0x") {
        u16::from_str_radix(hex, 16).ok()
    } else {
        lower.parse().ok()
    }
}

impl ResourceAddress {
    /// Create a new `ResourceAddress` by parsing the given resource string.
    /// Strings not following `TYPE[n]::ARG1[::ARG2[::ARG3[::ARG4]]]::INSTR` are rejected
    /// with a configuration error.
    pub fn parse(resource: &str) -> crate::Result<Self> {
        let splits = split_segments(resource).ok_or_else(|| invalid(resource))?;
        if splits.len() < 2 || splits.len() > MAX_ARGS + 2 {
            return Err(invalid(resource));
        }
        if !splits[splits.len() - 1].eq_ignore_ascii_case(RESOURCE_CLASS) {
            return Err(invalid(resource));
        }

        let prefix = splits[0];
        let idx = prefix
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or_else(|| prefix.len());
        let kind = ResourceKind::from_token(&prefix[..idx]).ok_or_else(|| invalid(resource))?;
        let board = if idx < prefix.len() {
            Some(parse_int::<u32>(&prefix[idx..]).ok_or_else(|| invalid(resource))?)
        } else {
            None
        };

        let args = &splits[1..splits.len() - 1];
        if !args.iter().all(|x| valid_arg(x)) {
            return Err(invalid(resource));
        }

        Ok(ResourceAddress {
            kind,
            board,
            args: args.iter().map(|x| x.to_string()).collect(),
            resource: resource.to_string(),
        })
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn board(&self) -> Option<u32> {
        self.board
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn as_str(&self) -> &str {
        &self.resource
    }

    fn expect_kind(&self, kind: ResourceKind) -> crate::Result<()> {
        if self.kind != kind {
            return Err(Error::configuration(anyhow!(
                "Resource `{}` is not a {} resource",
                self.resource,
                kind
            )));
        }
        Ok(())
    }

    /// `TCPIP[n]::host[::device]::INSTR`, the device defaults to `inst0`.
    pub fn lan(&self) -> crate::Result<LanAddress> {
        self.expect_kind(ResourceKind::Tcpip)?;
        let host = self.args.get(0).ok_or_else(|| invalid(&self.resource))?;
        let device = self
            .args
            .get(1)
            .cloned()
            .unwrap_or_else(|| DEFAULT_LAN_DEVICE.to_string());
        Ok(LanAddress {
            host: host.clone(),
            device,
        })
    }

    /// `USB[n]::vid::pid[::serial[::interface]]::INSTR`
    pub fn usb(&self) -> crate::Result<UsbAddress> {
        self.expect_kind(ResourceKind::Usb)?;
        if self.args.len() < 2 {
            return Err(invalid(&self.resource));
        }
        let vendor_id = parse_id(&self.args[0]).ok_or_else(|| invalid(&self.resource))?;
        let product_id = parse_id(&self.args[1]).ok_or_else(|| invalid(&self.resource))?;
        let interface = match self.args.get(3) {
            Some(x) => Some(parse_int::<u8>(x).ok_or_else(|| invalid(&self.resource))?),
            None => None,
        };
        Ok(UsbAddress {
            vendor_id,
            product_id,
            serial: self.args.get(2).cloned(),
            interface,
        })
    }

    /// `GPIB[board]::primary[::secondary]::INSTR`
    pub fn gpib(&self) -> crate::Result<GpibAddress> {
        self.expect_kind(ResourceKind::Gpib)?;
        let primary = self
            .args
            .get(0)
            .and_then(|x| parse_int::<u8>(x))
            .filter(|x| *x <= 30)
            .ok_or_else(|| invalid(&self.resource))?;
        let secondary = match self.args.get(1) {
            Some(x) => Some(
                parse_int::<u8>(x)
                    .filter(|x| *x <= 30)
                    .ok_or_else(|| invalid(&self.resource))?,
            ),
            None => None,
        };
        Ok(GpibAddress {
            board: self.board.unwrap_or(0),
            primary,
            secondary,
        })
    }

    /// `ASRL::port[,baud[,framing]]::INSTR` or `ASRLn::INSTR`.
    pub fn serial(&self) -> crate::Result<(String, SerialParams)> {
        self.expect_kind(ResourceKind::Asrl)?;
        let arg = match self.args.get(0) {
            Some(arg) => arg,
            None => {
                let board = self.board.ok_or_else(|| invalid(&self.resource))?;
                return Ok((default_serial_port(board), SerialParams::default()));
            }
        };
        let parts: Vec<&str> = arg.split(',').collect();
        if parts.len() > 3 || parts[0].is_empty() {
            return Err(invalid(&self.resource));
        }
        let baud = match parts.get(1) {
            Some(x) => parse_int::<u32>(x).ok_or_else(|| invalid(&self.resource))?,
            None => DEFAULT_BAUD,
        };
        let mut params = match parts.get(2) {
            Some(x) => SerialParams::from_framing(x)?,
            None => SerialParams::default(),
        };
        params.baud = baud;
        Ok((parts[0].to_string(), params))
    }
}

fn default_serial_port(board: u32) -> String {
    if cfg!(windows) {
        format!("COM{}", board)
    } else {
        format!("/dev/ttyS{}", board)
    }
}

impl Display for ResourceAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resource)
    }
}
