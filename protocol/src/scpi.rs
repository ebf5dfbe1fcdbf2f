/// IEEE 488.2 common commands and parsers for their replies.
use std::convert::TryFrom;

use crate::Error;

pub const READ_STATUS_BYTE: &str = "*STB?";
pub const TRIGGER: &str = "*TRG";
pub const CLEAR_STATUS: &str = "*CLS";
pub const IDENTIFY: &str = "*IDN?";
pub const RESET: &str = "*RST";
pub const SELF_TEST: &str = "*TST?";
pub const ERROR_QUERY: &str = ":SYST:ERR?";

/// Reply of `*IDN?`: manufacturer, model, serial number and firmware revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Idn {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

impl Idn {
    pub fn parse(reply: &str) -> crate::Result<Self> {
        let splits: Vec<_> = reply.trim().splitn(4, ',').map(|x| x.trim()).collect();
        if splits.len() != 4 || splits[0].is_empty() {
            return Err(Error::unexpected_response(reply));
        }
        Ok(Idn {
            manufacturer: splits[0].to_string(),
            model: splits[1].to_string(),
            serial: splits[2].to_string(),
            firmware: splits[3].to_string(),
        })
    }
}

/// Parse an integer reply such as the answer to `*STB?` or `*TST?`.
pub fn parse_int(reply: &str) -> crate::Result<i64> {
    let reply = reply.trim();
    if let Ok(x) = reply.parse::<i64>() {
        return Ok(x);
    }
    // some instruments answer `+0.000E+00`
    reply
        .parse::<f64>()
        .ok()
        .filter(|x| x.fract() == 0.0)
        .map(|x| x as i64)
        .ok_or_else(|| Error::unexpected_response(reply))
}

/// Parse an error queue entry of the form `-113,"Undefined header"`.
pub fn parse_error_entry(reply: &str) -> crate::Result<(i32, String)> {
    let reply = reply.trim();
    let (code, message) = match reply.find(',') {
        Some(idx) => (&reply[..idx], &reply[idx + 1..]),
        None => (reply, ""),
    };
    let code = i32::try_from(parse_int(code)?).map_err(|_| Error::unexpected_response(reply))?;
    let message = message.trim().trim_matches('"').to_string();
    Ok((code, message))
}

/// Split a delimited list of numbers, as returned by many SCPI queries.
pub fn parse_values(reply: &str, delim: char) -> crate::Result<Vec<f64>> {
    let reply = reply.trim();
    if reply.is_empty() {
        return Ok(Vec::new());
    }
    reply
        .split(delim)
        .map(|x| {
            let x = x.trim();
            x.parse::<f64>().map_err(|_| Error::unexpected_response(x))
        })
        .collect()
}
