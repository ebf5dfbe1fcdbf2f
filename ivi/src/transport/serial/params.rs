use core::fmt;
use std::fmt::{Display, Formatter};

use anyhow::anyhow;

#[derive(Debug, PartialEq, Clone, Copy, Hash)]
pub enum StopBits {
    One,
    Two,
}

#[derive(Debug, PartialEq, Clone, Copy, Hash)]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, PartialEq, Clone, Copy, Hash)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

fn invalid_framing(settings: &str) -> crate::Error {
    crate::Error::configuration(anyhow!("Invalid serial framing `{}`", settings))
}

/// Parse a framing string such as `8N1` into its components.
pub fn parse_serial_settings(settings: &str) -> crate::Result<(DataBits, Parity, StopBits)> {
    let lower = settings.to_lowercase();
    let chars = lower.as_bytes();
    if chars.len() != 3 {
        return Err(invalid_framing(settings));
    }
    let data_bits = match chars[0] as char {
        '8' => DataBits::Eight,
        '7' => DataBits::Seven,
        '6' => DataBits::Six,
        '5' => DataBits::Five,
        _ => return Err(invalid_framing(settings)),
    };
    let parity = match chars[1] as char {
        'n' => Parity::None,
        'o' => Parity::Odd,
        'e' => Parity::Even,
        _ => return Err(invalid_framing(settings)),
    };
    let stop_bits = match chars[2] as char {
        '1' => StopBits::One,
        '2' => StopBits::Two,
        _ => return Err(invalid_framing(settings)),
    };
    Ok((data_bits, parity, stop_bits))
}

#[derive(Debug, PartialEq, Clone, Hash)]
pub struct SerialParams {
    pub baud: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

impl Default for SerialParams {
    fn default() -> Self {
        SerialParams {
            baud: 9600,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
        }
    }
}

impl SerialParams {
    /// Default baud rate with the given framing.
    pub fn from_framing(settings: &str) -> crate::Result<SerialParams> {
        let (data_bits, parity, stop_bits) = parse_serial_settings(settings)?;
        Ok(SerialParams {
            data_bits,
            parity,
            stop_bits,
            ..Default::default()
        })
    }
}

impl Display for SerialParams {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{}{}{}",
            self.baud, self.data_bits, self.parity, self.stop_bits
        )
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(x: StopBits) -> Self {
        match x {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(x: Parity) -> Self {
        match x {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

impl From<DataBits> for serialport::DataBits {
    fn from(x: DataBits) -> Self {
        match x {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

impl Display for DataBits {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let x = match self {
            DataBits::Five => "5",
            DataBits::Six => "6",
            DataBits::Seven => "7",
            DataBits::Eight => "8",
        };
        f.write_str(x)
    }
}

impl Display for Parity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let x = match self {
            Parity::None => "N",
            Parity::Odd => "O",
            Parity::Even => "E",
        };
        f.write_str(x)
    }
}

impl Display for StopBits {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let x = match self {
            StopBits::One => "1",
            StopBits::Two => "2",
        };
        f.write_str(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing() {
        let params = SerialParams::from_framing("5E2").unwrap();
        assert_eq!(params.data_bits, DataBits::Five);
        assert_eq!(params.parity, Parity::Even);
        assert_eq!(params.stop_bits, StopBits::Two);
        assert_eq!(params.baud, 9600);
        assert_eq!(params.to_string(), "9600,5E2");

        assert!(SerialParams::from_framing("9N1").is_err());
        assert!(SerialParams::from_framing("8X1").is_err());
        assert!(SerialParams::from_framing("8N3").is_err());
        assert!(SerialParams::from_framing("8N").is_err());
    }
}
