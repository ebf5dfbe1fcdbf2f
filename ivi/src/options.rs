/// Session options, set as a struct, key by key, from an IVI option string or through serde.
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptionKey {
    RangeCheck,
    QueryInstrStatus,
    Cache,
    Simulate,
    RecordCoercions,
    InterchangeCheck,
    DriverSetup,
    PreferGenericBackend,
    LenientBlocks,
}

impl OptionKey {
    /// Accepts both `range_check` and the IVI spelling `RangeCheck`, case-insensitive.
    pub fn from_name(name: &str) -> crate::Result<Self> {
        let normalized: String = name
            .trim()
            .chars()
            .filter(|c| *c != '_')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        let ret = match normalized.as_str() {
            "rangecheck" => OptionKey::RangeCheck,
            "queryinstrstatus" | "queryinstrumentstatus" => OptionKey::QueryInstrStatus,
            "cache" => OptionKey::Cache,
            "simulate" => OptionKey::Simulate,
            "recordcoercions" | "recordvaluecoercions" => OptionKey::RecordCoercions,
            "interchangecheck" => OptionKey::InterchangeCheck,
            "driversetup" => OptionKey::DriverSetup,
            "prefergenericbackend" => OptionKey::PreferGenericBackend,
            "lenientblocks" => OptionKey::LenientBlocks,
            _ => {
                return Err(Error::configuration(anyhow!("Unknown option `{}`", name)));
            }
        };
        Ok(ret)
    }
}

pub fn parse_bool(key: &str, value: &str) -> crate::Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(Error::configuration(anyhow!(
            "Invalid value `{}` for option `{}`",
            value,
            key
        ))),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionOptions {
    #[serde(alias = "RangeCheck")]
    pub range_check: bool,
    #[serde(alias = "QueryInstrStatus")]
    pub query_instr_status: bool,
    #[serde(alias = "Cache")]
    pub cache: bool,
    #[serde(alias = "Simulate")]
    pub simulate: bool,
    #[serde(alias = "RecordCoercions")]
    pub record_coercions: bool,
    #[serde(alias = "InterchangeCheck")]
    pub interchange_check: bool,
    #[serde(alias = "DriverSetup")]
    pub driver_setup: String,
    #[serde(alias = "PreferGenericBackend")]
    pub prefer_generic_backend: bool,
    /// Return truncated IEEE blocks instead of failing when the instrument sends less
    /// data than announced.
    #[serde(alias = "LenientBlocks")]
    pub lenient_blocks: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            range_check: true,
            query_instr_status: false,
            cache: true,
            simulate: false,
            record_coercions: false,
            interchange_check: false,
            driver_setup: String::new(),
            prefer_generic_backend: false,
            lenient_blocks: false,
        }
    }
}

impl SessionOptions {
    pub fn simulated() -> Self {
        Self {
            simulate: true,
            ..Default::default()
        }
    }

    pub fn set(&mut self, key: &str, value: &str) -> crate::Result<()> {
        let option = OptionKey::from_name(key)?;
        self.set_option(option, key, value)
    }

    fn set_option(&mut self, option: OptionKey, key: &str, value: &str) -> crate::Result<()> {
        let flag = match option {
            OptionKey::DriverSetup => {
                self.driver_setup = value.trim().to_string();
                return Ok(());
            }
            OptionKey::RangeCheck => &mut self.range_check,
            OptionKey::QueryInstrStatus => &mut self.query_instr_status,
            OptionKey::Cache => &mut self.cache,
            OptionKey::Simulate => &mut self.simulate,
            OptionKey::RecordCoercions => &mut self.record_coercions,
            OptionKey::InterchangeCheck => &mut self.interchange_check,
            OptionKey::PreferGenericBackend => &mut self.prefer_generic_backend,
            OptionKey::LenientBlocks => &mut self.lenient_blocks,
        };
        *flag = parse_bool(key, value)?;
        Ok(())
    }

    /// Parse an option string such as `Simulate=true, Cache=false, DriverSetup=Model:DPO5054`.
    ///
    /// Options not mentioned keep their defaults. `DriverSetup` consumes the remainder of the
    /// string, so its value may contain commas.
    pub fn parse(options: &str) -> crate::Result<Self> {
        let mut ret = Self::default();
        let mut rest = options.trim();
        while !rest.is_empty() {
            let (item, tail) = match rest.find(',') {
                Some(idx) => (&rest[..idx], &rest[idx + 1..]),
                None => (rest, ""),
            };
            let eq = item
                .find('=')
                .ok_or_else(|| Error::configuration(anyhow!("Invalid option `{}`", item.trim())))?;
            let key = item[..eq].trim();
            let option = OptionKey::from_name(key)?;
            if option == OptionKey::DriverSetup {
                let value = rest[eq + 1..].trim();
                ret.set_option(option, key, value)?;
                break;
            }
            ret.set_option(option, key, &item[eq + 1..])?;
            rest = tail.trim();
        }
        Ok(ret)
    }
}

impl FromStr for SessionOptions {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = SessionOptions::default();
        assert!(options.range_check);
        assert!(options.cache);
        assert!(!options.simulate);
        assert!(!options.query_instr_status);
        assert!(!options.record_coercions);
        assert!(!options.interchange_check);
        assert!(!options.prefer_generic_backend);
        assert!(!options.lenient_blocks);
        assert_eq!(options.driver_setup, "");
    }

    #[test]
    fn set_by_key() {
        let mut options = SessionOptions::default();
        options.set("simulate", "true").unwrap();
        options.set("RangeCheck", "0").unwrap();
        options.set("prefer_generic_backend", "TRUE").unwrap();
        options.set("driver_setup", "Model:DPO5054").unwrap();
        assert!(options.simulate);
        assert!(!options.range_check);
        assert!(options.prefer_generic_backend);
        assert_eq!(options.driver_setup, "Model:DPO5054");

        assert!(matches!(options.set("bogus", "1"), Err(Error::Configuration(_))));
        assert!(matches!(options.set("cache", "maybe"), Err(Error::Configuration(_))));
    }

    #[test]
    fn option_string() {
        let options: SessionOptions = "Simulate=true, Cache=false, DriverSetup=Model:DPO5054, Trace=1"
            .parse()
            .unwrap();
        assert!(options.simulate);
        assert!(!options.cache);
        assert!(options.range_check);
        assert_eq!(options.driver_setup, "Model:DPO5054, Trace=1");

        assert_eq!(SessionOptions::parse("").unwrap(), SessionOptions::default());
        assert_eq!(
            SessionOptions::parse(" query_instr_status = 1 ,").unwrap(),
            SessionOptions {
                query_instr_status: true,
                ..Default::default()
            }
        );
        assert!(SessionOptions::parse("Simulate").is_err());
        assert!(SessionOptions::parse("Unknown=1").is_err());
    }

    #[test]
    fn deserialize() {
        let options: SessionOptions =
            serde_json::from_str(r#"{"simulate": true, "DriverSetup": "x", "lenient_blocks": true}"#).unwrap();
        assert!(options.simulate);
        assert!(options.lenient_blocks);
        assert!(options.cache);
        assert_eq!(options.driver_setup, "x");

        assert!(serde_json::from_str::<SessionOptions>(r#"{"bogus": true}"#).is_err());
    }
}
