/// Inherent driver state shared by all instrument classes: operation options with the
/// coercion and interchange logs, and the identity of driver and instrument.
use std::collections::VecDeque;

use ivi_protocol::scpi::Idn;

use crate::options::{parse_bool, OptionKey, SessionOptions};
use crate::session::Session;
use crate::Error;

pub const UNKNOWN_INSTRUMENT: &str = "Cannot query from instrument";
pub const SIMULATED_IDENTITY: &str = "Not available while simulating";

#[derive(Debug, Clone, Default)]
pub struct OperationState {
    options: SessionOptions,
    coercion_records: VecDeque<String>,
    interchange_warnings: VecDeque<String>,
    io_resource_descriptor: String,
}

impl OperationState {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Set an option by name. Turning simulation off once it was on is rejected.
    pub fn set_option(&mut self, key: &str, value: &str) -> crate::Result<()> {
        match OptionKey::from_name(key)? {
            OptionKey::Simulate => self.set_simulate(parse_bool(key, value)?),
            _ => self.options.set(key, value),
        }
    }

    pub fn range_check(&self) -> bool {
        self.options.range_check
    }

    pub fn set_range_check(&mut self, value: bool) {
        self.options.range_check = value;
    }

    pub fn query_instr_status(&self) -> bool {
        self.options.query_instr_status
    }

    pub fn set_query_instr_status(&mut self, value: bool) {
        self.options.query_instr_status = value;
    }

    pub fn cache(&self) -> bool {
        self.options.cache
    }

    pub fn set_cache(&mut self, value: bool) {
        self.options.cache = value;
    }

    pub fn simulate(&self) -> bool {
        self.options.simulate
    }

    pub fn set_simulate(&mut self, value: bool) -> crate::Result<()> {
        if self.options.simulate && !value {
            return Err(Error::SimulationState);
        }
        self.options.simulate = value;
        Ok(())
    }

    pub fn record_coercions(&self) -> bool {
        self.options.record_coercions
    }

    pub fn set_record_coercions(&mut self, value: bool) {
        self.options.record_coercions = value;
    }

    pub fn interchange_check(&self) -> bool {
        self.options.interchange_check
    }

    pub fn set_interchange_check(&mut self, value: bool) {
        self.options.interchange_check = value;
    }

    pub fn driver_setup(&self) -> &str {
        &self.options.driver_setup
    }

    pub fn prefer_generic_backend(&self) -> bool {
        self.options.prefer_generic_backend
    }

    pub fn lenient_blocks(&self) -> bool {
        self.options.lenient_blocks
    }

    pub fn io_resource_descriptor(&self) -> &str {
        &self.io_resource_descriptor
    }

    pub(crate) fn set_io_resource_descriptor(&mut self, resource: String) {
        self.io_resource_descriptor = resource;
    }

    /// Remember that `attribute` was coerced from `desired` to `coerced`, if recording is enabled.
    pub fn record_coercion(&mut self, attribute: &str, desired: f64, coerced: f64) {
        if !self.options.record_coercions {
            return;
        }
        self.coercion_records.push_back(format!(
            "Attribute {} was coerced from {} to {}",
            attribute, desired, coerced
        ));
    }

    /// Removes and returns the oldest coercion record, or an empty string.
    pub fn next_coercion_record(&mut self) -> String {
        self.coercion_records.pop_front().unwrap_or_default()
    }

    pub fn add_interchange_warning<T: Into<String>>(&mut self, warning: T) {
        if self.options.interchange_check {
            self.interchange_warnings.push_back(warning.into());
        }
    }

    /// Removes and returns the oldest interchange warning, or an empty string.
    pub fn next_interchange_warning(&mut self) -> String {
        self.interchange_warnings.pop_front().unwrap_or_default()
    }

    pub fn clear_interchange_warnings(&mut self) {
        self.interchange_warnings.clear();
    }

    /// Warnings already recorded are kept.
    pub fn reset_interchange_check(&mut self) {
        log::debug!("Interchange check reset");
    }

    /// Validate `value` against `[min, max]` unless range checking is disabled.
    pub fn check_range(&self, name: &str, value: f64, min: f64, max: f64) -> crate::Result<()> {
        if !self.options.range_check || (min..=max).contains(&value) {
            return Ok(());
        }
        Err(Error::OutOfRange {
            name: name.to_string(),
            value,
            min,
            max,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentityInfo {
    pub description: String,
    pub identifier: String,
    pub revision: String,
    pub vendor: String,
    pub instrument_manufacturer: String,
    pub instrument_model: String,
    pub instrument_serial_number: String,
    pub instrument_firmware_revision: String,
    pub specification_major_version: u32,
    pub specification_minor_version: u32,
    pub supported_instrument_models: Vec<String>,
    pub group_capabilities: Vec<String>,
}

impl Default for IdentityInfo {
    fn default() -> Self {
        Self {
            description: "Base IVI Driver".to_string(),
            identifier: String::new(),
            revision: String::new(),
            vendor: String::new(),
            instrument_manufacturer: UNKNOWN_INSTRUMENT.to_string(),
            instrument_model: UNKNOWN_INSTRUMENT.to_string(),
            instrument_serial_number: UNKNOWN_INSTRUMENT.to_string(),
            instrument_firmware_revision: UNKNOWN_INSTRUMENT.to_string(),
            specification_major_version: 0,
            specification_minor_version: 0,
            supported_instrument_models: Vec::new(),
            group_capabilities: Vec::new(),
        }
    }
}

impl IdentityInfo {
    pub fn update_from_idn(&mut self, idn: &Idn) {
        self.instrument_manufacturer = idn.manufacturer.clone();
        self.instrument_model = idn.model.clone();
        self.instrument_serial_number = idn.serial.clone();
        self.instrument_firmware_revision = idn.firmware.clone();
    }

    /// Most recently added capabilities are listed first.
    pub fn add_group_capability<T: Into<String>>(&mut self, name: T) {
        self.group_capabilities.insert(0, name.into());
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.supported_instrument_models.is_empty()
            || self
                .supported_instrument_models
                .iter()
                .any(|x| x.eq_ignore_ascii_case(model))
    }
}

/// Implemented by per-model drivers. Capability groups are further traits with `Driver`
/// as supertrait, so whether a model offers a group is known at compile time.
pub trait Driver {
    fn session(&self) -> &Session;

    fn session_mut(&mut self) -> &mut Session;

    fn identity(&self) -> &IdentityInfo {
        self.session().identity()
    }

    fn initialized(&self) -> bool {
        self.session().initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulation_cannot_be_disabled() {
        let mut state = OperationState::default();
        state.set_simulate(false).unwrap();
        state.set_simulate(true).unwrap();
        state.set_simulate(true).unwrap();
        assert!(matches!(state.set_simulate(false), Err(Error::SimulationState)));
        assert!(matches!(state.set_option("Simulate", "0"), Err(Error::SimulationState)));
        assert!(state.simulate());
    }

    #[test]
    fn coercion_records() {
        let mut state = OperationState::default();
        state.record_coercion("vertical_range", 9.0, 10.0);
        assert_eq!(state.next_coercion_record(), "");

        state.set_record_coercions(true);
        state.record_coercion("vertical_range", 9.0, 10.0);
        state.record_coercion("vertical_offset", 0.11, 0.1);
        assert_eq!(
            state.next_coercion_record(),
            "Attribute vertical_range was coerced from 9 to 10"
        );
        assert_eq!(
            state.next_coercion_record(),
            "Attribute vertical_offset was coerced from 0.11 to 0.1"
        );
        assert_eq!(state.next_coercion_record(), "");
    }

    #[test]
    fn interchange_warnings() {
        let mut state = OperationState::default();
        state.add_interchange_warning("ignored");
        assert_eq!(state.next_interchange_warning(), "");

        state.set_interchange_check(true);
        state.add_interchange_warning("first");
        state.add_interchange_warning("second");
        state.reset_interchange_check();
        assert_eq!(state.next_interchange_warning(), "first");
        state.clear_interchange_warnings();
        assert_eq!(state.next_interchange_warning(), "");
    }

    #[test]
    fn range_checks() {
        let mut state = OperationState::default();
        assert!(state.check_range("channel_offset", 1.0, -5.0, 5.0).is_ok());
        let err = state.check_range("channel_offset", 6.0, -5.0, 5.0).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { .. }));
        assert!(err.to_string().contains("channel_offset"));
        state.set_range_check(false);
        assert!(state.check_range("channel_offset", 6.0, -5.0, 5.0).is_ok());
    }

    #[test]
    fn identity() {
        let mut identity = IdentityInfo::default();
        assert_eq!(identity.instrument_model, UNKNOWN_INSTRUMENT);
        assert!(identity.supports_model("DPO5054"));

        let idn = Idn::parse("TEKTRONIX,DPO5054,C012345,CF:91.1CT FV:v6.3.0").unwrap();
        identity.update_from_idn(&idn);
        assert_eq!(identity.instrument_manufacturer, "TEKTRONIX");
        assert_eq!(identity.instrument_model, "DPO5054");
        assert_eq!(identity.instrument_serial_number, "C012345");

        identity.supported_instrument_models = vec!["DPO5034".to_string(), "DPO5054".to_string()];
        assert!(identity.supports_model("dpo5054"));
        assert!(!identity.supports_model("MSO2024"));

        identity.add_group_capability("IviScopeBase");
        identity.add_group_capability("IviScopeWaveformMeas");
        assert_eq!(identity.group_capabilities[0], "IviScopeWaveformMeas");
    }
}
