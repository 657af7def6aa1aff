use super::{first_present, json_as_f64, param_f64, param_i64, CommandError, DeviceState};
use crate::cloud_api::JsonMap;
use once_cell::sync::Lazy;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::str::FromStr;

pub const DEFAULT_CONTROLLER_MODEL: &str = "CZ-RD501DW2";

pub const MIN_TEMPERATURE: f64 = 16.;
pub const MAX_TEMPERATURE: f64 = 30.;

pub const CURRENT_TEMPERATURE_KEYS: &[&str] = &[
    "insideTemperature",
    "currentTemperature",
    "indoorTemperature",
];

/// Keys that air conditioner firmware accepts in a write
pub const ALLOWED_KEYS: &[&str] = &[
    "runStatus",
    "runMode",
    "setTemperature",
    "windSet",
    "muteMode",
    "windDirection",
    "windDirectionHorizon",
    "nanoe",
    "ecoMode",
    "strongMode",
    "sleepMode",
];

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum HvacMode {
    Off,
    Auto,
    Cool,
    Heat,
    Dry,
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FanMode {
    Auto,
    Min,
    Low,
    Medium,
    High,
    Max,
    Quiet,
}

/// The wired controller determines the codes used for modes and
/// fan speeds, and the scale of the temperature values.
#[derive(Debug)]
pub struct ControllerModel {
    pub id: &'static str,
    pub name: &'static str,
    /// wire value = degrees celsius * temp_scale
    pub temp_scale: f64,
    pub hvac: &'static [(HvacMode, i64)],
    pub fan: &'static [(FanMode, i64)],
    /// Fan modes that need more than a windSet code
    pub fan_overrides: &'static [(FanMode, &'static [(&'static str, i64)])],
}

impl ControllerModel {
    pub fn hvac_code(&self, mode: HvacMode) -> Option<i64> {
        self.hvac
            .iter()
            .find(|(m, _)| *m == mode)
            .map(|(_, code)| *code)
    }

    pub fn hvac_mode(&self, code: i64) -> Option<HvacMode> {
        self.hvac.iter().find(|(_, c)| *c == code).map(|(m, _)| *m)
    }

    pub fn fan_code(&self, fan: FanMode) -> Option<i64> {
        self.fan.iter().find(|(f, _)| *f == fan).map(|(_, code)| *code)
    }

    pub fn fan_override(&self, fan: FanMode) -> Option<&'static [(&'static str, i64)]> {
        self.fan_overrides
            .iter()
            .find(|(f, _)| *f == fan)
            .map(|(_, params)| *params)
    }

    pub fn hvac_modes(&self) -> Vec<HvacMode> {
        let mut modes = vec![HvacMode::Off];
        modes.extend(self.hvac.iter().map(|(m, _)| *m));
        modes
    }

    pub fn fan_modes(&self) -> Vec<FanMode> {
        let mut modes: Vec<FanMode> = self.fan.iter().map(|(f, _)| *f).collect();
        modes.extend(self.fan_overrides.iter().map(|(f, _)| *f));
        modes
    }
}

static CONTROLLER_MODELS: Lazy<HashMap<&'static str, ControllerModel>> =
    Lazy::new(load_controller_models);

fn load_controller_models() -> HashMap<&'static str, ControllerModel> {
    let mut map = HashMap::new();
    for model in [ControllerModel {
        // Ducted unit wired controller
        id: "CZ-RD501DW2",
        name: "Panasonic ducted unit wired controller CZ-RD501DW2",
        temp_scale: 2.,
        hvac: &[
            (HvacMode::Cool, 3),
            (HvacMode::Heat, 4),
            (HvacMode::Dry, 2),
            (HvacMode::Auto, 0),
        ],
        fan: &[
            (FanMode::Auto, 10),
            (FanMode::Min, 3),
            (FanMode::Low, 4),
            (FanMode::Medium, 5),
            (FanMode::High, 6),
            (FanMode::Max, 7),
        ],
        fan_overrides: &[(FanMode::Quiet, &[("windSet", 10), ("muteMode", 1)])],
    }] {
        map.insert(model.id, model);
    }
    map
}

pub fn controller_model(id: &str) -> Option<&'static ControllerModel> {
    CONTROLLER_MODELS.get(id)
}

/// Returns the supported controller models, sorted by id
pub fn controller_models() -> Vec<&'static ControllerModel> {
    let mut models: Vec<_> = CONTROLLER_MODELS.values().collect();
    models.sort_by_key(|m| m.id);
    models
}

pub(super) fn init_state(_model: &ControllerModel, state: &mut DeviceState) {
    state.mode = HvacMode::Off.to_string();
    state.fan_mode = Some(FanMode::Auto.to_string());
}

pub(super) fn apply_params(model: &ControllerModel, state: &mut DeviceState, params: &JsonMap) {
    state.is_on = param_i64(params, "runStatus").unwrap_or(0) == 1;

    let mode = if state.is_on {
        param_i64(params, "runMode")
            .and_then(|code| model.hvac_mode(code))
            .unwrap_or(HvacMode::Auto)
    } else {
        HvacMode::Off
    };
    state.mode = mode.to_string();

    if let Some(raw) = param_f64(params, "setTemperature") {
        state.target_temperature = Some(raw / model.temp_scale);
    }

    let muted = param_i64(params, "muteMode") == Some(1);
    let fan = model
        .fan_overrides
        .iter()
        .find(|(_, overrides)| {
            muted
                && overrides
                    .iter()
                    .all(|(key, value)| param_i64(params, key) == Some(*value))
        })
        .map(|(fan, _)| *fan)
        .or_else(|| {
            let code = param_i64(params, "windSet")?;
            model.fan.iter().find(|(_, c)| *c == code).map(|(f, _)| *f)
        });
    if let Some(fan) = fan {
        state.fan_mode = Some(fan.to_string());
    }

    if let Some((key, value)) = first_present(params, CURRENT_TEMPERATURE_KEYS) {
        match json_as_f64(value) {
            Some(current) => state.current_temperature = Some(current),
            None => log::debug!("ignoring unparseable {key}={value}"),
        }
    }
}

pub(super) fn mode_changes(model: &ControllerModel, mode: &str) -> Result<JsonMap, CommandError> {
    let mode = HvacMode::from_str(mode).map_err(|_| CommandError::UnknownMode(mode.to_string()))?;
    let mut changes = JsonMap::new();
    if mode == HvacMode::Off {
        changes.insert("runStatus".to_string(), JsonValue::from(0));
        return Ok(changes);
    }
    let code = model
        .hvac_code(mode)
        .ok_or_else(|| CommandError::UnknownMode(mode.to_string()))?;
    changes.insert("runStatus".to_string(), JsonValue::from(1));
    changes.insert("runMode".to_string(), JsonValue::from(code));
    Ok(changes)
}

pub(super) fn temperature_changes(
    model: &ControllerModel,
    celsius: f64,
) -> Result<JsonMap, CommandError> {
    if !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&celsius) {
        return Err(CommandError::OutOfRange {
            value: celsius,
            min: MIN_TEMPERATURE,
            max: MAX_TEMPERATURE,
        });
    }
    let raw = (celsius * model.temp_scale).round() as i64;
    let mut changes = JsonMap::new();
    changes.insert("setTemperature".to_string(), JsonValue::from(raw));
    Ok(changes)
}

pub(super) fn fan_changes(model: &ControllerModel, fan: &str) -> Result<JsonMap, CommandError> {
    let fan = FanMode::from_str(fan).map_err(|_| CommandError::UnknownFanMode(fan.to_string()))?;
    let mut changes = JsonMap::new();
    if let Some(overrides) = model.fan_override(fan) {
        for (key, value) in overrides {
            changes.insert(key.to_string(), JsonValue::from(*value));
        }
        return Ok(changes);
    }
    let code = model
        .fan_code(fan)
        .ok_or_else(|| CommandError::UnknownFanMode(fan.to_string()))?;
    changes.insert("windSet".to_string(), JsonValue::from(code));
    changes.insert("muteMode".to_string(), JsonValue::from(0));
    Ok(changes)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::appliance::{DeviceProfile, StateTier};
    use serde_json::json;

    fn model() -> &'static ControllerModel {
        controller_model(DEFAULT_CONTROLLER_MODEL).unwrap()
    }

    fn parse(value: JsonValue) -> DeviceState {
        let profile = DeviceProfile::AirConditioner(model());
        let params = match value {
            JsonValue::Object(map) => map,
            _ => unreachable!(),
        };
        profile.apply_params(&profile.initial_state(), &params, StateTier::Confirmed)
    }

    #[test]
    fn parse_status() {
        let state = parse(json!({
            "runStatus": 1,
            "runMode": 3,
            "setTemperature": 52,
            "windSet": 5,
            "muteMode": 0,
            "insideTemperature": 27.5,
        }));
        assert!(state.is_on);
        assert_eq!(state.mode, "cool");
        assert_eq!(state.target_temperature, Some(26.));
        assert_eq!(state.fan_mode.as_deref(), Some("medium"));
        assert_eq!(state.current_temperature, Some(27.5));
    }

    #[test]
    fn parse_quiet_and_off() {
        let state = parse(json!({"runStatus": 0, "runMode": 4, "windSet": 10, "muteMode": 1}));
        assert!(!state.is_on);
        assert_eq!(state.mode, "off");
        assert_eq!(state.fan_mode.as_deref(), Some("quiet"));

        let state = parse(json!({"runStatus": 1, "runMode": 99, "windSet": 10, "muteMode": 0}));
        assert_eq!(state.mode, "auto");
        assert_eq!(state.fan_mode.as_deref(), Some("auto"));
    }

    #[test]
    fn commands() {
        let m = model();
        assert_eq!(
            serde_json::Value::Object(mode_changes(m, "heat").unwrap()),
            json!({"runStatus": 1, "runMode": 4})
        );
        assert_eq!(
            serde_json::Value::Object(mode_changes(m, "off").unwrap()),
            json!({"runStatus": 0})
        );
        assert_eq!(
            serde_json::Value::Object(fan_changes(m, "quiet").unwrap()),
            json!({"windSet": 10, "muteMode": 1})
        );
        assert_eq!(
            serde_json::Value::Object(fan_changes(m, "High").unwrap()),
            json!({"windSet": 6, "muteMode": 0})
        );
        assert_eq!(
            serde_json::Value::Object(temperature_changes(m, 24.5).unwrap()),
            json!({"setTemperature": 49})
        );
        assert!(temperature_changes(m, 40.).is_err());
        assert!(fan_changes(m, "turbo").is_err());
    }

    #[test]
    fn model_listing() {
        let m = model();
        assert_eq!(m.hvac_modes().len(), 5);
        assert!(m.fan_modes().contains(&FanMode::Quiet));
        assert_eq!(controller_models().len(), 1);
    }
}
