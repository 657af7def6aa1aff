//! Device family specific knowledge: which parameters the server
//! accepts, how to interpret the raw parameters, and how to express
//! the mutation surface as parameter changes.

use crate::classify::DeviceType;
use crate::cloud_api::{value_as_string, JsonMap};
use crate::endpoints::{EndpointCandidate, AIR_CONDITIONER_CANDIDATES, HUMIDIFIER_CANDIDATES};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

pub mod aircon;
pub mod humidifier;

use aircon::{ControllerModel, DEFAULT_CONTROLLER_MODEL};
use humidifier::HumidifierMode;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum CommandError {
    #[error("{op} is not supported by {device_type} devices")]
    Unsupported {
        op: &'static str,
        device_type: DeviceType,
    },
    #[error("unknown mode '{0}'")]
    UnknownMode(String),
    #[error("unknown fan mode '{0}'")]
    UnknownFanMode(String),
    #[error("unknown controller model '{0}'")]
    UnknownControllerModel(String),
    #[error("{value} is out of range {min}..={max}")]
    OutOfRange { value: f64, min: f64, max: f64 },
}

/// Where the values in a DeviceState came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateTier {
    /// Nothing has been read from the server yet
    Initial,
    /// Parsed from the most recent successful read
    Confirmed,
    /// Applied locally after a write; replaced by the next read
    Provisional,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceState {
    pub is_on: bool,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_humidity: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_humidity: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_mode: Option<String>,
    pub last_raw_params: JsonMap,
    pub tier: StateTier,
    pub updated: DateTime<Utc>,
}

impl DeviceState {
    /// True if the user-visible values and raw parameters match,
    /// disregarding provenance and timestamps.
    pub fn same_values(&self, other: &Self) -> bool {
        self.is_on == other.is_on
            && self.mode == other.mode
            && self.target_humidity == other.target_humidity
            && self.current_humidity == other.current_humidity
            && self.target_temperature == other.target_temperature
            && self.current_temperature == other.current_temperature
            && self.fan_mode == other.fan_mode
            && self.last_raw_params == other.last_raw_params
    }
}

/// Returns an integer for numeric or numeric-string parameters
pub fn param_i64(params: &JsonMap, key: &str) -> Option<i64> {
    match params.get(key)? {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        JsonValue::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

/// Returns a float for numeric or numeric-string parameters
pub fn param_f64(params: &JsonMap, key: &str) -> Option<f64> {
    match params.get(key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Returns the value of the first of `keys` that is present and non-null.
/// Different firmware revisions report the same reading under
/// different names.
pub fn first_present<'a>(params: &'a JsonMap, keys: &[&str]) -> Option<(&'a str, &'a JsonValue)> {
    keys.iter().find_map(|key| {
        params
            .get_key_value(*key)
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.as_str(), v))
    })
}

fn json_as_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        other => value_as_string(other)?.trim().parse().ok(),
    }
}

/// Behavior that varies by device family
#[derive(Clone, Copy, Debug)]
pub enum DeviceProfile {
    Humidifier,
    AirConditioner(&'static ControllerModel),
}

impl DeviceProfile {
    pub fn new(device_type: DeviceType, controller_model: Option<&str>) -> Result<Self, CommandError> {
        match device_type {
            DeviceType::Humidifier => Ok(Self::Humidifier),
            DeviceType::AirConditioner => {
                let id = controller_model.unwrap_or(DEFAULT_CONTROLLER_MODEL);
                aircon::controller_model(id)
                    .map(Self::AirConditioner)
                    .ok_or_else(|| CommandError::UnknownControllerModel(id.to_string()))
            }
        }
    }

    pub fn device_type(&self) -> DeviceType {
        match self {
            Self::Humidifier => DeviceType::Humidifier,
            Self::AirConditioner(_) => DeviceType::AirConditioner,
        }
    }

    /// The parameter keys that may be sent in a write
    pub fn allowed_keys(&self) -> &'static [&'static str] {
        match self {
            Self::Humidifier => humidifier::ALLOWED_KEYS,
            Self::AirConditioner(_) => aircon::ALLOWED_KEYS,
        }
    }

    /// The values accepted by `mode_changes`
    pub fn modes(&self) -> Vec<String> {
        use strum::IntoEnumIterator;
        match self {
            Self::Humidifier => HumidifierMode::iter().map(|m| m.to_string()).collect(),
            Self::AirConditioner(model) => {
                model.hvac_modes().iter().map(|m| m.to_string()).collect()
            }
        }
    }

    /// The values accepted by `fan_changes`
    pub fn fan_modes(&self) -> Vec<String> {
        match self {
            Self::Humidifier => vec![],
            Self::AirConditioner(model) => {
                model.fan_modes().iter().map(|m| m.to_string()).collect()
            }
        }
    }

    pub fn endpoint_candidates(&self) -> &'static [EndpointCandidate] {
        match self {
            Self::Humidifier => HUMIDIFIER_CANDIDATES,
            Self::AirConditioner(_) => AIR_CONDITIONER_CANDIDATES,
        }
    }

    pub fn initial_state(&self) -> DeviceState {
        let mut state = DeviceState {
            is_on: false,
            mode: String::new(),
            target_humidity: None,
            current_humidity: None,
            target_temperature: None,
            current_temperature: None,
            fan_mode: None,
            last_raw_params: JsonMap::new(),
            tier: StateTier::Initial,
            updated: Utc::now(),
        };
        match self {
            Self::Humidifier => humidifier::init_state(&mut state),
            Self::AirConditioner(model) => aircon::init_state(model, &mut state),
        }
        state
    }

    /// Interprets `params` on top of `prior`, producing a complete
    /// replacement state. Fields that cannot be interpreted retain
    /// their prior values.
    pub fn apply_params(&self, prior: &DeviceState, params: &JsonMap, tier: StateTier) -> DeviceState {
        let mut state = prior.clone();
        match self {
            Self::Humidifier => humidifier::apply_params(&mut state, params),
            Self::AirConditioner(model) => aircon::apply_params(model, &mut state, params),
        }
        state.last_raw_params = params.clone();
        state.tier = tier;
        state.updated = Utc::now();
        state
    }

    /// Restricts `params` to the keys the server accepts for this family
    pub fn filter_params(&self, params: &JsonMap) -> JsonMap {
        let allowed = self.allowed_keys();
        params
            .iter()
            .filter(|(k, _)| allowed.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn power_changes(&self, on: bool) -> JsonMap {
        let mut changes = JsonMap::new();
        changes.insert("runStatus".to_string(), JsonValue::from(if on { 1 } else { 0 }));
        changes
    }

    pub fn mode_changes(&self, mode: &str) -> Result<JsonMap, CommandError> {
        match self {
            Self::Humidifier => humidifier::mode_changes(mode),
            Self::AirConditioner(model) => aircon::mode_changes(model, mode),
        }
    }

    pub fn humidity_changes(&self, humidity: u8) -> Result<JsonMap, CommandError> {
        match self {
            Self::Humidifier => humidifier::humidity_changes(humidity),
            Self::AirConditioner(_) => Err(CommandError::Unsupported {
                op: "set_humidity",
                device_type: self.device_type(),
            }),
        }
    }

    pub fn temperature_changes(&self, celsius: f64) -> Result<JsonMap, CommandError> {
        match self {
            Self::AirConditioner(model) => aircon::temperature_changes(model, celsius),
            Self::Humidifier => Err(CommandError::Unsupported {
                op: "set_temperature",
                device_type: self.device_type(),
            }),
        }
    }

    pub fn fan_changes(&self, fan: &str) -> Result<JsonMap, CommandError> {
        match self {
            Self::AirConditioner(model) => aircon::fan_changes(model, fan),
            Self::Humidifier => Err(CommandError::Unsupported {
                op: "set_fan_mode",
                device_type: self.device_type(),
            }),
        }
    }
}
