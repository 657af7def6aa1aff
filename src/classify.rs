use crate::cloud_api::DeviceInfo;
use serde::{Deserialize, Serialize};

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
pub enum DeviceType {
    #[serde(rename = "ac")]
    #[strum(to_string = "ac", serialize = "aircon", ascii_case_insensitive)]
    AirConditioner,
    #[serde(rename = "humidifier")]
    #[strum(serialize = "humidifier", ascii_case_insensitive)]
    Humidifier,
}

impl DeviceType {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AirConditioner => "Air Conditioner",
            Self::Humidifier => "Humidifier",
        }
    }
}

/// Product family marker embedded in humidifier identifiers
pub const HUMIDIFIER_MARKER: &str = "_0840_";
/// Product family marker embedded in air conditioner identifiers
pub const AIR_CONDITIONER_MARKER: &str = "_0900_";

const HUMIDIFIER_NAME_KEYWORDS: &[&str] = &["加湿", "humidifier", "hum", "湿度", "aircle"];
const HUMIDIFIER_ID_PREFIXES: &[&str] = &["fv", "hum", "fvrzm", "fvrjm"];

type Rule = fn(&str, &DeviceInfo) -> bool;

/// Classification rules in priority order; first match wins.
/// Identifier markers are the most reliable signal, the name and
/// prefix heuristics cover identifiers that deviate from the usual form.
const RULES: &[(Rule, DeviceType)] = &[
    (id_has_humidifier_marker, DeviceType::Humidifier),
    (id_has_air_conditioner_marker, DeviceType::AirConditioner),
    (name_has_humidifier_keyword, DeviceType::Humidifier),
    (id_has_humidifier_prefix, DeviceType::Humidifier),
];

fn id_has_humidifier_marker(device_id: &str, _info: &DeviceInfo) -> bool {
    device_id.to_uppercase().contains(HUMIDIFIER_MARKER)
}

fn id_has_air_conditioner_marker(device_id: &str, _info: &DeviceInfo) -> bool {
    device_id.to_uppercase().contains(AIR_CONDITIONER_MARKER)
}

fn name_has_humidifier_keyword(_device_id: &str, info: &DeviceInfo) -> bool {
    let name = info.device_name.to_lowercase();
    HUMIDIFIER_NAME_KEYWORDS.iter().any(|kw| name.contains(kw))
}

fn id_has_humidifier_prefix(device_id: &str, _info: &DeviceInfo) -> bool {
    let id = device_id.to_lowercase();
    HUMIDIFIER_ID_PREFIXES.iter().any(|p| id.starts_with(p))
}

/// Decide whether a device is an air conditioner or a humidifier.
/// Total; devices that match no rule are air conditioners.
pub fn classify(device_id: &str, info: &DeviceInfo) -> DeviceType {
    RULES
        .iter()
        .find(|(rule, _)| rule(device_id, info))
        .map(|(_, kind)| *kind)
        .unwrap_or(DeviceType::AirConditioner)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    fn info(id: &str, name: &str) -> DeviceInfo {
        DeviceInfo::new(id, name)
    }

    #[test]
    fn identifier_markers() {
        let id = "9C1221E32995_0840_Aircle-17-03";
        assert_eq!(classify(id, &info(id, "Bedroom")), DeviceType::Humidifier);

        let id = "9C1221E32995_0900_CZ-RD501";
        assert_eq!(classify(id, &info(id, "Hall")), DeviceType::AirConditioner);

        let id = "9c1221e32995_0840_lower";
        assert_eq!(classify(id, &info(id, "")), DeviceType::Humidifier);
    }

    #[test]
    fn marker_beats_name() {
        let id = "9C1221E32995_0840_X";
        assert_eq!(
            classify(id, &info(id, "Living room air conditioner")),
            DeviceType::Humidifier
        );
        let id = "9C1221E32995_0900_X";
        assert_eq!(
            classify(id, &info(id, "Bedroom Humidifier")),
            DeviceType::AirConditioner
        );
    }

    #[test]
    fn name_keywords() {
        for name in ["客厅加湿器", "My HUMIDIFIER", "Aircle 17", "湿度控制"] {
            assert_eq!(
                classify("ABCDEF", &info("ABCDEF", name)),
                DeviceType::Humidifier,
                "{name}"
            );
        }
    }

    #[test]
    fn id_prefixes() {
        for id in ["FV-RZM12", "hum-1234", "FVRJM-77"] {
            assert_eq!(classify(id, &info(id, "thing")), DeviceType::Humidifier);
        }
    }

    #[test]
    fn default_is_air_conditioner() {
        assert_eq!(classify("", &info("", "")), DeviceType::AirConditioner);
        assert_eq!(
            classify("ABCDEF_1234_X", &info("ABCDEF_1234_X", "Study")),
            DeviceType::AirConditioner
        );
    }

    #[test]
    fn parse_device_type() {
        assert_eq!(DeviceType::from_str("ac").unwrap(), DeviceType::AirConditioner);
        assert_eq!(
            DeviceType::from_str("Humidifier").unwrap(),
            DeviceType::Humidifier
        );
        assert_eq!(DeviceType::Humidifier.to_string(), "humidifier");
    }
}
