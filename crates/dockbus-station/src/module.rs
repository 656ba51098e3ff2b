use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::StationError;

/// The daemon endpoints applications talk to.
///
/// BDP and KR each own a device bus; `Callback` is the fan-out endpoint
/// for unsolicited and late frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Module {
    Bdp,
    Kr,
    Callback,
}

impl Module {
    /// The device buses, in startup order.
    pub const BUSES: [Module; 2] = [Module::Bdp, Module::Kr];

    /// Id carried in the control-plane header.
    pub fn id(self) -> u8 {
        match self {
            Self::Bdp => 1,
            Self::Kr => 2,
            Self::Callback => 3,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Bdp),
            2 => Some(Self::Kr),
            3 => Some(Self::Callback),
            _ => None,
        }
    }

    /// Configuration section name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Bdp => "bdp",
            Self::Kr => "kr",
            Self::Callback => "callback",
        }
    }

    pub fn is_bus(self) -> bool {
        !matches!(self, Self::Callback)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Module {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bdp" | "1" => Ok(Self::Bdp),
            "kr" | "2" => Ok(Self::Kr),
            "callback" | "3" => Ok(Self::Callback),
            _ => Err(StationError::ConfigValue {
                section: "module".to_string(),
                key: s.to_string(),
                reason: "expected bdp, kr or callback".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip() {
        for module in [Module::Bdp, Module::Kr, Module::Callback] {
            assert_eq!(Module::from_id(module.id()), Some(module));
        }
        assert_eq!(Module::from_id(0), None);
        assert_eq!(Module::from_id(4), None);
    }

    #[test]
    fn parses_names_and_ids() {
        assert_eq!("BDP".parse::<Module>().unwrap(), Module::Bdp);
        assert_eq!("2".parse::<Module>().unwrap(), Module::Kr);
        assert!("gps".parse::<Module>().is_err());
    }

    #[test]
    fn only_buses_are_buses() {
        assert!(Module::BUSES.iter().all(|m| m.is_bus()));
        assert!(!Module::Callback.is_bus());
    }
}
