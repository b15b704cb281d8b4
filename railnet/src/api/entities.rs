//! Track-side entities: locs, outputs, switches, sensors, power and clock.
//!
//! Dual-state entities (`Loc`, `Output`, `Switch`) carry both a request and
//! an actual side; either may be absent. `Sensor` only ever has an actual
//! side, `Power` is an un-addressed singleton pair and `Clock` is a
//! singleton actual.

use serde::{Deserialize, Serialize};

use super::address::ObjectAddress;

/// Travel direction of a loc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LocDirection {
    #[default]
    Forward,
    Reverse,
}

/// One side (request or actual) of a loc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LocState {
    /// Speed in percent of the loc's maximum (0..=100).
    pub speed: i32,
    pub direction: LocDirection,
    /// Function outputs (lights, sound, ...) that are switched on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<i32>,
    /// Stamped by the pool on outgoing request deliveries.
    #[serde(default)]
    pub unixtime: i64,
}

/// A loc (locomotive) with desired and observed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loc {
    pub address: ObjectAddress,
    pub request: Option<LocState>,
    pub actual: Option<LocState>,
}

/// One side of a binary/level output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OutputState {
    pub value: i32,
}

/// A track-side output with desired and observed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub address: ObjectAddress,
    pub request: Option<OutputState>,
    pub actual: Option<OutputState>,
}

/// Direction of a switch (turnout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SwitchDirection {
    #[default]
    Straight,
    Off,
}

/// One side of a switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SwitchState {
    pub direction: SwitchDirection,
}

/// A switch with desired and observed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Switch {
    pub address: ObjectAddress,
    pub request: Option<SwitchState>,
    pub actual: Option<SwitchState>,
}

/// Observed state of a sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SensorState {
    pub value: i32,
}

/// A sensor. Sensors are reported by workers only, so there is no
/// request side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub address: ObjectAddress,
    pub actual: Option<SensorState>,
}

/// One side of the track power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PowerState {
    pub enabled: bool,
}

/// The combined track power snapshot (singleton, not addressed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Power {
    pub request: PowerState,
    pub actual: PowerState,
}

/// The model-time clock (singleton actual).
///
/// `unixtime` is re-stamped on every outgoing emission so that slow or
/// replayed deliveries always carry a fresh wall-clock reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Clock {
    /// Real seconds per model hour.
    pub period: i32,
    pub hours: i32,
    pub minutes: i32,
    #[serde(default)]
    pub unixtime: i64,
}

impl Loc {
    pub fn new(address: impl Into<ObjectAddress>) -> Self {
        Self {
            address: address.into(),
            request: None,
            actual: None,
        }
    }

    pub fn with_request(mut self, request: LocState) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_actual(mut self, actual: LocState) -> Self {
        self.actual = Some(actual);
        self
    }
}

impl Output {
    pub fn new(address: impl Into<ObjectAddress>) -> Self {
        Self {
            address: address.into(),
            request: None,
            actual: None,
        }
    }

    pub fn with_request(mut self, request: OutputState) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_actual(mut self, actual: OutputState) -> Self {
        self.actual = Some(actual);
        self
    }
}

impl Switch {
    pub fn new(address: impl Into<ObjectAddress>) -> Self {
        Self {
            address: address.into(),
            request: None,
            actual: None,
        }
    }

    pub fn with_request(mut self, request: SwitchState) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_actual(mut self, actual: SwitchState) -> Self {
        self.actual = Some(actual);
        self
    }
}

impl Sensor {
    pub fn new(address: impl Into<ObjectAddress>) -> Self {
        Self {
            address: address.into(),
            actual: None,
        }
    }

    pub fn with_actual(mut self, actual: SensorState) -> Self {
        self.actual = Some(actual);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loc_builder() {
        let loc = Loc::new("m1/L1").with_request(LocState {
            speed: 40,
            direction: LocDirection::Reverse,
            ..Default::default()
        });
        assert_eq!(loc.address.as_str(), "m1/L1");
        assert_eq!(loc.request.as_ref().unwrap().speed, 40);
        assert!(loc.actual.is_none());
    }

    #[test]
    fn test_entity_serde_roundtrip() {
        let sw = Switch::new("m2/W3").with_actual(SwitchState {
            direction: SwitchDirection::Off,
        });
        let json = serde_json::to_string(&sw).unwrap();
        let back: Switch = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sw);
    }

    #[test]
    fn test_power_default_is_disabled() {
        let power = Power::default();
        assert!(!power.request.enabled);
        assert!(!power.actual.enabled);
    }
}
