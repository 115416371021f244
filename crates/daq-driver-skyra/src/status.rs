//! Enumerations the controller reports or accepts, each with one label table.

use daq_core::error::{DaqError, Result};

/// How the laser current is regulated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    #[default]
    ConstantPower,
    ConstantCurrent,
    Modulation,
}

const CONTROL_MODES: &[(ControlMode, &str, &str)] = &[
    (ControlMode::ConstantPower, "Constant Power", "cp"),
    (ControlMode::ConstantCurrent, "Constant Current", "ci"),
    (ControlMode::Modulation, "Modulation", "em"),
];

impl ControlMode {
    pub fn label(self) -> &'static str {
        CONTROL_MODES
            .iter()
            .find(|(mode, _, _)| *mode == self)
            .map_or("", |(_, label, _)| label)
    }

    /// Command verb that enters this mode.
    pub fn verb(self) -> &'static str {
        CONTROL_MODES
            .iter()
            .find(|(mode, _, _)| *mode == self)
            .map_or("", |(_, _, verb)| verb)
    }

    pub fn from_label(label: &str) -> Result<Self> {
        CONTROL_MODES
            .iter()
            .find(|(_, l, _)| *l == label.trim())
            .map(|(mode, _, _)| *mode)
            .ok_or_else(|| DaqError::InvalidParameter(format!("unknown control mode {label:?}")))
    }
}

/// Modulation switches of one laser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModulationKind {
    /// Modulation mode as a whole; entered with `em`
    Status,
    Analog,
    Digital,
    Internal,
}

pub(crate) const MODULATION_KINDS: &[(ModulationKind, &str, &str)] = &[
    (ModulationKind::Status, "Modulation Status", "gmes?"),
    (ModulationKind::Analog, "Analog Modulation", "games?"),
    (ModulationKind::Digital, "Digital Modulation", "gdmes?"),
    (ModulationKind::Internal, "Internal Modulation", "gswm?"),
];

impl ModulationKind {
    pub fn label(self) -> &'static str {
        MODULATION_KINDS
            .iter()
            .find(|(kind, _, _)| *kind == self)
            .map_or("", |(_, label, _)| label)
    }

    /// Query that reads this switch back.
    pub fn query(self) -> &'static str {
        MODULATION_KINDS
            .iter()
            .find(|(kind, _, _)| *kind == self)
            .map_or("", |(_, _, query)| query)
    }
}

/// Last known modulation switches of the active laser.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModulationFlags {
    pub status: bool,
    pub analog: bool,
    pub digital: bool,
    pub internal: bool,
}

impl ModulationFlags {
    pub fn get(&self, kind: ModulationKind) -> bool {
        match kind {
            ModulationKind::Status => self.status,
            ModulationKind::Analog => self.analog,
            ModulationKind::Digital => self.digital,
            ModulationKind::Internal => self.internal,
        }
    }

    pub fn set(&mut self, kind: ModulationKind, on: bool) {
        match kind {
            ModulationKind::Status => self.status = on,
            ModulationKind::Analog => self.analog = on,
            ModulationKind::Digital => self.digital = on,
            ModulationKind::Internal => self.internal = on,
        }
    }
}

/// Operating mode reported by `gom?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingStatus {
    Off,
    WaitingForTemperature,
    WaitingForKey,
    WarmUp,
    Completed,
    Continuous,
    OnOffModulation,
    Modulation,
    Fault,
    Aborted,
}

/// Codes shared by every controller.
const OPERATING_COMMON: &[(char, OperatingStatus)] = &[
    ('0', OperatingStatus::Off),
    ('1', OperatingStatus::WaitingForTemperature),
    ('5', OperatingStatus::Fault),
    ('6', OperatingStatus::Aborted),
];

/// Codes 2-4 on a multi-laser unit describe the start-up sequence.
const OPERATING_MULTI: &[(char, OperatingStatus)] = &[
    ('2', OperatingStatus::WaitingForKey),
    ('3', OperatingStatus::WarmUp),
    ('4', OperatingStatus::Completed),
];

/// On a single laser they describe the output mode.
const OPERATING_SINGLE: &[(char, OperatingStatus)] = &[
    ('2', OperatingStatus::Continuous),
    ('3', OperatingStatus::OnOffModulation),
    ('4', OperatingStatus::Modulation),
];

const OPERATING_LABELS: &[(OperatingStatus, &str)] = &[
    (OperatingStatus::Off, "Off"),
    (OperatingStatus::WaitingForTemperature, "Waiting for temperature"),
    (OperatingStatus::WaitingForKey, "Waiting for key"),
    (OperatingStatus::WarmUp, "Warm-up"),
    (OperatingStatus::Completed, "Completed"),
    (OperatingStatus::Continuous, "Continuous"),
    (OperatingStatus::OnOffModulation, "On/Off Modulation"),
    (OperatingStatus::Modulation, "Modulation"),
    (OperatingStatus::Fault, "Fault"),
    (OperatingStatus::Aborted, "Aborted"),
];

impl OperatingStatus {
    pub fn from_code(code: char, multi_laser: bool) -> Option<Self> {
        let specific = if multi_laser {
            OPERATING_MULTI
        } else {
            OPERATING_SINGLE
        };
        OPERATING_COMMON
            .iter()
            .chain(specific)
            .find(|(c, _)| *c == code)
            .map(|(_, status)| *status)
    }

    pub fn label(self) -> &'static str {
        OPERATING_LABELS
            .iter()
            .find(|(status, _)| *status == self)
            .map_or("", |(_, label)| label)
    }
}

/// Fault reported by `f?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    NoFault,
    Temperature,
    OpenInterlock,
    ConstantPower,
}

const FAULTS: &[(char, Fault, &str)] = &[
    ('0', Fault::NoFault, "No Fault"),
    ('1', Fault::Temperature, "Temperature Fault"),
    ('3', Fault::OpenInterlock, "Open Interlock"),
    ('4', Fault::ConstantPower, "Constant Power Fault"),
];

impl Fault {
    pub fn from_code(code: char) -> Option<Self> {
        FAULTS
            .iter()
            .find(|(c, _, _)| *c == code)
            .map(|(_, fault, _)| *fault)
    }

    pub fn label(self) -> &'static str {
        FAULTS
            .iter()
            .find(|(_, fault, _)| *fault == self)
            .map_or("", |(_, _, label)| label)
    }
}

/// Decode the first character of `reply` through `decode`.
pub(crate) fn decode_first<T>(reply: &str, decode: impl Fn(char) -> Option<T>) -> Result<T> {
    reply
        .chars()
        .next()
        .and_then(decode)
        .ok_or_else(|| DaqError::Protocol(reply.to_string()))
}

/// `"1..."` reads as on, anything else as off.
pub(crate) fn flag(reply: &str) -> bool {
    reply.starts_with('1')
}

pub(crate) fn enabled_label(on: bool) -> &'static str {
    if on {
        "Enabled"
    } else {
        "Disabled"
    }
}

pub(crate) fn on_label(on: bool) -> &'static str {
    if on {
        "On"
    } else {
        "Off"
    }
}
