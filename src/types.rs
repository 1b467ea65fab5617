use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Power function (`ON` / `OFF`)
pub const FUNCTION_ONOFF: &str = "ONOFF";
/// Operating mode function
pub const FUNCTION_MODE: &str = "MODE";
/// Target temperature in tenths of a degree Celsius
pub const FUNCTION_SETPOINT: &str = "SETPTEMP";
/// Fan speed function
pub const FUNCTION_FANSP: &str = "FANSP";
/// Vertical vane position
pub const FUNCTION_VANEUD: &str = "VANEUD";
/// Horizontal vane position
pub const FUNCTION_VANELR: &str = "VANELR";
/// Ambient temperature in tenths of a degree Celsius (read-only)
pub const FUNCTION_AMBTEMP: &str = "AMBTEMP";
/// Error status reported by the AC unit (read-only)
pub const FUNCTION_ERRSTATUS: &str = "ERRSTATUS";
/// Error code reported by the AC unit (read-only)
pub const FUNCTION_ERRCODE: &str = "ERRCODE";

/// Functions whose allowed values are queried with `LIMITS:<name>`
pub const LIMIT_FUNCTIONS: [&str; 6] = [
    FUNCTION_ONOFF,
    FUNCTION_MODE,
    FUNCTION_SETPOINT,
    FUNCTION_FANSP,
    FUNCTION_VANEUD,
    FUNCTION_VANELR,
];

/// Sentinels the firmware uses for "no value"
pub const NULL_VALUES: [&str; 2] = ["-32768", "32768"];

pub const POWER_ON: &str = "ON";
pub const POWER_OFF: &str = "OFF";

/// Vane value that enables swinging
pub const VANE_SWING: &str = "SWING";

/// Identifies one function on one AC unit behind the gateway
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId {
    /// AC unit index on the gateway (1 for single-unit boxes)
    pub unit: u8,
    /// WMP function name, e.g. `SETPTEMP`
    pub name: String,
}

impl FunctionId {
    pub fn new(unit: u8, name: impl Into<String>) -> Self {
        Self {
            unit,
            name: name.into(),
        }
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.unit, self.name)
    }
}

/// How a function's raw wire values are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    /// One of a fixed list of tokens
    Enumerated,
    /// Signed integer in device units
    Integer,
    /// Free-form text
    Text,
}

/// Values a function accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllowedValues {
    Any,
    Set(Vec<String>),
    Range { min: i32, max: i32 },
}

/// Capability of one device function, learned during discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub id: FunctionId,
    pub data_type: DataType,
    pub allowed: AllowedValues,
    pub writable: bool,
}

impl FunctionDescriptor {
    /// Build a descriptor from a `LIMITS:<name>,[...]` reply
    ///
    /// The setpoint reports `[min,max]` in tenths of a degree; every other
    /// function reports the list of accepted tokens.
    pub fn from_limits(unit: u8, name: &str, values: &[String]) -> Option<Self> {
        let id = FunctionId::new(unit, name);
        if name == FUNCTION_SETPOINT {
            let [min, max] = values else {
                return None;
            };
            let min = min.trim().parse::<i32>().ok()?;
            let max = max.trim().parse::<i32>().ok()?;
            return Some(Self {
                id,
                data_type: DataType::Integer,
                allowed: AllowedValues::Range {
                    min: min.min(max),
                    max: max.max(min),
                },
                writable: true,
            });
        }

        if values.is_empty() {
            return None;
        }

        Some(Self {
            id,
            data_type: DataType::Enumerated,
            allowed: AllowedValues::Set(values.to_vec()),
            writable: true,
        })
    }

    /// Descriptor for a read-only function that has no `LIMITS` entry
    pub fn read_only(unit: u8, name: &str, data_type: DataType) -> Self {
        Self {
            id: FunctionId::new(unit, name),
            data_type,
            allowed: AllowedValues::Any,
            writable: false,
        }
    }

    /// `ONOFF` as every WMP device implements it
    pub fn power(unit: u8) -> Self {
        Self {
            id: FunctionId::new(unit, FUNCTION_ONOFF),
            data_type: DataType::Enumerated,
            allowed: AllowedValues::Set(vec![POWER_ON.to_string(), POWER_OFF.to_string()]),
            writable: true,
        }
    }

    /// Interpret a raw wire value, `None` if it does not fit the data type
    pub fn parse_value(&self, raw: &str) -> Option<Value> {
        if NULL_VALUES.contains(&raw) {
            return Some(Value::Unavailable);
        }
        match self.data_type {
            DataType::Integer => raw.trim().parse::<i32>().ok().map(Value::Integer),
            DataType::Enumerated => Some(Value::Enumerated(raw.to_string())),
            DataType::Text => Some(Value::Text(raw.to_string())),
        }
    }

    /// Check that `value` may be written to this function
    pub fn validate(&self, value: &str) -> std::result::Result<(), String> {
        if !self.writable {
            return Err("function is read-only".to_string());
        }
        match &self.allowed {
            AllowedValues::Any => Ok(()),
            AllowedValues::Set(values) => {
                if values.iter().any(|v| v == value) {
                    Ok(())
                } else {
                    Err(format!("expected one of [{}]", values.join(",")))
                }
            }
            AllowedValues::Range { min, max } => {
                let n = value
                    .parse::<i32>()
                    .map_err(|_| "expected an integer".to_string())?;
                if (*min..=*max).contains(&n) {
                    Ok(())
                } else {
                    Err(format!("expected a value in {}..={}", min, max))
                }
            }
        }
    }

    /// Accepted tokens for enumerated functions
    pub fn options(&self) -> &[String] {
        match &self.allowed {
            AllowedValues::Set(values) => values,
            _ => &[],
        }
    }
}

/// Last known value of a function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Enumerated(String),
    Integer(i32),
    Text(String),
    /// The device reported one of the null sentinels
    Unavailable,
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Enumerated(s) | Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i32> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Enumerated(s) | Value::Text(s) => f.write_str(s),
            Value::Integer(n) => write!(f, "{}", n),
            Value::Unavailable => f.write_str("unavailable"),
        }
    }
}

/// Gateway identity from the `ID` reply
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub model: String,
    pub mac: String,
    pub ip: String,
    pub protocol: String,
    pub firmware_version: String,
    /// Wi-Fi signal strength in dBm
    pub rssi: Option<i32>,
}

/// TCP connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// The gateway answered the `ID` handshake
    Authenticated,
}

impl ConnectionStatus {
    /// Whether moving from `self` to `next` is allowed within a session
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Authenticated)
                | (Connected, Disconnected)
                | (Authenticated, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Authenticated => "authenticated",
        };
        f.write_str(s)
    }
}

/// Session protocol phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    Idle,
    LoggingIn,
    DiscoveringFunctions,
    Ready,
    Disconnected,
}

/// AC operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Auto,
    Heat,
    Dry,
    Fan,
    Cool,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Auto => "AUTO",
            Mode::Heat => "HEAT",
            Mode::Dry => "DRY",
            Mode::Fan => "FAN",
            Mode::Cool => "COOL",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "AUTO" => Ok(Mode::Auto),
            "HEAT" => Ok(Mode::Heat),
            "DRY" => Ok(Mode::Dry),
            "FAN" => Ok(Mode::Fan),
            "COOL" => Ok(Mode::Cool),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn setpoint_limits_become_a_range() {
        let desc =
            FunctionDescriptor::from_limits(1, FUNCTION_SETPOINT, &strings(&["160", "300"])).unwrap();
        assert_eq!(desc.data_type, DataType::Integer);
        assert_eq!(desc.allowed, AllowedValues::Range { min: 160, max: 300 });
        assert!(desc.validate("220").is_ok());
        assert!(desc.validate("310").is_err());
        assert!(desc.validate("warm").is_err());
    }

    #[test]
    fn malformed_setpoint_limits_are_rejected() {
        assert!(FunctionDescriptor::from_limits(1, FUNCTION_SETPOINT, &strings(&["160"])).is_none());
        assert!(
            FunctionDescriptor::from_limits(1, FUNCTION_SETPOINT, &strings(&["a", "b"])).is_none()
        );
    }

    #[test]
    fn enumerated_limits_validate_membership() {
        let desc =
            FunctionDescriptor::from_limits(1, FUNCTION_FANSP, &strings(&["AUTO", "1", "2"])).unwrap();
        assert!(desc.validate("2").is_ok());
        assert!(desc.validate("4").is_err());
        assert_eq!(desc.options(), &strings(&["AUTO", "1", "2"])[..]);
    }

    #[test]
    fn read_only_functions_refuse_writes() {
        let desc = FunctionDescriptor::read_only(1, FUNCTION_AMBTEMP, DataType::Integer);
        assert!(desc.validate("200").is_err());
    }

    #[test]
    fn null_sentinels_parse_as_unavailable() {
        let desc = FunctionDescriptor::read_only(1, FUNCTION_AMBTEMP, DataType::Integer);
        assert_eq!(desc.parse_value("-32768"), Some(Value::Unavailable));
        assert_eq!(desc.parse_value("32768"), Some(Value::Unavailable));
        assert_eq!(desc.parse_value("215"), Some(Value::Integer(215)));
        assert_eq!(desc.parse_value("hot"), None);
    }

    #[test]
    fn status_transitions_follow_the_session_order() {
        use ConnectionStatus::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Authenticated));
        assert!(Authenticated.can_transition_to(Disconnected));
        assert!(!Authenticated.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Authenticated));
    }

    #[test]
    fn function_id_displays_unit_and_name() {
        assert_eq!(FunctionId::new(1, "MODE").to_string(), "1:MODE");
    }

    #[test]
    fn modes_parse_from_wire_tokens() {
        assert_eq!("COOL".parse::<Mode>(), Ok(Mode::Cool));
        assert!("OFF".parse::<Mode>().is_err());
    }
}
