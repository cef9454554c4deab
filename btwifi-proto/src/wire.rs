//! Message envelopes and payload types exchanged on the command channels

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::RESULT_SUCCESS;

/// Outbound message: `{"c": <command>, "p": <payload>}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    #[serde(rename = "c")]
    pub command: i32,
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl CommandEnvelope {
    pub fn new(command: i32) -> Self {
        Self { command, payload: None }
    }

    pub fn with_payload(command: i32, payload: Value) -> Self {
        Self { command, payload: Some(payload) }
    }
}

/// Inbound message: `{"c": <command>, "r": <result>, "p": <payload>}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    #[serde(rename = "c")]
    pub command: i32,
    /// Absent on some firmware; treated as success
    #[serde(rename = "r", default)]
    pub result: i32,
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ResponseEnvelope {
    pub fn is_success(&self) -> bool {
        self.result == RESULT_SUCCESS
    }

    /// Payload of a successful response; failed responses never carry one
    pub fn payload(&self) -> Option<&Value> {
        if self.is_success() {
            self.payload.as_ref()
        } else {
            None
        }
    }
}

/// Command codes understood by the wifi service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WifiCommand {
    GetNetworks,
    Connect,
    ConnectHidden,
    Disconnect,
    Scan,
    GetConnection,
}

impl WifiCommand {
    pub fn code(self) -> i32 {
        match self {
            WifiCommand::GetNetworks => 0,
            WifiCommand::Connect => 1,
            WifiCommand::ConnectHidden => 2,
            WifiCommand::Disconnect => 3,
            WifiCommand::Scan => 4,
            WifiCommand::GetConnection => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(WifiCommand::GetNetworks),
            1 => Some(WifiCommand::Connect),
            2 => Some(WifiCommand::ConnectHidden),
            3 => Some(WifiCommand::Disconnect),
            4 => Some(WifiCommand::Scan),
            5 => Some(WifiCommand::GetConnection),
            _ => None,
        }
    }
}

/// Result codes reported by the wifi service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum WifiResult {
    #[error("success")]
    Success,
    #[error("invalid command")]
    InvalidCommand,
    #[error("invalid parameters")]
    InvalidParameters,
    #[error("network manager not available")]
    NetworkManagerNotAvailable,
    #[error("wireless not available")]
    WirelessNotAvailable,
    #[error("wireless networking disabled")]
    WirelessNetworkingDisabled,
    #[error("networking disabled")]
    NetworkingDisabled,
    #[error("unknown error")]
    UnknownError,
}

impl WifiResult {
    /// Unrecognised codes map to [`WifiResult::UnknownError`]
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => WifiResult::Success,
            1 => WifiResult::InvalidCommand,
            2 => WifiResult::InvalidParameters,
            3 => WifiResult::NetworkManagerNotAvailable,
            4 => WifiResult::WirelessNotAvailable,
            5 => WifiResult::WirelessNetworkingDisabled,
            6 => WifiResult::NetworkingDisabled,
            _ => WifiResult::UnknownError,
        }
    }
}

/// A wifi service request with its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiRequest {
    GetNetworks,
    Connect { ssid: String, password: String },
    ConnectHidden { ssid: String, password: String },
    Disconnect,
    Scan,
    GetConnection,
}

impl WifiRequest {
    pub fn command(&self) -> WifiCommand {
        match self {
            WifiRequest::GetNetworks => WifiCommand::GetNetworks,
            WifiRequest::Connect { .. } => WifiCommand::Connect,
            WifiRequest::ConnectHidden { .. } => WifiCommand::ConnectHidden,
            WifiRequest::Disconnect => WifiCommand::Disconnect,
            WifiRequest::Scan => WifiCommand::Scan,
            WifiRequest::GetConnection => WifiCommand::GetConnection,
        }
    }

    pub fn to_envelope(&self) -> CommandEnvelope {
        let code = self.command().code();
        match self {
            WifiRequest::Connect { ssid, password }
            | WifiRequest::ConnectHidden { ssid, password } => {
                CommandEnvelope::with_payload(code, json!({ "e": ssid, "p": password }))
            }
            _ => CommandEnvelope::new(code),
        }
    }
}

/// One wireless network as reported by the device
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: String,
    pub mac_address: String,
    pub signal_strength: i32,
    pub protected: bool,
    /// Only known for the network the device is currently connected to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_address: Option<String>,
}

impl AccessPoint {
    /// Parse one `{"e", "m", "s", "p", "i"}` entry; `None` if it is malformed
    pub fn from_entry(entry: &Value) -> Option<Self> {
        let entry = entry.as_object()?;
        let ssid = entry.get("e")?.as_str()?.to_string();
        let mac_address = match entry.get("m") {
            None | Some(Value::Null) => String::new(),
            Some(value) => value.as_str()?.to_string(),
        };
        let signal_strength = match entry.get("s") {
            None | Some(Value::Null) => 0,
            Some(value) => i32::try_from(value.as_i64()?).ok()?,
        };
        let protected = match entry.get("p") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(flag)) => *flag,
            Some(Value::Number(n)) => n.as_i64()? != 0,
            Some(_) => return None,
        };
        let host_address = entry
            .get("i")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Some(Self { ssid, mac_address, signal_strength, protected, host_address })
    }

    /// Parse a network-list payload, skipping malformed entries one by one
    pub fn list_from_payload(payload: Option<&Value>) -> (Vec<AccessPoint>, usize) {
        let Some(entries) = payload.and_then(Value::as_array) else {
            return (Vec::new(), 0);
        };
        let access_points: Vec<_> = entries.iter().filter_map(Self::from_entry).collect();
        let skipped = entries.len() - access_points.len();
        (access_points, skipped)
    }

    /// Parse a current-connection payload; empty or absent means not connected
    pub fn connection_from_payload(payload: Option<&Value>) -> Option<AccessPoint> {
        let payload = payload?;
        if payload.as_object().is_some_and(Map::is_empty) {
            return None;
        }
        Self::from_entry(payload).filter(|ap| !ap.ssid.is_empty())
    }
}

/// Strings from the standard device information service
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInformation {
    pub manufacturer: String,
    pub model_number: String,
    pub software_revision: String,
    pub firmware_revision: String,
    pub hardware_revision: String,
}

/// Network manager state from the network status characteristic
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkStatus {
    #[default]
    Unknown,
    Asleep,
    Disconnected,
    Disconnecting,
    Connecting,
    ConnectedLocal,
    ConnectedSite,
    Global,
}

impl NetworkStatus {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => NetworkStatus::Asleep,
            2 => NetworkStatus::Disconnected,
            3 => NetworkStatus::Disconnecting,
            4 => NetworkStatus::Connecting,
            5 => NetworkStatus::ConnectedLocal,
            6 => NetworkStatus::ConnectedSite,
            7 => NetworkStatus::Global,
            _ => NetworkStatus::Unknown,
        }
    }

    pub fn from_value(value: &[u8]) -> Self {
        Self::from_code(decode_status_value(value))
    }
}

/// Wireless device state from the wifi status characteristic
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum WirelessStatus {
    #[default]
    Unknown,
    Unmanaged,
    Unavailable,
    Disconnected,
    Prepare,
    Config,
    NeedAuth,
    IpConfig,
    IpCheck,
    Secondaries,
    Activated,
    Deactivating,
    Failed,
}

impl WirelessStatus {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => WirelessStatus::Unmanaged,
            2 => WirelessStatus::Unavailable,
            3 => WirelessStatus::Disconnected,
            4 => WirelessStatus::Prepare,
            5 => WirelessStatus::Config,
            6 => WirelessStatus::NeedAuth,
            7 => WirelessStatus::IpConfig,
            8 => WirelessStatus::IpCheck,
            9 => WirelessStatus::Secondaries,
            10 => WirelessStatus::Activated,
            11 => WirelessStatus::Deactivating,
            12 => WirelessStatus::Failed,
            _ => WirelessStatus::Unknown,
        }
    }

    pub fn from_value(value: &[u8]) -> Self {
        Self::from_code(decode_status_value(value))
    }
}

/// Status characteristics carry a big-endian unsigned integer
pub fn decode_status_value(value: &[u8]) -> u32 {
    let start = value.len().saturating_sub(4);
    value[start..]
        .iter()
        .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte))
}

/// Enable-flag characteristics are non-zero when set
pub fn decode_flag(value: &[u8]) -> bool {
    decode_status_value(value) != 0
}
