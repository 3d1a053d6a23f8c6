//! The WiFi panel, derived from dumps of the NetworkManager trees.

use std::collections::HashMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct ManagerDump {
    wireless_enabled: bool,
    devices: Vec<DeviceDump>,
    active_connections: Vec<ActiveConnectionDump>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct DeviceDump {
    #[serde(rename = "path")]
    path: String,
    access_points: Vec<AccessPointDump>,
    active_access_point: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct AccessPointDump {
    #[serde(rename = "path")]
    path: String,
    ssid: Vec<u8>,
    strength: u8,
    rsn_flags: u32,
    wpa_flags: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct ActiveConnectionDump {
    connection: Option<ConnectionDump>,
    devices: Vec<String>,
    state: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct ConnectionDump {
    #[serde(rename = "path")]
    path: String,
    settings: serde_json::Value,
    secrets: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct SettingsDump {
    connections: Vec<ConnectionDump>,
}

/// `NMActiveConnectionState`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Unknown,
    Activating,
    Activated,
    Deactivating,
    Deactivated,
}

impl ConnectionState {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => ConnectionState::Activating,
            2 => ConnectionState::Activated,
            3 => ConnectionState::Deactivating,
            4 => ConnectionState::Deactivated,
            _ => ConnectionState::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessPoint {
    pub path: String,
    pub ssid: String,
    pub strength: u8,
    pub secured: bool,
    pub active: bool,
    pub configured: bool,
    /// The settings connection configured for this SSID.
    pub connection: Option<String>,
    pub state: Option<ConnectionState>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Panel {
    pub wireless_enabled: bool,
    pub device: Option<String>,
    /// Bars of the status icon, from 0 to 4.
    pub signal_level: u8,
    pub access_points: Vec<AccessPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfiguredConnection {
    pub path: String,
    pub ssid: String,
    pub has_secrets: bool,
}

fn ssid_of(settings: &serde_json::Value) -> Option<String> {
    let bytes: Vec<u8> = settings
        .pointer("/802-11-wireless/ssid")?
        .as_array()?
        .iter()
        .filter_map(|byte| byte.as_u64().and_then(|byte| u8::try_from(byte).ok()))
        .collect();
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn signal_level(strength: u8) -> u8 {
    let bars = (u32::from(strength.min(100)) * 4).div_ceil(100);
    bars as u8
}

/// WiFi connections in the dump of the settings tree. Connections of other types are skipped.
pub fn configured_connections(settings: &serde_json::Value) -> serde_json::Result<Vec<ConfiguredConnection>> {
    let settings: SettingsDump = serde_json::from_value(settings.clone())?;
    Ok(settings
        .connections
        .into_iter()
        .filter_map(|connection| {
            let ssid = ssid_of(&connection.settings)?;
            Some(ConfiguredConnection { path: connection.path, ssid, has_secrets: connection.secrets.is_some() })
        })
        .collect())
}

/// Build the panel of the first wireless device from the dumps of the manager and the settings tree.
pub fn project(manager: &serde_json::Value, settings: &serde_json::Value) -> serde_json::Result<Panel> {
    let manager: ManagerDump = serde_json::from_value(manager.clone())?;
    let configured: HashMap<String, String> =
        configured_connections(settings)?.into_iter().map(|connection| (connection.ssid, connection.path)).collect();

    let Some(device) = manager.devices.into_iter().next() else {
        return Ok(Panel { wireless_enabled: manager.wireless_enabled, device: None, signal_level: 0, access_points: Vec::new() });
    };

    let states: HashMap<String, ConnectionState> = manager
        .active_connections
        .iter()
        .filter(|active| active.devices.contains(&device.path))
        .filter_map(|active| {
            let ssid = ssid_of(&active.connection.as_ref()?.settings)?;
            Some((ssid, ConnectionState::from_code(active.state)))
        })
        .collect();

    let access_points: Vec<AccessPoint> = device
        .access_points
        .into_iter()
        .map(|ap| {
            let ssid = String::from_utf8_lossy(&ap.ssid).into_owned();
            let connection = configured.get(&ssid).cloned();
            AccessPoint {
                active: device.active_access_point.as_deref() == Some(ap.path.as_str()),
                secured: ap.rsn_flags != 0 || ap.wpa_flags != 0,
                configured: connection.is_some(),
                connection,
                state: states.get(&ssid).copied(),
                strength: ap.strength,
                path: ap.path,
                ssid,
            }
        })
        .sorted_by(|a, b| b.active.cmp(&a.active).then(b.strength.cmp(&a.strength)))
        .collect();

    let signal_level = match access_points.iter().find(|ap| ap.active) {
        Some(ap) if manager.wireless_enabled => signal_level(ap.strength),
        _ => 0,
    };
    Ok(Panel { wireless_enabled: manager.wireless_enabled, device: Some(device.path), signal_level, access_points })
}
