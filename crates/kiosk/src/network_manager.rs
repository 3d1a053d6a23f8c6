//! The NetworkManager object trees the WiFi panel is built from.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use dbus_tree::{
    zvariant::{ObjectPath, Value},
    FieldDefinition, ObjectNode, PropValue, Subtree, Transport,
};

use crate::wifi;

pub const MANAGER_PATH: &str = "/org/freedesktop/NetworkManager";
pub const SETTINGS_PATH: &str = "/org/freedesktop/NetworkManager/Settings";

const MANAGER: &str = "org.freedesktop.NetworkManager";
const SETTINGS: &str = "org.freedesktop.NetworkManager.Settings";
const SETTINGS_CONNECTION: &str = "org.freedesktop.NetworkManager.Settings.Connection";
const ACTIVE_CONNECTION: &str = "org.freedesktop.NetworkManager.Connection.Active";
const DEVICE_WIRELESS: &str = "org.freedesktop.NetworkManager.Device.Wireless";
const ACCESS_POINT: &str = "org.freedesktop.NetworkManager.AccessPoint";

/// Replies to `RequestScan` that only mean "not right now".
const ALLOWED_SCAN_ERRORS: [&str; 4] = [
    "Scanning not allowed at this time",
    "Scanning not allowed while already scanning",
    "Scanning not allowed while unavailable or activating",
    "Scanning not allowed immediately following previous scan",
];

/// Fetch the settings and, if there are any, the WiFi secrets of a settings connection, and
/// store them as the node's `Settings` and `Secrets`.
async fn reload_settings<T: Transport>(node: Arc<ObjectNode<T>>) -> dbus_tree::Result<()> {
    if !node.is_live() {
        return Ok(());
    }
    let settings = node.call_method("GetSettings", Vec::new()).await?;
    let mut entries = vec![("Settings".to_owned(), first_arg("GetSettings", settings)?)];
    match node.call_method("GetSecrets", vec![Value::from("802-11-wireless-security")]).await {
        Ok(secrets) => entries.push(("Secrets".to_owned(), first_arg("GetSecrets", secrets)?)),
        Err(err) => log::debug!("No secrets for {}: {}", node.path(), err),
    }
    node.store_local(entries)
}

fn first_arg(method: &str, reply: Vec<PropValue>) -> dbus_tree::Result<PropValue> {
    reply.into_iter().next().ok_or_else(|| dbus_tree::Error::UnexpectedReply {
        method: method.to_owned(),
        reason: "empty reply".to_owned(),
    })
}

/// Request a scan on a wireless device every `interval` until the device goes away.
async fn scan_loop<T: Transport>(device: Arc<ObjectNode<T>>, interval: Duration) {
    while device.is_live() {
        let options: HashMap<String, Value<'static>> = HashMap::new();
        if let Err(err) = device.call_method("RequestScan", vec![Value::from(options)]).await {
            match err.remote_message() {
                Some(message) if ALLOWED_SCAN_ERRORS.contains(&message) => {
                    log::debug!("Scan of {} skipped: {}", device.path(), message)
                }
                _ => {
                    log::error!("Failed to request a scan on {}: {:?}", device.path(), err);
                    return;
                }
            }
        }
        tokio::time::sleep(interval).await;
    }
    log::debug!("Stopped scanning on {}", device.path());
}

fn settings_connection<T: Transport>() -> FieldDefinition<T> {
    let subtree = Subtree::new().scalar("Unsaved").scalar("Flags").scalar("Filename").scalar("Settings").scalar("Secrets");
    FieldDefinition::new(SETTINGS_CONNECTION, subtree)
        .with_listener("Updated", |node, _args| reload_settings(node))
        .with_init(reload_settings)
}

fn wireless_device<T: Transport>(scan_interval: Duration) -> FieldDefinition<T> {
    let access_point = FieldDefinition::new(
        ACCESS_POINT,
        Subtree::new().scalar("Ssid").scalar("Strength").scalar("RsnFlags").scalar("WpaFlags"),
    );
    FieldDefinition::new(DEVICE_WIRELESS, Subtree::new().object("AccessPoints", access_point).scalar("ActiveAccessPoint"))
        .with_init(move |device| async move {
            tokio::spawn(scan_loop(device, scan_interval));
            Ok(())
        })
}

pub fn settings_tree<T: Transport>() -> Arc<FieldDefinition<T>> {
    Arc::new(FieldDefinition::new(SETTINGS, Subtree::new().object("Connections", settings_connection())))
}

pub fn manager_tree<T: Transport>(scan_interval: Duration) -> Arc<FieldDefinition<T>> {
    let active_connection = FieldDefinition::new(
        ACTIVE_CONNECTION,
        Subtree::new().object("Connection", settings_connection()).scalar("Devices").scalar("State"),
    );
    Arc::new(FieldDefinition::new(
        MANAGER,
        Subtree::new()
            .object("ActiveConnections", active_connection)
            .object("Devices", wireless_device(scan_interval))
            .scalar("WirelessEnabled"),
    ))
}

fn object_path(path: &str) -> Result<Value<'static>> {
    let path = ObjectPath::try_from(path.to_owned()).with_context(|| format!("Invalid object path {}", path))?;
    Ok(Value::from(path))
}

/// Both NetworkManager trees, kept in sync for as long as this lives.
pub struct NetworkManager<T: Transport> {
    pub manager: Arc<ObjectNode<T>>,
    pub settings: Arc<ObjectNode<T>>,
}

impl<T: Transport> NetworkManager<T> {
    pub async fn open(transport: Arc<T>, service: &str, scan_interval: Duration) -> Result<Self> {
        let settings = ObjectNode::create(transport.clone(), service, SETTINGS_PATH, settings_tree(), None)
            .await
            .context("Failed to load the NetworkManager settings")?;
        let manager = ObjectNode::create(transport, service, MANAGER_PATH, manager_tree(scan_interval), None).await;
        match manager {
            Ok(manager) => Ok(NetworkManager { manager, settings }),
            Err(err) => {
                settings.destroy();
                Err(err).context("Failed to load NetworkManager")
            }
        }
    }

    pub fn panel(&self) -> Result<wifi::Panel> {
        wifi::project(&self.manager.dump(), &self.settings.dump()).context("Failed to read the WiFi state")
    }

    pub fn connections(&self) -> Result<Vec<wifi::ConfiguredConnection>> {
        wifi::configured_connections(&self.settings.dump()).context("Failed to read the configured connections")
    }

    pub async fn set_wireless_enabled(&self, enabled: bool) -> Result<()> {
        self.manager.set_property("WirelessEnabled", Value::from(enabled)).await?;
        Ok(())
    }

    /// Activate the connection configured for `ssid` on the first wireless device, or create one.
    pub async fn connect(&self, ssid: &str, passphrase: Option<&str>) -> Result<()> {
        let panel = self.panel()?;
        let Some(device) = panel.device else {
            bail!("No wireless device found");
        };
        let Some(access_point) = panel.access_points.iter().find(|ap| ap.ssid == ssid) else {
            bail!("No access point with SSID {} in range", ssid);
        };

        if let Some(connection) = &access_point.connection {
            log::info!("Activating {} for {}", connection, ssid);
            let args = vec![object_path(connection)?, object_path(&device)?, object_path("/")?];
            self.manager.call_method("ActivateConnection", args).await?;
            return Ok(());
        }

        if access_point.secured && passphrase.is_none() {
            bail!("{} is secured, a passphrase is required", ssid);
        }
        let mut settings: HashMap<String, HashMap<String, Value<'static>>> = HashMap::new();
        if let Some(passphrase) = passphrase {
            let security = HashMap::from([("psk".to_owned(), Value::from(passphrase.to_owned()))]);
            settings.insert("802-11-wireless-security".to_owned(), security);
        }
        log::info!("Creating a connection for {}", ssid);
        let args = vec![Value::from(settings), object_path(&device)?, object_path(&access_point.path)?];
        self.manager.call_method("AddAndActivateConnection", args).await?;
        Ok(())
    }

    pub async fn forget(&self, ssid: &str) -> Result<()> {
        let connections = self.connections()?;
        let Some(connection) = connections.iter().find(|connection| connection.ssid == ssid) else {
            bail!("No connection configured for {}", ssid);
        };
        let node = self
            .settings
            .member("Connections", &connection.path)
            .with_context(|| format!("Connection {} went away", connection.path))?;
        node.call_method("Delete", Vec::new()).await?;
        Ok(())
    }

    pub fn destroy(&self) {
        self.manager.destroy();
        self.settings.destroy();
    }
}
