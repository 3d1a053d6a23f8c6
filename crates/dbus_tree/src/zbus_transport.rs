//! [`Transport`] on top of a zbus connection.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
};

use futures::StreamExt;
use serde::Deserialize;
use zbus::{
    fdo::IntrospectableProxy,
    zvariant::{OwnedValue, Structure, StructureBuilder, Value},
};

use crate::{Error, PropValue, PropertyMap, Result, SignalCallback, SubscriptionId, Transport, PROPERTIES_INTERFACE};

pub struct ZbusTransport {
    con: zbus::Connection,
    next_id: AtomicU64,
}

/// An interface of a remote object, along with the tasks forwarding its subscribed signals.
pub struct ZbusInterface {
    proxy: zbus::Proxy<'static>,
    tasks: Mutex<HashMap<SubscriptionId, tokio::task::AbortHandle>>,
}

impl ZbusInterface {
    pub fn proxy(&self) -> &zbus::Proxy<'static> {
        &self.proxy
    }
}

impl Drop for ZbusInterface {
    fn drop(&mut self) {
        for (_, task) in self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner).drain() {
            task.abort();
        }
    }
}

impl ZbusTransport {
    pub fn new(con: zbus::Connection) -> Self {
        ZbusTransport { con, next_id: AtomicU64::new(0) }
    }

    /// Connect to the system bus.
    pub async fn system() -> Result<Self> {
        Ok(Self::new(zbus::Connection::system().await?))
    }

    pub async fn session() -> Result<Self> {
        Ok(Self::new(zbus::Connection::session().await?))
    }

    pub fn connection(&self) -> &zbus::Connection {
        &self.con
    }
}

#[derive(Deserialize)]
struct DBusNode {
    #[serde(default)]
    interface: Vec<DBusInterface>,
}

#[derive(Deserialize)]
struct DBusInterface {
    #[serde(rename = "@name")]
    name: String,
}

/// Names of the interfaces the object at `path` says it implements.
async fn introspect_interfaces(con: &zbus::Connection, service: &str, path: &str) -> Result<Vec<String>> {
    let introspection_xml = IntrospectableProxy::builder(con)
        .destination(service)?
        .path(path)?
        .build()
        .await?
        .introspect()
        .await?;
    interface_names(&introspection_xml)
}

fn interface_names(introspection_xml: &str) -> Result<Vec<String>> {
    let dbus_node = quick_xml::de::from_str::<DBusNode>(introspection_xml)
        .map_err(|err| Error::UnexpectedReply { method: "Introspect".to_owned(), reason: err.to_string() })?;
    Ok(dbus_node.interface.into_iter().map(|interface| interface.name).collect())
}

/// Decode all arguments in the body of a message.
fn decode_body(msg: &zbus::Message) -> Result<Vec<PropValue>> {
    let header = msg.header();
    let has_body = header.signature().map_or(false, |signature| !signature.as_str().is_empty());
    if !has_body {
        return Ok(Vec::new());
    }
    let body = msg.body();
    let fields: Structure<'_> = body.deserialize()?;
    Ok(fields.fields().iter().map(PropValue::from_variant).collect())
}

impl Transport for ZbusTransport {
    type Interface = ZbusInterface;

    async fn resolve_interface(&self, service: &str, path: &str, interface: &str) -> Result<ZbusInterface> {
        if interface != PROPERTIES_INTERFACE {
            let interfaces = introspect_interfaces(&self.con, service, path).await?;
            if !interfaces.iter().any(|name| name == interface) {
                return Err(Error::InterfaceNotFound { interface: interface.to_owned(), path: path.to_owned() });
            }
        }
        let proxy = zbus::Proxy::new(&self.con, service.to_owned(), path.to_owned(), interface.to_owned()).await?;
        Ok(ZbusInterface { proxy, tasks: Mutex::new(HashMap::new()) })
    }

    async fn get_all_properties(&self, properties: &ZbusInterface, interface: &str) -> Result<PropertyMap> {
        let reply = properties.proxy.call_method("GetAll", &(interface,)).await.map_err(Error::from_zbus)?;
        let values: HashMap<String, OwnedValue> = reply.body().deserialize()?;
        Ok(values.into_iter().map(|(name, value)| (name, PropValue::from_variant(&value))).collect())
    }

    async fn set_property(&self, properties: &ZbusInterface, interface: &str, name: &str, value: Value<'static>) -> Result<()> {
        properties.proxy.call_method("Set", &(interface, name, &value)).await.map_err(Error::from_zbus)?;
        Ok(())
    }

    async fn call_method(&self, iface: &ZbusInterface, method: &str, args: Vec<Value<'static>>) -> Result<Vec<PropValue>> {
        let reply = if args.is_empty() {
            iface.proxy.call_method(method, &()).await
        } else {
            let body = args.into_iter().fold(StructureBuilder::new(), |builder, arg| builder.append_field(arg)).build();
            iface.proxy.call_method(method, &body).await
        }
        .map_err(Error::from_zbus)?;
        decode_body(&reply)
    }

    async fn subscribe(&self, iface: &ZbusInterface, signal: &str, callback: SignalCallback) -> Result<SubscriptionId> {
        let mut stream = iface.proxy.receive_signal(signal.to_owned()).await.map_err(Error::from_zbus)?;
        let path = iface.proxy.path().to_string();
        let signal = signal.to_owned();

        let task = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match decode_body(&msg) {
                    Ok(args) => callback(args).await,
                    Err(err) => log::warn!("Couldn't decode signal {} of {}: {:?}", signal, path, err),
                }
            }
            log::debug!("signal stream {} of {} ended", signal, path);
        });

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        iface.tasks.lock().unwrap_or_else(PoisonError::into_inner).insert(id, task.abort_handle());
        Ok(id)
    }

    fn unsubscribe(&self, iface: &ZbusInterface, _signal: &str, id: SubscriptionId) {
        if let Some(task) = iface.tasks.lock().unwrap_or_else(PoisonError::into_inner).remove(&id) {
            task.abort();
        }
    }
}
