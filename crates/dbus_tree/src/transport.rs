//! The seam between the object tree and the bus it mirrors.

use std::{future::Future, sync::Arc};

use futures::future::BoxFuture;
use zbus::zvariant::Value;

use crate::{PropValue, PropertyMap, Result};

pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";

/// Identifies one signal subscription on an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Called with the decoded arguments of every received signal. The transport awaits the returned
/// future before delivering the next signal of the same subscription.
pub type SignalCallback = Arc<dyn Fn(Vec<PropValue>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Access to remote objects on a message bus.
///
/// Implementations must allow many outstanding requests at once, since sibling nodes are created
/// concurrently.
pub trait Transport: Send + Sync + 'static {
    /// A resolved interface of one remote object.
    type Interface: Send + Sync + 'static;

    fn resolve_interface(
        &self,
        service: &str,
        path: &str,
        interface: &str,
    ) -> impl Future<Output = Result<Self::Interface>> + Send;

    fn get_all_properties(
        &self,
        properties: &Self::Interface,
        interface: &str,
    ) -> impl Future<Output = Result<PropertyMap>> + Send;

    fn set_property(
        &self,
        properties: &Self::Interface,
        interface: &str,
        name: &str,
        value: Value<'static>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn call_method(
        &self,
        iface: &Self::Interface,
        method: &str,
        args: Vec<Value<'static>>,
    ) -> impl Future<Output = Result<Vec<PropValue>>> + Send;

    fn subscribe(
        &self,
        iface: &Self::Interface,
        signal: &str,
        callback: SignalCallback,
    ) -> impl Future<Output = Result<SubscriptionId>> + Send;

    fn unsubscribe(&self, iface: &Self::Interface, signal: &str, id: SubscriptionId);
}
