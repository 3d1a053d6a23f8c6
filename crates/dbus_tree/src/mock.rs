//! In-memory transport for tests, available to other crates with the `test-util` feature.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use tokio::sync::Semaphore;
use zbus::zvariant::Value;

use crate::{
    error::UNKNOWN_INTERFACE, Error, PropValue, PropertyMap, Result, SignalCallback, SubscriptionId, Transport,
    PROPERTIES_CHANGED, PROPERTIES_INTERFACE,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MockInterface {
    pub path: String,
    pub name: String,
}

struct Subscription {
    iface: MockInterface,
    signal: String,
    callback: SignalCallback,
}

#[derive(Default)]
struct Bus {
    /// path -> interface -> properties
    objects: HashMap<String, HashMap<String, PropertyMap>>,
    failing: HashMap<String, String>,
    gates: HashMap<String, Arc<Semaphore>>,
    waiting: HashMap<String, usize>,
    resolved: Vec<MockInterface>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    unsubscribed: Vec<SubscriptionId>,
    set_calls: Vec<(MockInterface, String, PropValue)>,
    method_calls: Vec<(MockInterface, String, Vec<PropValue>)>,
    method_replies: HashMap<(String, String), std::result::Result<Vec<PropValue>, String>>,
}

#[derive(Default)]
pub struct MockTransport {
    bus: Mutex<Bus>,
    next_id: AtomicU64,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn bus(&self) -> MutexGuard<'_, Bus> {
        self.bus.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put an object implementing `interface` with the given properties on the bus.
    pub fn add_object(&self, path: &str, interface: &str, properties: PropertyMap) {
        self.bus().objects.entry(path.to_owned()).or_default().insert(interface.to_owned(), properties);
    }

    /// Put an object on the bus that implements none of the interfaces we ask for.
    pub fn add_bare_object(&self, path: &str) {
        self.bus().objects.entry(path.to_owned()).or_default();
    }

    /// Make resolving anything at `path` fail with a generic error.
    pub fn fail_path(&self, path: &str, message: &str) {
        self.bus().failing.insert(path.to_owned(), message.to_owned());
    }

    /// Hold every resolution at `path` until [`MockTransport::open_gate`] is called.
    pub fn gate_path(&self, path: &str) {
        self.bus().gates.insert(path.to_owned(), Arc::new(Semaphore::new(0)));
    }

    pub fn open_gate(&self, path: &str) {
        if let Some(gate) = self.bus().gates.get(path) {
            gate.add_permits(1);
        }
    }

    /// Number of resolutions currently held at the gate of `path`.
    pub fn waiting_at(&self, path: &str) -> usize {
        self.bus().waiting.get(path).copied().unwrap_or(0)
    }

    /// Answer every call of `method` on the object at `path` with `reply`. An `Err` becomes a
    /// `org.freedesktop.DBus.Error.Failed` with that message. Unanswered calls reply with nothing.
    pub fn reply(&self, method: &str, path: &str, reply: std::result::Result<Vec<PropValue>, &str>) {
        self.bus().method_replies.insert((path.to_owned(), method.to_owned()), reply.map_err(str::to_owned));
    }

    /// How often `interface` was resolved at `path`, i.e. how many nodes were created for it.
    pub fn resolutions(&self, path: &str, interface: &str) -> usize {
        self.bus().resolved.iter().filter(|iface| iface.path == path && iface.name == interface).count()
    }

    /// Live subscriptions on objects at `path`.
    pub fn subscriptions_at(&self, path: &str) -> usize {
        self.bus().subscriptions.values().filter(|sub| sub.iface.path == path).count()
    }

    pub fn total_subscriptions(&self) -> usize {
        self.bus().subscriptions.len()
    }

    pub fn unsubscribed(&self) -> Vec<SubscriptionId> {
        self.bus().unsubscribed.clone()
    }

    pub fn set_calls(&self) -> Vec<(MockInterface, String, PropValue)> {
        self.bus().set_calls.clone()
    }

    /// Every method call so far, with its decoded arguments.
    pub fn method_calls(&self) -> Vec<(MockInterface, String, Vec<PropValue>)> {
        self.bus().method_calls.clone()
    }

    /// The calls of `method` so far, regardless of the object.
    pub fn calls_of(&self, method: &str) -> Vec<(MockInterface, Vec<PropValue>)> {
        self.bus()
            .method_calls
            .iter()
            .filter(|(_, name, _)| name == method)
            .map(|(iface, _, args)| (iface.clone(), args.clone()))
            .collect()
    }

    /// Deliver a signal to every subscriber of it, one after another.
    pub async fn emit(&self, path: &str, interface: &str, signal: &str, args: Vec<PropValue>) {
        let callbacks: Vec<SignalCallback> = self
            .bus()
            .subscriptions
            .values()
            .filter(|sub| sub.iface.path == path && sub.iface.name == interface && sub.signal == signal)
            .map(|sub| sub.callback.clone())
            .collect();
        for callback in callbacks {
            callback(args.clone()).await;
        }
    }

    pub async fn emit_properties_changed(&self, path: &str, interface: &str, changes: PropertyMap) {
        let args = vec![
            PropValue::Str(interface.to_owned()),
            PropValue::Dict(changes.into_iter().collect()),
            PropValue::List(Vec::new()),
        ];
        self.emit(path, PROPERTIES_INTERFACE, PROPERTIES_CHANGED, args).await;
    }
}

impl Transport for MockTransport {
    type Interface = MockInterface;

    async fn resolve_interface(&self, _service: &str, path: &str, interface: &str) -> Result<MockInterface> {
        let gate = {
            let mut bus = self.bus();
            let gate = bus.gates.get(path).cloned();
            if gate.is_some() {
                *bus.waiting.entry(path.to_owned()).or_default() += 1;
            }
            gate
        };
        if let Some(gate) = gate {
            // the permit goes back on drop, so an opened gate stays open
            let _permit = gate.acquire().await;
            *self.bus().waiting.entry(path.to_owned()).or_default() -= 1;
        }

        let mut bus = self.bus();
        if let Some(message) = bus.failing.get(path) {
            return Err(Error::Method { name: "org.freedesktop.DBus.Error.Failed".to_owned(), message: message.clone() });
        }
        let Some(object) = bus.objects.get(path) else {
            return Err(Error::Method {
                name: "org.freedesktop.DBus.Error.UnknownObject".to_owned(),
                message: format!("No such object path '{}'", path),
            });
        };
        if interface != PROPERTIES_INTERFACE && !object.contains_key(interface) {
            return Err(Error::Method {
                name: UNKNOWN_INTERFACE.to_owned(),
                message: format!("No such interface “{}” on object at path {}", interface, path),
            });
        }
        let iface = MockInterface { path: path.to_owned(), name: interface.to_owned() };
        bus.resolved.push(iface.clone());
        Ok(iface)
    }

    async fn get_all_properties(&self, properties: &MockInterface, interface: &str) -> Result<PropertyMap> {
        let bus = self.bus();
        bus.objects.get(&properties.path).and_then(|object| object.get(interface)).cloned().ok_or_else(|| Error::Method {
            name: UNKNOWN_INTERFACE.to_owned(),
            message: format!("No such interface “{}”", interface),
        })
    }

    async fn set_property(&self, properties: &MockInterface, interface: &str, name: &str, value: Value<'static>) -> Result<()> {
        let target = MockInterface { path: properties.path.clone(), name: interface.to_owned() };
        self.bus().set_calls.push((target, name.to_owned(), PropValue::from_variant(&value)));
        Ok(())
    }

    async fn call_method(&self, iface: &MockInterface, method: &str, args: Vec<Value<'static>>) -> Result<Vec<PropValue>> {
        let mut bus = self.bus();
        bus.method_calls.push((iface.clone(), method.to_owned(), args.iter().map(PropValue::from_variant).collect()));
        match bus.method_replies.get(&(iface.path.clone(), method.to_owned())) {
            Some(Ok(reply)) => Ok(reply.clone()),
            Some(Err(message)) => {
                Err(Error::Method { name: "org.freedesktop.DBus.Error.Failed".to_owned(), message: message.clone() })
            }
            None => Ok(Vec::new()),
        }
    }

    async fn subscribe(&self, iface: &MockInterface, signal: &str, callback: SignalCallback) -> Result<SubscriptionId> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.bus().subscriptions.insert(id, Subscription { iface: iface.clone(), signal: signal.to_owned(), callback });
        Ok(id)
    }

    fn unsubscribe(&self, _iface: &MockInterface, _signal: &str, id: SubscriptionId) {
        let mut bus = self.bus();
        bus.subscriptions.remove(&id);
        bus.unsubscribed.push(id);
    }
}
