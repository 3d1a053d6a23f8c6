use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak,
    },
};

use futures::future::{self, BoxFuture, FutureExt};
use zbus::zvariant::Value;

use crate::{
    Error, FieldDefinition, OrderedMap, PropValue, PropertyMap, Result, SignalCallback, SubscriptionId, Track, Transport,
    PROPERTIES_CHANGED, PROPERTIES_INTERFACE,
};

#[cfg(test)]
mod test;

/// The mirrored value of one tracked property.
pub enum Field<T: Transport> {
    Value(PropValue),
    /// A single child reference. `None` if the referenced object doesn't implement the interface.
    Child(Option<Arc<ObjectNode<T>>>),
    /// Children keyed by object path, in the order the remote last reported them.
    Children(OrderedMap<String, Arc<ObjectNode<T>>>),
}

impl<T: Transport> Clone for Field<T> {
    fn clone(&self) -> Self {
        match self {
            Field::Value(value) => Field::Value(value.clone()),
            Field::Child(child) => Field::Child(child.clone()),
            Field::Children(members) => Field::Children(members.clone()),
        }
    }
}

impl<T: Transport> Field<T> {
    fn into_nodes(self) -> Vec<Arc<ObjectNode<T>>> {
        match self {
            Field::Value(_) | Field::Child(None) => Vec::new(),
            Field::Child(Some(child)) => vec![child],
            Field::Children(mut members) => members.drain(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A child that couldn't be created for a reason other than a missing interface. It is left out
/// of its parent, which keeps everything else.
#[derive(Debug)]
pub struct BranchFailure {
    pub key: String,
    pub path: String,
    pub error: Error,
}

type Listener<T> = Arc<dyn Fn(&ObjectNode<T>) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
enum Target {
    Properties,
    Interface,
}

struct Armed {
    target: Target,
    signal: String,
    id: SubscriptionId,
}

/// Live mirror of one remote object.
///
/// A node tracks the properties its [`FieldDefinition`] declares. Properties that reference other
/// objects are mirrored recursively as child nodes, which are created and destroyed as the remote
/// references change. Every change is announced to the node's listeners and then to each ancestor.
pub struct ObjectNode<T: Transport> {
    transport: Arc<T>,
    service: String,
    path: String,
    definition: Arc<FieldDefinition<T>>,
    parent: Option<Weak<ObjectNode<T>>>,
    destroyed: AtomicBool,

    properties: OnceLock<T::Interface>,
    iface: OnceLock<T::Interface>,

    // None of these std mutexes are ever held across an await.
    state: Mutex<HashMap<String, Field<T>>>,
    subscriptions: Mutex<Vec<Armed>>,
    listeners: Mutex<Vec<(ListenerId, Listener<T>)>>,
    next_listener_id: AtomicU64,

    /// Serializes property parsing, so overlapping change signals apply one after another.
    parse_lock: tokio::sync::Mutex<()>,
}

impl<T: Transport> fmt::Debug for ObjectNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectNode")
            .field("service", &self.service)
            .field("interface", &self.definition.interface)
            .field("path", &self.path)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl<T: Transport> ObjectNode<T> {
    /// Create a node and sync it with the remote object.
    ///
    /// Resolves the interfaces of `path`, fetches and parses all properties (creating child nodes
    /// as needed), runs the definition's init hook, and finally subscribes to property changes
    /// and the definition's extra signals. Fails if any of that fails for this node itself.
    /// Children that fail are left out, see [`ObjectNode::parse_properties`].
    pub async fn create(
        transport: Arc<T>,
        service: impl Into<String>,
        path: impl Into<String>,
        definition: Arc<FieldDefinition<T>>,
        parent: Option<&Arc<ObjectNode<T>>>,
    ) -> Result<Arc<Self>> {
        let node = Self::new(transport, service.into(), path.into(), definition, parent);
        match node.init().await {
            Ok(()) => Ok(node),
            Err(err) => {
                node.destroy();
                Err(err)
            }
        }
    }

    /// A node that isn't synced yet. Nothing is resolved or subscribed.
    fn new(
        transport: Arc<T>,
        service: String,
        path: String,
        definition: Arc<FieldDefinition<T>>,
        parent: Option<&Arc<ObjectNode<T>>>,
    ) -> Arc<Self> {
        Arc::new(ObjectNode {
            transport,
            service,
            path,
            definition,
            parent: parent.map(Arc::downgrade),
            destroyed: AtomicBool::new(false),
            properties: OnceLock::new(),
            iface: OnceLock::new(),
            state: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
            parse_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Like [`ObjectNode::create`], but yields `None` if the object doesn't implement the
    /// definition's interface. Other errors are logged and returned.
    pub fn try_create(
        transport: Arc<T>,
        service: String,
        path: String,
        definition: Arc<FieldDefinition<T>>,
        parent: Option<Arc<ObjectNode<T>>>,
    ) -> BoxFuture<'static, Result<Option<Arc<Self>>>> {
        async move {
            match Self::create(transport, service.as_str(), path.as_str(), definition.clone(), parent.as_ref()).await {
                Ok(node) => Ok(Some(node)),
                Err(err) if err.is_interface_absent(&definition.interface, &path) => {
                    log::debug!("{} does not implement {}", path, definition.interface);
                    Ok(None)
                }
                Err(err) => {
                    log::warn!("Couldn't get interface {} of {} on {}: {:?}", definition.interface, path, service, err);
                    Err(err)
                }
            }
        }
        .boxed()
    }

    async fn init(self: &Arc<Self>) -> Result<()> {
        let properties = self.transport.resolve_interface(&self.service, &self.path, PROPERTIES_INTERFACE).await?;
        let properties = self.properties.get_or_init(|| properties);
        let iface = self.transport.resolve_interface(&self.service, &self.path, self.interface()).await?;
        self.iface.get_or_init(|| iface);

        let snapshot = self.transport.get_all_properties(properties, self.interface()).await?;
        let failures = self.parse_properties(snapshot).await;
        if !failures.is_empty() {
            log::debug!("{} synced without {} failed children", self.path, failures.len());
        }

        if let Some(init) = &self.definition.extra_init {
            init(self.clone()).await?;
        }
        self.arm().await
    }

    /// Subscribe to property changes and extra signals, unless the node got destroyed meanwhile.
    async fn arm(self: &Arc<Self>) -> Result<()> {
        let (Some(properties), Some(iface)) = (self.properties.get(), self.iface.get()) else {
            return Ok(());
        };
        if self.is_destroyed() {
            return Ok(());
        }

        let weak = Arc::downgrade(self);
        let on_changed: SignalCallback = Arc::new(move |args| {
            let weak = weak.clone();
            async move {
                if let Some(node) = weak.upgrade() {
                    node.handle_properties_changed(args).await;
                }
            }
            .boxed()
        });
        let id = self.transport.subscribe(properties, PROPERTIES_CHANGED, on_changed).await?;
        self.keep_subscription(Armed { target: Target::Properties, signal: PROPERTIES_CHANGED.to_owned(), id });

        for (signal, handler) in &self.definition.extra_listeners {
            let weak = Arc::downgrade(self);
            let handler = handler.clone();
            let name = signal.clone();
            let callback: SignalCallback = Arc::new(move |args| {
                let weak = weak.clone();
                let handler = handler.clone();
                let name = name.clone();
                async move {
                    let Some(node) = weak.upgrade() else { return };
                    if node.is_destroyed() {
                        return;
                    }
                    let path = node.path.clone();
                    if let Err(err) = handler(node, args).await {
                        log::error!("Error while handling signal {} of {}: {:?}", name, path, err);
                    }
                }
                .boxed()
            });
            let id = self.transport.subscribe(iface, signal, callback).await?;
            self.keep_subscription(Armed { target: Target::Interface, signal: signal.clone(), id });
        }
        Ok(())
    }

    fn keep_subscription(&self, armed: Armed) {
        let mut subscriptions = lock(&self.subscriptions);
        if self.is_destroyed() {
            // destroyed while subscribing, so destroy() has already released everything else
            drop(subscriptions);
            self.release(&armed);
        } else {
            subscriptions.push(armed);
        }
    }

    fn release(&self, armed: &Armed) {
        let iface = match armed.target {
            Target::Properties => self.properties.get(),
            Target::Interface => self.iface.get(),
        };
        if let Some(iface) = iface {
            log::debug!("unsubscribing from {} of {}", armed.signal, self.path);
            self.transport.unsubscribe(iface, &armed.signal, armed.id);
        }
    }

    async fn handle_properties_changed(self: &Arc<Self>, args: Vec<PropValue>) {
        let mut args = args.into_iter();
        let (Some(PropValue::Str(interface)), Some(PropValue::Dict(changes))) = (args.next(), args.next()) else {
            log::warn!("Received malformed {} signal for {}", PROPERTIES_CHANGED, self.path);
            return;
        };
        // the signal covers every interface of the object
        if interface != self.interface() {
            return;
        }
        // failed children are already logged by try_create
        self.parse_properties(changes.into_iter().collect()).await;
    }

    /// Merge a property snapshot into the node's state.
    ///
    /// Properties not declared in the subtree are ignored. Child references are diffed against the
    /// current children: children that are no longer referenced are destroyed before new ones are
    /// created. If any declared property was present, listeners are notified once afterwards.
    ///
    /// A child that fails to be created is left out and reported in the returned list. Its
    /// siblings and the rest of the snapshot are applied regardless.
    pub async fn parse_properties(self: &Arc<Self>, properties: PropertyMap) -> Vec<BranchFailure> {
        let _parsing = self.parse_lock.lock().await;
        if self.is_destroyed() {
            return Vec::new();
        }

        let mut touched = false;
        let mut failures = Vec::new();
        for (key, value) in properties {
            let Some(track) = self.definition.subtree.get(&key) else {
                continue;
            };
            match (track, value) {
                (Track::Scalar, value) => self.put(key, Field::Value(value)),
                (Track::Object(definition), PropValue::Path(path)) => {
                    failures.extend(self.apply_reference(key, path, definition.clone()).await)
                }
                (Track::Object(definition), PropValue::PathList(paths)) => {
                    failures.extend(self.apply_collection(key, paths, definition.clone()).await)
                }
                (Track::Object(_), other) => {
                    log::warn!("Expected object path(s) for {} of {}, got {:?}", key, self.path, other);
                    continue;
                }
            }
            touched = true;
        }

        if touched && !self.is_destroyed() {
            self.properties_changed();
        }
        failures
    }

    async fn apply_reference(
        self: &Arc<Self>,
        key: String,
        path: String,
        definition: Arc<FieldDefinition<T>>,
    ) -> Option<BranchFailure> {
        let current = lock(&self.state).get(&key).cloned();
        let stale = match current {
            Some(Field::Child(Some(child))) if child.path == path => return None,
            Some(field) => field.into_nodes(),
            None => Vec::new(),
        };
        for node in stale {
            node.destroy();
        }
        self.put(key.clone(), Field::Child(None));

        match self.create_child(path.clone(), definition).await {
            Ok(child) => {
                self.put(key, Field::Child(child));
                None
            }
            Err(error) => Some(BranchFailure { key, path, error }),
        }
    }

    async fn apply_collection(
        self: &Arc<Self>,
        key: String,
        paths: Vec<String>,
        definition: Arc<FieldDefinition<T>>,
    ) -> Vec<BranchFailure> {
        let (removed, added) = {
            let mut state = lock(&self.state);
            if self.is_destroyed() {
                return Vec::new();
            }
            let (mut members, mut removed) = match state.remove(&key) {
                Some(Field::Children(members)) => (members, Vec::new()),
                Some(other) => (OrderedMap::new(), other.into_nodes()),
                None => (OrderedMap::new(), Vec::new()),
            };
            let wanted: HashSet<&String> = paths.iter().collect();
            let gone: Vec<String> = members.keys().filter(|path| !wanted.contains(path)).cloned().collect();
            removed.extend(gone.iter().filter_map(|path| members.remove(path)));

            let mut seen = HashSet::new();
            let added: Vec<String> =
                paths.iter().filter(|path| !members.contains_key(*path) && seen.insert(*path)).cloned().collect();
            state.insert(key.clone(), Field::Children(members));
            (removed, added)
        };
        for node in removed {
            node.destroy();
        }

        let created = future::join_all(added.into_iter().map(|path| {
            let definition = definition.clone();
            async move { (path.clone(), self.create_child(path, definition).await) }
        }))
        .await;

        let mut failures = Vec::new();
        let mut fresh = Vec::new();
        for (path, result) in created {
            match result {
                Ok(Some(child)) => fresh.push((path, child)),
                Ok(None) => {}
                Err(error) => failures.push(BranchFailure { key: key.clone(), path, error }),
            }
        }

        let mut stale = Vec::new();
        {
            let mut state = lock(&self.state);
            if self.is_destroyed() {
                stale.extend(fresh.into_iter().map(|(_, child)| child));
            } else {
                let mut members = match state.remove(&key) {
                    Some(Field::Children(members)) => members,
                    Some(other) => {
                        stale.extend(other.into_nodes());
                        OrderedMap::new()
                    }
                    None => OrderedMap::new(),
                };
                for (path, child) in fresh {
                    stale.extend(members.insert(path, child));
                }
                members.set_order(&paths);
                state.insert(key, Field::Children(members));
            }
        }
        for node in stale {
            node.destroy();
        }
        failures
    }

    /// Create a child of this node, discarding it again if this node got destroyed meanwhile.
    async fn create_child(self: &Arc<Self>, path: String, definition: Arc<FieldDefinition<T>>) -> Result<Option<Arc<Self>>> {
        let child =
            Self::try_create(self.transport.clone(), self.service.clone(), path, definition, Some(self.clone())).await?;
        match child {
            Some(child) if self.is_destroyed() => {
                child.destroy();
                Ok(None)
            }
            child => Ok(child),
        }
    }

    /// Store a field, unless the node is destroyed, in which case nodes in the field are destroyed.
    fn put(&self, key: String, field: Field<T>) {
        let rejected = {
            let mut state = lock(&self.state);
            if self.is_destroyed() {
                Some(field)
            } else {
                state.insert(key, field);
                None
            }
        };
        for node in rejected.into_iter().flat_map(Field::into_nodes) {
            node.destroy();
        }
    }

    /// Store values that don't come from remote properties, e.g. results of method calls made by an
    /// init hook. Each key must be declared as a scalar in the subtree. Listeners are notified once.
    pub fn store_local(&self, entries: impl IntoIterator<Item = (String, PropValue)>) -> Result<()> {
        let entries: Vec<_> = entries.into_iter().collect();
        if let Some((key, _)) = entries.iter().find(|(key, _)| !self.definition.subtree.is_scalar(key)) {
            return Err(Error::UndeclaredField(key.clone()));
        }
        if entries.is_empty() || self.is_destroyed() {
            return Ok(());
        }
        for (key, value) in entries {
            self.put(key, Field::Value(value));
        }
        self.properties_changed();
        Ok(())
    }

    fn properties_changed(&self) {
        let listeners: Vec<Listener<T>> = lock(&self.listeners).iter().map(|(_, listener)| listener.clone()).collect();
        for listener in listeners {
            listener(self);
        }
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.properties_changed();
        }
    }

    /// Register a listener that is called whenever this node or any of its descendants changed.
    pub fn on_properties_changed(&self, listener: impl Fn(&ObjectNode<T>) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(other, _)| *other != id);
        listeners.len() != before
    }

    /// Tear the node down: destroy all children, drop every remote subscription and local
    /// listener. Calling this again has no effect.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("destroying {} ({})", self.path, self.interface());

        let fields = std::mem::take(&mut *lock(&self.state));
        for child in fields.into_values().flat_map(Field::into_nodes) {
            child.destroy();
        }
        let armed = std::mem::take(&mut *lock(&self.subscriptions));
        for armed in &armed {
            self.release(armed);
        }
        lock(&self.listeners).clear();
    }

    /// Plain snapshot of the mirrored state, with children replaced by their own snapshots.
    pub fn dump(&self) -> serde_json::Value {
        let mut result = serde_json::Map::new();
        for (key, field) in lock(&self.state).iter() {
            let value = match field {
                Field::Value(value) => serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
                Field::Child(child) => child.as_ref().map_or(serde_json::Value::Null, |child| child.dump()),
                Field::Children(members) => serde_json::Value::Array(members.values().map(|child| child.dump()).collect()),
            };
            result.insert(key.clone(), value);
        }
        result.insert("path".to_owned(), serde_json::Value::String(self.path.clone()));
        serde_json::Value::Object(result)
    }

    /// Write a property of the tracked interface on the remote object. The local state only
    /// changes once the remote announces the change. Does nothing if the node never got live.
    pub async fn set_property(&self, name: &str, value: Value<'static>) -> Result<()> {
        let Some(properties) = self.properties.get() else {
            return Ok(());
        };
        self.transport.set_property(properties, self.interface(), name, value).await
    }

    /// Call a method of the tracked interface.
    pub async fn call_method(&self, method: &str, args: Vec<Value<'static>>) -> Result<Vec<PropValue>> {
        let iface = self
            .iface
            .get()
            .ok_or_else(|| Error::Unresolved { interface: self.interface().to_owned(), path: self.path.clone() })?;
        self.transport.call_method(iface, method, args).await
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn interface(&self) -> &str {
        &self.definition.interface
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Not destroyed, and the tracked interface is resolved.
    pub fn is_live(&self) -> bool {
        !self.is_destroyed() && self.iface.get().is_some()
    }

    pub fn field(&self, key: &str) -> Option<Field<T>> {
        lock(&self.state).get(key).cloned()
    }

    pub fn value(&self, key: &str) -> Option<PropValue> {
        match lock(&self.state).get(key) {
            Some(Field::Value(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn child(&self, key: &str) -> Option<Arc<ObjectNode<T>>> {
        match lock(&self.state).get(key) {
            Some(Field::Child(child)) => child.clone(),
            _ => None,
        }
    }

    /// Children of a collection field, in order.
    pub fn children(&self, key: &str) -> Vec<Arc<ObjectNode<T>>> {
        match lock(&self.state).get(key) {
            Some(Field::Children(members)) => members.values().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// The child at `path` within a collection field.
    pub fn member(&self, key: &str, path: &str) -> Option<Arc<ObjectNode<T>>> {
        match lock(&self.state).get(key) {
            Some(Field::Children(members)) => members.get(&path.to_owned()).cloned(),
            _ => None,
        }
    }
}

fn lock<X>(mutex: &Mutex<X>) -> MutexGuard<'_, X> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
